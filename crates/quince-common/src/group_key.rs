//! Group key encoding
//!
//! A group key names one configuration item as `dataId+group[+tenant]`.
//! `%` and `+` inside a part are escaped as `%25` and `%2B` so the key can
//! always be split back into its parts.

use crate::error::{QuinceError, Result};

/// Build the group key for a configuration item; the tenant is omitted when empty.
pub fn get_key(data_id: &str, group: &str, tenant: &str) -> String {
    let mut key = String::with_capacity(data_id.len() + group.len() + tenant.len() + 2);
    escape_part(data_id, &mut key);
    key.push('+');
    escape_part(group, &mut key);
    if !tenant.is_empty() {
        key.push('+');
        escape_part(tenant, &mut key);
    }
    key
}

/// Split a group key back into `(data_id, group, tenant)`.
pub fn parse_key(group_key: &str) -> Result<(String, String, String)> {
    let parts: Vec<&str> = group_key.split('+').collect();
    let (data_id, group, tenant) = match parts.as_slice() {
        [data_id, group] => (*data_id, *group, ""),
        [data_id, group, tenant] => (*data_id, *group, *tenant),
        _ => {
            return Err(QuinceError::IllegalArgument(format!(
                "invalid group key: {}",
                group_key
            )));
        }
    };

    if data_id.is_empty() || group.is_empty() {
        return Err(QuinceError::IllegalArgument(format!(
            "invalid group key: {}",
            group_key
        )));
    }

    Ok((unescape_part(data_id)?, unescape_part(group)?, unescape_part(tenant)?))
}

fn escape_part(part: &str, out: &mut String) {
    for c in part.chars() {
        match c {
            '+' => out.push_str("%2B"),
            '%' => out.push_str("%25"),
            _ => out.push(c),
        }
    }
}

fn unescape_part(part: &str) -> Result<String> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let escaped = rest.get(idx..idx + 3);
        match escaped {
            Some("%2B") => out.push('+'),
            Some("%25") => out.push('%'),
            _ => {
                return Err(QuinceError::IllegalArgument(format!(
                    "invalid escape in group key part: {}",
                    part
                )));
            }
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Ok(out)
}
