//! Long polling wire format
//!
//! Clients list their configs as `dataId^2group^2md5[^2tenant]^1` records,
//! where `^1` and `^2` are the control characters 0x01 and 0x02. Changed
//! group keys go back as the same records without the md5, URL encoded.

use std::collections::HashMap;

use quince_common::{QuinceError, Result, group_key};

use super::disk::is_valid_identity;

pub const LISTENING_CONFIGS: &str = "Listening-Configs";
pub const LONG_POLLING_TIMEOUT_HEADER: &str = "Long-Pulling-Timeout";
pub const LONG_POLLING_NO_HANG_UP_HEADER: &str = "Long-Pulling-Timeout-No-Hangup";
pub const CLIENT_APP_NAME_HEADER: &str = "Client-AppName";
pub const VIPSERVER_TAG_HEADER: &str = "Vipserver-Tag";

pub const WORD_SEPARATOR: char = '\u{2}';
pub const LINE_SEPARATOR: char = '\u{1}';

/// Parse `Listening-Configs` into group key -> md5.
pub fn parse_listening_configs(configs: &str) -> Result<HashMap<String, String>> {
    let mut md5_map = HashMap::new();
    for line in configs.split(LINE_SEPARATOR).filter(|l| !l.is_empty()) {
        let words: Vec<&str> = line.split(WORD_SEPARATOR).collect();
        let (data_id, group, md5, tenant) = match words.as_slice() {
            [data_id, group, md5] => (*data_id, *group, *md5, ""),
            [data_id, group, md5, tenant] => (*data_id, *group, *md5, *tenant),
            _ => {
                return Err(QuinceError::IllegalArgument(format!(
                    "invalid listening config record: {:?}",
                    line
                )));
            }
        };
        if !is_valid_identity(data_id, group, tenant) {
            return Err(QuinceError::IllegalArgument(format!(
                "listening config record with invalid identity: {:?}",
                line
            )));
        }
        md5_map.insert(group_key::get_key(data_id, group, tenant), md5.to_string());
    }
    Ok(md5_map)
}

/// Response body for the changed group keys; empty when nothing changed.
pub fn encode_changed_groups(changed: &[String]) -> String {
    let mut body = String::new();
    for key in changed {
        let Ok((data_id, group, tenant)) = group_key::parse_key(key) else {
            continue;
        };
        let mut record = String::new();
        record.push_str(&data_id);
        record.push(WORD_SEPARATOR);
        record.push_str(&group);
        if !tenant.is_empty() {
            record.push(WORD_SEPARATOR);
            record.push_str(&tenant);
        }
        record.push(LINE_SEPARATOR);
        body.extend(form_urlencoded::byte_serialize(record.as_bytes()));
    }
    body
}
