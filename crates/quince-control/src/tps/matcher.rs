//! Monitor key pattern matching
//!
//! Patterns have the form `type:glob`. The glob decides the match kind:
//! no `*` is exact, a trailing `*` is prefix, a leading `*` is postfix, and
//! anything else (`*` alone, `*` in the middle, several `*`) is fuzzy.

use super::model::MonitorKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternKind {
    Exact(String),
    Prefix(String),
    Postfix(String),
    Fuzzy(String),
}

impl PatternKind {
    fn parse(glob: &str) -> Self {
        let stars = glob.matches('*').count();
        if stars == 0 {
            return PatternKind::Exact(glob.to_string());
        }
        if stars == 1 && glob.len() > 1 {
            if let Some(prefix) = glob.strip_suffix('*') {
                return PatternKind::Prefix(prefix.to_string());
            }
            if let Some(postfix) = glob.strip_prefix('*') {
                return PatternKind::Postfix(postfix.to_string());
            }
        }
        PatternKind::Fuzzy(glob.to_string())
    }

    /// Lower is more specific
    pub fn specificity(&self) -> u8 {
        match self {
            PatternKind::Exact(_) => 0,
            PatternKind::Prefix(_) | PatternKind::Postfix(_) => 1,
            PatternKind::Fuzzy(_) => 2,
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            PatternKind::Exact(v) => v == value,
            PatternKind::Prefix(p) => value.starts_with(p.as_str()),
            PatternKind::Postfix(p) => value.ends_with(p.as_str()),
            PatternKind::Fuzzy(glob) => glob_match(glob, value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorKeyMatcher {
    key_type: String,
    kind: PatternKind,
}

impl MonitorKeyMatcher {
    /// Parse a `type:glob` pattern. Returns `None` if there is no type part.
    pub fn parse(pattern: &str) -> Option<Self> {
        let (key_type, glob) = pattern.split_once(':')?;
        if key_type.is_empty() || glob.is_empty() {
            return None;
        }
        Some(Self {
            key_type: key_type.to_string(),
            kind: PatternKind::parse(glob),
        })
    }

    pub fn kind(&self) -> &PatternKind {
        &self.kind
    }

    pub fn specificity(&self) -> u8 {
        self.kind.specificity()
    }

    pub fn matches(&self, key: &MonitorKey) -> bool {
        self.key_type == key.key_type && self.kind.matches(&key.key)
    }
}

/// `*` matches any run of characters, everything else matches literally.
fn glob_match(glob: &str, value: &str) -> bool {
    let parts: Vec<&str> = glob.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return value.is_empty(),
    };
    let Some(mut remaining) = value.strip_prefix(first) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        match remaining.find(part) {
            Some(idx) => remaining = &remaining[idx + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}
