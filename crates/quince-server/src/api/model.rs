//! Request parameters of the config API

use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigGetParam {
    #[serde(default)]
    pub data_id: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub tenant: String,
    pub tag: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPublishParam {
    #[serde(default)]
    pub data_id: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default)]
    pub content: String,
    pub r#type: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub encrypted_data_key: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDeleteParam {
    #[serde(default)]
    pub data_id: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub tenant: String,
    /// Remove only this tag variant
    pub tag: Option<String>,
    /// Remove only the beta variant
    #[serde(default)]
    pub beta: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListenerParam {
    #[serde(rename = "Listening-Configs", default)]
    pub listening_configs: String,
}

/// Admin query for pending long polls, by config or by client ip
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStateParam {
    pub data_id: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub tenant: String,
    pub ip: Option<String>,
}

impl ConfigGetParam {
    /// The tag to match gray variants against, empty counts as none
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref().filter(|t| !t.is_empty())
    }
}
