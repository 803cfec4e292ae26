//! Terminal descriptors published through the host directory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::identity::PublicKey;
use crate::schema::Schema;

/// Channel on which the host fans out every accepted `UpdateTerminalInfo`.
pub const TERMINAL_INFO_CHANNEL: &str = "TerminalInfo";

pub const METHOD_LIST_TERMINALS: &str = "ListTerminals";
pub const METHOD_UPDATE_TERMINAL_INFO: &str = "UpdateTerminalInfo";
pub const METHOD_TERMINATE: &str = "Terminate";
pub const METHOD_PING: &str = "Ping";
pub const METHOD_METRICS: &str = "Metrics";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_id: String,
    pub method: String,
    #[serde(default)]
    pub schema: Schema,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub terminal_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    /// Unix millis.
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub services: Vec<ServiceInfo>,
    #[serde(default)]
    pub channel_schemas: Vec<Schema>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TerminalInfo {
    pub fn new(terminal_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            name: name.into(),
            status: "INIT".into(),
            ..Default::default()
        }
    }

    /// Services this terminal advertises under `method`.
    pub fn services_for<'a>(&'a self, method: &'a str) -> impl Iterator<Item = &'a ServiceInfo> {
        self.services.iter().filter(move |s| s.method == method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sparse_descriptor_parses() {
        let info: TerminalInfo = serde_json::from_value(json!({"terminal_id": "T1"})).unwrap();
        assert_eq!(info.terminal_id, "T1");
        assert!(info.services.is_empty());
    }

    #[test]
    fn services_carry_json_schema() {
        let mut info = TerminalInfo::new("T1", "echo");
        info.services.push(ServiceInfo {
            service_id: "Echo".into(),
            method: "Echo".into(),
            schema: Schema::from_json(&json!({"required": ["x"]})).unwrap(),
        });
        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["services"][0]["schema"], json!({"required": ["x"]}));
        let back: TerminalInfo = serde_json::from_value(v).unwrap();
        assert_eq!(back.services_for("Echo").count(), 1);
        assert_eq!(back.services_for("Ping").count(), 0);
    }
}
