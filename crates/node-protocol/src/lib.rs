//! Broker message types shared by client nodes and broker implementations.
//!
//! These are plain data: the SDK never assumes a particular wire encoding.
//! Protocol implementations decide how (and whether) to serialize them,
//! JSON via serde being the common case.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version of the message set in this crate.
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known service topic for fetching the broker's configuration.
pub const DEFAULT_SERVER_CONFIG_TOPIC: &str = "/services/server_configuration";

// ── Client ───────────────────────────────────────────────────────────

/// Lifecycle status of a client node as seen by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    #[default]
    Unavailable,
    Active,
    Inactive,
}

/// The mutable description of one client node.
///
/// `id` stays empty until the broker assigns one during registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: ClientStatus,
    #[serde(default)]
    pub is_dedicated_processing_node: bool,
    /// Names of processing modules this node can run.
    #[serde(default)]
    pub processing_modules: Vec<String>,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// A device (group of topics) owned by a client node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Device {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

// ── Broker description ───────────────────────────────────────────────

/// Broker ("master node") configuration as reported by the server config call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerDescription {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Endpoint for request/response service calls.
    #[serde(default)]
    pub service_url: String,
    /// Endpoint for the streamed topic data connection.
    #[serde(default)]
    pub topic_data_url: String,
}

/// Catalog of default topics and data types advertised by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Constants {
    /// Logical service name → service topic (e.g. `"client_registration"`).
    #[serde(default)]
    pub default_topics: BTreeMap<String, String>,
    /// Data type names the broker knows how to route.
    #[serde(default)]
    pub msg_types: Vec<String>,
}

impl Constants {
    /// Look up a service topic by its logical name.
    pub fn service_topic(&self, name: &str) -> Option<&str> {
        self.default_topics.get(name).map(String::as_str)
    }
}

// ── Topic data ───────────────────────────────────────────────────────

/// One record published on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicDataRecord {
    pub topic: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TopicDataRecord {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            timestamp: Utc::now(),
            client_id: String::new(),
            payload,
        }
    }
}

/// A frame on the data connection: a single record, a batch, or an error
/// reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopicData {
    Record { record: TopicDataRecord },
    RecordList { records: Vec<TopicDataRecord> },
    Error { title: String, message: String },
}

impl TopicData {
    /// Wrap records the way a publisher sends them: one record stays a
    /// `Record`, several become a `RecordList`.
    pub fn from_records(mut records: Vec<TopicDataRecord>) -> Self {
        if records.len() == 1 {
            if let Some(record) = records.pop() {
                return TopicData::Record { record };
            }
        }
        TopicData::RecordList { records }
    }

    /// Flatten into the contained records (errors carry none).
    pub fn into_records(self) -> Vec<TopicDataRecord> {
        match self {
            TopicData::Record { record } => vec![record],
            TopicData::RecordList { records } => records,
            TopicData::Error { .. } => Vec::new(),
        }
    }
}

// ── Sessions & processing modules ────────────────────────────────────

/// A session: a set of processing modules wired to topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Session {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub processing_modules: Vec<ProcessingModule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionList {
    #[serde(default)]
    pub elements: Vec<Session>,
}

/// Status of a processing module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleStatus {
    #[default]
    Created,
    Initialized,
    Processing,
    Halted,
    Destroyed,
}

/// Description of a processing module (a named unit of processing run by
/// a node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessingModule {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub status: ModuleStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_screaming_case() {
        let json = serde_json::to_string(&ClientStatus::Unavailable).unwrap();
        assert_eq!(json, "\"UNAVAILABLE\"");
    }

    #[test]
    fn single_record_is_not_wrapped_in_list() {
        let data = TopicData::from_records(vec![TopicDataRecord::new("/a", serde_json::json!(1))]);
        assert!(matches!(data, TopicData::Record { .. }));

        let data = TopicData::from_records(vec![
            TopicDataRecord::new("/a", serde_json::json!(1)),
            TopicDataRecord::new("/b", serde_json::json!(2)),
        ]);
        assert_eq!(data.into_records().len(), 2);
    }

    #[test]
    fn topic_data_is_tagged() {
        let data = TopicData::Error {
            title: "nope".into(),
            message: "bad topic".into(),
        };
        let v = serde_json::to_value(&data).unwrap();
        assert_eq!(v["type"], "error");
    }

    #[test]
    fn client_spec_fields_default() {
        let spec: ClientSpec = serde_json::from_str(r#"{"name": "n"}"#).unwrap();
        assert!(spec.id.is_empty());
        assert_eq!(spec.status, ClientStatus::Unavailable);
    }
}
