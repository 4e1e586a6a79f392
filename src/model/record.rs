use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Shared state published by the creating worker under a coordination key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    /// The published resource, typically a `BranchDescriptor`
    #[serde(rename = "branch", default)]
    pub value: Option<serde_json::Value>,
    /// Set only after the resource was fully created
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
}

impl CoordinationRecord {
    pub fn ready(value: serde_json::Value, created_by: &str) -> Self {
        Self {
            value: Some(value),
            ready: true,
            error: None,
            created_by: created_by.to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>, created_by: &str) -> Self {
        Self {
            value: None,
            ready: false,
            error: Some(message.into()),
            created_by: created_by.to_string(),
            updated_at: Utc::now(),
        }
    }

    /// Decode the published value, `None` until the record is ready
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match (&self.value, self.ready) {
            (Some(value), true) => serde_json::from_value(value.clone()).map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ready_record_decodes() {
        let record = CoordinationRecord::ready(json!({"branch_id": "br-1"}), "gw0");
        let text = serde_json::to_string(&record).unwrap();
        assert!(text.contains("\"branch\""));
        assert!(!text.contains("\"error\""));

        let restored: CoordinationRecord = serde_json::from_str(&text).unwrap();
        let value: Option<serde_json::Value> = restored.decode().unwrap();
        assert_eq!(value.unwrap()["branch_id"], "br-1");
    }

    #[test]
    fn test_failed_record_has_no_value() {
        let record = CoordinationRecord::failed("quota exceeded", "gw0");
        assert!(!record.ready);
        let value: Option<serde_json::Value> = record.decode().unwrap();
        assert!(value.is_none());
        assert_eq!(record.error.as_deref(), Some("quota exceeded"));
    }
}
