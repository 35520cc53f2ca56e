use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{parse_epoch_ms, ProductionData};

/// One reading held in a per-source queue.
///
/// `timestamp` is the producer's epoch-ms timestamp and doubles as the
/// deduplication key inside a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub source_id: String,
    pub timestamp: i64,
    pub payload: Value,
}

impl DataPoint {
    pub fn new(source_id: impl Into<String>, timestamp: i64, payload: Value) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            payload,
        }
    }

    /// Builds a point from a decoded reading.
    ///
    /// When the reading carries no timestamp of its own the envelope timestamp
    /// is used. Returns `None` if neither yields an epoch-ms value.
    pub fn from_production(data: &ProductionData, envelope_timestamp: &str) -> Option<Self> {
        let timestamp = data
            .timestamp
            .or_else(|| parse_epoch_ms(envelope_timestamp))?;
        Some(Self {
            source_id: data.source_id.clone(),
            timestamp,
            payload: Value::Object(data.fields.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_production_falls_back_to_envelope_timestamp() {
        let data: ProductionData =
            serde_json::from_value(json!({ "sourceId": "L2", "temp": 71 })).unwrap();
        let point = DataPoint::from_production(&data, "2024-05-01T12:00:00Z").unwrap();
        assert_eq!(point.source_id, "L2");
        assert_eq!(point.timestamp, 1_714_564_800_000);
        assert_eq!(point.payload, json!({ "temp": 71 }));
    }

    #[test]
    fn test_from_production_without_any_timestamp() {
        let data: ProductionData = serde_json::from_value(json!({ "sourceId": "L2" })).unwrap();
        assert!(DataPoint::from_production(&data, "not a time").is_none());
    }
}
