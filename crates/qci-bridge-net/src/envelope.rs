use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Ping,
    ConsciousnessUpdate {
        #[serde(default)]
        data: JsonValue,
    },
    Chat {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Welcome { client_id: u64 },
    Pong { timestamp: u64 },
    ConsciousnessUpdate { data: JsonValue },
    Chat { client_id: u64, message: String },
    Event { event: JsonValue },
    Metrics { metrics: JsonValue },
    Error { message: String },
}

impl ServerEnvelope {
    pub fn to_text(&self) -> String {
        // Every variant is plain JSON data, so encoding cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"error","message":"encode"}"#))
    }
}

/// Pulls a level and an optional weight out of a `consciousness_update`
/// payload. Accepts a bare number or an object with `level`/`weight`.
pub fn level_from_update(data: &JsonValue) -> (Option<f32>, Option<f32>) {
    if let Some(level) = data.as_f64() {
        return (Some(level as f32), None);
    }
    let read = |key: &str| data.get(key).and_then(JsonValue::as_f64).map(|v| v as f32);
    (read("level"), read("weight"))
}
