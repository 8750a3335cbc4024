use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Stage that reports claim intake and extraction results
pub const INTAKE_STAGE: &str = "Intake Node";
/// Stage that reports the policy decision
pub const POLICY_STAGE: &str = "Policy Node";
/// Stage that reports risk scoring
pub const RISK_STAGE: &str = "Risk Analyze Node";
/// Stage that reports the processing route
pub const ROUTING_STAGE: &str = "Routing Node";
/// Stage emitted by the backend when the pipeline itself fails
pub const ERROR_STAGE: &str = "Error";
/// Payload key holding a `data` value that is not an object
pub const VALUE_KEY: &str = "value";

/// One decoded line of the claim progress stream.
///
/// The set of stages is open: the labels above are the ones the backend
/// currently emits, any other label is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    #[serde(rename = "node")]
    pub stage: String,
    #[serde(rename = "data", default, deserialize_with = "payload_object")]
    pub payload: Map<String, Value>,
}

impl StreamRecord {
    pub fn new(stage: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            stage: stage.into(),
            payload,
        }
    }

    /// Look up a payload field
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key).filter(|v| !v.is_null())
    }

    /// Look up a payload field that is expected to be a string
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.stage == ERROR_STAGE
    }
}

fn payload_object<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => Map::new(),
        Value::Object(map) => map,
        other => Map::from_iter([(VALUE_KEY.to_string(), other)]),
    })
}
