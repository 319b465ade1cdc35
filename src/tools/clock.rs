use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::error::Result;
use crate::tool::Tool;

/// Lets the model answer "what day is it" questions.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Return the current UTC date and time (RFC 3339) and the weekday."
    }

    fn parameters(&self) -> Option<Value> {
        Some(json!({"type": "object", "properties": {}}))
    }

    async fn call(&self, _input: Value) -> Result<Value> {
        let now = Utc::now();
        Ok(json!({
            "utc": now.to_rfc3339_opts(SecondsFormat::Secs, true),
            "weekday": now.format("%A").to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_utc_timestamp() {
        let output = CurrentTimeTool.call(json!({})).await.unwrap();
        let utc = output["utc"].as_str().unwrap();
        assert!(utc.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(utc).is_ok());
    }
}
