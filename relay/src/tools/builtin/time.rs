//! Time utilities tool: current time, weekday, day differences.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use serde_json::{json, Value};

use crate::tools::{ToolContext, ToolError, ToolMetadata, ToolPlugin, ToolResult};

pub struct TimeTool;

fn parse_date(s: &str) -> Result<NaiveDate, ToolError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| ToolError::Validation(format!("bad date {s:?}, expected YYYY-MM-DD")))
}

#[async_trait]
impl ToolPlugin for TimeTool {
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "get_time".into(),
            version: "1.0.0".into(),
            description: "Current time, weekday lookup, and date arithmetic".into(),
            enabled: true,
        }
    }

    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": "get_time",
                "description": "Time utilities. operation=now returns the current UTC time; \
                                operation=weekday returns the weekday of a date; \
                                operation=diff_days returns whole days between two dates.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "operation": { "type": "string", "enum": ["now", "weekday", "diff_days"] },
                        "date": { "type": "string", "description": "YYYY-MM-DD, for weekday" },
                        "from": { "type": "string", "description": "YYYY-MM-DD, for diff_days" },
                        "to": { "type": "string", "description": "YYYY-MM-DD, for diff_days" }
                    },
                    "required": ["operation"]
                }
            }
        })
    }

    fn validate(&self, params: &Value) -> Result<(), ToolError> {
        match params.get("operation").and_then(Value::as_str) {
            Some("now") | Some("weekday") | Some("diff_days") => Ok(()),
            Some(other) => Err(ToolError::Validation(format!("unknown operation {other:?}"))),
            None => Err(ToolError::Validation("operation is required".into())),
        }
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolResult, ToolError> {
        let operation = params.get("operation").and_then(Value::as_str).unwrap_or("now");
        let data = match operation {
            "weekday" => {
                let date = params.get("date").and_then(Value::as_str).unwrap_or("");
                let parsed = parse_date(date)?;
                json!({ "date": date, "weekday": parsed.weekday().to_string() })
            }
            "diff_days" => {
                let from = parse_date(params.get("from").and_then(Value::as_str).unwrap_or(""))?;
                let to = parse_date(params.get("to").and_then(Value::as_str).unwrap_or(""))?;
                json!({ "days": (to - from).num_days() })
            }
            _ => {
                let now = Utc::now();
                json!({
                    "iso": now.to_rfc3339(),
                    "unix": now.timestamp(),
                    "weekday": now.weekday().to_string(),
                })
            }
        };
        Ok(ToolResult::ok(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn now_returns_iso_and_unix() {
        let r = TimeTool
            .execute(json!({ "operation": "now" }), &ToolContext::default())
            .await
            .unwrap();
        assert!(r.data["iso"].as_str().unwrap().contains('T'));
        assert!(r.data["unix"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn weekday_of_known_date() {
        let r = TimeTool
            .execute(
                json!({ "operation": "weekday", "date": "2026-01-01" }),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(r.data["weekday"], "Thu");
    }

    #[tokio::test]
    async fn diff_days_is_signed() {
        let r = TimeTool
            .execute(
                json!({ "operation": "diff_days", "from": "2026-01-10", "to": "2026-01-01" }),
                &ToolContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(r.data["days"], -9);
    }

    #[tokio::test]
    async fn bad_date_is_a_validation_error() {
        let err = TimeTool
            .execute(
                json!({ "operation": "weekday", "date": "01/01/2026" }),
                &ToolContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation(_)));
    }
}
