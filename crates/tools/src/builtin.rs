//! In-process plugin tools.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use parley_core::error::ToolError;
use parley_core::tool::Tool;

/// Reports the current date and time.
pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Get the current date and time, optionally at a UTC offset in hours."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset_hours": {
                    "type": "integer",
                    "description": "Offset from UTC, e.g. -5 or 9"
                }
            }
        })
    }

    async fn invoke(&self, input: serde_json::Value) -> Result<String, ToolError> {
        let hours = match input.get("utc_offset_hours") {
            None | Some(serde_json::Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                ToolError::InvalidArguments("'utc_offset_hours' must be an integer".into())
            })?,
        };

        let offset = i32::try_from(hours)
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ToolError::InvalidArguments(format!("offset {hours}h is out of range")))?;

        Ok(Utc::now().with_timezone(&offset).format("%Y-%m-%d %H:%M:%S %:z").to_string())
    }
}
