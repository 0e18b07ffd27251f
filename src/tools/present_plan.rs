use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Tool, ToolKind, ToolSchema, PRESENT_PLAN_TOOL};
use crate::error::ToolError;

/// The plan-presentation tool. In plan mode this is the only non-read-only
/// tool the authorizer lets through. The dispatcher routes its invocation
/// through the session's plan reviewer when one is registered; this
/// fallback implementation just acknowledges the plan.
pub struct PresentPlanTool;

impl PresentPlanTool {
    /// Pull the plan text out of the model-supplied arguments.
    pub fn plan_text(args: &Value) -> Result<String, ToolError> {
        args["plan"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ToolError::InvalidArgs("missing string field 'plan'".into()))
    }
}

#[async_trait]
impl Tool for PresentPlanTool {
    fn name(&self) -> &str {
        PRESENT_PLAN_TOOL
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Write
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: PRESENT_PLAN_TOOL.into(),
            description: "Present an implementation plan to the user for approval. \
                          Required before making changes while plan mode is active."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "plan": {
                        "type": "string",
                        "description": "The complete plan, in markdown"
                    }
                },
                "required": ["plan"]
            }),
        }
    }

    async fn invoke(&self, args: &Value) -> Result<String, ToolError> {
        let plan = Self::plan_text(args)?;
        Ok(format!(
            "Plan recorded ({} chars). No reviewer is attached to this session.",
            plan.len()
        ))
    }
}
