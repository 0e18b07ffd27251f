pub mod present_plan;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

pub use present_plan::PresentPlanTool;
pub use registry::ToolRegistry;

/// Name of the built-in plan-presentation tool. Plan mode special-cases it.
pub const PRESENT_PLAN_TOOL: &str = "present_plan";

/// Side-effect classification. Drives dispatch mode and plan-mode gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    ReadOnly,
    Write,
    Execute,
}

/// JSON tool definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A tool as the core sees it: a name, a classification, a schema for the
/// model, and an async invocation. Implementations live with the host.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ToolKind;

    fn schema(&self) -> ToolSchema;

    /// Allowed while plan mode is active: read-only tools plus
    /// `present_plan`.
    fn is_plan_safe(&self) -> bool {
        matches!(self.kind(), ToolKind::ReadOnly) || self.name() == PRESENT_PLAN_TOOL
    }

    async fn invoke(&self, args: &Value) -> Result<String, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture(ToolKind, &'static str);

    #[async_trait]
    impl Tool for Fixture {
        fn name(&self) -> &str {
            self.1
        }

        fn kind(&self) -> ToolKind {
            self.0
        }

        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: self.1.into(),
                description: String::new(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn invoke(&self, _args: &Value) -> Result<String, ToolError> {
            Ok("ok".into())
        }
    }

    #[test]
    fn plan_safety_follows_classification() {
        assert!(Fixture(ToolKind::ReadOnly, "grep").is_plan_safe());
        assert!(!Fixture(ToolKind::Write, "write_file").is_plan_safe());
        assert!(!Fixture(ToolKind::Execute, "bash").is_plan_safe());
        assert!(Fixture(ToolKind::Write, PRESENT_PLAN_TOOL).is_plan_safe());
    }
}
