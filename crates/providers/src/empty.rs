use async_trait::async_trait;
use shared::Tool;
use std::sync::Arc;

use crate::instance::{GenerationTarget, Instance, InstanceKind};

/// Placeholder used until a real backend is configured
#[derive(Debug, Default)]
pub struct EmptyInstance;

#[async_trait]
impl Instance for EmptyInstance {
    fn kind(&self) -> InstanceKind {
        InstanceKind::Empty
    }

    fn id(&self) -> &str {
        "empty"
    }

    async fn generate_message(&self, target: &GenerationTarget, _model: &str) {
        target.report_error("No instance is configured");
    }

    async fn use_tools(&self, target: &GenerationTarget, _model: &str, _tools: &[Arc<dyn Tool>]) {
        target.report_error("No instance is configured");
    }

    fn stop(&self) {}

    fn get_default_model(&self) -> Option<String> {
        None
    }
}
