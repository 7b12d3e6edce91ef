pub mod bash;
pub mod file;

pub use bash::BashTool;
pub use file::{ReadFileTool, WriteFileTool};

use crate::types::AgentTool;
use std::sync::Arc;

/// The standard built-in tool set.
pub fn default_tools() -> Vec<Arc<dyn AgentTool>> {
    vec![
        Arc::new(BashTool::default()),
        Arc::new(ReadFileTool::default()),
        Arc::new(WriteFileTool),
    ]
}
