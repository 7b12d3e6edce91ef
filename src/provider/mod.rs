pub mod adapter;
pub mod mock;
pub mod registry;
pub mod traits;

pub use adapter::{
    cache_breakpoints, flatten_thinking, normalize_tool_id, parse_partial_json, TurnAssembler,
};
pub use mock::{MockProvider, MockTurn};
pub use registry::ProviderRegistry;
pub use traits::{
    EventStream, Provider, ProviderError, ProviderEvent, StreamOptions, StreamRequest,
    ToolDefinition,
};
