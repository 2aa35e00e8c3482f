//! The agent runtime core: the context builder that shapes what the model
//! sees, and the processing loop that drives one agent's
//! perceive→think→act cycle over its notification queue.

mod agent;
mod context;
mod convert;
mod session;

pub use agent::{is_transient_message, Agent, CycleError};
pub use context::{
    inject_pending_images, ContextBuilder, ContextMessage, ImageAttachment, ParseError,
    ParsedResponse, ToolCallRequest,
};
pub use convert::to_llm_messages;
pub use session::CallSession;
