//! Command lifecycle: instances, queueing, handler dispatch.

mod instance;
mod queue;

pub use instance::{
    CommandEvent, CommandInstance, CommandRef, CommandState, ErrorInfo, JsonObject, Origin,
    WeakCommand,
};
pub use queue::{CommandCallback, CommandHandler, CommandQueue, COMMAND_LINGER};
