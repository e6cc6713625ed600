//! WebSocket push pipeline: job type and the per-connection actor.

mod actor;
mod job;

pub use actor::{ActorConfig, ActorGuard, PushActor, TxState, WebSocketHandler};
pub use job::TxJob;
