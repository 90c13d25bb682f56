//! Gateway worker: routing, forwarding, local sessions and the HTTP surface

mod dispatch;
mod forward;
mod registry;
mod resolver;
mod router;
mod server;

pub use dispatch::{Dispatcher, error_response};
pub use forward::{ForwardEnvelope, ForwardReply, ForwardingRelay, LocalExecutor};
pub use registry::{ChannelTransport, CleanupReport, LocalSessionRegistry, SessionTransport};
pub use resolver::{StaticResolver, Target, TargetResolver};
pub use router::{AppState, IDENTITY_HEADER, create_router};
pub use server::Gateway;
