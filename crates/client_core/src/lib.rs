//! Instructor client: session view state machine, realtime channel and REST access.

pub mod channel;
pub mod controller;
pub mod driver;
pub mod rest;
pub mod revisions;
pub mod transport;

pub use channel::{ChannelEvent, ChannelState, MessageChannel};
pub use controller::{
    ActiveSession, ControllerError, ErrorCategory, PendingCreate, RequestId, SessionViewController,
    View, CREATE_SESSION_TIMEOUT,
};
pub use driver::{Intent, SessionDriver};
pub use rest::RestClient;
pub use revisions::RevisionHistory;
pub use transport::{ReconnectPolicy, WsChannel};
