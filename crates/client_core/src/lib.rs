//! Client side of the messaging subsystem: REST backend, push connector and
//! the session controller that ties them to local state.

pub mod backend;
pub mod backoff;
pub mod error;
pub mod push;
pub mod session;
pub mod state;

pub use backend::{HttpBackend, MessagingBackend};
pub use backoff::ReconnectPolicy;
pub use error::{ClientError, Result};
pub use push::{PushConnector, PushFrame, PushStream, WsConnector};
pub use session::{SessionController, SessionEvent, SessionState};
pub use state::{Applied, LocalState, Thread};
