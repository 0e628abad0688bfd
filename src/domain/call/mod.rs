//! Call bounded context - session registry and call state machine

pub mod registry;
pub mod session;
pub mod store;
pub mod value_object;

pub use registry::{CallTeardown, SessionRegistry};
pub use session::CallSession;
pub use store::{InMemorySessionStore, SessionStore};
pub use value_object::{CallDirection, CallState, PendingOperation, TRANSITIONS};
