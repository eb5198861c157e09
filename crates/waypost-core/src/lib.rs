//! waypost-core: shared types, request validation, and secret primitives.
//! All other waypost crates depend on this one.

pub mod config;
pub mod secret;
pub mod session;
pub mod validate;

pub use secret::{constant_time_eq, Psk};
pub use session::{Fragment, SessionId, SessionRecord};
pub use validate::{RelayProtocol, RequestParams, SessionRef, ValidationError};
