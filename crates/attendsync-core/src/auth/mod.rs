//! Session management for reconciliation requests.
//!
//! Obtaining a token is out of scope; an operator stores one with
//! `attendsync login` and it is attached as a bearer header until it
//! expires (8 hours, one school day).

pub mod session;

pub use session::{Session, SessionData};
