//! Websocket wire client for the haven runtime
//!
//! This crate maintains one live session to the upstream: dial, auth
//! handshake, request/response correlation by integer id, event
//! subscriptions and service calls. Transport failures tear the session
//! down and are signalled on a disconnect channel; reconnecting is the
//! engine supervisor's job, not this crate's.

mod client;
mod error;
pub mod testing;
pub mod types;

pub use client::{Client, ClientConfig, EventHandler};
pub use error::{WsError, WsResult};
pub use types::{CallServiceRequest, EventMessage, ResultFrame};
