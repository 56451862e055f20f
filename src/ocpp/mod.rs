//! OCPP 1.6 operations: payload types, inbound handlers, outbound builders.

pub mod handlers;
pub mod outbound;
pub mod types;
