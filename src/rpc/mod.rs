//! RPC layer: OCPP-J framing, the operation registry, and the outbox engine.

pub mod engine;
pub mod frame;
pub mod registry;

pub use engine::{Build, OpKey, Outcome, OutboxEntry, RpcEngine};
pub use frame::{Call, CallError, CallResult, ErrorCode, Frame, FrameError};
pub use registry::{OperationError, OperationRegistry};
