//! # ocpp-chargepoint
//!
//! OCPP 1.6J charge-point client core: turns cable, authorization and meter
//! inputs into a conformant sequence of OCPP messages, and keeps doing so
//! across reboots and connection loss.
//!
//! ## Architecture
//!
//! ```text
//! host inputs (plug, RFID, meter)          central system
//!        │                                       ▲
//!        ▼                                       │ websocket (ocpp1.6)
//! ┌──────────────────────────────┐       ┌───────┴────────┐
//! │ Connector state machines     │  ops  │ RPC engine     │
//! │ sessions · status · tx legs  ├──────►│ outbox · frames│
//! ├──────────────────────────────┤       │ registry       │
//! │ Model: clock · config ·      │◄──────┤                │
//! │ transaction store · cache    │ confs └────────────────┘
//! └──────────────────────────────┘
//!            │ blobs (temp + rename)
//!            ▼
//!       Filesystem capability
//! ```
//!
//! Everything progresses from one cooperative [`Context::poll`] entry point;
//! no component blocks and no locks exist. Transactions live in a bounded
//! persistent ring per connector and survive power loss; timestamps captured
//! before the clock was known are back-dated once a server time arrives.
//!
//! ## Usage
//!
//! ```no_run
//! use std::rc::Rc;
//! use ocpp_chargepoint::{ChargerCredentials, Context, Setup};
//! use ocpp_chargepoint::storage::DirFilesystem;
//! use ocpp_chargepoint::connection::LoopbackConnection;
//!
//! let filesystem = Rc::new(DirFilesystem::open("./ocpp-store")?);
//! let mut ctx = Context::new(
//!     Box::new(LoopbackConnection::new()),
//!     ChargerCredentials::new("model-x").with_vendor("vendor"),
//!     Setup::new(filesystem),
//! );
//! ctx.set_connector_plugged_input(Box::new(|| false));
//! loop {
//!     ctx.poll();
//!     # break;
//! }
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod config;
pub mod connection;
pub mod context;
pub mod facade;
pub mod model;
pub mod ocpp;
pub mod rpc;
pub mod storage;
pub mod time;

#[cfg(feature = "ws")]
pub mod ws;

pub use config::{ConfigFlags, ConfigRegistry, ConfigValue, SetOutcome};
pub use connection::{Connection, LoopbackConnection};
pub use context::{Context, Setup};
pub use model::{ChargerCredentials, Model, SessionError};
pub use ocpp::types::ChargePointStatus;
pub use rpc::{ErrorCode, Frame, OperationRegistry};
pub use storage::{DirFilesystem, Filesystem, MemFilesystem};
pub use time::{Clock, Timestamp};
