//! Process-global façade over [`Context`].
//!
//! Firmware-style hosts prefer free functions over carrying a context value
//! around; this module keeps one context per thread behind the same
//! operations. Library users with more than one charge point (or tests that
//! exercise reinitialization) should hold [`Context`] values directly —
//! `deinitialize` followed by `initialize` is exactly a drop-and-recreate,
//! which is also what exercises the persistence recovery paths.

use std::cell::RefCell;

use tracing::warn;

use crate::connection::Connection;
use crate::context::{Context, Setup};
use crate::model::{ChargerCredentials, SessionError};

thread_local! {
    static CONTEXT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Creates the global context. An existing one is dropped first, as if
/// `deinitialize` had been called.
pub fn initialize(
    connection: Box<dyn Connection>,
    credentials: ChargerCredentials,
    setup: Setup,
) {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            warn!("initialize called twice; dropping the previous context");
        }
        *slot = Some(Context::new(connection, credentials, setup));
    });
}

/// Drops the global context. Unwritten state (an unresolved start timestamp,
/// in-flight requests) is lost, exactly as on a power cycle.
pub fn deinitialize() {
    CONTEXT.with(|slot| slot.borrow_mut().take());
}

pub fn is_initialized() -> bool {
    CONTEXT.with(|slot| slot.borrow().is_some())
}

/// Runs `f` against the global context; `None` when uninitialized.
pub fn with_context<R>(f: impl FnOnce(&mut Context) -> R) -> Option<R> {
    CONTEXT.with(|slot| slot.borrow_mut().as_mut().map(f))
}

pub fn poll() {
    if with_context(|ctx| ctx.poll()).is_none() {
        warn!("poll before initialize");
    }
}

pub fn begin_transaction(id_tag: &str) -> Result<u32, SessionError> {
    with_context(|ctx| ctx.begin_transaction(id_tag))
        .unwrap_or(Err(SessionError::InvalidConnector))
}

pub fn begin_transaction_authorized(id_tag: &str) -> Result<u32, SessionError> {
    with_context(|ctx| ctx.begin_transaction_authorized(id_tag))
        .unwrap_or(Err(SessionError::InvalidConnector))
}

pub fn end_transaction(reason: Option<&str>) -> bool {
    with_context(|ctx| ctx.end_transaction(reason)).unwrap_or(false)
}

pub fn start_transaction(id_tag: &str) -> Result<u32, SessionError> {
    with_context(|ctx| ctx.start_transaction(id_tag))
        .unwrap_or(Err(SessionError::InvalidConnector))
}

pub fn stop_transaction() -> bool {
    with_context(|ctx| ctx.stop_transaction()).unwrap_or(false)
}

pub fn is_transaction_running() -> bool {
    with_context(|ctx| ctx.is_transaction_running()).unwrap_or(false)
}

pub fn ocpp_permits_charge() -> bool {
    with_context(|ctx| ctx.ocpp_permits_charge()).unwrap_or(false)
}

pub fn is_operative() -> bool {
    with_context(|ctx| ctx.is_operative()).unwrap_or(false)
}

pub fn set_connector_plugged_input(sampler: crate::model::connector::BoolSampler) {
    with_context(|ctx| ctx.set_connector_plugged_input(sampler));
}

pub fn set_ev_ready_input(sampler: crate::model::connector::BoolSampler) {
    with_context(|ctx| ctx.set_ev_ready_input(sampler));
}

pub fn set_energy_active_import_sampler(sampler: crate::model::connector::EnergySampler) {
    with_context(|ctx| ctx.set_energy_active_import_sampler(sampler));
}
