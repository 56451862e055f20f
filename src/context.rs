//! Context: owns the model, the operation registry, the RPC engine, and the
//! host's connection, and sequences them from a single `poll` entry point.
//!
//! Everything is cooperative and single-threaded. One poll pumps the
//! transport, routes all received frames, expires the in-flight request,
//! runs the boot scheduler and every connector state machine once, converts
//! the collected operation requests into outbox entries, and dispatches at
//! most one new CALL.

use std::rc::Rc;

use tracing::info;

use crate::connection::Connection;
use crate::model::connector::{BoolSampler, EnergySampler, UnlockHandler};
use crate::model::{ChargerCredentials, Model, ResetHandler, SessionError};
use crate::ocpp::{handlers, outbound};
use crate::rpc::engine::RpcEngine;
use crate::rpc::registry::OperationRegistry;
use crate::storage::Filesystem;
use crate::time::{system_tick_source, TickSource};

/// Host-provided wiring for a context.
pub struct Setup {
    pub filesystem: Rc<dyn Filesystem>,
    pub tick_source: TickSource,
    /// Physical connectors; connector 0 (the whole charger) is added on top.
    pub connector_count: u32,
}

impl Setup {
    pub fn new(filesystem: Rc<dyn Filesystem>) -> Setup {
        Setup { filesystem, tick_source: system_tick_source(), connector_count: 1 }
    }

    pub fn with_tick_source(mut self, tick_source: TickSource) -> Self {
        self.tick_source = tick_source;
        self
    }

    pub fn with_connector_count(mut self, connector_count: u32) -> Self {
        self.connector_count = connector_count.max(1);
        self
    }
}

pub struct Context {
    model: Model,
    registry: OperationRegistry,
    engine: RpcEngine,
    connection: Box<dyn Connection>,
}

impl Context {
    /// Builds the context; the first poll queues the BootNotification. State
    /// is recovered from the setup's filesystem; the connection is used
    /// as-is and may well still be offline.
    pub fn new(
        connection: Box<dyn Connection>,
        credentials: ChargerCredentials,
        setup: Setup,
    ) -> Context {
        let Setup { filesystem, tick_source, connector_count } = setup;
        let model = Model::new(credentials, filesystem, tick_source, connector_count);
        let mut registry = OperationRegistry::new();
        handlers::register_core_operations(&mut registry);
        info!(
            connectors = connector_count,
            model = %model.credentials.charge_point_model,
            "charge point context initialized"
        );
        Context { model, registry, engine: RpcEngine::new(), connection }
    }

    /// Makes bounded progress; call repeatedly from the host main loop.
    pub fn poll(&mut self) {
        self.connection.poll();

        while let Some(text) = self.connection.try_recv() {
            self.engine.handle_text(&mut self.model, &mut self.registry, &text);
        }

        let now_tick = self.model.clock.ticks();
        let timeout_s = self.model.config.get_int("MessageTimeout").unwrap_or(30) as i64;
        self.engine.set_timeout_s(timeout_s);
        self.engine.check_timeout(&mut self.model, now_tick);

        self.model.poll(self.engine.last_call_tick());
        for op in self.model.take_outgoing() {
            self.engine.enqueue(outbound::entry_for(op));
        }

        self.engine.dispatch(&mut self.model, self.connection.as_mut(), now_tick);
    }

    // ------------------------------------------------------------------
    // Session operations; the single-connector forms address connector 1
    // ------------------------------------------------------------------

    pub fn begin_transaction(&mut self, id_tag: &str) -> Result<u32, SessionError> {
        self.model.begin_transaction(1, id_tag)
    }

    pub fn begin_transaction_authorized(&mut self, id_tag: &str) -> Result<u32, SessionError> {
        self.model.begin_transaction_authorized(1, id_tag)
    }

    pub fn end_transaction(&mut self, reason: Option<&str>) -> bool {
        self.model.end_transaction(1, reason)
    }

    pub fn start_transaction(&mut self, id_tag: &str) -> Result<u32, SessionError> {
        self.model.start_transaction(1, id_tag)
    }

    pub fn stop_transaction(&mut self) -> bool {
        self.model.stop_transaction(1)
    }

    pub fn is_transaction_running(&self) -> bool {
        self.model.is_transaction_running(1)
    }

    pub fn ocpp_permits_charge(&self) -> bool {
        self.model.ocpp_permits_charge(1)
    }

    pub fn is_operative(&self) -> bool {
        self.model.is_operative(1)
    }

    // ------------------------------------------------------------------
    // Input wiring
    // ------------------------------------------------------------------

    pub fn set_connector_plugged_input(&mut self, sampler: BoolSampler) {
        if let Some(c) = self.model.connector_mut(1) {
            c.set_plugged_input(sampler);
        }
    }

    pub fn set_ev_ready_input(&mut self, sampler: BoolSampler) {
        if let Some(c) = self.model.connector_mut(1) {
            c.set_ev_ready_input(sampler);
        }
    }

    pub fn set_evse_ready_input(&mut self, sampler: BoolSampler) {
        if let Some(c) = self.model.connector_mut(1) {
            c.set_evse_ready_input(sampler);
        }
    }

    pub fn set_fault_input(&mut self, sampler: BoolSampler) {
        if let Some(c) = self.model.connector_mut(1) {
            c.set_fault_input(sampler);
        }
    }

    pub fn set_energy_active_import_sampler(&mut self, sampler: EnergySampler) {
        if let Some(c) = self.model.connector_mut(1) {
            c.set_energy_sampler(sampler);
        }
    }

    pub fn set_unlock_connector_handler(&mut self, handler: UnlockHandler) {
        if let Some(c) = self.model.connector_mut(1) {
            c.set_unlock_handler(handler);
        }
    }

    pub fn set_reset_handler(&mut self, handler: ResetHandler) {
        self.model.on_reset = Some(handler);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn registry_mut(&mut self) -> &mut OperationRegistry {
        &mut self.registry
    }

    /// Sets the wall clock from a JSON date string (host-side time source).
    pub fn set_time(&mut self, json_date: &str) -> bool {
        self.model.clock.set_time(json_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackConnection;
    use crate::storage::MemFilesystem;
    use std::cell::Cell;

    fn pump(ctx: &mut Context, n: usize) {
        for _ in 0..n {
            ctx.poll();
        }
    }

    fn harness() -> (Context, LoopbackConnection, Rc<Cell<u64>>) {
        let conn = LoopbackConnection::new();
        let tick = Rc::new(Cell::new(0u64));
        let tick_handle = tick.clone();
        let mut ctx = Context::new(
            Box::new(conn.clone()),
            ChargerCredentials::new("test-runner1234"),
            Setup::new(Rc::new(MemFilesystem::new()))
                .with_tick_source(Box::new(move || tick_handle.get())),
        );
        handlers::register_boot_notification_echo(ctx.registry_mut(), 3600);
        (ctx, conn, tick)
    }

    #[test]
    fn boot_is_the_first_outbound_call() {
        let (mut ctx, _conn, _tick) = harness();
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        ctx.registry_mut().set_on_request(
            "BootNotification",
            Box::new(move |payload| {
                flag.set(payload["chargePointModel"] == "test-runner1234");
            }),
        );
        pump(&mut ctx, 4);
        assert!(seen.get());
        assert!(ctx.model().boot.is_accepted());
    }

    #[test]
    fn direct_start_permits_charge() {
        let (mut ctx, _conn, _tick) = harness();
        pump(&mut ctx, 8);
        ctx.start_transaction("mIdTag").unwrap();
        pump(&mut ctx, 8);
        assert!(ctx.ocpp_permits_charge());
        assert!(ctx.is_transaction_running());

        ctx.stop_transaction();
        pump(&mut ctx, 8);
        assert!(!ctx.ocpp_permits_charge());
    }
}
