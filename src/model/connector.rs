//! Connector state machine: session handling, transaction lifecycle, and
//! status reporting for one connector.
//!
//! Inputs are sampled once per poll from host-provided closures. Connector 0
//! addresses the whole charger and only ever reports Available, Unavailable
//! or Faulted; connectors >= 1 run the full session machine.
//!
//! A transaction starts once the session is authorized and the cable state
//! allows it; if the complementary half does not arrive within
//! `ConnectionTimeOut` seconds of the session beginning, the session aborts.
//! Hosts that never install a plug sampler run "transaction-centric": plug
//! state neither gates the start nor shows up in the reported status.

use tracing::{debug, info};

use crate::model::store::TransactionStore;
use crate::model::OpRequest;
use crate::ocpp::types::{AvailabilityStatus, ChargePointStatus};
use crate::time::Clock;

pub type BoolSampler = Box<dyn FnMut() -> bool>;
pub type EnergySampler = Box<dyn FnMut() -> i32>;
pub type UnlockHandler = Box<dyn FnMut() -> bool>;

/// Per-poll environment handed to the connector by the model.
pub struct ConnectorEnv<'a> {
    pub clock: &'a mut Clock,
    pub store: &'a mut TransactionStore,
    pub ops: &'a mut Vec<OpRequest>,
    pub connection_timeout_s: i64,
    pub minimum_status_duration_s: i64,
    pub meter_sample_interval_s: i64,
}

pub struct Connector {
    id: u32,

    plugged_input: Option<BoolSampler>,
    ev_ready_input: Option<BoolSampler>,
    evse_ready_input: Option<BoolSampler>,
    fault_input: Option<BoolSampler>,
    energy_sampler: Option<EnergySampler>,
    unlock_handler: Option<UnlockHandler>,

    /// Weak handle onto the current transaction; re-resolved against the
    /// store on every access.
    tx_nr: Option<u32>,

    operative: bool,
    inoperative_pending: bool,

    reported_status: Option<ChargePointStatus>,
    candidate_status: Option<(ChargePointStatus, i64)>,

    last_meter_tick: i64,
}

impl Connector {
    pub fn new(id: u32) -> Connector {
        Connector {
            id,
            plugged_input: None,
            ev_ready_input: None,
            evse_ready_input: None,
            fault_input: None,
            energy_sampler: None,
            unlock_handler: None,
            tx_nr: None,
            operative: true,
            inoperative_pending: false,
            reported_status: None,
            candidate_status: None,
            last_meter_tick: 0,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_plugged_input(&mut self, sampler: BoolSampler) {
        self.plugged_input = Some(sampler);
    }

    pub fn set_ev_ready_input(&mut self, sampler: BoolSampler) {
        self.ev_ready_input = Some(sampler);
    }

    pub fn set_evse_ready_input(&mut self, sampler: BoolSampler) {
        self.evse_ready_input = Some(sampler);
    }

    pub fn set_fault_input(&mut self, sampler: BoolSampler) {
        self.fault_input = Some(sampler);
    }

    pub fn set_energy_sampler(&mut self, sampler: EnergySampler) {
        self.energy_sampler = Some(sampler);
    }

    pub fn set_unlock_handler(&mut self, handler: UnlockHandler) {
        self.unlock_handler = Some(handler);
    }

    pub fn tx_nr(&self) -> Option<u32> {
        self.tx_nr
    }

    pub fn adopt_transaction(&mut self, tx_nr: u32) {
        self.tx_nr = Some(tx_nr);
    }

    pub fn is_operative(&self) -> bool {
        self.operative
    }

    /// Last status handed to the debouncer, for TriggerMessage.
    pub fn last_status(&self) -> ChargePointStatus {
        self.candidate_status
            .map(|(s, _)| s)
            .or(self.reported_status)
            .unwrap_or(ChargePointStatus::Available)
    }

    pub fn sample_energy(&mut self) -> Option<i32> {
        self.energy_sampler.as_mut().map(|f| f())
    }

    pub fn unlock(&mut self) -> Option<bool> {
        self.unlock_handler.as_mut().map(|f| f())
    }

    fn has_live_transaction(&self, store: &TransactionStore) -> bool {
        self.tx_nr
            .and_then(|nr| store.get(self.id, nr))
            .map(|tx| tx.is_preparing() || tx.is_running())
            .unwrap_or(false)
    }

    /// Applies an availability change. An inoperative request against a live
    /// transaction is deferred until the transaction ends.
    pub fn request_availability(
        &mut self,
        operative: bool,
        store: &TransactionStore,
    ) -> AvailabilityStatus {
        if operative {
            self.operative = true;
            self.inoperative_pending = false;
            AvailabilityStatus::Accepted
        } else if self.has_live_transaction(store) {
            self.inoperative_pending = true;
            AvailabilityStatus::Scheduled
        } else {
            self.operative = false;
            AvailabilityStatus::Accepted
        }
    }

    /// Runs one bounded step of the state machine.
    pub fn poll(&mut self, env: &mut ConnectorEnv<'_>) {
        let now_tick = env.clock.ticks();
        let plugged = self.plugged_input.as_mut().map(|f| f());
        let ev_ready = self.ev_ready_input.as_mut().map(|f| f()).unwrap_or(true);
        let evse_ready = self.evse_ready_input.as_mut().map(|f| f()).unwrap_or(true);
        let faulted = self.fault_input.as_mut().map(|f| f()).unwrap_or(false);

        if self.id >= 1 {
            self.poll_session(env, now_tick, plugged, evse_ready, faulted);
            self.poll_meter(env, now_tick);
        }

        if self.inoperative_pending && !self.has_live_transaction(env.store) {
            self.operative = false;
            self.inoperative_pending = false;
            info!(connector_id = self.id, "deferred availability change applied");
        }

        let status = self.compute_status(env.store, plugged, ev_ready, evse_ready, faulted);
        self.debounce_status(env, status, now_tick);
    }

    fn poll_session(
        &mut self,
        env: &mut ConnectorEnv<'_>,
        now_tick: i64,
        plugged: Option<bool>,
        evse_ready: bool,
        faulted: bool,
    ) {
        let Some(nr) = self.tx_nr else { return };

        enum Phase {
            Gone,
            Preparing { active: bool, authorized: bool },
            Running { deauthorized: bool, active: bool },
            Stopping { completed: bool },
        }
        let phase = match env.store.get(self.id, nr) {
            None => Phase::Gone,
            Some(tx) if tx.is_preparing() || tx.is_aborted() => Phase::Preparing {
                active: tx.is_active(),
                authorized: tx.session.authorized,
            },
            Some(tx) if tx.is_running() => Phase::Running {
                deauthorized: tx.session.deauthorized,
                active: tx.is_active(),
            },
            Some(tx) => Phase::Stopping { completed: tx.is_completed() },
        };

        match phase {
            Phase::Gone => self.tx_nr = None,

            Phase::Preparing { active: false, .. } => {
                // session ended before StartTransaction: record is aborted
                env.store.commit(self.id, nr);
                self.tx_nr = None;
                env.store.reclaim(self.id);
            }

            Phase::Preparing { authorized, .. } => {
                // ConnectionTimeOut counts from session begin, whichever
                // half arrived first
                let timed_out = {
                    let Some(tx) = env.store.get_mut(self.id, nr) else { return };
                    let began = *tx.session_tick.get_or_insert(now_tick);
                    env.connection_timeout_s > 0
                        && now_tick - began >= env.connection_timeout_s
                };
                if timed_out {
                    info!(connector_id = self.id, tx_nr = nr, "session timed out before start");
                    if let Some(tx) = env.store.get_mut(self.id, nr) {
                        tx.end_session();
                    }
                    env.store.commit(self.id, nr);
                    self.tx_nr = None;
                    return;
                }

                let startable = authorized
                    && plugged != Some(false)
                    && evse_ready
                    && self.operative
                    && !faulted;
                if startable {
                    let meter = self.sample_energy().unwrap_or(0);
                    let clock_valid = env.clock.is_valid();
                    let now = env.clock.now();
                    if let Some(tx) = env.store.get_mut(self.id, nr) {
                        tx.start.meter = meter;
                        if clock_valid {
                            tx.start.timestamp = now;
                        } else {
                            tx.start_tick = Some(now_tick);
                        }
                        tx.start.rpc.requested = true;
                        if tx.silent {
                            tx.start.rpc.confirmed = true;
                        }
                    }
                    env.store.commit(self.id, nr);
                    self.last_meter_tick = now_tick;
                    info!(connector_id = self.id, tx_nr = nr, "transaction started");
                }
            }

            Phase::Running { deauthorized, active } => {
                // late resolution of a start timestamp captured before the
                // clock was set
                self.resolve_deferred(env, nr);

                let unplugged = plugged == Some(false);
                if !active || deauthorized || unplugged {
                    let meter = self.sample_energy().unwrap_or(0);
                    let clock_valid = env.clock.is_valid();
                    let now = env.clock.now();
                    if let Some(tx) = env.store.get_mut(self.id, nr) {
                        let id_tag = tx.session.id_tag.clone();
                        tx.end_session();
                        if tx.stop.reason.is_empty() {
                            if unplugged {
                                tx.set_stop_reason("EVDisconnected");
                            } else if deauthorized {
                                tx.set_stop_reason("DeAuthorized");
                            }
                        }
                        if tx.stop.id_tag.is_empty() && !unplugged && !deauthorized {
                            tx.stop.id_tag = id_tag;
                        }
                        tx.stop.meter = meter;
                        if clock_valid {
                            tx.stop.timestamp = now;
                        } else {
                            tx.stop_tick = Some(now_tick);
                        }
                        tx.stop.rpc.requested = true;
                        if tx.silent {
                            tx.stop.rpc.confirmed = true;
                        }
                    }
                    env.store.commit(self.id, nr);
                    info!(connector_id = self.id, tx_nr = nr, "transaction stopped");
                }
            }

            Phase::Stopping { completed } => {
                self.resolve_deferred(env, nr);
                if completed && plugged != Some(true) {
                    debug!(connector_id = self.id, tx_nr = nr, "transaction archived");
                    self.tx_nr = None;
                    env.store.reclaim(self.id);
                }
            }
        }
    }

    /// Rewrites start/stop timestamps that were captured before the clock
    /// was set, once it is.
    fn resolve_deferred(&mut self, env: &mut ConnectorEnv<'_>, nr: u32) {
        if !env.clock.is_valid() {
            return;
        }
        let mut changed = false;
        let (start_tick, stop_tick) = match env.store.get(self.id, nr) {
            Some(tx) => (
                tx.start_tick.filter(|_| tx.start.timestamp.is_deferred()),
                tx.stop_tick
                    .filter(|_| tx.stop.rpc.requested && tx.stop.timestamp.is_deferred()),
            ),
            None => return,
        };
        if let Some(ts) = start_tick.and_then(|t| env.clock.resolve(t)) {
            if let Some(tx) = env.store.get_mut(self.id, nr) {
                tx.start.timestamp = ts;
                changed = true;
            }
        }
        if let Some(ts) = stop_tick.and_then(|t| env.clock.resolve(t)) {
            if let Some(tx) = env.store.get_mut(self.id, nr) {
                tx.stop.timestamp = ts;
                changed = true;
            }
        }
        if changed {
            env.store.commit(self.id, nr);
        }
    }

    fn poll_meter(&mut self, env: &mut ConnectorEnv<'_>, now_tick: i64) {
        if env.meter_sample_interval_s <= 0 || !env.clock.is_valid() {
            return;
        }
        let Some(nr) = self.tx_nr else { return };
        let running = env
            .store
            .get(self.id, nr)
            .map(|tx| tx.is_running() && !tx.silent)
            .unwrap_or(false);
        if !running {
            return;
        }
        if now_tick - self.last_meter_tick < env.meter_sample_interval_s {
            return;
        }
        let Some(energy) = self.sample_energy() else { return };
        self.last_meter_tick = now_tick;
        let transaction_id = env
            .store
            .get(self.id, nr)
            .map(|tx| tx.start.transaction_id)
            .filter(|id| *id >= 0);
        env.ops.push(OpRequest::MeterValues {
            connector_id: self.id,
            transaction_id,
            energy_wh: energy,
            tick: now_tick,
        });
    }

    fn compute_status(
        &self,
        store: &TransactionStore,
        plugged: Option<bool>,
        ev_ready: bool,
        evse_ready: bool,
        faulted: bool,
    ) -> ChargePointStatus {
        if faulted {
            return ChargePointStatus::Faulted;
        }
        if !self.operative {
            return ChargePointStatus::Unavailable;
        }
        if self.id == 0 {
            return ChargePointStatus::Available;
        }
        if let Some(tx) = self.tx_nr.and_then(|nr| store.get(self.id, nr)) {
            if tx.is_running() {
                if plugged != Some(false) && !ev_ready {
                    return ChargePointStatus::SuspendedEV;
                }
                if !evse_ready {
                    return ChargePointStatus::SuspendedEVSE;
                }
                return ChargePointStatus::Charging;
            }
            if tx.is_preparing() {
                return ChargePointStatus::Preparing;
            }
            if tx.stop.rpc.requested && plugged == Some(true) {
                return ChargePointStatus::Finishing;
            }
        }
        if plugged == Some(true) {
            return ChargePointStatus::Preparing;
        }
        ChargePointStatus::Available
    }

    /// Emits a StatusNotification once the freshly observed status differs
    /// from the last reported one and has been stable for
    /// `MinimumStatusDuration` seconds. The emitted record carries the tick
    /// at which the status was first observed, not when it finally went out.
    fn debounce_status(&mut self, env: &mut ConnectorEnv<'_>, status: ChargePointStatus, now_tick: i64) {
        if self.candidate_status.map(|(s, _)| s) != Some(status) {
            self.candidate_status = Some((status, now_tick));
        }
        let Some((candidate, since)) = self.candidate_status else { return };
        if Some(candidate) != self.reported_status
            && now_tick - since >= env.minimum_status_duration_s
        {
            debug!(connector_id = self.id, ?candidate, "status changed");
            env.ops.push(OpRequest::Status {
                connector_id: self.id,
                status: candidate,
                tick: since,
            });
            self.reported_status = Some(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemFilesystem;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Fixture {
        clock: Clock,
        store: TransactionStore,
        ops: Vec<OpRequest>,
        tick: Rc<Cell<u64>>,
    }

    impl Fixture {
        fn new() -> Fixture {
            let tick = Rc::new(Cell::new(0u64));
            let source = tick.clone();
            Fixture {
                clock: Clock::new(Box::new(move || source.get())),
                store: TransactionStore::load(Rc::new(MemFilesystem::new()), 2),
                ops: Vec::new(),
                tick,
            }
        }

        fn env(&mut self, minimum_status_duration_s: i64) -> ConnectorEnv<'_> {
            ConnectorEnv {
                clock: &mut self.clock,
                store: &mut self.store,
                ops: &mut self.ops,
                connection_timeout_s: 30,
                minimum_status_duration_s,
                meter_sample_interval_s: 0,
            }
        }
    }

    #[test]
    fn debounce_stamps_the_first_observation() {
        let mut fx = Fixture::new();
        let mut connector = Connector::new(1);
        connector.set_plugged_input(Box::new(|| true));

        connector.poll(&mut fx.env(5));
        assert!(fx.ops.is_empty(), "status must hold for the stability window");

        fx.tick.set(5_000);
        connector.poll(&mut fx.env(5));
        assert!(matches!(
            fx.ops.as_slice(),
            [OpRequest::Status {
                connector_id: 1,
                status: ChargePointStatus::Preparing,
                tick: 0
            }]
        ));
    }

    #[test]
    fn zero_duration_reports_immediately() {
        let mut fx = Fixture::new();
        let mut connector = Connector::new(1);
        connector.poll(&mut fx.env(0));
        assert!(matches!(
            fx.ops.as_slice(),
            [OpRequest::Status { connector_id: 1, status: ChargePointStatus::Available, .. }]
        ));
    }

    #[test]
    fn inoperative_request_waits_for_the_transaction() {
        let mut fx = Fixture::new();
        let mut connector = Connector::new(1);
        let nr = fx.store.create(1, false).unwrap();
        fx.store.get_mut(1, nr).unwrap().start.rpc.requested = true;
        connector.adopt_transaction(nr);

        assert_eq!(
            connector.request_availability(false, &fx.store),
            AvailabilityStatus::Scheduled
        );
        assert!(connector.is_operative());

        // transaction ends; the deferred change applies on the next poll
        {
            let tx = fx.store.get_mut(1, nr).unwrap();
            tx.end_session();
            tx.stop.rpc.requested = true;
        }
        connector.poll(&mut fx.env(0));
        assert!(!connector.is_operative());
    }
}
