//! End-to-end charging session scenarios, driven through a loopback (echo)
//! connection, a shared in-memory filesystem, and a manually advanced tick
//! source. The library answers its own requests in echo mode, so no central
//! system is needed.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ocpp_chargepoint::connection::LoopbackConnection;
use ocpp_chargepoint::context::{Context, Setup};
use ocpp_chargepoint::model::ChargerCredentials;
use ocpp_chargepoint::ocpp::handlers::register_boot_notification_echo;
use ocpp_chargepoint::storage::MemFilesystem;
use ocpp_chargepoint::time::Timestamp;

const BASE_TIME: &str = "2023-01-01T00:00:00.000Z";

struct Rig {
    conn: LoopbackConnection,
    fs: MemFilesystem,
    tick: Rc<Cell<u64>>,
}

impl Rig {
    fn new() -> Rig {
        Rig {
            conn: LoopbackConnection::new(),
            fs: MemFilesystem::new(),
            tick: Rc::new(Cell::new(0)),
        }
    }

    /// Builds a context over the rig's shared connection, flash, and tick
    /// source; dropping the previous context first models a reboot.
    fn context(&self) -> Context {
        let tick = self.tick.clone();
        Context::new(
            Box::new(self.conn.clone()),
            ChargerCredentials::new("test-runner1234"),
            Setup::new(Rc::new(self.fs.clone()))
                .with_tick_source(Box::new(move || tick.get())),
        )
    }

    fn advance_s(&self, seconds: u64) {
        self.tick.set(self.tick.get() + seconds * 1000);
    }
}

fn pump(ctx: &mut Context, n: usize) {
    for _ in 0..n {
        ctx.poll();
    }
}

fn enable_preboot(ctx: &mut Context) {
    if let Some(h) = ctx.model_mut().config.handle("AO_PreBootTransactions") {
        h.set_bool(true);
    }
    ctx.model_mut().config.save().expect("config save");
}

/// Records (connectorId, status) of every StatusNotification that reaches
/// the wire.
fn track_status(ctx: &mut Context) -> Rc<RefCell<Vec<(u64, String)>>> {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    ctx.registry_mut().set_on_request(
        "StatusNotification",
        Box::new(move |payload| {
            let cid = payload["connectorId"].as_u64().unwrap_or(u64::MAX);
            let status = payload["status"].as_str().unwrap_or("Invalid").to_string();
            sink.borrow_mut().push((cid, status));
        }),
    );
    log
}

fn statuses_of(log: &Rc<RefCell<Vec<(u64, String)>>>, cid: u64) -> Vec<String> {
    log.borrow()
        .iter()
        .filter(|(c, _)| *c == cid)
        .map(|(_, s)| s.clone())
        .collect()
}

/// Flags every wire occurrence of the given action.
fn track_action(ctx: &mut Context, action: &str) -> Rc<Cell<bool>> {
    let seen = Rc::new(Cell::new(false));
    let flag = seen.clone();
    ctx.registry_mut()
        .set_on_request(action, Box::new(move |_| flag.set(true)));
    seen
}

// ---------------------------------------------------------------------------
// S1: idle boot
// ---------------------------------------------------------------------------

#[test]
fn idle_boot_sends_boot_then_available_everywhere() {
    let rig = Rig::new();
    let mut ctx = rig.context();
    register_boot_notification_echo(ctx.registry_mut(), 3600);
    let status_log = track_status(&mut ctx);

    let boot_ok = Rc::new(Cell::new(false));
    let flag = boot_ok.clone();
    ctx.registry_mut().set_on_request(
        "BootNotification",
        Box::new(move |payload| {
            flag.set(payload["chargePointModel"] == "test-runner1234");
        }),
    );

    pump(&mut ctx, 16);

    assert!(boot_ok.get());
    assert_eq!(statuses_of(&status_log, 0), vec!["Available"]);
    assert_eq!(statuses_of(&status_log, 1), vec!["Available"]);
    assert!(ctx.is_operative());
    assert!(!ctx.is_transaction_running());
    assert!(!ctx.ocpp_permits_charge());
}

// ---------------------------------------------------------------------------
// S2/S3: plug and authorization in either order
// ---------------------------------------------------------------------------

/// Boots a rig with echo BootNotification and returns it settled.
fn booted() -> (Rig, Context, Rc<RefCell<Vec<(u64, String)>>>) {
    let rig = Rig::new();
    let mut ctx = rig.context();
    register_boot_notification_echo(ctx.registry_mut(), 3600);
    let status_log = track_status(&mut ctx);
    pump(&mut ctx, 16);
    status_log.borrow_mut().clear();
    (rig, ctx, status_log)
}

#[test]
fn plug_then_authorize_reaches_charging() {
    let (_rig, mut ctx, status_log) = booted();
    let start_seen = track_action(&mut ctx, "StartTransaction");

    let plugged = Rc::new(Cell::new(true));
    let sampler = plugged.clone();
    ctx.set_connector_plugged_input(Box::new(move || sampler.get()));
    pump(&mut ctx, 8);
    assert_eq!(statuses_of(&status_log, 1), vec!["Preparing"]);

    ctx.begin_transaction("mIdTag").expect("session begins");
    pump(&mut ctx, 16);
    assert!(start_seen.get());
    assert!(ctx.ocpp_permits_charge());
    assert_eq!(statuses_of(&status_log, 1), vec!["Preparing", "Charging"]);
}

#[test]
fn authorize_then_plug_reaches_charging() {
    let (_rig, mut ctx, status_log) = booted();
    let start_seen = track_action(&mut ctx, "StartTransaction");

    let plugged = Rc::new(Cell::new(false));
    let sampler = plugged.clone();
    ctx.set_connector_plugged_input(Box::new(move || sampler.get()));

    ctx.begin_transaction("mIdTag").expect("session begins");
    pump(&mut ctx, 16);
    assert_eq!(statuses_of(&status_log, 1), vec!["Preparing"]);
    assert!(!start_seen.get());

    plugged.set(true);
    pump(&mut ctx, 16);
    assert!(start_seen.get());
    assert!(ctx.ocpp_permits_charge());
    assert_eq!(statuses_of(&status_log, 1), vec!["Preparing", "Charging"]);
}

#[test]
fn transaction_centric_mode_starts_without_plug_sampler() {
    let (_rig, mut ctx, status_log) = booted();
    ctx.begin_transaction("mIdTag").expect("session begins");
    pump(&mut ctx, 16);
    assert!(ctx.ocpp_permits_charge());
    // Preparing while the Authorize round trip is in flight, then Charging
    assert_eq!(statuses_of(&status_log, 1), vec!["Preparing", "Charging"]);
}

// ---------------------------------------------------------------------------
// S4: ConnectionTimeOut
// ---------------------------------------------------------------------------

#[test]
fn session_times_out_without_the_second_half() {
    let (rig, mut ctx, status_log) = booted();
    let start_seen = track_action(&mut ctx, "StartTransaction");

    ctx.set_connector_plugged_input(Box::new(|| false));
    ctx.begin_transaction("mIdTag").expect("session begins");
    pump(&mut ctx, 16);
    assert_eq!(statuses_of(&status_log, 1), vec!["Preparing"]);

    rig.advance_s(30); // ConnectionTimeOut default
    pump(&mut ctx, 8);

    assert_eq!(statuses_of(&status_log, 1), vec!["Preparing", "Available"]);
    assert!(!start_seen.get());
    assert!(!ctx.is_transaction_running());
}

// ---------------------------------------------------------------------------
// Stop paths
// ---------------------------------------------------------------------------

#[test]
fn stop_directly_returns_to_available() {
    let (_rig, mut ctx, status_log) = booted();
    ctx.start_transaction("mIdTag").expect("starts");
    pump(&mut ctx, 16);
    assert!(ctx.ocpp_permits_charge());
    status_log.borrow_mut().clear();

    let stop_seen = track_action(&mut ctx, "StopTransaction");
    ctx.stop_transaction();
    pump(&mut ctx, 16);

    assert!(stop_seen.get());
    assert!(!ctx.ocpp_permits_charge());
    assert_eq!(statuses_of(&status_log, 1), vec!["Available"]);
}

#[test]
fn deauthorize_while_plugged_finishes_then_frees() {
    let (_rig, mut ctx, status_log) = booted();
    let plugged = Rc::new(Cell::new(true));
    let sampler = plugged.clone();
    ctx.set_connector_plugged_input(Box::new(move || sampler.get()));

    ctx.begin_transaction("mIdTag").expect("session begins");
    pump(&mut ctx, 16);
    assert!(ctx.ocpp_permits_charge());
    status_log.borrow_mut().clear();

    ctx.end_transaction(Some("Local"));
    pump(&mut ctx, 16);
    assert!(!ctx.ocpp_permits_charge());
    assert_eq!(statuses_of(&status_log, 1), vec!["Finishing"]);

    plugged.set(false);
    pump(&mut ctx, 8);
    assert_eq!(statuses_of(&status_log, 1), vec!["Finishing", "Available"]);
}

#[test]
fn plug_out_stops_the_transaction() {
    let (_rig, mut ctx, status_log) = booted();
    let plugged = Rc::new(Cell::new(true));
    let sampler = plugged.clone();
    ctx.set_connector_plugged_input(Box::new(move || sampler.get()));

    ctx.begin_transaction("mIdTag").expect("session begins");
    pump(&mut ctx, 16);
    assert!(ctx.ocpp_permits_charge());
    status_log.borrow_mut().clear();

    let reason = Rc::new(RefCell::new(String::new()));
    let sink = reason.clone();
    ctx.registry_mut().set_on_request(
        "StopTransaction",
        Box::new(move |payload| {
            *sink.borrow_mut() = payload["reason"].as_str().unwrap_or_default().to_string();
        }),
    );

    plugged.set(false);
    pump(&mut ctx, 16);

    assert!(!ctx.ocpp_permits_charge());
    assert_eq!(*reason.borrow(), "EVDisconnected");
    assert_eq!(statuses_of(&status_log, 1), vec!["Available"]);
}

#[test]
fn heartbeat_fires_after_an_interval_of_silence() {
    let (rig, mut ctx, _status_log) = booted();
    let heartbeat_seen = track_action(&mut ctx, "Heartbeat");

    pump(&mut ctx, 8);
    assert!(!heartbeat_seen.get());

    rig.advance_s(3600); // interval granted by the boot confirmation
    pump(&mut ctx, 8);
    assert!(heartbeat_seen.get());
}

#[test]
fn ev_not_ready_suspends_and_resumes() {
    let (_rig, mut ctx, status_log) = booted();
    let ev_ready = Rc::new(Cell::new(true));
    let sampler = ev_ready.clone();
    ctx.set_ev_ready_input(Box::new(move || sampler.get()));
    ctx.set_connector_plugged_input(Box::new(|| true));

    ctx.begin_transaction("mIdTag").expect("session begins");
    pump(&mut ctx, 16);
    assert!(ctx.ocpp_permits_charge());
    status_log.borrow_mut().clear();

    ev_ready.set(false);
    pump(&mut ctx, 8);
    assert_eq!(statuses_of(&status_log, 1), vec!["SuspendedEV"]);

    ev_ready.set(true);
    pump(&mut ctx, 8);
    assert_eq!(statuses_of(&status_log, 1), vec!["SuspendedEV", "Charging"]);
}

// ---------------------------------------------------------------------------
// Status debounce (MinimumStatusDuration)
// ---------------------------------------------------------------------------

#[test]
fn status_flap_shorter_than_minimum_duration_is_silent() {
    let (rig, mut ctx, status_log) = booted();
    if let Some(h) = ctx.model_mut().config.handle("MinimumStatusDuration") {
        h.set_int(5);
    }
    let plugged = Rc::new(Cell::new(false));
    let sampler = plugged.clone();
    ctx.set_connector_plugged_input(Box::new(move || sampler.get()));
    pump(&mut ctx, 4);
    status_log.borrow_mut().clear();

    plugged.set(true);
    pump(&mut ctx, 2);
    rig.advance_s(2);
    pump(&mut ctx, 2);
    plugged.set(false); // back before the 5 s stability window elapsed
    pump(&mut ctx, 2);
    rig.advance_s(30);
    pump(&mut ctx, 8);

    assert!(statuses_of(&status_log, 1).is_empty());
}

// ---------------------------------------------------------------------------
// S5: pre-boot transaction with back-dated timestamps
// ---------------------------------------------------------------------------

#[test]
fn preboot_transaction_backdates_start_and_stop() {
    let rig = Rig::new();
    rig.conn.set_connected(false);
    let mut ctx = rig.context();
    enable_preboot(&mut ctx);
    pump(&mut ctx, 4);

    ctx.begin_transaction_authorized("mIdTag").expect("session begins");
    pump(&mut ctx, 4);
    assert!(ctx.is_transaction_running());

    rig.advance_s(3600); // transaction duration ~1 h
    ctx.end_transaction(None);
    pump(&mut ctx, 4);

    rig.advance_s(3600); // clock arrives one hour later
    assert!(ctx.set_time(BASE_TIME));

    let basetime = Timestamp::parse(BASE_TIME).unwrap();

    let start_delay = Rc::new(Cell::new(i32::MIN));
    let sink = start_delay.clone();
    ctx.registry_mut().set_on_request(
        "StartTransaction",
        Box::new(move |payload| {
            let ts = Timestamp::parse(payload["timestamp"].as_str().unwrap_or_default())
                .expect("start timestamp parses");
            sink.set(basetime - ts);
        }),
    );
    let stop_delay = Rc::new(Cell::new(i32::MIN));
    let sink = stop_delay.clone();
    ctx.registry_mut().set_on_request(
        "StopTransaction",
        Box::new(move |payload| {
            let ts = Timestamp::parse(payload["timestamp"].as_str().unwrap_or_default())
                .expect("stop timestamp parses");
            sink.set(basetime - ts);
        }),
    );

    rig.conn.set_connected(true);
    pump(&mut ctx, 24);

    let start_delay = start_delay.get();
    assert!(
        (2 * 3600 - 10..=2 * 3600 + 10).contains(&start_delay),
        "start was captured two hours before the clock: {start_delay}"
    );
    let stop_delay = stop_delay.get();
    assert!(
        (3600 - 10..=3600 + 10).contains(&stop_delay),
        "stop was captured one hour before the clock: {stop_delay}"
    );
}

// ---------------------------------------------------------------------------
// S6: a start timestamp that never resolved does not survive a reboot
// ---------------------------------------------------------------------------

#[test]
fn lost_start_timestamp_recovers_as_aborted() {
    let rig = Rig::new();
    rig.conn.set_connected(false);
    let mut ctx = rig.context();
    enable_preboot(&mut ctx);
    pump(&mut ctx, 4);

    ctx.begin_transaction_authorized("mIdTag").expect("session begins");
    pump(&mut ctx, 4);
    assert!(ctx.is_transaction_running());

    drop(ctx); // reboot: the tick base of the deferred timestamp is gone

    let mut ctx = rig.context();
    enable_preboot(&mut ctx);
    let start_seen = track_action(&mut ctx, "StartTransaction");
    let stop_seen = track_action(&mut ctx, "StopTransaction");

    rig.conn.set_connected(true);
    pump(&mut ctx, 16);

    assert!(!ctx.is_transaction_running());
    assert!(!start_seen.get());
    assert!(!stop_seen.get());
}

// ---------------------------------------------------------------------------
// S7: a lost stop timestamp falls back to start + 1 s
// ---------------------------------------------------------------------------

#[test]
fn lost_stop_timestamp_falls_back_to_start_plus_one() {
    let start_time = "2023-02-01T00:00:00.000Z";
    let rig = Rig::new();

    // first life: transaction starts with a known clock
    let mut ctx = rig.context();
    enable_preboot(&mut ctx);
    assert!(ctx.set_time(start_time));
    ctx.begin_transaction_authorized("mIdTag").expect("session begins");
    pump(&mut ctx, 16);
    assert!(ctx.is_transaction_running());
    drop(ctx);

    // second life: no clock; the session ends offline
    rig.conn.set_connected(false);
    let mut ctx = rig.context();
    enable_preboot(&mut ctx);
    pump(&mut ctx, 4);
    assert!(ctx.is_transaction_running());
    ctx.end_transaction(None);
    pump(&mut ctx, 4);
    assert!(!ctx.is_transaction_running());
    drop(ctx);

    // third life: the stop capture tick is gone; reconnect and deliver
    let mut ctx = rig.context();
    enable_preboot(&mut ctx);
    let delta = Rc::new(Cell::new(i32::MIN));
    let sink = delta.clone();
    let start_ts = Timestamp::parse(start_time).unwrap();
    ctx.registry_mut().set_on_request(
        "StopTransaction",
        Box::new(move |payload| {
            let ts = Timestamp::parse(payload["timestamp"].as_str().unwrap_or_default())
                .expect("stop timestamp parses");
            sink.set(ts - start_ts);
        }),
    );

    rig.conn.set_connected(true);
    pump(&mut ctx, 24);

    assert_eq!(delta.get(), 1, "stop carries the minimum resolvable separation");
}

// ---------------------------------------------------------------------------
// Idempotent poll
// ---------------------------------------------------------------------------

#[test]
fn poll_without_inputs_is_state_preserving() {
    let (_rig, mut ctx, status_log) = booted();
    let start_seen = track_action(&mut ctx, "StartTransaction");

    pump(&mut ctx, 32);

    assert!(statuses_of(&status_log, 0).is_empty());
    assert!(statuses_of(&status_log, 1).is_empty());
    assert!(!start_seen.get());
    assert!(ctx.is_operative());
    assert!(!ctx.is_transaction_running());
}

// ---------------------------------------------------------------------------
// Meter values during a running transaction
// ---------------------------------------------------------------------------

#[test]
fn meter_values_sample_periodically_while_charging() {
    let (rig, mut ctx, _status_log) = booted();
    if let Some(h) = ctx.model_mut().config.handle("MeterValueSampleInterval") {
        h.set_int(10);
    }
    let energy = Rc::new(Cell::new(100));
    let sampler = energy.clone();
    ctx.set_energy_active_import_sampler(Box::new(move || sampler.get()));

    ctx.start_transaction("mIdTag").expect("starts");
    pump(&mut ctx, 16);
    assert!(ctx.ocpp_permits_charge());

    let values = Rc::new(RefCell::new(Vec::new()));
    let sink = values.clone();
    ctx.registry_mut().set_on_request(
        "MeterValues",
        Box::new(move |payload| {
            let v = payload["meterValue"][0]["sampledValue"][0]["value"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            sink.borrow_mut().push(v);
        }),
    );

    energy.set(250);
    rig.advance_s(10);
    pump(&mut ctx, 8);

    assert_eq!(*values.borrow(), vec!["250".to_string()]);
}
