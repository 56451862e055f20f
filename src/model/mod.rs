//! The charge-point model: clock, configuration, transaction store,
//! connectors, authorization cache, and boot state, plus the session
//! operations the host calls into.

pub mod boot;
pub mod connector;
pub mod store;
pub mod transaction;

use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigFlags, ConfigRegistry};
use crate::model::boot::BootService;
use crate::model::connector::{Connector, ConnectorEnv};
use crate::model::store::TransactionStore;
use crate::ocpp::types::{ChargePointStatus, IdTagInfo, ResetType};
use crate::storage::Filesystem;
use crate::time::{Clock, TickSource};

/// Identity reported in BootNotification.
#[derive(Debug, Clone)]
pub struct ChargerCredentials {
    pub charge_point_model: String,
    pub charge_point_vendor: String,
    pub firmware_version: Option<String>,
    pub charge_point_serial_number: Option<String>,
    pub charge_box_serial_number: Option<String>,
    pub meter_serial_number: Option<String>,
    pub meter_type: Option<String>,
}

impl ChargerCredentials {
    pub fn new(model: impl Into<String>) -> ChargerCredentials {
        ChargerCredentials {
            charge_point_model: model.into(),
            charge_point_vendor: "Generic".to_string(),
            firmware_version: None,
            charge_point_serial_number: None,
            charge_box_serial_number: None,
            meter_serial_number: None,
            meter_type: None,
        }
    }

    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.charge_point_vendor = vendor.into();
        self
    }

    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.charge_point_serial_number = Some(serial.into());
        self
    }
}

/// Thin key/value view over confirmed authorization results.
#[derive(Default)]
pub struct AuthorizationCache {
    entries: HashMap<String, IdTagInfo>,
}

impl AuthorizationCache {
    pub fn insert(&mut self, id_tag: &str, info: IdTagInfo) {
        self.entries.insert(id_tag.to_string(), info);
    }

    pub fn get(&self, id_tag: &str) -> Option<&IdTagInfo> {
        self.entries.get(id_tag)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Outgoing operation requests collected during a poll; the context turns
/// them into outbox entries. Transaction RPCs reference their record by
/// (connector, txNr) and are re-resolved at dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum OpRequest {
    Boot,
    Heartbeat,
    Authorize { connector_id: u32, id_tag: String },
    StartTx { connector_id: u32, tx_nr: u32 },
    StopTx { connector_id: u32, tx_nr: u32 },
    Status { connector_id: u32, status: ChargePointStatus, tick: i64 },
    MeterValues { connector_id: u32, transaction_id: Option<i32>, energy_wh: i32, tick: i64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no such connector")]
    InvalidConnector,
    #[error("a session is already active on this connector")]
    Occupied,
    #[error("transaction ring is full")]
    StoreFull,
}

pub type ResetHandler = Box<dyn FnMut(ResetType)>;

pub struct Model {
    pub clock: Clock,
    pub config: ConfigRegistry,
    pub store: TransactionStore,
    pub connectors: Vec<Connector>,
    pub auth_cache: AuthorizationCache,
    pub boot: BootService,
    pub credentials: ChargerCredentials,
    pub on_reset: Option<ResetHandler>,

    outgoing: Vec<OpRequest>,
    echo_transaction_id: i32,
}

impl Model {
    /// Builds the model: declares the runtime configuration keys, overlays
    /// the persisted snapshot, reloads the transaction store, and re-adopts
    /// the latest unfinished transaction per connector.
    pub fn new(
        credentials: ChargerCredentials,
        filesystem: Rc<dyn Filesystem>,
        tick_source: TickSource,
        connector_count: u32,
    ) -> Model {
        let mut config = ConfigRegistry::new(filesystem.clone());
        let declare = &mut config;
        let _ = declare.declare_int("ConnectionTimeOut", 30, ConfigFlags::writable());
        let _ = declare.declare_int("MinimumStatusDuration", 0, ConfigFlags::writable());
        let _ = declare.declare_int("HeartbeatInterval", 86400, ConfigFlags::writable());
        let _ = declare.declare_int("MeterValueSampleInterval", 0, ConfigFlags::writable());
        let _ = declare.declare_int("MessageTimeout", 30, ConfigFlags::writable());
        let _ = declare.declare_int("GetConfigurationMaxKeys", 30, ConfigFlags::volatile());
        let _ = declare.declare_int(
            "NumberOfConnectors",
            connector_count as i32,
            ConfigFlags { readonly: true, volatile: true, report: true, ..Default::default() },
        );
        let _ = declare.declare_text(
            "SupportedFeatureProfiles",
            "Core,RemoteTrigger",
            ConfigFlags { readonly: true, volatile: true, report: true, ..Default::default() },
        );
        let _ = declare.declare_bool("AuthorizeRemoteTxRequests", false, ConfigFlags::writable());
        let _ = declare.declare_bool("AO_PreBootTransactions", false, ConfigFlags::writable());
        config.load();

        let clock = Clock::new(tick_source);
        let store = TransactionStore::load(filesystem, connector_count + 1);

        let mut connectors: Vec<Connector> =
            (0..=connector_count).map(Connector::new).collect();
        for connector in connectors.iter_mut().skip(1) {
            let cid = connector.id();
            if let Some(tx) = store.latest(cid) {
                if !tx.is_reclaimable() {
                    info!(connector_id = cid, tx_nr = tx.tx_nr, "resuming persisted transaction");
                    connector.adopt_transaction(tx.tx_nr);
                }
            }
        }

        let default_heartbeat =
            config.get_int("HeartbeatInterval").unwrap_or(86400).max(0) as i64;

        Model {
            clock,
            config,
            store,
            connectors,
            auth_cache: AuthorizationCache::default(),
            boot: BootService::new(default_heartbeat),
            credentials,
            on_reset: None,
            outgoing: Vec::new(),
            echo_transaction_id: 1000,
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Model {
        Model::new(
            ChargerCredentials::new("test-model"),
            Rc::new(crate::storage::MemFilesystem::new()),
            Box::new(|| 0),
            1,
        )
    }

    pub fn connector(&self, connector_id: u32) -> Option<&Connector> {
        self.connectors.get(connector_id as usize)
    }

    pub fn connector_mut(&mut self, connector_id: u32) -> Option<&mut Connector> {
        self.connectors.get_mut(connector_id as usize)
    }

    pub fn connector_count(&self) -> u32 {
        self.connectors.len() as u32
    }

    pub fn push_op(&mut self, op: OpRequest) {
        self.outgoing.push(op);
    }

    pub fn take_outgoing(&mut self) -> Vec<OpRequest> {
        std::mem::take(&mut self.outgoing)
    }

    /// Transaction id handed out when this charge point answers its own
    /// StartTransaction in echo mode.
    pub fn next_echo_transaction_id(&mut self) -> i32 {
        let id = self.echo_transaction_id;
        self.echo_transaction_id += 1;
        id
    }

    // ------------------------------------------------------------------
    // Session operations (§ caller-facing)
    // ------------------------------------------------------------------

    fn begin_session(
        &mut self,
        connector_id: u32,
        id_tag: &str,
        authorized: bool,
        silent: bool,
    ) -> Result<u32, SessionError> {
        let connector = self
            .connectors
            .get(connector_id as usize)
            .filter(|c| c.id() >= 1)
            .ok_or(SessionError::InvalidConnector)?;

        if let Some(tx) = connector.tx_nr().and_then(|nr| self.store.get(connector_id, nr)) {
            if tx.is_preparing() || tx.is_running() {
                return Err(SessionError::Occupied);
            }
        }

        let tx_nr = self
            .store
            .create(connector_id, silent)
            .ok_or(SessionError::StoreFull)?;

        let now = self.clock.now();
        let now_tick = self.clock.ticks();
        if let Some(tx) = self.store.get_mut(connector_id, tx_nr) {
            tx.set_id_tag(id_tag);
            tx.session.authorized = authorized;
            tx.session.timestamp = now;
            tx.session_tick = Some(now_tick);
        }
        self.store.commit(connector_id, tx_nr);

        if let Some(connector) = self.connectors.get_mut(connector_id as usize) {
            connector.adopt_transaction(tx_nr);
        }
        if !authorized {
            self.outgoing.push(OpRequest::Authorize {
                connector_id,
                id_tag: id_tag.to_string(),
            });
        }
        debug!(connector_id, tx_nr, authorized, "session begun");
        Ok(tx_nr)
    }

    /// Begins a session whose idTag still needs an Authorize round trip.
    pub fn begin_transaction(
        &mut self,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<u32, SessionError> {
        self.begin_session(connector_id, id_tag, false, false)
    }

    /// Begins a session with the idTag taken as already authorized (cached
    /// or offline authorization, pre-boot transactions).
    pub fn begin_transaction_authorized(
        &mut self,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<u32, SessionError> {
        self.begin_session(connector_id, id_tag, true, false)
    }

    /// Direct form: starts without the session preconditions.
    pub fn start_transaction(
        &mut self,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<u32, SessionError> {
        self.begin_session(connector_id, id_tag, true, false)
    }

    /// Begins a transaction processed for local state only: its start/stop
    /// never reach the wire and no server transaction id is expected.
    pub fn begin_silent_transaction(
        &mut self,
        connector_id: u32,
        id_tag: &str,
    ) -> Result<u32, SessionError> {
        self.begin_session(connector_id, id_tag, true, true)
    }

    /// Ends the current session. If a transaction is running the stop leg is
    /// initiated on the next poll; a session that never started aborts.
    pub fn end_transaction(&mut self, connector_id: u32, reason: Option<&str>) -> bool {
        let Some(nr) = self.connectors.get(connector_id as usize).and_then(|c| c.tx_nr())
        else {
            return false;
        };
        let Some(tx) = self.store.get_mut(connector_id, nr) else { return false };
        if !tx.is_active() {
            return false;
        }
        let id_tag = tx.session.id_tag.clone();
        tx.end_session();
        if let Some(reason) = reason {
            tx.set_stop_reason(reason);
        }
        if tx.stop.id_tag.is_empty() {
            tx.stop.id_tag = id_tag;
        }
        self.store.commit(connector_id, nr);
        info!(connector_id, tx_nr = nr, ?reason, "session ended");
        true
    }

    /// Direct form of [`Model::end_transaction`] without a reason.
    pub fn stop_transaction(&mut self, connector_id: u32) -> bool {
        self.end_transaction(connector_id, Some("Local"))
    }

    pub fn is_transaction_running(&self, connector_id: u32) -> bool {
        self.connectors
            .get(connector_id as usize)
            .and_then(|c| c.tx_nr())
            .and_then(|nr| self.store.get(connector_id, nr))
            .map(|tx| tx.is_running())
            .unwrap_or(false)
    }

    /// True while charging is permitted: a transaction is running and its
    /// session has neither ended nor been deauthorized.
    pub fn ocpp_permits_charge(&self, connector_id: u32) -> bool {
        self.connectors
            .get(connector_id as usize)
            .and_then(|c| c.tx_nr())
            .and_then(|nr| self.store.get(connector_id, nr))
            .map(|tx| tx.is_running() && tx.is_active() && !tx.session.deauthorized)
            .unwrap_or(false)
    }

    /// Operative = neither the charge point nor the connector has been made
    /// inoperative.
    pub fn is_operative(&self, connector_id: u32) -> bool {
        let charger = self.connectors.first().map(|c| c.is_operative()).unwrap_or(false);
        let connector = self
            .connectors
            .get(connector_id as usize)
            .map(|c| c.is_operative())
            .unwrap_or(false);
        charger && connector
    }

    /// Applies a ChangeAvailability request. Connector 0 addresses the whole
    /// charger, i.e. every connector.
    pub fn change_availability(
        &mut self,
        connector_id: u32,
        operative: bool,
    ) -> crate::ocpp::types::AvailabilityStatus {
        use crate::ocpp::types::AvailabilityStatus;
        if connector_id as usize >= self.connectors.len() {
            return AvailabilityStatus::Rejected;
        }
        let targets: Vec<u32> = if connector_id == 0 {
            (0..self.connectors.len() as u32).collect()
        } else {
            vec![connector_id]
        };
        let mut scheduled = false;
        let Model { connectors, store, .. } = self;
        for id in targets {
            if let Some(connector) = connectors.get_mut(id as usize) {
                if connector.request_availability(operative, store) == AvailabilityStatus::Scheduled
                {
                    scheduled = true;
                }
            }
        }
        if scheduled {
            AvailabilityStatus::Scheduled
        } else {
            AvailabilityStatus::Accepted
        }
    }

    /// True when the connector has no session in progress.
    pub fn connector_is_free(&self, connector_id: u32) -> bool {
        let Some(connector) = self.connectors.get(connector_id as usize) else {
            return false;
        };
        if connector.id() == 0 || !connector.is_operative() {
            return false;
        }
        match connector.tx_nr().and_then(|nr| self.store.get(connector_id, nr)) {
            Some(tx) => !(tx.is_preparing() || tx.is_running()),
            None => true,
        }
    }

    /// First connector able to take a new session, for RemoteStartTransaction
    /// without an explicit connectorId.
    pub fn first_free_connector(&self) -> Option<u32> {
        (1..self.connectors.len() as u32).find(|&cid| self.connector_is_free(cid))
    }

    // ------------------------------------------------------------------
    // Poll
    // ------------------------------------------------------------------

    /// Runs the boot scheduler, each connector state machine once, and the
    /// transaction RPC sync pass.
    pub fn poll(&mut self, last_call_tick: i64) {
        let now_tick = self.clock.ticks();
        self.boot.poll(now_tick, last_call_tick, &mut self.outgoing);

        let connection_timeout_s =
            self.config.get_int("ConnectionTimeOut").unwrap_or(30).max(0) as i64;
        let minimum_status_duration_s =
            self.config.get_int("MinimumStatusDuration").unwrap_or(0).max(0) as i64;
        let meter_sample_interval_s =
            self.config.get_int("MeterValueSampleInterval").unwrap_or(0) as i64;

        let Model { clock, store, connectors, outgoing, .. } = self;
        let mut env = ConnectorEnv {
            clock,
            store,
            ops: outgoing,
            connection_timeout_s,
            minimum_status_duration_s,
            meter_sample_interval_s,
        };
        for connector in connectors.iter_mut() {
            connector.poll(&mut env);
        }

        self.sync_transactions();
    }

    /// Offers every unacknowledged transaction RPC to the outbox. The engine
    /// de-duplicates by key, so this is idempotent per poll; it is also what
    /// resumes persisted records after a reboot or timeout.
    fn sync_transactions(&mut self) {
        let mut ops = Vec::new();
        self.store.for_each(|tx| {
            if tx.silent {
                return;
            }
            if tx.start.rpc.requested && !tx.start.rpc.confirmed {
                ops.push(OpRequest::StartTx { connector_id: tx.connector_id, tx_nr: tx.tx_nr });
            }
            if tx.start.rpc.requested && tx.stop.rpc.requested && !tx.stop.rpc.confirmed {
                ops.push(OpRequest::StopTx { connector_id: tx.connector_id, tx_nr: tx.tx_nr });
            }
        });
        if !ops.is_empty() {
            debug!(count = ops.len(), "transaction RPCs pending sync");
        }
        self.outgoing.extend(ops);
    }

    /// Pre-boot transactions switch: transaction RPCs (and early status)
    /// may go out before BootNotification was ever accepted.
    pub fn preboot_transactions(&self) -> bool {
        self.config.get_bool("AO_PreBootTransactions").unwrap_or(false)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("connectors", &self.connectors.len())
            .field("boot_accepted", &self.boot.is_accepted())
            .finish_non_exhaustive()
    }
}
