//! Transaction records: the client-side view of one charging session.
//!
//! A transaction is initiated at the charge point and processed by the
//! central system. The `session` part is what the user did locally, the
//! `start`/`stop` parts track the StartTransaction / StopTransaction RPC
//! exchange plus the client data sent with each. Records serialize to one
//! blob per store slot.
//!
//! Timestamps captured before the wall clock is known hold
//! [`Timestamp::MIN`] plus an in-memory capture tick (never persisted); the
//! wall time is reconstructed when the clock arrives. A record whose
//! `start` timestamp is still unresolved is deliberately not persistable —
//! after a reboot the tick base is gone, the timestamp cannot ever be
//! recovered, and the transaction is recovered as aborted instead.

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

/// Maximum idTag length per OCPP 1.6 (CiString20).
pub const ID_TAG_MAX_LEN: usize = 20;

/// Maximum stop-reason length.
pub const REASON_MAX_LEN: usize = 20;

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}

/// Request/confirm bookkeeping of one RPC leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcSync {
    pub requested: bool,
    pub confirmed: bool,
}

impl RpcSync {
    pub fn is_completed(&self) -> bool {
        self.requested && self.confirmed
    }
}

/// What the user did at the charge point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPart {
    pub id_tag: String,
    pub authorized: bool,
    /// Set when the server revoked a local authorization.
    pub deauthorized: bool,
    pub timestamp: Timestamp,
    /// true: session in progress. The transition true → false happens exactly
    /// once; before StartTransaction it aborts the record, afterwards it ends
    /// the charging period.
    pub active: bool,
}

impl Default for SessionPart {
    fn default() -> Self {
        SessionPart {
            id_tag: String::new(),
            authorized: false,
            deauthorized: false,
            timestamp: Timestamp::MIN,
            active: true,
        }
    }
}

/// StartTransaction leg: RPC state, client-side data, server-assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartPart {
    pub rpc: RpcSync,
    pub timestamp: Timestamp,
    pub meter: i32,
    pub reservation_id: i32,
    /// Assigned by the server; only meaningful once `rpc.confirmed`.
    pub transaction_id: i32,
}

impl Default for StartPart {
    fn default() -> Self {
        StartPart {
            rpc: RpcSync::default(),
            timestamp: Timestamp::MIN,
            meter: -1,
            reservation_id: -1,
            transaction_id: -1,
        }
    }
}

/// StopTransaction leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopPart {
    pub rpc: RpcSync,
    pub id_tag: String,
    pub timestamp: Timestamp,
    pub meter: i32,
    pub reason: String,
}

impl Default for StopPart {
    fn default() -> Self {
        StopPart {
            rpc: RpcSync::default(),
            id_tag: String::new(),
            timestamp: Timestamp::MIN,
            meter: -1,
            reason: String::new(),
        }
    }
}

/// One transaction record, owned by its store slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub connector_id: u32,
    pub tx_nr: u32,
    /// Silent transactions are processed locally only; start/stop are never
    /// put on the wire and no server transactionId is expected.
    pub silent: bool,

    pub session: SessionPart,
    pub start: StartPart,
    pub stop: StopPart,

    /// Capture ticks for timestamps taken before the clock was set. Memory
    /// only: a reboot legitimately loses them.
    #[serde(skip)]
    pub session_tick: Option<i64>,
    #[serde(skip)]
    pub start_tick: Option<i64>,
    #[serde(skip)]
    pub stop_tick: Option<i64>,
}

impl Transaction {
    pub fn new(connector_id: u32, tx_nr: u32, silent: bool) -> Transaction {
        Transaction {
            connector_id,
            tx_nr,
            silent,
            session: SessionPart::default(),
            start: StartPart::default(),
            stop: StopPart::default(),
            session_tick: None,
            start_tick: None,
            stop_tick: None,
        }
    }

    pub fn set_id_tag(&mut self, id_tag: &str) {
        self.session.id_tag = clip(id_tag, ID_TAG_MAX_LEN);
    }

    pub fn set_stop_reason(&mut self, reason: &str) {
        self.stop.reason = clip(reason, REASON_MAX_LEN);
    }

    /// Ends the session half. Safe to call repeatedly; only the first call
    /// flips the flag.
    pub fn end_session(&mut self) {
        self.session.active = false;
    }

    // Derived predicates; the four states below partition a record's life.

    /// Session begun, StartTransaction not yet initiated.
    pub fn is_preparing(&self) -> bool {
        self.session.active && !self.start.rpc.requested
    }

    /// StartTransaction initiated, StopTransaction not yet initiated.
    pub fn is_running(&self) -> bool {
        self.start.rpc.requested && !self.stop.rpc.requested
    }

    /// Session ended before StartTransaction was ever initiated.
    pub fn is_aborted(&self) -> bool {
        !self.start.rpc.requested && !self.session.active
    }

    /// StopTransaction acknowledged by the server; the record is history.
    pub fn is_completed(&self) -> bool {
        self.stop.rpc.is_completed()
    }

    pub fn is_active(&self) -> bool {
        self.session.active
    }

    /// Completed and aborted records may be reclaimed by the store.
    pub fn is_reclaimable(&self) -> bool {
        self.is_completed() || self.is_aborted()
    }

    /// A record may be persisted unless its start timestamp is still the
    /// unresolved sentinel: such a record must not survive a reboot.
    pub fn is_persistable(&self) -> bool {
        !(self.start.rpc.requested && self.start.timestamp.is_deferred())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_preparing() {
        let tx = Transaction::new(1, 0, false);
        assert!(tx.is_preparing());
        assert!(!tx.is_running());
        assert!(!tx.is_aborted());
        assert!(!tx.is_completed());
    }

    #[test]
    fn lifecycle_predicates() {
        let mut tx = Transaction::new(1, 0, false);

        tx.start.rpc.requested = true;
        assert!(tx.is_running());
        assert!(!tx.is_preparing());

        tx.end_session();
        tx.stop.rpc.requested = true;
        assert!(!tx.is_running());
        assert!(!tx.is_completed());

        tx.start.rpc.confirmed = true;
        tx.stop.rpc.confirmed = true;
        assert!(tx.is_completed());
        assert!(tx.is_reclaimable());
    }

    #[test]
    fn abort_before_start() {
        let mut tx = Transaction::new(1, 3, false);
        tx.end_session();
        assert!(tx.is_aborted());
        assert!(tx.is_reclaimable());
    }

    #[test]
    fn id_tag_and_reason_are_clipped() {
        let mut tx = Transaction::new(1, 0, false);
        tx.set_id_tag("0123456789012345678901234");
        assert_eq!(tx.session.id_tag.len(), ID_TAG_MAX_LEN);
        tx.set_stop_reason("anextremelyverbosestopreason");
        assert_eq!(tx.stop.reason.len(), REASON_MAX_LEN);
    }

    #[test]
    fn predicates_survive_serde_round_trip() {
        let mut tx = Transaction::new(1, 5, false);
        tx.set_id_tag("mIdTag");
        tx.start.rpc.requested = true;
        tx.start.rpc.confirmed = true;
        tx.start.timestamp = Timestamp::parse("2023-02-01T00:00:00Z").unwrap();
        tx.start.meter = 42;
        tx.start.transaction_id = 1000;

        let blob = serde_json::to_vec(&tx).unwrap();
        let back: Transaction = serde_json::from_slice(&blob).unwrap();

        assert_eq!(back.is_preparing(), tx.is_preparing());
        assert_eq!(back.is_running(), tx.is_running());
        assert_eq!(back.is_aborted(), tx.is_aborted());
        assert_eq!(back.is_completed(), tx.is_completed());
        assert_eq!(back.start.transaction_id, 1000);
        // capture ticks are memory-only
        assert!(back.start_tick.is_none());
    }

    #[test]
    fn deferred_start_timestamp_blocks_persistence() {
        let mut tx = Transaction::new(1, 0, false);
        assert!(tx.is_persistable());

        tx.start.rpc.requested = true;
        tx.start_tick = Some(120);
        assert!(!tx.is_persistable());

        tx.start.timestamp = Timestamp::parse("2023-01-01T00:00:00Z").unwrap();
        assert!(tx.is_persistable());
    }
}
