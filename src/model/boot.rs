//! Boot and heartbeat scheduling.
//!
//! A BootNotification is queued at initialization and re-queued after an
//! error or a Pending/Rejected answer. Until it is accepted, every other
//! outbound CALL is held back in the outbox unless its eligibility rule says
//! otherwise (transaction RPCs under `AO_PreBootTransactions`). Once
//! accepted, Heartbeats are due whenever no CALL has gone out for the
//! server-provided interval.

use tracing::{debug, info};

use crate::model::OpRequest;

/// Fallback delay before a BootNotification retry, used when the server did
/// not provide an interval.
pub const BOOT_RETRY_DEFAULT_S: i64 = 60;

pub struct BootService {
    accepted: bool,
    retry_at_tick: i64,
    heartbeat_interval_s: i64,
}

impl BootService {
    pub fn new(default_heartbeat_interval_s: i64) -> BootService {
        BootService {
            accepted: false,
            retry_at_tick: 0,
            heartbeat_interval_s: default_heartbeat_interval_s,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn heartbeat_interval_s(&self) -> i64 {
        self.heartbeat_interval_s
    }

    /// Marks the boot as accepted and adopts the server's heartbeat interval
    /// (a non-positive interval keeps the configured default).
    pub fn accept(&mut self, interval_s: i64) {
        self.accepted = true;
        if interval_s > 0 {
            self.heartbeat_interval_s = interval_s;
        }
        info!(heartbeat_interval_s = self.heartbeat_interval_s, "boot accepted");
    }

    /// Schedules the next BootNotification attempt.
    pub fn defer_retry(&mut self, now_tick: i64, interval_s: i64) {
        let delay = if interval_s > 0 { interval_s } else { BOOT_RETRY_DEFAULT_S };
        self.retry_at_tick = now_tick + delay;
        debug!(delay, "boot retry scheduled");
    }

    /// Forces a fresh BootNotification on the next poll (TriggerMessage).
    pub fn trigger(&mut self) {
        self.retry_at_tick = 0;
    }

    pub fn poll(&mut self, now_tick: i64, last_call_tick: i64, ops: &mut Vec<OpRequest>) {
        if !self.accepted {
            if now_tick >= self.retry_at_tick {
                ops.push(OpRequest::Boot);
            }
            return;
        }
        if self.heartbeat_interval_s > 0 && now_tick - last_call_tick >= self.heartbeat_interval_s
        {
            ops.push(OpRequest::Heartbeat);
        }
    }
}
