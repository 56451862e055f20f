//! RPC engine: outbox, the one-outstanding-CALL discipline, timeouts, and
//! inbound routing.
//!
//! The OCPP 1.6 JSON profile allows at most one outstanding outbound CALL
//! per connection. Outgoing operations queue in FIFO order; the first entry
//! whose eligibility predicate holds is dispatched once the transport is
//! connected and nothing is in flight. Payloads are built lazily at dispatch
//! so late-arriving data (a clock set after capture, a server-assigned
//! transaction id) lands in the frame. Replies to inbound CALLs bypass the
//! queue and are flushed ahead of it.

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::model::Model;
use crate::rpc::frame::{Call, CallError, CallResult, ErrorCode, Frame, FrameError};
use crate::rpc::registry::OperationRegistry;

/// Identity of an idempotent outbound operation, used to avoid queueing the
/// same logical request twice while one copy is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKey {
    Boot,
    Heartbeat,
    Authorize(u32),
    StartTx(u32, u32),
    StopTx(u32, u32),
    MeterValues(u32),
}

/// Result of building an entry's payload at dispatch time.
pub enum Build {
    /// Frame it and send it.
    Ready(Value),
    /// Not sendable yet; keep the entry queued.
    Defer,
    /// The operation is obsolete; drop the entry.
    Cancel,
}

/// Terminal outcome of an outbound CALL, delivered to its originator.
#[derive(Debug)]
pub enum Outcome {
    /// CALLRESULT payload.
    Result(Value),
    /// CALLERROR from the server.
    Error { code: ErrorCode, description: String, details: Value },
    /// No response within `MessageTimeout`; the request is forgotten.
    Timeout,
}

type BuildFn = Box<dyn FnMut(&mut Model) -> Build>;
type ReadyFn = Box<dyn Fn(&Model) -> bool>;
type OutcomeFn = Box<dyn FnMut(&mut Model, Outcome)>;

/// One queued outbound operation.
pub struct OutboxEntry {
    pub action: String,
    pub key: Option<OpKey>,
    pub build: BuildFn,
    pub ready: ReadyFn,
    pub on_outcome: OutcomeFn,
}

impl OutboxEntry {
    pub fn new(action: impl Into<String>) -> OutboxEntry {
        OutboxEntry {
            action: action.into(),
            key: None,
            build: Box::new(|_| Build::Ready(Value::Object(serde_json::Map::new()))),
            ready: Box::new(|_| true),
            on_outcome: Box::new(|_, _| {}),
        }
    }

    pub fn key(mut self, key: OpKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn build(mut self, f: impl FnMut(&mut Model) -> Build + 'static) -> Self {
        self.build = Box::new(f);
        self
    }

    pub fn ready(mut self, f: impl Fn(&Model) -> bool + 'static) -> Self {
        self.ready = Box::new(f);
        self
    }

    pub fn on_outcome(mut self, f: impl FnMut(&mut Model, Outcome) + 'static) -> Self {
        self.on_outcome = Box::new(f);
        self
    }
}

struct PendingCall {
    unique_id: String,
    action: String,
    key: Option<OpKey>,
    on_outcome: OutcomeFn,
    deadline_tick: i64,
}

pub struct RpcEngine {
    outbox: Vec<OutboxEntry>,
    responses: Vec<String>,
    pending: Option<PendingCall>,
    timeout_s: i64,
    last_call_tick: i64,
}

/// Default `MessageTimeout` in seconds.
pub const DEFAULT_MESSAGE_TIMEOUT_S: i64 = 30;

impl RpcEngine {
    pub fn new() -> RpcEngine {
        RpcEngine {
            outbox: Vec::new(),
            responses: Vec::new(),
            pending: None,
            timeout_s: DEFAULT_MESSAGE_TIMEOUT_S,
            last_call_tick: 0,
        }
    }

    pub fn set_timeout_s(&mut self, timeout_s: i64) {
        self.timeout_s = timeout_s.max(1);
    }

    /// Tick of the most recent outbound CALL; heartbeat scheduling subtracts
    /// this from its interval.
    pub fn last_call_tick(&self) -> i64 {
        self.last_call_tick
    }

    /// True if an operation with this key is queued or in flight.
    pub fn has(&self, key: OpKey) -> bool {
        self.outbox.iter().any(|e| e.key == Some(key))
            || self.pending.as_ref().is_some_and(|p| p.key == Some(key))
    }

    /// Appends an operation; a duplicate key is dropped silently.
    pub fn enqueue(&mut self, entry: OutboxEntry) {
        if let Some(key) = entry.key {
            if self.has(key) {
                return;
            }
        }
        debug!(action = %entry.action, "operation queued");
        self.outbox.push(entry);
    }

    /// Removes a not-yet-dispatched operation. In-flight requests cannot be
    /// cancelled; they can only time out.
    pub fn cancel(&mut self, key: OpKey) {
        self.outbox.retain(|e| e.key != Some(key));
    }

    /// Routes one received text frame.
    pub fn handle_text(
        &mut self,
        model: &mut Model,
        registry: &mut OperationRegistry,
        text: &str,
    ) {
        match Frame::parse(text) {
            Ok(frame) => self.handle_frame(model, registry, frame),
            Err(FrameError::Json(err)) => {
                // no unique id to attribute the error to; log and drop
                warn!(%err, "unparseable frame dropped");
            }
            Err(err) => {
                warn!(%err, "malformed frame");
                let code = match err {
                    FrameError::UnknownMessageType(_) => ErrorCode::ProtocolError,
                    _ => ErrorCode::FormationViolation,
                };
                match recover_unique_id(text) {
                    Some(uid) => {
                        self.responses.push(CallError::new(uid, code, err.to_string()).to_frame());
                    }
                    None => warn!("frame carries no unique id; dropped"),
                }
            }
        }
    }

    fn handle_frame(&mut self, model: &mut Model, registry: &mut OperationRegistry, frame: Frame) {
        match frame {
            Frame::Call(call) => self.handle_inbound_call(model, registry, call),
            Frame::CallResult(result) => {
                let Some(pending) = self.take_matching(&result.unique_id) else {
                    warn!(uid = %result.unique_id, "CALLRESULT without matching request");
                    return;
                };
                debug!(action = %pending.action, "request confirmed");
                registry.notify_conf(&pending.action, &result.payload);
                let mut on_outcome = pending.on_outcome;
                on_outcome(model, Outcome::Result(result.payload));
            }
            Frame::CallError(error) => {
                let Some(pending) = self.take_matching(&error.unique_id) else {
                    warn!(uid = %error.unique_id, "CALLERROR without matching request");
                    return;
                };
                info!(
                    action = %pending.action,
                    code = %error.code,
                    description = %error.description,
                    "request rejected by server"
                );
                let mut on_outcome = pending.on_outcome;
                on_outcome(
                    model,
                    Outcome::Error {
                        code: error.code,
                        description: error.description,
                        details: error.details,
                    },
                );
            }
        }
    }

    fn take_matching(&mut self, unique_id: &str) -> Option<PendingCall> {
        if self.pending.as_ref().is_some_and(|p| p.unique_id == unique_id) {
            self.pending.take()
        } else {
            None
        }
    }

    fn handle_inbound_call(
        &mut self,
        model: &mut Model,
        registry: &mut OperationRegistry,
        call: Call,
    ) {
        let reply = match registry.handle_call(model, &call.action, &call.payload) {
            Ok(payload) => CallResult { unique_id: call.unique_id, payload }.to_frame(),
            Err(err) => {
                CallError::new(call.unique_id, err.code, err.description).to_frame()
            }
        };
        self.responses.push(reply);
    }

    /// Fails the in-flight request locally once its deadline passes.
    pub fn check_timeout(&mut self, model: &mut Model, now_tick: i64) {
        let expired = self.pending.as_ref().is_some_and(|p| now_tick >= p.deadline_tick);
        if expired {
            if let Some(pending) = self.pending.take() {
                warn!(action = %pending.action, "request timed out; dropped locally");
                let mut on_outcome = pending.on_outcome;
                on_outcome(model, Outcome::Timeout);
            }
        }
    }

    /// Flushes queued responses, then dispatches at most one new CALL.
    pub fn dispatch(&mut self, model: &mut Model, conn: &mut dyn Connection, now_tick: i64) {
        if !conn.is_connected() {
            return;
        }

        while let Some(reply) = self.responses.first() {
            if !conn.try_send(reply) {
                return;
            }
            self.responses.remove(0);
        }

        if self.pending.is_some() {
            return;
        }

        // strict FIFO modulo the eligibility filter: ineligible entries are
        // skipped, not reordered
        let mut idx = 0;
        while idx < self.outbox.len() {
            if !(self.outbox[idx].ready)(model) {
                idx += 1;
                continue;
            }
            match (self.outbox[idx].build)(model) {
                Build::Defer => {
                    idx += 1;
                    continue;
                }
                Build::Cancel => {
                    self.outbox.remove(idx);
                    continue;
                }
                Build::Ready(payload) => {
                    let entry = self.outbox.remove(idx);
                    let unique_id = Uuid::new_v4().to_string();
                    let frame = Call {
                        unique_id: unique_id.clone(),
                        action: entry.action.clone(),
                        payload,
                    }
                    .to_frame();
                    if !conn.try_send(&frame) {
                        // transport refused; retry the whole entry later
                        self.outbox.insert(idx, entry);
                        return;
                    }
                    debug!(action = %entry.action, uid = %unique_id, "CALL dispatched");
                    self.last_call_tick = now_tick;
                    self.pending = Some(PendingCall {
                        unique_id,
                        action: entry.action,
                        key: entry.key,
                        on_outcome: entry.on_outcome,
                        deadline_tick: now_tick + self.timeout_s,
                    });
                    return;
                }
            }
        }
    }
}

impl Default for RpcEngine {
    fn default() -> Self {
        RpcEngine::new()
    }
}

/// Pulls the unique id out of a structurally broken frame so the error can
/// still be attributed.
fn recover_unique_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get(1)?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackConnection;
    use std::cell::Cell;
    use std::rc::Rc;

    fn model() -> Model {
        Model::for_tests()
    }

    #[test]
    fn dispatches_one_call_per_poll() {
        let mut engine = RpcEngine::new();
        let mut conn = LoopbackConnection::new();
        let mut model = model();

        engine.enqueue(OutboxEntry::new("Heartbeat"));
        engine.enqueue(OutboxEntry::new("Heartbeat"));
        engine.dispatch(&mut model, &mut conn, 0);

        let mut handle = conn.clone();
        assert!(handle.try_recv().is_some());
        assert!(handle.try_recv().is_none());
    }

    #[test]
    fn matching_result_completes_the_request() {
        let mut engine = RpcEngine::new();
        let mut registry = OperationRegistry::new();
        let mut conn = LoopbackConnection::new();
        let mut model = model();

        let confirmed = Rc::new(Cell::new(false));
        let flag = confirmed.clone();
        engine.enqueue(OutboxEntry::new("Heartbeat").on_outcome(move |_, outcome| {
            flag.set(matches!(outcome, Outcome::Result(_)));
        }));
        engine.dispatch(&mut model, &mut conn, 0);

        let sent = conn.clone().try_recv().unwrap();
        let uid = match Frame::parse(&sent).unwrap() {
            Frame::Call(c) => c.unique_id,
            other => panic!("expected CALL, got {other:?}"),
        };
        engine.handle_text(
            &mut model,
            &mut registry,
            &CallResult { unique_id: uid, payload: serde_json::json!({}) }.to_frame(),
        );
        assert!(confirmed.get());

        // slot is free again
        engine.enqueue(OutboxEntry::new("Heartbeat"));
        engine.dispatch(&mut model, &mut conn, 1);
        assert!(conn.clone().try_recv().is_some());
    }

    #[test]
    fn timeout_delivers_local_error() {
        let mut engine = RpcEngine::new();
        let mut conn = LoopbackConnection::new();
        let mut model = model();

        let timed_out = Rc::new(Cell::new(false));
        let flag = timed_out.clone();
        engine.enqueue(OutboxEntry::new("Authorize").on_outcome(move |_, outcome| {
            flag.set(matches!(outcome, Outcome::Timeout));
        }));
        engine.dispatch(&mut model, &mut conn, 0);

        engine.check_timeout(&mut model, DEFAULT_MESSAGE_TIMEOUT_S - 1);
        assert!(!timed_out.get());
        engine.check_timeout(&mut model, DEFAULT_MESSAGE_TIMEOUT_S);
        assert!(timed_out.get());
    }

    #[test]
    fn ineligible_head_is_skipped_not_reordered() {
        let mut engine = RpcEngine::new();
        let mut conn = LoopbackConnection::new();
        let mut model = model();

        engine.enqueue(OutboxEntry::new("StartTransaction").ready(|_| false));
        engine.enqueue(OutboxEntry::new("Heartbeat"));
        engine.dispatch(&mut model, &mut conn, 0);

        let sent = conn.clone().try_recv().unwrap();
        match Frame::parse(&sent).unwrap() {
            Frame::Call(c) => assert_eq!(c.action, "Heartbeat"),
            other => panic!("expected CALL, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_keys_queue_once() {
        let mut engine = RpcEngine::new();
        engine.enqueue(OutboxEntry::new("StartTransaction").key(OpKey::StartTx(1, 0)));
        engine.enqueue(OutboxEntry::new("StartTransaction").key(OpKey::StartTx(1, 0)));
        assert!(engine.has(OpKey::StartTx(1, 0)));
        assert_eq!(engine.outbox.len(), 1);
    }

    #[test]
    fn inbound_call_without_handler_yields_call_error() {
        let mut engine = RpcEngine::new();
        let mut registry = OperationRegistry::new();
        let mut conn = LoopbackConnection::new();
        let mut model = model();

        engine.handle_text(
            &mut model,
            &mut registry,
            r#"[2, "srv-1", "DataTransfer", {}]"#,
        );
        engine.dispatch(&mut model, &mut conn, 0);

        let reply = conn.clone().try_recv().unwrap();
        match Frame::parse(&reply).unwrap() {
            Frame::CallError(e) => {
                assert_eq!(e.unique_id, "srv-1");
                assert_eq!(e.code, ErrorCode::NotImplemented);
            }
            other => panic!("expected CALLERROR, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frame_with_uid_gets_formation_violation() {
        let mut engine = RpcEngine::new();
        let mut registry = OperationRegistry::new();
        let mut conn = LoopbackConnection::new();
        let mut model = model();

        engine.handle_text(&mut model, &mut registry, r#"[2, "bad-1", "TooShort"]"#);
        engine.dispatch(&mut model, &mut conn, 0);

        let reply = conn.clone().try_recv().unwrap();
        match Frame::parse(&reply).unwrap() {
            Frame::CallError(e) => {
                assert_eq!(e.unique_id, "bad-1");
                assert_eq!(e.code, ErrorCode::FormationViolation);
            }
            other => panic!("expected CALLERROR, got {other:?}"),
        }
    }

    #[test]
    fn nothing_is_sent_while_disconnected() {
        let mut engine = RpcEngine::new();
        let mut conn = LoopbackConnection::new();
        conn.set_connected(false);
        let mut model = model();

        engine.enqueue(OutboxEntry::new("BootNotification"));
        engine.dispatch(&mut model, &mut conn, 0);
        conn.set_connected(true);
        assert!(conn.clone().try_recv().is_none());

        engine.dispatch(&mut model, &mut conn, 1);
        assert!(conn.clone().try_recv().is_some());
    }
}
