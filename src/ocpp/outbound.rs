//! Outbound operation builders: turn an [`OpRequest`] into an outbox entry.
//!
//! Payloads are built when the entry is dispatched, not when it is queued:
//! a transaction RPC re-resolves its record by (connector, txNr) and a
//! timestamp captured before the clock was set is reconstructed as late as
//! possible. Eligibility predicates implement the boot holdback: before
//! BootNotification is accepted only the boot itself — and, under
//! `AO_PreBootTransactions`, transaction RPCs and status — may go out.

use serde::Serialize;
use tracing::{debug, warn};

use crate::model::{Model, OpRequest};
use crate::ocpp::types::*;
use crate::rpc::engine::{Build, OpKey, Outcome, OutboxEntry};

fn payload<T: Serialize>(req: &T) -> Build {
    match serde_json::to_value(req) {
        Ok(value) => Build::Ready(value),
        Err(err) => {
            warn!(%err, "request serialization failed; operation dropped");
            Build::Cancel
        }
    }
}

fn preboot_eligible(model: &Model) -> bool {
    model.boot.is_accepted() || model.preboot_transactions()
}

/// Maps one collected operation request onto an outbox entry.
pub fn entry_for(op: OpRequest) -> OutboxEntry {
    match op {
        OpRequest::Boot => boot_entry(),
        OpRequest::Heartbeat => heartbeat_entry(),
        OpRequest::Authorize { connector_id, id_tag } => authorize_entry(connector_id, id_tag),
        OpRequest::StartTx { connector_id, tx_nr } => start_tx_entry(connector_id, tx_nr),
        OpRequest::StopTx { connector_id, tx_nr } => stop_tx_entry(connector_id, tx_nr),
        OpRequest::Status { connector_id, status, tick } => {
            status_entry(connector_id, status, tick)
        }
        OpRequest::MeterValues { connector_id, transaction_id, energy_wh, tick } => {
            meter_values_entry(connector_id, transaction_id, energy_wh, tick)
        }
    }
}

fn boot_entry() -> OutboxEntry {
    OutboxEntry::new("BootNotification")
        .key(OpKey::Boot)
        .build(|model| {
            let c = &model.credentials;
            payload(&BootNotificationRequest {
                charge_point_model: c.charge_point_model.clone(),
                charge_point_vendor: c.charge_point_vendor.clone(),
                charge_point_serial_number: c.charge_point_serial_number.clone(),
                charge_box_serial_number: c.charge_box_serial_number.clone(),
                firmware_version: c.firmware_version.clone(),
                meter_serial_number: c.meter_serial_number.clone(),
                meter_type: c.meter_type.clone(),
            })
        })
        .on_outcome(|model, outcome| {
            let now_tick = model.clock.ticks();
            match outcome {
                Outcome::Result(value) => {
                    match serde_json::from_value::<BootNotificationResponse>(value) {
                        Ok(conf) => {
                            model.clock.set_timestamp(conf.current_time);
                            match conf.status {
                                RegistrationStatus::Accepted => {
                                    model.boot.accept(conf.interval as i64);
                                    if conf.interval > 0 {
                                        if let Some(h) = model.config.handle("HeartbeatInterval")
                                        {
                                            h.set_int(conf.interval);
                                        }
                                    }
                                }
                                RegistrationStatus::Pending | RegistrationStatus::Rejected => {
                                    model.boot.defer_retry(now_tick, conf.interval as i64);
                                }
                            }
                        }
                        Err(err) => {
                            warn!(%err, "BootNotification confirmation unreadable");
                            model.boot.defer_retry(now_tick, 0);
                        }
                    }
                }
                Outcome::Error { .. } | Outcome::Timeout => {
                    model.boot.defer_retry(now_tick, 0);
                }
            }
        })
}

fn heartbeat_entry() -> OutboxEntry {
    OutboxEntry::new("Heartbeat")
        .key(OpKey::Heartbeat)
        .ready(|model| model.boot.is_accepted())
        .build(|_| payload(&HeartbeatRequest {}))
        .on_outcome(|model, outcome| {
            if let Outcome::Result(value) = outcome {
                match serde_json::from_value::<HeartbeatResponse>(value) {
                    Ok(conf) => model.clock.set_timestamp(conf.current_time),
                    Err(err) => warn!(%err, "Heartbeat confirmation unreadable"),
                }
            }
        })
}

fn authorize_entry(connector_id: u32, id_tag: String) -> OutboxEntry {
    let build_tag = id_tag.clone();
    let outcome_tag = id_tag;
    OutboxEntry::new("Authorize")
        .key(OpKey::Authorize(connector_id))
        .ready(|model| model.boot.is_accepted())
        .build(move |model| {
            // the session may have timed out or been replaced meanwhile
            let live = model
                .connector(connector_id)
                .and_then(|c| c.tx_nr())
                .and_then(|nr| model.store.get(connector_id, nr))
                .map(|tx| tx.is_preparing() && tx.is_active() && tx.session.id_tag == build_tag)
                .unwrap_or(false);
            if !live {
                debug!(connector_id, "authorization obsolete; dropped");
                return Build::Cancel;
            }
            payload(&AuthorizeRequest { id_tag: build_tag.clone() })
        })
        .on_outcome(move |model, outcome| {
            let accepted = match outcome {
                Outcome::Result(value) => {
                    match serde_json::from_value::<AuthorizeResponse>(value) {
                        Ok(conf) => {
                            let ok = conf.id_tag_info.status == AuthorizationStatus::Accepted;
                            model.auth_cache.insert(&outcome_tag, conf.id_tag_info);
                            ok
                        }
                        Err(err) => {
                            warn!(%err, "Authorize confirmation unreadable");
                            false
                        }
                    }
                }
                Outcome::Error { .. } | Outcome::Timeout => false,
            };
            let Some(nr) = model.connector(connector_id).and_then(|c| c.tx_nr()) else {
                return;
            };
            let Some(tx) = model.store.get_mut(connector_id, nr) else { return };
            if !(tx.is_preparing() && tx.is_active() && tx.session.id_tag == outcome_tag) {
                return;
            }
            if accepted {
                tx.session.authorized = true;
            } else {
                debug!(connector_id, "authorization failed; session aborted");
                tx.session.deauthorized = true;
                tx.end_session();
            }
            model.store.commit(connector_id, nr);
        })
}

fn start_tx_entry(connector_id: u32, tx_nr: u32) -> OutboxEntry {
    OutboxEntry::new("StartTransaction")
        .key(OpKey::StartTx(connector_id, tx_nr))
        .ready(preboot_eligible)
        .build(move |model| {
            let Some(tx) = model.store.get(connector_id, tx_nr) else {
                return Build::Cancel;
            };
            if !tx.start.rpc.requested || tx.start.rpc.confirmed || tx.silent {
                return Build::Cancel;
            }
            if tx.start.timestamp.is_deferred() {
                let resolved = tx.start_tick.and_then(|t| model.clock.resolve(t));
                match resolved {
                    Some(ts) => {
                        if let Some(tx) = model.store.get_mut(connector_id, tx_nr) {
                            tx.start.timestamp = ts;
                        }
                        model.store.commit(connector_id, tx_nr);
                    }
                    // clock still unknown: hold the request back
                    None => return Build::Defer,
                }
            }
            let Some(tx) = model.store.get(connector_id, tx_nr) else {
                return Build::Cancel;
            };
            payload(&StartTransactionRequest {
                connector_id,
                id_tag: tx.session.id_tag.clone(),
                meter_start: tx.start.meter.max(0),
                reservation_id: (tx.start.reservation_id >= 0)
                    .then_some(tx.start.reservation_id),
                timestamp: tx.start.timestamp,
            })
        })
        .on_outcome(move |model, outcome| {
            let Outcome::Result(value) = outcome else {
                // timeout or server error: the sync pass retries from the
                // persistent record
                return;
            };
            let conf = match serde_json::from_value::<StartTransactionResponse>(value) {
                Ok(conf) => conf,
                Err(err) => {
                    warn!(%err, "StartTransaction confirmation unreadable");
                    return;
                }
            };
            let deauthorized = conf.id_tag_info.status != AuthorizationStatus::Accepted;
            let Some(tx) = model.store.get_mut(connector_id, tx_nr) else { return };
            tx.start.rpc.confirmed = true;
            tx.start.transaction_id = conf.transaction_id;
            let id_tag = tx.session.id_tag.clone();
            if deauthorized {
                warn!(connector_id, tx_nr, "server deauthorized the running transaction");
                tx.session.deauthorized = true;
            }
            model.auth_cache.insert(&id_tag, conf.id_tag_info);
            model.store.commit(connector_id, tx_nr);
        })
}

fn stop_tx_entry(connector_id: u32, tx_nr: u32) -> OutboxEntry {
    OutboxEntry::new("StopTransaction")
        .key(OpKey::StopTx(connector_id, tx_nr))
        // StartTransaction must be acknowledged before StopTransaction goes
        // out; this is what keeps the two ordered across retries
        .ready(move |model| {
            preboot_eligible(model)
                && model
                    .store
                    .get(connector_id, tx_nr)
                    .map(|tx| tx.start.rpc.confirmed)
                    .unwrap_or(false)
        })
        .build(move |model| {
            let Some(tx) = model.store.get(connector_id, tx_nr) else {
                return Build::Cancel;
            };
            if !tx.stop.rpc.requested || tx.stop.rpc.confirmed || tx.silent {
                return Build::Cancel;
            }
            if tx.stop.timestamp.is_deferred() {
                let resolved = tx.stop_tick.and_then(|t| model.clock.resolve(t));
                let fallback = (tx.stop_tick.is_none()
                    && !tx.start.timestamp.is_deferred())
                .then(|| tx.start.timestamp + 1);
                match resolved.or(fallback) {
                    Some(ts) => {
                        if let Some(tx) = model.store.get_mut(connector_id, tx_nr) {
                            tx.stop.timestamp = ts;
                        }
                        model.store.commit(connector_id, tx_nr);
                    }
                    None => return Build::Defer,
                }
            }
            let Some(tx) = model.store.get(connector_id, tx_nr) else {
                return Build::Cancel;
            };
            payload(&StopTransactionRequest {
                id_tag: (!tx.stop.id_tag.is_empty()).then(|| tx.stop.id_tag.clone()),
                meter_stop: tx.stop.meter.max(0),
                timestamp: tx.stop.timestamp,
                transaction_id: tx.start.transaction_id,
                reason: (!tx.stop.reason.is_empty()).then(|| tx.stop.reason.clone()),
            })
        })
        .on_outcome(move |model, outcome| {
            let Outcome::Result(value) = outcome else { return };
            if let Ok(conf) = serde_json::from_value::<StopTransactionResponse>(value) {
                let id_tag = model
                    .store
                    .get(connector_id, tx_nr)
                    .map(|tx| tx.stop.id_tag.clone())
                    .unwrap_or_default();
                if let (Some(info), false) = (conf.id_tag_info, id_tag.is_empty()) {
                    model.auth_cache.insert(&id_tag, info);
                }
            }
            let Some(tx) = model.store.get_mut(connector_id, tx_nr) else { return };
            tx.stop.rpc.confirmed = true;
            model.store.commit(connector_id, tx_nr);
            model.store.reclaim(connector_id);
        })
}

fn status_entry(connector_id: u32, status: ChargePointStatus, tick: i64) -> OutboxEntry {
    OutboxEntry::new("StatusNotification")
        .ready(preboot_eligible)
        .build(move |model| {
            // timestamp of first observation, back-dated if the clock only
            // became known afterwards; omitted if it never did
            let timestamp = model.clock.resolve(tick);
            let error_code = if status == ChargePointStatus::Faulted {
                ChargePointErrorCode::OtherError
            } else {
                ChargePointErrorCode::NoError
            };
            payload(&StatusNotificationRequest {
                connector_id,
                error_code,
                status,
                timestamp,
                info: None,
            })
        })
}

fn meter_values_entry(
    connector_id: u32,
    transaction_id: Option<i32>,
    energy_wh: i32,
    tick: i64,
) -> OutboxEntry {
    OutboxEntry::new("MeterValues")
        .key(OpKey::MeterValues(connector_id))
        .ready(|model| model.boot.is_accepted())
        .build(move |model| {
            let Some(timestamp) = model.clock.resolve(tick) else {
                return Build::Cancel;
            };
            payload(&MeterValuesRequest {
                connector_id,
                transaction_id,
                meter_value: vec![MeterValue {
                    timestamp,
                    sampled_value: vec![SampledValue {
                        value: energy_wh.to_string(),
                        context: Some("Sample.Periodic".to_string()),
                        measurand: Some("Energy.Active.Import.Register".to_string()),
                        unit: Some("Wh".to_string()),
                    }],
                }],
            })
        })
}
