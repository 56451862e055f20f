//! Inbound operation handlers.
//!
//! [`register_core_operations`] installs the Core + RemoteTrigger profile
//! handlers for server-initiated CALLs, plus server-mode handlers for
//! Authorize, StartTransaction, StatusNotification and StopTransaction.
//! The latter let the library answer its own requests when connected to a
//! websocket echo server — mocking a central system on the same device,
//! which keeps integration tests self-contained.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::model::Model;
use crate::ocpp::types::*;
use crate::rpc::registry::{OperationError, OperationRegistry};

fn parse<T: DeserializeOwned>(payload: &Value) -> Result<T, OperationError> {
    serde_json::from_value(payload.clone()).map_err(OperationError::invalid_payload)
}

fn respond<T: Serialize>(conf: &T) -> Result<Value, OperationError> {
    serde_json::to_value(conf).map_err(|err| OperationError::internal(err.to_string()))
}

/// Installs all built-in handlers.
pub fn register_core_operations(registry: &mut OperationRegistry) {
    register_server_initiated(registry);
    register_echo_mode(registry);
}

fn register_server_initiated(registry: &mut OperationRegistry) {
    registry.register(
        "ChangeAvailability",
        Box::new(|model, payload| {
            let req: ChangeAvailabilityRequest = parse(payload)?;
            let operative = req.kind == AvailabilityType::Operative;
            let status = model.change_availability(req.connector_id, operative);
            respond(&ChangeAvailabilityResponse { status })
        }),
    );

    registry.register(
        "ChangeConfiguration",
        Box::new(|model, payload| {
            let req: ChangeConfigurationRequest = parse(payload)?;
            let status = match model.config.set_from_string(&req.key, &req.value) {
                crate::config::SetOutcome::Accepted => ConfigurationStatus::Accepted,
                crate::config::SetOutcome::RebootRequired => ConfigurationStatus::RebootRequired,
                crate::config::SetOutcome::Rejected => ConfigurationStatus::Rejected,
                crate::config::SetOutcome::NotSupported => ConfigurationStatus::NotSupported,
            };
            info!(key = %req.key, ?status, "ChangeConfiguration handled");
            respond(&ChangeConfigurationResponse { status })
        }),
    );

    registry.register(
        "ClearCache",
        Box::new(|model, _payload| {
            model.auth_cache.clear();
            respond(&ClearCacheResponse { status: ClearCacheStatus::Accepted })
        }),
    );

    registry.register(
        "GetConfiguration",
        Box::new(|model, payload| {
            let req: GetConfigurationRequest = parse(payload)?;
            let filter = req.key.unwrap_or_default();
            let max_keys =
                model.config.get_int("GetConfigurationMaxKeys").unwrap_or(30).max(1) as usize;
            let (mut known, unknown) = model.config.enumerate(&filter);
            known.truncate(max_keys);
            let configuration_key = known
                .into_iter()
                .map(|report| ConfigurationKey {
                    key: report.key,
                    readonly: report.readonly,
                    value: Some(report.value),
                })
                .collect();
            respond(&GetConfigurationResponse { configuration_key, unknown_key: unknown })
        }),
    );

    registry.register(
        "RemoteStartTransaction",
        Box::new(|model, payload| {
            let req: RemoteStartTransactionRequest = parse(payload)?;
            let connector_id = match req.connector_id {
                Some(cid) if cid >= 1 && (cid as usize) < model.connectors.len() => Some(cid),
                Some(_) => None,
                None => model.first_free_connector(),
            };
            let status = match connector_id {
                Some(cid) => {
                    let authorize_first =
                        model.config.get_bool("AuthorizeRemoteTxRequests").unwrap_or(false);
                    let begun = if authorize_first {
                        model.begin_transaction(cid, &req.id_tag)
                    } else {
                        model.begin_transaction_authorized(cid, &req.id_tag)
                    };
                    match begun {
                        Ok(_) => RemoteStartStopStatus::Accepted,
                        Err(err) => {
                            warn!(connector_id = cid, %err, "remote start refused");
                            RemoteStartStopStatus::Rejected
                        }
                    }
                }
                None => RemoteStartStopStatus::Rejected,
            };
            respond(&RemoteStartTransactionResponse { status })
        }),
    );

    registry.register(
        "RemoteStopTransaction",
        Box::new(|model, payload| {
            let req: RemoteStopTransactionRequest = parse(payload)?;
            let target = (1..model.connectors.len() as u32).find(|&cid| {
                model
                    .connector(cid)
                    .and_then(|c| c.tx_nr())
                    .and_then(|nr| model.store.get(cid, nr))
                    .map(|tx| tx.is_running() && tx.start.transaction_id == req.transaction_id)
                    .unwrap_or(false)
            });
            let status = match target {
                Some(cid) if model.end_transaction(cid, Some("Remote")) => {
                    RemoteStartStopStatus::Accepted
                }
                _ => RemoteStartStopStatus::Rejected,
            };
            respond(&RemoteStopTransactionResponse { status })
        }),
    );

    registry.register(
        "Reset",
        Box::new(|model, payload| {
            let req: ResetRequest = parse(payload)?;
            let status = if model.on_reset.is_some() {
                let reason = match req.kind {
                    ResetType::Hard => "HardReset",
                    ResetType::Soft => "SoftReset",
                };
                for cid in 1..model.connectors.len() as u32 {
                    model.end_transaction(cid, Some(reason));
                }
                // the host performs the actual restart
                let mut handler = model.on_reset.take();
                if let Some(f) = handler.as_mut() {
                    f(req.kind);
                }
                model.on_reset = handler;
                info!(kind = ?req.kind, "reset accepted");
                ResetStatus::Accepted
            } else {
                warn!("reset rejected: no reset handler installed");
                ResetStatus::Rejected
            };
            respond(&ResetResponse { status })
        }),
    );

    registry.register(
        "TriggerMessage",
        Box::new(|model, payload| {
            let req: TriggerMessageRequest = parse(payload)?;
            let now_tick = model.clock.ticks();
            let status = match req.requested_message.as_str() {
                "BootNotification" => {
                    model.boot.trigger();
                    model.push_op(crate::model::OpRequest::Boot);
                    TriggerMessageStatus::Accepted
                }
                "Heartbeat" => {
                    model.push_op(crate::model::OpRequest::Heartbeat);
                    TriggerMessageStatus::Accepted
                }
                "StatusNotification" => {
                    let targets: Vec<u32> = match req.connector_id {
                        Some(cid) if (cid as usize) < model.connectors.len() => vec![cid],
                        Some(_) => Vec::new(),
                        None => (0..model.connectors.len() as u32).collect(),
                    };
                    if targets.is_empty() {
                        TriggerMessageStatus::Rejected
                    } else {
                        for cid in targets {
                            let status = model
                                .connector(cid)
                                .map(|c| c.last_status())
                                .unwrap_or(ChargePointStatus::Available);
                            model.push_op(crate::model::OpRequest::Status {
                                connector_id: cid,
                                status,
                                tick: now_tick,
                            });
                        }
                        TriggerMessageStatus::Accepted
                    }
                }
                "MeterValues" => {
                    let cid = req.connector_id.unwrap_or(1);
                    let clock_valid = model.clock.is_valid();
                    let sample = if clock_valid {
                        model.connector_mut(cid).and_then(|c| c.sample_energy())
                    } else {
                        None
                    };
                    match sample {
                        Some(energy_wh) => {
                            let transaction_id = model
                                .connector(cid)
                                .and_then(|c| c.tx_nr())
                                .and_then(|nr| model.store.get(cid, nr))
                                .map(|tx| tx.start.transaction_id)
                                .filter(|id| *id >= 0);
                            model.push_op(crate::model::OpRequest::MeterValues {
                                connector_id: cid,
                                transaction_id,
                                energy_wh,
                                tick: now_tick,
                            });
                            TriggerMessageStatus::Accepted
                        }
                        None => TriggerMessageStatus::Rejected,
                    }
                }
                "DiagnosticsStatusNotification" | "FirmwareStatusNotification" => {
                    TriggerMessageStatus::NotImplemented
                }
                _ => TriggerMessageStatus::NotImplemented,
            };
            respond(&TriggerMessageResponse { status })
        }),
    );

    registry.register(
        "UnlockConnector",
        Box::new(|model, payload| {
            let req: UnlockConnectorRequest = parse(payload)?;
            let cid = req.connector_id;
            let status = if cid >= 1 && (cid as usize) < model.connectors.len() {
                // a locked cable implies a session; end it before unlocking
                model.end_transaction(cid, Some("UnlockCommand"));
                match model.connector_mut(cid).and_then(|c| c.unlock()) {
                    Some(true) => UnlockStatus::Unlocked,
                    Some(false) => UnlockStatus::UnlockFailed,
                    None => UnlockStatus::NotSupported,
                }
            } else {
                UnlockStatus::NotSupported
            };
            respond(&UnlockConnectorResponse { status })
        }),
    );
}

/// Server-mode handlers for the requests this charge point itself sends.
/// Only used when the peer echoes our frames back (see module docs); a real
/// central system would never CALL these actions on a charge point.
fn register_echo_mode(registry: &mut OperationRegistry) {
    registry.register(
        "Authorize",
        Box::new(|_model, payload| {
            let _req: AuthorizeRequest = parse(payload)?;
            respond(&AuthorizeResponse { id_tag_info: IdTagInfo::accepted() })
        }),
    );

    registry.register(
        "StartTransaction",
        Box::new(|model, payload| {
            let _req: StartTransactionRequest = parse(payload)?;
            respond(&StartTransactionResponse {
                id_tag_info: IdTagInfo::accepted(),
                transaction_id: model.next_echo_transaction_id(),
            })
        }),
    );

    registry.register(
        "StopTransaction",
        Box::new(|_model, payload| {
            let _req: StopTransactionRequest = parse(payload)?;
            respond(&StopTransactionResponse { id_tag_info: Some(IdTagInfo::accepted()) })
        }),
    );

    registry.register(
        "StatusNotification",
        Box::new(|_model, payload| {
            let _req: StatusNotificationRequest = parse(payload)?;
            respond(&StatusNotificationResponse {})
        }),
    );
}

/// Server-mode BootNotification, answered from the model clock. Not part of
/// the default registry; tests opt in when they want the echo loop to accept
/// the boot sequence.
pub fn register_boot_notification_echo(registry: &mut OperationRegistry, interval_s: i32) {
    registry.register(
        "BootNotification",
        Box::new(move |model, payload| {
            let _req: BootNotificationRequest = parse(payload)?;
            respond(&BootNotificationResponse {
                current_time: model.clock.now(),
                interval: interval_s,
                status: RegistrationStatus::Accepted,
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;

    fn setup() -> (OperationRegistry, Model) {
        let mut registry = OperationRegistry::new();
        register_core_operations(&mut registry);
        (registry, Model::for_tests())
    }

    #[test]
    fn change_configuration_round_trip() {
        let (mut registry, mut model) = setup();
        let conf = registry
            .handle_call(
                &mut model,
                "ChangeConfiguration",
                &serde_json::json!({"key": "ConnectionTimeOut", "value": "45"}),
            )
            .unwrap();
        assert_eq!(conf["status"], "Accepted");
        assert_eq!(model.config.get_int("ConnectionTimeOut"), Some(45));
    }

    #[test]
    fn change_configuration_readonly_key() {
        let (mut registry, mut model) = setup();
        let conf = registry
            .handle_call(
                &mut model,
                "ChangeConfiguration",
                &serde_json::json!({"key": "SupportedFeatureProfiles", "value": "x"}),
            )
            .unwrap();
        assert_eq!(conf["status"], "Rejected");
    }

    #[test]
    fn get_configuration_reports_unknown_keys() {
        let (mut registry, mut model) = setup();
        let conf = registry
            .handle_call(
                &mut model,
                "GetConfiguration",
                &serde_json::json!({"key": ["ConnectionTimeOut", "Bogus"]}),
            )
            .unwrap();
        assert_eq!(conf["configurationKey"][0]["key"], "ConnectionTimeOut");
        assert_eq!(conf["unknownKey"][0], "Bogus");
    }

    #[test]
    fn remote_start_accepts_and_begins_session() {
        let (mut registry, mut model) = setup();
        let conf = registry
            .handle_call(
                &mut model,
                "RemoteStartTransaction",
                &serde_json::json!({"idTag": "mIdTag"}),
            )
            .unwrap();
        assert_eq!(conf["status"], "Accepted");
        model.poll(0);
        assert!(model.is_transaction_running(1));
    }

    #[test]
    fn remote_start_rejects_busy_connector() {
        let (mut registry, mut model) = setup();
        model.begin_transaction_authorized(1, "first").unwrap();
        let conf = registry
            .handle_call(
                &mut model,
                "RemoteStartTransaction",
                &serde_json::json!({"connectorId": 1, "idTag": "second"}),
            )
            .unwrap();
        assert_eq!(conf["status"], "Rejected");
    }

    #[test]
    fn remote_stop_finds_the_transaction() {
        let (mut registry, mut model) = setup();
        model.begin_transaction_authorized(1, "mIdTag").unwrap();
        model.poll(0);
        model.store.get_mut(1, 0).unwrap().start.transaction_id = 555;

        let conf = registry
            .handle_call(
                &mut model,
                "RemoteStopTransaction",
                &serde_json::json!({"transactionId": 555}),
            )
            .unwrap();
        assert_eq!(conf["status"], "Accepted");
        model.poll(0);
        assert!(!model.is_transaction_running(1));

        let conf = registry
            .handle_call(
                &mut model,
                "RemoteStopTransaction",
                &serde_json::json!({"transactionId": 999}),
            )
            .unwrap();
        assert_eq!(conf["status"], "Rejected");
    }

    #[test]
    fn reset_requires_a_handler() {
        let (mut registry, mut model) = setup();
        let conf = registry
            .handle_call(&mut model, "Reset", &serde_json::json!({"type": "Soft"}))
            .unwrap();
        assert_eq!(conf["status"], "Rejected");

        use std::cell::Cell;
        use std::rc::Rc;
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        model.on_reset = Some(Box::new(move |_| flag.set(true)));
        let conf = registry
            .handle_call(&mut model, "Reset", &serde_json::json!({"type": "Hard"}))
            .unwrap();
        assert_eq!(conf["status"], "Accepted");
        assert!(fired.get());
    }

    #[test]
    fn trigger_message_status_notification() {
        let (mut registry, mut model) = setup();
        let conf = registry
            .handle_call(
                &mut model,
                "TriggerMessage",
                &serde_json::json!({"requestedMessage": "StatusNotification", "connectorId": 1}),
            )
            .unwrap();
        assert_eq!(conf["status"], "Accepted");
        let ops = model.take_outgoing();
        assert!(ops
            .iter()
            .any(|op| matches!(op, crate::model::OpRequest::Status { connector_id: 1, .. })));
    }

    #[test]
    fn trigger_message_unknown_is_not_implemented() {
        let (mut registry, mut model) = setup();
        let conf = registry
            .handle_call(
                &mut model,
                "TriggerMessage",
                &serde_json::json!({"requestedMessage": "SomethingElse"}),
            )
            .unwrap();
        assert_eq!(conf["status"], "NotImplemented");
    }

    #[test]
    fn unlock_connector_without_handler_is_not_supported() {
        let (mut registry, mut model) = setup();
        let conf = registry
            .handle_call(&mut model, "UnlockConnector", &serde_json::json!({"connectorId": 1}))
            .unwrap();
        assert_eq!(conf["status"], "NotSupported");
    }

    #[test]
    fn malformed_payload_is_a_type_violation() {
        let (mut registry, mut model) = setup();
        let err = registry
            .handle_call(
                &mut model,
                "ChangeConfiguration",
                &serde_json::json!({"key": 42}),
            )
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::frame::ErrorCode::TypeConstraintViolation);
    }

    #[test]
    fn echo_start_transaction_assigns_increasing_ids() {
        let (mut registry, mut model) = setup();
        let payload = serde_json::json!({
            "connectorId": 1, "idTag": "mIdTag", "meterStart": 0,
            "timestamp": "2023-01-01T00:00:00.000Z"
        });
        let a = registry.handle_call(&mut model, "StartTransaction", &payload).unwrap();
        let b = registry.handle_call(&mut model, "StartTransaction", &payload).unwrap();
        assert!(b["transactionId"].as_i64() > a["transactionId"].as_i64());
        assert_eq!(a["idTagInfo"]["status"], "Accepted");
    }
}
