//! Operation registry: routes inbound CALLs by action name.
//!
//! A handler takes the model plus the request payload and synchronously
//! produces the confirmation payload (or an error code for the CALLERROR).
//! The registry also carries the request/confirmation observers that the
//! integration tests hook into, mirroring the dispatcher of the original
//! charge-point firmware: an observer can be installed for an action that
//! has no handler, in which case the incoming CALL is still observed before
//! being answered with `NotImplemented`.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::model::Model;
use crate::rpc::frame::ErrorCode;

/// Error produced by an inbound handler, framed as CALLERROR by the engine.
#[derive(Debug)]
pub struct OperationError {
    pub code: ErrorCode,
    pub description: String,
}

impl OperationError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> OperationError {
        OperationError { code, description: description.into() }
    }

    pub fn not_implemented(action: &str) -> OperationError {
        OperationError::new(ErrorCode::NotImplemented, format!("no handler for {action}"))
    }

    /// Payload did not deserialize into the expected request type.
    pub fn invalid_payload(err: serde_json::Error) -> OperationError {
        OperationError::new(ErrorCode::TypeConstraintViolation, err.to_string())
    }

    pub fn internal(description: impl Into<String>) -> OperationError {
        OperationError::new(ErrorCode::InternalError, description)
    }
}

pub type Handler = Box<dyn FnMut(&mut Model, &Value) -> Result<Value, OperationError>>;
pub type Observer = Box<dyn FnMut(&Value)>;

#[derive(Default)]
pub struct OperationRegistry {
    handlers: HashMap<String, Handler>,
    on_request: HashMap<String, Observer>,
    on_conf: HashMap<String, Observer>,
}

impl OperationRegistry {
    pub fn new() -> OperationRegistry {
        OperationRegistry::default()
    }

    /// Registers (or replaces) the handler for an action.
    pub fn register(&mut self, action: &str, handler: Handler) {
        if self.handlers.insert(action.to_string(), handler).is_some() {
            debug!(action, "operation handler replaced");
        }
    }

    /// Installs an observer fired with every inbound CALL payload for the
    /// action, before the handler runs.
    pub fn set_on_request(&mut self, action: &str, observer: Observer) {
        self.on_request.insert(action.to_string(), observer);
    }

    /// Installs an observer fired with the CALLRESULT payload of every
    /// outbound CALL for the action.
    pub fn set_on_conf(&mut self, action: &str, observer: Observer) {
        self.on_conf.insert(action.to_string(), observer);
    }

    /// Routes one inbound CALL.
    pub fn handle_call(
        &mut self,
        model: &mut Model,
        action: &str,
        payload: &Value,
    ) -> Result<Value, OperationError> {
        if let Some(observer) = self.on_request.get_mut(action) {
            observer(payload);
        }
        match self.handlers.get_mut(action) {
            Some(handler) => handler(model, payload),
            None => {
                warn!(action, "inbound CALL for unregistered action");
                Err(OperationError::not_implemented(action))
            }
        }
    }

    pub fn notify_conf(&mut self, action: &str, payload: &Value) {
        if let Some(observer) = self.on_conf.get_mut(action) {
            observer(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use std::cell::Cell;
    use std::rc::Rc;

    fn model() -> Model {
        Model::for_tests()
    }

    #[test]
    fn routes_to_registered_handler() {
        let mut reg = OperationRegistry::new();
        reg.register("Heartbeat", Box::new(|_, _| Ok(serde_json::json!({}))));
        let result = reg.handle_call(&mut model(), "Heartbeat", &serde_json::json!({}));
        assert!(result.is_ok());
    }

    #[test]
    fn unknown_action_is_not_implemented() {
        let mut reg = OperationRegistry::new();
        let err = reg
            .handle_call(&mut model(), "DataTransfer", &serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotImplemented);
    }

    #[test]
    fn observer_fires_without_handler() {
        let mut reg = OperationRegistry::new();
        let seen = Rc::new(Cell::new(false));
        let flag = seen.clone();
        reg.set_on_request("StatusNotification", Box::new(move |_| flag.set(true)));

        let result =
            reg.handle_call(&mut model(), "StatusNotification", &serde_json::json!({}));
        assert!(result.is_err());
        assert!(seen.get());
    }
}
