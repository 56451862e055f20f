//! OCPP-J frame (de)serialization.
//!
//! OCPP 1.6J frames are JSON arrays over the websocket:
//! - CALL: `[2, uniqueId, action, payload]`
//! - CALLRESULT: `[3, uniqueId, payload]`
//! - CALLERROR: `[4, uniqueId, errorCode, errorDescription, errorDetails]`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// OCPP-J message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP-J error codes carried in a CALLERROR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormationViolation,
    GenericError,
    InternalError,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    SecurityError,
    TypeConstraintViolation,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Errors in frame handling.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid frame layout")]
    InvalidFormat,

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),
}

/// CALL frame (request).
#[derive(Debug, Clone)]
pub struct Call {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn to_frame(&self) -> String {
        serde_json::json!([
            MessageType::Call as i64,
            &self.unique_id,
            &self.action,
            &self.payload
        ])
        .to_string()
    }
}

/// CALLRESULT frame (success response).
#[derive(Debug, Clone)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn to_frame(&self) -> String {
        serde_json::json!([MessageType::CallResult as i64, &self.unique_id, &self.payload])
            .to_string()
    }
}

/// CALLERROR frame (error response).
#[derive(Debug, Clone)]
pub struct CallError {
    pub unique_id: String,
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl CallError {
    pub fn new(unique_id: impl Into<String>, code: ErrorCode, description: impl Into<String>) -> Self {
        CallError {
            unique_id: unique_id.into(),
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn to_frame(&self) -> String {
        serde_json::json!([
            MessageType::CallError as i64,
            &self.unique_id,
            self.code.to_string(),
            &self.description,
            &self.details
        ])
        .to_string()
    }
}

/// Any parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    /// Parses a received text frame.
    pub fn parse(text: &str) -> Result<Frame, FrameError> {
        let array: Vec<Value> = serde_json::from_str(text)?;
        if array.is_empty() {
            return Err(FrameError::InvalidFormat);
        }
        let msg_type = array[0].as_i64().ok_or(FrameError::InvalidFormat)?;

        let unique_id = |idx: usize| -> Result<String, FrameError> {
            array
                .get(idx)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(FrameError::InvalidFormat)
        };

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(FrameError::InvalidFormat);
                }
                let action =
                    array[2].as_str().ok_or(FrameError::InvalidFormat)?.to_string();
                Ok(Frame::Call(Call {
                    unique_id: unique_id(1)?,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(FrameError::InvalidFormat);
                }
                Ok(Frame::CallResult(CallResult {
                    unique_id: unique_id(1)?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(FrameError::InvalidFormat);
                }
                let code_str = array[2].as_str().ok_or(FrameError::InvalidFormat)?;
                let code = serde_json::from_value(Value::String(code_str.to_string()))
                    .unwrap_or(ErrorCode::GenericError);
                Ok(Frame::CallError(CallError {
                    unique_id: unique_id(1)?,
                    code,
                    description: array[3].as_str().unwrap_or("").to_string(),
                    details: array[4].clone(),
                }))
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Frame::Call(c) => &c.unique_id,
            Frame::CallResult(r) => &r.unique_id,
            Frame::CallError(e) => &e.unique_id,
        }
    }

    pub fn to_frame(&self) -> String {
        match self {
            Frame::Call(c) => c.to_frame(),
            Frame::CallResult(r) => r.to_frame(),
            Frame::CallError(e) => e.to_frame(),
        }
    }
}
