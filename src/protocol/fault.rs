//! Recoverable faults reported to the fault hook.
//!
//! Every fault the server can recover from, or report before closing, goes
//! through one customizable hook on the [`Dispatcher`](super::dispatcher::Dispatcher).
//! The default hook answers with `{"status": "failure", "error": CODE}`.

use std::fmt;

use serde_json::{json, Value};

use crate::error::ProtocolError;

pub const ERR_REQUEST_MALFORMED: &str = "ERR_REQUEST_MALFORMED";
pub const ERR_HEADER_INVALID: &str = "ERR_HEADER_INVALID";
pub const ERR_TIMED_OUT: &str = "ERR_TIMED_OUT";
pub const ERR_SESSION_LIMIT_REACHED: &str = "ERR_SESSION_LIMIT_REACHED";
pub const ERR_SERVER_FULL: &str = "ERR_SERVER_FULL";
pub const ERR_HANDLER_FAILED: &str = "ERR_HANDLER_FAILED";
pub const ERR_NO_HANDLER: &str = "ERR_NO_HANDLER";

/// Fault class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Oversized or undecodable header; the connection is closed afterwards
    Framing,
    /// Frame payload did not decode
    Payload,
    /// Well-formed packet that no handler accepted
    NoMatch,
    /// A handler returned an error or panicked
    Handler,
    /// Session or server member limit reached
    Capacity,
    /// Connection idle for too long; closed afterwards
    Timeout,
}

impl FaultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Framing => "framing",
            FaultKind::Payload => "payload",
            FaultKind::NoMatch => "no_match",
            FaultKind::Handler => "handler",
            FaultKind::Capacity => "capacity",
            FaultKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fault and the context it happened in
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub kind: FaultKind,
    /// Sequence number of the originating packet, when there is one
    pub sequence: Option<u64>,
    /// Handler that failed, for handler faults
    pub handler: Option<String>,
    /// Human-readable cause
    pub detail: String,
    /// Failure code sent to the client
    pub code: &'static str,
}

impl Fault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        let code = match kind {
            FaultKind::Framing => ERR_HEADER_INVALID,
            FaultKind::Payload => ERR_REQUEST_MALFORMED,
            FaultKind::NoMatch => ERR_NO_HANDLER,
            FaultKind::Handler => ERR_HANDLER_FAILED,
            FaultKind::Capacity => ERR_SERVER_FULL,
            FaultKind::Timeout => ERR_TIMED_OUT,
        };
        Self {
            kind,
            sequence: None,
            handler: None,
            detail: detail.into(),
            code,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Classify a library error. Returns `None` for errors that are not
    /// client-visible faults (I/O, lock poisoning, config).
    pub fn from_error(err: &ProtocolError) -> Option<Self> {
        let fault = match err {
            ProtocolError::OversizedPacket(_) => Fault::new(FaultKind::Framing, err.to_string()),
            ProtocolError::DeserializeError(_) => Fault::new(FaultKind::Payload, err.to_string()),
            ProtocolError::HandlerFailed { handler, .. } => {
                Fault::new(FaultKind::Handler, err.to_string()).with_handler(handler.clone())
            }
            ProtocolError::HandlerPanicked(handler) => {
                Fault::new(FaultKind::Handler, err.to_string()).with_handler(handler.clone())
            }
            ProtocolError::SessionFull { .. } => {
                let mut fault = Fault::new(FaultKind::Capacity, err.to_string());
                fault.code = ERR_SESSION_LIMIT_REACHED;
                fault
            }
            ProtocolError::ServerFull(_) => Fault::new(FaultKind::Capacity, err.to_string()),
            ProtocolError::ConnectionTimeout => Fault::new(FaultKind::Timeout, err.to_string()),
            _ => return None,
        };
        Some(fault)
    }
}

/// Failure payload used by the default fault hook.
///
/// No-match faults produce no reply.
pub fn default_fault_reply(fault: &Fault) -> Option<Value> {
    match fault.kind {
        FaultKind::NoMatch => None,
        _ => Some(json!({"status": "failure", "error": fault.code})),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_replies() {
        let payload = Fault::new(FaultKind::Payload, "bad json").with_sequence(3);
        assert_eq!(
            default_fault_reply(&payload),
            Some(json!({"status": "failure", "error": "ERR_REQUEST_MALFORMED"}))
        );
        assert_eq!(default_fault_reply(&Fault::new(FaultKind::NoMatch, "")), None);
    }

    #[test]
    fn test_from_error() {
        let full = ProtocolError::SessionFull {
            session: "s".into(),
            limit: 2,
        };
        let fault = Fault::from_error(&full);
        assert!(matches!(
            fault,
            Some(Fault { kind: FaultKind::Capacity, code: ERR_SESSION_LIMIT_REACHED, .. })
        ));

        let fault = Fault::from_error(&ProtocolError::HandlerPanicked("h".into()));
        assert_eq!(fault.and_then(|f| f.handler), Some("h".to_string()));

        let fault = Fault::from_error(&ProtocolError::ConnectionTimeout).unwrap();
        assert_eq!((fault.kind, fault.code), (FaultKind::Timeout, ERR_TIMED_OUT));

        assert!(Fault::from_error(&ProtocolError::ConnectionClosed).is_none());
    }
}
