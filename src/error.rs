//! Shared error types for the authentication gate and the RPC surface.
//!
//! Engine-level rejections (wrong phase, wrong room, on cooldown, etc.) are
//! not modeled as errors at all: `SessionEngine` operations return an
//! [`crate::engine::OperationOutcome`] with `accepted: false` and a message,
//! per the "exceptions as control flow -> result objects" design note.

use std::fmt;

/// Failures produced while verifying a signed envelope (spec C3/C4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// One of `message_id`/`timestamp`/`skill_id`/`claimed_address`/`signature` was absent.
    MissingField(&'static str),
    /// `timestamp` fell outside `[now - 5min, now + 60s]`.
    StaleTimestamp { timestamp: i64, now: i64 },
    /// The signature did not decode, or did not recover to any address.
    MalformedSignature(String),
    /// The recovered signer does not match the address the payload claims.
    SignerMismatch { recovered: String, claimed: String },
    /// The claimed (and verified) address is not registered in the identity registry.
    NotRegistered(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingField(field) => write!(f, "message is missing required field '{field}'"),
            AuthError::StaleTimestamp { timestamp, now } => write!(
                f,
                "message too old or too far in the future (timestamp {timestamp}, server time {now})"
            ),
            AuthError::MalformedSignature(msg) => write!(f, "malformed signature: {msg}"),
            AuthError::SignerMismatch { recovered, claimed } => write!(
                f,
                "signature is from {recovered} but claiming to be {claimed}"
            ),
            AuthError::NotRegistered(address) => {
                write!(f, "address {address} is not registered in the identity registry")
            }
        }
    }
}

impl std::error::Error for AuthError {}

/// Numeric codes required by spec §7 / §4.8 for the RPC transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    InvalidRequest,
    InvalidParams,
    MethodNotFound,
    InternalError,
    TaskNotFound,
    TaskNotCancelable,
    DomainError,
    UnknownSkill,
}

impl RpcErrorCode {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            RpcErrorCode::InvalidRequest => -32600,
            RpcErrorCode::InvalidParams => -32602,
            RpcErrorCode::MethodNotFound => -32601,
            RpcErrorCode::InternalError => -32603,
            RpcErrorCode::TaskNotFound => -32001,
            RpcErrorCode::TaskNotCancelable => -32002,
            RpcErrorCode::DomainError => -32000,
            RpcErrorCode::UnknownSkill => -32003,
        }
    }
}

/// A fully-formed RPC-level error, ready to be placed into a response envelope.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        RpcError { code, message: message.into() }
    }

    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams, message)
    }

    #[must_use]
    pub fn domain(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::DomainError, message)
    }
}

impl From<AuthError> for RpcError {
    fn from(err: AuthError) -> Self {
        RpcError::invalid_params(err.to_string())
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.message)
    }
}

impl std::error::Error for RpcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_mismatch_message_names_both_addresses() {
        let err = AuthError::SignerMismatch {
            recovered: "0xAAA".to_string(),
            claimed: "0xBBB".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("0xAAA"));
        assert!(msg.contains("0xBBB"));
    }

    #[test]
    fn rpc_error_codes_are_stable() {
        assert_eq!(RpcErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(RpcErrorCode::TaskNotFound.code(), -32001);
    }
}
