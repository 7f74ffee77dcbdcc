//! Signature verifier (C4): canonicalizes the signed scope of a message,
//! recovers the signer from an ECDSA (secp256k1) signature over its
//! Keccak-256 digest, and enforces the freshness window.
//!
//! This is the one place the teacher crate has nothing analogous to reuse
//! from directly (its `authentication.rs` verifies Google-issued JWTs, not
//! self-signed wallet messages) so the shape below follows the teacher's
//! *pattern* — a small, testable, `Result`-returning verification function
//! plus a dedicated error enum with `Display`/`Error` impls — while using
//! the `k256`/`sha3` pair that is the standard choice for Ethereum-style
//! address recovery in the wider Rust ecosystem (see DESIGN.md).

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::AuthError;
use crate::{debug, warn};

/// Acceptance window around `now`, per spec §4.4 step 1 / GLOSSARY.
pub const MAX_PAST_SKEW_SECS: i64 = 5 * 60;
pub const MAX_FUTURE_SKEW_SECS: i64 = 60;

/// The fields signed over, and the fields identifying the signer. Splitting
/// these is the HARD CONTRACT from spec §4.4 step 2: `skill_only_data` must
/// never contain any of the identity/auth fields.
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    pub message_id: String,
    pub timestamp: i64,
    pub skill_id: String,
    /// Raw JSON value of the skill-specific parameters, already stripped of
    /// `agentId`/`agentAddress`/`agentDomain`/`playerName`/`signature`/
    /// `timestamp`/`skillId` by the caller (see `payloads::SignedDataPart`).
    pub skill_only_data: serde_json::Value,
    pub claimed_address: String,
    /// Hex-encoded, `0x`-prefixed, 65-byte recoverable ECDSA signature
    /// (r || s || recovery_id).
    pub signature: String,
}

/// Deterministic canonical bytes for the signed scope (spec §4.4 step 2).
/// Uses `serde_json` with its default (insertion-order-independent for our
/// purposes since we build a literal object with a fixed field order) to
/// produce a stable encoding both client and server agree on.
#[must_use]
pub fn canonical_signed_bytes(envelope: &SignedEnvelope) -> Vec<u8> {
    let canonical = serde_json::json!({
        "messageId": envelope.message_id,
        "timestamp": envelope.timestamp,
        "skillId": envelope.skill_id,
        "skillOnlyData": envelope.skill_only_data,
    });
    // `to_string` on a `serde_json::Value` built from a literal `json!` object
    // preserves field order, so this is stable across client and server as
    // long as both construct the object with the same four keys in the same
    // order, which is the documented wire contract.
    canonical.to_string().into_bytes()
}

fn parse_signature(hex_sig: &str) -> Result<(Signature, RecoveryId), AuthError> {
    let hex_sig = hex_sig.strip_prefix("0x").unwrap_or(hex_sig);
    let bytes = hex::decode(hex_sig).map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
    if bytes.len() != 65 {
        return Err(AuthError::MalformedSignature(format!(
            "expected 65 signature bytes, got {}",
            bytes.len()
        )));
    }
    let (rs, recovery_byte) = bytes.split_at(64);
    let signature =
        Signature::from_slice(rs).map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(normalize_recovery_byte(recovery_byte[0]))
        .ok_or_else(|| AuthError::MalformedSignature("invalid recovery id".to_string()))?;
    Ok((signature, recovery_id))
}

/// Accepts both the raw `{0, 1}` and the Ethereum-style `{27, 28}` recovery
/// byte conventions, since clients in the wild use either.
fn normalize_recovery_byte(byte: u8) -> u8 {
    if byte >= 27 {
        byte - 27
    } else {
        byte
    }
}

fn address_from_verifying_key(key: &VerifyingKey) -> String {
    let uncompressed = key.to_encoded_point(false);
    // Ethereum-style address: last 20 bytes of keccak256(uncompressed pubkey
    // without the leading 0x04 tag byte).
    let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
    format!("0x{}", hex::encode(&hash[12..]))
}

/// Recovers the signing address from `signature` over `message`.
///
/// # Errors
/// Returns [`AuthError::MalformedSignature`] if the signature does not
/// decode or does not recover to a valid public key.
pub fn recover_signer(message: &[u8], signature: &str) -> Result<String, AuthError> {
    let (sig, recovery_id) = parse_signature(signature)?;
    let digest = Keccak256::digest(message);
    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
        .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
    Ok(address_from_verifying_key(&key))
}

/// Full signature-verification pipeline (spec §4.4, steps 1-3; step 4 —
/// the registry check — is the caller's job since it is async and this
/// function is deliberately synchronous and side-effect free).
///
/// # Errors
/// See [`AuthError`] variants.
pub fn verify_envelope(envelope: &SignedEnvelope, now_unix_secs: i64) -> Result<(), AuthError> {
    if envelope.message_id.is_empty() {
        return Err(AuthError::MissingField("message_id"));
    }
    if envelope.skill_id.is_empty() {
        return Err(AuthError::MissingField("skill_id"));
    }
    if envelope.claimed_address.is_empty() {
        return Err(AuthError::MissingField("claimed_address"));
    }
    if envelope.signature.is_empty() {
        return Err(AuthError::MissingField("signature"));
    }

    let age = now_unix_secs - envelope.timestamp;
    if age > MAX_PAST_SKEW_SECS || age < -MAX_FUTURE_SKEW_SECS {
        warn!(
            "(signature.verify_envelope) Stale timestamp: age {}s outside [-{}, {}].",
            age, MAX_FUTURE_SKEW_SECS, MAX_PAST_SKEW_SECS
        );
        return Err(AuthError::StaleTimestamp { timestamp: envelope.timestamp, now: now_unix_secs });
    }

    let bytes = canonical_signed_bytes(envelope);
    let recovered = recover_signer(&bytes, &envelope.signature)?;

    if !recovered.eq_ignore_ascii_case(&envelope.claimed_address) {
        return Err(AuthError::SignerMismatch {
            recovered,
            claimed: envelope.claimed_address.clone(),
        });
    }

    debug!(
        "(signature.verify_envelope) Verified envelope for skill {} from {}.",
        envelope.skill_id, envelope.claimed_address
    );
    Ok(())
}
