//! RPC surface (C8): envelope parsing, authentication gating, routing to
//! the dispatcher, and error mapping to the taxonomy in spec §7/§4.8.
//!
//! `AppState` is the explicit-wiring container the design notes call for
//! (§9: "service locator -> explicit wiring") — every collaborator is
//! constructed once in `main.rs` and handed to the RPC layer by reference,
//! the same shape as the teacher's `ServerState` in `server.rs`.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::dispatcher;
use crate::engine::Event;
use crate::error::{RpcError, RpcErrorCode};
use crate::hub::SubscriptionHub;
use crate::identity::IdentityVerifier;
use crate::payloads::{RpcRequest, RpcResponse, SignedDataPart, StatusProjection};
use crate::session_manager::SessionManager;
use crate::signature::{self, SignedEnvelope};
use crate::{info, warn};

/// What the HTTP layer (C10) should do with the transport after `handle`
/// returns. `message/stream` hands back a fresh hub subscription plus the
/// snapshot to push as the first frame (spec §4.8); every other method
/// resolves in one shot.
pub enum StreamOutcome {
    None,
    Stream { snapshot: Option<StatusProjection>, rx: mpsc::UnboundedReceiver<Event> },
}

pub struct AppState {
    pub sessions: SessionManager,
    pub identity: Arc<dyn IdentityVerifier>,
    pub hub: SubscriptionHub,
    pub dev_mode: bool,
}

impl AppState {
    #[must_use]
    pub fn new(sessions: SessionManager, identity: Arc<dyn IdentityVerifier>, dev_mode: bool) -> Self {
        AppState { sessions, identity, hub: SubscriptionHub::new(), dev_mode }
    }
}

/// Extracts and verifies the one `data`-kind part from `params.message.parts`,
/// per spec §6.3. Everything up to and including the registry check happens
/// **before** any state mutation (spec §7).
async fn authenticate(state: &AppState, params: &serde_json::Value) -> Result<(String, SignedDataPart), RpcError> {
    let parts = params
        .get("message")
        .and_then(|m| m.get("parts"))
        .and_then(|p| p.as_array())
        .ok_or_else(|| RpcError::new(RpcErrorCode::InvalidParams, "params.message.parts is required"))?;

    let data_value = parts
        .iter()
        .find(|part| part.get("kind").and_then(|k| k.as_str()) == Some("data"))
        .and_then(|part| part.get("data"))
        .ok_or_else(|| RpcError::new(RpcErrorCode::InvalidParams, "no data part present"))?;

    let part: SignedDataPart = serde_json::from_value(data_value.clone())
        .map_err(|e| RpcError::new(RpcErrorCode::InvalidParams, format!("malformed data part: {e}")))?;

    let envelope = SignedEnvelope {
        message_id: part.message_id.clone(),
        timestamp: part.timestamp,
        skill_id: part.skill_id.clone(),
        skill_only_data: part.skill_only_data(),
        claimed_address: part.agent_address.clone(),
        signature: part.signature.clone(),
    };

    signature::verify_envelope(&envelope, Utc::now().timestamp())?;

    if !state.identity.is_registered(&part.agent_address).await {
        warn!("(rpc.authenticate) Address {} is not registered.", part.agent_address);
        return Err(RpcError::from(crate::error::AuthError::NotRegistered(part.agent_address.clone())));
    }

    Ok((part.agent_address.clone(), part))
}

/// Handles one `POST /a2a` envelope and returns the response envelope to
/// serialize back to the client. `message/stream` hands back a
/// [`StreamOutcome::Stream`]; the HTTP layer (C10) is responsible for
/// switching transports and pushing its frames.
pub async fn handle(state: &AppState, request: RpcRequest) -> (RpcResponse, StreamOutcome) {
    if request.jsonrpc != "2.0" {
        return (
            RpcResponse::err(request.id, RpcError::new(RpcErrorCode::InvalidRequest, "unsupported jsonrpc version")),
            StreamOutcome::None,
        );
    }

    match request.method.as_str() {
        "message/send" => {
            let (response, _player_id) = handle_message(state, &request).await;
            (response, StreamOutcome::None)
        }
        "message/stream" => {
            let (response, player_id) = handle_message(state, &request).await;
            let stream = match player_id {
                Some(player_id) => {
                    let (_subscription_id, rx) = state.hub.subscribe(&player_id);
                    let snapshot = state.sessions.lookup(&player_id).and_then(|engine| engine.status_projection(&player_id));
                    StreamOutcome::Stream { snapshot, rx }
                }
                None => StreamOutcome::None,
            };
            (response, stream)
        }
        "tasks/get" => (handle_tasks_get(state, &request).await, StreamOutcome::None),
        "tasks/cancel" => (handle_tasks_cancel(state, &request).await, StreamOutcome::None),
        "tasks/resubscribe" => (handle_tasks_resubscribe(state, &request).await, StreamOutcome::None),
        other => (
            RpcResponse::err(request.id.clone(), RpcError::new(RpcErrorCode::MethodNotFound, format!("unknown method '{other}'"))),
            StreamOutcome::None,
        ),
    }
}

/// Runs the authenticated dispatch for `message/send` and `message/stream`
/// alike. Returns the verified, lowercased address whenever authentication
/// succeeded (regardless of whether the dispatched operation was accepted),
/// so `message/stream` can open a hub subscription for it.
async fn handle_message(state: &AppState, request: &RpcRequest) -> (RpcResponse, Option<String>) {
    let (address, part) = match authenticate(state, &request.params).await {
        Ok(ok) => ok,
        Err(err) => return (RpcResponse::err(request.id.clone(), err), None),
    };
    let player_id = address.to_lowercase();

    match dispatcher::dispatch(&state.sessions, &address, &part).await {
        Ok(outcome) => {
            if let Some(engine) = state.sessions.lookup(&player_id) {
                let snapshot = engine.snapshot();
                for event in &outcome.events {
                    state.hub.broadcast(event, &snapshot);
                }
            }
            let result = serde_json::json!({
                "accepted": outcome.accepted,
                "message": outcome.message,
                "data": outcome.data,
            });
            let response = if outcome.accepted {
                RpcResponse::ok(request.id.clone(), result)
            } else {
                RpcResponse::err(request.id.clone(), RpcError::domain(outcome.message))
            };
            (response, Some(player_id))
        }
        Err(err) => (RpcResponse::err(request.id.clone(), err), Some(player_id)),
    }
}

async fn handle_tasks_get(state: &AppState, request: &RpcRequest) -> RpcResponse {
    let (address, _part) = match authenticate(state, &request.params).await {
        Ok(ok) => ok,
        Err(err) => return RpcResponse::err(request.id.clone(), err),
    };
    let Some(engine) = state.sessions.lookup(&address.to_lowercase()) else {
        return RpcResponse::err(request.id.clone(), RpcError::new(RpcErrorCode::TaskNotFound, "no active task for this agent"));
    };
    match engine.status_projection(&address.to_lowercase()) {
        Some(projection) => RpcResponse::ok(request.id.clone(), serde_json::to_value(projection).unwrap()),
        None => RpcResponse::err(request.id.clone(), RpcError::new(RpcErrorCode::TaskNotFound, "agent is not a session member")),
    }
}

async fn handle_tasks_cancel(state: &AppState, request: &RpcRequest) -> RpcResponse {
    let (address, _part) = match authenticate(state, &request.params).await {
        Ok(ok) => ok,
        Err(err) => return RpcResponse::err(request.id.clone(), err),
    };
    let player_id = address.to_lowercase();
    let Some(engine) = state.sessions.lookup(&player_id) else {
        return RpcResponse::err(request.id.clone(), RpcError::new(RpcErrorCode::TaskNotCancelable, "nothing to cancel"));
    };
    let outcome = engine.leave(&player_id);
    state.sessions.remove_player(&player_id);
    state.hub.unsubscribe_player(&player_id);
    if outcome.accepted {
        info!("(rpc.handle_tasks_cancel) Cancelled task for {}.", player_id);
        RpcResponse::ok(request.id.clone(), serde_json::json!({"cancelled": true}))
    } else {
        RpcResponse::err(request.id.clone(), RpcError::new(RpcErrorCode::TaskNotCancelable, outcome.message))
    }
}

async fn handle_tasks_resubscribe(state: &AppState, request: &RpcRequest) -> RpcResponse {
    let (address, _part) = match authenticate(state, &request.params).await {
        Ok(ok) => ok,
        Err(err) => return RpcResponse::err(request.id.clone(), err),
    };
    let player_id = address.to_lowercase();
    let Some(engine) = state.sessions.lookup(&player_id) else {
        return RpcResponse::err(request.id.clone(), RpcError::new(RpcErrorCode::TaskNotFound, "no active task for this agent"));
    };
    let (subscription_id, _rx) = state.hub.subscribe(&player_id);
    let projection = engine.status_projection(&player_id);
    RpcResponse::ok(
        request.id.clone(),
        serde_json::json!({"subscription_id": subscription_id, "snapshot": projection}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameRules;
    use crate::identity::MockIdentityVerifier;
    use crate::ship_map::DEFAULT_SHIP_MAP;
    use crate::task_catalog::DEFAULT_TASK_CATALOG;
    use k256::ecdsa::{RecoveryId, Signature, SigningKey};
    use sha3::{Digest, Keccak256};

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[9u8; 32].into()).unwrap()
    }

    fn address_of(key: &SigningKey) -> String {
        let uncompressed = key.verifying_key().to_encoded_point(false);
        let hash = Keccak256::digest(&uncompressed.as_bytes()[1..]);
        format!("0x{}", hex::encode(&hash[12..]))
    }

    fn signed_envelope_json(key: &SigningKey, skill_id: &str, extra: serde_json::Value) -> serde_json::Value {
        let address = address_of(key);
        let mut data = serde_json::json!({
            "messageId": "m1",
            "timestamp": Utc::now().timestamp(),
            "skillId": skill_id,
            "agentAddress": address,
        });
        if let (serde_json::Value::Object(base), serde_json::Value::Object(more)) = (&mut data, extra) {
            for (k, v) in more {
                base.insert(k, v);
            }
        }
        let part: SignedDataPart = serde_json::from_value(data.clone()).unwrap();
        let envelope = SignedEnvelope {
            message_id: part.message_id.clone(),
            timestamp: part.timestamp,
            skill_id: part.skill_id.clone(),
            skill_only_data: part.skill_only_data(),
            claimed_address: part.agent_address.clone(),
            signature: String::new(),
        };
        let bytes = signature::canonical_signed_bytes(&envelope);
        let digest = Keccak256::digest(&bytes);
        let (sig, recovery_id): (Signature, RecoveryId) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut sig_bytes = sig.to_bytes().to_vec();
        sig_bytes.push(recovery_id.to_byte());
        if let serde_json::Value::Object(map) = &mut data {
            map.insert("signature".to_string(), serde_json::json!(format!("0x{}", hex::encode(sig_bytes))));
        }
        serde_json::json!({"message": {"parts": [{"kind": "data", "data": data}]}})
    }

    fn state_with(address: &str) -> AppState {
        let identity = Arc::new(MockIdentityVerifier::with_registered([address.to_string()]));
        AppState::new(
            SessionManager::new(GameRules::default(), &DEFAULT_SHIP_MAP, &DEFAULT_TASK_CATALOG, true),
            identity,
            true,
        )
    }

    #[tokio::test]
    async fn join_via_message_send_succeeds_with_valid_signature() {
        let key = signing_key();
        let address = address_of(&key);
        let state = state_with(&address);
        let params = signed_envelope_json(&key, "join-game", serde_json::json!({"playerName": "Tester"}));
        let request = RpcRequest { jsonrpc: "2.0".to_string(), method: "message/send".to_string(), params, id: serde_json::json!(1) };
        let (response, stream) = handle(&state, request).await;
        assert!(matches!(stream, StreamOutcome::None));
        assert!(response.error.is_none(), "{:?}", response.error);
    }

    #[tokio::test]
    async fn join_via_message_stream_opens_a_hub_subscription_with_a_snapshot() {
        let key = signing_key();
        let address = address_of(&key);
        let state = state_with(&address);
        let params = signed_envelope_json(&key, "join-game", serde_json::json!({"playerName": "Tester"}));
        let request = RpcRequest { jsonrpc: "2.0".to_string(), method: "message/stream".to_string(), params, id: serde_json::json!(1) };
        let (response, stream) = handle(&state, request).await;
        assert!(response.error.is_none(), "{:?}", response.error);
        match stream {
            StreamOutcome::Stream { snapshot, .. } => assert!(snapshot.is_some()),
            StreamOutcome::None => panic!("expected a stream outcome for message/stream"),
        }
    }

    #[tokio::test]
    async fn unregistered_address_is_rejected() {
        let key = signing_key();
        let address = address_of(&key);
        // Registry knows a different address, so this one is unregistered.
        let state = state_with("0xsomeoneelse");
        let params = signed_envelope_json(&key, "get-status", serde_json::json!({}));
        let request = RpcRequest { jsonrpc: "2.0".to_string(), method: "message/send".to_string(), params, id: serde_json::json!(2) };
        let (response, _) = handle(&state, request).await;
        assert!(response.error.is_some());
        let _ = address;
    }

    #[tokio::test]
    async fn unknown_method_maps_to_method_not_found() {
        let state = state_with("0xabc");
        let request = RpcRequest {
            jsonrpc: "2.0".to_string(),
            method: "not/a/method".to_string(),
            params: serde_json::json!({}),
            id: serde_json::json!(3),
        };
        let (response, _) = handle(&state, request).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, RpcErrorCode::MethodNotFound.code());
    }
}
