//! Wire payloads (C8/C7 boundary): the JSON shapes that cross the RPC
//! surface, plus the `skill_id`-tagged parameter sets the dispatcher (C7)
//! extracts. Styled after the teacher's `payloads.rs` — one file holding
//! every message shape, `serde_with::skip_serializing_none` where fields
//! are optional on the wire, and wire-format unit tests at the bottom.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::HashMap;

use crate::engine::{Phase, Role};

/// The data-part payload inside `params.message.parts` (spec §6.3). Identity
/// and auth fields are carried alongside (not inside) the skill-specific
/// fields so the signature verifier can split the two cleanly (spec §4.4
/// step 2): `skill_only_data` is this struct's `extra` map with the six
/// identity/auth keys removed.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedDataPart {
    pub message_id: String,
    pub timestamp: i64,
    pub skill_id: String,
    pub agent_address: String,
    pub signature: String,
    pub agent_id: Option<String>,
    pub agent_domain: Option<String>,
    pub player_name: Option<String>,
    /// Every other skill-specific field, as a free-form JSON object.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl SignedDataPart {
    /// Builds the `skill_only_data` scope used in the canonicalization
    /// (spec §4.4 step 2): every field except the identity/auth ones. The
    /// named fields above already consume those keys on the way in, so
    /// `extra` is exactly this scope.
    #[must_use]
    pub fn skill_only_data(&self) -> serde_json::Value {
        serde_json::Value::Object(self.extra.clone().into_iter().collect())
    }

    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.extra.get(field).and_then(serde_json::Value::as_str)
    }

    #[must_use]
    pub fn get_u64(&self, field: &str) -> Option<u64> {
        self.extra.get(field).and_then(serde_json::Value::as_u64)
    }
}

/// Top-level RPC envelope, per spec §6.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: serde_json::Value,
    pub id: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    #[must_use]
    pub fn ok(id: serde_json::Value, result: serde_json::Value) -> Self {
        RpcResponse { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    #[must_use]
    pub fn err(id: serde_json::Value, error: crate::error::RpcError) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcErrorBody { code: error.code.code(), message: error.message }),
        }
    }
}

/// Projection returned by `get-status` (spec §6.4).
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusProjection {
    pub game_id: String,
    pub phase: Phase,
    pub round: u64,
    pub is_alive: bool,
    pub role: Option<Role>,
    pub location: String,
    pub room_name: String,
    pub nearby_players: Vec<String>,
    pub task_ids: Vec<String>,
    pub completed_task_ids: Vec<String>,
    pub players_alive: usize,
    pub players_total: usize,
    pub tasks_remaining: Option<usize>,
    pub can_kill: Option<bool>,
    pub kill_cooldown_s: Option<u64>,
    pub imposters_remaining: Option<usize>,
    pub actions: AvailableActions,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AvailableActions {
    pub can_move: Vec<String>,
    pub can_do_tasks: Vec<String>,
    pub can_kill: bool,
    pub kill_targets: Vec<String>,
    pub can_vent: bool,
    pub vent_targets: Vec<String>,
    pub can_call_meeting: bool,
    pub can_report_body: bool,
    pub dead_bodies: Vec<String>,
    pub can_vote: bool,
}

/// The well-known agent descriptor (spec §6.1).
#[derive(Debug, Clone, Serialize)]
pub struct AgentCard {
    pub protocol_version: String,
    pub name: String,
    pub description: String,
    pub url: String,
    pub preferred_transport: String,
    pub capabilities: AgentCapabilities,
    pub skills: Vec<SkillDescriptor>,
    pub security_schemes: Vec<SecurityScheme>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentCapabilities {
    pub streaming: bool,
    pub push: bool,
    pub history: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityScheme {
    pub kind: String,
    pub description: String,
}

/// The 12 mandatory skill ids (spec §6.1), in ABI order.
pub const MANDATORY_SKILL_IDS: [&str; 12] = [
    "join-game",
    "leave-game",
    "move-to-room",
    "complete-task",
    "kill-player",
    "use-vent",
    "sabotage",
    "call-meeting",
    "report-body",
    "send-message",
    "vote",
    "get-status",
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn skill_only_data_excludes_identity_and_auth_fields() {
        let raw = json!({
            "messageId": "m1",
            "timestamp": 100,
            "skillId": "move-to-room",
            "agentAddress": "0xabc",
            "signature": "0xdead",
            "agentId": "agent-1",
            "targetRoom": "admin"
        });
        let part: SignedDataPart = serde_json::from_value(raw).unwrap();
        let scope = part.skill_only_data();
        assert_eq!(scope, json!({"targetRoom": "admin"}));
    }

    #[test]
    fn rpc_response_ok_has_no_error_field() {
        let resp = RpcResponse::ok(json!(1), json!({"msg": "ok"}));
        let s = serde_json::to_string(&resp).unwrap();
        assert!(!s.contains("\"error\""));
    }

    #[test]
    fn mandatory_skill_ids_has_twelve_entries() {
        assert_eq!(MANDATORY_SKILL_IDS.len(), 12);
        assert!(MANDATORY_SKILL_IDS.contains(&"get-status"));
    }
}
