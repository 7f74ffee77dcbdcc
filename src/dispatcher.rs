//! Skill dispatcher (C7): maps a verified `skill_id` to an engine operation,
//! extracts typed parameters from the signed data payload, locates the
//! target session via the session manager, and invokes the engine.
//!
//! Authentication has already happened by the time anything here runs
//! (spec §7: "authentication failure MUST precede any state mutation").
//! The player's on-chain address *is* its `player_id` — this system has no
//! separate player-id namespace, so the signer's verified address is what
//! gets inserted into `Session.players`.

use crate::engine::{OperationOutcome, VentAction, VoteChoice};
use crate::error::RpcError;
use crate::payloads::SignedDataPart;
use crate::session_manager::SessionManager;
use crate::warn;

/// Keyword fallback used only when the data payload omits `skillId`
/// entirely (spec §4.7: "informational only and MUST NOT be used for
/// security-relevant routing when a data field is present"). Since every
/// skill here always arrives with a `skillId` in `SignedDataPart`, this is
/// reached only for free-text message parts carrying no structured data —
/// kept narrow and best-effort on purpose.
#[must_use]
pub fn infer_skill_from_text(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    let table: &[(&str, &'static str)] = &[
        ("join", "join-game"),
        ("leave", "leave-game"),
        ("move to", "move-to-room"),
        ("complete", "complete-task"),
        ("kill", "kill-player"),
        ("vent", "use-vent"),
        ("sabotage", "sabotage"),
        ("emergency meeting", "call-meeting"),
        ("report", "report-body"),
        ("vote", "vote"),
        ("status", "get-status"),
    ];
    table.iter().find(|(kw, _)| lower.contains(kw)).map(|(_, skill)| *skill)
}

/// Dispatches a verified, skill-tagged payload to the owning session's
/// engine. `claimed_address` is the already-verified signer.
pub async fn dispatch(
    manager: &SessionManager,
    claimed_address: &str,
    part: &SignedDataPart,
) -> Result<OperationOutcome, RpcError> {
    let player_id = claimed_address.to_lowercase();

    match part.skill_id.as_str() {
        "join-game" => {
            let engine = manager.assign_lobby(&player_id);
            let display_name = part.player_name.clone().unwrap_or_else(|| player_id.clone());
            Ok(engine.join(&player_id, claimed_address, &display_name))
        }
        "leave-game" => {
            let engine = session_for(manager, &player_id)?;
            let outcome = engine.leave(&player_id);
            manager.remove_player(&player_id);
            Ok(outcome)
        }
        "move-to-room" => {
            let engine = session_for(manager, &player_id)?;
            let target = part.get_str("targetRoom").ok_or_else(|| RpcError::invalid_params("missing targetRoom"))?;
            Ok(engine.move_to_room(&player_id, target))
        }
        "complete-task" => {
            let engine = session_for(manager, &player_id)?;
            let task_id = part.get_str("taskId").ok_or_else(|| RpcError::invalid_params("missing taskId"))?;
            let input = part.get_str("input").unwrap_or_default();
            Ok(engine.complete_task(&player_id, task_id, input))
        }
        "kill-player" => {
            let engine = session_for(manager, &player_id)?;
            let target = part.get_str("targetPlayerId").ok_or_else(|| RpcError::invalid_params("missing targetPlayerId"))?;
            Ok(engine.kill(&player_id, &target.to_lowercase()))
        }
        "use-vent" => {
            let engine = session_for(manager, &player_id)?;
            let action = match part.get_str("action") {
                Some("enter") => VentAction::Enter,
                Some("exit") => VentAction::Exit,
                _ => return Err(RpcError::invalid_params("action must be 'enter' or 'exit'")),
            };
            let target = part.get_str("targetRoom");
            Ok(engine.use_vent(&player_id, action, target))
        }
        "sabotage" => {
            let engine = session_for(manager, &player_id)?;
            let system = part.get_str("system").ok_or_else(|| RpcError::invalid_params("missing system"))?;
            Ok(engine.sabotage(&player_id, system))
        }
        "call-meeting" => {
            let engine = session_for(manager, &player_id)?;
            let (outcome, _discussion_ms) = engine.call_meeting(&player_id, None);
            Ok(outcome)
        }
        "report-body" => {
            let engine = session_for(manager, &player_id)?;
            let body_id = part.get_str("bodyPlayerId").ok_or_else(|| RpcError::invalid_params("missing bodyPlayerId"))?;
            let (outcome, _discussion_ms) = engine.call_meeting(&player_id, Some(&body_id.to_lowercase()));
            Ok(outcome)
        }
        "send-message" => {
            let engine = session_for(manager, &player_id)?;
            let message = part.get_str("message").ok_or_else(|| RpcError::invalid_params("missing message"))?;
            Ok(engine.send_chat(&player_id, message))
        }
        "vote" => {
            let engine = session_for(manager, &player_id)?;
            let choice = match part.get_str("target") {
                Some("skip") | None => VoteChoice::Skip,
                Some(target) => VoteChoice::Target(target.to_lowercase()),
            };
            Ok(engine.cast_vote(&player_id, choice))
        }
        "get-status" => {
            let engine = session_for(manager, &player_id)?;
            match engine.status_projection(&player_id) {
                Some(projection) => Ok(OperationOutcome {
                    accepted: true,
                    message: "status".to_string(),
                    events: Vec::new(),
                    data: Some(serde_json::to_value(projection).map_err(|e| RpcError::domain(e.to_string()))?),
                }),
                None => Err(RpcError::invalid_params("player not in any session")),
            }
        }
        other => {
            warn!("(dispatcher.dispatch) Unknown skill id '{}'.", other);
            Err(RpcError::new(crate::error::RpcErrorCode::UnknownSkill, format!("unknown skill '{other}'")))
        }
    }
}

fn session_for(
    manager: &SessionManager,
    player_id: &str,
) -> Result<std::sync::Arc<crate::engine::SessionEngine>, RpcError> {
    manager
        .lookup(player_id)
        .or_else(|| manager.heal_assignment(player_id))
        .ok_or_else(|| RpcError::new(crate::error::RpcErrorCode::TaskNotFound, "player is not in any session"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameRules;
    use crate::ship_map::DEFAULT_SHIP_MAP;
    use crate::task_catalog::DEFAULT_TASK_CATALOG;
    use std::collections::HashMap;

    fn part(skill_id: &str, extra: serde_json::Value) -> SignedDataPart {
        let mut extra_map = HashMap::new();
        if let serde_json::Value::Object(map) = extra {
            for (k, v) in map {
                extra_map.insert(k, v);
            }
        }
        SignedDataPart {
            message_id: "m1".to_string(),
            timestamp: 0,
            skill_id: skill_id.to_string(),
            agent_address: "0xabc".to_string(),
            signature: "0xdead".to_string(),
            agent_id: None,
            agent_domain: None,
            player_name: Some("Tester".to_string()),
            extra: extra_map,
        }
    }

    fn manager() -> SessionManager {
        SessionManager::new(GameRules::default(), &DEFAULT_SHIP_MAP, &DEFAULT_TASK_CATALOG, true)
    }

    #[tokio::test]
    async fn join_game_creates_a_session_assignment() {
        let mgr = manager();
        let outcome = dispatch(&mgr, "0xABC", &part("join-game", serde_json::json!({}))).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(mgr.session_count(), 1);
    }

    #[tokio::test]
    async fn unknown_skill_is_rejected() {
        let mgr = manager();
        let err = dispatch(&mgr, "0xABC", &part("not-a-real-skill", serde_json::json!({}))).await.unwrap_err();
        assert_eq!(err.code.code(), crate::error::RpcErrorCode::UnknownSkill.code());
    }

    #[tokio::test]
    async fn move_without_a_session_is_rejected() {
        let mgr = manager();
        let err = dispatch(&mgr, "0xABC", &part("move-to-room", serde_json::json!({"targetRoom": "weapons"})))
            .await
            .unwrap_err();
        assert_eq!(err.code.code(), crate::error::RpcErrorCode::TaskNotFound.code());
    }

    #[test]
    fn keyword_inference_is_best_effort_only() {
        assert_eq!(infer_skill_from_text("I want to join now"), Some("join-game"));
        assert_eq!(infer_skill_from_text("gibberish"), None);
    }
}
