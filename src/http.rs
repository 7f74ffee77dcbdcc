//! HTTP edges (C10): the well-known agent descriptor, health, and
//! development-only debug introspection routes, wired up in `main.rs`
//! exactly where the teacher wires its `hyper` service in `server.rs`.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::engine::Event;
use crate::payloads::{
    AgentCapabilities, AgentCard, MANDATORY_SKILL_IDS, RpcRequest, RpcResponse, SecurityScheme, SkillDescriptor,
};
use crate::rpc::{self, AppState, StreamOutcome};
use crate::{info, warn};

type HttpResult = Result<Response<BoxBody<Bytes, Infallible>>, Infallible>;

fn json_response(status: StatusCode, body: &serde_json::Value) -> HttpResult {
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())).boxed())
        .unwrap())
}

/// Backs `message/stream` (spec §4.8): the first frame is the current task
/// snapshot, already queued by the time this body is built; subsequent
/// frames are forwarded from the hub sink as they arrive, each wrapped as a
/// complete envelope (spec §6.2).
struct EventStreamBody {
    first: Option<Bytes>,
    request_id: serde_json::Value,
    rx: UnboundedReceiver<Event>,
}

impl Body for EventStreamBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(Some(Ok(Frame::data(first))));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let envelope = RpcResponse::ok(self.request_id.clone(), serde_json::to_value(&event).unwrap());
                let line = format!("{}\n", serde_json::to_string(&envelope).unwrap());
                Poll::Ready(Some(Ok(Frame::data(Bytes::from(line)))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn not_found() -> HttpResult {
    json_response(StatusCode::NOT_FOUND, &serde_json::json!({"error": "not found"}))
}

fn skill_descriptors() -> Vec<SkillDescriptor> {
    let described: &[(&str, &str, &str)] = &[
        ("join-game", "Join Game", "Joins the lobby of the smallest open session."),
        ("leave-game", "Leave Game", "Leaves the current session."),
        ("move-to-room", "Move", "Moves to an adjacent room."),
        ("complete-task", "Complete Task", "Submits input toward an assigned task."),
        ("kill-player", "Kill", "Imposter-only: eliminates a crewmate in the same room."),
        ("use-vent", "Use Vent", "Imposter-only: enters or exits the vent network."),
        ("sabotage", "Sabotage", "Imposter-only: triggers a ship-wide sabotage event."),
        ("call-meeting", "Call Meeting", "Calls an emergency meeting."),
        ("report-body", "Report Body", "Reports a dead player in the same room."),
        ("send-message", "Send Message", "Sends a chat message during discussion."),
        ("vote", "Vote", "Casts a vote during the voting phase."),
        ("get-status", "Get Status", "Returns a role-aware status projection."),
    ];
    described
        .iter()
        .map(|(id, name, description)| SkillDescriptor {
            id: (*id).to_string(),
            name: (*name).to_string(),
            description: (*description).to_string(),
            tags: vec!["game-master".to_string()],
            examples: Vec::new(),
        })
        .collect()
}

fn agent_card(bind_addr: &str) -> AgentCard {
    debug_assert_eq!(skill_descriptors().len(), MANDATORY_SKILL_IDS.len());
    AgentCard {
        protocol_version: "0.2".to_string(),
        name: "game-master".to_string(),
        description: "Authoritative social-deduction game server".to_string(),
        url: format!("http://{bind_addr}/a2a"),
        preferred_transport: "JSONRPC".to_string(),
        capabilities: AgentCapabilities { streaming: true, push: false, history: false },
        skills: skill_descriptors(),
        security_schemes: vec![SecurityScheme {
            kind: "message-signature".to_string(),
            description: "Every request carries a recoverable ECDSA signature over a canonical payload.".to_string(),
        }],
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, hyper::Error> {
    Ok(req.collect().await?.to_bytes())
}

/// Dispatches one inbound HTTP request to the right C10 route.
pub async fn serve(state: Arc<AppState>, bind_addr: String, req: Request<Incoming>) -> HttpResult {
    match (req.method().clone(), req.uri().path()) {
        (Method::GET, "/.well-known/agent-card.json") => {
            json_response(StatusCode::OK, &serde_json::to_value(agent_card(&bind_addr)).unwrap())
        }
        (Method::GET, "/health") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "status": "ok",
                "sessions": state.sessions.session_count(),
                "players": state.sessions.player_count(),
            }),
        ),
        (Method::POST, "/a2a") => handle_rpc(state, req).await,
        (Method::GET, "/debug/state") if state.dev_mode => json_response(
            StatusCode::OK,
            &serde_json::json!({"session_ids": state.sessions.all_session_ids()}),
        ),
        (Method::GET, "/debug/players") if state.dev_mode => {
            json_response(StatusCode::OK, &serde_json::json!({"player_count": state.sessions.player_count()}))
        }
        (Method::GET, "/debug/ship") if state.dev_mode => {
            let rooms: Vec<_> = crate::ship_map::DEFAULT_SHIP_MAP.all_rooms();
            json_response(StatusCode::OK, &serde_json::to_value(rooms).unwrap())
        }
        (Method::POST, "/debug/reset") if state.dev_mode => {
            state.sessions.reset();
            info!("(http.serve) Dev-mode reset invoked; all sessions cleared.");
            json_response(StatusCode::OK, &serde_json::json!({"reset": true}))
        }
        (_, path) if path.starts_with("/debug/") => {
            warn!("(http.serve) Debug route {} requested outside dev mode.", path);
            json_response(StatusCode::FORBIDDEN, &serde_json::json!({"error": "debug routes are disabled"}))
        }
        _ => not_found(),
    }
}

async fn handle_rpc(state: Arc<AppState>, req: Request<Incoming>) -> HttpResult {
    let bytes = match read_body(req).await {
        Ok(b) => b,
        Err(e) => {
            warn!("(http.handle_rpc) Failed to read request body: {:?}", e);
            return json_response(StatusCode::BAD_REQUEST, &serde_json::json!({"error": "could not read body"}));
        }
    };

    let request: RpcRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(e) => {
            let response = RpcResponse::err(
                serde_json::Value::Null,
                crate::error::RpcError::new(crate::error::RpcErrorCode::InvalidRequest, format!("malformed envelope: {e}")),
            );
            return json_response(StatusCode::OK, &serde_json::to_value(response).unwrap());
        }
    };

    let (response, stream) = rpc::handle(&state, request).await;
    match stream {
        StreamOutcome::Stream { snapshot, rx } => {
            let request_id = response.id.clone();
            let first_envelope = match snapshot {
                Some(projection) => RpcResponse::ok(request_id.clone(), serde_json::to_value(projection).unwrap()),
                None => response,
            };
            let first = Bytes::from(format!("{}\n", serde_json::to_string(&first_envelope).unwrap()));
            let body = EventStreamBody { first: Some(first), request_id, rx };
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/x-ndjson")
                .body(body.boxed())
                .unwrap())
        }
        StreamOutcome::None => json_response(StatusCode::OK, &serde_json::to_value(response).unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_card_lists_all_mandatory_skills_in_order() {
        let card = agent_card("127.0.0.1:4000");
        let ids: Vec<&str> = card.skills.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, MANDATORY_SKILL_IDS.to_vec());
    }

    #[test]
    fn agent_card_advertises_streaming_without_push_or_history() {
        let card = agent_card("127.0.0.1:4000");
        assert!(card.capabilities.streaming);
        assert!(!card.capabilities.push);
        assert!(!card.capabilities.history);
    }
}
