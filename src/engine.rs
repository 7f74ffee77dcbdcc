//! Session engine (C5) — the heart of the system.
//!
//! One `SessionEngine` per game. Every public method is the "pure function
//! of current state, returns `(accepted, message, events)`" shape the spec
//! demands, modeled here as [`OperationOutcome`]; the caller re-broadcasts
//! `outcome.events` onto the subscription hub (C9) only after the mutating
//! lock guard has already been dropped, so a subscriber that calls back
//! into the engine from its handler always observes durable state (design
//! note "observer callbacks -> typed event channel"). This mirrors the
//! teacher's `Entity`/`Ship` mutation style in `entity.rs` — direct field
//! mutation behind a single lock, `Result`-ish returns instead of panics —
//! generalized to a turn-based social game instead of a physics tick.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::GameRules;
use crate::payloads::{AvailableActions, StatusProjection};
use crate::ship_map::{ShipMap, CAFETERIA};
use crate::task_catalog::TaskCatalog;
use crate::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Crewmate,
    Imposter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Lobby,
    Playing,
    Discussion,
    Voting,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteChoice {
    Target(String),
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VentAction {
    Enter,
    Exit,
}

/// Who may observe an event, per spec §3/§4.9.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    ImpostersOnly,
    Specific(Vec<String>),
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: String,
    pub session_id: String,
    pub timestamp: i64,
    pub payload: serde_json::Value,
    pub visibility: Visibility,
}

/// Result object every engine operation returns instead of raising (design
/// note "exceptions as control flow -> result objects", spec §9). `data`
/// carries the structured payload read-only operations need (e.g. the
/// status projection) without pretending it is a state-mutating event.
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub accepted: bool,
    pub message: String,
    pub events: Vec<Event>,
    pub data: Option<serde_json::Value>,
}

impl OperationOutcome {
    fn rejected(message: impl Into<String>) -> Self {
        OperationOutcome { accepted: false, message: message.into(), events: Vec::new(), data: None }
    }

    fn accepted(message: impl Into<String>, events: Vec<Event>) -> Self {
        OperationOutcome { accepted: true, message: message.into(), events, data: None }
    }

    fn accepted_with_data(message: impl Into<String>, events: Vec<Event>, data: serde_json::Value) -> Self {
        OperationOutcome { accepted: true, message: message.into(), events, data: Some(data) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Player {
    pub player_id: String,
    pub address: String,
    pub display_name: String,
    pub role: Option<Role>,
    pub room: String,
    pub alive: bool,
    pub assigned_tasks: Vec<String>,
    pub completed_tasks: Vec<String>,
    pub task_steps: HashMap<String, usize>,
    pub last_kill_unix: Option<i64>,
    pub meetings_used: u32,
    pub last_action_unix: i64,
}

impl Player {
    fn new(player_id: String, address: String, display_name: String, now: i64) -> Self {
        Player {
            player_id,
            address,
            display_name,
            role: None,
            room: CAFETERIA.to_string(),
            alive: true,
            assigned_tasks: Vec::new(),
            completed_tasks: Vec::new(),
            task_steps: HashMap::new(),
            last_kill_unix: None,
            meetings_used: 0,
            last_action_unix: now,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub phase: Phase,
    pub round: u64,
    pub players: HashMap<String, Player>,
    pub join_order: Vec<String>,
    pub imposters: HashSet<String>,
    pub dead: HashSet<String>,
    pub votes: HashMap<String, VoteChoice>,
    pub discussion_started_at: Option<i64>,
    pub voting_started_at: Option<i64>,
    pub winner: Option<String>,
    pub(crate) phase_epoch: u64,
}

impl Session {
    fn new(session_id: String) -> Self {
        Session {
            session_id,
            phase: Phase::Lobby,
            round: 0,
            players: HashMap::new(),
            join_order: Vec::new(),
            imposters: HashSet::new(),
            dead: HashSet::new(),
            votes: HashMap::new(),
            discussion_started_at: None,
            voting_started_at: None,
            winner: None,
            phase_epoch: 0,
        }
    }

    fn alive_count(&self) -> usize {
        self.players.values().filter(|p| p.alive).count()
    }

    fn alive_imposters(&self) -> usize {
        self.players
            .values()
            .filter(|p| p.alive && p.role == Some(Role::Imposter))
            .count()
    }

    fn alive_crewmates(&self) -> usize {
        self.players
            .values()
            .filter(|p| p.alive && p.role == Some(Role::Crewmate))
            .count()
    }

    /// Tie-break order per spec §4.5.4: crewmate task completion, then
    /// imposter parity, then crewmate elimination.
    fn win_condition(&self) -> Option<(&'static str, &'static str)> {
        let crewmates: Vec<&Player> =
            self.players.values().filter(|p| p.role == Some(Role::Crewmate)).collect();
        if !crewmates.is_empty() {
            let assigned: HashSet<&str> =
                crewmates.iter().flat_map(|p| p.assigned_tasks.iter().map(String::as_str)).collect();
            let completed: HashSet<&str> =
                crewmates.iter().flat_map(|p| p.completed_tasks.iter().map(String::as_str)).collect();
            if !assigned.is_empty() && assigned.is_subset(&completed) {
                return Some(("crewmates", "all tasks completed"));
            }
        }
        if self.alive_imposters() > 0 && self.alive_imposters() >= self.alive_crewmates() {
            return Some(("imposters", "imposter parity reached"));
        }
        if self.alive_imposters() == 0 && !self.imposters.is_empty() {
            return Some(("crewmates", "all imposters eliminated"));
        }
        None
    }
}

/// One instance per game; owns a `Session` behind a mutex. Every public
/// method returns its events as part of its `OperationOutcome` rather than
/// pushing them onto an internal channel; the caller (the RPC layer or the
/// session manager's timer sweep) re-broadcasts them through the
/// subscription hub (C9) after dropping the engine's lock.
pub struct SessionEngine {
    state: Mutex<Session>,
    rules: GameRules,
    ship_map: &'static ShipMap,
    task_catalog: &'static TaskCatalog,
    rng: Mutex<SmallRng>,
    test_mode: bool,
}

impl SessionEngine {
    #[must_use]
    pub fn new(
        session_id: String,
        rules: GameRules,
        ship_map: &'static ShipMap,
        task_catalog: &'static TaskCatalog,
        test_mode: bool,
    ) -> Arc<Self> {
        let rng = if test_mode {
            SmallRng::seed_from_u64(session_id_seed(&session_id))
        } else {
            SmallRng::from_entropy()
        };
        Arc::new(SessionEngine {
            state: Mutex::new(Session::new(session_id)),
            rules,
            ship_map,
            task_catalog,
            rng: Mutex::new(rng),
            test_mode,
        })
    }

    /// Read-only defensive snapshot (design note: prefer snapshots to
    /// shared mutable references).
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.state.lock().unwrap().clone()
    }

    #[must_use]
    pub fn session_id(&self) -> String {
        self.state.lock().unwrap().session_id.clone()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    #[must_use]
    pub fn player_count(&self) -> usize {
        self.state.lock().unwrap().players.len()
    }

    #[must_use]
    pub fn contains_player(&self, player_id: &str) -> bool {
        self.state.lock().unwrap().players.contains_key(player_id)
    }

    fn event(session_id: &str, event_type: &str, payload: serde_json::Value, visibility: Visibility) -> Event {
        Event {
            event_type: event_type.to_string(),
            session_id: session_id.to_string(),
            timestamp: now_unix(),
            payload,
            visibility,
        }
    }

    // ---- join / leave --------------------------------------------------

    pub fn join(&self, player_id: &str, address: &str, display_name: &str) -> OperationOutcome {
        let now = now_unix();
        let (outcome, start_events) = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Lobby {
                return OperationOutcome::rejected("game already in progress");
            }
            if state.players.len() >= self.rules.max_players {
                return OperationOutcome::rejected("session is full");
            }
            if state.players.contains_key(player_id) {
                return OperationOutcome::rejected("player already joined");
            }
            state.players.insert(
                player_id.to_string(),
                Player::new(player_id.to_string(), address.to_string(), display_name.to_string(), now),
            );
            state.join_order.push(player_id.to_string());
            let joined_event = Self::event(
                &state.session_id,
                "player-joined",
                serde_json::json!({"player_id": player_id, "display_name": display_name}),
                Visibility::Public,
            );
            let start_events = if state.players.len() >= self.rules.min_players {
                self.start_locked(&mut state)
            } else {
                Vec::new()
            };
            (vec![joined_event], start_events)
        };
        let mut events = outcome;
        events.extend(start_events);
        OperationOutcome::accepted("joined", events)
    }

    pub fn leave(&self, player_id: &str) -> OperationOutcome {
        let events = {
            let mut state = self.state.lock().unwrap();
            if state.players.remove(player_id).is_none() {
                return OperationOutcome::rejected("player not in session");
            }
            state.join_order.retain(|p| p != player_id);
            state.dead.remove(player_id);
            state.imposters.remove(player_id);
            let mut events = vec![Self::event(
                &state.session_id,
                "player-left",
                serde_json::json!({"player_id": player_id}),
                Visibility::Public,
            )];
            if state.phase == Phase::Playing {
                events.extend(self.check_win_locked(&mut state));
            }
            events
        };
        OperationOutcome::accepted("left", events)
    }

    // ---- start / role assignment ---------------------------------------

    /// Admissible per spec §4.5.1: `players >= min` and phase Lobby. Called
    /// automatically once the threshold is crossed on `join`, but exposed
    /// so the session manager can also force-start a lingering lobby.
    pub fn start(&self) -> OperationOutcome {
        let events = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Lobby {
                return OperationOutcome::rejected("game already started");
            }
            if state.players.len() < self.rules.min_players {
                return OperationOutcome::rejected(format!(
                    "need at least {} players to start",
                    self.rules.min_players
                ));
            }
            self.start_locked(&mut state)
        };
        OperationOutcome::accepted("started", events)
    }

    /// Caller must hold `state`'s lock already. Returns the events to emit
    /// once the lock is released.
    fn start_locked(&self, state: &mut Session) -> Vec<Event> {
        let n = state.players.len();
        let imposter_count = (n as f64 * self.rules.imposter_ratio).floor().max(1.0) as usize;
        let mut ids: Vec<String> = state.join_order.clone();
        {
            let mut rng = self.rng.lock().unwrap();
            ids.shuffle(&mut *rng);
        }
        let imposters: HashSet<String> = ids.into_iter().take(imposter_count.min(n)).collect();
        state.imposters = imposters.clone();
        state.phase = Phase::Playing;
        state.round = 1;
        state.phase_epoch += 1;

        let mut events = Vec::with_capacity(n + 1);
        for (player_id, player) in state.players.iter_mut() {
            player.room = CAFETERIA.to_string();
            if imposters.contains(player_id) {
                player.role = Some(Role::Imposter);
                player.assigned_tasks.clear();
            } else {
                player.role = Some(Role::Crewmate);
                let mut rng = self.rng.lock().unwrap();
                player.assigned_tasks = self.task_catalog.assign_random(self.rules.task_count, &mut rng);
            }
            events.push(Self::event(
                &state.session_id,
                "role-assigned",
                serde_json::json!({
                    "player_id": player_id,
                    "role": player.role,
                    "assigned_tasks": player.assigned_tasks,
                }),
                Visibility::Specific(vec![player_id.clone()]),
            ));
        }
        info!("(SessionEngine.start_locked) Session {} started with {} players, {} imposters.",
            state.session_id, n, imposter_count);
        events.push(Self::event(
            &state.session_id,
            "game-started",
            serde_json::json!({"player_count": n}),
            Visibility::Public,
        ));
        events
    }

    // ---- movement --------------------------------------------------------

    pub fn move_to_room(&self, player_id: &str, target_room: &str) -> OperationOutcome {
        let events = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Playing {
                return OperationOutcome::rejected("moves only allowed while playing");
            }
            let Some(player) = state.players.get(player_id) else {
                return OperationOutcome::rejected("unknown player");
            };
            if !player.alive {
                return OperationOutcome::rejected("dead players cannot move");
            }
            if !self.ship_map.adjacent(&player.room, target_room) {
                return OperationOutcome::rejected(format!("{target_room} is not adjacent to current room"));
            }
            let from = player.room.clone();
            state.players.get_mut(player_id).unwrap().room = target_room.to_string();
            vec![Self::event(
                &state.session_id,
                "player-moved",
                serde_json::json!({"player_id": player_id, "from": from, "to": target_room}),
                Visibility::Public,
            )]
        };
        OperationOutcome::accepted("moved", events)
    }

    // ---- tasks -------------------------------------------------------------

    pub fn complete_task(&self, player_id: &str, task_id: &str, input: &str) -> OperationOutcome {
        let (events, outcome_message) = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Playing {
                return OperationOutcome::rejected("tasks only progress while playing");
            }
            let Some(player) = state.players.get(player_id) else {
                return OperationOutcome::rejected("unknown player");
            };
            if player.role != Some(Role::Crewmate) {
                return OperationOutcome::rejected("only crewmates perform tasks");
            }
            if !player.assigned_tasks.iter().any(|t| t == task_id) {
                return OperationOutcome::rejected("task not assigned to this player");
            }
            if player.completed_tasks.iter().any(|t| t == task_id) {
                return OperationOutcome::rejected("task already completed");
            }
            let Some(task) = self.task_catalog.get(task_id) else {
                return OperationOutcome::rejected("unknown task");
            };
            if player.room != task.room {
                return OperationOutcome::rejected(format!("must be in {} to do this task", task.room));
            }
            if let Some(prereq) = &task.prerequisite_task_id {
                if !player.completed_tasks.iter().any(|t| t == prereq) {
                    return OperationOutcome::rejected(format!("prerequisite task '{prereq}' not completed"));
                }
            }
            let step = *player.task_steps.get(task_id).unwrap_or(&0);
            let result = self.task_catalog.validate(task_id, input, step);
            if !result.accepted {
                return OperationOutcome::rejected(result.message);
            }
            let player = state.players.get_mut(player_id).unwrap();
            if result.completed {
                player.completed_tasks.push(task_id.to_string());
                player.task_steps.remove(task_id);
            } else {
                player.task_steps.insert(task_id.to_string(), result.next_step);
            }
            if !result.completed {
                (Vec::new(), "step accepted".to_string())
            } else {
                let mut events = vec![Self::event(
                    &state.session_id,
                    "task-completed",
                    serde_json::json!({"player_id": player_id, "task_id": task_id}),
                    Visibility::Public,
                )];
                events.extend(self.check_win_locked(&mut state));
                (events, "task completed".to_string())
            }
        };
        OperationOutcome::accepted(outcome_message, events)
    }

    // ---- imposter actions ----------------------------------------------

    pub fn kill(&self, player_id: &str, target_id: &str) -> OperationOutcome {
        let now = now_unix();
        let events = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Playing {
                return OperationOutcome::rejected("kills only allowed while playing");
            }
            let Some(actor) = state.players.get(player_id) else {
                return OperationOutcome::rejected("unknown player");
            };
            if actor.role != Some(Role::Imposter) || !actor.alive {
                return OperationOutcome::rejected("only a living imposter may kill");
            }
            if let Some(last) = actor.last_kill_unix {
                let elapsed_ms = u64::try_from((now - last).max(0)).unwrap_or(0) * 1000;
                if elapsed_ms < self.rules.kill_cooldown_ms {
                    return OperationOutcome::rejected("kill is on cooldown");
                }
            }
            let actor_room = actor.room.clone();
            let Some(target) = state.players.get(target_id) else {
                return OperationOutcome::rejected("unknown target");
            };
            if !target.alive || target.role != Some(Role::Crewmate) || target.room != actor_room {
                return OperationOutcome::rejected("target is not a living crewmate in the same room");
            }

            state.players.get_mut(target_id).unwrap().alive = false;
            state.dead.insert(target_id.to_string());
            state.players.get_mut(player_id).unwrap().last_kill_unix = Some(now);

            let mut events = vec![Self::event(
                &state.session_id,
                "player-killed",
                serde_json::json!({"player_id": target_id, "room": actor_room}),
                Visibility::Public,
            )];
            events.extend(self.check_win_locked(&mut state));
            events
        };
        OperationOutcome::accepted("kill resolved", events)
    }

    pub fn use_vent(&self, player_id: &str, action: VentAction, target_room: Option<&str>) -> OperationOutcome {
        let events = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Playing {
                return OperationOutcome::rejected("vents only usable while playing");
            }
            let Some(actor) = state.players.get(player_id) else {
                return OperationOutcome::rejected("unknown player");
            };
            if actor.role != Some(Role::Imposter) || !actor.alive {
                return OperationOutcome::rejected("only a living imposter may use vents");
            }
            if !self.ship_map.has_vent(&actor.room) {
                return OperationOutcome::rejected("current room has no vent");
            }
            let from = actor.room.clone();
            let to = match (action, target_room) {
                (VentAction::Enter, Some(room)) => {
                    if !self.ship_map.vent_adjacent(&from, room) {
                        return OperationOutcome::rejected(format!("{room} is not vent-adjacent to {from}"));
                    }
                    room.to_string()
                }
                (VentAction::Enter, None) => return OperationOutcome::rejected("entering a vent requires a target room"),
                (VentAction::Exit, Some(_)) => return OperationOutcome::rejected("exiting a vent takes no target"),
                (VentAction::Exit, None) => from.clone(),
            };
            if action == VentAction::Enter {
                state.players.get_mut(player_id).unwrap().room = to.clone();
            }
            vec![Self::event(
                &state.session_id,
                "vent-used",
                serde_json::json!({"player_id": player_id, "action": action, "from": from, "to": to}),
                Visibility::ImpostersOnly,
            )]
        };
        OperationOutcome::accepted("vent used", events)
    }

    /// `urgent_deadline_ms` is a purely observational countdown for
    /// `oxygen`/`reactor` sabotage (SPEC_FULL.md §6); it does not gate or
    /// time out any engine state.
    pub fn sabotage(&self, player_id: &str, system: &str) -> OperationOutcome {
        const URGENT_SYSTEMS: [&str; 2] = ["oxygen", "reactor"];
        const URGENT_DEADLINE_MS: u64 = 45_000;

        let events = {
            let state = self.state.lock().unwrap();
            if state.phase != Phase::Playing {
                return OperationOutcome::rejected("sabotage only allowed while playing");
            }
            let Some(actor) = state.players.get(player_id) else {
                return OperationOutcome::rejected("unknown player");
            };
            if actor.role != Some(Role::Imposter) || !actor.alive {
                return OperationOutcome::rejected("only a living imposter may sabotage");
            }
            let urgent = URGENT_SYSTEMS.contains(&system);
            vec![Self::event(
                &state.session_id,
                "sabotage",
                serde_json::json!({
                    "system": system,
                    "urgent": urgent,
                    "urgent_deadline_ms": if urgent { Some(URGENT_DEADLINE_MS) } else { None },
                }),
                Visibility::Public,
            )]
        };
        OperationOutcome::accepted("sabotage triggered", events)
    }

    // ---- meetings / discussion / voting ---------------------------------

    pub fn call_meeting(&self, player_id: &str, body_id: Option<&str>) -> (OperationOutcome, Option<u64>) {
        let now = now_unix();
        let (events, discussion_ms) = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Playing {
                return (OperationOutcome::rejected("meetings only called while playing"), None);
            }
            let Some(actor) = state.players.get(player_id) else {
                return (OperationOutcome::rejected("unknown player"), None);
            };
            if !actor.alive {
                return (OperationOutcome::rejected("dead players cannot call meetings"), None);
            }
            let kind = match body_id {
                None => {
                    if actor.meetings_used >= self.rules.emergency_meetings {
                        return (OperationOutcome::rejected("no emergency meetings remaining"), None);
                    }
                    "emergency"
                }
                Some(body) => {
                    let actor_room = actor.room.clone();
                    let Some(body_player) = state.players.get(body) else {
                        return (OperationOutcome::rejected("unknown body"), None);
                    };
                    if body_player.alive || body_player.room != actor_room {
                        return (OperationOutcome::rejected("body must be dead and in the same room"), None);
                    }
                    "body-report"
                }
            };
            if kind == "emergency" {
                state.players.get_mut(player_id).unwrap().meetings_used += 1;
            }
            for player in state.players.values_mut() {
                if player.alive {
                    player.room = CAFETERIA.to_string();
                }
            }
            state.phase = Phase::Discussion;
            state.discussion_started_at = Some(now);
            state.votes.clear();
            state.phase_epoch += 1;
            let events = vec![Self::event(
                &state.session_id,
                "meeting-called",
                serde_json::json!({"player_id": player_id, "body_id": body_id, "kind": kind}),
                Visibility::Public,
            )];
            (events, Some(self.rules.discussion_time_ms))
        };
        (OperationOutcome::accepted("meeting called", events), discussion_ms)
    }

    pub fn send_chat(&self, player_id: &str, message: &str) -> OperationOutcome {
        let events = {
            let state = self.state.lock().unwrap();
            if state.phase != Phase::Discussion {
                return OperationOutcome::rejected("chat only allowed during discussion");
            }
            if !state.players.contains_key(player_id) {
                return OperationOutcome::rejected("unknown player");
            }
            vec![Self::event(
                &state.session_id,
                "chat-message",
                serde_json::json!({"player_id": player_id, "message": message}),
                Visibility::Public,
            )]
        };
        OperationOutcome::accepted("chat sent", events)
    }

    pub fn cast_vote(&self, player_id: &str, choice: VoteChoice) -> OperationOutcome {
        let (events, should_resolve) = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Voting {
                return OperationOutcome::rejected("voting is not open");
            }
            if !state.players.get(player_id).is_some_and(|p| p.alive) {
                return OperationOutcome::rejected("only living players may vote");
            }
            if state.votes.contains_key(player_id) {
                return OperationOutcome::rejected("already voted");
            }
            if let VoteChoice::Target(target) = &choice {
                if !state.players.get(target).is_some_and(|p| p.alive) {
                    return OperationOutcome::rejected("vote target must be alive");
                }
            }
            state.votes.insert(player_id.to_string(), choice.clone());
            let cast_event = Self::event(
                &state.session_id,
                "vote-cast",
                serde_json::json!({"player_id": player_id}),
                Visibility::Public,
            );
            let resolve = state.votes.len() >= state.alive_count();
            (vec![cast_event], resolve)
        };
        let mut outcome = OperationOutcome::accepted("vote recorded", events);
        if should_resolve {
            let resolution = self.resolve_voting();
            outcome.events.extend(resolution.events);
        }
        outcome
    }

    /// Tallies votes, ejects on plurality (ties/skip-plurality eject
    /// nobody), checks for a win, and transitions phase. Called either when
    /// every alive player has voted or when the voting timer fires.
    pub fn resolve_voting(&self) -> OperationOutcome {
        let events = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Voting {
                return OperationOutcome::rejected("not currently voting");
            }
            let mut tally: HashMap<String, usize> = HashMap::new();
            for choice in state.votes.values() {
                if let VoteChoice::Target(target) = choice {
                    *tally.entry(target.clone()).or_insert(0) += 1;
                }
            }
            let ejected = tally
                .iter()
                .max_by_key(|(_, count)| **count)
                .filter(|(_, &count)| tally.values().filter(|&&c| c == count).count() == 1)
                .map(|(id, _)| id.clone());

            let mut events = Vec::new();
            if let Some(ejected_id) = ejected {
                if let Some(player) = state.players.get_mut(&ejected_id) {
                    player.alive = false;
                    state.dead.insert(ejected_id.clone());
                    events.push(Self::event(
                        &state.session_id,
                        "player-ejected",
                        serde_json::json!({"player_id": ejected_id, "role": player.role}),
                        Visibility::Public,
                    ));
                }
            } else {
                events.push(Self::event(
                    &state.session_id,
                    "no-ejection",
                    serde_json::json!({}),
                    Visibility::Public,
                ));
            }

            events.extend(self.check_win_locked(&mut state));
            if state.phase != Phase::Ended {
                state.phase = Phase::Playing;
                state.round += 1;
                state.votes.clear();
                state.voting_started_at = None;
                state.phase_epoch += 1;
            }
            events
        };
        OperationOutcome::accepted("voting resolved", events)
    }

    /// Transitions Discussion -> Voting. Called by the discussion timer, or
    /// may be invoked early by a future extension; currently timer-only.
    pub fn begin_voting(&self) -> (OperationOutcome, Option<u64>) {
        let (events, voting_ms) = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Discussion {
                return (OperationOutcome::rejected("not in discussion"), None);
            }
            state.phase = Phase::Voting;
            state.voting_started_at = Some(now_unix());
            state.phase_epoch += 1;
            let events = vec![Self::event(
                &state.session_id,
                "voting-started",
                serde_json::json!({"duration_ms": self.rules.voting_time_ms}),
                Visibility::Public,
            )];
            (events, Some(self.rules.voting_time_ms))
        };
        (OperationOutcome::accepted("voting started", events), voting_ms)
    }

    /// Current epoch, for timer staleness checks (see `timers` module note
    /// in SPEC_FULL.md §9: "no-op if the phase has moved on").
    #[must_use]
    pub fn phase_epoch(&self) -> u64 {
        self.state.lock().unwrap().phase_epoch
    }

    /// Advances a timed phase transition (Discussion -> Voting -> resolved)
    /// if its deadline has elapsed; a no-op `OperationOutcome` otherwise.
    /// Called by the session manager's periodic sweep rather than a
    /// per-meeting spawned timer, so a late-arriving sweep tick can never
    /// race a phase the engine itself has already moved past.
    pub fn tick(&self) -> OperationOutcome {
        enum Due {
            BeginVoting,
            ResolveVoting,
        }
        let now = now_unix();
        let due = {
            let state = self.state.lock().unwrap();
            match state.phase {
                Phase::Discussion => {
                    let started = state.discussion_started_at.unwrap_or(now);
                    let elapsed_ms = u64::try_from((now - started).max(0)).unwrap_or(0) * 1000;
                    (elapsed_ms >= self.rules.discussion_time_ms).then_some(Due::BeginVoting)
                }
                Phase::Voting => {
                    let started = state.voting_started_at.unwrap_or(now);
                    let elapsed_ms = u64::try_from((now - started).max(0)).unwrap_or(0) * 1000;
                    (elapsed_ms >= self.rules.voting_time_ms).then_some(Due::ResolveVoting)
                }
                _ => None,
            }
        };
        match due {
            Some(Due::BeginVoting) => self.begin_voting().0,
            Some(Due::ResolveVoting) => self.resolve_voting(),
            None => OperationOutcome::rejected("no timer due"),
        }
    }

    fn check_win_locked(&self, state: &mut Session) -> Vec<Event> {
        let Some((winner, reason)) = state.win_condition() else {
            return Vec::new();
        };
        if state.phase == Phase::Ended {
            return Vec::new();
        }
        state.phase = Phase::Ended;
        state.winner = Some(winner.to_string());
        state.phase_epoch += 1;
        warn!(
            "(SessionEngine.check_win_locked) Session {} ended: {} win ({}).",
            state.session_id, winner, reason
        );
        vec![Self::event(
            &state.session_id,
            "game-ended",
            serde_json::json!({"winner": winner, "reason": reason}),
            Visibility::Public,
        )]
    }

    // ---- status projection -----------------------------------------------

    #[must_use]
    pub fn status_projection(&self, player_id: &str) -> Option<StatusProjection> {
        let state = self.state.lock().unwrap();
        let player = state.players.get(player_id)?;
        let nearby: Vec<String> = state
            .players
            .values()
            .filter(|p| p.player_id != player_id && p.room == player.room)
            .map(|p| p.player_id.clone())
            .collect();

        let is_imposter = player.role == Some(Role::Imposter);
        let dead_bodies_here: Vec<String> = state
            .dead
            .iter()
            .filter(|id| state.players.get(*id).is_some_and(|p| p.room == player.room))
            .cloned()
            .collect();

        let kill_targets: Vec<String> = if is_imposter && player.alive {
            state
                .players
                .values()
                .filter(|p| p.alive && p.role == Some(Role::Crewmate) && p.room == player.room)
                .map(|p| p.player_id.clone())
                .collect()
        } else {
            Vec::new()
        };

        let off_cooldown = match player.last_kill_unix {
            None => true,
            Some(last) => (u64::try_from((now_unix() - last).max(0)).unwrap_or(0)) * 1000 >= self.rules.kill_cooldown_ms,
        };
        let can_kill = is_imposter && player.alive && off_cooldown;

        let actions = AvailableActions {
            can_move: if state.phase == Phase::Playing && player.alive {
                self.ship_map
                    .room(&player.room)
                    .map(|r| r.adjacency.clone())
                    .unwrap_or_default()
            } else {
                Vec::new()
            },
            can_do_tasks: player
                .assigned_tasks
                .iter()
                .filter(|t| !player.completed_tasks.contains(t))
                .cloned()
                .collect(),
            can_kill,
            kill_targets: kill_targets.clone(),
            can_vent: is_imposter && player.alive && self.ship_map.has_vent(&player.room),
            vent_targets: if is_imposter {
                self.ship_map
                    .room(&player.room)
                    .map(|r| r.vent_adjacency.clone())
                    .unwrap_or_default()
            } else {
                Vec::new()
            },
            can_call_meeting: player.alive
                && state.phase == Phase::Playing
                && player.meetings_used < self.rules.emergency_meetings,
            can_report_body: player.alive && state.phase == Phase::Playing && !dead_bodies_here.is_empty(),
            dead_bodies: dead_bodies_here,
            can_vote: state.phase == Phase::Voting && player.alive && !state.votes.contains_key(player_id),
        };

        Some(StatusProjection {
            game_id: state.session_id.clone(),
            phase: state.phase,
            round: state.round,
            is_alive: player.alive,
            role: player.role,
            location: player.room.clone(),
            room_name: self
                .ship_map
                .room(&player.room)
                .map(|r| r.display_name.clone())
                .unwrap_or_else(|| player.room.clone()),
            nearby_players: nearby,
            task_ids: player.assigned_tasks.clone(),
            completed_task_ids: player.completed_tasks.clone(),
            players_alive: state.alive_count(),
            players_total: state.players.len(),
            tasks_remaining: if is_imposter {
                None
            } else {
                Some(player.assigned_tasks.len() - player.completed_tasks.len())
            },
            can_kill: if is_imposter { Some(can_kill) } else { None },
            kill_cooldown_s: if is_imposter {
                Some(self.rules.kill_cooldown_ms / 1000)
            } else {
                None
            },
            imposters_remaining: if is_imposter { Some(state.alive_imposters()) } else { None },
            actions,
        })
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        self.test_mode
    }
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

fn session_id_seed(session_id: &str) -> u64 {
    session_id.bytes().fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ship_map::DEFAULT_SHIP_MAP;
    use crate::task_catalog::DEFAULT_TASK_CATALOG;

    fn test_engine() -> Arc<SessionEngine> {
        SessionEngine::new(
            "s1".to_string(),
            GameRules { min_players: 5, max_players: 10, ..GameRules::default() },
            &DEFAULT_SHIP_MAP,
            &DEFAULT_TASK_CATALOG,
            true,
        )
    }

    fn join_n(engine: &SessionEngine, n: usize) {
        for i in 0..n {
            let outcome = engine.join(&format!("p{i}"), &format!("0xaddr{i}"), &format!("Player {i}"));
            assert!(outcome.accepted, "{}", outcome.message);
        }
    }

    #[test]
    fn fifth_join_starts_the_game_with_roles_and_tasks() {
        let engine = test_engine();
        join_n(&engine, 5);
        assert_eq!(engine.phase(), Phase::Playing);
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.players.len(), 5);
        let imposters: Vec<_> = snapshot.players.values().filter(|p| p.role == Some(Role::Imposter)).collect();
        assert!(!imposters.is_empty());
        for player in snapshot.players.values() {
            if player.role == Some(Role::Crewmate) {
                assert_eq!(player.assigned_tasks.len(), engine.rules.task_count);
            }
        }
    }

    #[test]
    fn move_rejects_non_adjacent_room() {
        let engine = test_engine();
        join_n(&engine, 5);
        let outcome = engine.move_to_room("p0", "reactor");
        assert!(!outcome.accepted);
    }

    #[test]
    fn move_accepts_adjacent_room() {
        let engine = test_engine();
        join_n(&engine, 5);
        let outcome = engine.move_to_room("p0", "weapons");
        assert!(outcome.accepted);
        assert_eq!(engine.snapshot().players["p0"].room, "weapons");
    }

    #[test]
    fn prerequisite_task_is_enforced() {
        let engine = test_engine();
        join_n(&engine, 5);
        // Force a crewmate onto the fuel chain by direct mutation for the test.
        let crewmate_id = {
            let mut state = engine.state.lock().unwrap();
            let id = state
                .players
                .values()
                .find(|p| p.role == Some(Role::Crewmate))
                .unwrap()
                .player_id
                .clone();
            let player = state.players.get_mut(&id).unwrap();
            player.assigned_tasks = vec!["fuel-download".to_string(), "fuel-upload".to_string()];
            player.room = "shields".to_string();
            id
        };
        let outcome = engine.complete_task(&crewmate_id, "fuel-upload", "anything");
        assert!(!outcome.accepted);
        assert!(outcome.message.contains("prerequisite"));
    }

    #[test]
    fn kill_requires_cooldown_between_attempts() {
        let engine = test_engine();
        join_n(&engine, 5);
        let (imposter, victim) = {
            let state = engine.state.lock().unwrap();
            let imposter = state.players.values().find(|p| p.role == Some(Role::Imposter)).unwrap().player_id.clone();
            let victim = state
                .players
                .values()
                .find(|p| p.role == Some(Role::Crewmate))
                .unwrap()
                .player_id
                .clone();
            (imposter, victim)
        };
        let first = engine.kill(&imposter, &victim);
        assert!(first.accepted);
        // Second target: everyone else is either dead or an imposter by now in a 5p game,
        // so re-attempt the same (now-dead) victim to exercise the cooldown path instead.
        let second = engine.kill(&imposter, &victim);
        assert!(!second.accepted);
    }

    #[test]
    fn vote_resolution_ejects_plurality_target() {
        let engine = test_engine();
        join_n(&engine, 5);
        {
            let mut state = engine.state.lock().unwrap();
            state.phase = Phase::Voting;
        }
        let ids: Vec<String> = engine.snapshot().players.keys().cloned().collect();
        engine.cast_vote(&ids[0], VoteChoice::Target(ids[4].clone()));
        engine.cast_vote(&ids[1], VoteChoice::Target(ids[4].clone()));
        engine.cast_vote(&ids[2], VoteChoice::Skip);
        engine.cast_vote(&ids[3], VoteChoice::Target(ids[4].clone()));
        let outcome = engine.cast_vote(&ids[4], VoteChoice::Target(ids[0].clone()));
        assert!(outcome.accepted);
        assert!(!engine.snapshot().players[&ids[4]].alive);
    }

    #[test]
    fn tick_advances_discussion_to_voting_once_the_deadline_has_passed() {
        let engine = SessionEngine::new(
            "s-tick".to_string(),
            GameRules { min_players: 5, max_players: 10, discussion_time_ms: 0, ..GameRules::default() },
            &DEFAULT_SHIP_MAP,
            &DEFAULT_TASK_CATALOG,
            true,
        );
        join_n(&engine, 5);
        let ids: Vec<String> = engine.snapshot().players.keys().cloned().collect();
        let (meeting, _) = engine.call_meeting(&ids[0], None);
        assert!(meeting.accepted);
        assert_eq!(engine.phase(), Phase::Discussion);

        let outcome = engine.tick();
        assert!(outcome.accepted);
        assert_eq!(engine.phase(), Phase::Voting);
    }

    #[test]
    fn tick_is_a_no_op_outside_discussion_or_voting() {
        let engine = test_engine();
        join_n(&engine, 5);
        assert_eq!(engine.phase(), Phase::Playing);
        let outcome = engine.tick();
        assert!(!outcome.accepted);
    }

    #[test]
    fn tied_vote_ejects_nobody() {
        let engine = test_engine();
        join_n(&engine, 5);
        {
            let mut state = engine.state.lock().unwrap();
            state.phase = Phase::Voting;
        }
        let ids: Vec<String> = engine.snapshot().players.keys().cloned().collect();
        engine.cast_vote(&ids[0], VoteChoice::Target(ids[1].clone()));
        engine.cast_vote(&ids[1], VoteChoice::Target(ids[0].clone()));
        engine.cast_vote(&ids[2], VoteChoice::Skip);
        engine.cast_vote(&ids[3], VoteChoice::Skip);
        engine.cast_vote(&ids[4], VoteChoice::Skip);
        let snapshot = engine.snapshot();
        assert!(snapshot.players[&ids[0]].alive);
        assert!(snapshot.players[&ids[1]].alive);
    }
}
