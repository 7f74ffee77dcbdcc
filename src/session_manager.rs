//! Session manager (C6): lobby assignment and lifecycle across concurrently
//! running sessions. Owns `sessions[session_id]` and `assignment[player_id]`;
//! never touches a `Session`'s internals directly — all mutation still goes
//! through the owning `SessionEngine`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::GameRules;
use crate::engine::{Phase, SessionEngine};
use crate::hub::SubscriptionHub;
use crate::ship_map::ShipMap;
use crate::task_catalog::TaskCatalog;
use crate::{debug, info};

struct ManagedSession {
    engine: Arc<SessionEngine>,
    ended_at: Option<Instant>,
}

/// Maintains the lobby-assignment and session-lifecycle bookkeeping the
/// dispatcher (C7) relies on to locate the right `SessionEngine`.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, ManagedSession>>,
    assignment: Mutex<HashMap<String, String>>,
    rules: GameRules,
    ship_map: &'static ShipMap,
    task_catalog: &'static TaskCatalog,
    test_mode: bool,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        rules: GameRules,
        ship_map: &'static ShipMap,
        task_catalog: &'static TaskCatalog,
        test_mode: bool,
    ) -> Self {
        SessionManager {
            sessions: Mutex::new(HashMap::new()),
            assignment: Mutex::new(HashMap::new()),
            rules,
            ship_map,
            task_catalog,
            test_mode,
        }
    }

    /// Returns the engine for the smallest existing Lobby-phase session with
    /// room to spare, or creates a new session if none qualifies. Does not
    /// itself add the player (the dispatcher does that after signature
    /// verification, per spec §4.6).
    #[must_use]
    pub fn assign_lobby(&self, player_id: &str) -> Arc<SessionEngine> {
        if let Some(session_id) = self.assignment.lock().unwrap().get(player_id).cloned() {
            if let Some(existing) = self.sessions.lock().unwrap().get(&session_id) {
                return existing.engine.clone();
            }
        }

        let mut sessions = self.sessions.lock().unwrap();
        let candidate = sessions
            .values()
            .filter(|s| s.engine.phase() == Phase::Lobby && s.engine.player_count() < self.rules.max_players)
            .min_by_key(|s| s.engine.player_count())
            .map(|s| s.engine.clone());

        let engine = candidate.unwrap_or_else(|| {
            let session_id = Uuid::new_v4().to_string();
            let engine = SessionEngine::new(
                session_id.clone(),
                self.rules,
                self.ship_map,
                self.task_catalog,
                self.test_mode,
            );
            info!("(SessionManager.assign_lobby) Created session {}.", session_id);
            sessions.insert(session_id, ManagedSession { engine: engine.clone(), ended_at: None });
            engine
        });

        self.assignment.lock().unwrap().insert(player_id.to_string(), engine.session_id());
        engine
    }

    /// If the assignment map is missing an entry but some live session
    /// already contains the player (a join race), re-establish the mapping.
    pub fn heal_assignment(&self, player_id: &str) -> Option<Arc<SessionEngine>> {
        if self.assignment.lock().unwrap().contains_key(player_id) {
            return self.lookup(player_id);
        }
        let sessions = self.sessions.lock().unwrap();
        let found = sessions.values().find(|s| s.engine.contains_player(player_id)).map(|s| s.engine.clone());
        if let Some(engine) = &found {
            debug!("(SessionManager.heal_assignment) Re-linked player {} to session {}.", player_id, engine.session_id());
            self.assignment.lock().unwrap().insert(player_id.to_string(), engine.session_id());
        }
        found
    }

    #[must_use]
    pub fn lookup(&self, player_id: &str) -> Option<Arc<SessionEngine>> {
        let session_id = self.assignment.lock().unwrap().get(player_id).cloned()?;
        self.sessions.lock().unwrap().get(&session_id).map(|s| s.engine.clone())
    }

    #[must_use]
    pub fn lookup_session(&self, session_id: &str) -> Option<Arc<SessionEngine>> {
        self.sessions.lock().unwrap().get(session_id).map(|s| s.engine.clone())
    }

    pub fn remove_player(&self, player_id: &str) {
        self.assignment.lock().unwrap().remove(player_id);
    }

    /// Called after observing (via the event stream) that a session reached
    /// `Ended`, so `reap_ended` has something to measure a grace period from.
    pub fn mark_ended(&self, session_id: &str) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(session_id) {
            session.ended_at.get_or_insert_with(Instant::now);
        }
    }

    /// Removes sessions that have been `Ended` for longer than `grace`.
    /// Sessions whose engine just reached `Ended` are timestamped here on
    /// first sight, so the grace period always starts from observation.
    pub fn reap_ended(&self, grace: Duration) {
        let mut sessions = self.sessions.lock().unwrap();
        for session in sessions.values_mut() {
            if session.engine.phase() == Phase::Ended {
                session.ended_at.get_or_insert_with(Instant::now);
            }
        }
        let before = sessions.len();
        sessions.retain(|_, s| !s.ended_at.is_some_and(|at| at.elapsed() >= grace));
        let reaped = before - sessions.len();
        if reaped > 0 {
            info!("(SessionManager.reap_ended) Reaped {} ended session(s).", reaped);
        }
    }

    /// Periodic sweep (companion to `reap_ended`): advances every session's
    /// timed phase transitions and broadcasts whatever events fall out,
    /// since nothing else drives `SessionEngine::tick` on a schedule.
    pub fn tick_all(&self, hub: &SubscriptionHub) {
        let engines: Vec<Arc<SessionEngine>> = self.sessions.lock().unwrap().values().map(|s| s.engine.clone()).collect();
        for engine in engines {
            let outcome = engine.tick();
            if outcome.accepted && !outcome.events.is_empty() {
                let snapshot = engine.snapshot();
                for event in &outcome.events {
                    hub.broadcast(event, &snapshot);
                }
            }
        }
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    #[must_use]
    pub fn player_count(&self) -> usize {
        self.sessions.lock().unwrap().values().map(|s| s.engine.player_count()).sum()
    }

    #[must_use]
    pub fn all_session_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Test/debug-only: discards every session and assignment.
    pub fn reset(&self) {
        self.sessions.lock().unwrap().clear();
        self.assignment.lock().unwrap().clear();
    }
}
