//! Subscription hub (C9): long-lived per-player sinks, filtered delivery.
//!
//! Deliberately dumb: the hub owns subscription records and nothing else.
//! It never touches engine state and never raises into it — a write to a
//! closed or lagging sink is removed silently, matching spec §4.9 / §5
//! ("subscription-hub writes happen outside the session lock").

use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::{Event, Role, Session, Visibility};
use crate::warn;

/// A write-only handle to a client's long-lived streaming response.
pub type Sink = mpsc::UnboundedSender<Event>;

struct Subscription {
    subscription_id: String,
    player_id: String,
    sink: Sink,
}

/// Keys subscriptions by `player_id`; many may exist per player (reconnects
/// create new ones rather than replacing the old one, per spec §3).
#[derive(Default)]
pub struct SubscriptionHub {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SubscriptionHub {
    #[must_use]
    pub fn new() -> Self {
        SubscriptionHub::default()
    }

    /// Registers a new sink for `player_id`, returning its subscription id
    /// and the receiving half the caller streams to the client.
    pub fn subscribe(&self, player_id: &str) -> (String, mpsc::UnboundedReceiver<Event>) {
        let (sink, rx) = mpsc::unbounded_channel();
        let subscription_id = Uuid::new_v4().to_string();
        self.subscriptions.lock().unwrap().push(Subscription {
            subscription_id: subscription_id.clone(),
            player_id: player_id.to_string(),
            sink,
        });
        (subscription_id, rx)
    }

    pub fn unsubscribe(&self, subscription_id: &str) {
        self.subscriptions.lock().unwrap().retain(|s| s.subscription_id != subscription_id);
    }

    /// Closes every subscription belonging to `player_id` (spec §4.8
    /// `tasks/cancel`: "closes subscriptions for this task").
    pub fn unsubscribe_player(&self, player_id: &str) {
        self.subscriptions.lock().unwrap().retain(|s| s.player_id != player_id);
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Delivers `event` to every subscriber entitled to see it, per the
    /// visibility rules in spec §4.9. `session` provides the role lookups
    /// needed for `ImpostersOnly` filtering. Dead sinks are dropped.
    pub fn broadcast(&self, event: &Event, session: &Session) {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        subscriptions.retain(|sub| {
            if !Self::is_visible_to(event, &sub.player_id, session) {
                return true;
            }
            match sub.sink.send(event.clone()) {
                Ok(()) => true,
                Err(_) => {
                    warn!(
                        "(SubscriptionHub.broadcast) Sink for player {} closed; removing subscription.",
                        sub.player_id
                    );
                    false
                }
            }
        });
    }

    fn is_visible_to(event: &Event, player_id: &str, session: &Session) -> bool {
        match &event.visibility {
            Visibility::Public => true,
            Visibility::ImpostersOnly => session
                .players
                .get(player_id)
                .is_some_and(|p| p.role == Some(Role::Imposter)),
            Visibility::Specific(recipients) => recipients.iter().any(|id| id == player_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Player;
    use std::collections::{HashMap as Map, HashSet};

    fn session_with(player_id: &str, role: Role) -> Session {
        let mut players = Map::new();
        players.insert(
            player_id.to_string(),
            Player {
                player_id: player_id.to_string(),
                address: "0xabc".to_string(),
                display_name: "P".to_string(),
                role: Some(role),
                room: "cafeteria".to_string(),
                alive: true,
                assigned_tasks: Vec::new(),
                completed_tasks: Vec::new(),
                task_steps: Map::new(),
                last_kill_unix: None,
                meetings_used: 0,
                last_action_unix: 0,
            },
        );
        Session {
            session_id: "s1".to_string(),
            phase: crate::engine::Phase::Playing,
            round: 1,
            players,
            join_order: vec![player_id.to_string()],
            imposters: HashSet::new(),
            dead: HashSet::new(),
            votes: Map::new(),
            discussion_started_at: None,
            voting_started_at: None,
            winner: None,
            phase_epoch: 0,
        }
    }

    fn event(visibility: Visibility) -> Event {
        Event {
            event_type: "test-event".to_string(),
            session_id: "s1".to_string(),
            timestamp: 0,
            payload: serde_json::json!({}),
            visibility,
        }
    }

    #[test]
    fn imposters_only_event_is_withheld_from_crewmate() {
        let hub = SubscriptionHub::new();
        let (_id, mut rx) = hub.subscribe("crewmate-1");
        let session = session_with("crewmate-1", Role::Crewmate);
        hub.broadcast(&event(Visibility::ImpostersOnly), &session);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn public_event_reaches_every_subscriber() {
        let hub = SubscriptionHub::new();
        let (_id, mut rx) = hub.subscribe("p1");
        let session = session_with("p1", Role::Crewmate);
        hub.broadcast(&event(Visibility::Public), &session);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn specific_event_reaches_only_named_recipient() {
        let hub = SubscriptionHub::new();
        let (_id, mut rx_a) = hub.subscribe("a");
        let (_id2, mut rx_b) = hub.subscribe("b");
        let session = session_with("a", Role::Crewmate);
        hub.broadcast(&event(Visibility::Specific(vec!["a".to_string()])), &session);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn dropped_receiver_is_pruned_on_next_broadcast() {
        let hub = SubscriptionHub::new();
        let (_id, rx) = hub.subscribe("p1");
        drop(rx);
        let session = session_with("p1", Role::Crewmate);
        hub.broadcast(&event(Visibility::Public), &session);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
