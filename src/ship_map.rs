//! Static ship map (C1): a directed graph of rooms, walking adjacency, and
//! vent shortcuts. Constructed once at boot and shared read-only for the
//! life of the process, the way the teacher treats `SHIP_TEMPLATES`
//! (`ship.rs`) — a `once_cell::sync::Lazy` built from a fixed table rather
//! than loaded from a scenario file, since the map here is part of the game
//! rules rather than per-session content.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// A single room on the ship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub display_name: String,
    pub adjacency: Vec<String>,
    pub has_vent: bool,
    pub vent_adjacency: Vec<String>,
}

/// The room with the emergency button; meetings teleport everyone here.
pub const CAFETERIA: &str = "cafeteria";

#[derive(Debug, Default)]
pub struct ShipMap {
    rooms: HashMap<String, Room>,
}

impl ShipMap {
    #[must_use]
    pub fn new(rooms: Vec<Room>) -> Self {
        ShipMap {
            rooms: rooms.into_iter().map(|r| (r.id.clone(), r)).collect(),
        }
    }

    /// O(1) lookup; unknown ids are `None`, never an error.
    #[must_use]
    pub fn room(&self, id: &str) -> Option<&Room> {
        self.rooms.get(id)
    }

    #[must_use]
    pub fn all_rooms(&self) -> Vec<&Room> {
        self.rooms.values().collect()
    }

    /// True iff `to` is walk-adjacent to `from`. Unknown ids return `false`.
    #[must_use]
    pub fn adjacent(&self, from: &str, to: &str) -> bool {
        self.rooms
            .get(from)
            .is_some_and(|room| room.adjacency.iter().any(|n| n == to))
    }

    /// True iff `to` is vent-adjacent to `from`. Unknown ids return `false`.
    #[must_use]
    pub fn vent_adjacent(&self, from: &str, to: &str) -> bool {
        self.rooms
            .get(from)
            .is_some_and(|room| room.has_vent && room.vent_adjacency.iter().any(|n| n == to))
    }

    #[must_use]
    pub fn has_vent(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).is_some_and(|r| r.has_vent)
    }

    #[must_use]
    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }
}

fn default_rooms() -> Vec<Room> {
    // A small, symmetric-for-walking ship layout with a few vent shortcuts.
    // Walking adjacency is kept symmetric by construction below; vent
    // adjacency intentionally is not (spec §3).
    let walking: &[(&str, &[&str])] = &[
        (CAFETERIA, &["weapons", "medbay", "admin", "storage"]),
        ("weapons", &[CAFETERIA, "o2", "navigation"]),
        ("o2", &["weapons", "navigation", "shields"]),
        ("navigation", &["weapons", "o2", "shields"]),
        ("shields", &["o2", "navigation", "communications"]),
        ("communications", &["shields", "storage"]),
        ("storage", &[CAFETERIA, "communications", "electrical", "admin"]),
        ("electrical", &["storage", "medbay"]),
        ("medbay", &[CAFETERIA, "electrical", "admin"]),
        ("admin", &[CAFETERIA, "storage", "medbay", "reactor"]),
        ("reactor", &["admin", "upper_engine", "lower_engine"]),
        ("upper_engine", &["reactor", "security", "lower_engine"]),
        ("lower_engine", &["reactor", "security", "upper_engine"]),
        ("security", &["upper_engine", "lower_engine"]),
    ];

    let vents: &[(&str, &[&str])] = &[
        ("reactor", &["upper_engine", "lower_engine", "security"]),
        ("upper_engine", &["reactor", "security"]),
        ("lower_engine", &["reactor", "security"]),
        ("security", &["upper_engine", "lower_engine", "reactor"]),
        ("medbay", &["electrical", "security"]),
        ("electrical", &["medbay"]),
        (CAFETERIA, &["admin", "weapons"]),
        ("admin", &[CAFETERIA]),
        ("weapons", &[CAFETERIA, "navigation"]),
        ("navigation", &["weapons", "shields"]),
        ("shields", &["navigation"]),
    ];

    let vent_rooms: HashSet<&str> = vents.iter().map(|(room, _)| *room).collect();
    let vent_adjacency: HashMap<&str, &[&str]> = vents.iter().copied().collect();

    walking
        .iter()
        .map(|(id, adj)| Room {
            id: (*id).to_string(),
            display_name: display_name_for(id),
            adjacency: adj.iter().map(|s| (*s).to_string()).collect(),
            has_vent: vent_rooms.contains(id),
            vent_adjacency: vent_adjacency
                .get(id)
                .map(|list| list.iter().map(|s| (*s).to_string()).collect())
                .unwrap_or_default(),
        })
        .collect()
}

fn display_name_for(id: &str) -> String {
    id.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub static DEFAULT_SHIP_MAP: Lazy<ShipMap> = Lazy::new(|| ShipMap::new(default_rooms()));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cafeteria_is_central_and_has_no_vent_by_default_adjacency() {
        let map = &*DEFAULT_SHIP_MAP;
        assert!(map.contains(CAFETERIA));
        assert!(map.adjacent(CAFETERIA, "weapons"));
        assert!(map.adjacent("weapons", CAFETERIA));
    }

    #[test]
    fn unknown_room_queries_return_false_not_panic() {
        let map = &*DEFAULT_SHIP_MAP;
        assert!(!map.adjacent("nowhere", "also_nowhere"));
        assert!(!map.vent_adjacent("nowhere", CAFETERIA));
        assert!(map.room("nowhere").is_none());
    }

    #[test]
    fn vent_adjacency_can_be_asymmetric() {
        let map = &*DEFAULT_SHIP_MAP;
        // medbay -> security via vents, but security's vent list does not
        // loop back to medbay (intentionally asymmetric per spec §3).
        assert!(map.vent_adjacent("medbay", "security"));
        assert!(!map.vent_adjacent("security", "medbay"));
    }

    #[test]
    fn only_vented_rooms_report_has_vent() {
        let map = &*DEFAULT_SHIP_MAP;
        assert!(map.has_vent("reactor"));
        assert!(!map.has_vent("o2"));
    }
}
