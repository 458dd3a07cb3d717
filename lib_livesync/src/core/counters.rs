//! # Delta Counters
//!
//! Per-room `{home, away}` message counters. A pulled snapshot seeds a room,
//! pushed deltas add one to a side. There are no sequence numbers, so a
//! delta missed during a reconnect gap stays missed until the next pull.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::lock;
use crate::error::FetchError;
use crate::model::{CounterSnapshot, RoomId, Side};
use crate::retrieve::SyncBackend;

#[derive(Default)]
pub struct CounterSynchronizer {
    rooms: Mutex<HashMap<RoomId, CounterSnapshot>>,
    last_error: Mutex<Option<String>>,
}

impl CounterSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pulls a snapshot for `room_ids` and installs it.
    ///
    /// The fetch runs without holding any lock. On failure, rooms we already
    /// track keep their values and new rooms start at zero.
    pub async fn load_snapshot<B: SyncBackend>(&self, backend: &B, room_ids: &[RoomId]) -> HashMap<RoomId, CounterSnapshot> {
        let fetched = backend.fetch_counts(room_ids).await;
        self.install(room_ids, fetched)
    }

    /// Installs the result of a snapshot pull. Idempotent for the same input.
    pub fn install(
        &self,
        room_ids: &[RoomId],
        fetched: Result<HashMap<RoomId, CounterSnapshot>, FetchError>,
    ) -> HashMap<RoomId, CounterSnapshot> {
        let mut rooms = lock(&self.rooms);
        match fetched {
            Ok(mut snapshot) => {
                for id in room_ids {
                    let value = snapshot.remove(id).unwrap_or_default();
                    rooms.insert(id.clone(), value);
                }
            }
            Err(e) => {
                tracing::warn!(rooms = ?room_ids, error = %e, "Counter snapshot pull failed; keeping local values");
                *lock(&self.last_error) = Some(e.to_string());
                for id in room_ids {
                    rooms.entry(id.clone()).or_default();
                }
            }
        }
        room_ids
            .iter()
            .filter_map(|id| rooms.get(id).map(|c| (id.clone(), *c)))
            .collect()
    }

    /// Adds one to `side`. Rooms without a snapshot are left alone.
    pub fn apply_delta(&self, room_id: &str, side: Side) -> Option<CounterSnapshot> {
        let mut rooms = lock(&self.rooms);
        match rooms.get_mut(room_id) {
            Some(counter) => {
                counter.bump(side);
                Some(*counter)
            }
            None => {
                tracing::trace!(room_id, %side, "Delta for untracked room ignored");
                None
            }
        }
    }

    pub fn get(&self, room_id: &str) -> Option<CounterSnapshot> {
        lock(&self.rooms).get(room_id).copied()
    }

    pub fn drop_rooms(&self, room_ids: &[RoomId]) {
        let mut rooms = lock(&self.rooms);
        for id in room_ids {
            rooms.remove(id);
        }
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<RoomId> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn snapshot_plus_deltas() {
        let counters = CounterSynchronizer::new();
        let mut pulled = HashMap::new();
        pulled.insert("42".to_string(), CounterSnapshot::new(0, 0));
        counters.install(&ids(&["42"]), Ok(pulled));

        counters.apply_delta("42", Side::Home);
        counters.apply_delta("42", Side::Home);
        counters.apply_delta("42", Side::Away);
        assert_eq!(counters.get("42"), Some(CounterSnapshot::new(2, 1)));
    }

    #[test]
    fn delta_without_snapshot_is_a_noop() {
        let counters = CounterSynchronizer::new();
        assert_eq!(counters.apply_delta("9", Side::Home), None);
        assert_eq!(counters.get("9"), None);
    }

    #[test]
    fn failed_pull_keeps_known_rooms_and_zeroes_new_ones() {
        let counters = CounterSynchronizer::new();
        let mut pulled = HashMap::new();
        pulled.insert("1".to_string(), CounterSnapshot::new(5, 3));
        counters.install(&ids(&["1"]), Ok(pulled));
        let out = counters.install(&ids(&["1", "2"]), Err(FetchError::Request("timeout".into())));
        assert_eq!(out["1"], CounterSnapshot::new(5, 3));
        assert_eq!(out["2"], CounterSnapshot::default());
        assert!(counters.last_error().is_some());
    }

    #[test]
    fn reload_is_the_drift_fix() {
        let counters = CounterSynchronizer::new();
        let pull = |h, a| {
            let mut m = HashMap::new();
            m.insert("42".to_string(), CounterSnapshot::new(h, a));
            Ok(m)
        };
        counters.install(&ids(&["42"]), pull(10, 10));
        counters.apply_delta("42", Side::Away);
        counters.install(&ids(&["42"]), pull(12, 15));
        assert_eq!(counters.get("42"), Some(CounterSnapshot::new(12, 15)));

        // A room missing from the response is reset to zero.
        counters.install(&ids(&["42"]), Ok(HashMap::new()));
        assert_eq!(counters.get("42"), Some(CounterSnapshot::default()));

        counters.drop_rooms(&ids(&["42"]));
        assert_eq!(counters.get("42"), None);
    }
}
