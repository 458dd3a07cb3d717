//! # Room Message Store
//!
//! Bounded in-memory history per joined room. Event rooms keep one lane per
//! side, the general room keeps one lane. Each lane is a ring: appending past
//! capacity evicts from the head, so a lane always holds the newest
//! `capacity` entries it has seen, in insertion order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::core::lock;
use crate::model::{DomainMessage, MessageScope, Partitioning, RoomId, Side};

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: DomainMessage,
}

#[derive(Debug)]
enum Lanes {
    Single(VecDeque<Entry>),
    BySide([VecDeque<Entry>; 2]),
}

#[derive(Debug)]
struct RoomBucket {
    capacity: usize,
    lanes: Lanes,
    next_seq: u64,
}

impl RoomBucket {
    fn new(partitioning: Partitioning, capacity: usize) -> Self {
        let lanes = match partitioning {
            Partitioning::Unpartitioned => Lanes::Single(VecDeque::with_capacity(capacity)),
            Partitioning::BySide => Lanes::BySide([
                VecDeque::with_capacity(capacity),
                VecDeque::with_capacity(capacity),
            ]),
        };
        Self {
            capacity,
            lanes,
            next_seq: 0,
        }
    }

    fn lane_for(&mut self, scope: MessageScope) -> Option<&mut VecDeque<Entry>> {
        match (&mut self.lanes, scope) {
            (Lanes::Single(lane), _) => Some(lane),
            (Lanes::BySide(lanes), MessageScope::Side(side)) => Some(&mut lanes[side.index()]),
            (Lanes::BySide(_), MessageScope::Category(_)) => None,
        }
    }

    fn push(&mut self, message: DomainMessage) -> bool {
        let seq = self.next_seq;
        let capacity = self.capacity;
        let Some(lane) = self.lane_for(message.scope) else {
            return false;
        };
        if lane.len() >= capacity {
            lane.pop_front();
        }
        lane.push_back(Entry { seq, message });
        self.next_seq += 1;
        true
    }

    fn entries(&self) -> Vec<&Entry> {
        match &self.lanes {
            Lanes::Single(lane) => lane.iter().collect(),
            Lanes::BySide(lanes) => lanes.iter().flat_map(|l| l.iter()).collect(),
        }
    }

    fn len(&self) -> usize {
        match &self.lanes {
            Lanes::Single(lane) => lane.len(),
            Lanes::BySide(lanes) => lanes.iter().map(VecDeque::len).sum(),
        }
    }
}

fn by_time_then_arrival(a: &&Entry, b: &&Entry) -> std::cmp::Ordering {
    a.message
        .created_at
        .cmp(&b.message.created_at)
        .then(a.seq.cmp(&b.seq))
}

#[derive(Default)]
pub struct RoomMessageStore {
    rooms: Mutex<HashMap<RoomId, RoomBucket>>,
}

impl RoomMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or resets) the bucket for a room.
    pub fn open_room(&self, room_id: &str, partitioning: Partitioning, capacity: usize) {
        lock(&self.rooms).insert(room_id.to_string(), RoomBucket::new(partitioning, capacity.max(1)));
    }

    /// Drops the room's bucket and everything in it.
    pub fn close_room(&self, room_id: &str) {
        lock(&self.rooms).remove(room_id);
    }

    /// Appends a server-delivered message. Returns `false` if it was dropped
    /// (room not open, or no side on a side-partitioned room).
    pub fn append(&self, room_id: &str, message: DomainMessage) -> bool {
        let mut rooms = lock(&self.rooms);
        let Some(bucket) = rooms.get_mut(room_id) else {
            tracing::debug!(room_id, message_id = %message.id, "Room not open; message dropped");
            return false;
        };
        let id = message.id.clone();
        let stored = bucket.push(message);
        if !stored {
            tracing::warn!(room_id, message_id = %id, "Message has no side in a side-partitioned room; dropped");
        }
        stored
    }

    /// Appends a locally synthesized message. Same buckets, same eviction.
    /// A later server echo of the same text is not deduplicated.
    pub fn append_local_fallback(&self, room_id: &str, message: DomainMessage) -> bool {
        self.append(room_id, message)
    }

    /// Bulk append, used for history.
    pub fn extend(&self, room_id: &str, messages: impl IntoIterator<Item = DomainMessage>) -> usize {
        messages
            .into_iter()
            .map(|m| self.append(room_id, m))
            .filter(|&stored| stored)
            .count()
    }

    /// All messages of the room, oldest first. Equal timestamps keep insertion
    /// order.
    pub fn get_ordered(&self, room_id: &str) -> Vec<DomainMessage> {
        let rooms = lock(&self.rooms);
        let Some(bucket) = rooms.get(room_id) else {
            return Vec::new();
        };
        let mut entries = bucket.entries();
        entries.sort_by(|a, b| by_time_then_arrival(a, b));
        entries.into_iter().map(|e| e.message.clone()).collect()
    }

    /// One side's lane, oldest first. Empty for unpartitioned rooms.
    pub fn get_side(&self, room_id: &str, side: Side) -> Vec<DomainMessage> {
        let rooms = lock(&self.rooms);
        let Some(RoomBucket {
            lanes: Lanes::BySide(lanes),
            ..
        }) = rooms.get(room_id)
        else {
            return Vec::new();
        };
        let mut entries: Vec<&Entry> = lanes[side.index()].iter().collect();
        entries.sort_by(|a, b| by_time_then_arrival(a, b));
        entries.into_iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self, room_id: &str) -> usize {
        lock(&self.rooms).get(room_id).map(RoomBucket::len).unwrap_or(0)
    }
}
