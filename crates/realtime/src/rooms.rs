//! Client-side room membership, replayed after every reconnect.

use std::collections::HashSet;

use pl_protocol::Envelope;

/// Rooms the caller asked to be in, in join order, plus the subset the
/// server has acknowledged on the current socket.
#[derive(Debug, Default, Clone)]
pub struct RoomMembership {
    joined: Vec<String>,
    confirmed: HashSet<String>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the room was not already tracked.
    pub fn join(&mut self, room: &str) -> bool {
        if self.contains(room) {
            return false;
        }
        self.joined.push(room.to_string());
        true
    }

    /// Returns `true` if the room was tracked.
    pub fn leave(&mut self, room: &str) -> bool {
        self.confirmed.remove(room);
        let before = self.joined.len();
        self.joined.retain(|r| r != room);
        self.joined.len() != before
    }

    pub fn contains(&self, room: &str) -> bool {
        self.joined.iter().any(|r| r == room)
    }

    /// Tracked rooms in join order.
    pub fn rooms(&self) -> &[String] {
        &self.joined
    }

    pub fn len(&self) -> usize {
        self.joined.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joined.is_empty()
    }

    /// One `join_room` per tracked room, in join order.
    pub fn replay(&self) -> Vec<Envelope> {
        self.joined.iter().map(|r| Envelope::join_room(r)).collect()
    }

    /// Server confirmed a join.  Acks for rooms we no longer track are
    /// ignored.
    pub fn confirm(&mut self, room: &str) {
        if self.contains(room) {
            self.confirmed.insert(room.to_string());
        }
    }

    /// Server confirmed a leave.
    pub fn unconfirm(&mut self, room: &str) {
        self.confirmed.remove(room);
    }

    pub fn is_confirmed(&self, room: &str) -> bool {
        self.confirmed.contains(room)
    }

    /// Socket dropped; the server no longer holds our joins.
    pub fn clear_confirmations(&mut self) {
        self.confirmed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave_are_idempotent() {
        let mut m = RoomMembership::new();
        assert!(m.join("a"));
        assert!(!m.join("a"));
        assert_eq!(m.len(), 1);
        assert!(m.leave("a"));
        assert!(!m.leave("a"));
        assert!(m.is_empty());
    }

    #[test]
    fn replay_preserves_join_order() {
        let mut m = RoomMembership::new();
        m.join("b");
        m.join("a");
        m.join("c");
        m.leave("a");
        let rooms: Vec<String> = m
            .replay()
            .into_iter()
            .map(|e| {
                assert_eq!(e.kind, "join_room");
                e.payload["room"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(rooms, vec!["b", "c"]);
    }

    #[test]
    fn confirmations_track_server_acks() {
        let mut m = RoomMembership::new();
        m.join("run-1");
        m.confirm("run-1");
        m.confirm("stranger");
        assert!(m.is_confirmed("run-1"));
        assert!(!m.is_confirmed("stranger"));

        m.clear_confirmations();
        assert!(!m.is_confirmed("run-1"));
        assert!(m.contains("run-1"));
    }

    #[test]
    fn leave_drops_confirmation() {
        let mut m = RoomMembership::new();
        m.join("run-1");
        m.confirm("run-1");
        m.leave("run-1");
        m.join("run-1");
        assert!(!m.is_confirmed("run-1"));
    }
}
