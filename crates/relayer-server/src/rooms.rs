//! Room membership directory.
//!
//! The single source of truth for which connection is in which room. Both
//! the room sets and the inverse connection→room index live behind one
//! mutex, so every mutation is atomic and readers never observe a
//! half-migrated connection.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use relayer_core::{ConnectionId, RoomId};

#[derive(Default)]
struct DirectoryState {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    membership: HashMap<ConnectionId, RoomId>,
}

/// Maps rooms to member connections. A room exists exactly while it has at
/// least one member; a connection is a member of at most one room.
#[derive(Default)]
pub struct RoomDirectory {
    state: Mutex<DirectoryState>,
}

/// Result of a join: what the router needs to reply and broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinOutcome {
    /// The joiner created the room.
    pub was_first_member: bool,
    /// Members present before the join, excluding the joiner.
    pub existing_peers: Vec<ConnectionId>,
    /// Rooms the connection was removed from by the implicit leave.
    pub left_rooms: Vec<RoomId>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room, removing it from any prior room first.
    /// Join doubles as an implicit leave so a connection can never exist in
    /// two rooms at once.
    pub fn join(&self, room: &RoomId, conn: &ConnectionId) -> JoinOutcome {
        let mut state = self.state.lock();

        let left_rooms = remove_everywhere(&mut state, conn);

        let members = state.rooms.entry(room.clone()).or_default();
        let was_first_member = members.is_empty();
        let existing_peers: Vec<ConnectionId> = members.iter().cloned().collect();

        members.insert(conn.clone());
        state.membership.insert(conn.clone(), room.clone());

        JoinOutcome {
            was_first_member,
            existing_peers,
            left_rooms,
        }
    }

    /// Remove a connection from a room. Returns whether a removal actually
    /// occurred; callers use this to suppress spurious broadcasts.
    pub fn leave(&self, room: &RoomId, conn: &ConnectionId) -> bool {
        let mut state = self.state.lock();

        let Some(members) = state.rooms.get_mut(room) else {
            return false;
        };
        if !members.remove(conn) {
            return false;
        }
        if members.is_empty() {
            state.rooms.remove(room);
        }
        if state.membership.get(conn) == Some(room) {
            state.membership.remove(conn);
        }
        true
    }

    /// Remove a connection from every room it appears in. Membership is
    /// modeled as at-most-one room, but the disconnect path sweeps all rooms
    /// so cleanup stays correct even if the structures ever disagree.
    pub fn leave_all(&self, conn: &ConnectionId) -> Vec<RoomId> {
        let mut state = self.state.lock();
        remove_everywhere(&mut state, conn)
    }

    /// Snapshot of a room's members, optionally excluding one connection.
    /// No ordering guarantee.
    pub fn members(&self, room: &RoomId, excluding: Option<&ConnectionId>) -> Vec<ConnectionId> {
        let state = self.state.lock();
        let Some(members) = state.rooms.get(room) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|id| excluding != Some(*id))
            .cloned()
            .collect()
    }

    pub fn is_member(&self, room: &RoomId, conn: &ConnectionId) -> bool {
        let state = self.state.lock();
        state
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(conn))
    }

    /// The room a connection currently belongs to.
    pub fn room_of(&self, conn: &ConnectionId) -> Option<RoomId> {
        self.state.lock().membership.get(conn).cloned()
    }

    /// All rooms with at least one member.
    pub fn rooms(&self) -> Vec<RoomId> {
        self.state.lock().rooms.keys().cloned().collect()
    }

    pub fn room_count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    /// Total memberships across all rooms.
    pub fn connection_count(&self) -> usize {
        self.state.lock().rooms.values().map(HashSet::len).sum()
    }
}

fn remove_everywhere(state: &mut DirectoryState, conn: &ConnectionId) -> Vec<RoomId> {
    let mut affected = Vec::new();
    state.rooms.retain(|room_id, members| {
        if members.remove(conn) {
            affected.push(room_id.clone());
        }
        !members.is_empty()
    });
    state.membership.remove(conn);
    affected
}
