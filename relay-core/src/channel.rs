use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use byteorder::{LittleEndian, WriteBytesExt};
use relay_wire::{CommandCode, Frame, FrameType};

use crate::broadcast::BroadcastQueue;
use crate::error::{ChannelError, EnterError};

/// Moderator list cap (spec.md §3, §9 "Moderator cap of 5 and member cap of 50").
pub const MODERATOR_CAP: usize = 5;
/// Member cap, emperor included (spec.md §9 Open Question (i): yes, emperor counts).
pub const MEMBER_CAP: usize = 50;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Emperor,
    Moderator,
    Member,
}

impl Role {
    fn is_authority(self) -> bool {
        matches!(self, Role::Emperor | Role::Moderator)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct RosterEntry {
    id: u64,
    role: Role,
}

struct ChannelState {
    name: String,
    secret: bool,
    /// Single ordered list holding every member, tagged with role; at most one `Emperor`
    /// entry. This makes Invariant 1 (disjoint emperor/moderators/members) structurally
    /// impossible to violate instead of something to maintain across three collections
    /// (spec.md §9 "Emperor as a separate field vs. first moderator", option (b)).
    roster: Vec<RosterEntry>,
    /// A multiset, not a set: spec.md §4.3 "duplicate invitations are allowed; each single
    /// entry is consumed on one successful join" (ancestor: `std::vector` in
    /// `examples/original_source/src/channel.cpp`). A plain `HashSet` would collapse repeat
    /// invites into one admission.
    invitations: Vec<u64>,
    pinned: Option<String>,
}

/// Outcome of a member (or the emperor) leaving, via self-leave, kick, or disconnect.
pub enum LeaveOutcome {
    /// Channel still exists. `promoted_emperor` is `Some(id)` when succession happened and
    /// every remaining member must be told about the new emperor.
    Survived { promoted_emperor: Option<u64> },
    /// The emperor left with no moderator to succeed them. `remaining_members` lists every
    /// id still in the roster at the moment of destruction, for the caller to purge from
    /// their own joined-channel sets and to fan the CH_DESTROY broadcast out to.
    Destroyed { remaining_members: Vec<u64> },
}

/// One chat room. Holds only client ids; the registry is the sole owner of `Arc<Client>`
/// values (spec.md §3 Ownership, §9 cyclic references).
pub struct Channel {
    id: u32,
    state: Mutex<ChannelState>,
    queue: BroadcastQueue,
    next_broadcast_id: AtomicI32,
}

impl Channel {
    /// Creates a channel already owned by `creator` as emperor, matching
    /// `ChannelRegistry::create`'s atomic (allocate, join creator, insert) contract.
    pub fn new(id: u32, creator_id: u64) -> Channel {
        Channel {
            id,
            state: Mutex::new(ChannelState {
                name: format!("#channel{id}"),
                secret: false,
                roster: vec![RosterEntry { id: creator_id, role: Role::Emperor }],
                invitations: Vec::new(),
                pinned: None,
            }),
            queue: BroadcastQueue::new(),
            next_broadcast_id: AtomicI32::new(1),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    pub fn is_secret(&self) -> bool {
        self.state.lock().unwrap().secret
    }

    pub fn pinned(&self) -> Option<String> {
        self.state.lock().unwrap().pinned.clone()
    }

    pub fn is_member(&self, client_id: u64) -> bool {
        let state = self.state.lock().unwrap();
        Self::find(&state.roster, client_id).is_some()
    }

    pub fn is_authority(&self, client_id: u64) -> bool {
        let state = self.state.lock().unwrap();
        Self::find(&state.roster, client_id).map(|e| e.role.is_authority()).unwrap_or(false)
    }

    pub fn emperor_id(&self) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state.roster.iter().find(|e| e.role == Role::Emperor).map(|e| e.id)
    }

    /// `id:u32 | secret:u8 | name:utf8`, the CH_CONNECT response payload (spec.md §4.4).
    pub fn info_bytes(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::with_capacity(4 + 1 + state.name.len());
        out.write_u32::<LittleEndian>(self.id).expect("writing to a Vec cannot fail");
        out.push(state.secret as u8);
        out.extend_from_slice(state.name.as_bytes());
        out
    }

    /// Snapshot of every current member's id, taken under the channel lock. Used for
    /// broadcast fan-out so that members who join after the snapshot is taken do not
    /// receive a broadcast that had already begun (spec.md §4.3, Testable Property ordering).
    pub fn member_snapshot(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state.roster.iter().map(|e| e.id).collect()
    }

    /// Re-entry by a client already present in the roster (e.g. the emperor re-sending
    /// CH_CONNECT for the channel it created) is a no-op, not a second roster entry —
    /// otherwise Invariant 1 (at most one of {emperor, moderators, members} per client)
    /// breaks and the client would receive every broadcast twice.
    pub fn enter(&self, actor_id: u64) -> Result<(), EnterError> {
        let mut state = self.state.lock().unwrap();
        if Self::find(&state.roster, actor_id).is_some() {
            return Ok(());
        }
        if state.secret && !state.invitations.contains(&actor_id) {
            return Err(EnterError::NotInvited);
        }
        if state.roster.len() == MEMBER_CAP {
            return Err(EnterError::Full);
        }
        state.roster.push(RosterEntry { id: actor_id, role: Role::Member });
        // Consume exactly one invitation entry, not every matching one: duplicate invites
        // are allowed and each is a separate one-shot admission (spec.md §4.3).
        if let Some(idx) = state.invitations.iter().position(|&id| id == actor_id) {
            state.invitations.remove(idx);
        }
        Ok(())
    }

    /// Self-leave: a no-op (not an error) if `actor_id` is not currently a member, so the
    /// disconnect sweep can call this unconditionally for every channel it ever joined.
    pub fn leave(&self, actor_id: u64) -> LeaveOutcome {
        self.leave_internal(actor_id)
    }

    pub fn kick(&self, actor_id: u64, target_id: u64) -> Result<LeaveOutcome, ChannelError> {
        let state = self.state.lock().unwrap();
        let actor_role = Self::find(&state.roster, actor_id).map(|e| e.role);
        if !actor_role.map(Role::is_authority).unwrap_or(false) {
            return Err(ChannelError::Forbidden);
        }
        let target_role = Self::find(&state.roster, target_id).map(|e| e.role).ok_or(ChannelError::NotFound)?;
        if target_role.is_authority() && actor_role != Some(Role::Emperor) {
            return Err(ChannelError::Forbidden);
        }
        drop(state);
        Ok(self.leave_internal(target_id))
    }

    fn leave_internal(&self, actor_id: u64) -> LeaveOutcome {
        let mut state = self.state.lock().unwrap();
        let idx = match state.roster.iter().position(|e| e.id == actor_id) {
            Some(idx) => idx,
            None => return LeaveOutcome::Survived { promoted_emperor: None },
        };

        if state.roster[idx].role != Role::Emperor {
            state.roster.remove(idx);
            return LeaveOutcome::Survived { promoted_emperor: None };
        }

        state.roster.remove(idx);
        let successor_idx = state.roster.iter().position(|e| e.role == Role::Moderator);
        match successor_idx {
            None => {
                let remaining_members = state.roster.iter().map(|e| e.id).collect::<Vec<_>>();
                let channel_id = self.id;
                drop(state);
                self.queue.push(Frame::new(
                    self.next_broadcast_id(),
                    FrameType::ChDestroy,
                    destroy_payload(channel_id),
                ));
                LeaveOutcome::Destroyed { remaining_members }
            }
            Some(successor_idx) => {
                state.roster[successor_idx].role = Role::Emperor;
                let new_emperor = state.roster[successor_idx].id;
                drop(state);
                self.queue.push(Frame::new(
                    self.next_broadcast_id(),
                    FrameType::ChCommand,
                    command_payload(self.id, CommandCode::PromoteEmperor, &new_emperor.to_le_bytes()),
                ));
                LeaveOutcome::Survived { promoted_emperor: Some(new_emperor) }
            }
        }
    }

    /// `target_exists` must be resolved by the caller against the client registry before
    /// calling this — the channel itself never touches the client registry (spec.md §9).
    pub fn invite(&self, actor_id: u64, target_id: u64, target_exists: bool) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        if state.secret {
            let actor_role = Self::find(&state.roster, actor_id).map(|e| e.role);
            if !actor_role.map(Role::is_authority).unwrap_or(false) {
                return Err(ChannelError::Forbidden);
            }
        }
        if !target_exists {
            return Err(ChannelError::NotFound);
        }
        // Duplicate invites accumulate rather than collapse (spec.md §4.3 idempotency note);
        // each is consumed one-per-join in `enter`.
        state.invitations.push(target_id);
        Ok(())
    }

    pub fn promote_member(&self, actor_id: u64, target_id: u64) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        Self::require_emperor(&state.roster, actor_id)?;
        let moderator_count = state.roster.iter().filter(|e| e.role == Role::Moderator).count();
        if moderator_count == MODERATOR_CAP {
            return Err(ChannelError::Capacity);
        }
        let idx = state
            .roster
            .iter()
            .position(|e| e.id == target_id && e.role == Role::Member)
            .ok_or(ChannelError::NotFound)?;
        // Move to the tail: moderator succession order is vector order, so appending here
        // (rather than mutating the role in place) keeps "oldest moderator" meaningful.
        let mut entry = state.roster.remove(idx);
        entry.role = Role::Moderator;
        state.roster.push(entry);
        Ok(())
    }

    pub fn promote_moderator(&self, actor_id: u64, target_id: u64) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        Self::require_emperor(&state.roster, actor_id)?;
        let target_idx = state
            .roster
            .iter()
            .position(|e| e.id == target_id && e.role == Role::Moderator)
            .ok_or(ChannelError::NotFound)?;
        let emperor_idx = state.roster.iter().position(|e| e.id == actor_id).expect("checked by require_emperor");

        state.roster[target_idx].role = Role::Emperor;
        let mut outgoing = state.roster.remove(emperor_idx);
        outgoing.role = Role::Moderator;
        state.roster.push(outgoing);
        Ok(())
    }

    pub fn change_privacy(&self, actor_id: u64) -> Result<bool, ChannelError> {
        let mut state = self.state.lock().unwrap();
        Self::require_emperor(&state.roster, actor_id)?;
        state.secret = !state.secret;
        Ok(state.secret)
    }

    /// Returns, on success, whether the broadcast queue transitioned empty-to-non-empty —
    /// the caller's signal to schedule exactly one drain task (spec.md §9 "single-flight").
    pub fn pin_message(&self, actor_id: u64, text: &str) -> Result<bool, ChannelError> {
        let mut state = self.state.lock().unwrap();
        let role = Self::find(&state.roster, actor_id).map(|e| e.role);
        if !role.map(Role::is_authority).unwrap_or(false) {
            return Err(ChannelError::Forbidden);
        }
        state.pinned = if text.is_empty() { None } else { Some(text.to_string()) };
        drop(state);
        let scheduled = self.queue.push(Frame::new(
            self.next_broadcast_id(),
            FrameType::ChCommand,
            command_payload(self.id, CommandCode::Pin, text.as_bytes()),
        ));
        Ok(scheduled)
    }

    /// See [`Channel::pin_message`] for the meaning of the returned bool.
    pub fn rename(&self, actor_id: u64, new_name: &str) -> Result<bool, ChannelError> {
        let mut state = self.state.lock().unwrap();
        Self::require_emperor(&state.roster, actor_id)?;
        if !(6..=24).contains(&new_name.len()) {
            return Err(ChannelError::Invalid);
        }
        state.name = new_name.to_string();
        drop(state);
        let scheduled = self.queue.push(Frame::new(
            self.next_broadcast_id(),
            FrameType::ChCommand,
            command_payload(self.id, CommandCode::Rename, new_name.as_bytes()),
        ));
        Ok(scheduled)
    }

    /// Enqueues the broadcast; membership is assumed already verified by the dispatcher.
    /// Returns whether the queue transitioned empty-to-non-empty (see [`Channel::pin_message`]).
    pub fn send_message(&self, sender_id: u64, text: &str) -> bool {
        let mut payload = Vec::with_capacity(4 + 4 + text.len());
        payload.write_u32::<LittleEndian>(self.id).expect("writing to a Vec cannot fail");
        payload.write_u32::<LittleEndian>(sender_id as u32).expect("writing to a Vec cannot fail");
        payload.extend_from_slice(text.as_bytes());
        self.queue.push(Frame::new(self.next_broadcast_id(), FrameType::ChMessage, payload))
    }

    /// Drains every frame currently queued; called by the broadcast-drain task.
    pub fn drain_broadcasts(&self) -> Vec<Frame> {
        self.queue.drain()
    }

    /// Enqueues a frame directly, returning whether a drain task needs scheduling. Exposed
    /// so the dispatcher can push without re-deriving channel-specific payload shapes for
    /// anything outside the operations above.
    pub fn enqueue(&self, frame: Frame) -> bool {
        self.queue.push(frame)
    }

    fn next_broadcast_id(&self) -> i32 {
        self.next_broadcast_id.fetch_add(1, Ordering::Relaxed)
    }

    fn find(roster: &[RosterEntry], id: u64) -> Option<&RosterEntry> {
        roster.iter().find(|e| e.id == id)
    }

    fn require_emperor(roster: &[RosterEntry], actor_id: u64) -> Result<(), ChannelError> {
        match Self::find(roster, actor_id) {
            Some(e) if e.role == Role::Emperor => Ok(()),
            Some(_) => Err(ChannelError::Forbidden),
            None => Err(ChannelError::Forbidden),
        }
    }
}

fn command_payload(channel_id: u32, cmd: CommandCode, arg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + arg.len());
    out.push(cmd as u8);
    out.write_u32::<LittleEndian>(channel_id).expect("writing to a Vec cannot fail");
    out.extend_from_slice(arg);
    out
}

fn destroy_payload(channel_id: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 16);
    out.write_u32::<LittleEndian>(channel_id).expect("writing to a Vec cannot fail");
    out.extend_from_slice(b"emperor departed, no successor");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_is_sole_emperor() {
        let ch = Channel::new(1, 100);
        assert_eq!(ch.emperor_id(), Some(100));
        assert!(ch.is_authority(100));
        assert_eq!(ch.member_snapshot(), vec![100]);
    }

    #[test]
    fn enter_rejects_full_channel() {
        let ch = Channel::new(1, 1);
        for id in 2..=MEMBER_CAP as u64 {
            ch.enter(id).unwrap();
        }
        assert_eq!(ch.member_snapshot().len(), MEMBER_CAP);
        assert_eq!(ch.enter(999), Err(EnterError::Full));
    }

    #[test]
    fn enter_secret_requires_invitation_and_consumes_it() {
        let ch = Channel::new(1, 1);
        ch.change_privacy(1).unwrap();
        assert_eq!(ch.enter(2), Err(EnterError::NotInvited));
        ch.invite(1, 2, true).unwrap();
        ch.enter(2).unwrap();
        assert!(ch.is_member(2));
        // invitation was one-shot: leaving and trying to re-enter without a fresh invite fails
        ch.leave(2);
        assert_eq!(ch.enter(2), Err(EnterError::NotInvited));
    }

    #[test]
    fn enter_is_idempotent_for_an_existing_member() {
        let ch = Channel::new(1, 1);
        ch.enter(1).unwrap(); // emperor re-sends CH_CONNECT for its own channel
        assert_eq!(ch.member_snapshot(), vec![1], "re-entry must not duplicate the roster entry");

        ch.enter(2).unwrap();
        ch.enter(2).unwrap();
        assert_eq!(ch.member_snapshot().iter().filter(|&&id| id == 2).count(), 1);
    }

    #[test]
    fn duplicate_invitations_accumulate_and_are_consumed_one_per_join() {
        let ch = Channel::new(1, 1);
        ch.change_privacy(1).unwrap();
        ch.invite(1, 2, true).unwrap();
        ch.invite(1, 2, true).unwrap();

        ch.enter(2).unwrap();
        ch.leave(2);
        // second invitation entry is still there
        ch.enter(2).unwrap();
        ch.leave(2);
        // both invitations are now consumed
        assert_eq!(ch.enter(2), Err(EnterError::NotInvited));
    }

    #[test]
    fn promote_member_then_succession_picks_oldest_moderator() {
        let ch = Channel::new(1, 1);
        ch.enter(2).unwrap();
        ch.enter(3).unwrap();
        ch.promote_member(1, 2).unwrap();
        ch.promote_member(1, 3).unwrap();

        match ch.leave(1) {
            LeaveOutcome::Survived { promoted_emperor } => assert_eq!(promoted_emperor, Some(2)),
            LeaveOutcome::Destroyed { .. } => panic!("expected succession, not destruction"),
        }
        assert_eq!(ch.emperor_id(), Some(2));
        assert!(ch.is_authority(3), "3 is still a moderator after 2's promotion");
    }

    #[test]
    fn emperor_leave_with_no_moderators_destroys_channel() {
        let ch = Channel::new(1, 1);
        ch.enter(2).unwrap();
        ch.enter(3).unwrap();
        match ch.leave(1) {
            LeaveOutcome::Destroyed { mut remaining_members } => {
                remaining_members.sort();
                assert_eq!(remaining_members, vec![2, 3]);
            }
            LeaveOutcome::Survived { .. } => panic!("expected destruction"),
        }
        let frames = ch.drain_broadcasts();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::ChDestroy as i32);
    }

    #[test]
    fn promote_moderator_swaps_emperor_and_appends_old_emperor_as_moderator() {
        let ch = Channel::new(1, 1);
        ch.enter(2).unwrap();
        ch.promote_member(1, 2).unwrap();
        ch.promote_moderator(1, 2).unwrap();
        assert_eq!(ch.emperor_id(), Some(2));
        assert!(ch.is_authority(1));
        assert!(!ch.is_authority(3));
    }

    #[test]
    fn kick_requires_authority_and_forbids_peer_authority() {
        let ch = Channel::new(1, 1);
        ch.enter(2).unwrap();
        ch.enter(3).unwrap();
        ch.promote_member(1, 2).unwrap();
        // a plain member cannot kick a moderator
        assert_eq!(ch.kick(3, 2).unwrap_err(), ChannelError::Forbidden);
        // the emperor can kick a moderator
        assert!(matches!(ch.kick(1, 2), Ok(LeaveOutcome::Survived { .. })));
        assert!(!ch.is_member(2));
    }

    #[test]
    fn kick_unknown_target_is_not_found() {
        let ch = Channel::new(1, 1);
        assert_eq!(ch.kick(1, 999).unwrap_err(), ChannelError::NotFound);
    }

    #[test]
    fn rename_enforces_length_bounds_and_broadcasts() {
        let ch = Channel::new(1, 1);
        assert_eq!(ch.rename(1, "no").unwrap_err(), ChannelError::Invalid);
        ch.rename(1, "bunny-hole").unwrap();
        assert_eq!(ch.name(), "bunny-hole");
        let frames = ch.drain_broadcasts();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::ChCommand as i32);
        assert_eq!(frames[0].payload[0], CommandCode::Rename as u8);
    }

    #[test]
    fn pin_message_empty_string_clears_pin() {
        let ch = Channel::new(1, 1);
        ch.pin_message(1, "read me").unwrap();
        assert_eq!(ch.pinned().as_deref(), Some("read me"));
        ch.pin_message(1, "").unwrap();
        assert_eq!(ch.pinned(), None);
    }

    #[test]
    fn promote_member_respects_moderator_cap() {
        let ch = Channel::new(1, 1);
        for id in 2..=7u64 {
            ch.enter(id).unwrap();
        }
        for id in 2..=6u64 {
            ch.promote_member(1, id).unwrap();
        }
        assert_eq!(ch.promote_member(1, 7).unwrap_err(), ChannelError::Capacity);
    }

    #[test]
    fn leave_of_a_non_member_is_a_no_op() {
        let ch = Channel::new(1, 1);
        match ch.leave(404) {
            LeaveOutcome::Survived { promoted_emperor } => assert_eq!(promoted_emperor, None),
            LeaveOutcome::Destroyed { .. } => panic!("unrelated id cannot destroy the channel"),
        }
        assert_eq!(ch.emperor_id(), Some(1));
    }
}
