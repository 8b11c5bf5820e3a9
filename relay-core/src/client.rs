use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use indexmap::IndexSet;
use relay_wire::{Frame, ProtocolError};

/// The out-of-scope socket layer, narrowed to the one operation the core engine needs:
/// handing a fully-encoded frame to whatever owns the live connection. Implementations live
/// in `relay-server`; tests use an in-memory sink.
pub trait ClientSink: Send {
    fn send_frame(&self, frame: &Frame) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum SessionState {
    Unconnected,
    Connected { display_name: String },
}

/// One connected peer. Owned exclusively by the client registry (spec.md §3 Ownership);
/// channels only ever hold the numeric id, never an `Arc<Client>` of their own.
pub struct Client {
    id: u64,
    sink: Mutex<Box<dyn ClientSink>>,
    /// Set once a send fails; the readiness loop reaps the connection on the next event
    /// rather than this call unwinding into the caller (spec.md §4.2).
    poisoned: AtomicBool,
    state: Mutex<SessionState>,
    joined: Mutex<IndexSet<u32>>,
}

impl Client {
    pub fn new(id: u64, sink: Box<dyn ClientSink>) -> Client {
        Client {
            id,
            sink: Mutex::new(sink),
            poisoned: AtomicBool::new(false),
            state: Mutex::new(SessionState::Unconnected),
            joined: Mutex::new(IndexSet::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), SessionState::Connected { .. })
    }

    pub fn display_name(&self) -> Option<String> {
        match &*self.state.lock().unwrap() {
            SessionState::Connected { display_name } => Some(display_name.clone()),
            SessionState::Unconnected => None,
        }
    }

    /// Applies the one-time SVR_CONNECT handshake: validates `nick`, assigns the display
    /// name `"<nick>@<id>"`, and flips the session to Connected. Calling this a second time
    /// on an already-connected client is a caller error the dispatcher is expected to guard
    /// against by checking `is_connected` first.
    pub fn connect(&self, nick: &[u8]) -> Result<String, ProtocolError> {
        let nick = validate_nick(nick)?;
        let display_name = format!("{nick}@{id}", nick = nick, id = self.id);
        *self.state.lock().unwrap() = SessionState::Connected {
            display_name: display_name.clone(),
        };
        Ok(display_name)
    }

    /// Adds `channel_id` to the joined set. Returns `false` if already present.
    pub fn join(&self, channel_id: u32) -> bool {
        self.joined.lock().unwrap().insert(channel_id)
    }

    /// Removes `channel_id` from the joined set. Returns `false` if it was not present;
    /// callers rely on this to make channel teardown idempotent.
    pub fn leave(&self, channel_id: u32) -> bool {
        self.joined.lock().unwrap().shift_remove(&channel_id)
    }

    pub fn is_member(&self, channel_id: u32) -> bool {
        self.joined.lock().unwrap().contains(&channel_id)
    }

    /// Snapshot of joined channel ids, oldest-joined first. Used by the disconnect sweep,
    /// which must not hold this lock while it goes on to lock each channel in turn.
    pub fn joined_channels(&self) -> Vec<u32> {
        self.joined.lock().unwrap().iter().copied().collect()
    }

    /// Best-effort send: a failure is recorded on the client, never propagated to the
    /// caller. The readiness loop is the only place a socket is actually torn down.
    pub fn send(&self, frame: &Frame) {
        let sink = self.sink.lock().unwrap();
        if sink.send_frame(frame).is_err() {
            self.poisoned.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Relaxed)
    }
}

/// A nick must be 1-32 UTF-8 bytes with no interior NUL (NUL is the frame terminator).
fn validate_nick(raw: &[u8]) -> Result<&str, ProtocolError> {
    if raw.is_empty() || raw.len() > 32 || raw.contains(&0) {
        return Err(ProtocolError::InvalidField);
    }
    std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidField)
}
