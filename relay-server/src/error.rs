//! Error-kind -> response-id mapping for the request dispatcher (spec.md §7).

use std::fmt;

use relay_core::{ChannelError, EnterError, RegistryError};
use relay_wire::{ProtocolError, ERR_CAPACITY, ERR_PROTOCOL};

/// Everything that can go wrong handling one frame, once the client is past the connect
/// handshake. Carries enough information for the dispatcher to pick a response id (spec.md
/// §7); socket-fatal conditions and `SVR_DISCONNECT` are handled separately via `Outcome`,
/// since they never produce a response frame at all.
#[derive(Debug)]
pub enum DispatchError {
    Protocol(ProtocolError),
    Capacity,
    Forbidden,
    NotFound,
}

impl DispatchError {
    /// The response id to echo back, per spec.md §7.
    pub fn response_id(&self) -> i32 {
        match self {
            DispatchError::Protocol(_) => ERR_PROTOCOL,
            DispatchError::Capacity => ERR_CAPACITY,
            DispatchError::Forbidden => ERR_PROTOCOL,
            DispatchError::NotFound => ERR_PROTOCOL,
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Protocol(err) => write!(f, "protocol error: {err}"),
            DispatchError::Capacity => write!(f, "capacity exceeded"),
            DispatchError::Forbidden => write!(f, "forbidden"),
            DispatchError::NotFound => write!(f, "not found"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ProtocolError> for DispatchError {
    fn from(err: ProtocolError) -> DispatchError {
        DispatchError::Protocol(err)
    }
}

impl From<ChannelError> for DispatchError {
    fn from(err: ChannelError) -> DispatchError {
        match err {
            ChannelError::Forbidden => DispatchError::Forbidden,
            ChannelError::NotFound => DispatchError::NotFound,
            ChannelError::Capacity => DispatchError::Capacity,
            ChannelError::Invalid => DispatchError::Protocol(ProtocolError::InvalidField),
        }
    }
}

impl From<EnterError> for DispatchError {
    fn from(err: EnterError) -> DispatchError {
        match err {
            EnterError::Full => DispatchError::Capacity,
            EnterError::NotInvited => DispatchError::Forbidden,
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> DispatchError {
        match err {
            RegistryError::AtCapacity => DispatchError::Capacity,
            RegistryError::AlreadyExists => DispatchError::Protocol(ProtocolError::InvalidField),
        }
    }
}
