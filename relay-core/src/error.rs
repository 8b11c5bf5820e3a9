use std::fmt;

/// Failure modes for the restricted-operation surface of a [`crate::channel::Channel`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChannelError {
    /// Actor lacks the role required for the operation.
    Forbidden,
    /// Target id is not a member, not a moderator, or the channel itself is gone.
    NotFound,
    /// A capacity ceiling (moderators, members) would be exceeded.
    Capacity,
    /// Argument failed a field-level check (e.g. rename length bounds).
    Invalid,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Forbidden => write!(f, "actor lacks the required role"),
            ChannelError::NotFound => write!(f, "target not found in channel"),
            ChannelError::Capacity => write!(f, "channel capacity exceeded"),
            ChannelError::Invalid => write!(f, "invalid argument"),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Failure modes for [`crate::channel::Channel::enter`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EnterError {
    /// `members.len() == 50` already.
    Full,
    /// Channel is secret and the actor holds no invitation.
    NotInvited,
}

impl fmt::Display for EnterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnterError::Full => write!(f, "channel is at member capacity"),
            EnterError::NotInvited => write!(f, "channel is secret and actor was not invited"),
        }
    }
}

impl std::error::Error for EnterError {}

/// Failure modes for registry-level `add`/`create`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegistryError {
    AtCapacity,
    /// `ChannelRegistry::create` lost a race: the id was taken between the dispatcher's
    /// `find` and this call.
    AlreadyExists,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AtCapacity => write!(f, "registry is at capacity"),
            RegistryError::AlreadyExists => write!(f, "id already present in registry"),
        }
    }
}

impl std::error::Error for RegistryError {}
