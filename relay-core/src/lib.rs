//! In-memory session and channel engine for the chat relay: client session state, channel
//! membership and role model, broadcast queues, and the two registries that own them.
//! Everything in this crate is transport-agnostic — it knows nothing about `mio` or TCP,
//! only about the [`client::ClientSink`] interface a transport implements.

pub mod broadcast;
pub mod channel;
pub mod client;
pub mod error;
pub mod registry;

pub use channel::{Channel, LeaveOutcome, Role, MEMBER_CAP, MODERATOR_CAP};
pub use client::{Client, ClientSink};
pub use error::{ChannelError, EnterError, RegistryError};
pub use registry::{ChannelRegistry, ClientRegistry};
