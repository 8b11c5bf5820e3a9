//! Binary crate's library half: the acceptor, dispatcher, and their supporting modules are
//! exposed here so integration tests under `tests/` can drive them directly instead of
//! shelling out to the built binary.

pub mod acceptor;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod net;
pub mod worker;

pub use acceptor::Acceptor;
pub use config::Config;
pub use dispatcher::{Dispatcher, Outcome};
pub use error::DispatchError;
pub use worker::ThreadPool;
