//! offload-exec: Transport layer for remote function execution
//!
//! Provides the `Transport` trait and its implementations: an SSH transport
//! built on russh and a loopback transport that runs commands on the local
//! machine.

pub mod credentials;
pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use credentials::{Credentials, Secret};
pub use error::ExecError;
pub use keys::{KeyError, KeySource, ResolvedKey};
pub use local::LocalTransport;
pub use result::{CommandResult, ConnectionInfo, ProcessEvent, RemoteProcess};
pub use ssh::SshTransport;
pub use traits::Transport;
