//! offload-core: Transparent remote execution of registered functions
//!
//! A function registered on a [`ClientContext`] runs on the prepared host
//! when it is reachable and in-process when it is not. Output is relayed
//! while the remote process runs, and a per-call deadline can replace the
//! result with a default value.

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod job;
pub mod locator;
pub mod marshal;
pub mod proxy;
pub mod runtime;
pub mod session;
pub mod stream;
pub mod supervisor;
pub mod sync;

pub use config::{ConfigStore, ExecutionConfig, StoredConfig, TomlConfigStore};
pub use context::{ClientContext, ClientContextBuilder, CommandOutput};
pub use error::OffloadError;
pub use executor::{RemoteExecutor, Termination};
pub use fallback::{Dispatch, FallbackCoordinator};
pub use job::{JobState, RemoteJob};
pub use locator::{HostLocator, HostProfile, Reachability};
pub use marshal::{FunctionSpec, Marshaller, RemoteUnit};
pub use proxy::{FunctionBuilder, RemoteFunction};
pub use runtime::{Dependency, Runtime};
pub use session::{Connector, DefaultConnector, Session, SessionManager};
pub use stream::{ChunkKind, Console, OutputChunk, OutputStream, StdConsole, StreamSummary};
pub use supervisor::{JobOutcome, TimeoutSupervisor};
pub use sync::FileSync;

pub use offload_exec::{Credentials, Secret};
