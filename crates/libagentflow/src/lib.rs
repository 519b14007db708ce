pub mod archive;
pub mod bus;
pub mod config;
pub mod error;
pub mod markers;
pub mod procgroup;
pub mod run_log;
pub mod supervisor;

pub use bus::{EventBus, Subscription};
pub use config::{BusConfig, MarkerConfig, SupervisorConfig};
pub use error::FireError;
pub use procgroup::{GroupHandle, ProcessGroup};
pub use supervisor::{FireTool, RunSupervisor, StopOutcome};
