//! Process supervision core: launches catalog programs as detached process
//! groups, reconciles recorded state with the OS, and persists the catalog.

pub mod error;
pub mod log_sink;
pub mod procfs;
pub mod runner;
pub mod settings;
pub mod store;
pub mod supervisor;
pub mod validator;

pub use error::{Result, SupervisorError};
pub use log_sink::LogSink;
pub use runner::{LaunchStreams, ProcessRunner};
pub use settings::RunnerSettings;
pub use store::CatalogStore;
pub use supervisor::Supervisor;
