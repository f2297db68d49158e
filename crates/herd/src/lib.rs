//! # herd
//!
//! Process supervisor core for the runner.
//!
//! Launches scripts and project commands, keeps at most one live child per
//! name, appends their output to `<log_dir>/<name>.log`, and restarts a
//! crashed child once after a fixed backoff when asked to.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use herd::{EntityKind, LaunchSpec, Supervisor, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sup = Supervisor::new(SupervisorConfig::default());
//!
//! let spec = LaunchSpec::project("web", "npm start", "/srv/projects/web", "/var/log/runner")
//!     .auto_restart(true);
//! let outcome = sup.start(spec).unwrap();
//! println!("pid {}", outcome.summary().pid);
//!
//! sup.stop(EntityKind::Project, "web").unwrap();
//! # }
//! ```

pub mod error;
pub mod logs;
pub mod registry;
pub mod sanitize;
pub mod supervisor;
pub mod types;

pub use error::{Result, SupervisorError};
pub use logs::{LogSink, Tag};
pub use registry::{ManagedEntity, Registry};
pub use sanitize::sanitize;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use types::*;
