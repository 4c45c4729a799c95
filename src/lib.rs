//! hakurei - unprivileged per-app Linux sandbox.
//!
//! This crate turns a validated application configuration into a running,
//! confined process through a three-stage pipeline:
//!
//! 1. **Outcome planning**: compile the declarative config into an ordered
//!    list of outcome ops carrying both host-side mutations and container
//!    launch parameters.
//! 2. **Transactional system mutation**: apply host side effects (directory
//!    creation, ACL updates, X11 host entries, delegated cgroup v2
//!    subtrees, ephemeral socket proxying) with full rollback on partial
//!    failure and on exit.
//! 3. **Container launch**: a shim process receives the compiled parameters
//!    over a pipe, creates the namespaces, enforces Landlock, seccomp and
//!    no-new-privs, attaches the delegated cgroup and execs the initial
//!    program.
//!
//! # Platform Requirements
//!
//! - Linux kernel 6.7+ (for Landlock ABI v6 with socket scoping)
//! - cgroup v2 (unified hierarchy)
//! - Unprivileged user namespaces enabled
//!
//! # Example
//!
//! ```no_run
//! use hakurei::{app, config::Config};
//!
//! fn main() -> hakurei::Result<()> {
//!     hakurei::system::check_all()?;
//!
//!     let config: Config =
//!         serde_json::from_str(&std::fs::read_to_string("app.json")?).unwrap();
//!     let code = app::run(&config, false)?;
//!     std::process::exit(code)
//! }
//! ```

pub mod app;
pub mod config;
pub mod container;
pub mod error;
pub mod id;
pub mod outcome;
pub mod path;
pub mod proto;
pub mod shim;
pub mod system;

// Re-export commonly used types
pub use config::{Config, ContainerConfig, Flags};
pub use error::{Error, Result};
pub use id::InstanceId;
pub use path::Absolute;
pub use system::{Criteria, System};
