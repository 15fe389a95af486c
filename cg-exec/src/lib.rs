//! Command catalog and process runner for the cmdgate gateway.
//!
//! The catalog is the static allowlist driving the security chain's
//! classification and role gates; the runner executes backing programs in an
//! isolated child process. Neither knows anything about channels or HTTP.

mod catalog;
mod error;
mod runner;

pub use catalog::{ArgSpec, CommandCatalog, CommandCategory, CommandSpec};
pub use error::{ExecError, Result};
pub use runner::{CommandRunner, ExecutionResult};
