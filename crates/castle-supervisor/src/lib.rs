//! Castle Supervisor - Daemon process management
//!
//! Two layers:
//!
//! - [`Executor`]: one-shot helper commands (`sgdisk`, `lsblk`, `ceph ...`)
//!   whose failures carry exit code and stderr
//! - [`Supervisor`]: long-running daemons started under a stable id, with
//!   adoption of already-running processes by command-line pattern

pub mod exec;
pub mod process;
mod scan;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use exec::{CommandExecutor, ExecError, ExecResult, Executor, args};
pub use process::{ProcessHandle, ProcessManager, StartPolicy, Supervisor};
