//! Executor process supervision.
//!
//! A [`Supervisor`] launches one [`BuildAttempt`] per gear. The attempt
//! owns the executor's process group and its combined output stream;
//! [`BuildAttempt::poll_line`] is the control loop's clock.

pub mod process;
pub mod signals;

use async_trait::async_trait;
use std::time::Duration;

use crate::config::BuildCommand;
use crate::errors::SupervisorError;

pub use process::{ProcessAttempt, ProcessSupervisor};
pub use signals::{TerminationOutcome, TerminationStep};

/// Launches executor attempts.
#[async_trait]
pub trait Supervisor: Send {
    /// Start the executor as the sole member of a new process group.
    async fn start(&mut self, command: &BuildCommand)
    -> Result<Box<dyn BuildAttempt>, SupervisorError>;
}

/// One running (or finished) executor invocation at a fixed gear.
#[async_trait]
pub trait BuildAttempt: Send {
    /// Next line of combined stdout/stderr, or `None` if nothing arrived
    /// within `timeout`.
    async fn poll_line(&mut self, timeout: Duration) -> Option<String>;

    /// Whether the executor is still running. Reaps the leader once it exits.
    fn is_alive(&mut self) -> Result<bool, SupervisorError>;

    /// Escalate interrupt → terminate → kill against the whole group,
    /// waiting a bounded time after each signal.
    async fn terminate(&mut self) -> TerminationOutcome;

    /// Exit code, available once the attempt is no longer alive. Signal
    /// deaths are reported as `128 + signal`.
    fn exit_status(&self) -> Option<i32>;

    /// Process group id, if the attempt ever had one.
    fn process_group(&self) -> Option<i32>;
}
