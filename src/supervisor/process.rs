//! Executor supervision on top of `tokio::process`.

use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::signals::{self, TerminationOutcome, TerminationStep};
use super::{BuildAttempt, Supervisor};
use crate::config::BuildCommand;
use crate::errors::SupervisorError;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Spawns the executor in its own process group.
pub struct ProcessSupervisor {
    termination_wait: Duration,
}

impl ProcessSupervisor {
    /// `termination_wait` bounds the wait after each termination signal.
    pub fn new(termination_wait: Duration) -> Self {
        Self { termination_wait }
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(
        &mut self,
        command: &BuildCommand,
    ) -> Result<Box<dyn BuildAttempt>, SupervisorError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let pgid = child.id().ok_or(SupervisorError::NoPid)? as i32;
        let stdout = child
            .stdout
            .take()
            .ok_or(SupervisorError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SupervisorError::MissingPipe("stderr"))?;

        // Both streams feed one channel; the receiver closes once both readers finish.
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        tokio::spawn(forward_lines(stdout, tx.clone()));
        tokio::spawn(forward_lines(stderr, tx));

        debug!(pgid, command = %command.display(), "Executor spawned");

        Ok(Box::new(ProcessAttempt {
            child,
            pgid,
            lines: rx,
            output_closed: false,
            exit: None,
            termination_wait: self.termination_wait,
        }))
    }
}

/// Forward lines from one output stream, tolerating invalid UTF-8.
async fn forward_lines<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A live executor process group.
pub struct ProcessAttempt {
    child: Child,
    pgid: i32,
    lines: mpsc::Receiver<String>,
    output_closed: bool,
    exit: Option<ExitStatus>,
    termination_wait: Duration,
}

impl ProcessAttempt {
    /// Reap the leader if it has exited, then check for surviving members.
    ///
    /// Once the leader's status is held, exited members are orphans
    /// reparented to this process and are collected so they stop counting.
    fn group_alive(&mut self) -> bool {
        if self.exit.is_none()
            && let Ok(Some(status)) = self.child.try_wait()
        {
            self.exit = Some(status);
        }
        if self.exit.is_some() {
            let reaped = signals::reap_group(self.pgid);
            if reaped > 0 {
                debug!(pgid = self.pgid, reaped, "Reaped orphaned group members");
            }
        }
        signals::group_exists(self.pgid)
    }

    async fn wait_for_group_exit(&mut self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.group_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(GROUP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

#[async_trait]
impl BuildAttempt for ProcessAttempt {
    async fn poll_line(&mut self, timeout: Duration) -> Option<String> {
        if !self.output_closed {
            match tokio::time::timeout(timeout, self.lines.recv()).await {
                Ok(Some(line)) => return Some(line),
                Ok(None) => self.output_closed = true,
                Err(_) => return None,
            }
        }

        // Output is closed: wait on the process instead of spinning.
        if self.exit.is_none()
            && let Ok(Ok(status)) = tokio::time::timeout(timeout, self.child.wait()).await
        {
            self.exit = Some(status);
        }
        None
    }

    fn is_alive(&mut self) -> Result<bool, SupervisorError> {
        if self.exit.is_some() {
            return Ok(false);
        }
        match self.child.try_wait().map_err(SupervisorError::Wait)? {
            Some(status) => {
                self.exit = Some(status);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    async fn terminate(&mut self) -> TerminationOutcome {
        if !self.group_alive() {
            return TerminationOutcome::AlreadyExited;
        }

        for step in TerminationStep::sequence() {
            if let Err(e) = signals::signal_group(self.pgid, step.signal()) {
                warn!(pgid = self.pgid, %step, error = %e, "Failed to signal process group");
            }
            if self.wait_for_group_exit(self.termination_wait).await {
                info!(pgid = self.pgid, %step, "Process group terminated");
                return TerminationOutcome::Confirmed { step };
            }
            debug!(pgid = self.pgid, %step, "Process group survived signal");
        }

        warn!(
            pgid = self.pgid,
            wait_secs = self.termination_wait.as_secs_f64(),
            "Process group still present after SIGKILL; proceeding anyway"
        );
        TerminationOutcome::Unconfirmed
    }

    fn exit_status(&self) -> Option<i32> {
        self.exit.map(exit_code)
    }

    fn process_group(&self) -> Option<i32> {
        Some(self.pgid)
    }
}

/// Exit code, with signal deaths mapped to `128 + signal` as shells do.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
