//! Shared fixtures for governor and pipeline tests.
//!
//! The fakes run on tokio's paused clock: each `poll_line` call sleeps the
//! full timeout and counts as one tick.

use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::GovernorSettings;
use crate::config::BuildCommand;
use crate::errors::{ProbeError, SupervisorError};
use crate::monitor::{CpuUtilization, KB_PER_GB, ResourceProbe, ResourceSample};
use crate::recovery::{CleanupReport, Recovery};
use crate::supervisor::{BuildAttempt, Supervisor, TerminationOutcome, TerminationStep};

pub fn gb(n: u64) -> u64 {
    n * KB_PER_GB
}

pub fn settings() -> GovernorSettings {
    GovernorSettings {
        memory_threshold_kb: gb(50),
        fast_poll: Duration::from_secs(1),
        throttle_poll: Duration::from_secs(5),
        stall_threshold_percent: 2.5,
        stall_duration: Duration::from_secs(10),
        upshift_batch_size: 5,
        cleanup_window: Duration::from_secs(120),
        cooldown: Duration::from_secs(30),
        task_line: Regex::new(r"^\[\d+/\d+\]").unwrap(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start(u32),
    Terminate(Duration),
    Clean,
    Reap,
    Cooldown,
}

pub type Log = Arc<Mutex<Vec<Event>>>;

/// Scripted attempt: one `poll_line` call per virtual tick.
#[derive(Clone, Default)]
pub struct Script {
    pub lines: VecDeque<String>,
    pub exit_after: Option<(usize, i32)>,
}

impl Script {
    pub fn exits(ticks: usize, code: i32) -> Self {
        Self {
            lines: VecDeque::new(),
            exit_after: Some((ticks, code)),
        }
    }

    pub fn runs_forever() -> Self {
        Self::default()
    }

    pub fn with_task_lines(mut self, n: usize) -> Self {
        self.lines = (1..=n).map(|i| format!("[{i}/{n}] CXX obj/{i}.o")).collect();
        self
    }
}

pub struct FakeAttempt {
    script: Script,
    ticks: usize,
    exited: Option<i32>,
    log: Log,
    epoch: Instant,
}

#[async_trait]
impl BuildAttempt for FakeAttempt {
    async fn poll_line(&mut self, timeout: Duration) -> Option<String> {
        if self.exited.is_some() {
            return None;
        }
        tokio::time::sleep(timeout).await;
        self.ticks += 1;
        if let Some((after, code)) = self.script.exit_after
            && self.ticks >= after
        {
            self.exited = Some(code);
        }
        self.script.lines.pop_front()
    }

    fn is_alive(&mut self) -> Result<bool, SupervisorError> {
        Ok(self.exited.is_none())
    }

    async fn terminate(&mut self) -> TerminationOutcome {
        self.log
            .lock()
            .unwrap()
            .push(Event::Terminate(self.epoch.elapsed()));
        self.exited = Some(130);
        TerminationOutcome::Confirmed {
            step: TerminationStep::Interrupt,
        }
    }

    fn exit_status(&self) -> Option<i32> {
        self.exited
    }

    fn process_group(&self) -> Option<i32> {
        Some(4242)
    }
}

pub struct FakeSupervisor {
    scripts: VecDeque<Script>,
    log: Log,
    epoch: Instant,
    /// Every command started, in order
    pub started: Vec<BuildCommand>,
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn start(
        &mut self,
        command: &BuildCommand,
    ) -> Result<Box<dyn BuildAttempt>, SupervisorError> {
        self.log
            .lock()
            .unwrap()
            .push(Event::Start(command.concurrency));
        self.started.push(command.clone());
        let script = self.scripts.pop_front().unwrap_or(Script::exits(1, 0));
        Ok(Box::new(FakeAttempt {
            script,
            ticks: 0,
            exited: None,
            log: self.log.clone(),
            epoch: self.epoch,
        }))
    }
}

pub type SampleFn = Box<dyn FnMut(usize) -> Result<ResourceSample, ProbeError> + Send>;

/// Probe whose answer depends on the 1-based call number.
pub struct FakeProbe {
    calls: usize,
    f: SampleFn,
}

impl ResourceProbe for FakeProbe {
    fn sample(&mut self) -> Result<ResourceSample, ProbeError> {
        self.calls += 1;
        (self.f)(self.calls)
    }
}

pub struct FakeRecovery {
    log: Log,
}

#[async_trait]
impl Recovery for FakeRecovery {
    fn clean_recent_outputs(&mut self, _window: Duration) -> CleanupReport {
        self.log.lock().unwrap().push(Event::Clean);
        CleanupReport {
            files_removed: 2,
            bytes_removed: 2048,
            failures: 0,
        }
    }

    fn reap_zombies(&mut self, _pgid: Option<i32>) -> usize {
        self.log.lock().unwrap().push(Event::Reap);
        0
    }

    async fn cooldown(&mut self, _duration: Duration) {
        self.log.lock().unwrap().push(Event::Cooldown);
    }
}

pub fn sample(used_gb: u64, cpu: f64) -> ResourceSample {
    ResourceSample {
        used_memory_kb: gb(used_gb),
        total_memory_kb: gb(128),
        cpu: CpuUtilization::Percent(cpu),
    }
}

pub struct Harness {
    pub log: Log,
    pub supervisor: FakeSupervisor,
    pub probe: FakeProbe,
    pub recovery: FakeRecovery,
}

impl Harness {
    /// `f` maps the 1-based probe call number to a sample.
    pub fn new(
        scripts: Vec<Script>,
        f: impl FnMut(usize) -> Result<ResourceSample, ProbeError> + Send + 'static,
    ) -> Self {
        let log: Log = Arc::default();
        Self {
            supervisor: FakeSupervisor {
                scripts: scripts.into(),
                log: log.clone(),
                epoch: Instant::now(),
                started: Vec::new(),
            },
            probe: FakeProbe {
                calls: 0,
                f: Box::new(f),
            },
            recovery: FakeRecovery { log: log.clone() },
            log,
        }
    }
}

/// Snapshot of the shared event log. Takes the log rather than the harness
/// so it can be read while a governor borrows the fakes.
pub fn events(log: &Log) -> Vec<Event> {
    log.lock().unwrap().clone()
}
