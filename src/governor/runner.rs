//! The per-phase control loop.

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::policy::GearPolicy;
use super::state::{GovernorState, KillReason};
use super::{GovernorSettings, PhaseSpec};
use crate::audit::{AttemptEnd, AttemptRecord};
use crate::config::{BuildCommand, ExecutorSpec};
use crate::errors::GovernorError;
use crate::monitor::{ResourceProbe, ResourceSample};
use crate::recovery::{CleanupReport, Recovery};
use crate::supervisor::{BuildAttempt, Supervisor, TerminationOutcome};

/// Receives progress events from the control loop.
///
/// All methods default to no-ops so observers only implement what they show.
pub trait GovernorObserver: Send + Sync {
    fn attempt_started(&self, _phase: &PhaseSpec, _gear: usize, _command: &BuildCommand) {}

    fn output_line(&self, _line: &str) {}

    fn sample_taken(&self, _sample: &ResourceSample, _state: &GovernorState, _concurrency: u32) {}

    fn forced_termination(&self, _reason: KillReason, _from: u32, _to: u32) {}

    fn recovery_done(&self, _cleanup: &CleanupReport, _reaped: usize, _cooled_down: bool) {}

    fn attempt_ended(&self, _record: &AttemptRecord) {}
}

pub struct NoopObserver;

impl GovernorObserver for NoopObserver {}

static NOOP_OBSERVER: NoopObserver = NoopObserver;

/// How the drive loop left an attempt.
enum Step {
    Exited,
    Forced { reason: KillReason, next_gear: usize },
    Cancelled,
}

/// Drives one phase through the gear ladder until the executor exits on
/// its own or the run is cancelled.
pub struct Governor<'a> {
    settings: &'a GovernorSettings,
    executor: &'a ExecutorSpec,
    probe: &'a mut dyn ResourceProbe,
    supervisor: &'a mut dyn Supervisor,
    recovery: &'a mut dyn Recovery,
    observer: &'a dyn GovernorObserver,
    cancel: Option<watch::Receiver<bool>>,
    attempts: Vec<AttemptRecord>,
}

impl<'a> Governor<'a> {
    pub fn new(
        settings: &'a GovernorSettings,
        executor: &'a ExecutorSpec,
        probe: &'a mut dyn ResourceProbe,
        supervisor: &'a mut dyn Supervisor,
        recovery: &'a mut dyn Recovery,
    ) -> Self {
        Self {
            settings,
            executor,
            probe,
            supervisor,
            recovery,
            observer: &NOOP_OBSERVER,
            cancel: None,
            attempts: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: &'a dyn GovernorObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Stop the phase once the receiver observes `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Attempts made so far, oldest first.
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn take_attempts(&mut self) -> Vec<AttemptRecord> {
        std::mem::take(&mut self.attempts)
    }

    /// Run `phase` to completion.
    ///
    /// Returns `Ok` once an attempt exits with code 0. A non-zero self-exit
    /// is a real build failure and is never retried.
    pub async fn run(&mut self, phase: &PhaseSpec) -> Result<(), GovernorError> {
        let settings = self.settings;
        let policy = GearPolicy::new(settings, &phase.ladder);
        let mut state = GovernorState::new();

        loop {
            state.begin_attempt();
            let gear = state.current_gear;
            let concurrency = phase.ladder.concurrency(gear);
            let command = self
                .executor
                .command_for(concurrency, phase.target.as_deref());

            info!(
                phase = %phase.name,
                gear,
                concurrency,
                command = %command.display(),
                "Starting build attempt"
            );
            self.observer.attempt_started(phase, gear, &command);

            let started_at = Utc::now();
            let mut attempt = self.supervisor.start(&command).await?;
            let mut tasks = 0u32;

            let step = self
                .drive(&policy, &mut state, attempt.as_mut(), &mut tasks)
                .await;

            let end = match step {
                Ok(Step::Exited) => {
                    self.finish_exited(attempt.as_mut(), &mut state, &mut tasks)
                        .await
                }
                Ok(Step::Forced { reason, next_gear }) => {
                    let to = phase.ladder.concurrency(next_gear);
                    warn!(
                        phase = %phase.name,
                        %reason,
                        from = concurrency,
                        to,
                        "Terminating build attempt"
                    );
                    let termination = attempt.terminate().await;
                    if termination == TerminationOutcome::AlreadyExited {
                        info!(phase = %phase.name, "Executor exited before termination");
                        self.finish_exited(attempt.as_mut(), &mut state, &mut tasks)
                            .await
                    } else {
                        self.observer.forced_termination(reason, concurrency, to);
                        state.record_kill(reason);
                        let cleanup = self.recover(&mut state, attempt.process_group()).await;
                        state.current_gear = next_gear;
                        AttemptEnd::Forced {
                            reason,
                            next_gear,
                            termination,
                            cleanup,
                        }
                    }
                }
                Ok(Step::Cancelled) => {
                    warn!(phase = %phase.name, "Cancellation requested; stopping executor");
                    let termination = attempt.terminate().await;
                    self.recover(&mut state, attempt.process_group()).await;
                    AttemptEnd::Cancelled { termination }
                }
                Err(ref e) => {
                    error!(phase = %phase.name, error = %e, "Governor error; stopping executor");
                    let termination = attempt.terminate().await;
                    self.recover(&mut state, attempt.process_group()).await;
                    AttemptEnd::Aborted {
                        error: e.to_string(),
                        termination,
                    }
                }
            };

            let record = AttemptRecord {
                gear_index: gear,
                concurrency,
                started_at,
                ended_at: Utc::now(),
                tasks_completed: tasks,
                end: end.clone(),
            };
            self.observer.attempt_ended(&record);
            self.attempts.push(record);

            match (step, end) {
                (Err(e), _) => return Err(e),
                (_, AttemptEnd::Exited { code: 0 }) => {
                    info!(phase = %phase.name, concurrency, tasks, "Build attempt succeeded");
                    return Ok(());
                }
                (_, AttemptEnd::Exited { code }) => {
                    error!(phase = %phase.name, exit_code = code, "Executor failed");
                    return Err(GovernorError::BuildFailed { exit_code: code });
                }
                (_, AttemptEnd::Cancelled { .. }) => return Err(GovernorError::Cancelled),
                _ => {}
            }
        }
    }

    /// Tick until the attempt exits, the policy forces a termination, or
    /// cancellation is requested.
    async fn drive(
        &mut self,
        policy: &GearPolicy<'_>,
        state: &mut GovernorState,
        attempt: &mut dyn BuildAttempt,
        tasks: &mut u32,
    ) -> Result<Step, GovernorError> {
        loop {
            if !attempt.is_alive()? {
                return Ok(Step::Exited);
            }

            let timeout = self.settings.poll_interval(state.current_gear);
            let line = tokio::select! {
                biased;
                _ = cancelled(self.cancel.as_mut()) => return Ok(Step::Cancelled),
                line = attempt.poll_line(timeout) => line,
            };
            if let Some(line) = line {
                self.observe_line(&line, state, tasks);
            }
            if !attempt.is_alive()? {
                return Ok(Step::Exited);
            }

            let sample = self.probe.sample()?;
            let concurrency = policy.ladder().concurrency(state.current_gear);
            self.observer.sample_taken(&sample, state, concurrency);

            let decision = policy.evaluate(state, &sample, Instant::now());
            if let Some((reason, next_gear)) = decision.termination(state.current_gear) {
                return Ok(Step::Forced { reason, next_gear });
            }
        }
    }

    /// Drain the remaining output of a self-exited attempt and reap it.
    /// No cleanup runs: nothing was killed mid-write.
    async fn finish_exited(
        &mut self,
        attempt: &mut dyn BuildAttempt,
        state: &mut GovernorState,
        tasks: &mut u32,
    ) -> AttemptEnd {
        // Output still in flight after the leader exited. Stops at end of
        // stream or after one quiet poll interval.
        let drain = self.settings.poll_interval(state.current_gear);
        while let Some(line) = attempt.poll_line(drain).await {
            self.observe_line(&line, state, tasks);
        }
        let code = attempt.exit_status().unwrap_or(-1);
        let reaped = self.recovery.reap_zombies(attempt.process_group());
        self.observer
            .recovery_done(&CleanupReport::default(), reaped, false);
        AttemptEnd::Exited { code }
    }

    fn observe_line(&self, line: &str, state: &mut GovernorState, tasks: &mut u32) {
        self.observer.output_line(line);
        if self.settings.task_line.is_match(line) {
            state.tasks_completed_at_gear += 1;
            *tasks += 1;
        }
    }

    /// Clean, reap, then cool down if the last kill was memory-driven.
    /// Called only once the attempt's process group is gone.
    async fn recover(&mut self, state: &mut GovernorState, pgid: Option<i32>) -> CleanupReport {
        let reason = state.take_kill_reason();
        let cleanup = self
            .recovery
            .clean_recent_outputs(self.settings.cleanup_window);
        let reaped = self.recovery.reap_zombies(pgid);
        let cool = reason.is_some_and(|r| r.is_memory_related());
        if cool {
            info!(secs = self.settings.cooldown.as_secs(), "Cooling down");
            self.recovery.cooldown(self.settings.cooldown).await;
        }
        self.observer.recovery_done(&cleanup, reaped, cool);
        cleanup
    }
}

/// Resolves once cancellation is requested. Never resolves without a
/// receiver or after the sender is dropped.
async fn cancelled(rx: Option<&mut watch::Receiver<bool>>) {
    match rx {
        Some(rx) => {
            if rx.wait_for(|c| *c).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ProbeError;
    use crate::gear::GearLadder;
    use crate::governor::testing::*;
    use crate::monitor::CpuUtilization;
    use std::path::PathBuf;
    use std::time::Duration;

    fn executor() -> ExecutorSpec {
        ExecutorSpec {
            program: "ninja".to_string(),
            args: vec!["-j".to_string(), "{jobs}".to_string()],
            working_dir: PathBuf::from("/src"),
            output_dir: PathBuf::from("/src/out"),
        }
    }

    fn phase(levels: &[u32]) -> PhaseSpec {
        PhaseSpec::new("main", None, GearLadder::new(levels.to_vec()).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_build_runs_once_at_top_gear() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(vec![Script::exits(20, 0).with_task_lines(20)], |_| {
            Ok(sample(40, 50.0))
        });

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        governor.run(&phase(&[8, 4, 2])).await.unwrap();

        let attempts = governor.take_attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].concurrency, 8);
        assert_eq!(attempts[0].tasks_completed, 20);
        assert_eq!(attempts[0].end, AttemptEnd::Exited { code: 0 });
        assert_eq!(events(&h.log), vec![Event::Start(8), Event::Reap]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_pressure_downshifts_once() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(
            vec![Script::runs_forever(), Script::exits(2, 0)],
            |call| Ok(if call == 3 { sample(55, 80.0) } else { sample(40, 80.0) }),
        );

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        governor.run(&phase(&[32, 16, 8])).await.unwrap();

        let events = events(&h.log);
        assert_eq!(
            events
                .iter()
                .filter(|e| !matches!(e, Event::Terminate(_)))
                .cloned()
                .collect::<Vec<_>>(),
            vec![
                Event::Start(32),
                Event::Clean,
                Event::Reap,
                Event::Cooldown,
                Event::Start(16),
                Event::Reap,
            ]
        );
        assert!(matches!(events[1], Event::Terminate(_)));

        let attempts = governor.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(matches!(
            attempts[0].end,
            AttemptEnd::Forced {
                reason: KillReason::MemoryDownshift,
                next_gear: 1,
                ..
            }
        ));
        assert_eq!(attempts[1].concurrency, 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upshift_after_batch_when_prediction_fits() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(
            vec![
                Script::runs_forever(),
                Script::runs_forever().with_task_lines(5),
                Script::exits(1, 0),
            ],
            |call| Ok(if call == 1 { sample(55, 80.0) } else { sample(20, 80.0) }),
        );

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        governor.run(&phase(&[32, 16, 8])).await.unwrap();

        let log = events(&h.log);
        let starts: Vec<Event> = log
            .iter()
            .cloned()
            .filter(|e| matches!(e, Event::Start(_)))
            .collect();
        assert_eq!(
            starts,
            vec![Event::Start(32), Event::Start(16), Event::Start(32)]
        );
        let cooldowns = log
            .iter()
            .filter(|e| **e == Event::Cooldown)
            .count();
        assert_eq!(cooldowns, 2);
        assert!(matches!(
            governor.attempts()[1].end,
            AttemptEnd::Forced {
                reason: KillReason::PredictiveUpshift,
                next_gear: 0,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_stall_restarts_same_gear_without_cooldown() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(
            vec![Script::runs_forever(), Script::exits(1, 0)],
            |_| Ok(sample(10, 1.0)),
        );

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        governor.run(&phase(&[8, 4, 2])).await.unwrap();

        let events = events(&h.log);
        assert_eq!(
            events,
            vec![
                Event::Start(8),
                Event::Terminate(Duration::from_secs(11)),
                Event::Clean,
                Event::Reap,
                Event::Start(8),
                Event::Reap,
            ]
        );
        assert!(matches!(
            governor.attempts()[0].end,
            AttemptEnd::Forced {
                reason: KillReason::CpuStall,
                next_gear: 0,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_cpu_never_stalls() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(vec![Script::exits(30, 0)], |_| {
            Ok(ResourceSample {
                used_memory_kb: gb(10),
                total_memory_kb: gb(128),
                cpu: CpuUtilization::Unknown,
            })
        });

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        governor.run(&phase(&[8, 4])).await.unwrap();
        assert_eq!(events(&h.log), vec![Event::Start(8), Event::Reap]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_zero_exit_is_not_retried() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(vec![Script::exits(1, 2)], |_| Ok(sample(10, 50.0)));

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        let err = governor.run(&phase(&[8, 4, 2])).await.unwrap_err();

        assert!(matches!(err, GovernorError::BuildFailed { exit_code: 2 }));
        assert_eq!(events(&h.log), vec![Event::Start(8), Event::Reap]);
        assert_eq!(governor.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_on_breach_tick_keeps_exit_code() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(vec![Script::exits(3, 2)], |call| {
            Ok(if call == 3 { sample(55, 80.0) } else { sample(40, 80.0) })
        });

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        let err = governor.run(&phase(&[32, 16, 8])).await.unwrap_err();

        assert!(matches!(err, GovernorError::BuildFailed { exit_code: 2 }));
        assert_eq!(events(&h.log), vec![Event::Start(32), Event::Reap]);
        assert_eq!(governor.attempts().len(), 1);
        assert_eq!(governor.attempts()[0].end, AttemptEnd::Exited { code: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_exit_on_stall_tick_is_success() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(vec![Script::exits(11, 0)], |_| Ok(sample(10, 1.0)));

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        governor.run(&phase(&[8, 4])).await.unwrap();
        assert_eq!(events(&h.log), vec![Event::Start(8), Event::Reap]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pressure_at_lowest_gear_keeps_running() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(vec![Script::exits(3, 0)], |_| Ok(sample(80, 90.0)));

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        governor.run(&phase(&[2])).await.unwrap();
        assert_eq!(events(&h.log), vec![Event::Start(2), Event::Reap]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_without_cooldown() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(vec![Script::runs_forever()], |_| Ok(sample(10, 50.0)));
        let (tx, rx) = watch::channel(false);

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        )
        .with_cancellation(rx);
        let phase = phase(&[8, 4]);

        let (result, _) = tokio::join!(governor.run(&phase), async {
            tokio::time::sleep(Duration::from_millis(3500)).await;
            tx.send(true).unwrap();
        });

        assert!(matches!(result, Err(GovernorError::Cancelled)));
        let events = events(&h.log);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], Event::Start(8));
        assert_eq!(events[2..], [Event::Clean, Event::Reap]);
        assert!(matches!(
            governor.attempts()[0].end,
            AttemptEnd::Cancelled { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_stops_executor() {
        let settings = settings();
        let executor = executor();
        let mut h = Harness::new(vec![Script::runs_forever()], |call| {
            if call < 2 {
                Ok(sample(10, 50.0))
            } else {
                Err(ProbeError::MissingField {
                    path: PathBuf::from("/proc/meminfo"),
                    field: "MemAvailable",
                })
            }
        });

        let mut governor = Governor::new(
            &settings,
            &executor,
            &mut h.probe,
            &mut h.supervisor,
            &mut h.recovery,
        );
        let err = governor.run(&phase(&[8])).await.unwrap_err();

        assert!(matches!(err, GovernorError::Probe(_)));
        let events = events(&h.log);
        assert_eq!(events.len(), 4);
        assert_eq!(events[2..], [Event::Clean, Event::Reap]);
        assert!(matches!(
            governor.attempts()[0].end,
            AttemptEnd::Aborted { .. }
        ));
    }
}
