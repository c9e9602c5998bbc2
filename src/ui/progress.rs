use console::{Term, style};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::audit::{AttemptEnd, AttemptRecord};
use crate::config::BuildCommand;
use crate::errors::PipelineError;
use crate::governor::{GovernorObserver, GovernorState, KillReason, PhaseSpec};
use crate::monitor::{KB_PER_GB, ResourceSample};
use crate::orchestrator::PipelineSummary;
use crate::recovery::CleanupReport;
use crate::ui::icons::{BROOM, CHECK, CLOCK, CROSS, DOWNSHIFT, GEAR, PACKAGE, SKIP, STALL, UPSHIFT};

const PREFIX: &str = "[gearbox]";

/// Terminal output for a governed run.
///
/// Executor output is echoed verbatim; governor annotations carry a
/// `[gearbox]` prefix. When stdout is a terminal a status spinner shows the
/// current gear and the latest host sample below the scrolling output.
pub struct GovernorUi {
    multi: MultiProgress,
    status: Option<ProgressBar>,
    threshold_kb: u64,
    verbose: bool,
}

impl GovernorUi {
    pub fn new(threshold_kb: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();
        let status = Term::stdout().is_term().then(|| {
            let bar = multi.add(ProgressBar::new_spinner());
            bar.set_style(
                ProgressStyle::default_spinner()
                    .template("{prefix:.bold.dim} {spinner} {msg}")
                    .expect("progress bar template is a valid static string"),
            );
            bar.set_prefix(PREFIX);
            bar.enable_steady_tick(Duration::from_millis(120));
            bar
        });

        Self {
            multi,
            status,
            threshold_kb,
            verbose,
        }
    }

    /// Print above the spinner, or straight to stdout when there is none.
    fn print_line(&self, msg: impl AsRef<str>) {
        match self.status {
            Some(_) => {
                if self.multi.println(msg.as_ref()).is_err() {
                    println!("{}", msg.as_ref());
                }
            }
            None => println!("{}", msg.as_ref()),
        }
    }

    fn annotate(&self, msg: impl std::fmt::Display) {
        self.print_line(format!("{} {}", style(PREFIX).bold().dim(), msg));
    }

    pub fn phase_skipped(&self, phase: &str) {
        self.annotate(format!(
            "{}phase {} already completed",
            SKIP,
            style(phase).cyan()
        ));
    }

    /// Final summary after a successful pipeline.
    pub fn finish(&self, summary: &PipelineSummary) {
        if let Some(ref bar) = self.status {
            bar.finish_and_clear();
        }
        for phase in &summary.skipped {
            self.phase_skipped(phase);
        }
        if summary.packaged {
            self.annotate(format!("{}packaging completed", PACKAGE));
        }
        self.annotate(format!(
            "{}{}",
            CHECK,
            style("build completed").green().bold()
        ));
        if let Some(ref report) = summary.report {
            self.annotate(style(format!("run report: {}", report.display())).dim());
        }
    }

    pub fn failed(&self, err: &PipelineError) {
        if let Some(ref bar) = self.status {
            bar.finish_and_clear();
        }
        self.annotate(format!("{}{}", CROSS, style(err).red().bold()));
    }
}

impl GovernorObserver for GovernorUi {
    fn attempt_started(&self, phase: &PhaseSpec, gear: usize, command: &BuildCommand) {
        self.annotate(format!(
            "{}phase {} gear {}/{} (concurrency {}){}",
            GEAR,
            style(&phase.name).cyan().bold(),
            gear + 1,
            phase.ladder.len(),
            style(command.concurrency).cyan(),
            phase
                .target
                .as_deref()
                .map(|t| format!(" target {}", t))
                .unwrap_or_default()
        ));
        if self.verbose {
            self.annotate(style(format!("$ {}", command.display())).dim());
        }
        if let Some(ref bar) = self.status {
            bar.set_message(format!("{} -j {}", phase.name, command.concurrency));
        }
    }

    fn output_line(&self, line: &str) {
        self.print_line(line);
    }

    fn sample_taken(&self, sample: &ResourceSample, _state: &GovernorState, concurrency: u32) {
        if let Some(ref bar) = self.status {
            bar.set_message(sample_status(sample, self.threshold_kb, concurrency));
        }
    }

    fn forced_termination(&self, reason: KillReason, from: u32, to: u32) {
        let text = shift_message(reason, from, to);
        let styled = match reason {
            KillReason::MemoryDownshift => format!("{}{}", DOWNSHIFT, style(text).yellow().bold()),
            KillReason::PredictiveUpshift => format!("{}{}", UPSHIFT, style(text).green().bold()),
            KillReason::CpuStall => format!("{}{}", STALL, style(text).magenta().bold()),
        };
        self.annotate(styled);
    }

    fn recovery_done(&self, cleanup: &CleanupReport, reaped: usize, cooled_down: bool) {
        if cleanup.files_removed > 0 || cleanup.failures > 0 {
            self.annotate(format!(
                "{}removed {} recent artifact(s), {:.1} MB{}",
                BROOM,
                cleanup.files_removed,
                cleanup.bytes_removed as f64 / (1024.0 * 1024.0),
                if cleanup.failures > 0 {
                    format!(", {} could not be removed", cleanup.failures)
                } else {
                    String::new()
                }
            ));
        }
        if reaped > 0 && self.verbose {
            self.annotate(style(format!("reaped {} leftover process(es)", reaped)).dim());
        }
        if cooled_down {
            self.annotate(format!("{}cooled down", CLOCK));
        }
    }

    fn attempt_ended(&self, record: &AttemptRecord) {
        if let AttemptEnd::Exited { code } = record.end
            && code != 0
        {
            self.annotate(format!(
                "{}{}",
                CROSS,
                style(format!("executor exited with code {}", code)).red()
            ));
        }
    }
}

/// Spinner text for one host sample.
pub fn sample_status(sample: &ResourceSample, threshold_kb: u64, concurrency: u32) -> String {
    format!(
        "-j {}  mem {:.1}/{:.1} GB  cpu {}",
        concurrency,
        sample.used_memory_gb(),
        threshold_kb as f64 / KB_PER_GB as f64,
        sample.cpu
    )
}

pub fn shift_message(reason: KillReason, from: u32, to: u32) -> String {
    match reason {
        KillReason::MemoryDownshift => format!("memory over threshold: downshift {} -> {}", from, to),
        KillReason::PredictiveUpshift => format!("memory headroom: upshift {} -> {}", from, to),
        KillReason::CpuStall => format!("cpu stalled: restarting at {}", from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::CpuUtilization;

    #[test]
    fn test_sample_status() {
        let sample = ResourceSample {
            used_memory_kb: 40 * KB_PER_GB,
            total_memory_kb: 128 * KB_PER_GB,
            cpu: CpuUtilization::Percent(12.5),
        };
        let text = sample_status(&sample, 50 * KB_PER_GB, 8);
        assert!(text.starts_with("-j 8"));
        assert!(text.contains("mem 40.0/50.0 GB"));
    }

    #[test]
    fn test_shift_messages() {
        assert_eq!(
            shift_message(KillReason::MemoryDownshift, 32, 16),
            "memory over threshold: downshift 32 -> 16"
        );
        assert_eq!(
            shift_message(KillReason::PredictiveUpshift, 16, 32),
            "memory headroom: upshift 16 -> 32"
        );
        assert_eq!(
            shift_message(KillReason::CpuStall, 8, 8),
            "cpu stalled: restarting at 8"
        );
    }
}
