//! Escalating process-group termination.
//!
//! The sequence is an explicit state machine: [`TerminationStep::Interrupt`]
//! → [`TerminationStep::Terminate`] → [`TerminationStep::Kill`]. Each step
//! is followed by a bounded wait for the group to disappear. There is no
//! step after `Kill`: if the group survives SIGKILL the outcome is
//! [`TerminationOutcome::Unconfirmed`] and the caller carries on.

use std::fmt;
use std::io;

/// One step of the termination sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStep {
    Interrupt,
    Terminate,
    Kill,
}

impl TerminationStep {
    pub const FIRST: TerminationStep = TerminationStep::Interrupt;

    pub fn signal(&self) -> libc::c_int {
        match self {
            TerminationStep::Interrupt => libc::SIGINT,
            TerminationStep::Terminate => libc::SIGTERM,
            TerminationStep::Kill => libc::SIGKILL,
        }
    }

    /// The next, harsher step; `None` after `Kill`.
    pub fn next(&self) -> Option<TerminationStep> {
        match self {
            TerminationStep::Interrupt => Some(TerminationStep::Terminate),
            TerminationStep::Terminate => Some(TerminationStep::Kill),
            TerminationStep::Kill => None,
        }
    }

    /// All steps in escalation order.
    pub fn sequence() -> impl Iterator<Item = TerminationStep> {
        std::iter::successors(Some(Self::FIRST), |s| s.next())
    }
}

impl fmt::Display for TerminationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationStep::Interrupt => write!(f, "SIGINT"),
            TerminationStep::Terminate => write!(f, "SIGTERM"),
            TerminationStep::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Result of a termination request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TerminationOutcome {
    /// The group was gone before any signal was needed.
    AlreadyExited,
    /// The group disappeared after `step`.
    Confirmed { step: TerminationStep },
    /// The group still existed after SIGKILL and the final wait.
    Unconfirmed,
}

impl TerminationOutcome {
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, TerminationOutcome::Unconfirmed)
    }
}

/// Send `signal` to every member of process group `pgid`.
///
/// A group that no longer exists (`ESRCH`) is not an error.
pub fn signal_group(pgid: i32, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether any process still belongs to group `pgid`.
///
/// Zombie members still count until they are reaped.
pub fn group_exists(pgid: i32) -> bool {
    // SAFETY: signal 0 performs permission and existence checks only.
    let rc = unsafe { libc::kill(-pgid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the group exists but belongs to someone else.
    io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Make this process the subreaper for its descendants.
///
/// Members of a killed executor group are then reparented here instead of
/// to PID 1, so [`reap_group`] can collect them and the group disappears.
#[cfg(target_os = "linux")]
pub fn become_subreaper() -> io::Result<()> {
    // SAFETY: PR_SET_CHILD_SUBREAPER reads a single integer flag.
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1 as libc::c_ulong) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
pub fn become_subreaper() -> io::Result<()> {
    Ok(())
}

/// Reap every already-exited child in group `pgid` without blocking.
/// Returns how many were collected.
pub fn reap_group(pgid: i32) -> usize {
    let mut reaped = 0;
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: status is a valid, writable c_int for the duration of the call.
        let pid = unsafe { libc::waitpid(-pgid, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            // 0: children remain but none have exited; -1: no children left (ECHILD)
            break;
        }
        reaped += 1;
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_escalates_to_kill() {
        let steps: Vec<_> = TerminationStep::sequence().collect();
        assert_eq!(
            steps,
            vec![
                TerminationStep::Interrupt,
                TerminationStep::Terminate,
                TerminationStep::Kill
            ]
        );
        assert_eq!(TerminationStep::Kill.next(), None);
    }

    #[test]
    fn test_signals() {
        assert_eq!(TerminationStep::Interrupt.signal(), libc::SIGINT);
        assert_eq!(TerminationStep::Terminate.signal(), libc::SIGTERM);
        assert_eq!(TerminationStep::Kill.signal(), libc::SIGKILL);
        assert_eq!(TerminationStep::Terminate.to_string(), "SIGTERM");
    }

    #[test]
    fn test_outcome_confirmation() {
        assert!(TerminationOutcome::AlreadyExited.is_confirmed());
        assert!(
            TerminationOutcome::Confirmed {
                step: TerminationStep::Kill
            }
            .is_confirmed()
        );
        assert!(!TerminationOutcome::Unconfirmed.is_confirmed());
    }

    #[test]
    fn test_missing_group_is_not_an_error() {
        // pid_max on Linux is at most 2^22, so this group cannot exist.
        let pgid = 1 << 30;
        assert!(!group_exists(pgid));
        assert!(signal_group(pgid, libc::SIGTERM).is_ok());
    }
}
