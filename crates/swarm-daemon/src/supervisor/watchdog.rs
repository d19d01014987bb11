//! Run states and the per-tick watchdog decision.

use std::time::Duration;

use serde::Serialize;

/// In-memory state of an active run.
///
/// `Starting -> Running -> {Stopping, Crashed, Completed, WatchdogStopped} -> Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Starting,
    Running,
    Stopping,
    Crashed,
    Completed,
    WatchdogStopped,
    Closed,
}

/// What a watchdog tick should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickVerdict {
    Continue,
    /// No agent process is left.
    AllExited,
    /// The run outlived its maximum duration.
    DurationExceeded,
}

/// Liveness is checked before duration: a run whose agents are all gone is
/// closed as exited even if it also ran too long.
pub fn evaluate_tick(
    elapsed: Duration,
    max_duration: Option<Duration>,
    any_alive: bool,
) -> TickVerdict {
    if !any_alive {
        TickVerdict::AllExited
    } else if max_duration.is_some_and(|max| elapsed >= max) {
        TickVerdict::DurationExceeded
    } else {
        TickVerdict::Continue
    }
}

/// Convert a fractional hour limit; non-positive or invalid values mean
/// "no limit".
pub fn duration_from_hours(hours: Option<f64>) -> Option<Duration> {
    let hours = hours?;
    if hours.is_finite() && hours > 0.0 {
        Duration::try_from_secs_f64(hours * 3600.0).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_run_wins_over_duration() {
        assert_eq!(
            evaluate_tick(Duration::from_secs(100), Some(Duration::from_secs(1)), false),
            TickVerdict::AllExited
        );
    }

    #[test]
    fn duration_limit() {
        let max = Some(Duration::from_secs(60));
        assert_eq!(
            evaluate_tick(Duration::from_secs(59), max, true),
            TickVerdict::Continue
        );
        assert_eq!(
            evaluate_tick(Duration::from_secs(60), max, true),
            TickVerdict::DurationExceeded
        );
        assert_eq!(
            evaluate_tick(Duration::from_secs(1_000_000), None, true),
            TickVerdict::Continue
        );
    }

    #[test]
    fn hours_conversion() {
        assert_eq!(duration_from_hours(Some(0.5)), Some(Duration::from_secs(1800)));
        assert_eq!(duration_from_hours(Some(0.0)), None);
        assert_eq!(duration_from_hours(Some(-1.0)), None);
        assert_eq!(duration_from_hours(Some(f64::NAN)), None);
        assert_eq!(duration_from_hours(None), None);
    }
}
