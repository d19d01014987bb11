//! Checkpoint markers in agent output.
//!
//! Agents announce progress with lines such as
//! `[checkpoint:task-done] wrote parser`.

use std::sync::LazyLock;

use regex::Regex;

use crate::checkpoint::CheckpointType;

#[allow(clippy::expect_used)]
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*\[checkpoint:(phase-start|phase-complete|task-done|error)\]\s*(.*?)\s*$")
        .expect("static regex is valid")
});

/// A recognised marker: its type and the trimmed payload after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub checkpoint_type: CheckpointType,
    pub data: String,
}

/// Scan one output line for a checkpoint marker.
pub fn detect(line: &str) -> Option<Marker> {
    let caps = MARKER_RE.captures(line)?;
    let checkpoint_type = CheckpointType::parse(&caps[1].to_ascii_lowercase())?;
    let data = caps.get(2).map_or("", |m| m.as_str()).to_string();
    Some(Marker {
        checkpoint_type,
        data,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn detects_each_type() {
        let cases = [
            ("[checkpoint:phase-start] 2", CheckpointType::PhaseStart, "2"),
            ("[checkpoint:phase-complete]", CheckpointType::PhaseComplete, ""),
            ("  [checkpoint:task-done] wrote parser  ", CheckpointType::TaskDone, "wrote parser"),
            ("[CHECKPOINT:Error] disk full", CheckpointType::Error, "disk full"),
        ];
        for (line, kind, data) in cases {
            let marker = detect(line).unwrap();
            assert_eq!(marker.checkpoint_type, kind, "{line}");
            assert_eq!(marker.data, data, "{line}");
        }
    }

    #[test]
    fn ignores_ordinary_output() {
        assert!(detect("compiling crate").is_none());
        assert!(detect("[checkpoint:unknown] x").is_none());
        assert!(detect("prefix [checkpoint:task-done] x").is_none());
        assert!(detect("").is_none());
    }
}
