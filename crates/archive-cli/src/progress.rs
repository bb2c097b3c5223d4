//! Progress/stats rendering is explicitly out of scope (spec §6); this is
//! the seam the ingestion controller talks to instead of a concrete
//! terminal library.

use std::io::IsTerminal;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsMode {
    Auto,
    Yes,
    No,
}

impl FromStr for StatsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(StatsMode::Auto),
            "yes" => Ok(StatsMode::Yes),
            "no" => Ok(StatsMode::No),
            other => Err(format!("expected auto|yes|no, got {other:?}")),
        }
    }
}

impl StatsMode {
    /// `auto` renders when stderr is a terminal.
    pub fn enabled(self) -> bool {
        match self {
            StatsMode::Yes => true,
            StatsMode::No => false,
            StatsMode::Auto => std::io::stderr().is_terminal(),
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, message: &str);
}

pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn event(&self, _message: &str) {}
}

pub struct StderrProgressSink;

impl ProgressSink for StderrProgressSink {
    fn event(&self, message: &str) {
        eprintln!("{message}");
    }
}

pub fn progress_sink(mode: StatsMode) -> Box<dyn ProgressSink> {
    if mode.enabled() {
        Box::new(StderrProgressSink)
    } else {
        Box::new(NoOpProgressSink)
    }
}
