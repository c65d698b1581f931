//! Builder lifecycle as an explicit transition table.

use std::{collections::BTreeMap, fmt};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Idle,
    /// Validating the source and readying the output target.
    Preparing,
    /// Following the feed; no render pass running.
    Fetching,
    AwaitingStubs,
    Rendering,
    /// Page writes are in flight.
    Publishing,
    /// Caught up with every write settled.
    Deployed,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Prepare,
    Prepared,
    /// A render pass was requested.
    Push,
    StubsResolved,
    Rendered,
    /// A page write began outside a render pass.
    WriteStarted,
    /// The last in-flight write finished.
    Drained { caught_up: bool },
    Fail,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transition from {from} on {signal:?}")]
pub struct TransitionError {
    pub from: BuildPhase,
    pub signal: Signal,
}

impl BuildPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildPhase::Idle => "idle",
            BuildPhase::Preparing => "preparing",
            BuildPhase::Fetching => "fetching",
            BuildPhase::AwaitingStubs => "awaiting_stubs",
            BuildPhase::Rendering => "rendering",
            BuildPhase::Publishing => "publishing",
            BuildPhase::Deployed => "deployed",
            BuildPhase::Dead => "dead",
        }
    }

    /// The phase reached from `self` on `signal`. Teardown signals are
    /// accepted everywhere, including `Dead`, so dying is idempotent.
    pub fn next(self, signal: Signal) -> Result<BuildPhase, TransitionError> {
        use BuildPhase::*;

        let next = match (self, signal) {
            (_, Signal::Fail | Signal::Stop) => Dead,
            (Idle, Signal::Prepare) => Preparing,
            (Preparing, Signal::Prepared) => Fetching,
            (Fetching | Publishing | Deployed, Signal::Push) => AwaitingStubs,
            (AwaitingStubs, Signal::StubsResolved) => Rendering,
            (Rendering, Signal::Rendered) => Publishing,
            (Fetching | Publishing | Deployed, Signal::WriteStarted) => Publishing,
            (Publishing, Signal::Drained { caught_up: true }) => Deployed,
            (Publishing, Signal::Drained { caught_up: false }) => Fetching,
            (from, signal) => return Err(TransitionError { from, signal }),
        };
        Ok(next)
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catch-up point and in-flight writes of one builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildState {
    caught_up_at: Option<u64>,
    /// Page id to number of writes in flight for it.
    pending: BTreeMap<String, usize>,
}

impl BuildState {
    /// Records the catch-up sequence. Only the first call has an effect.
    pub fn catch_up(&mut self, seq: u64) -> bool {
        if self.caught_up_at.is_some() {
            return false;
        }
        self.caught_up_at = Some(seq);
        true
    }

    pub fn caught_up_at(&self) -> Option<u64> {
        self.caught_up_at
    }

    pub fn is_caught_up(&self) -> bool {
        self.caught_up_at.is_some()
    }

    pub fn begin(&mut self, page: &str) {
        *self.pending.entry(page.to_string()).or_default() += 1;
    }

    pub fn finish(&mut self, page: &str) {
        if let Some(count) = self.pending.get_mut(page) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(page);
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.values().sum()
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }
}
