//! The command-stream side of the compile hand-off.

use smallvec::SmallVec;

use super::signal::CompletionSignal;

/// A command stream that records GPU work using cached pipelines.
///
/// When a lookup returns a pipeline whose compile is still in flight, the
/// cache calls [`wait_on`](Self::wait_on) so the stream defers its own
/// submission until the compile has finished.
pub trait CommandContext {
    /// Registers `signal` as a prerequisite of this stream's submission.
    fn wait_on(&mut self, signal: &CompletionSignal);

    /// Immediate (bypass) contexts execute as they record and therefore
    /// cannot wait on background work; misses compile inline instead.
    fn is_immediate(&self) -> bool {
        false
    }
}

/// Minimal recording command list.
#[derive(Debug, Default)]
pub struct CommandList {
    immediate: bool,
    prerequisites: SmallVec<[CompletionSignal; 4]>,
}

impl CommandList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A list in immediate mode.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            prerequisites: SmallVec::new(),
        }
    }

    #[must_use]
    pub fn prerequisites(&self) -> &[CompletionSignal] {
        &self.prerequisites
    }

    /// `true` when every prerequisite has completed.
    #[must_use]
    pub fn is_ready_to_submit(&self) -> bool {
        self.prerequisites.iter().all(CompletionSignal::is_complete)
    }

    /// Blocks until every prerequisite has completed, then clears them.
    pub fn wait_for_prerequisites(&mut self) {
        for signal in self.prerequisites.drain(..) {
            signal.wait();
        }
    }
}

impl CommandContext for CommandList {
    fn wait_on(&mut self, signal: &CompletionSignal) {
        if signal.is_complete() || self.prerequisites.iter().any(|s| s.same_signal(signal)) {
            return;
        }
        self.prerequisites.push(signal.clone());
    }

    fn is_immediate(&self) -> bool {
        self.immediate
    }
}
