//! Background compile jobs.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use log::{error, trace};

use crate::errors::CompileError;
use crate::pipeline::state::CompileTarget;
use crate::tasks::{CompletionSignal, TaskScheduler};

/// One pending compile: fills `state` with the result of `compile(key)`.
///
/// The task owns a clone of the key and a strong reference to the entry, so
/// the entry outlives the job even if the cache evicts it meanwhile.
pub struct AsyncCompileTask<S, K, F> {
    state: Arc<S>,
    key: K,
    label: String,
    compile: F,
}

impl<S, K, F> AsyncCompileTask<S, K, F>
where
    S: CompileTarget,
    K: Send + 'static,
    F: FnOnce(&K) -> Result<S::Pipeline, CompileError> + Send + 'static,
{
    pub fn new(state: Arc<S>, key: K, label: impl Into<String>, compile: F) -> Self {
        Self {
            state,
            key,
            label: label.into(),
            compile,
        }
    }

    /// Compiles on the current thread and stores the outcome on the entry.
    ///
    /// A panicking backend is recorded as a [`CompileError::Backend`] failure.
    pub fn run(self) {
        let Self {
            state,
            key,
            label,
            compile,
        } = self;

        trace!("Compiling pipeline '{label}'");
        let outcome = catch_unwind(AssertUnwindSafe(|| compile(&key))).unwrap_or_else(|_| {
            Err(CompileError::Backend(format!(
                "compile of '{label}' panicked"
            )))
        });
        if let Err(err) = &outcome {
            error!("Async compile of pipeline '{label}' failed: {err}");
        }
        state.pipeline_state().store_outcome(outcome);
    }

    /// Hands the task to `scheduler` and records the returned signal on the
    /// entry. Must happen before the entry is published to the cache.
    pub fn dispatch(self, scheduler: &dyn TaskScheduler) -> CompletionSignal {
        let state = Arc::clone(&self.state);
        let signal = scheduler.run_async(Box::new(move || self.run()));
        state.pipeline_state().set_pending(signal.clone());
        signal
    }
}
