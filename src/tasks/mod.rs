//! Background work plumbing
//!
//! - [`CompletionSignal`]: one-shot event shared by a compile job and its waiters
//! - [`TaskScheduler`]: runs jobs off the calling thread ([`WorkerPool`], [`InlineScheduler`])
//! - [`CommandContext`]: the command stream that defers submission on pending compiles

pub mod command;
pub mod scheduler;
pub mod signal;

pub use command::{CommandContext, CommandList};
pub use scheduler::{InlineScheduler, Job, TaskScheduler, WorkerPool};
pub use signal::CompletionSignal;
