//! Managed subprocess lifecycle: background shell tasks and PTY sessions.
//!
//! Both managers share one lifecycle pattern (tracking table, bounded output
//! capture with a sidecar log file, max-runtime timers, graceful-then-forceful
//! termination, crash-recovery index, periodic GC) implemented once in
//! [`lifecycle`]. The managers themselves are thin deltas: one-shot piped
//! commands versus bidirectional interactive terminals.

pub mod background;
pub mod lifecycle;
pub mod pty;
pub mod recovery;

pub use background::BackgroundProcessManager;
pub use lifecycle::{PollResult, ProcessRecord, ProcessStatus};
pub use pty::PtySessionManager;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("too many concurrent tasks (limit {limit}); kill some tasks or wait for completion")]
    CapacityExceeded { limit: usize },

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
