//! Flight-log sync pipeline and the control surface the shutdown
//! coordinator drives it through.

pub mod gate;
pub mod note;
pub mod pipeline;
pub mod uplink;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use gate::{TransferGate, TransferPermit};
pub use note::{FlightNote, LogNamePattern};
pub use pipeline::{FileSyncPipeline, SendSummary};
pub use uplink::{SpoolUplink, Uplink};

/// Ask the pipeline to finish in-flight work before `deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainRequest {
    /// Point in time after which the pipeline must answer.
    pub deadline: Instant,
}

impl DrainRequest {
    /// A request whose deadline is `within` from now.
    #[must_use]
    pub fn within(within: Duration) -> Self {
        Self {
            deadline: Instant::now() + within,
        }
    }
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Every in-flight transfer reached a durable checkpoint.
    Completed,
    /// The deadline passed with transfers still running.
    TimedOut {
        /// Transfers still running at the deadline.
        in_flight: usize,
    },
    /// The pipeline did not answer by the deadline at all.
    Unanswered,
}

impl DrainOutcome {
    /// Whether all in-flight work finished in time.
    #[must_use]
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for DrainOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::TimedOut { in_flight } => write!(f, "timed out with {in_flight} in flight"),
            Self::Unanswered => write!(f, "unanswered"),
        }
    }
}

/// Control surface of the sync pipeline.
///
/// `pause` stops new transfers from starting. `drain` pauses, then waits
/// for in-flight transfers until the request's deadline and must return by
/// then.
#[async_trait]
pub trait SyncControl: Send + Sync {
    /// Stop starting new transfers.
    async fn pause(&self);

    /// Wait for in-flight transfers to reach a durable checkpoint.
    async fn drain(&self, request: DrainRequest) -> DrainOutcome;
}
