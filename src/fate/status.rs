use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a transaction.
///
/// Transactions flow: NEW → SUBMITTED → IN_PROGRESS → SUCCESSFUL, or
/// into FAILED_IN_PROGRESS → FAILED once a step fails. UNKNOWN is only ever
/// reported for ids the store has no record of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    New,
    Submitted,
    InProgress,
    FailedInProgress,
    Failed,
    Successful,
    Unknown,
}

impl TxStatus {
    pub const ALL: [TxStatus; 7] = [
        TxStatus::New,
        TxStatus::Submitted,
        TxStatus::InProgress,
        TxStatus::FailedInProgress,
        TxStatus::Failed,
        TxStatus::Successful,
        TxStatus::Unknown,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Successful | TxStatus::Failed)
    }

    /// Statuses a worker may pick up.
    pub fn is_runnable(self) -> bool {
        matches!(
            self,
            TxStatus::Submitted | TxStatus::InProgress | TxStatus::FailedInProgress
        )
    }

    /// Whether the status machine allows moving from `self` to `next`.
    ///
    /// SUBMITTED may fail directly (cancellation, refused lock, readiness
    /// exhausted) without ever entering IN_PROGRESS.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (New, Submitted)
                | (Submitted, InProgress)
                | (Submitted, FailedInProgress)
                | (InProgress, Successful)
                | (InProgress, FailedInProgress)
                | (FailedInProgress, Failed)
        )
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxStatus::New => write!(f, "NEW"),
            TxStatus::Submitted => write!(f, "SUBMITTED"),
            TxStatus::InProgress => write!(f, "IN_PROGRESS"),
            TxStatus::FailedInProgress => write!(f, "FAILED_IN_PROGRESS"),
            TxStatus::Failed => write!(f, "FAILED"),
            TxStatus::Successful => write!(f, "SUCCESSFUL"),
            TxStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        TxStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == wanted)
            .ok_or_else(|| format!("unknown status `{s}`"))
    }
}
