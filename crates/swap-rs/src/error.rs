use thiserror::Error;

use crate::action::{ActionId, ActionKind};
use crate::device::TransferError;

/// Failure raised while executing a step's swap actions.
///
/// None of these are retried: the enclosing traversal is expected to abort.
#[derive(Debug, Error)]
pub enum SwapError {
    #[error("{kind} action {action} failed: {source}")]
    Transfer {
        action: ActionId,
        kind: ActionKind,
        #[source]
        source: TransferError,
    },
    #[error("swap-in action {action} has no staged host copy; swap-out {swap_out} never ran")]
    MissingHostCopy { action: ActionId, swap_out: ActionId },
    #[error("action {0} is already in flight")]
    AlreadyInFlight(ActionId),
    #[error("action {0} has no transfer in flight")]
    NotInFlight(ActionId),
}

pub type SwapResult<T> = Result<T, SwapError>;
