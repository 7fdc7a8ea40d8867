//! Swap actions: one pending transfer of one buffer in one direction.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::TransferEngine;

/// Stable handle of an action inside the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub(crate) usize);

impl ActionId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    SwapOut,
    SwapIn,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::SwapOut => write!(f, "swap-out"),
            ActionKind::SwapIn => write!(f, "swap-in"),
        }
    }
}

/// Observable transfer state of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferPhase {
    Idle,
    InFlight,
    Complete,
}

/// The swap-out and swap-in actions registered for one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActionPair {
    pub swap_out: ActionId,
    pub swap_in: ActionId,
}

pub(crate) enum TransferState<T> {
    Idle,
    InFlight(T),
    Complete,
}

impl<T> TransferState<T> {
    fn phase(&self) -> TransferPhase {
        match self {
            TransferState::Idle => TransferPhase::Idle,
            TransferState::InFlight(_) => TransferPhase::InFlight,
            TransferState::Complete => TransferPhase::Complete,
        }
    }
}

/// Transfer issued by `BufferRegistry::begin`; `ticket` is `None` when nothing had to move.
pub(crate) struct PendingTransfer<T> {
    pub(crate) ticket: Option<T>,
    pub(crate) bytes: usize,
}

/// Pinned host allocation owned by a swap-out action.
pub(crate) struct HostStaging<R> {
    pub(crate) region: R,
    pub(crate) capacity: usize,
    /// Bytes written by the last completed device-to-host copy.
    pub(crate) staged: Option<usize>,
}

pub(crate) enum Staging<R> {
    /// Swap-outs own their host region; it is allocated lazily on first use.
    Owner(Option<HostStaging<R>>),
    /// Swap-ins read from the region of the swap-out registered for the same buffer.
    Source(ActionId),
}

/// One registered transfer of a buffer between device and pinned host memory.
pub struct SwapAction<E: TransferEngine> {
    pub(crate) kind: ActionKind,
    pub(crate) buffer: Arc<E::Buffer>,
    pub(crate) footprint: usize,
    pub(crate) state: TransferState<PendingTransfer<E::Transfer>>,
    pub(crate) staging: Staging<E::HostRegion>,
}

impl<E: TransferEngine> SwapAction<E> {
    pub(crate) fn swap_out(buffer: Arc<E::Buffer>, footprint: usize) -> Self {
        SwapAction {
            kind: ActionKind::SwapOut,
            buffer,
            footprint,
            state: TransferState::Idle,
            staging: Staging::Owner(None),
        }
    }

    pub(crate) fn swap_in(buffer: Arc<E::Buffer>, footprint: usize, source: ActionId) -> Self {
        SwapAction {
            kind: ActionKind::SwapIn,
            buffer,
            footprint,
            state: TransferState::Idle,
            staging: Staging::Source(source),
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn buffer(&self) -> &Arc<E::Buffer> {
        &self.buffer
    }

    pub fn phase(&self) -> TransferPhase {
        self.state.phase()
    }

    /// Device bytes this action moves, as last observed on the buffer.
    pub fn footprint_bytes(&self) -> usize {
        self.footprint
    }

    /// Swap-out whose host copy this swap-in restores; `None` for swap-outs.
    pub fn source(&self) -> Option<ActionId> {
        match self.staging {
            Staging::Source(source) => Some(source),
            Staging::Owner(_) => None,
        }
    }

    /// Capacity of the pinned host region held by a swap-out (zero when none is held).
    pub fn pinned_bytes(&self) -> usize {
        match &self.staging {
            Staging::Owner(Some(host)) => host.capacity,
            _ => 0,
        }
    }

    pub(crate) fn staged_host(&self) -> Option<(&E::HostRegion, usize)> {
        match &self.staging {
            Staging::Owner(Some(host)) => host.staged.map(|bytes| (&host.region, bytes)),
            _ => None,
        }
    }

    pub(crate) fn take_host_region(&mut self) -> Option<HostStaging<E::HostRegion>> {
        match &mut self.staging {
            Staging::Owner(host) => host.take(),
            Staging::Source(_) => None,
        }
    }
}

impl<E: TransferEngine> fmt::Debug for SwapAction<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapAction")
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .field("footprint", &self.footprint)
            .field("source", &self.source())
            .field("pinned_bytes", &self.pinned_bytes())
            .finish()
    }
}
