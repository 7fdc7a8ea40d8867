//! Arena of swap actions keyed by buffer identity.
//!
//! Every buffer that appears in a swap plan gets exactly one swap-out and one swap-in action,
//! no matter how many steps reference it. Actions are addressed by [`ActionId`] so per-step
//! lists hold plain indices and teardown is a single arena reset.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use tracing::trace;

use crate::action::{
    ActionId, ActionKind, ActionPair, HostStaging, PendingTransfer, Staging, SwapAction,
    TransferState,
};
use crate::device::{DeviceBuffer, TransferEngine};
use crate::error::{SwapError, SwapResult};

/// Identity of a buffer: the address of its shared allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferKey(usize);

impl BufferKey {
    pub fn of<B>(buffer: &Arc<B>) -> Self {
        BufferKey(Arc::as_ptr(buffer) as *const () as usize)
    }
}

/// Outcome of a completed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completed {
    pub kind: ActionKind,
    /// Bytes actually copied; zero when the buffer was already where the action puts it.
    pub bytes: usize,
}

pub struct BufferRegistry<E: TransferEngine> {
    actions: Vec<SwapAction<E>>,
    by_buffer: HashMap<BufferKey, ActionPair>,
}

impl<E: TransferEngine> Default for BufferRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: TransferEngine> BufferRegistry<E> {
    pub fn new() -> Self {
        BufferRegistry {
            actions: Vec::new(),
            by_buffer: HashMap::new(),
        }
    }

    /// Returns the action pair for `buffer`, registering a new linked pair on first sight.
    pub fn get_or_create(&mut self, buffer: &Arc<E::Buffer>) -> ActionPair {
        let key = BufferKey::of(buffer);
        if let Some(pair) = self.by_buffer.get(&key) {
            return *pair;
        }

        let footprint = buffer.size_in_bytes();
        let swap_out = ActionId(self.actions.len());
        self.actions.push(SwapAction::swap_out(Arc::clone(buffer), footprint));
        let swap_in = ActionId(self.actions.len());
        self.actions
            .push(SwapAction::swap_in(Arc::clone(buffer), footprint, swap_out));

        let pair = ActionPair { swap_out, swap_in };
        self.by_buffer.insert(key, pair);
        pair
    }

    pub fn pair_for(&self, buffer: &Arc<E::Buffer>) -> Option<ActionPair> {
        self.by_buffer.get(&BufferKey::of(buffer)).copied()
    }

    pub fn action(&self, id: ActionId) -> Option<&SwapAction<E>> {
        self.actions.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActionId, &SwapAction<E>)> {
        self.actions
            .iter()
            .enumerate()
            .map(|(index, action)| (ActionId(index), action))
    }

    /// Number of registered buffers.
    pub fn len(&self) -> usize {
        self.by_buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_buffer.is_empty()
    }

    /// Device bytes moved by `id`; swap-ins report the footprint of their swap-out.
    pub fn footprint_bytes(&self, id: ActionId) -> usize {
        let action = &self.actions[id.0];
        match action.source() {
            Some(source) => self.actions[source.0].footprint,
            None => action.footprint,
        }
    }

    /// Total capacity of pinned host regions currently held by swap-outs.
    pub fn pinned_bytes(&self) -> usize {
        self.actions.iter().map(SwapAction::pinned_bytes).sum()
    }

    /// Issues the transfer of one action without waiting for it.
    pub fn begin(&mut self, id: ActionId, engine: &E) -> SwapResult<()> {
        let action = &self.actions[id.0];
        if matches!(action.state, TransferState::InFlight(_)) {
            return Err(SwapError::AlreadyInFlight(id));
        }
        let pending = match action.source() {
            None => self.begin_swap_out(id, engine)?,
            Some(source) => self.begin_swap_in(id, source, engine)?,
        };
        self.actions[id.0].state = TransferState::InFlight(pending);
        Ok(())
    }

    fn begin_swap_out(
        &mut self,
        id: ActionId,
        engine: &E,
    ) -> SwapResult<PendingTransfer<E::Transfer>> {
        let action = &mut self.actions[id.0];
        let bytes = action.buffer.size_in_bytes();
        if bytes == 0 {
            trace!(action = %id, "buffer already evicted; nothing to swap out");
            return Ok(PendingTransfer { ticket: None, bytes });
        }
        action.footprint = bytes;

        let Staging::Owner(host) = &mut action.staging else {
            unreachable!("swap-out action {id} without host staging");
        };
        let staging = match host.take() {
            Some(existing) if existing.capacity >= bytes => host.insert(existing),
            previous => {
                if let Some(previous) = previous {
                    engine.free_pinned(previous.region);
                }
                let region = engine
                    .alloc_pinned(bytes)
                    .map_err(|source| SwapError::Transfer {
                        action: id,
                        kind: ActionKind::SwapOut,
                        source,
                    })?;
                host.insert(HostStaging {
                    region,
                    capacity: bytes,
                    staged: None,
                })
            }
        };
        staging.staged = None;

        let ticket = engine
            .begin_device_to_host(&action.buffer, &mut staging.region)
            .map_err(|source| SwapError::Transfer {
                action: id,
                kind: ActionKind::SwapOut,
                source,
            })?;
        trace!(action = %id, bytes, "swap-out issued");
        Ok(PendingTransfer {
            ticket: Some(ticket),
            bytes,
        })
    }

    fn begin_swap_in(
        &mut self,
        id: ActionId,
        source: ActionId,
        engine: &E,
    ) -> SwapResult<PendingTransfer<E::Transfer>> {
        let buffer = &self.actions[id.0].buffer;
        if buffer.size_in_bytes() > 0 {
            trace!(action = %id, "buffer already resident; nothing to swap in");
            return Ok(PendingTransfer {
                ticket: None,
                bytes: 0,
            });
        }
        let Some((region, bytes)) = self.actions[source.0].staged_host() else {
            return Err(SwapError::MissingHostCopy {
                action: id,
                swap_out: source,
            });
        };

        let ticket = engine
            .begin_host_to_device(region, bytes, buffer)
            .map_err(|err| SwapError::Transfer {
                action: id,
                kind: ActionKind::SwapIn,
                source: err,
            })?;
        trace!(action = %id, bytes, "swap-in issued");
        Ok(PendingTransfer {
            ticket: Some(ticket),
            bytes,
        })
    }

    /// Waits for the action's transfer to finish.
    ///
    /// A completed swap-out releases the device buffer; its contents now live only in the
    /// pinned host region.
    pub fn end(&mut self, id: ActionId, engine: &E) -> SwapResult<Completed> {
        let action = &mut self.actions[id.0];
        let kind = action.kind;
        let pending = match mem::replace(&mut action.state, TransferState::Idle) {
            TransferState::InFlight(pending) => pending,
            other => {
                action.state = other;
                return Err(SwapError::NotInFlight(id));
            }
        };
        let Some(ticket) = pending.ticket else {
            action.state = TransferState::Complete;
            return Ok(Completed { kind, bytes: 0 });
        };

        engine
            .wait(ticket)
            .map_err(|source| SwapError::Transfer {
                action: id,
                kind,
                source,
            })?;

        if let Staging::Owner(Some(host)) = &mut action.staging {
            host.staged = Some(pending.bytes);
            action.buffer.release();
        }
        action.state = TransferState::Complete;
        if let Some(source) = action.source() {
            self.consume_staged(source);
        }
        trace!(action = %id, %kind, bytes = pending.bytes, "transfer complete");
        Ok(Completed {
            kind,
            bytes: pending.bytes,
        })
    }

    /// A restored host copy is used up; only a fresh swap-out can stage the buffer again.
    fn consume_staged(&mut self, swap_out: ActionId) {
        if let Staging::Owner(Some(host)) = &mut self.actions[swap_out.0].staging {
            host.staged = None;
        }
    }

    /// Begins and immediately waits for one action.
    pub fn run(&mut self, id: ActionId, engine: &E) -> SwapResult<Completed> {
        self.begin(id, engine)?;
        self.end(id, engine)
    }

    /// Frees every pinned host region and empties the arena. Returns the pinned bytes freed.
    pub fn release_all(&mut self, engine: &E) -> usize {
        let mut freed = 0;
        for action in &mut self.actions {
            if let Some(host) = action.take_host_region() {
                freed += host.capacity;
                engine.free_pinned(host.region);
            }
        }
        self.actions.clear();
        self.by_buffer.clear();
        freed
    }
}
