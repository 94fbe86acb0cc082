//! Bounded ring of frame slots shared by the event pump and the retriever.
//!
//! The pump is the only producer and the retriever the only consumer. Each
//! slot moves `Free -> Filling -> Ready -> InUse -> Free`; the frame buffer
//! itself is moved out of the slot while it is filled or held by the
//! consumer, so the lock is never held during a payload copy.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::frame::{FrameMetadata, RawFrame};
use crate::traits::TransferStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Filling,
    Ready,
    InUse,
}

#[derive(Debug)]
struct Slot {
    frame: Option<RawFrame>,
    state: SlotState,
    fault: Option<TransferStatus>,
}

#[derive(Debug)]
struct RingState {
    slots: Vec<Slot>,
    ready: VecDeque<usize>,
    frame_capacity: usize,
    cancelled: bool,
    lifetime: u64,
    failure: Option<String>,
    pushed: u64,
    dropped: u64,
}

/// A ready slot handed to the consumer.
#[derive(Debug)]
pub(crate) struct ReadyFrame {
    pub index: usize,
    pub frame: RawFrame,
    pub fault: Option<TransferStatus>,
}

/// Outcome of waiting on the ring.
#[derive(Debug)]
pub(crate) enum Popped {
    Frame(ReadyFrame),
    TimedOut,
    Cancelled,
    Failed(String),
}

/// Ring counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingStats {
    /// Number of slots.
    pub capacity: usize,
    /// Slots waiting for the consumer.
    pub ready: usize,
    /// Frames written by the producer.
    pub pushed: u64,
    /// Ready frames overwritten before the consumer got to them.
    pub dropped: u64,
}

/// Bounded frame ring with blocking, cancellable pop.
#[derive(Debug)]
pub struct FrameRing {
    state: Mutex<RingState>,
    available: Condvar,
}

impl FrameRing {
    /// Ring of `slots` frames of up to `frame_capacity` bytes each.
    pub fn new(slots: usize, frame_capacity: usize) -> Self {
        let slots = (0..slots.max(2))
            .map(|_| Slot {
                frame: Some(RawFrame::with_capacity(frame_capacity)),
                state: SlotState::Free,
                fault: None,
            })
            .collect();
        Self {
            state: Mutex::new(RingState {
                slots,
                ready: VecDeque::new(),
                frame_capacity,
                cancelled: false,
                lifetime: 0,
                failure: None,
                pushed: 0,
                dropped: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy one completed transfer into the ring.
    ///
    /// Uses a free slot, or overwrites the oldest ready one when the consumer
    /// is behind. Returns whether the payload had to be truncated to the
    /// slot capacity.
    pub(crate) fn push(
        &self,
        payload: &[u8],
        metadata: FrameMetadata,
        fault: Option<TransferStatus>,
    ) -> bool {
        let (index, mut frame, capacity) = {
            let mut state = self.lock();
            let Some(index) = claim_slot(&mut state) else {
                state.dropped += 1;
                tracing::debug!(sequence = metadata.sequence, "no slot available, frame dropped");
                return false;
            };
            let capacity = state.frame_capacity;
            let Some(slot) = state.slots.get_mut(index) else {
                return false;
            };
            slot.state = SlotState::Filling;
            let frame = slot.frame.take().unwrap_or_default();
            (index, frame, capacity)
        };

        let truncated = frame.refill(payload, capacity, metadata);

        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.frame = Some(frame);
            slot.state = SlotState::Ready;
            slot.fault = fault;
        }
        state.ready.push_back(index);
        state.pushed += 1;
        drop(state);
        self.available.notify_one();
        truncated
    }

    /// Take the oldest ready slot, waiting until `deadline` (forever if `None`).
    ///
    /// Ready frames are delivered before a producer failure is reported.
    /// Cancellation wins over everything.
    pub(crate) fn pop(&self, deadline: Option<Instant>) -> Popped {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return Popped::Cancelled;
            }
            if let Some(index) = state.ready.pop_front() {
                if let Some(slot) = state.slots.get_mut(index) {
                    if let Some(frame) = slot.frame.take() {
                        slot.state = SlotState::InUse;
                        return Popped::Frame(ReadyFrame {
                            index,
                            frame,
                            fault: slot.fault.take(),
                        });
                    }
                }
                continue;
            }
            if let Some(reason) = &state.failure {
                return Popped::Failed(reason.clone());
            }
            state = match deadline {
                None => self
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline <= now {
                        return Popped::TimedOut;
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Give a consumed frame back to its slot.
    pub(crate) fn release(&self, index: usize, frame: RawFrame) {
        let mut state = self.lock();
        if let Some(slot) = state.slots.get_mut(index) {
            slot.frame = Some(frame);
            slot.state = SlotState::Free;
            slot.fault = None;
        }
    }

    /// Wake every waiter and make all further pops fail with `Cancelled`.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.available.notify_all();
    }

    /// Cancel only if the ring is still in `lifetime`. Returns whether it did.
    pub(crate) fn cancel_lifetime(&self, lifetime: u64) -> bool {
        let mut state = self.lock();
        if state.lifetime != lifetime {
            return false;
        }
        state.cancelled = true;
        drop(state);
        self.available.notify_all();
        true
    }

    /// Current lifetime, advanced by `retire`.
    pub(crate) fn lifetime(&self) -> u64 {
        self.lock().lifetime
    }

    /// End the current lifetime: cancellations aimed at it no longer apply.
    pub(crate) fn retire(&self) {
        self.lock().lifetime += 1;
    }

    /// Whether `cancel` was called since the last `reopen`.
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Record a producer failure. Waiters see it once the ready frames are drained.
    pub(crate) fn fail(&self, reason: String) {
        let mut state = self.lock();
        if state.failure.is_none() {
            state.failure = Some(reason);
        }
        drop(state);
        self.available.notify_all();
    }

    /// Discard ready frames and any failure, resizing slot buffers for a new
    /// stream. Only valid while no producer is running and the consumer holds
    /// no frame.
    pub(crate) fn reset(&self, frame_capacity: usize) {
        let mut state = self.lock();
        let discarded = state.ready.len();
        state.ready.clear();
        state.failure = None;
        state.frame_capacity = frame_capacity;
        for slot in &mut state.slots {
            slot.state = SlotState::Free;
            slot.fault = None;
            if slot.frame.is_none() {
                slot.frame = Some(RawFrame::with_capacity(frame_capacity));
            }
        }
        if discarded > 0 {
            tracing::debug!(discarded, "ring drained");
        }
    }

    /// Clear a previous cancellation.
    pub(crate) fn reopen(&self) {
        self.lock().cancelled = false;
    }

    /// Current counters.
    pub fn stats(&self) -> RingStats {
        let state = self.lock();
        RingStats {
            capacity: state.slots.len(),
            ready: state.ready.len(),
            pushed: state.pushed,
            dropped: state.dropped,
        }
    }
}

fn claim_slot(state: &mut RingState) -> Option<usize> {
    if let Some(index) = state
        .slots
        .iter()
        .position(|slot| slot.state == SlotState::Free && slot.frame.is_some())
    {
        return Some(index);
    }
    let oldest = state.ready.pop_front()?;
    state.dropped += 1;
    tracing::debug!(slot = oldest, "ring full, overwriting oldest ready frame");
    Some(oldest)
}
