//! Incoming instruction queue: many producers (receivers), one consumer at a time.
//!
//! Producers append to an inbox under a short mutex. The consumer lock guards a
//! separate staging buffer; `pop` refills staging from the inbox with one swap,
//! so a consumer holding the lock never stalls producers for longer than that swap.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::wire::Frame;

/// Push rejected because the configured bound is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("incoming queue full ({limit} frames)")]
pub struct QueueFull {
    pub limit: usize,
}

/// FIFO of received frames, shared by all receivers of one server.
#[derive(Debug, Default)]
pub struct IncomingQueue {
    inbox: Mutex<VecDeque<Frame>>,
    staging: Mutex<VecDeque<Frame>>,
    arrived: Condvar,
    queued: AtomicUsize,
    max_len: Option<usize>,
}

impl IncomingQueue {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that refuses pushes once `max_len` frames are waiting. `None` is unbounded.
    pub fn with_limit(max_len: Option<usize>) -> Self {
        Self {
            max_len,
            ..Self::default()
        }
    }

    /// Append a frame. Never waits on the consumer lock.
    pub fn push(&self, frame: Frame) -> Result<(), QueueFull> {
        let mut inbox = self.inbox.lock();
        if let Some(limit) = self.max_len {
            if self.queued.load(Ordering::Acquire) >= limit {
                return Err(QueueFull { limit });
            }
        }
        inbox.push_back(frame);
        self.queued.fetch_add(1, Ordering::AcqRel);
        drop(inbox);
        self.arrived.notify_all();
        Ok(())
    }

    /// Enter the consumer critical section. Dropping the guard unlocks.
    pub fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            queue: self,
            staging: self.staging.lock(),
        }
    }

    /// Frames waiting (inbox + staging).
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocking pop: wait up to `timeout` for a frame. Takes the consumer lock for the wait.
    pub fn wait_pop(&self, timeout: Duration) -> Option<Frame> {
        let mut guard = self.lock();
        if let Some(frame) = guard.pop() {
            return Some(frame);
        }
        let deadline = Instant::now() + timeout;
        if !self.wait_arrival(deadline) {
            return None;
        }
        guard.pop()
    }

    /// Blocking [`QueueGuard::take_opcode`]: wait up to `timeout` for a frame with `opcode`.
    /// Frames with other opcodes stay queued in arrival order.
    pub fn wait_take_opcode(&self, opcode: u64, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock();
        loop {
            if let Some(frame) = guard.take_opcode(opcode) {
                return Some(frame);
            }
            if !self.wait_arrival(deadline) {
                return None;
            }
        }
    }

    /// Sleep until the inbox is non-empty or `deadline` passes. False on timeout.
    /// Callers hold the consumer lock, so nothing drains the inbox meanwhile.
    fn wait_arrival(&self, deadline: Instant) -> bool {
        let mut inbox = self.inbox.lock();
        while inbox.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.arrived.wait_for(&mut inbox, deadline - now);
        }
        true
    }

    /// Drop every waiting frame. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut staging = self.staging.lock();
        let mut inbox = self.inbox.lock();
        let n = staging.len() + inbox.len();
        staging.clear();
        inbox.clear();
        self.queued.fetch_sub(n, Ordering::AcqRel);
        n
    }
}

/// Consumer critical section over an [`IncomingQueue`].
pub struct QueueGuard<'a> {
    queue: &'a IncomingQueue,
    staging: MutexGuard<'a, VecDeque<Frame>>,
}

impl QueueGuard<'_> {
    /// Move everything currently in the inbox behind the staged frames.
    fn refill(&mut self) {
        let mut inbox = self.queue.inbox.lock();
        if self.staging.is_empty() {
            std::mem::swap(&mut *self.staging, &mut *inbox);
        } else {
            self.staging.extend(inbox.drain(..));
        }
    }

    /// Next frame in arrival order, or None when nothing is waiting. Never blocks on producers.
    pub fn pop(&mut self) -> Option<Frame> {
        if self.staging.is_empty() {
            self.refill();
        }
        let frame = self.staging.pop_front()?;
        self.queue.queued.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    /// Pop everything available right now.
    pub fn drain_all(&mut self) -> Vec<Frame> {
        self.refill();
        let frames: Vec<Frame> = self.staging.drain(..).collect();
        self.queue.queued.fetch_sub(frames.len(), Ordering::AcqRel);
        frames
    }

    /// Remove the oldest frame with `opcode`, leaving the rest in order.
    pub fn take_opcode(&mut self, opcode: u64) -> Option<Frame> {
        self.refill();
        let idx = self.staging.iter().position(|f| f.opcode() == opcode)?;
        let frame = self.staging.remove(idx)?;
        self.queue.queued.fetch_sub(1, Ordering::AcqRel);
        Some(frame)
    }

    /// Count waiting frames with `opcode`.
    pub fn count_opcode(&mut self, opcode: u64) -> usize {
        self.refill();
        self.staging.iter().filter(|f| f.opcode() == opcode).count()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Explicit unlock; same as dropping the guard.
    pub fn unlock(self) {}
}

impl Iterator for QueueGuard<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.pop()
    }
}
