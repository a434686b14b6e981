// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Syncpoint fences.
//!
//! A fence is bound to `(syncpoint, threshold)` and resolves once, either when
//! the counter reaches the threshold or when it is cancelled with an error.
//! Callbacks run on whichever context resolves the fence, which may be the
//! interrupt handler, so they must not block.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nvhost_common::{HostError, Result, SyncpointId};
use parking_lot::{Condvar, Mutex};

use crate::intr::Interrupts;

pub type FenceResult = std::result::Result<(), HostError>;
type FenceCallback = Box<dyn FnOnce(&FenceResult) + Send + 'static>;

/// Lifecycle of a wait registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// Created, not on a wait list.
    Idle,
    /// On the syncpoint's wait list with the threshold programmed.
    Armed,
    /// Resolved, successfully or with an error.
    Signaled,
    /// The waiter gave up and removed the registration.
    TimedOut,
}

struct FenceState {
    wait: WaitState,
    result: Option<FenceResult>,
    timestamp: Option<Instant>,
    callbacks: Vec<FenceCallback>,
}

struct FenceInner {
    syncpoint: SyncpointId,
    threshold: u32,
    state: Mutex<FenceState>,
    cond: Condvar,
    intr: Weak<Interrupts>,
}

#[derive(Clone)]
pub struct Fence(Arc<FenceInner>);

impl Fence {
    pub(crate) fn new(syncpoint: SyncpointId, threshold: u32, intr: Weak<Interrupts>) -> Self {
        Self(Arc::new(FenceInner {
            syncpoint,
            threshold,
            state: Mutex::new(FenceState {
                wait: WaitState::Idle,
                result: None,
                timestamp: None,
                callbacks: Vec::new(),
            }),
            cond: Condvar::new(),
            intr,
        }))
    }

    pub fn syncpoint(&self) -> SyncpointId {
        self.0.syncpoint
    }

    pub fn threshold(&self) -> u32 {
        self.0.threshold
    }

    pub fn state(&self) -> WaitState {
        self.0.state.lock().wait
    }

    /// Resolved successfully.
    pub fn is_signaled(&self) -> bool {
        matches!(self.0.state.lock().result, Some(Ok(())))
    }

    /// Outcome, once resolved.
    pub fn result(&self) -> Option<FenceResult> {
        self.0.state.lock().result.clone()
    }

    pub fn error(&self) -> Option<HostError> {
        match &self.0.state.lock().result {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// When the fence resolved.
    pub fn timestamp(&self) -> Option<Instant> {
        self.0.state.lock().timestamp
    }

    /// Run `callback` when the fence resolves, or now if it already has.
    pub fn add_callback(&self, callback: impl FnOnce(&FenceResult) + Send + 'static) {
        let mut state = self.0.state.lock();
        match state.result.clone() {
            Some(result) => {
                drop(state);
                callback(&result);
            }
            None => state.callbacks.push(Box::new(callback)),
        }
    }

    /// Block until the fence resolves or `timeout` elapses. Returns the
    /// resolution timestamp.
    pub fn wait(&self, timeout: Duration) -> Result<Instant> {
        let deadline = Instant::now() + timeout;
        let mut state = self.0.state.lock();
        loop {
            match (&state.result, state.wait) {
                (Some(Ok(())), _) => return Ok(state.timestamp.unwrap_or_else(Instant::now)),
                (Some(Err(e)), _) => return Err(e.clone()),
                (None, WaitState::TimedOut) => return Err(HostError::TimedOut),
                (None, _) => {}
            }
            if self.0.cond.wait_until(&mut state, deadline).timed_out() && state.result.is_none()
            {
                return Err(HostError::TimedOut);
            }
        }
    }

    /// Remove the fence from its wait list and resolve it with `error`.
    /// Returns `false` if it had already resolved.
    pub fn cancel(&self, error: HostError) -> bool {
        if let Some(intr) = self.0.intr.upgrade() {
            intr.remove_fence(self);
        }
        let cancelled = self.resolve(Err(error));
        if cancelled {
            log::debug!(
                "fence: syncpoint[{}] >= {} cancelled",
                self.0.syncpoint,
                self.0.threshold
            );
        }
        cancelled
    }

    pub(crate) fn arm(&self) {
        let mut state = self.0.state.lock();
        if state.wait == WaitState::Idle {
            state.wait = WaitState::Armed;
        }
    }

    pub(crate) fn signal(&self) -> bool {
        self.resolve(Ok(()))
    }

    pub(crate) fn mark_timed_out(&self) {
        let mut state = self.0.state.lock();
        if state.result.is_none() {
            state.wait = WaitState::TimedOut;
            self.0.cond.notify_all();
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn resolve(&self, result: FenceResult) -> bool {
        let callbacks = {
            let mut state = self.0.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.wait = WaitState::Signaled;
            state.result = Some(result.clone());
            state.timestamp = Some(Instant::now());
            self.0.cond.notify_all();
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(&result);
        }
        true
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("syncpoint", &self.0.syncpoint)
            .field("threshold", &self.0.threshold)
            .field("state", &self.state())
            .finish()
    }
}
