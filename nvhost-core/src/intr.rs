// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Syncpoint threshold interrupts.
//!
//! Each syncpoint keeps a wait list of armed fences ordered by threshold in
//! wrapping order, and the hardware threshold is programmed to the list head.
//! The interrupt path only refreshes `min`, detaches expired fences and
//! signals them; fence callbacks are expected to defer real work.

use std::sync::{Arc, Weak};

use nvhost_common::{HostError, Result, SyncpointId, SYNCPOINTS_PER_LINE};
use parking_lot::Mutex;

use crate::fence::Fence;
use crate::hw::HostHardware;
use crate::syncpoint::{syncpoint_reached, Syncpoint};

pub struct Interrupts {
    hw: Arc<dyn HostHardware>,
    syncpoints: Arc<[Arc<Syncpoint>]>,
    wait_lists: Box<[Mutex<Vec<Fence>>]>,
    this: Weak<Interrupts>,
}

impl Interrupts {
    /// Create the wait lists and install the interrupt handler.
    pub fn new(hw: Arc<dyn HostHardware>, syncpoints: Arc<[Arc<Syncpoint>]>) -> Arc<Self> {
        let intr = Arc::new_cyclic(|this| Self {
            hw: hw.clone(),
            wait_lists: (0..syncpoints.len()).map(|_| Mutex::new(Vec::new())).collect(),
            syncpoints,
            this: this.clone(),
        });
        let weak = Arc::downgrade(&intr);
        hw.set_interrupt_handler(Some(Arc::new(move |line| {
            if let Some(intr) = weak.upgrade() {
                intr.handle_interrupt(line);
            }
        })));
        intr
    }

    pub fn num_lines(&self) -> u32 {
        (self.syncpoints.len() as u32).div_ceil(SYNCPOINTS_PER_LINE)
    }

    /// Number of fences armed on `id`.
    pub fn pending(&self, id: SyncpointId) -> usize {
        self.wait_lists
            .get(id as usize)
            .map_or(0, |list| list.lock().len())
    }

    /// Create a fence for `id >= threshold`, armed unless already reached.
    pub fn create_fence(&self, id: SyncpointId, threshold: u32) -> Result<Fence> {
        let sp = self
            .syncpoints
            .get(id as usize)
            .ok_or_else(|| HostError::InvalidParameter(format!("syncpoint {} out of range", id)))?;
        let fence = Fence::new(id, threshold, self.this.clone());

        if syncpoint_reached(sp.load(self.hw.as_ref()), threshold) {
            fence.signal();
            return Ok(fence);
        }

        fence.arm();
        let is_head = {
            let mut list = self.wait_lists[id as usize].lock();
            let pos = list
                .iter()
                .position(|f| (f.threshold().wrapping_sub(threshold) as i32) > 0)
                .unwrap_or(list.len());
            list.insert(pos, fence.clone());
            if pos == 0 {
                self.hw.set_threshold(id, threshold);
                self.hw.enable_threshold_interrupt(id);
            }
            pos == 0
        };
        log::trace!("intr: syncpoint[{}] armed for {} head={}", id, threshold, is_head);

        // Catch an increment that landed while the threshold was programmed.
        self.handle_syncpoint(id);
        Ok(fence)
    }

    /// Detach `fence` from its wait list. Returns `false` if it was no longer
    /// there (already signaled or being signaled).
    pub fn remove_fence(&self, fence: &Fence) -> bool {
        let id = fence.syncpoint();
        let Some(lock) = self.wait_lists.get(id as usize) else {
            return false;
        };
        let reprogram = {
            let mut list = lock.lock();
            let Some(pos) = list.iter().position(|f| f.ptr_eq(fence)) else {
                return false;
            };
            list.remove(pos);
            match list.first() {
                None => {
                    self.hw.disable_threshold_interrupt(id);
                    false
                }
                Some(head) if pos == 0 => {
                    self.hw.set_threshold(id, head.threshold());
                    self.hw.enable_threshold_interrupt(id);
                    true
                }
                Some(_) => false,
            }
        };
        if reprogram {
            self.handle_syncpoint(id);
        }
        true
    }

    /// Service one interrupt line: ack the status bits and process every
    /// syncpoint that asserted.
    pub fn handle_interrupt(&self, line: u32) {
        let status = self.hw.interrupt_status(line);
        if status == 0 {
            return;
        }
        self.hw.ack_interrupt(line, status);

        let mut bits = status;
        while bits != 0 {
            let bit = bits.trailing_zeros();
            bits &= bits - 1;
            let id = line * SYNCPOINTS_PER_LINE + bit;
            if (id as usize) >= self.syncpoints.len() {
                log::warn!("intr: spurious interrupt for syncpoint {}", id);
                continue;
            }
            self.hw.disable_threshold_interrupt(id);
            self.handle_syncpoint(id);
        }
    }

    /// Signal every fence on `id` whose threshold has been reached and
    /// reprogram the threshold for the rest.
    pub fn handle_syncpoint(&self, id: SyncpointId) {
        let Some(sp) = self.syncpoints.get(id as usize) else {
            return;
        };
        let mut expired = Vec::new();
        {
            let mut list = self.wait_lists[id as usize].lock();
            loop {
                let value = sp.load(self.hw.as_ref());
                let count = list
                    .iter()
                    .take_while(|f| syncpoint_reached(value, f.threshold()))
                    .count();
                expired.extend(list.drain(..count));

                let Some(head) = list.first() else {
                    self.hw.disable_threshold_interrupt(id);
                    break;
                };
                let threshold = head.threshold();
                self.hw.set_threshold(id, threshold);
                self.hw.enable_threshold_interrupt(id);
                if !syncpoint_reached(self.hw.syncpoint_read(id), threshold) {
                    break;
                }
                // Already met: drop the latched status and go again.
                let line = id / SYNCPOINTS_PER_LINE;
                self.hw.ack_interrupt(line, 1 << (id % SYNCPOINTS_PER_LINE));
                if !syncpoint_reached(sp.load(self.hw.as_ref()), threshold) {
                    // The shadow is clamped below the hardware; wait for max to move.
                    break;
                }
            }
        }

        if !expired.is_empty() {
            log::trace!("intr: syncpoint[{}] signaling {} fences", id, expired.len());
        }
        for fence in expired {
            fence.signal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::SimHardware;
    use crate::syncpoint::{SyncpointFlags, SyncpointManager};
    use nvhost_common::settings::Settings;
    use std::time::Duration;

    fn setup(num_syncpoints: u32) -> (Arc<SimHardware>, SyncpointManager) {
        let hw = Arc::new(SimHardware::new(num_syncpoints, 0, 1));
        let settings = Settings {
            num_syncpoints,
            num_syncpoint_bases: 0,
            syncpoint_pools: Vec::new(),
            ..Settings::default()
        };
        let mgr = SyncpointManager::new(hw.clone(), &settings).unwrap();
        (hw, mgr)
    }

    #[test]
    fn test_reached_fence_signals_immediately() {
        let (_hw, mgr) = setup(4);
        let sp = mgr.allocate("t", SyncpointFlags::empty(), "sp").unwrap();
        let fence = mgr.interrupts().create_fence(sp.id(), 0).unwrap();
        assert!(fence.is_signaled());
        assert_eq!(mgr.interrupts().pending(sp.id()), 0);
    }

    #[test]
    fn test_fences_signal_in_threshold_order() {
        let (hw, mgr) = setup(4);
        let intr = mgr.interrupts();
        let sp = mgr.allocate("t", SyncpointFlags::empty(), "sp").unwrap();
        sp.increment_max(3);
        let f3 = intr.create_fence(sp.id(), 3).unwrap();
        let f1 = intr.create_fence(sp.id(), 1).unwrap();
        let f2 = intr.create_fence(sp.id(), 2).unwrap();
        assert_eq!(intr.pending(sp.id()), 3);
        assert!(hw.threshold_interrupt_enabled(sp.id()));

        hw.syncpoint_increment(sp.id());
        assert!(f1.is_signaled());
        assert!(!f2.is_signaled() && !f3.is_signaled());

        hw.syncpoint_increment(sp.id());
        hw.syncpoint_increment(sp.id());
        assert!(f2.is_signaled() && f3.is_signaled());
        assert_eq!(intr.pending(sp.id()), 0);
        assert!(!hw.threshold_interrupt_enabled(sp.id()));
    }

    #[test]
    fn test_interrupt_on_second_line() {
        let (hw, mgr) = setup(64);
        let intr = mgr.interrupts();
        assert_eq!(intr.num_lines(), 2);
        let sp = (0..41)
            .map(|_| mgr.allocate("t", SyncpointFlags::empty(), "sp").unwrap())
            .last()
            .unwrap();
        assert_eq!(sp.id(), 40);
        let fence = intr.create_fence(sp.id(), 1).unwrap();
        sp.increment_max(1);
        hw.syncpoint_increment(sp.id());
        assert!(fence.is_signaled());
        assert_eq!(hw.interrupt_status(1), 0);
    }

    #[test]
    fn test_remove_reprograms_head() {
        let (hw, mgr) = setup(4);
        let intr = mgr.interrupts();
        let sp = mgr.allocate("t", SyncpointFlags::empty(), "sp").unwrap();
        sp.increment_max(5);
        let f2 = intr.create_fence(sp.id(), 2).unwrap();
        let f5 = intr.create_fence(sp.id(), 5).unwrap();
        assert!(intr.remove_fence(&f2));
        assert!(!intr.remove_fence(&f2));
        assert_eq!(intr.pending(sp.id()), 1);
        assert!(hw.threshold_interrupt_enabled(sp.id()));
        assert!(intr.remove_fence(&f5));
        assert!(!hw.threshold_interrupt_enabled(sp.id()));
    }

    #[test]
    fn test_cancel_unblocks_waiter() {
        let (_hw, mgr) = setup(4);
        let sp = mgr.allocate("t", SyncpointFlags::empty(), "sp").unwrap();
        sp.increment_max(1);
        let fence = mgr.interrupts().create_fence(sp.id(), 1).unwrap();
        let waiter = fence.clone();
        let handle = std::thread::spawn(move || waiter.wait(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(fence.cancel(HostError::TimedOut));
        assert_eq!(handle.join().unwrap(), Err(HostError::TimedOut));
        assert_eq!(mgr.interrupts().pending(sp.id()), 0);
    }

    #[test]
    fn test_wrapping_order() {
        let (hw, mgr) = setup(4);
        let intr = mgr.interrupts();
        let sp = mgr
            .allocate("t", SyncpointFlags::CLIENT_MANAGED, "sp")
            .unwrap();
        for value in [0x6000_0000, 0xC000_0000, 0xFFFF_FFFE] {
            hw.syncpoint_write(sp.id(), value);
            assert_eq!(mgr.read(&sp), value);
        }
        let after_wrap = intr.create_fence(sp.id(), 1).unwrap();
        let before_wrap = intr.create_fence(sp.id(), 0xFFFF_FFFF).unwrap();
        hw.syncpoint_increment(sp.id());
        assert!(before_wrap.is_signaled());
        assert!(!after_wrap.is_signaled());
        hw.syncpoint_increment(sp.id());
        hw.syncpoint_increment(sp.id());
        assert!(after_wrap.is_signaled());
    }
}
