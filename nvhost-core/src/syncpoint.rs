// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Syncpoint allocation and shadow state.
//!
//! Every hardware counter has a driver shadow: `min` is the last value read
//! back from hardware and `max` is the value the counter will reach once all
//! accepted work has run. Readers use the shadow; only `read`/`load` touch the
//! register.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use nvhost_common::settings::{Settings, SyncpointPool};
use nvhost_common::{HostError, Result, SyncpointId};
use parking_lot::Mutex;

use crate::hw::HostHardware;
use crate::intr::Interrupts;

/// True when counter `value` has reached `threshold`, treating the 32-bit
/// space as circular: a threshold more than 2^31 behind counts as reached.
#[inline]
pub fn syncpoint_reached(value: u32, threshold: u32) -> bool {
    (value.wrapping_sub(threshold) as i32) >= 0
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SyncpointFlags: u32 {
        /// Incremented by the client outside of driver-tracked jobs; `max`
        /// follows the hardware instead of bounding it.
        const CLIENT_MANAGED = 1 << 0;
        /// Allocate a base register for base-relative waits.
        const HAS_BASE = 1 << 1;
    }
}

#[derive(Debug, Default)]
struct SyncpointInfo {
    name: String,
    client: String,
    base: Option<u32>,
    pool: Option<String>,
}

#[derive(Debug)]
pub struct Syncpoint {
    id: SyncpointId,
    min: AtomicU32,
    max: AtomicU32,
    refs: AtomicU32,
    flags: AtomicU32,
    info: Mutex<SyncpointInfo>,
}

impl Syncpoint {
    fn new(id: SyncpointId) -> Self {
        Self {
            id,
            min: AtomicU32::new(0),
            max: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            info: Mutex::new(SyncpointInfo::default()),
        }
    }

    pub fn id(&self) -> SyncpointId {
        self.id
    }

    /// Last value observed from hardware.
    pub fn min(&self) -> u32 {
        self.min.load(Ordering::Acquire)
    }

    /// Value the counter reaches once all reserved increments land.
    pub fn max(&self) -> u32 {
        self.max.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> SyncpointFlags {
        SyncpointFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_client_managed(&self) -> bool {
        self.flags().contains(SyncpointFlags::CLIENT_MANAGED)
    }

    pub fn name(&self) -> String {
        self.info.lock().name.clone()
    }

    pub fn client(&self) -> String {
        self.info.lock().client.clone()
    }

    pub fn base(&self) -> Option<u32> {
        self.info.lock().base
    }

    pub fn pool(&self) -> Option<String> {
        self.info.lock().pool.clone()
    }

    pub fn is_allocated(&self) -> bool {
        self.refcount() > 0
    }

    /// Reserve `n` future increments. Returns the new maximum.
    pub fn increment_max(&self, n: u32) -> u32 {
        self.max.fetch_add(n, Ordering::AcqRel).wrapping_add(n)
    }

    /// Whether the shadow `min` has reached `threshold`.
    pub fn is_expired(&self, threshold: u32) -> bool {
        syncpoint_reached(self.min(), threshold)
    }

    /// Refresh `min` from the hardware counter and return it.
    ///
    /// `min` never moves backwards. A driver-managed counter that reads past
    /// `max` is clamped to `max`.
    pub(crate) fn load(&self, hw: &dyn HostHardware) -> u32 {
        let live = hw.syncpoint_read(self.id);
        let client_managed = self.is_client_managed();
        loop {
            let min = self.min.load(Ordering::Acquire);
            if live == min || !syncpoint_reached(live, min) {
                return min;
            }
            let max = self.max.load(Ordering::Acquire);
            let new = if client_managed || syncpoint_reached(max, live) {
                live
            } else {
                log::warn!(
                    "syncpoint[{}]: hardware value {} beyond max {}",
                    self.id,
                    live,
                    max
                );
                max
            };
            if new == min {
                return min;
            }
            if self
                .min
                .compare_exchange(min, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if client_managed {
                    self.raise_max(new);
                }
                return new;
            }
        }
    }

    fn raise_max(&self, value: u32) {
        let mut max = self.max.load(Ordering::Acquire);
        while !syncpoint_reached(max, value) {
            match self
                .max
                .compare_exchange(max, value, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }
    }

    /// Take a reference if still allocated.
    fn try_get(&self) -> bool {
        let mut refs = self.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refs.compare_exchange(
                refs,
                refs + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => refs = current,
            }
        }
    }
}

pub struct SyncpointManager {
    hw: Arc<dyn HostHardware>,
    syncpoints: Arc<[Arc<Syncpoint>]>,
    pools: Vec<SyncpointPool>,
    /// Base register bitmap; also the allocation lock.
    bases: Mutex<Vec<bool>>,
    saved_bases: Mutex<Vec<u32>>,
    intr: Arc<Interrupts>,
}

impl SyncpointManager {
    pub fn new(hw: Arc<dyn HostHardware>, settings: &Settings) -> Result<Self> {
        if settings.num_syncpoints > hw.num_syncpoints() {
            return Err(HostError::InvalidParameter(format!(
                "{} syncpoints configured, hardware has {}",
                settings.num_syncpoints,
                hw.num_syncpoints()
            )));
        }
        let num_bases = settings.num_syncpoint_bases.min(hw.num_syncpoint_bases());
        let syncpoints: Arc<[Arc<Syncpoint>]> = (0..settings.num_syncpoints)
            .map(|id| Arc::new(Syncpoint::new(id)))
            .collect();
        for id in 0..settings.num_syncpoints {
            hw.syncpoint_write(id, 0);
            hw.disable_threshold_interrupt(id);
        }
        let intr = Interrupts::new(hw.clone(), syncpoints.clone());
        log::info!(
            "syncpoint: {} syncpoints, {} bases, {} reserved pools",
            syncpoints.len(),
            num_bases,
            settings.syncpoint_pools.len()
        );
        Ok(Self {
            hw,
            syncpoints,
            pools: settings.syncpoint_pools.clone(),
            bases: Mutex::new(vec![false; num_bases as usize]),
            saved_bases: Mutex::new(Vec::new()),
            intr,
        })
    }

    pub fn interrupts(&self) -> &Arc<Interrupts> {
        &self.intr
    }

    pub fn num_syncpoints(&self) -> u32 {
        self.syncpoints.len() as u32
    }

    pub fn num_bases(&self) -> u32 {
        self.bases.lock().len() as u32
    }

    pub fn pools(&self) -> &[SyncpointPool] {
        &self.pools
    }

    /// Allocate from the general pool, skipping ids reserved by named pools.
    pub fn allocate(
        &self,
        client: &str,
        flags: SyncpointFlags,
        name: &str,
    ) -> Result<Arc<Syncpoint>> {
        let candidates = (0..self.num_syncpoints())
            .filter(|&id| !self.pools.iter().any(|p| p.contains(id)))
            .collect::<Vec<_>>();
        self.allocate_from(&candidates, None, client, flags, name)
    }

    /// Allocate from the named reserved pool.
    pub fn allocate_in_pool(
        &self,
        pool: &str,
        client: &str,
        flags: SyncpointFlags,
        name: &str,
    ) -> Result<Arc<Syncpoint>> {
        let range = self
            .pools
            .iter()
            .find(|p| p.name == pool)
            .ok_or_else(|| HostError::InvalidParameter(format!("unknown syncpoint pool {}", pool)))?;
        let candidates = (range.base..range.end()).collect::<Vec<_>>();
        self.allocate_from(&candidates, Some(pool), client, flags, name)
    }

    fn allocate_from(
        &self,
        candidates: &[SyncpointId],
        pool: Option<&str>,
        client: &str,
        flags: SyncpointFlags,
        name: &str,
    ) -> Result<Arc<Syncpoint>> {
        let mut bases = self.bases.lock();
        let Some(sp) = candidates
            .iter()
            .map(|&id| &self.syncpoints[id as usize])
            .find(|sp| !sp.is_allocated())
        else {
            log::warn!(
                "syncpoint: {} pool exhausted for {}",
                pool.unwrap_or("general"),
                client
            );
            return Err(HostError::ResourceExhausted("syncpoint"));
        };

        let base = if flags.contains(SyncpointFlags::HAS_BASE) {
            let Some(index) = bases.iter().position(|used| !used) else {
                log::warn!("syncpoint: no free base for {}", client);
                return Err(HostError::ResourceExhausted("syncpoint base"));
            };
            bases[index] = true;
            self.hw.syncpoint_base_write(index as u32, 0);
            Some(index as u32)
        } else {
            None
        };

        self.hw.syncpoint_write(sp.id, 0);
        sp.min.store(0, Ordering::Release);
        sp.max.store(0, Ordering::Release);
        sp.flags.store(flags.bits(), Ordering::Release);
        *sp.info.lock() = SyncpointInfo {
            name: name.to_string(),
            client: client.to_string(),
            base,
            pool: pool.map(str::to_string),
        };
        sp.refs.store(1, Ordering::Release);

        log::debug!(
            "syncpoint[{}]: allocated to {} as '{}' flags={:?} base={:?}",
            sp.id,
            client,
            name,
            flags,
            base
        );
        Ok(sp.clone())
    }

    /// Take another reference on an allocated syncpoint.
    pub fn get(&self, sp: &Arc<Syncpoint>) -> Result<Arc<Syncpoint>> {
        if sp.try_get() {
            Ok(sp.clone())
        } else {
            Err(HostError::InvalidState("syncpoint not allocated"))
        }
    }

    /// Take a reference on an allocated syncpoint by id.
    pub fn get_by_id(&self, id: SyncpointId) -> Result<Arc<Syncpoint>> {
        let sp = self
            .syncpoints
            .get(id as usize)
            .ok_or_else(|| HostError::InvalidParameter(format!("syncpoint {} out of range", id)))?;
        self.get(sp)
    }

    /// Drop one reference. The last one returns the syncpoint to its pool;
    /// a driver-managed syncpoint must not have increments outstanding then.
    pub fn release(&self, sp: &Arc<Syncpoint>) -> Result<()> {
        sp.load(self.hw.as_ref());
        let mut bases = self.bases.lock();
        let mut refs = sp.refs.load(Ordering::Acquire);
        loop {
            if refs == 0 {
                return Err(HostError::InvalidState("syncpoint already released"));
            }
            if refs == 1 && !sp.is_client_managed() && sp.min() != sp.max() {
                log::warn!(
                    "syncpoint[{}]: release with {} increments outstanding",
                    sp.id,
                    sp.max().wrapping_sub(sp.min())
                );
                return Err(HostError::InvalidState("syncpoint has outstanding increments"));
            }
            match sp
                .refs
                .compare_exchange(refs, refs - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => refs = current,
            }
        }
        if refs > 1 {
            return Ok(());
        }

        let info = std::mem::take(&mut *sp.info.lock());
        if let Some(base) = info.base {
            if let Some(used) = bases.get_mut(base as usize) {
                *used = false;
            }
        }
        sp.flags.store(0, Ordering::Release);
        log::debug!("syncpoint[{}]: released by {}", sp.id, info.client);
        Ok(())
    }

    /// Refresh and return `min`.
    pub fn read(&self, sp: &Syncpoint) -> u32 {
        sp.load(self.hw.as_ref())
    }

    pub fn read_min(&self, sp: &Syncpoint) -> u32 {
        sp.min()
    }

    pub fn read_max(&self, sp: &Syncpoint) -> u32 {
        sp.max()
    }

    pub fn increment_max(&self, sp: &Syncpoint, n: u32) -> u32 {
        sp.increment_max(n)
    }

    /// Increment from the CPU, reserving the increment first.
    pub fn cpu_increment(&self, sp: &Syncpoint) {
        sp.increment_max(1);
        self.hw.syncpoint_increment(sp.id);
    }

    pub fn is_expired(&self, sp: &Syncpoint, threshold: u32) -> bool {
        syncpoint_reached(sp.load(self.hw.as_ref()), threshold)
    }

    /// Block until the counter reaches `threshold`. Returns the observed value
    /// and the time the threshold was seen. A zero timeout polls once.
    pub fn wait(&self, sp: &Syncpoint, threshold: u32, timeout: Duration) -> Result<(u32, Instant)> {
        let value = sp.load(self.hw.as_ref());
        if syncpoint_reached(value, threshold) {
            return Ok((value, Instant::now()));
        }
        if timeout.is_zero() {
            return Err(HostError::TimedOut);
        }

        let fence = self.intr.create_fence(sp.id, threshold)?;
        match fence.wait(timeout) {
            Ok(timestamp) => Ok((sp.min(), timestamp)),
            Err(HostError::TimedOut) => {
                if self.intr.remove_fence(&fence) {
                    fence.mark_timed_out();
                    log::trace!("syncpoint[{}]: wait for {} timed out", sp.id, threshold);
                    return Err(HostError::TimedOut);
                }
                // Drained by the interrupt handler right at the deadline.
                fence
                    .wait(Duration::from_secs(1))
                    .map(|timestamp| (sp.min(), timestamp))
            }
            Err(e) => Err(e),
        }
    }

    /// Syncpoint by id without taking a reference.
    pub fn lookup(&self, id: SyncpointId) -> Option<Arc<Syncpoint>> {
        self.syncpoints.get(id as usize).cloned()
    }

    pub fn allocated(&self) -> Vec<Arc<Syncpoint>> {
        self.syncpoints
            .iter()
            .filter(|sp| sp.is_allocated())
            .cloned()
            .collect()
    }

    /// Snapshot shadow values and base registers before power-down.
    pub fn save(&self) {
        for sp in self.allocated() {
            sp.load(self.hw.as_ref());
        }
        let count = self.num_bases();
        *self.saved_bases.lock() = (0..count)
            .map(|base| self.hw.syncpoint_base_read(base))
            .collect();
        log::debug!("syncpoint: state saved");
    }

    /// Write the shadow state back into hardware after power-up.
    pub fn restore(&self) {
        for sp in self.allocated() {
            self.hw.syncpoint_write(sp.id, sp.min());
        }
        for (base, &value) in self.saved_bases.lock().iter().enumerate() {
            self.hw.syncpoint_base_write(base as u32, value);
        }
        log::debug!("syncpoint: state restored");
    }
}
