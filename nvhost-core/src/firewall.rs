// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command-stream firewall.
//!
//! Walks an untrusted gather word by word and checks every register write
//! against a per-class allow-list before the stream reaches hardware.
//!
//! | Rule                          | Applies to                               |
//! |-------------------------------|------------------------------------------|
//! | Register in allow-list        | every write outside the host class       |
//! | Relocation present            | registers marked `Address`               |
//! | Own syncpoint, within budget  | `INCR_SYNCPT` (register 0 of any class)  |
//! | Own base register             | `WAIT_SYNCPT_BASE`, `INCR_SYNCPT_BASE`   |
//! | Host class or job class only  | `SETCLASS`                               |
//! | Rejected                      | `GATHER`, `RESTART`, `EXTEND`, unknown   |

use std::collections::{HashMap, HashSet};

use nvhost_common::{class, ClassId, HostError, Result, SyncpointId};

use crate::opcode::{self, host_reg, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// Plain data.
    Data,
    /// Holds a device address and must be written through a relocation.
    Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRange {
    pub offset: u32,
    pub count: u32,
    pub kind: RegisterKind,
}

impl RegisterRange {
    pub const fn data(offset: u32, count: u32) -> Self {
        Self {
            offset,
            count,
            kind: RegisterKind::Data,
        }
    }

    pub const fn address(offset: u32) -> Self {
        Self {
            offset,
            count: 1,
            kind: RegisterKind::Address,
        }
    }

    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.offset && offset - self.offset < self.count
    }
}

/// 2D engine address registers: destination, source and pattern surfaces.
const GR2D_ADDRESS_REGS: &[u32] = &[
    0x1a, 0x1b, 0x26, 0x2b, 0x2c, 0x2d, 0x31, 0x32, 0x48, 0x49, 0x4a, 0x4b, 0x4c,
];

/// VIC falcon method interface.
const VIC_METHOD0: u32 = 0x10;
const VIC_METHOD1: u32 = 0x11;

/// Registers a job may write, keyed by class.
#[derive(Debug, Clone, Default)]
pub struct RegisterAllowList {
    classes: HashMap<ClassId, Vec<RegisterRange>>,
}

impl RegisterAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables for the 2D engine and VIC.
    pub fn with_defaults() -> Self {
        let mut list = Self::new();
        for gr2d in [class::GR2D, class::GR2D_SB] {
            // Address ranges take precedence over the data range they sit in.
            for &reg in GR2D_ADDRESS_REGS {
                list.allow(gr2d, RegisterRange::address(reg));
            }
            list.allow(gr2d, RegisterRange::data(0x00, 0x4e));
        }
        list.allow(class::VIC, RegisterRange::data(0x00, VIC_METHOD0));
        list.allow(class::VIC, RegisterRange::data(VIC_METHOD0, 1));
        list.allow(class::VIC, RegisterRange::data(VIC_METHOD1, 1));
        list
    }

    pub fn allow(&mut self, class: ClassId, range: RegisterRange) {
        self.classes.entry(class).or_default().push(range);
    }

    /// Kind of `offset` in `class`, or `None` if the write is not allowed.
    pub fn check(&self, class: ClassId, offset: u32) -> Option<RegisterKind> {
        self.classes
            .get(&class)?
            .iter()
            .find(|range| range.contains(offset))
            .map(|range| range.kind)
    }

    pub fn has_class(&self, class: ClassId) -> bool {
        self.classes.contains_key(&class)
    }
}

/// Validation state for one job.
pub struct Firewall<'a> {
    allow: &'a RegisterAllowList,
    job_class: ClassId,
    class: ClassId,
    syncpoint: SyncpointId,
    base: Option<u32>,
    incrs_allowed: u32,
    incrs_seen: u32,
}

impl<'a> Firewall<'a> {
    pub fn new(
        allow: &'a RegisterAllowList,
        job_class: ClassId,
        syncpoint: SyncpointId,
        incrs_allowed: u32,
    ) -> Self {
        Self {
            allow,
            job_class,
            class: job_class,
            syncpoint,
            base: None,
            incrs_allowed,
            incrs_seen: 0,
        }
    }

    /// Base register the job may use. Without one, base-relative host
    /// writes are rejected.
    pub fn with_base(mut self, base: Option<u32>) -> Self {
        self.base = base;
        self
    }

    /// Increments counted so far.
    pub fn increments(&self) -> u32 {
        self.incrs_seen
    }

    /// Current class, carried from one gather to the next.
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Validate a gather. `base` is the stream offset (in words) of
    /// `words[0]`, used for error reporting; `relocs` holds the indices into
    /// `words` that carry a relocation.
    pub fn validate_gather(
        &mut self,
        words: &[u32],
        base: usize,
        relocs: &HashSet<usize>,
    ) -> Result<()> {
        let mut index = 0;
        while index < words.len() {
            let pos = base + index;
            let op = Opcode::decode(words[index]);
            index += 1;

            let data = match op {
                Opcode::SetClass { class, .. } => {
                    self.set_class(class, pos)?;
                    op.data_words()
                }
                Opcode::Incr { .. } | Opcode::NonIncr { .. } | Opcode::Mask { .. } => {
                    op.data_words()
                }
                Opcode::Imm { offset, value } => {
                    self.check_write(offset, value, false, pos)?;
                    0
                }
                Opcode::Gather { .. } => {
                    return Err(HostError::invalid_command(pos, "nested GATHER"));
                }
                Opcode::Restart { .. } => {
                    return Err(HostError::invalid_command(pos, "RESTART"));
                }
                Opcode::Extend { .. } => {
                    return Err(HostError::invalid_command(pos, "EXTEND"));
                }
                Opcode::Unknown(word) => {
                    return Err(HostError::invalid_command(
                        pos,
                        format!("unknown opcode 0x{:08X}", word),
                    ));
                }
            };

            let end = index + data as usize;
            if end > words.len() {
                return Err(HostError::invalid_command(pos, "truncated opcode"));
            }
            for n in 0..data {
                let Some(reg) = op.register_for(n) else {
                    return Err(HostError::invalid_command(pos, "bad register index"));
                };
                let at = index + n as usize;
                self.check_write(reg, words[at], relocs.contains(&at), base + at)?;
            }
            index = end;
        }
        Ok(())
    }

    /// Validate a single driver-built register write.
    pub fn validate_write(&mut self, class: ClassId, offset: u32, value: u32, pos: usize) -> Result<()> {
        self.set_class(class, pos)?;
        self.check_write(offset, value, false, pos)
    }

    pub(crate) fn set_class(&mut self, class: ClassId, pos: usize) -> Result<()> {
        if class != class::HOST1X && class != self.job_class {
            return Err(HostError::invalid_command(
                pos,
                format!("SETCLASS to foreign class 0x{:X}", class),
            ));
        }
        self.class = class;
        Ok(())
    }

    fn check_base(&self, base: u32, pos: usize) -> Result<()> {
        if self.base == Some(base) {
            Ok(())
        } else {
            Err(HostError::invalid_command(
                pos,
                format!("use of foreign syncpoint base {}", base),
            ))
        }
    }

    fn check_write(&mut self, offset: u32, value: u32, relocated: bool, pos: usize) -> Result<()> {
        if offset == host_reg::INCR_SYNCPT {
            let id = opcode::incr_syncpt_id(value);
            if id != self.syncpoint {
                return Err(HostError::invalid_command(
                    pos,
                    format!("increment of foreign syncpoint {}", id),
                ));
            }
            self.incrs_seen += 1;
            if self.incrs_seen > self.incrs_allowed {
                return Err(HostError::invalid_command(
                    pos,
                    format!("more than {} syncpoint increments", self.incrs_allowed),
                ));
            }
            return Ok(());
        }

        if self.class == class::HOST1X {
            return match offset {
                host_reg::LOAD_SYNCPT_PAYLOAD_32 | host_reg::WAIT_SYNCPT_32 => Ok(()),
                host_reg::WAIT_SYNCPT_BASE => {
                    let (_, base, _) = opcode::decode_wait_syncpt_base(value);
                    self.check_base(base, pos)
                }
                host_reg::INCR_SYNCPT_BASE => {
                    let (base, _) = opcode::decode_syncpt_base(value);
                    self.check_base(base, pos)
                }
                _ => Err(HostError::invalid_command(
                    pos,
                    format!("host register 0x{:X} not allowed", offset),
                )),
            };
        }

        match self.allow.check(self.class, offset) {
            Some(RegisterKind::Data) => Ok(()),
            Some(RegisterKind::Address) if relocated => Ok(()),
            Some(RegisterKind::Address) => Err(HostError::invalid_command(
                pos,
                format!("address register 0x{:X} without relocation", offset),
            )),
            None => Err(HostError::invalid_command(
                pos,
                format!("register 0x{:X} of class 0x{:X} not allowed", offset, self.class),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{
        gather, imm, incr, incr_syncpt, incr_syncpt_base, setclass, wait_syncpt_base, SyncptCond,
        NOP,
    };

    fn run(words: &[u32], relocs: &[usize]) -> Result<u32> {
        let allow = RegisterAllowList::with_defaults();
        let mut fw = Firewall::new(&allow, class::GR2D, 7, 2);
        let relocs = relocs.iter().copied().collect();
        fw.validate_gather(words, 0, &relocs)?;
        Ok(fw.increments())
    }

    #[test]
    fn test_allow_list_lookup() {
        let allow = RegisterAllowList::with_defaults();
        assert_eq!(allow.check(class::GR2D, 0x10), Some(RegisterKind::Data));
        assert_eq!(allow.check(class::GR2D, 0x2b), Some(RegisterKind::Address));
        assert_eq!(allow.check(class::GR2D, 0x4e), None);
        assert_eq!(allow.check(class::VIC, VIC_METHOD1), Some(RegisterKind::Data));
        assert_eq!(allow.check(class::NVDEC, 0), None);
    }

    #[test]
    fn test_accepts_valid_stream() {
        let words = [
            setclass(class::GR2D, 0x10, 0b11),
            1,
            2,
            incr(0x2b, 1),
            0x1000,
            NOP,
            setclass(class::HOST1X, host_reg::INCR_SYNCPT, 1),
            incr_syncpt(SyncptCond::OpDone, 7),
        ];
        assert_eq!(run(&words, &[4]), Ok(1));
    }

    #[test]
    fn test_rejects_disallowed_register() {
        let words = [setclass(class::GR2D, 0x60, 1), 0];
        assert!(matches!(
            run(&words, &[]),
            Err(HostError::InvalidCommand { offset: 1, .. })
        ));
    }

    #[test]
    fn test_address_register_needs_relocation() {
        let words = [incr(0x2b, 1), 0x1000];
        assert!(matches!(
            run(&words, &[]),
            Err(HostError::InvalidCommand { offset: 1, .. })
        ));
        assert!(run(&words, &[1]).is_ok());
    }

    #[test]
    fn test_syncpoint_increment_rules() {
        let foreign = [imm(host_reg::INCR_SYNCPT, incr_syncpt(SyncptCond::Immediate, 3))];
        assert!(run(&foreign, &[]).is_err());

        let own = imm(host_reg::INCR_SYNCPT, incr_syncpt(SyncptCond::Immediate, 7));
        assert_eq!(run(&[own, own], &[]), Ok(2));
        assert!(run(&[own, own, own], &[]).is_err());
    }

    #[test]
    fn test_rejects_control_flow_and_foreign_class() {
        assert!(run(&[gather(4), 0x1000], &[]).is_err());
        assert!(run(&[0x5000_0000], &[]).is_err());
        assert!(run(&[0xE000_0000], &[]).is_err());
        assert!(run(&[0xF000_0000], &[]).is_err());
        assert!(run(&[setclass(class::VIC, 0, 0)], &[]).is_err());
        // Truncated data words.
        assert!(run(&[incr(0x10, 3), 1], &[]).is_err());
    }

    #[test]
    fn test_host_class_registers() {
        let words = [
            setclass(class::HOST1X, host_reg::LOAD_SYNCPT_PAYLOAD_32, 1),
            5,
            setclass(class::HOST1X, host_reg::WAIT_SYNCPT_32, 1),
            3,
        ];
        assert!(run(&words, &[]).is_ok());
        let load_base = [setclass(class::HOST1X, host_reg::LOAD_SYNCPT_BASE, 1), 0];
        assert!(run(&load_base, &[]).is_err());
    }

    #[test]
    fn test_base_registers_limited_to_own_base() {
        let allow = RegisterAllowList::with_defaults();
        let incr_base = |base| {
            [
                setclass(class::HOST1X, host_reg::INCR_SYNCPT_BASE, 1),
                incr_syncpt_base(base, 1),
            ]
        };
        let wait_base = |base| {
            [
                setclass(class::HOST1X, host_reg::WAIT_SYNCPT_BASE, 1),
                wait_syncpt_base(7, base, 4),
            ]
        };

        let mut fw = Firewall::new(&allow, class::GR2D, 7, 2).with_base(Some(2));
        assert!(fw.validate_gather(&incr_base(2), 0, &HashSet::new()).is_ok());
        assert!(fw.validate_gather(&wait_base(2), 0, &HashSet::new()).is_ok());
        assert!(matches!(
            fw.validate_gather(&incr_base(3), 0, &HashSet::new()),
            Err(HostError::InvalidCommand { offset: 1, .. })
        ));
        assert!(fw.validate_gather(&wait_base(0), 0, &HashSet::new()).is_err());

        // No base of its own: nothing base-relative is allowed.
        assert!(run(&incr_base(0), &[]).is_err());
        assert!(run(&wait_base(0), &[]).is_err());
    }
}
