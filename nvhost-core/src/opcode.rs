// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host1x command-stream opcodes.
//!
//! Every command word starts with a 4-bit opcode in bits [31:28]. Opcodes that
//! write registers are followed by their data words; `GATHER` is followed by
//! the 32-bit device address of the words to fetch.
//!
//! | Opcode | Name     | Fields                                           |
//! |--------|----------|--------------------------------------------------|
//! | 0      | SETCLASS | offset [27:16], class [15:6], mask [5:0]         |
//! | 1      | INCR     | offset [27:16], count [15:0]                     |
//! | 2      | NONINCR  | offset [27:16], count [15:0]                     |
//! | 3      | MASK     | offset [27:16], mask [15:0]                      |
//! | 4      | IMM      | offset [27:16], value [15:0]                     |
//! | 5      | RESTART  | address [27:0] << 4                              |
//! | 6      | GATHER   | count [13:0], then one address word              |
//! | 14     | EXTEND   | subop [27:24], value [23:0]                      |

use nvhost_common::{ClassId, SyncpointId};

/// Registers of the host class (`class::HOST1X`).
pub mod host_reg {
    pub const INCR_SYNCPT: u32 = 0x00;
    pub const WAIT_SYNCPT_BASE: u32 = 0x09;
    pub const LOAD_SYNCPT_BASE: u32 = 0x0B;
    pub const INCR_SYNCPT_BASE: u32 = 0x0C;
    pub const LOAD_SYNCPT_PAYLOAD_32: u32 = 0x4E;
    pub const WAIT_SYNCPT_32: u32 = 0x50;
}

/// Condition under which an `INCR_SYNCPT` write takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyncptCond {
    Immediate = 0,
    OpDone = 1,
    RdDone = 2,
    RegWrSafe = 3,
}

/// A decoded command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    SetClass { offset: u32, class: ClassId, mask: u32 },
    Incr { offset: u32, count: u32 },
    NonIncr { offset: u32, count: u32 },
    Mask { offset: u32, mask: u32 },
    Imm { offset: u32, value: u32 },
    Restart { address: u32 },
    Gather { count: u32 },
    Extend { subop: u32, value: u32 },
    Unknown(u32),
}

impl Opcode {
    pub fn decode(word: u32) -> Self {
        let offset = (word >> 16) & 0xFFF;
        match word >> 28 {
            0 => Self::SetClass {
                offset,
                class: (word >> 6) & 0x3FF,
                mask: word & 0x3F,
            },
            1 => Self::Incr {
                offset,
                count: word & 0xFFFF,
            },
            2 => Self::NonIncr {
                offset,
                count: word & 0xFFFF,
            },
            3 => Self::Mask {
                offset,
                mask: word & 0xFFFF,
            },
            4 => Self::Imm {
                offset,
                value: word & 0xFFFF,
            },
            5 => Self::Restart {
                address: (word & 0x0FFF_FFFF) << 4,
            },
            6 => Self::Gather {
                count: word & 0x3FFF,
            },
            14 => Self::Extend {
                subop: (word >> 24) & 0xF,
                value: word & 0xFF_FFFF,
            },
            _ => Self::Unknown(word),
        }
    }

    /// Number of words that follow this opcode in the stream.
    pub fn data_words(&self) -> u32 {
        match *self {
            Self::SetClass { mask, .. } | Self::Mask { mask, .. } => mask.count_ones(),
            Self::Incr { count, .. } | Self::NonIncr { count, .. } => count,
            Self::Gather { .. } => 1,
            _ => 0,
        }
    }

    /// Register written by data word `index` of this opcode.
    pub fn register_for(&self, index: u32) -> Option<u32> {
        match *self {
            Self::SetClass { offset, mask, .. } | Self::Mask { offset, mask, .. } => {
                nth_set_bit(mask, index).map(|bit| offset + bit)
            }
            Self::Incr { offset, count } if index < count => Some(offset + index),
            Self::NonIncr { offset, count } if index < count => Some(offset),
            _ => None,
        }
    }
}

fn nth_set_bit(mask: u32, n: u32) -> Option<u32> {
    let mut remaining = mask;
    for _ in 0..n {
        if remaining == 0 {
            return None;
        }
        remaining &= remaining - 1;
    }
    if remaining == 0 {
        None
    } else {
        Some(remaining.trailing_zeros())
    }
}

// ── Encoders ─────────────────────────────────────────────────────────────

pub const fn setclass(class: ClassId, offset: u32, mask: u32) -> u32 {
    ((offset & 0xFFF) << 16) | ((class & 0x3FF) << 6) | (mask & 0x3F)
}

pub const fn incr(offset: u32, count: u32) -> u32 {
    (1 << 28) | ((offset & 0xFFF) << 16) | (count & 0xFFFF)
}

pub const fn nonincr(offset: u32, count: u32) -> u32 {
    (2 << 28) | ((offset & 0xFFF) << 16) | (count & 0xFFFF)
}

pub const fn mask(offset: u32, mask: u32) -> u32 {
    (3 << 28) | ((offset & 0xFFF) << 16) | (mask & 0xFFFF)
}

pub const fn imm(offset: u32, value: u32) -> u32 {
    (4 << 28) | ((offset & 0xFFF) << 16) | (value & 0xFFFF)
}

pub const fn gather(count: u32) -> u32 {
    (6 << 28) | (count & 0x3FFF)
}

pub const NOP: u32 = nonincr(0, 0);

/// Largest word count a single `GATHER` can fetch.
pub const MAX_GATHER_WORDS: u32 = 0x3FFF;

// ── Host class register payloads ─────────────────────────────────────────

pub const fn incr_syncpt(cond: SyncptCond, id: SyncpointId) -> u32 {
    ((cond as u32) << 10) | (id & 0x3FF)
}

pub const fn incr_syncpt_id(value: u32) -> SyncpointId {
    value & 0x3FF
}

pub const fn wait_syncpt_base(id: SyncpointId, base: u32, offset: u32) -> u32 {
    ((id & 0xFF) << 24) | ((base & 0xFF) << 16) | (offset & 0xFFFF)
}

/// Split a `WAIT_SYNCPT_BASE` payload into `(id, base, offset)`.
pub const fn decode_wait_syncpt_base(value: u32) -> (SyncpointId, u32, u32) {
    (value >> 24, (value >> 16) & 0xFF, value & 0xFFFF)
}

pub const fn load_syncpt_base(base: u32, value: u32) -> u32 {
    ((base & 0xFF) << 24) | (value & 0xFF_FFFF)
}

pub const fn incr_syncpt_base(base: u32, offset: u32) -> u32 {
    ((base & 0xFF) << 24) | (offset & 0xFF_FFFF)
}

/// Split a `LOAD_SYNCPT_BASE`/`INCR_SYNCPT_BASE` payload into `(base, value)`.
pub const fn decode_syncpt_base(value: u32) -> (u32, u32) {
    (value >> 24, value & 0xFF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvhost_common::class;

    #[test]
    fn test_decode_setclass() {
        let word = setclass(class::GR2D, 0x2B, 0b101);
        assert_eq!(
            Opcode::decode(word),
            Opcode::SetClass {
                offset: 0x2B,
                class: class::GR2D,
                mask: 0b101
            }
        );
        let op = Opcode::decode(word);
        assert_eq!(op.data_words(), 2);
        assert_eq!(op.register_for(0), Some(0x2B));
        assert_eq!(op.register_for(1), Some(0x2D));
        assert_eq!(op.register_for(2), None);
    }

    #[test]
    fn test_incr_and_nonincr_registers() {
        let op = Opcode::decode(incr(0x10, 3));
        assert_eq!(op.data_words(), 3);
        assert_eq!(op.register_for(2), Some(0x12));
        assert_eq!(op.register_for(3), None);

        let op = Opcode::decode(nonincr(0x10, 3));
        assert_eq!(op.register_for(2), Some(0x10));
    }

    #[test]
    fn test_nop_and_gather() {
        assert_eq!(Opcode::decode(NOP), Opcode::NonIncr { offset: 0, count: 0 });
        assert_eq!(NOP, 0x2000_0000);
        let op = Opcode::decode(gather(64));
        assert_eq!(op, Opcode::Gather { count: 64 });
        assert_eq!(op.data_words(), 1);
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(Opcode::decode(0x9000_0000), Opcode::Unknown(_)));
    }

    #[test]
    fn test_host_payloads() {
        assert_eq!(incr_syncpt_id(incr_syncpt(SyncptCond::OpDone, 77)), 77);
        assert_eq!(
            decode_wait_syncpt_base(wait_syncpt_base(12, 3, 40)),
            (12, 3, 40)
        );
        assert_eq!(decode_syncpt_base(incr_syncpt_base(5, 9)), (5, 9));
    }
}
