// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA buffer descriptor.
//!
//! The CDMAC engine walks a chain of 32-byte descriptors that live in memory
//! shared with the driver. This driver only ever uses one descriptor whose
//! `next` field points at itself: every payload is a single complete packet.

use bitflags::bitflags;

bitflags! {
    /// Status/control flags of the descriptor's `app0` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AppFlags: u32 {
        /// Transfer error.
        const ERROR = 1 << 31;
        /// Raise an interrupt when this descriptor ends.
        const IRQ_ON_END = 1 << 30;
        /// Stop the engine after this descriptor.
        const STOP_ON_END = 1 << 29;
        /// Descriptor completed (written by the engine).
        const COMPLETE = 1 << 28;
        /// Start of packet.
        const SOP = 1 << 27;
        /// End of packet.
        const EOP = 1 << 26;
        /// Engine busy (written by the engine).
        const ENGINE_BUSY = 1 << 25;
        /// Engine reset.
        const ENGINE_RESET = 1 << 24;
    }
}

/// Number of 32-bit words in a descriptor.
pub const DESCRIPTOR_WORDS: usize = 8;

/// Size of a descriptor in bytes.
pub const DESCRIPTOR_LEN: usize = DESCRIPTOR_WORDS * 4;

/// Largest buffer length the descriptor's 32-bit length word can carry.
pub const MAX_BUFFER_LEN: usize = u32::MAX as usize;

/// CDMAC buffer descriptor.
///
/// # Layout
///
/// | Word | Field | Use |
/// |------|-------|-----|
/// | 0 | next | device address of the next descriptor |
/// | 1 | phys | device address of the payload |
/// | 2 | len  | payload length in bytes |
/// | 3 | app0 | [`AppFlags`] |
/// | 4 | app1 | TX checksum start/insert (unused) |
/// | 5 | app2 | TX checksum seed (unused) |
/// | 6 | app3 | reserved |
/// | 7 | app4 | TX length bookkeeping (unused) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct BufferDescriptor {
    pub next: u32,
    pub phys: u32,
    pub len: u32,
    pub app0: u32,
    pub app1: u32,
    pub app2: u32,
    pub app3: u32,
    pub app4: u32,
}

impl BufferDescriptor {
    /// Create a new zeroed descriptor.
    #[inline]
    pub const fn new() -> Self {
        Self {
            next: 0,
            phys: 0,
            len: 0,
            app0: 0,
            app1: 0,
            app2: 0,
            app3: 0,
            app4: 0,
        }
    }

    /// Describe one complete packet: chained to itself, both SOP and EOP set.
    pub fn single_packet(self_addr: u32, payload_addr: u32, len: u32) -> Self {
        let mut desc = Self::new();
        desc.next = self_addr;
        desc.phys = payload_addr;
        desc.len = len;
        desc.set_flags(AppFlags::SOP | AppFlags::EOP);
        desc
    }

    /// Replace the `app0` flags.
    #[inline]
    pub fn set_flags(&mut self, flags: AppFlags) {
        self.app0 = flags.bits();
    }

    /// Flags in `app0`; unknown bits are kept.
    #[inline]
    pub fn flags(&self) -> AppFlags {
        AppFlags::from_bits_retain(self.app0)
    }

    /// The descriptor as it is laid out in memory.
    pub fn to_words(&self) -> [u32; DESCRIPTOR_WORDS] {
        [
            self.next, self.phys, self.len, self.app0, self.app1, self.app2, self.app3, self.app4,
        ]
    }

    /// Rebuild a descriptor from memory words.
    pub fn from_words(words: [u32; DESCRIPTOR_WORDS]) -> Self {
        let [next, phys, len, app0, app1, app2, app3, app4] = words;
        Self {
            next,
            phys,
            len,
            app0,
            app1,
            app2,
            app3,
            app4,
        }
    }
}

const _: () = assert!(std::mem::size_of::<BufferDescriptor>() == DESCRIPTOR_LEN);
