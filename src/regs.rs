// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register map of the accelerator and its DMA channel.
//!
//! The accelerator exposes a small memory-mapped register block. The DMA
//! engine that feeds it is reached through a DCR (Device Control Register)
//! channel, where registers are addressed by index instead of by address.
//! Both layouts are fixed by the hardware and must stay bit-exact.
//!
//! # Accelerator block
//!
//! | Offset | Register  | Bits of interest |
//! |--------|-----------|------------------|
//! | 0x00   | Control   | bit1 reset, bit2 filter trigger |
//! | 0x04   | Status    | bit7 busy, bit6 error, bit5 reset done, bit4 filter done, bit3 match |
//! | 0x08   | NumStates | FSM state count |
//! | 0x0C   | NumFinals | FSM final-state count |

use bitflags::bitflags;

/// Byte offset of the control register.
pub const REG_CONTROL: usize = 0x00;
/// Byte offset of the status register.
pub const REG_STATUS: usize = 0x04;
/// Byte offset of the FSM state count register.
pub const REG_NUM_STATES: usize = 0x08;
/// Byte offset of the FSM final-state count register.
pub const REG_NUM_FINALS: usize = 0x0C;

/// Size of the accelerator register block in bytes.
pub const ACCEL_BLOCK_LEN: usize = 0x10;

bitflags! {
    /// Accelerator control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Control: u32 {
        /// Reload the FSM filter table.
        const RESET = 1 << 1;
        /// Start filtering the streamed payload.
        const FILTER = 1 << 2;
    }
}

bitflags! {
    /// Accelerator status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        /// An operation is still running.
        const BUSY = 1 << 7;
        /// The last operation failed.
        const ERROR = 1 << 6;
        /// Filter table reset completed.
        const RESET_DONE = 1 << 5;
        /// Payload filtering completed.
        const FILTER_DONE = 1 << 4;
        /// The filtered payload matched.
        const MATCH = 1 << 3;
    }
}

/// DMA channel registers, addressed by DCR index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DcrReg {
    /// Next descriptor pointer (read only).
    NextDesc = 0x00,
    /// Current buffer address (read only).
    CurBufAddr = 0x01,
    /// Current buffer length (read only).
    CurBufLength = 0x02,
    /// Current descriptor pointer.
    CurDesc = 0x03,
    /// Tail descriptor pointer; writing it starts the transfer.
    TailDesc = 0x04,
    /// Channel control.
    ChannelControl = 0x05,
    /// Interrupt status, write the read value back to acknowledge.
    IrqStatus = 0x06,
    /// Channel status (read only).
    ChannelStatus = 0x07,
    /// DMA-wide control.
    DmaControl = 0x10,
}

impl DcrReg {
    /// Returns the DCR index.
    #[inline]
    pub const fn index(self) -> u32 {
        self as u32
    }

    /// Returns a human-readable name for the register.
    pub const fn name(self) -> &'static str {
        match self {
            Self::NextDesc => "TX_NXTDESC_PTR",
            Self::CurBufAddr => "TX_CURBUF_ADDR",
            Self::CurBufLength => "TX_CURBUF_LENGTH",
            Self::CurDesc => "TX_CURDESC_PTR",
            Self::TailDesc => "TX_TAILDESC_PTR",
            Self::ChannelControl => "TX_CHNL_CTRL",
            Self::IrqStatus => "TX_IRQ_REG",
            Self::ChannelStatus => "TX_CHNL_STS",
            Self::DmaControl => "DMA_CONTROL_REG",
        }
    }
}

impl std::fmt::Display for DcrReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.index())
    }
}

bitflags! {
    /// TX channel control register.
    ///
    /// Bits 31:24 hold the IRQ delay timeout and bits 23:16 the IRQ
    /// coalescing count; see [`ChannelControl::with_coalescing`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelControl: u32 {
        /// Interrupt on end of packet.
        const IRQ_ON_END = 1 << 9;
        /// Master interrupt enable.
        const IRQ_EN = 1 << 7;
        /// Interrupt on error.
        const IRQ_ERR_EN = 1 << 2;
        /// Delay-based coalescing interrupt.
        const IRQ_DLY_EN = 1 << 1;
        /// Count-based coalescing interrupt.
        const IRQ_COAL_EN = 1 << 0;

        const _ = !0;
    }
}

impl ChannelControl {
    /// Control value used at attach: completion and coalescing interrupts on.
    pub fn with_coalescing(delay_timeout: u8, coalesce_count: u8) -> Self {
        let fields = (u32::from(delay_timeout) << 24) | (u32::from(coalesce_count) << 16);
        Self::from_bits_retain(fields)
            | Self::IRQ_EN
            | Self::IRQ_DLY_EN
            | Self::IRQ_COAL_EN
            | Self::IRQ_ON_END
    }
}

bitflags! {
    /// TX channel status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelStatus: u32 {
        /// Channel error.
        const ERROR = 1 << 7;
        /// Interrupt on end.
        const IOE = 1 << 6;
        /// Stop on end.
        const SOE = 1 << 5;
        /// Descriptor completed.
        const COMPLETE = 1 << 4;
        /// Start of packet.
        const SOP = 1 << 3;
        /// End of packet.
        const EOP = 1 << 2;
        /// Engine busy.
        const ENGINE_BUSY = 1 << 1;

        const _ = !0;
    }
}

bitflags! {
    /// DMA-wide control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaControl: u32 {
        /// Reset the engine; self-clears when the reset is done.
        const RESET = 1 << 0;
        /// Start transfers on tail pointer writes.
        const TAIL_ENABLE = 1 << 2;
    }
}

/// Access to the accelerator's memory-mapped register block.
///
/// Offsets are in bytes from the start of the block. Implementations must
/// use volatile accesses.
pub trait RegisterIo: Send + Sync {
    /// Read a 32-bit register.
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register.
    fn write32(&self, offset: usize, value: u32);

    /// Read the status register.
    #[inline]
    fn status(&self) -> Status {
        Status::from_bits_retain(self.read32(REG_STATUS))
    }
}

/// Access to the DMA channel's DCR register file.
pub trait DcrIo: Send + Sync {
    /// Read a DCR register.
    fn dcr_read(&self, reg: DcrReg) -> u32;

    /// Write a DCR register.
    fn dcr_write(&self, reg: DcrReg, value: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        assert_eq!(Status::BUSY.bits(), 0x80);
        assert_eq!(Status::ERROR.bits(), 0x40);
        assert_eq!(Status::RESET_DONE.bits(), 0x20);
        assert_eq!(Status::FILTER_DONE.bits(), 0x10);
        assert_eq!(Status::MATCH.bits(), 0x08);
        assert_eq!((Status::FILTER_DONE | Status::MATCH).bits(), 0x18);
    }

    #[test]
    fn test_dcr_indices() {
        assert_eq!(DcrReg::CurDesc.index(), 0x03);
        assert_eq!(DcrReg::TailDesc.index(), 0x04);
        assert_eq!(DcrReg::ChannelControl.index(), 0x05);
        assert_eq!(DcrReg::IrqStatus.index(), 0x06);
        assert_eq!(DcrReg::ChannelStatus.index(), 0x07);
        assert_eq!(DcrReg::DmaControl.index(), 0x10);
    }

    #[test]
    fn test_channel_control_value() {
        let ctrl = ChannelControl::with_coalescing(1, 1);
        assert_eq!(ctrl.bits(), 0x0101_0283);
    }

    #[test]
    fn test_channel_status_bits() {
        assert_eq!(ChannelStatus::COMPLETE.bits(), 1 << 4);
        assert_eq!(ChannelStatus::ERROR.bits(), 1 << 7);
        assert_eq!(DmaControl::RESET.bits(), 1);
        assert_eq!(DmaControl::TAIL_ENABLE.bits(), 4);
    }

    #[test]
    fn test_dcr_display() {
        assert_eq!(format!("{}", DcrReg::TailDesc), "TX_TAILDESC_PTR (0x04)");
    }
}
