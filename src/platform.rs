// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Platform capabilities the driver is built on.
//!
//! A [`Platform`] hands out the resources described by a [`DeviceBinding`]:
//! the register block, the DMA channel, the interrupt line, streaming DMA
//! mappings and coherent memory. Resources are released when the returned
//! values are dropped, except the interrupt line which is released with
//! [`Platform::free_irq`].
//!
//! Two implementations ship with the crate: [`crate::sim::SimPlatform`] and,
//! on Linux, [`crate::linux::LinuxPlatform`].

use crate::error::{DpiError, DpiResult};
use crate::regs::{DcrIo, RegisterIo};
use std::sync::Arc;

/// Device-tree compatible string the driver binds to.
pub const COMPATIBLE: &str = "xlnx,dpi-accelerator-1.00.a";

/// Physical memory region holding the accelerator registers.
///
/// `end` is inclusive, as in platform resource tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub start: u64,
    pub end: u64,
}

impl MemRegion {
    /// Region of `len` bytes starting at `start`.
    ///
    /// A zero `len` or one running past the address space yields a region
    /// that fails [`DeviceBinding::validate`].
    pub const fn with_len(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start.wrapping_add(len).wrapping_sub(1),
        }
    }

    /// Region size in bytes, `None` when the bounds are inverted or the
    /// size does not fit in a `u64`.
    pub fn checked_len(&self) -> Option<u64> {
        self.end.checked_sub(self.start)?.checked_add(1)
    }

    /// Region size in bytes; zero for a region with invalid bounds.
    pub fn len(&self) -> u64 {
        self.checked_len().unwrap_or(0)
    }
}

/// DCR window of the companion DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcrResource {
    /// First DCR number of the channel.
    pub start: u32,
    /// Number of DCRs in the window.
    pub len: u32,
}

/// Hardware interrupt line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrqLine(pub u32);

impl std::fmt::Display for IrqLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "irq {}", self.0)
    }
}

/// Everything device discovery yields for one accelerator: one register
/// region, one interrupt line and one companion DMA channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub compatible: String,
    pub region: MemRegion,
    pub irq: IrqLine,
    pub dma_channel: DcrResource,
}

impl DeviceBinding {
    /// Binding for a device matching [`COMPATIBLE`].
    pub fn new(region: MemRegion, irq: IrqLine, dma_channel: DcrResource) -> Self {
        Self {
            compatible: COMPATIBLE.to_string(),
            region,
            irq,
            dma_channel,
        }
    }

    /// Check the binding contract before any resource is touched.
    pub fn validate(&self) -> DpiResult<()> {
        if self.compatible != COMPATIBLE {
            return Err(DpiError::ResourceUnavailable(format!(
                "incompatible device '{}'",
                self.compatible
            )));
        }
        if self.region.checked_len().is_none() {
            return Err(DpiError::ResourceUnavailable(format!(
                "invalid memory region {:#x}..={:#x}",
                self.region.start, self.region.end
            )));
        }
        if self.dma_channel.len == 0 {
            return Err(DpiError::ResourceUnavailable(
                "DMA channel has no DCR registers".into(),
            ));
        }
        Ok(())
    }
}

/// Interrupt handler outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was for this device and has been serviced.
    Handled,
    /// The interrupt was not raised by this device.
    None,
}

/// Handler registered on an interrupt line.
pub type IrqHandler = Arc<dyn Fn() -> IrqReturn + Send + Sync>;

/// A payload made visible to the DMA engine.
///
/// The mapping owns the device-visible copy of the payload; it stays valid
/// until handed back to [`DmaMapper::unmap`].
pub trait DmaMapping: Send {
    /// Device-visible (bus) address of the payload.
    fn device_addr(&self) -> u32;

    /// Mapped length in bytes.
    fn len(&self) -> usize;
}

/// Streaming DMA mappings in the CPU-to-device direction.
pub trait DmaMapper: Send {
    type Mapping: DmaMapping;

    /// Make `payload` visible to the device.
    fn map_to_device(&self, payload: &[u8]) -> DpiResult<Self::Mapping>;

    /// Tear a mapping down.
    fn unmap(&self, mapping: Self::Mapping);
}

/// Memory shared coherently between the CPU and the DMA engine.
///
/// Freed when dropped. Word accesses must be volatile.
pub trait CoherentMemory: Send {
    /// Device-visible address of the first byte.
    fn device_addr(&self) -> u32;

    /// Size in bytes.
    fn len(&self) -> usize;

    /// Read the 32-bit word at `index`.
    fn read_word(&self, index: usize) -> u32;

    /// Write the 32-bit word at `index`.
    fn write_word(&mut self, index: usize, value: u32);
}

/// Resource provider for one accelerator.
pub trait Platform: Send + Sync + 'static {
    /// Exclusive reservation of the register region; released on drop.
    type Region: Send + Sync + 'static;
    /// Mapped register block; unmapped on drop.
    type Regs: RegisterIo + 'static;
    /// DMA channel accessor; closed on drop.
    type Channel: DcrIo + 'static;
    type Mapper: DmaMapper + 'static;
    type Coherent: CoherentMemory + 'static;

    /// Reserve the register region exclusively.
    fn reserve_region(&self, region: &MemRegion) -> DpiResult<Self::Region>;

    /// Map the register region into the address space.
    fn map_region(&self, region: &MemRegion) -> DpiResult<Self::Regs>;

    /// Open index-based accessors for the DMA channel.
    fn open_channel(&self, dcr: &DcrResource) -> DpiResult<Self::Channel>;

    /// Bind `handler` to `line`. Only one handler may own a line.
    fn request_irq(&self, line: IrqLine, handler: IrqHandler) -> DpiResult<()>;

    /// Unbind the handler from `line` and drop it.
    fn free_irq(&self, line: IrqLine);

    /// Streaming mapper for payloads.
    fn dma_mapper(&self) -> DpiResult<Self::Mapper>;

    /// Allocate zeroed coherent memory.
    fn alloc_coherent(&self, len: usize) -> DpiResult<Self::Coherent>;
}
