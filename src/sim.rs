// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Simulated accelerator platform.
//!
//! `SimPlatform` stands in for the board: registers and the DCR file are
//! plain atomics, coherent memory is a word vector, and interrupts are raised
//! by the test (or demo) through [`SimPlatform::raise_irq`] and friends.
//! Every resource acquisition, release and register write is recorded so
//! ordering can be checked afterwards.
//!
//! The DMA reset bit self-clears on write and the interrupt status register
//! is write-one-to-clear, as on the real channel.

use crate::error::{DpiError, DpiResult};
use crate::platform::{
    CoherentMemory, DcrResource, DeviceBinding, DmaMapper, DmaMapping, IrqHandler, IrqLine,
    IrqReturn, MemRegion, Platform,
};
use crate::regs::{
    ChannelStatus, DcrIo, DcrReg, DmaControl, RegisterIo, ACCEL_BLOCK_LEN, REG_STATUS,
};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Register region used by [`default_binding`].
pub const DEFAULT_REGION: MemRegion = MemRegion {
    start: 0x8000_0000,
    end: 0x8000_FFFF,
};

/// Interrupt line used by [`default_binding`].
pub const DEFAULT_IRQ: IrqLine = IrqLine(30);

/// DCR window used by [`default_binding`].
pub const DEFAULT_DCR: DcrResource = DcrResource {
    start: 0x80,
    len: 0x11,
};

/// Bus address of simulated coherent memory.
pub const COHERENT_BASE: u32 = 0x1000_0000;

/// Bus address of the first simulated payload mapping.
const MAPPING_BASE: u32 = 0x2000_0000;

/// IRQ status bits raised with a transfer.
const IRQ_COALESCE: u32 = 1 << 0;
const IRQ_ERROR: u32 = 1 << 2;

const DCR_COUNT: usize = DcrReg::DmaControl as usize + 1;

/// A binding for the simulated device.
pub fn default_binding() -> DeviceBinding {
    DeviceBinding::new(DEFAULT_REGION, DEFAULT_IRQ, DEFAULT_DCR)
}

/// Recorded platform activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    ReserveRegion,
    ReleaseRegion,
    MapRegion,
    UnmapRegion,
    OpenChannel,
    CloseChannel,
    RequestIrq(IrqLine),
    FreeIrq(IrqLine),
    AllocCoherent,
    FreeCoherent,
    Map { addr: u32, len: usize },
    Unmap { addr: u32 },
    RegWrite { offset: usize, value: u32 },
    DcrWrite { reg: DcrReg, value: u32 },
}

impl SimEvent {
    /// True for register traffic, false for resource lifecycle events.
    pub fn is_register_write(&self) -> bool {
        matches!(self, Self::RegWrite { .. } | Self::DcrWrite { .. })
    }

    /// True for payload map and unmap events.
    pub fn is_mapping(&self) -> bool {
        matches!(self, Self::Map { .. } | Self::Unmap { .. })
    }
}

/// Platform step that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimStep {
    ReserveRegion,
    MapRegion,
    OpenChannel,
    RequestIrq,
    DmaMapper,
    AllocCoherent,
}

struct SimInner {
    regs: [AtomicU32; ACCEL_BLOCK_LEN / 4],
    dcr: [AtomicU32; DCR_COUNT],
    events: Mutex<Vec<SimEvent>>,
    irq: Mutex<Option<(IrqLine, IrqHandler)>>,
    fail_step: Mutex<Option<SimStep>>,
    coherent: Mutex<Option<Arc<Mutex<Vec<u32>>>>>,
    last_mapping: Mutex<Option<(u32, Vec<u8>)>>,
    region_reserved: AtomicBool,
    fail_next_map: AtomicBool,
    dma_reset_stuck: AtomicBool,
    next_mapping: AtomicU32,
    maps: AtomicUsize,
    unmaps: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimInner {
    fn record(&self, event: SimEvent) {
        lock(&self.events).push(event);
    }

    fn check(&self, step: SimStep) -> DpiResult<()> {
        let mut fail = lock(&self.fail_step);
        if *fail == Some(step) {
            *fail = None;
            return Err(DpiError::ResourceUnavailable(format!("simulated {step:?} failure")));
        }
        Ok(())
    }
}

/// Simulated board. Clones share the same device.
#[derive(Clone)]
pub struct SimPlatform {
    inner: Arc<SimInner>,
}

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimPlatform")
            .field("status", &self.status_register())
            .field("maps", &self.map_count())
            .field("unmaps", &self.unmap_count())
            .finish()
    }
}

impl SimPlatform {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SimInner {
                regs: std::array::from_fn(|_| AtomicU32::new(0)),
                dcr: std::array::from_fn(|_| AtomicU32::new(0)),
                events: Mutex::new(Vec::new()),
                irq: Mutex::new(None),
                fail_step: Mutex::new(None),
                coherent: Mutex::new(None),
                last_mapping: Mutex::new(None),
                region_reserved: AtomicBool::new(false),
                fail_next_map: AtomicBool::new(false),
                dma_reset_stuck: AtomicBool::new(false),
                next_mapping: AtomicU32::new(MAPPING_BASE),
                maps: AtomicUsize::new(0),
                unmaps: AtomicUsize::new(0),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Hardware behaviour
    // ------------------------------------------------------------------

    /// Set the accelerator status register.
    pub fn set_status(&self, status: u32) {
        self.inner.regs[REG_STATUS / 4].store(status, Ordering::SeqCst);
    }

    /// Current accelerator status register.
    pub fn status_register(&self) -> u32 {
        self.inner.regs[REG_STATUS / 4].load(Ordering::SeqCst)
    }

    /// Accelerator register at byte `offset`.
    pub fn register(&self, offset: usize) -> u32 {
        self.inner.regs[offset / 4].load(Ordering::SeqCst)
    }

    /// DMA channel register.
    pub fn dcr(&self, reg: DcrReg) -> u32 {
        self.inner.dcr[reg.index() as usize].load(Ordering::SeqCst)
    }

    /// Set a DMA channel register without side effects.
    pub fn set_dcr(&self, reg: DcrReg, value: u32) {
        self.inner.dcr[reg.index() as usize].store(value, Ordering::SeqCst);
    }

    /// Keep the DMA reset bit set after it is written.
    pub fn set_dma_reset_stuck(&self, stuck: bool) {
        self.inner.dma_reset_stuck.store(stuck, Ordering::SeqCst);
    }

    /// Invoke the handler bound to the interrupt line, if any.
    pub fn raise_irq(&self) -> Option<IrqReturn> {
        let handler = lock(&self.inner.irq).as_ref().map(|(_, h)| Arc::clone(h))?;
        Some(handler())
    }

    /// Finish the in-flight transfer with `status` in the accelerator and
    /// raise the completion interrupt.
    pub fn complete_transfer(&self, status: u32) -> Option<IrqReturn> {
        self.set_status(status);
        self.set_dcr(DcrReg::ChannelStatus, ChannelStatus::COMPLETE.bits());
        self.inner.dcr[DcrReg::IrqStatus.index() as usize].fetch_or(IRQ_COALESCE, Ordering::SeqCst);
        self.raise_irq()
    }

    /// Fail the in-flight transfer on the DMA side and raise the interrupt.
    pub fn fail_transfer(&self) -> Option<IrqReturn> {
        self.set_dcr(DcrReg::ChannelStatus, ChannelStatus::ERROR.bits());
        self.inner.dcr[DcrReg::IrqStatus.index() as usize].fetch_or(IRQ_ERROR, Ordering::SeqCst);
        self.raise_irq()
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    /// Make the next call of `step` fail.
    pub fn fail_at(&self, step: SimStep) {
        *lock(&self.inner.fail_step) = Some(step);
    }

    /// Make the next payload mapping fail.
    pub fn fail_next_map(&self) {
        self.inner.fail_next_map.store(true, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.inner.events).clone()
    }

    /// Recorded resource lifecycle events, without register traffic.
    pub fn lifecycle(&self) -> Vec<SimEvent> {
        lock(&self.inner.events)
            .iter()
            .filter(|e| !e.is_register_write() && !e.is_mapping())
            .cloned()
            .collect()
    }

    /// Writes to one DMA channel register, in order.
    pub fn dcr_writes(&self, reg: DcrReg) -> Vec<u32> {
        lock(&self.inner.events)
            .iter()
            .filter_map(|e| match e {
                SimEvent::DcrWrite { reg: r, value } if *r == reg => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Writes to one accelerator register, in order.
    pub fn reg_writes(&self, offset: usize) -> Vec<u32> {
        lock(&self.inner.events)
            .iter()
            .filter_map(|e| match e {
                SimEvent::RegWrite { offset: o, value } if *o == offset => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub fn clear_events(&self) {
        lock(&self.inner.events).clear();
    }

    /// Number of payload mappings created.
    pub fn map_count(&self) -> usize {
        self.inner.maps.load(Ordering::SeqCst)
    }

    /// Number of payload mappings torn down.
    pub fn unmap_count(&self) -> usize {
        self.inner.unmaps.load(Ordering::SeqCst)
    }

    /// Bus address of the most recent payload mapping.
    pub fn last_mapped_addr(&self) -> Option<u32> {
        lock(&self.inner.last_mapping).as_ref().map(|(addr, _)| *addr)
    }

    /// Bytes staged by the most recent payload mapping.
    pub fn mapped_payload(&self) -> Option<Vec<u8>> {
        lock(&self.inner.last_mapping).as_ref().map(|(_, bytes)| bytes.clone())
    }

    /// Words of the live coherent allocation.
    pub fn coherent_words(&self) -> Option<Vec<u32>> {
        lock(&self.inner.coherent).as_ref().map(|words| lock(words).clone())
    }

    /// True while an interrupt handler is bound.
    pub fn irq_bound(&self) -> bool {
        lock(&self.inner.irq).is_some()
    }
}

/// Exclusive reservation of the simulated register region.
pub struct SimRegion {
    inner: Arc<SimInner>,
}

impl Drop for SimRegion {
    fn drop(&mut self) {
        self.inner.region_reserved.store(false, Ordering::SeqCst);
        self.inner.record(SimEvent::ReleaseRegion);
    }
}

/// Simulated accelerator register block.
pub struct SimRegisters {
    inner: Arc<SimInner>,
}

impl RegisterIo for SimRegisters {
    fn read32(&self, offset: usize) -> u32 {
        self.inner
            .regs
            .get(offset / 4)
            .map_or(0, |r| r.load(Ordering::SeqCst))
    }

    fn write32(&self, offset: usize, value: u32) {
        if let Some(r) = self.inner.regs.get(offset / 4) {
            r.store(value, Ordering::SeqCst);
        }
        self.inner.record(SimEvent::RegWrite { offset, value });
    }
}

impl Drop for SimRegisters {
    fn drop(&mut self) {
        self.inner.record(SimEvent::UnmapRegion);
    }
}

/// Simulated DMA channel DCR file.
pub struct SimChannel {
    inner: Arc<SimInner>,
}

impl DcrIo for SimChannel {
    fn dcr_read(&self, reg: DcrReg) -> u32 {
        self.inner.dcr[reg.index() as usize].load(Ordering::SeqCst)
    }

    fn dcr_write(&self, reg: DcrReg, value: u32) {
        let slot = &self.inner.dcr[reg.index() as usize];
        match reg {
            DcrReg::IrqStatus => {
                slot.fetch_and(!value, Ordering::SeqCst);
            }
            DcrReg::DmaControl if !self.inner.dma_reset_stuck.load(Ordering::SeqCst) => {
                slot.store(value & !DmaControl::RESET.bits(), Ordering::SeqCst);
            }
            _ => slot.store(value, Ordering::SeqCst),
        }
        self.inner.record(SimEvent::DcrWrite { reg, value });
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        self.inner.record(SimEvent::CloseChannel);
    }
}

/// Simulated streaming mapping.
#[derive(Debug)]
pub struct SimMapping {
    addr: u32,
    bytes: Vec<u8>,
}

impl DmaMapping for SimMapping {
    fn device_addr(&self) -> u32 {
        self.addr
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }
}

/// Simulated streaming mapper.
pub struct SimMapper {
    inner: Arc<SimInner>,
}

impl DmaMapper for SimMapper {
    type Mapping = SimMapping;

    fn map_to_device(&self, payload: &[u8]) -> DpiResult<SimMapping> {
        if self.inner.fail_next_map.swap(false, Ordering::SeqCst) {
            return Err(DpiError::MappingFailure("simulated mapping failure".into()));
        }
        let span = (payload.len() as u32 + 63) & !63;
        let addr = self.inner.next_mapping.fetch_add(span, Ordering::SeqCst);
        self.inner.maps.fetch_add(1, Ordering::SeqCst);
        *lock(&self.inner.last_mapping) = Some((addr, payload.to_vec()));
        self.inner.record(SimEvent::Map {
            addr,
            len: payload.len(),
        });
        Ok(SimMapping {
            addr,
            bytes: payload.to_vec(),
        })
    }

    fn unmap(&self, mapping: SimMapping) {
        self.inner.unmaps.fetch_add(1, Ordering::SeqCst);
        self.inner.record(SimEvent::Unmap { addr: mapping.addr });
    }
}

/// Simulated coherent allocation.
pub struct SimCoherent {
    inner: Arc<SimInner>,
    words: Arc<Mutex<Vec<u32>>>,
}

impl CoherentMemory for SimCoherent {
    fn device_addr(&self) -> u32 {
        COHERENT_BASE
    }

    fn len(&self) -> usize {
        lock(&self.words).len() * 4
    }

    fn read_word(&self, index: usize) -> u32 {
        lock(&self.words)[index]
    }

    fn write_word(&mut self, index: usize, value: u32) {
        lock(&self.words)[index] = value;
    }
}

impl Drop for SimCoherent {
    fn drop(&mut self) {
        *lock(&self.inner.coherent) = None;
        self.inner.record(SimEvent::FreeCoherent);
    }
}

impl Platform for SimPlatform {
    type Region = SimRegion;
    type Regs = SimRegisters;
    type Channel = SimChannel;
    type Mapper = SimMapper;
    type Coherent = SimCoherent;

    fn reserve_region(&self, _region: &MemRegion) -> DpiResult<SimRegion> {
        self.inner.check(SimStep::ReserveRegion)?;
        if self.inner.region_reserved.swap(true, Ordering::SeqCst) {
            return Err(DpiError::ResourceUnavailable("memory region already reserved".into()));
        }
        self.inner.record(SimEvent::ReserveRegion);
        Ok(SimRegion {
            inner: Arc::clone(&self.inner),
        })
    }

    fn map_region(&self, _region: &MemRegion) -> DpiResult<SimRegisters> {
        self.inner.check(SimStep::MapRegion)?;
        self.inner.record(SimEvent::MapRegion);
        Ok(SimRegisters {
            inner: Arc::clone(&self.inner),
        })
    }

    fn open_channel(&self, _dcr: &DcrResource) -> DpiResult<SimChannel> {
        self.inner.check(SimStep::OpenChannel)?;
        self.inner.record(SimEvent::OpenChannel);
        Ok(SimChannel {
            inner: Arc::clone(&self.inner),
        })
    }

    fn request_irq(&self, line: IrqLine, handler: IrqHandler) -> DpiResult<()> {
        self.inner.check(SimStep::RequestIrq)?;
        let mut slot = lock(&self.inner.irq);
        if slot.is_some() {
            return Err(DpiError::ResourceUnavailable(format!("{line} already bound")));
        }
        *slot = Some((line, handler));
        drop(slot);
        self.inner.record(SimEvent::RequestIrq(line));
        Ok(())
    }

    fn free_irq(&self, line: IrqLine) {
        let mut slot = lock(&self.inner.irq);
        if matches!(slot.as_ref(), Some((bound, _)) if *bound == line) {
            *slot = None;
            drop(slot);
            self.inner.record(SimEvent::FreeIrq(line));
        }
    }

    fn dma_mapper(&self) -> DpiResult<SimMapper> {
        self.inner.check(SimStep::DmaMapper)?;
        Ok(SimMapper {
            inner: Arc::clone(&self.inner),
        })
    }

    fn alloc_coherent(&self, len: usize) -> DpiResult<SimCoherent> {
        self.inner.check(SimStep::AllocCoherent)?;
        let words = Arc::new(Mutex::new(vec![0u32; len.div_ceil(4)]));
        *lock(&self.inner.coherent) = Some(Arc::clone(&words));
        self.inner.record(SimEvent::AllocCoherent);
        Ok(SimCoherent {
            inner: Arc::clone(&self.inner),
            words,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_reset_self_clears() {
        let sim = SimPlatform::new();
        let ch = sim.open_channel(&DEFAULT_DCR).unwrap();
        ch.dcr_write(DcrReg::DmaControl, DmaControl::RESET.bits());
        assert_eq!(ch.dcr_read(DcrReg::DmaControl), 0);

        sim.set_dma_reset_stuck(true);
        ch.dcr_write(DcrReg::DmaControl, DmaControl::RESET.bits());
        assert_eq!(ch.dcr_read(DcrReg::DmaControl), DmaControl::RESET.bits());
    }

    #[test]
    fn test_irq_status_write_one_to_clear() {
        let sim = SimPlatform::new();
        let ch = sim.open_channel(&DEFAULT_DCR).unwrap();
        sim.set_dcr(DcrReg::IrqStatus, 0b101);
        ch.dcr_write(DcrReg::IrqStatus, 0b001);
        assert_eq!(sim.dcr(DcrReg::IrqStatus), 0b100);
    }

    #[test]
    fn test_region_is_exclusive() {
        let sim = SimPlatform::new();
        let first = sim.reserve_region(&DEFAULT_REGION).unwrap();
        assert!(sim.reserve_region(&DEFAULT_REGION).is_err());
        drop(first);
        assert!(sim.reserve_region(&DEFAULT_REGION).is_ok());
    }

    #[test]
    fn test_irq_line_is_exclusive() {
        let sim = SimPlatform::new();
        let handler: IrqHandler = Arc::new(|| IrqReturn::Handled);
        sim.request_irq(DEFAULT_IRQ, Arc::clone(&handler)).unwrap();
        assert!(sim.request_irq(DEFAULT_IRQ, handler).is_err());
        assert_eq!(sim.raise_irq(), Some(IrqReturn::Handled));

        sim.free_irq(DEFAULT_IRQ);
        assert!(!sim.irq_bound());
        assert_eq!(sim.raise_irq(), None);
    }

    #[test]
    fn test_fail_at_is_one_shot() {
        let sim = SimPlatform::new();
        sim.fail_at(SimStep::AllocCoherent);
        assert!(sim.alloc_coherent(32).is_err());
        assert!(sim.alloc_coherent(32).is_ok());
    }

    #[test]
    fn test_mappings_do_not_overlap() {
        let sim = SimPlatform::new();
        let mapper = sim.dma_mapper().unwrap();
        let a = mapper.map_to_device(&[0; 100]).unwrap();
        let b = mapper.map_to_device(&[0; 10]).unwrap();
        assert!(b.device_addr() >= a.device_addr() + a.len() as u32);
        mapper.unmap(a);
        mapper.unmap(b);
        assert_eq!((sim.map_count(), sim.unmap_count()), (2, 2));
    }
}
