// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA transfer management.
//!
//! [`DmaTransfer`] owns the single buffer descriptor and the mapping of the
//! payload currently in flight. The engine helpers below program the DMA
//! channel through its DCR registers.
//!
//! Pushing a payload is split in two steps so the caller can release its
//! locks before the hardware is kicked:
//!
//! 1. [`DmaTransfer::prepare`] maps the payload and fills the descriptor.
//! 2. [`kick`] writes the descriptor address to the tail pointer.

use crate::config::DpiConfig;
use crate::descriptor::{BufferDescriptor, DESCRIPTOR_LEN, DESCRIPTOR_WORDS, MAX_BUFFER_LEN};
use crate::error::{DpiError, DpiResult};
use crate::platform::{CoherentMemory, DmaMapper, DmaMapping};
use crate::regs::{ChannelControl, DcrIo, DcrReg, DmaControl};

/// The reusable descriptor and the live payload mapping.
pub struct DmaTransfer<M: DmaMapper, B: CoherentMemory> {
    mapper: M,
    descriptor: B,
    in_flight: Option<M::Mapping>,
    max_len: usize,
}

impl<M: DmaMapper, B: CoherentMemory> DmaTransfer<M, B> {
    /// Take ownership of the coherent descriptor memory. `max_len` is
    /// capped at what one descriptor can describe.
    pub fn new(mapper: M, descriptor: B, max_len: usize) -> DpiResult<Self> {
        if descriptor.len() < DESCRIPTOR_LEN {
            return Err(DpiError::ResourceUnavailable(format!(
                "coherent buffer too small for a descriptor: {} bytes",
                descriptor.len()
            )));
        }
        if descriptor.device_addr() % 4 != 0 {
            return Err(DpiError::ResourceUnavailable(format!(
                "descriptor address {:#010x} not word aligned",
                descriptor.device_addr()
            )));
        }
        Ok(Self {
            mapper,
            descriptor,
            in_flight: None,
            max_len: max_len.min(MAX_BUFFER_LEN),
        })
    }

    /// Device-visible address of the descriptor.
    #[inline]
    pub fn descriptor_addr(&self) -> u32 {
        self.descriptor.device_addr()
    }

    /// True while a payload mapping is live.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Current descriptor contents.
    pub fn descriptor(&self) -> BufferDescriptor {
        let mut words = [0u32; DESCRIPTOR_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.descriptor.read_word(i);
        }
        BufferDescriptor::from_words(words)
    }

    /// Map `payload` and describe it. Returns the descriptor address to
    /// hand to [`kick`].
    ///
    /// Nothing is touched when the mapping fails.
    pub fn prepare(&mut self, payload: &[u8]) -> DpiResult<u32> {
        if payload.is_empty() {
            return Err(DpiError::InvalidArgument("empty payload".into()));
        }
        if payload.len() > self.max_len {
            return Err(DpiError::PayloadTooLarge {
                len: payload.len(),
                max: self.max_len,
            });
        }
        if self.in_flight.is_some() {
            return Err(DpiError::DeviceBusy);
        }

        let len = u32::try_from(payload.len()).map_err(|_| DpiError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_BUFFER_LEN,
        })?;

        let mapping = self.mapper.map_to_device(payload)?;
        let self_addr = self.descriptor.device_addr();
        let desc = BufferDescriptor::single_packet(self_addr, mapping.device_addr(), len);
        for (i, word) in desc.to_words().into_iter().enumerate() {
            self.descriptor.write_word(i, word);
        }
        log::debug!(
            "pushing payload into DPI hardware: addr={:#010x}, size={}",
            desc.phys,
            desc.len
        );
        self.in_flight = Some(mapping);
        Ok(self_addr)
    }

    /// Unmap the in-flight payload. Returns false when nothing was mapped.
    pub fn release(&mut self) -> bool {
        match self.in_flight.take() {
            Some(mapping) => {
                self.mapper.unmap(mapping);
                true
            }
            None => false,
        }
    }
}

impl<M: DmaMapper, B: CoherentMemory> Drop for DmaTransfer<M, B> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Write the DMA reset bit and poll for it to self-clear.
fn reset_and_wait<C: DcrIo + ?Sized>(channel: &C, config: &DpiConfig) -> bool {
    channel.dcr_write(DcrReg::DmaControl, DmaControl::RESET.bits());
    let cleared = || channel.dcr_read(DcrReg::DmaControl) & DmaControl::RESET.bits() == 0;
    for _ in 0..config.dma_reset_iterations {
        if cleared() {
            return true;
        }
        std::thread::sleep(config.dma_reset_interval);
    }
    cleared()
}

/// Reset the DMA engine and wait for the reset bit to self-clear.
pub fn reset_engine<C: DcrIo + ?Sized>(channel: &C, config: &DpiConfig) -> DpiResult<()> {
    if reset_and_wait(channel, config) {
        return Ok(());
    }
    log::error!("DMA reset timed out");
    Err(DpiError::ResourceUnavailable("DMA reset timed out".into()))
}

/// Re-enable the engine after a reset and point it at the descriptor.
pub fn start_engine<C: DcrIo + ?Sized>(channel: &C, descriptor_addr: u32, config: &DpiConfig) {
    channel.dcr_write(DcrReg::DmaControl, DmaControl::TAIL_ENABLE.bits());
    let ctrl = ChannelControl::with_coalescing(config.irq_delay_timeout, config.irq_coalesce_count);
    channel.dcr_write(DcrReg::ChannelControl, ctrl.bits());
    channel.dcr_write(DcrReg::CurDesc, descriptor_addr);
    log::info!("TX channel of DMA enabled, descriptor at {descriptor_addr:#010x}");
}

/// Reset the engine and leave it disabled. A reset that does not complete
/// is logged; the caller tears down regardless.
pub fn stop_engine<C: DcrIo + ?Sized>(channel: &C, config: &DpiConfig) {
    if reset_and_wait(channel, config) {
        log::info!("DMA disabled");
    } else {
        log::warn!("DMA reset timed out while disabling the engine");
    }
}

/// Start the transfer described at `descriptor_addr`.
#[inline]
pub fn kick<C: DcrIo + ?Sized>(channel: &C, descriptor_addr: u32) {
    channel.dcr_write(DcrReg::TailDesc, descriptor_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AppFlags;
    use crate::platform::Platform;
    use crate::sim::{SimCoherent, SimEvent, SimMapper, SimPlatform, DEFAULT_DCR};
    use std::time::Duration;

    fn transfer(sim: &SimPlatform) -> DmaTransfer<SimMapper, SimCoherent> {
        let mapper = sim.dma_mapper().unwrap();
        let coherent = sim.alloc_coherent(DESCRIPTOR_LEN).unwrap();
        DmaTransfer::new(mapper, coherent, 1500).unwrap()
    }

    #[test]
    fn test_prepare_fills_descriptor() {
        let sim = SimPlatform::new();
        let mut dma = transfer(&sim);
        let addr = dma.prepare(&[0xAB; 64]).unwrap();

        assert_eq!(addr, dma.descriptor_addr());
        let desc = dma.descriptor();
        assert_eq!(desc.next, addr);
        assert_eq!(desc.len, 64);
        assert_eq!(desc.flags(), AppFlags::SOP | AppFlags::EOP);
        assert_eq!(Some(desc.phys), sim.last_mapped_addr());
        assert_eq!(sim.mapped_payload(), Some(vec![0xAB; 64]));
        assert!(dma.is_mapped());
    }

    #[test]
    fn test_release_is_idempotent() {
        let sim = SimPlatform::new();
        let mut dma = transfer(&sim);
        assert!(!dma.release());
        dma.prepare(b"GET / HTTP/1.1").unwrap();
        assert!(dma.release());
        assert!(!dma.release());
        assert_eq!(sim.unmap_count(), 1);
    }

    #[test]
    fn test_prepare_rejects_second_payload() {
        let sim = SimPlatform::new();
        let mut dma = transfer(&sim);
        dma.prepare(&[1; 8]).unwrap();
        let before = dma.descriptor();
        assert!(matches!(dma.prepare(&[2; 16]), Err(DpiError::DeviceBusy)));
        assert_eq!(dma.descriptor(), before);
        assert_eq!(sim.map_count(), 1);
    }

    #[test]
    fn test_prepare_limits() {
        let sim = SimPlatform::new();
        let mut dma = transfer(&sim);
        assert!(matches!(dma.prepare(&[]), Err(DpiError::InvalidArgument(_))));
        assert!(matches!(
            dma.prepare(&[0; 1501]),
            Err(DpiError::PayloadTooLarge { len: 1501, max: 1500 })
        ));
        assert_eq!(sim.map_count(), 0);
    }

    #[test]
    fn test_limit_capped_at_descriptor_length() {
        let sim = SimPlatform::new();
        let mapper = sim.dma_mapper().unwrap();
        let coherent = sim.alloc_coherent(DESCRIPTOR_LEN).unwrap();
        let dma = DmaTransfer::new(mapper, coherent, usize::MAX).unwrap();
        assert_eq!(dma.max_len, MAX_BUFFER_LEN);
    }

    #[test]
    fn test_mapping_failure_leaves_descriptor_alone() {
        let sim = SimPlatform::new();
        let mut dma = transfer(&sim);
        sim.fail_next_map();
        assert!(matches!(dma.prepare(&[1; 8]), Err(DpiError::MappingFailure(_))));
        assert!(!dma.is_mapped());
        assert_eq!(dma.descriptor(), BufferDescriptor::new());
    }

    #[test]
    fn test_drop_unmaps() {
        let sim = SimPlatform::new();
        let mut dma = transfer(&sim);
        dma.prepare(&[1; 8]).unwrap();
        drop(dma);
        assert_eq!(sim.unmap_count(), 1);
        assert!(sim.events().contains(&SimEvent::FreeCoherent));
    }

    #[test]
    fn test_reset_and_start_engine() {
        let sim = SimPlatform::new();
        let channel = sim.open_channel(&DEFAULT_DCR).unwrap();
        let config = DpiConfig::default();
        reset_engine(&channel, &config).unwrap();
        start_engine(&channel, 0x4000, &config);

        assert_eq!(sim.dcr(DcrReg::DmaControl), DmaControl::TAIL_ENABLE.bits());
        assert_eq!(sim.dcr(DcrReg::ChannelControl), 0x0101_0283);
        assert_eq!(sim.dcr(DcrReg::CurDesc), 0x4000);
    }

    #[test]
    fn test_reset_engine_times_out() {
        let sim = SimPlatform::new();
        sim.set_dma_reset_stuck(true);
        let channel = sim.open_channel(&DEFAULT_DCR).unwrap();
        let config = DpiConfig::default().with_dma_reset_polling(Duration::from_micros(1), 5);
        assert!(matches!(
            reset_engine(&channel, &config),
            Err(DpiError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn test_stop_engine_tolerates_stuck_reset() {
        let sim = SimPlatform::new();
        sim.set_dma_reset_stuck(true);
        let channel = sim.open_channel(&DEFAULT_DCR).unwrap();
        let config = DpiConfig::default().with_dma_reset_polling(Duration::from_micros(1), 3);
        stop_engine(&channel, &config);
        assert_eq!(sim.dcr_writes(DcrReg::DmaControl), vec![DmaControl::RESET.bits()]);
    }

    #[test]
    fn test_kick_writes_tail() {
        let sim = SimPlatform::new();
        let channel = sim.open_channel(&DEFAULT_DCR).unwrap();
        kick(&channel, 0x4000);
        assert_eq!(sim.dcr(DcrReg::TailDesc), 0x4000);
    }
}
