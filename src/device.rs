// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Attached accelerator handle.
//!
//! [`DpiDevice::attach`] acquires every resource of a [`DeviceBinding`] in a
//! fixed order and unwinds what it already holds when a later step fails:
//!
//! 1. reserve the register region
//! 2. map the register region
//! 3. open the DMA channel's DCR accessors
//! 4. bind the interrupt handler
//! 5. allocate the coherent descriptor, reset and program the DMA engine
//!
//! Detaching releases them in reverse; the DMA engine is quiesced before its
//! descriptor memory is freed.
//!
//! # Concurrency
//!
//! The device state and the DMA transfer live behind one mutex shared with
//! the interrupt handler. Submissions are rejected while an operation is in
//! flight; callers waiting for a result sleep on a condition variable the
//! handler signals.

use crate::config::DpiConfig;
use crate::descriptor::DESCRIPTOR_LEN;
use crate::dma::{self, DmaTransfer};
use crate::engine::{DRIVER_NAME, DRIVER_VERSION};
use crate::error::{DpiError, DpiResult};
use crate::irq;
use crate::platform::{DeviceBinding, IrqHandler, IrqLine, IrqReturn, Platform};
use crate::regs::{Control, RegisterIo, REG_CONTROL, REG_NUM_FINALS, REG_NUM_STATES};
use crate::state::{DeviceState, DeviceStatus, Operation, Outcome};
use scopeguard::ScopeGuard;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// State shared with the interrupt handler.
pub(crate) struct Core<P: Platform> {
    pub(crate) state: DeviceState,
    pub(crate) dma: Option<DmaTransfer<P::Mapper, P::Coherent>>,
}

/// Hardware accessors plus the guarded core.
///
/// Field order is drop order: the channel is closed before the register
/// block is unmapped.
pub(crate) struct Shared<P: Platform> {
    pub(crate) channel: P::Channel,
    pub(crate) regs: P::Regs,
    core: Mutex<Core<P>>,
    ready: Condvar,
    attached: AtomicBool,
    #[cfg(feature = "async")]
    notify: tokio::sync::Notify,
}

impl<P: Platform> Shared<P> {
    fn new(channel: P::Channel, regs: P::Regs) -> Self {
        Self {
            channel,
            regs,
            core: Mutex::new(Core {
                state: DeviceState::new(),
                dma: None,
            }),
            ready: Condvar::new(),
            attached: AtomicBool::new(true),
            #[cfg(feature = "async")]
            notify: tokio::sync::Notify::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Core<P>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Apply `f` to the state; a payload mapping is torn down as soon as
    /// its transfer is over. Waiters are woken afterwards.
    pub(crate) fn update(&self, f: impl FnOnce(&mut DeviceState) -> Outcome) -> Outcome {
        let outcome = {
            let mut core = self.lock();
            let outcome = f(&mut core.state);
            if outcome.releases_mapping() {
                if let Some(dma) = core.dma.as_mut() {
                    dma.release();
                }
            }
            outcome
        };
        self.wake();
        outcome
    }

    fn wake(&self) {
        self.ready.notify_all();
        #[cfg(feature = "async")]
        self.notify.notify_waiters();
    }

    /// Timeout bookkeeping, called with the lock held.
    fn timed_out(&self, core: &mut Core<P>) -> DpiError {
        let status = self.regs.status().bits();
        log::info!("timeout in fetching filter result from driver");
        log::debug!("DPI status register at timeout: {status:#010x}");
        core.state.stall();
        DpiError::Timeout { status }
    }
}

fn step<T>(what: &str, result: DpiResult<T>) -> DpiResult<T> {
    result.map_err(|e| {
        log::error!("{what} failed: {e}. aborting attach");
        e
    })
}

/// One attached accelerator.
///
/// Dropping the handle detaches the device.
pub struct DpiDevice<P: Platform> {
    platform: P,
    irq: IrqLine,
    config: DpiConfig,
    shared: Option<Arc<Shared<P>>>,
    region: Option<P::Region>,
}

impl<P: Platform> DpiDevice<P> {
    /// Acquire all resources of `binding` and bring the DMA engine up.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error; everything acquired before it
    /// has been released again.
    pub fn attach(platform: P, binding: &DeviceBinding, config: DpiConfig) -> DpiResult<Self> {
        binding.validate()?;
        log::info!(
            "probing DPI device at {:#010x} size {:#x}",
            binding.region.start,
            binding.region.len()
        );

        let region = step("reserving memory region", platform.reserve_region(&binding.region))?;
        let regs = step("re-mapping memory region", platform.map_region(&binding.region))?;
        let channel = step("mapping DMA registers", platform.open_channel(&binding.dma_channel))?;
        let shared = Arc::new(Shared::<P>::new(channel, regs));

        let weak = Arc::downgrade(&shared);
        let handler: IrqHandler = Arc::new(move || match weak.upgrade() {
            Some(shared) => irq::service(&shared),
            None => IrqReturn::None,
        });
        let line = binding.irq;
        step("requesting interrupt", platform.request_irq(line, handler))?;
        let irq_guard = scopeguard::guard(&platform, move |p| p.free_irq(line));

        let transfer = step(
            "initializing DMA buffer descriptor",
            Self::init_dma(&platform, &shared, &config),
        )?;
        shared.lock().dma = Some(transfer);
        ScopeGuard::into_inner(irq_guard);

        log::info!("{DRIVER_NAME} {DRIVER_VERSION} initialized on {line}");
        Ok(Self {
            platform,
            irq: line,
            config,
            shared: Some(shared),
            region: Some(region),
        })
    }

    fn init_dma(
        platform: &P,
        shared: &Shared<P>,
        config: &DpiConfig,
    ) -> DpiResult<DmaTransfer<P::Mapper, P::Coherent>> {
        let coherent = platform.alloc_coherent(DESCRIPTOR_LEN)?;
        let transfer = DmaTransfer::new(platform.dma_mapper()?, coherent, config.max_transfer_len)?;
        dma::reset_engine(&shared.channel, config)?;
        dma::start_engine(&shared.channel, transfer.descriptor_addr(), config);
        Ok(transfer)
    }

    /// Release every resource in reverse acquisition order.
    pub fn detach(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.attached.store(false, Ordering::Release);
        {
            let mut core = shared.lock();
            dma::stop_engine(&shared.channel, &self.config);
            if let Some(mut transfer) = core.dma.take() {
                if transfer.release() {
                    log::warn!("payload still mapped at detach");
                }
            }
            core.state.clear();
        }
        shared.wake();
        self.platform.free_irq(self.irq);
        drop(shared);
        drop(self.region.take());
        log::info!("{DRIVER_NAME} {DRIVER_VERSION} removed");
    }

    fn shared(&self) -> DpiResult<&Arc<Shared<P>>> {
        match &self.shared {
            Some(shared) if shared.is_attached() => Ok(shared),
            _ => Err(DpiError::DeviceNotAttached),
        }
    }

    /// Configuration the device was attached with.
    pub fn config(&self) -> &DpiConfig {
        &self.config
    }

    /// Current state machine status.
    pub fn status(&self) -> DeviceStatus {
        self.shared()
            .map_or(DeviceStatus::NotSet, |s| s.lock().state.status())
    }

    /// True after a retrieval timed out and before a table reset completed.
    pub fn is_stalled(&self) -> bool {
        self.shared().is_ok_and(|s| s.lock().state.is_stalled())
    }

    /// Push a payload into the accelerator.
    ///
    /// The payload is staged in device-visible memory; the slice is not
    /// borrowed past the return. The match result arrives asynchronously and
    /// is fetched with [`get_filter_result`](Self::get_filter_result).
    ///
    /// # Errors
    ///
    /// `DeviceBusy` while another operation is in flight, `ResetRequired`
    /// after a retrieval timeout, `MappingFailure` when the payload cannot be
    /// made device-visible. The device state is unchanged on error.
    pub fn submit_payload(&self, payload: &[u8]) -> DpiResult<()> {
        let shared = self.shared()?;
        let descriptor_addr = {
            let mut guard = shared.lock();
            let core = &mut *guard;
            if let Err(e) = core.state.can_submit() {
                log::warn!("payload rejected: {e}");
                return Err(e);
            }
            let transfer = core.dma.as_mut().ok_or(DpiError::DeviceNotAttached)?;
            let addr = transfer.prepare(payload)?;
            core.state.begin(Operation::Filter);
            addr
        };

        if self.config.filter_trigger {
            shared.regs.write32(REG_CONTROL, Control::FILTER.bits());
        }
        dma::kick(&shared.channel, descriptor_addr);
        Ok(())
    }

    /// Fetch the result of the last submission, waiting up to the
    /// configured bound.
    pub fn get_filter_result(&self) -> DpiResult<u32> {
        self.await_result(self.config.result_timeout())
    }

    /// Fetch the result of the last submission, waiting up to `timeout`.
    ///
    /// Returns the match bits of the accelerator status (zero for no match).
    ///
    /// # Errors
    ///
    /// - `NoResult` when nothing is pending.
    /// - `HardwareError` when the accelerator or the DMA channel failed.
    /// - `Timeout` when no completion arrived in time. The device then stays
    ///   busy and refuses payloads until [`reset_filter_table`] completes.
    ///
    /// [`reset_filter_table`]: Self::reset_filter_table
    pub fn await_result(&self, timeout: Duration) -> DpiResult<u32> {
        let shared = self.shared()?;
        log::debug!("fetching the filter result from driver");

        let core = shared.lock();
        let (mut core, _) = shared
            .ready
            .wait_timeout_while(core, timeout, |c| c.state.status() == DeviceStatus::Busy)
            .unwrap_or_else(PoisonError::into_inner);

        if core.state.status() == DeviceStatus::Busy {
            return Err(shared.timed_out(&mut core));
        }
        core.state.consume()
    }

    /// Async variant of [`get_filter_result`](Self::get_filter_result).
    #[cfg(feature = "async")]
    pub async fn get_filter_result_async(&self) -> DpiResult<u32> {
        let shared = Arc::clone(self.shared()?);
        let deadline = tokio::time::Instant::now() + self.config.result_timeout();
        loop {
            let mut notified = std::pin::pin!(shared.notify.notified());
            notified.as_mut().enable();
            {
                let mut core = shared.lock();
                if core.state.status() != DeviceStatus::Busy {
                    return core.state.consume();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut core = shared.lock();
                if core.state.status() != DeviceStatus::Busy {
                    return core.state.consume();
                }
                return Err(shared.timed_out(&mut core));
            }
        }
    }

    /// Submit `payload` and wait for its result.
    pub fn inspect(&self, payload: &[u8]) -> DpiResult<u32> {
        self.submit_payload(payload)?;
        self.get_filter_result()
    }

    /// Reload the FSM filter table.
    ///
    /// Returns once the reload is started; completion is reported by the
    /// interrupt path and moves the device back to idle. This is also the
    /// recovery step after a retrieval timeout.
    pub fn reset_filter_table(&self) -> DpiResult<()> {
        let shared = self.shared()?;
        {
            let mut core = shared.lock();
            core.state.can_reset()?;
            core.state.begin(Operation::TableReset);
        }

        let fsm = self.config.fsm;
        log::info!(
            "filter table on DPI hardware is being reset ({} states, {} finals)",
            fsm.states,
            fsm.finals
        );
        shared.regs.write32(REG_NUM_STATES, fsm.states);
        shared.regs.write32(REG_NUM_FINALS, fsm.finals);
        shared.regs.write32(REG_CONTROL, Control::RESET.bits());
        Ok(())
    }
}

impl<P: Platform> Drop for DpiDevice<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: Platform> std::fmt::Debug for DpiDevice<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("DpiDevice");
        s.field("irq", &self.irq);
        match self.shared() {
            Ok(shared) => {
                let core = shared.lock();
                s.field("status", &core.state.status())
                    .field("operation", &core.state.operation())
                    .field("stalled", &core.state.is_stalled())
                    .field("mapped", &core.dma.as_ref().is_some_and(DmaTransfer::is_mapped));
            }
            Err(_) => {
                s.field("status", &DeviceStatus::NotSet);
            }
        }
        s.finish()
    }
}
