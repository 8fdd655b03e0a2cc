// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! TX channel interrupt service.

use crate::device::Shared;
use crate::platform::{IrqReturn, Platform};
use crate::regs::{ChannelStatus, DcrIo, DcrReg, RegisterIo};
use crate::state::DeviceState;

/// Service one interrupt of the DMA TX channel.
///
/// The pending bits are acknowledged first. A completed transfer resolves
/// the operation from the accelerator status register; a channel error
/// resolves it as failed. Anything else is not ours.
pub(crate) fn service<P: Platform>(shared: &Shared<P>) -> IrqReturn {
    if !shared.is_attached() {
        return IrqReturn::None;
    }

    let pending = shared.channel.dcr_read(DcrReg::IrqStatus);
    shared.channel.dcr_write(DcrReg::IrqStatus, pending);

    let channel = ChannelStatus::from_bits_retain(shared.channel.dcr_read(DcrReg::ChannelStatus));
    if channel.contains(ChannelStatus::COMPLETE) {
        let raw = shared.regs.status().bits();
        log::debug!("DPI status at TX interrupt: {raw:#010x}");
        let outcome = shared.update(|state| state.evaluate(raw));
        log::trace!("TX interrupt outcome: {outcome:?}");
        IrqReturn::Handled
    } else if channel.contains(ChannelStatus::ERROR) {
        log::error!(
            "DMA TX channel error: status={:#010x} irq={pending:#x}",
            channel.bits()
        );
        shared.update(DeviceState::fail);
        IrqReturn::Handled
    } else {
        log::trace!(
            "spurious TX interrupt: status={:#010x} irq={pending:#x}",
            channel.bits()
        );
        IrqReturn::None
    }
}

#[cfg(test)]
mod tests {
    use crate::config::DpiConfig;
    use crate::device::DpiDevice;
    use crate::platform::IrqReturn;
    use crate::regs::{ChannelStatus, DcrReg, Status};
    use crate::sim::{default_binding, SimPlatform};
    use crate::state::DeviceStatus;

    fn device(sim: &SimPlatform) -> DpiDevice<SimPlatform> {
        DpiDevice::attach(sim.clone(), &default_binding(), DpiConfig::default()).unwrap()
    }

    #[test]
    fn test_completion_while_idle_is_harmless() {
        let sim = SimPlatform::new();
        let dev = device(&sim);
        assert_eq!(sim.complete_transfer(0x18), Some(IrqReturn::Handled));
        assert_eq!(dev.status(), DeviceStatus::NotSet);
        assert_eq!(sim.unmap_count(), 0);
    }

    #[test]
    fn test_completion_wins_over_channel_error() {
        let sim = SimPlatform::new();
        let dev = device(&sim);
        dev.submit_payload(b"abc").unwrap();

        sim.set_status(Status::FILTER_DONE.bits());
        sim.set_dcr(
            DcrReg::ChannelStatus,
            (ChannelStatus::COMPLETE | ChannelStatus::ERROR).bits(),
        );
        assert_eq!(sim.raise_irq(), Some(IrqReturn::Handled));
        assert_eq!(dev.get_filter_result().unwrap(), 0);
    }

    #[test]
    fn test_all_pending_bits_are_acknowledged() {
        let sim = SimPlatform::new();
        let _dev = device(&sim);
        sim.set_dcr(DcrReg::IrqStatus, 0b111);
        sim.raise_irq();
        assert_eq!(sim.dcr(DcrReg::IrqStatus), 0);
        assert_eq!(sim.dcr_writes(DcrReg::IrqStatus), vec![0b111]);
    }
}
