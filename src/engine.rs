// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! High-level DPI driver API.

use crate::config::DpiConfig;
use crate::device::DpiDevice;
use crate::error::{DpiError, DpiResult};
use crate::platform::{DeviceBinding, Platform};
use std::sync::{PoisonError, RwLock};

/// Name the driver registers under.
pub const DRIVER_NAME: &str = "dpi";

/// Driver version string.
pub const DRIVER_VERSION: &str = "1.0";

/// Driver front end used by the network stack.
///
/// `DpiDriver` holds at most one bound accelerator. Probing binds a device
/// described by a [`DeviceBinding`]; removing it detaches the device and
/// releases everything. The entry points fail with
/// [`DpiError::DeviceNotAttached`] while nothing is bound.
///
/// # Example
///
/// ```rust
/// use dpi_accel::sim::{default_binding, SimPlatform};
/// use dpi_accel::{DpiConfig, DpiDriver, DpiError};
///
/// fn main() -> Result<(), DpiError> {
///     let sim = SimPlatform::new();
///     let driver = DpiDriver::new(DpiConfig::default());
///     driver.probe(sim.clone(), &default_binding())?;
///
///     driver.submit_payload(b"GET /index.html HTTP/1.1\r\n")?;
///     sim.complete_transfer(0x18);
///     assert_eq!(driver.result_code(), 8);
///
///     driver.remove();
///     Ok(())
/// }
/// ```
pub struct DpiDriver<P: Platform> {
    config: DpiConfig,
    device: RwLock<Option<DpiDevice<P>>>,
}

impl<P: Platform> DpiDriver<P> {
    /// Create an unbound driver. Devices probed later use `config`.
    pub fn new(config: DpiConfig) -> Self {
        log::info!("{DRIVER_NAME} {DRIVER_VERSION} registered");
        Self {
            config,
            device: RwLock::new(None),
        }
    }

    /// Bind the accelerator described by `binding`.
    ///
    /// # Arguments
    ///
    /// * `platform` - Resource provider for the board
    /// * `binding` - Register region, interrupt line and DMA channel
    ///
    /// # Errors
    ///
    /// Returns an error if a device is already bound or any attach step
    /// fails; in the latter case nothing stays acquired.
    pub fn probe(&self, platform: P, binding: &DeviceBinding) -> DpiResult<()> {
        let mut slot = self.device.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(DpiError::ResourceUnavailable(format!(
                "{DRIVER_NAME} already bound"
            )));
        }
        *slot = Some(DpiDevice::attach(platform, binding, self.config.clone())?);
        Ok(())
    }

    /// Detach the bound device. Returns false when nothing was bound.
    pub fn remove(&self) -> bool {
        let device = self
            .device
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match device {
            Some(device) => {
                device.detach();
                true
            }
            None => false,
        }
    }

    /// True while a device is bound.
    pub fn is_bound(&self) -> bool {
        self.device
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn with_device<T>(&self, f: impl FnOnce(&DpiDevice<P>) -> DpiResult<T>) -> DpiResult<T> {
        let slot = self.device.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().ok_or(DpiError::DeviceNotAttached).and_then(f)
    }

    /// Reload the FSM filter table.
    pub fn reset_filter_table(&self) -> DpiResult<()> {
        self.with_device(DpiDevice::reset_filter_table)
    }

    /// Push a payload into the accelerator.
    ///
    /// # Errors
    ///
    /// See [`DpiDevice::submit_payload`].
    pub fn submit_payload(&self, payload: &[u8]) -> DpiResult<()> {
        self.with_device(|d| d.submit_payload(payload))
    }

    /// Fetch the result of the last submission.
    ///
    /// # Errors
    ///
    /// See [`DpiDevice::await_result`].
    pub fn get_filter_result(&self) -> DpiResult<u32> {
        self.with_device(DpiDevice::get_filter_result)
    }

    /// Fetch the result of the last submission as an integer code.
    ///
    /// Non-negative values are match bits; negative values are
    /// [`DpiError::code`] and mean no usable result.
    pub fn result_code(&self) -> i32 {
        match self.get_filter_result() {
            Ok(bits) => bits as i32,
            Err(e) => {
                log::debug!("no usable filter result: {e}");
                e.code()
            }
        }
    }
}

impl<P: Platform> Drop for DpiDriver<P> {
    fn drop(&mut self) {
        if self.remove() {
            log::info!("{DRIVER_NAME} {DRIVER_VERSION} unregistered with device bound");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Status;
    use crate::sim::{default_binding, SimEvent, SimPlatform, SimStep};

    #[test]
    fn test_unbound_driver() {
        let driver = DpiDriver::<SimPlatform>::new(DpiConfig::default());
        assert!(!driver.is_bound());
        assert!(matches!(
            driver.submit_payload(b"x"),
            Err(DpiError::DeviceNotAttached)
        ));
        assert!(matches!(
            driver.get_filter_result(),
            Err(DpiError::DeviceNotAttached)
        ));
        assert!(matches!(
            driver.reset_filter_table(),
            Err(DpiError::DeviceNotAttached)
        ));
        assert_eq!(driver.result_code(), DpiError::DeviceNotAttached.code());
        assert!(!driver.remove());
    }

    #[test]
    fn test_probe_and_remove() {
        let sim = SimPlatform::new();
        let driver = DpiDriver::new(DpiConfig::default());
        driver.probe(sim.clone(), &default_binding()).unwrap();
        assert!(driver.is_bound());
        assert!(driver.probe(sim.clone(), &default_binding()).is_err());

        assert!(driver.remove());
        assert!(!driver.is_bound());
        assert_eq!(sim.lifecycle().last(), Some(&SimEvent::ReleaseRegion));
        assert!(matches!(
            driver.submit_payload(b"x"),
            Err(DpiError::DeviceNotAttached)
        ));
    }

    #[test]
    fn test_failed_probe_leaves_driver_unbound() {
        let sim = SimPlatform::new();
        sim.fail_at(SimStep::OpenChannel);
        let driver = DpiDriver::new(DpiConfig::default());
        assert!(driver.probe(sim.clone(), &default_binding()).is_err());
        assert!(!driver.is_bound());
        driver.probe(sim, &default_binding()).unwrap();
    }

    #[test]
    fn test_result_codes() {
        let sim = SimPlatform::new();
        let driver = DpiDriver::new(DpiConfig::default());
        driver.probe(sim.clone(), &default_binding()).unwrap();

        assert_eq!(driver.result_code(), DpiError::NoResult.code());

        driver.submit_payload(b"match me").unwrap();
        sim.complete_transfer(0x18);
        assert_eq!(driver.result_code(), 8);

        driver.submit_payload(b"broken").unwrap();
        sim.complete_transfer(Status::ERROR.bits());
        assert!(driver.result_code() < 0);

        driver.submit_payload(b"slow").unwrap();
        assert_eq!(driver.result_code(), DpiError::Timeout { status: 0 }.code());
        driver.reset_filter_table().unwrap();
        sim.complete_transfer(Status::RESET_DONE.bits());
        driver.submit_payload(b"again").unwrap();
    }

    #[test]
    fn test_drop_removes_device() {
        let sim = SimPlatform::new();
        let driver = DpiDriver::new(DpiConfig::default());
        driver.probe(sim.clone(), &default_binding()).unwrap();
        drop(driver);
        assert!(!sim.irq_bound());
        assert_eq!(sim.lifecycle().last(), Some(&SimEvent::ReleaseRegion));
    }
}
