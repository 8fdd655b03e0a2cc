// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # DPI accelerator driver
//!
//! Driver for an FPGA string-matching accelerator used for deep packet
//! inspection. Packet payloads are pushed into the accelerator through a
//! companion DMA channel; the accelerator runs them through a finite state
//! machine and reports the match decision in its status register.
//!
//! ## Operations
//!
//! - Payload submission over DMA
//! - Interrupt-driven result collection with bounded-wait retrieval
//! - FSM filter table reset
//! - Attach and detach with full rollback
//!
//! ## Platform Support
//!
//! | Platform | Backend | Notes |
//! |----------|---------|-------|
//! | Linux    | [`linux::LinuxPlatform`] | `/dev/mem`, UIO and u-dma-buf |
//! | Any      | [`sim::SimPlatform`] | Simulated device for tests and demos |
//!
//! ## Example
//!
//! ```rust
//! use dpi_accel::sim::{default_binding, SimPlatform};
//! use dpi_accel::{DpiConfig, DpiDevice, DpiError};
//!
//! fn main() -> Result<(), DpiError> {
//!     let sim = SimPlatform::new();
//!     let device = DpiDevice::attach(sim.clone(), &default_binding(), DpiConfig::default())?;
//!
//!     device.submit_payload(b"GET /index.html HTTP/1.1\r\n")?;
//!     // The simulated accelerator finishes with a match.
//!     sim.complete_transfer(0x18);
//!
//!     let result = device.get_filter_result()?;
//!     println!("match bits: {result:#x}");
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `async`: adds [`DpiDevice::get_filter_result_async`] on top of tokio.

// Module declarations
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dma;
pub mod engine;
pub mod error;
mod irq;
pub mod platform;
pub mod regs;
pub mod sim;
pub mod state;

#[cfg(target_os = "linux")]
pub mod linux;

// Re-exports for convenient access
pub use config::{DpiConfig, FsmDimensions};
pub use descriptor::{AppFlags, BufferDescriptor};
pub use device::DpiDevice;
pub use engine::{DpiDriver, DRIVER_NAME, DRIVER_VERSION};
pub use error::{DpiError, DpiResult};
pub use platform::{DeviceBinding, IrqLine, MemRegion, Platform, COMPATIBLE};
pub use state::DeviceStatus;
