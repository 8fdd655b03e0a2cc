// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device state machine.
//!
//! ```text
//!            submit / reset            completion irq
//!   NotSet ------------------> Busy -------------------> ReadReady
//!     ^                         |                            |
//!     |   reset done, or        |                            |
//!     +--- unrecognized status -+                            |
//!     |        (fail-open)                                   |
//!     +------------------------ result consumed -------------+
//! ```
//!
//! `DeviceState` is plain data; the device keeps it behind a mutex shared
//! with the interrupt handler.

use crate::error::{DpiError, DpiResult};
use crate::regs::Status;

/// What the accelerator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Idle, no pending or unread result.
    NotSet,
    /// An operation is in flight.
    Busy,
    /// A result is available and unread.
    ReadReady,
}

/// Operation that moved the device to [`DeviceStatus::Busy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Payload filtering.
    Filter,
    /// FSM filter table reload.
    TableReset,
}

/// Result of evaluating an accelerator status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The accelerator still reports busy; nothing changed.
    StillBusy,
    /// Table reset finished; back to idle.
    ResetDone,
    /// Filtering finished; `result` holds the match bits.
    Filtered { result: i32 },
    /// The operation failed; a negative result is ready.
    Failed,
    /// Unrecognized status; resolved to no-match and back to idle.
    Unrecognized,
    /// A filter completion arrived during a table reset. It belongs to the
    /// transfer the reset is recovering from; the reset is still pending.
    StaleFilter,
    /// No operation was in flight; the status was ignored.
    Ignored,
}

impl Outcome {
    /// True when the device left `Busy`.
    pub fn leaves_busy(&self) -> bool {
        !matches!(self, Self::StillBusy | Self::StaleFilter | Self::Ignored)
    }

    /// True when the payload transfer is over and its mapping must go.
    pub fn releases_mapping(&self) -> bool {
        self.leaves_busy() || *self == Self::StaleFilter
    }
}

/// Value of `last_result` for no-match or error.
pub const NO_MATCH: i32 = -1;

/// Status and last result of one accelerator.
#[derive(Debug, Clone)]
pub struct DeviceState {
    status: DeviceStatus,
    operation: Option<Operation>,
    last_result: i32,
    last_status: u32,
    stalled: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceState {
    pub const fn new() -> Self {
        Self {
            status: DeviceStatus::NotSet,
            operation: None,
            last_result: NO_MATCH,
            last_status: 0,
            stalled: false,
        }
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn operation(&self) -> Option<Operation> {
        self.operation
    }

    /// Last result; meaningful only while `ReadReady`.
    pub fn last_result(&self) -> i32 {
        self.last_result
    }

    /// True after a retrieval timeout until a table reset completes.
    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    /// Check that a payload may be submitted. An unread result must be
    /// fetched first.
    pub fn can_submit(&self) -> DpiResult<()> {
        if self.stalled {
            return Err(DpiError::ResetRequired);
        }
        match self.status {
            DeviceStatus::NotSet => Ok(()),
            DeviceStatus::Busy | DeviceStatus::ReadReady => Err(DpiError::DeviceBusy),
        }
    }

    /// Check that a table reset may be started. A stalled device always
    /// accepts one.
    pub fn can_reset(&self) -> DpiResult<()> {
        if self.stalled {
            return Ok(());
        }
        match self.status {
            DeviceStatus::NotSet => Ok(()),
            DeviceStatus::Busy | DeviceStatus::ReadReady => Err(DpiError::DeviceBusy),
        }
    }

    /// `NotSet` -> `Busy`. On the stalled recovery path an unread result
    /// is dropped.
    ///
    /// Callers check [`can_submit`](Self::can_submit) or
    /// [`can_reset`](Self::can_reset) first.
    pub fn begin(&mut self, operation: Operation) {
        if self.status == DeviceStatus::ReadReady {
            log::warn!(
                "discarding unread filter result {} for new {:?}",
                self.last_result,
                operation
            );
        }
        self.status = DeviceStatus::Busy;
        self.operation = Some(operation);
    }

    /// Apply an accelerator status value read at completion.
    pub fn evaluate(&mut self, raw: u32) -> Outcome {
        if self.status != DeviceStatus::Busy {
            return Outcome::Ignored;
        }

        let status = Status::from_bits_retain(raw);
        if status.contains(Status::BUSY) {
            log::info!("device is busy, result of last operation cannot be fetched yet");
            return Outcome::StillBusy;
        }

        self.last_status = raw;
        if status.contains(Status::RESET_DONE) {
            log::info!("filter table reset on DPI hardware completed");
            self.finish(DeviceStatus::NotSet);
            self.stalled = false;
            Outcome::ResetDone
        } else if status.contains(Status::ERROR) {
            log::info!("error in the last operation on device: status={raw:#010x}");
            self.last_result = NO_MATCH;
            self.finish(DeviceStatus::ReadReady);
            Outcome::Failed
        } else if status.contains(Status::FILTER_DONE)
            && self.operation == Some(Operation::TableReset)
        {
            log::info!("late filter completion during table reset: status={raw:#010x}");
            Outcome::StaleFilter
        } else if status.contains(Status::FILTER_DONE) {
            let result = (status & Status::MATCH).bits() as i32;
            log::debug!("accelerator match decision: {}", result > 0);
            self.last_result = result;
            self.finish(DeviceStatus::ReadReady);
            Outcome::Filtered { result }
        } else {
            log::info!("unrecognized DPI decision (status={raw:#010x}), allowing packet");
            self.last_result = NO_MATCH;
            self.finish(DeviceStatus::NotSet);
            Outcome::Unrecognized
        }
    }

    /// Force the error outcome without consulting the accelerator, used when
    /// the DMA transfer itself failed.
    pub fn fail(&mut self) -> Outcome {
        self.evaluate(Status::ERROR.bits())
    }

    /// `ReadReady` -> `NotSet`, returning the result.
    pub fn consume(&mut self) -> DpiResult<u32> {
        match self.status {
            DeviceStatus::ReadReady => {
                self.status = DeviceStatus::NotSet;
                if self.last_result < 0 {
                    Err(DpiError::HardwareError {
                        status: self.last_status,
                    })
                } else {
                    Ok(self.last_result as u32)
                }
            }
            DeviceStatus::NotSet => Err(DpiError::NoResult),
            DeviceStatus::Busy => Err(DpiError::DeviceBusy),
        }
    }

    /// Record a retrieval timeout. The device stays `Busy` and refuses new
    /// payloads until a table reset completes.
    pub fn stall(&mut self) {
        if self.status == DeviceStatus::Busy {
            self.stalled = true;
        }
    }

    /// Drop everything, used at detach.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    fn finish(&mut self, status: DeviceStatus) {
        self.status = status;
        self.operation = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy(op: Operation) -> DeviceState {
        let mut state = DeviceState::new();
        state.begin(op);
        state
    }

    #[test]
    fn test_initial_state() {
        let state = DeviceState::new();
        assert_eq!(state.status(), DeviceStatus::NotSet);
        assert!(state.can_submit().is_ok());
        assert!(matches!(
            DeviceState::new().consume(),
            Err(DpiError::NoResult)
        ));
    }

    #[test]
    fn test_filter_match() {
        let mut state = busy(Operation::Filter);
        assert_eq!(
            state.evaluate(0x18),
            Outcome::Filtered {
                result: Status::MATCH.bits() as i32
            }
        );
        assert_eq!(state.status(), DeviceStatus::ReadReady);
        assert!(state.last_result() >= 0);
        assert_eq!(state.consume().unwrap(), Status::MATCH.bits());
        assert_eq!(state.status(), DeviceStatus::NotSet);
    }

    #[test]
    fn test_filter_no_match_is_zero() {
        let mut state = busy(Operation::Filter);
        state.evaluate(Status::FILTER_DONE.bits());
        assert_eq!(state.consume().unwrap(), 0);
    }

    #[test]
    fn test_error_wins_over_match() {
        let mut state = busy(Operation::Filter);
        let raw = (Status::FILTER_DONE | Status::MATCH | Status::ERROR).bits();
        assert_eq!(state.evaluate(raw), Outcome::Failed);
        assert!(state.last_result() < 0);
        assert!(matches!(
            state.consume(),
            Err(DpiError::HardwareError { status }) if status == raw
        ));
    }

    #[test]
    fn test_unrecognized_fails_open() {
        let mut state = busy(Operation::Filter);
        assert_eq!(state.evaluate(0x01), Outcome::Unrecognized);
        assert_eq!(state.status(), DeviceStatus::NotSet);
        assert!(state.last_result() < 0);
        assert!(matches!(state.consume(), Err(DpiError::NoResult)));
    }

    #[test]
    fn test_busy_bit_keeps_state() {
        let mut state = busy(Operation::Filter);
        let raw = (Status::BUSY | Status::FILTER_DONE).bits();
        assert_eq!(state.evaluate(raw), Outcome::StillBusy);
        assert_eq!(state.status(), DeviceStatus::Busy);
    }

    #[test]
    fn test_reset_done_keeps_last_result() {
        let mut state = busy(Operation::Filter);
        state.evaluate(0x18);
        state.consume().unwrap();

        state.begin(Operation::TableReset);
        assert_eq!(state.evaluate(Status::RESET_DONE.bits()), Outcome::ResetDone);
        assert_eq!(state.status(), DeviceStatus::NotSet);
        assert_eq!(state.last_result(), Status::MATCH.bits() as i32);
    }

    #[test]
    fn test_idle_ignores_status() {
        let mut state = DeviceState::new();
        assert_eq!(state.evaluate(0x18), Outcome::Ignored);
        assert_eq!(state.status(), DeviceStatus::NotSet);
    }

    #[test]
    fn test_submit_while_busy_rejected() {
        let state = busy(Operation::Filter);
        assert!(matches!(state.can_submit(), Err(DpiError::DeviceBusy)));
        assert!(matches!(state.can_reset(), Err(DpiError::DeviceBusy)));
    }

    #[test]
    fn test_stall_requires_reset() {
        let mut state = busy(Operation::Filter);
        state.stall();
        assert!(state.is_stalled());
        assert_eq!(state.status(), DeviceStatus::Busy);
        assert!(matches!(state.can_submit(), Err(DpiError::ResetRequired)));
        assert!(state.can_reset().is_ok());

        state.begin(Operation::TableReset);
        state.evaluate(Status::RESET_DONE.bits());
        assert!(!state.is_stalled());
        assert!(state.can_submit().is_ok());
    }

    #[test]
    fn test_stall_ignored_when_idle() {
        let mut state = DeviceState::new();
        state.stall();
        assert!(!state.is_stalled());
    }

    #[test]
    fn test_fail_forces_error() {
        let mut state = busy(Operation::Filter);
        assert_eq!(state.fail(), Outcome::Failed);
        assert!(matches!(state.consume(), Err(DpiError::HardwareError { .. })));
    }

    #[test]
    fn test_unread_result_blocks_new_operations() {
        let mut state = busy(Operation::Filter);
        state.evaluate(0x18);
        assert!(matches!(state.can_submit(), Err(DpiError::DeviceBusy)));
        assert!(matches!(state.can_reset(), Err(DpiError::DeviceBusy)));
        state.consume().unwrap();
        assert!(state.can_submit().is_ok());
        assert!(state.can_reset().is_ok());
    }

    #[test]
    fn test_filter_done_does_not_end_table_reset() {
        let mut state = busy(Operation::Filter);
        state.stall();
        state.begin(Operation::TableReset);

        assert_eq!(state.evaluate(0x18), Outcome::StaleFilter);
        assert_eq!(state.status(), DeviceStatus::Busy);
        assert_eq!(state.operation(), Some(Operation::TableReset));
        assert!(state.is_stalled());

        assert_eq!(state.evaluate(Status::RESET_DONE.bits()), Outcome::ResetDone);
        assert!(!state.is_stalled());
        assert!(state.can_submit().is_ok());
    }

    #[test]
    fn test_outcome_leaves_busy() {
        assert!(!Outcome::StillBusy.leaves_busy());
        assert!(!Outcome::Ignored.leaves_busy());
        assert!(Outcome::Failed.leaves_busy());
        assert!(Outcome::Unrecognized.leaves_busy());
        assert!(Outcome::ResetDone.leaves_busy());
        assert!(!Outcome::StaleFilter.leaves_busy());
        assert!(Outcome::StaleFilter.releases_mapping());
        assert!(!Outcome::Ignored.releases_mapping());
    }
}
