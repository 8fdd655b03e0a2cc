// DPI Accelerator Driver
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Driver tunables.

use crate::descriptor::MAX_BUFFER_LEN;
use std::time::Duration;

/// Default wait granularity while a result is pending.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(1);

/// Default number of wait intervals before a retrieval times out.
pub const DEFAULT_POLL_ITERATIONS: u32 = 1000;

/// Default poll granularity while the DMA engine resets.
pub const DEFAULT_DMA_RESET_INTERVAL: Duration = Duration::from_micros(1);

/// Default number of polls before a DMA reset is declared stuck.
pub const DEFAULT_DMA_RESET_ITERATIONS: u32 = 1000;

/// Default transfer limit for one payload.
pub const DEFAULT_MAX_TRANSFER_LEN: usize = 0xFFFF;

/// FSM dimensions written on a filter table reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmDimensions {
    pub states: u32,
    pub finals: u32,
}

impl Default for FsmDimensions {
    fn default() -> Self {
        Self {
            states: 5,
            finals: 1,
        }
    }
}

/// Configuration of one attached accelerator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpiConfig {
    pub poll_interval: Duration,
    pub poll_iterations: u32,
    pub dma_reset_interval: Duration,
    pub dma_reset_iterations: u32,
    pub max_transfer_len: usize,
    pub fsm: FsmDimensions,
    pub irq_coalesce_count: u8,
    pub irq_delay_timeout: u8,
    /// Also write the filter trigger bit on submission. Early bitstreams
    /// start filtering on DMA arrival and ignore it.
    pub filter_trigger: bool,
}

impl Default for DpiConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_iterations: DEFAULT_POLL_ITERATIONS,
            dma_reset_interval: DEFAULT_DMA_RESET_INTERVAL,
            dma_reset_iterations: DEFAULT_DMA_RESET_ITERATIONS,
            max_transfer_len: DEFAULT_MAX_TRANSFER_LEN,
            fsm: FsmDimensions::default(),
            irq_coalesce_count: 1,
            irq_delay_timeout: 1,
            filter_trigger: false,
        }
    }
}

impl DpiConfig {
    /// Bound on result retrieval: `poll_interval * poll_iterations`.
    pub fn result_timeout(&self) -> Duration {
        self.poll_interval.saturating_mul(self.poll_iterations)
    }

    /// Set the retrieval wait granularity and bound.
    pub fn with_polling(mut self, interval: Duration, iterations: u32) -> Self {
        self.poll_interval = interval;
        self.poll_iterations = iterations;
        self
    }

    /// Set the DMA reset poll granularity and bound.
    pub fn with_dma_reset_polling(mut self, interval: Duration, iterations: u32) -> Self {
        self.dma_reset_interval = interval;
        self.dma_reset_iterations = iterations;
        self
    }

    /// Set the payload transfer limit, capped at the descriptor length
    /// field.
    pub fn with_max_transfer_len(mut self, len: usize) -> Self {
        self.max_transfer_len = len.min(MAX_BUFFER_LEN);
        self
    }

    /// Set the FSM dimensions used by table resets.
    pub fn with_fsm(mut self, states: u32, finals: u32) -> Self {
        self.fsm = FsmDimensions { states, finals };
        self
    }

    /// Set the channel interrupt coalescing fields.
    pub fn with_irq_coalescing(mut self, delay_timeout: u8, count: u8) -> Self {
        self.irq_delay_timeout = delay_timeout;
        self.irq_coalesce_count = count;
        self
    }

    /// Enable or disable the filter trigger write.
    pub fn with_filter_trigger(mut self, enabled: bool) -> Self {
        self.filter_trigger = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_is_one_millisecond() {
        assert_eq!(DpiConfig::default().result_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn test_builders() {
        let config = DpiConfig::default()
            .with_polling(Duration::from_millis(1), 50)
            .with_max_transfer_len(1500)
            .with_fsm(12, 3)
            .with_irq_coalescing(4, 2);
        assert_eq!(config.result_timeout(), Duration::from_millis(50));
        assert_eq!(config.max_transfer_len, 1500);
        assert_eq!(config.fsm, FsmDimensions { states: 12, finals: 3 });
        assert_eq!((config.irq_delay_timeout, config.irq_coalesce_count), (4, 2));
        assert!(!config.filter_trigger);
    }

    #[test]
    fn test_transfer_len_capped() {
        let config = DpiConfig::default().with_max_transfer_len(usize::MAX);
        assert_eq!(config.max_transfer_len, u32::MAX as usize);
    }
}
