//! Backend health state machine.
//!
//! # States
//! - Healthy: at least `threshold` of the last `window` probes succeeded
//! - Sick: otherwise
//!
//! # Design Decisions
//! - Sliding window of probe results prevents flapping
//! - `initial` probes are assumed good when the window is created
//! - The window is owned by the probe task; only the resulting bit is shared

use crate::config::ProbeConfig;

/// Sliding window of the most recent probe results, newest in bit 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeWindow {
    bits: u64,
    window: u32,
    threshold: u32,
}

impl ProbeWindow {
    /// `window` is clamped to 1..=64 and `initial` to the window size.
    pub fn new(window: u32, threshold: u32, initial: u32) -> Self {
        let window = window.clamp(1, 64);
        let initial = initial.min(window);
        let bits = if initial == 64 { u64::MAX } else { (1u64 << initial) - 1 };
        Self {
            bits,
            window,
            threshold,
        }
    }

    pub fn from_config(config: &ProbeConfig) -> Self {
        Self::new(config.window, config.threshold, config.initial)
    }

    fn mask(&self) -> u64 {
        if self.window == 64 {
            u64::MAX
        } else {
            (1u64 << self.window) - 1
        }
    }

    /// Push a probe result into the window.
    pub fn record(&mut self, success: bool) {
        self.bits = ((self.bits << 1) | u64::from(success)) & self.mask();
    }

    /// Good probes currently inside the window.
    pub fn good(&self) -> u32 {
        self.bits.count_ones()
    }

    pub fn is_healthy(&self) -> bool {
        self.good() >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_assumption() {
        assert!(ProbeWindow::new(8, 3, 3).is_healthy());
        assert!(!ProbeWindow::new(8, 3, 2).is_healthy());
        assert_eq!(ProbeWindow::new(8, 3, 20).good(), 8);
    }

    #[test]
    fn test_becomes_sick_after_failures_leave_window() {
        let mut window = ProbeWindow::new(4, 3, 4);
        window.record(false);
        assert!(window.is_healthy());
        window.record(false);
        assert!(!window.is_healthy());
    }

    #[test]
    fn test_recovers_after_threshold_successes() {
        let mut window = ProbeWindow::new(8, 3, 0);
        window.record(true);
        window.record(true);
        assert!(!window.is_healthy());
        window.record(true);
        assert!(window.is_healthy());
    }

    #[test]
    fn test_old_results_slide_out() {
        let mut window = ProbeWindow::new(3, 1, 0);
        window.record(true);
        window.record(false);
        window.record(false);
        assert!(window.is_healthy());
        window.record(false);
        assert!(!window.is_healthy());
    }

    #[test]
    fn test_full_width_window() {
        let mut window = ProbeWindow::new(64, 64, 64);
        assert!(window.is_healthy());
        window.record(false);
        assert!(!window.is_healthy());
        assert_eq!(window.good(), 63);
    }
}
