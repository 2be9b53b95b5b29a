//! RTT step detector.
//!
//! Raw RTT samples are noisy; publishing every wiggle would churn the
//! adjacency metric across the whole area. The detector keeps a fast and a
//! slow sliding mean and reports a new baseline only when the fast mean
//! steps out of the threshold band around it.

use std::collections::VecDeque;

use crate::config::StepDetectorConfig;

#[derive(Debug)]
pub struct StepDetector {
    fast: VecDeque<u64>,
    slow: VecDeque<u64>,
    fast_size: usize,
    slow_size: usize,
    /// Deviations at or below this percentage tighten the baseline quietly.
    lower_threshold_pct: u64,
    /// Deviations at or above this percentage are reported immediately.
    upper_threshold_pct: u64,
    baseline_us: Option<u64>,
    quiet_samples: usize,
}

impl StepDetector {
    pub fn new(conf: &StepDetectorConfig) -> Self {
        StepDetector {
            fast: VecDeque::new(),
            slow: VecDeque::new(),
            fast_size: conf.fast_window_size as usize,
            slow_size: conf.slow_window_size as usize,
            lower_threshold_pct: conf.lower_threshold as u64,
            upper_threshold_pct: conf.upper_threshold as u64,
            baseline_us: None,
            quiet_samples: 0,
        }
    }

    /// Current smoothed RTT, if any samples were accepted.
    pub fn baseline_us(&self) -> Option<u64> {
        self.baseline_us
    }

    /// Feed one RTT sample; returns the new baseline when a step fires.
    pub fn add_sample(&mut self, rtt_us: u64) -> Option<u64> {
        push_bounded(&mut self.fast, rtt_us, self.fast_size);
        push_bounded(&mut self.slow, rtt_us, self.slow_size);

        let fast_mean = mean(&self.fast);
        let baseline = match self.baseline_us {
            None => {
                // first full fast window establishes the baseline
                if self.fast.len() < self.fast_size {
                    return None;
                }
                self.baseline_us = Some(fast_mean);
                return self.baseline_us;
            }
            Some(b) => b,
        };

        let deviation_pct = fast_mean.abs_diff(baseline) * 100 / baseline.max(1);
        if deviation_pct >= self.upper_threshold_pct {
            self.baseline_us = Some(fast_mean);
            self.quiet_samples = 0;
            return self.baseline_us;
        }
        if deviation_pct <= self.lower_threshold_pct {
            // long quiet stretch: track slow drift without reporting
            self.quiet_samples += 1;
            if self.quiet_samples >= self.slow_size {
                self.baseline_us = Some(mean(&self.slow));
                self.quiet_samples = 0;
            }
        } else {
            self.quiet_samples = 0;
        }
        None
    }
}

fn push_bounded(window: &mut VecDeque<u64>, value: u64, size: usize) {
    window.push_back(value);
    while window.len() > size {
        window.pop_front();
    }
}

fn mean(window: &VecDeque<u64>) -> u64 {
    if window.is_empty() {
        return 0;
    }
    window.iter().sum::<u64>() / window.len() as u64
}
