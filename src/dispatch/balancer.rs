//! Admission controller - adaptive assignment of messages to priority groups
//!
//! Every group `i` is entitled to a share proportional to `1/(i+1)`, so group 0
//! gets the largest slice. The observed share of processed messages is compared
//! against that target; the per-group error drives a PID controller whose
//! outputs become sampling probabilities through a softmax. Under-served groups
//! get boosted, over-served groups get suppressed.

use crate::core::config::BalancerConfig;
use crate::core::{Error, Result};
use crate::dispatch::pid::Pid;

pub struct LoadBalancer {
    counts: Vec<f64>,
    targets: Vec<f64>,
    pid: Pid,
    threshold: f64,
    initial_threshold: f64,
    growth_rate: f64,
}

impl LoadBalancer {
    pub fn new(groups: usize, config: &BalancerConfig) -> Self {
        let groups = groups.max(1);
        let raw: Vec<f64> = (0..groups).map(|i| 1.0 / (i as f64 + 1.0)).collect();
        let total: f64 = raw.iter().sum();

        Self {
            counts: vec![0.0; groups],
            targets: raw.iter().map(|r| r / total).collect(),
            pid: Pid::new(groups, config),
            threshold: config.event_threshold,
            initial_threshold: config.event_threshold,
            growth_rate: config.threshold_growth_rate,
        }
    }

    pub fn groups(&self) -> usize {
        self.counts.len()
    }

    /// Normalized target share per group.
    pub fn target_shares(&self) -> &[f64] {
        &self.targets
    }

    /// Observed share per group; all zeros before the first registration.
    pub fn shares(&self) -> Vec<f64> {
        let total: f64 = self.counts.iter().sum();
        if total == 0.0 {
            return vec![0.0; self.counts.len()];
        }
        self.counts.iter().map(|c| c / total).collect()
    }

    /// Records a message admitted to `group`.
    pub fn register_event(&mut self, group: usize) -> Result<()> {
        if group >= self.counts.len() {
            return Err(Error::InvalidPriorityGroup(group, self.counts.len()));
        }

        self.counts[group] += 1.0;

        let max = self.counts.iter().cloned().fold(0.0, f64::max);
        if max > self.threshold {
            self.counts.iter_mut().for_each(|c| *c *= 0.5);
        }

        self.threshold = (self.threshold * self.growth_rate).max(self.initial_threshold);
        Ok(())
    }

    pub fn determine_priority_group(&mut self, priority: u8) -> usize {
        self.determine_with(priority, rand::random::<f64>())
    }

    /// `draw` is a uniform sample in `[0, 1)`.
    fn determine_with(&mut self, priority: u8, draw: f64) -> usize {
        let total: f64 = self.counts.iter().sum();
        if total == 0.0 {
            return (priority.saturating_sub(1) as usize).min(self.counts.len() - 1);
        }

        let errors: Vec<f64> = self
            .targets
            .iter()
            .zip(&self.counts)
            .map(|(target, count)| target - count / total)
            .collect();

        let control = self.pid.update(&errors);
        weighted_index(&softmax(&control), draw)
    }
}

pub(crate) fn softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Index drawn proportionally to `weights` (need not be normalized).
pub(crate) fn weighted_index(weights: &[f64], draw: f64) -> usize {
    let total: f64 = weights.iter().sum();
    let target = draw * total;
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if target < acc {
            return i;
        }
    }
    weights.len().saturating_sub(1)
}
