//! Weighted, monotonic progress reporting.
//!
//! A run's progress is split across its stages by weight; within a stage,
//! [`WeightedUnits`] turns completed sub-units (tracks, batches, frames) into
//! a fraction weighted by their cost.

use parking_lot::Mutex;

/// Sender for reporting progress from within a run.
///
/// Wraps a callback that receives the overall percentage (0.0 -- 100.0) and
/// the current stage name.
pub struct ProgressSender {
    callback: Box<dyn Fn(f32, &str) + Send + Sync>,
}

impl ProgressSender {
    /// Create a new sender from the given callback.
    pub fn new(callback: impl Fn(f32, &str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Create a no-op sender that discards all progress reports.
    pub fn noop() -> Self {
        Self {
            callback: Box::new(|_, _| {}),
        }
    }

    /// Report progress.
    pub fn send(&self, progress: f32, stage: &str) {
        (self.callback)(progress, stage);
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    stage: usize,
    last: f32,
}

/// Maps (stage, fraction-of-stage) onto an overall percentage.
#[derive(Debug)]
pub struct ProgressTracker {
    names: Vec<&'static str>,
    weights: Vec<f32>,
    total: f32,
    state: Mutex<TrackerState>,
    sender: ProgressSender,
}

impl ProgressTracker {
    /// `stages` are `(name, weight)` pairs in execution order.
    pub fn new(stages: &[(&'static str, f32)], sender: ProgressSender) -> Self {
        let weights: Vec<f32> = stages.iter().map(|(_, w)| w.max(0.0)).collect();
        Self {
            names: stages.iter().map(|(n, _)| *n).collect(),
            total: weights.iter().sum(),
            weights,
            state: Mutex::new(TrackerState::default()),
            sender,
        }
    }

    /// Overall percentage at `fraction` through stage `stage`.
    pub fn overall(&self, stage: usize, fraction: f64) -> f32 {
        if self.total <= 0.0 {
            return if stage + 1 >= self.weights.len() && fraction >= 1.0 {
                100.0
            } else {
                0.0
            };
        }
        let done: f32 = self.weights.iter().take(stage).sum();
        let current = self.weights.get(stage).copied().unwrap_or(0.0);
        let pct = (done + current * fraction.clamp(0.0, 1.0) as f32) * 100.0 / self.total;
        pct.clamp(0.0, 100.0)
    }

    /// Move to `stage` and report its starting point.
    pub fn enter(&self, stage: usize) {
        self.state.lock().stage = stage;
        self.report(0.0);
    }

    /// Report `fraction` of the current stage. Values that would move the
    /// overall progress backwards are dropped.
    pub fn report(&self, fraction: f64) {
        let (pct, stage) = {
            let mut state = self.state.lock();
            let pct = self.overall(state.stage, fraction);
            if pct < state.last {
                return;
            }
            state.last = pct;
            (pct, state.stage)
        };
        let name = self.names.get(stage).copied().unwrap_or("");
        self.sender.send(pct, name);
    }

    /// Last reported percentage.
    pub fn last(&self) -> f32 {
        self.state.lock().last
    }
}

/// Completion of N sub-units with uneven costs.
#[derive(Debug, Clone)]
pub struct WeightedUnits {
    weights: Vec<f64>,
    total: f64,
    done: f64,
}

impl WeightedUnits {
    pub fn new(weights: Vec<f64>) -> Self {
        let weights: Vec<f64> = weights.into_iter().map(|w| w.max(0.0)).collect();
        Self {
            total: weights.iter().sum(),
            weights,
            done: 0.0,
        }
    }

    /// `n` units of equal cost.
    pub fn uniform(n: usize) -> Self {
        Self::new(vec![1.0; n])
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Mark unit `index` finished and return the new fraction.
    pub fn complete(&mut self, index: usize) -> f64 {
        self.done += self.weights.get(index).copied().unwrap_or(0.0);
        self.fraction()
    }

    /// Fraction if unit `index` were `partial` of the way through.
    pub fn fraction_with(&self, index: usize, partial: f64) -> f64 {
        if self.total <= 0.0 {
            return self.fraction();
        }
        let w = self.weights.get(index).copied().unwrap_or(0.0);
        ((self.done + w * partial.clamp(0.0, 1.0)) / self.total).min(1.0)
    }

    /// Completed fraction; an empty set counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total <= 0.0 {
            return if self.weights.is_empty() || self.done > 0.0 {
                1.0
            } else {
                0.0
            };
        }
        (self.done / self.total).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recording() -> (ProgressSender, Arc<Mutex<Vec<(f32, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sender = ProgressSender::new(move |p, s| sink.lock().push((p, s.to_string())));
        (sender, seen)
    }

    #[test]
    fn stage_weights_shape_overall_progress() {
        let tracker = ProgressTracker::new(
            &[("scan", 1.0), ("translate", 8.0), ("finalize", 1.0)],
            ProgressSender::noop(),
        );
        assert_eq!(tracker.overall(0, 1.0), 10.0);
        assert_eq!(tracker.overall(1, 0.5), 50.0);
        assert_eq!(tracker.overall(2, 1.0), 100.0);
    }

    #[test]
    fn reports_are_monotonic() {
        let (sender, seen) = recording();
        let tracker = ProgressTracker::new(&[("a", 1.0), ("b", 1.0)], sender);
        tracker.enter(1);
        tracker.report(0.5);
        tracker.report(0.2);
        tracker.enter(0);

        let values: Vec<f32> = seen.lock().iter().map(|(p, _)| *p).collect();
        assert_eq!(values, vec![50.0, 75.0]);
        assert_eq!(tracker.last(), 75.0);
        assert_eq!(seen.lock()[1].1, "b");
    }

    #[test]
    fn weighted_units_reflect_cost() {
        let mut units = WeightedUnits::new(vec![1.0, 3.0]);
        assert_eq!(units.fraction(), 0.0);
        assert_eq!(units.fraction_with(1, 0.5), 0.375);
        assert_eq!(units.complete(0), 0.25);
        assert_eq!(units.complete(1), 1.0);
    }

    #[test]
    fn empty_units_count_as_done() {
        let units = WeightedUnits::uniform(0);
        assert!(units.is_empty());
        assert_eq!(units.fraction(), 1.0);
    }
}
