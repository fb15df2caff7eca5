use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::calibration::model::CalibrationPoint;
use crate::config::StabilityConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct StabilityCriteria {
    pub window_size: usize,
    pub min_span: Duration,
    pub band_c: f64,
    pub min_dwell: Duration,
    /// Newest sample must lie within `target ± tolerance` when set.
    pub target: Option<(f64, f64)>,
}

impl StabilityCriteria {
    pub fn for_point(config: &StabilityConfig, point: &CalibrationPoint, check_target: bool) -> Self {
        Self {
            window_size: config.window_size.max(2),
            min_span: Duration::from_secs_f64(config.min_window_span_s.max(0.0)),
            band_c: config.band_c,
            min_dwell: point.dwell(),
            target: check_target.then_some((point.target_c, point.tolerance_c)),
        }
    }
}

/// Sliding-window equilibrium detector for one temperature source.
///
/// Stable means: the window is full, it spans at least `min_span`, its
/// max-min spread is within `band_c`, and `min_dwell` has passed since the
/// last [`reset`](Self::reset). Once stable the detector latches until reset.
#[derive(Debug)]
pub struct StabilityDetector {
    criteria: StabilityCriteria,
    window: VecDeque<(Instant, f64)>,
    setpoint_changed_at: Instant,
    latched: bool,
}

impl StabilityDetector {
    pub fn new(criteria: StabilityCriteria, now: Instant) -> Self {
        Self {
            window: VecDeque::with_capacity(criteria.window_size),
            criteria,
            setpoint_changed_at: now,
            latched: false,
        }
    }

    /// Call on every setpoint change.
    pub fn reset(&mut self, criteria: StabilityCriteria, now: Instant) {
        self.criteria = criteria;
        self.window.clear();
        self.setpoint_changed_at = now;
        self.latched = false;
    }

    /// Adds a sample. Returns `true` only on the push that first makes the
    /// source stable; later pushes return `false` until the next reset.
    /// Non-finite samples are ignored.
    pub fn push(&mut self, now: Instant, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        if self.window.len() == self.criteria.window_size {
            self.window.pop_front();
        }
        self.window.push_back((now, value));

        if self.latched || !self.evaluate(now) {
            return false;
        }
        self.latched = true;
        true
    }

    /// Moves all timestamps forward by `paused` so a pause counts toward
    /// neither the window span nor the dwell time.
    pub fn discount(&mut self, paused: Duration) {
        if paused.is_zero() {
            return;
        }
        for (at, _) in self.window.iter_mut() {
            *at += paused;
        }
        self.setpoint_changed_at += paused;
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    pub fn spread(&self) -> Option<f64> {
        let mut values = self.window.iter().map(|(_, v)| *v);
        let first = values.next()?;
        let (min, max) = values.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Some(max - min)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    fn evaluate(&self, now: Instant) -> bool {
        if self.window.len() < self.criteria.window_size {
            return false;
        }
        let (Some((oldest, _)), Some((_, newest))) = (self.window.front(), self.window.back()) else {
            return false;
        };
        if now.duration_since(*oldest) < self.criteria.min_span {
            return false;
        }
        if now.duration_since(self.setpoint_changed_at) < self.criteria.min_dwell {
            return false;
        }
        if let Some((target, tolerance)) = self.criteria.target {
            if (newest - target).abs() > tolerance {
                return false;
            }
        }
        self.spread().map_or(false, |spread| spread <= self.criteria.band_c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn criteria() -> StabilityCriteria {
        StabilityCriteria {
            window_size: 5,
            min_span: Duration::from_secs(40),
            band_c: 0.05,
            min_dwell: Duration::from_secs(60),
            target: None,
        }
    }

    #[test]
    fn test_monotonic_ramp_never_stable() {
        let start = Instant::now();
        let mut detector = StabilityDetector::new(criteria(), start);
        for i in 0..200u64 {
            let now = start + Duration::from_secs(10 * i);
            assert!(!detector.push(now, 25.0 + 0.02 * i as f64));
        }
        assert!(!detector.is_latched());
    }

    #[test]
    fn test_constant_sequence_stable_exactly_once() {
        let start = Instant::now();
        let mut detector = StabilityDetector::new(criteria(), start);
        let mut reports = Vec::new();
        for i in 0..20u64 {
            let now = start + Duration::from_secs(10 * i);
            if detector.push(now, 100.0) {
                reports.push(i);
            }
        }
        // Window full at i = 4 (span 40 s) but dwell needs 60 s: first stable at i = 6.
        assert_eq!(reports, vec![6]);
    }

    #[test]
    fn test_reset_clears_window_and_latch() {
        let start = Instant::now();
        let mut detector = StabilityDetector::new(criteria(), start);
        for i in 0..10u64 {
            detector.push(start + Duration::from_secs(10 * i), 50.0);
        }
        assert!(detector.is_latched());

        let changed = start + Duration::from_secs(100);
        detector.reset(criteria(), changed);
        assert!(detector.is_empty());
        assert!(!detector.is_latched());
        assert!(!detector.push(changed, 50.0));
    }

    #[test]
    fn test_spread_inside_band_edge() {
        let start = Instant::now();
        let mut c = criteria();
        c.min_dwell = Duration::ZERO;
        c.min_span = Duration::ZERO;
        let mut detector = StabilityDetector::new(c, start);
        let values = [100.00, 100.04, 100.01, 100.06, 100.02];
        let stable: Vec<bool> = values.iter().map(|v| detector.push(start, *v)).collect();
        assert_eq!(stable, vec![false; 5]);
        assert!(detector.spread().unwrap() > 0.05);
    }

    #[test]
    fn test_paused_time_does_not_count_toward_dwell() {
        let start = Instant::now();
        let mut detector = StabilityDetector::new(criteria(), start);
        for i in 0..3u64 {
            detector.push(start + Duration::from_secs(10 * i), 100.0);
        }
        detector.discount(Duration::from_secs(600));

        // Without the pause the window would be full and dwell satisfied by i = 6.
        let resumed = start + Duration::from_secs(600);
        let reports: Vec<u64> = (3..12u64)
            .filter(|i| detector.push(resumed + Duration::from_secs(10 * i), 100.0))
            .collect();
        assert_eq!(reports, vec![6]);
    }

    #[test]
    fn test_target_band_is_enforced() {
        let start = Instant::now();
        let mut c = criteria();
        c.target = Some((100.0, 0.5));
        let mut detector = StabilityDetector::new(c, start);
        for i in 0..20u64 {
            // Flat but 1 °C off target.
            assert!(!detector.push(start + Duration::from_secs(10 * i), 101.0));
        }
    }

    #[test]
    fn test_nan_samples_are_ignored() {
        let start = Instant::now();
        let mut detector = StabilityDetector::new(criteria(), start);
        detector.push(start, f64::NAN);
        assert!(detector.is_empty());
    }
}
