//! Stability check between consecutive telemetry snapshots.

use crate::constants::{CELL_COUNT, MEASUREMENT_ATTEMPTS, NOISE_THRESHOLD};
use crate::error::Result;
use crate::types::PackSnapshot;
use log::debug;

/// Outcome of a (possibly retried) measurement
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub snapshot: PackSnapshot,
    /// False when every attempt moved more than the noise threshold
    pub stable: bool,
    /// Number of reads taken
    pub attempts: u8,
    /// Mean per-cell change against the previous baseline
    pub mean_delta: f64,
}

/// Keeps the previous snapshot and judges new ones against it
#[derive(Debug, Clone)]
pub struct MeasurementValidator {
    baseline: [f64; CELL_COUNT],
}

impl MeasurementValidator {
    pub fn new(baseline: &PackSnapshot) -> Self {
        MeasurementValidator {
            baseline: baseline.cells,
        }
    }

    /// Per-cell change from the baseline
    pub fn deltas(&self, snapshot: &PackSnapshot) -> [f64; CELL_COUNT] {
        let mut deltas = [0.0; CELL_COUNT];
        for (i, delta) in deltas.iter_mut().enumerate() {
            *delta = snapshot.cells[i] - self.baseline[i];
        }
        deltas
    }

    pub fn is_stable(&self, snapshot: &PackSnapshot) -> bool {
        self.deltas(snapshot)
            .iter()
            .all(|d| *d <= NOISE_THRESHOLD && *d >= -NOISE_THRESHOLD)
    }

    /// Take a measurement with `read`, retrying while it is unstable
    ///
    /// With `validate` off a single read is accepted as-is. The last
    /// snapshot read becomes the new baseline whatever the outcome.
    pub fn measure<F>(&mut self, validate: bool, mut read: F) -> Result<Measurement>
    where
        F: FnMut() -> Result<PackSnapshot>,
    {
        let mut attempts = 0;
        loop {
            let snapshot = read()?;
            attempts += 1;

            let stable = !validate || self.is_stable(&snapshot);
            if !stable && attempts < MEASUREMENT_ATTEMPTS {
                debug!("Measure error, trying again ({}/{})", attempts, MEASUREMENT_ATTEMPTS);
                continue;
            }

            let mean_delta = self.deltas(&snapshot).iter().sum::<f64>() / CELL_COUNT as f64;
            self.baseline = snapshot.cells;
            return Ok(Measurement {
                snapshot,
                stable,
                attempts,
                mean_delta,
            });
        }
    }

    pub fn baseline(&self) -> &[f64; CELL_COUNT] {
        &self.baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BmsError;
    use crate::telemetry::summarize;

    fn snap(v: f64) -> PackSnapshot {
        summarize([v; CELL_COUNT])
    }

    #[test]
    fn test_small_drift_is_stable() {
        let validator = MeasurementValidator::new(&snap(3.80));
        assert!(validator.is_stable(&snap(3.84)));
        assert!(validator.is_stable(&snap(3.76)));
        assert!(!validator.is_stable(&snap(3.86)));
        assert!(!validator.is_stable(&snap(3.74)));
    }

    #[test]
    fn test_single_cell_jump_is_unstable() {
        let validator = MeasurementValidator::new(&snap(3.80));
        let mut cells = [3.80; CELL_COUNT];
        cells[7] = 3.70;
        assert!(!validator.is_stable(&summarize(cells)));
    }

    #[test]
    fn test_retries_until_stable() {
        let mut validator = MeasurementValidator::new(&snap(3.80));
        let mut reads = vec![snap(3.81), snap(4.0), snap(4.0)];
        let m = validator.measure(true, || Ok(reads.pop().unwrap())).unwrap();
        assert!(m.stable);
        assert_eq!(m.attempts, 3);
        assert_eq!(validator.baseline(), &[3.81; CELL_COUNT]);
    }

    #[test]
    fn test_gives_up_after_four_attempts() {
        let mut validator = MeasurementValidator::new(&snap(3.80));
        let mut count = 0;
        let m = validator
            .measure(true, || {
                count += 1;
                Ok(snap(4.0))
            })
            .unwrap();
        assert!(!m.stable);
        assert_eq!(m.attempts, MEASUREMENT_ATTEMPTS);
        assert_eq!(count, 4);
        assert_eq!(validator.baseline(), &[4.0; CELL_COUNT]);
    }

    #[test]
    fn test_unvalidated_read_is_taken_once() {
        let mut validator = MeasurementValidator::new(&snap(3.80));
        let m = validator.measure(false, || Ok(snap(4.1))).unwrap();
        assert!(m.stable);
        assert_eq!(m.attempts, 1);
        assert!((m.mean_delta - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_read_errors_propagate() {
        let mut validator = MeasurementValidator::new(&snap(3.80));
        let result = validator.measure(true, || Err(BmsError::hardware("adc", "no response")));
        assert!(matches!(result, Err(BmsError::Hardware { device: "adc", .. })));
    }
}
