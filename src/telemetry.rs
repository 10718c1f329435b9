//! Cell voltage acquisition and pack statistics.

use crate::constants::*;
use crate::error::{BmsError, Result};
use crate::hardware::{AdcArray, StatusIndicator};
use crate::types::{PackSnapshot, Rgb, Wiring};

/// Reads the cell taps through the ADC array and reduces them to a snapshot
#[derive(Debug, Clone, Default)]
pub struct CellTelemetry {
    wiring: Wiring,
}

impl CellTelemetry {
    pub fn new(wiring: Wiring) -> Self {
        CellTelemetry { wiring }
    }

    /// Sample every cell in one batch and recompute the pack statistics
    ///
    /// The status indicator is repainted from the new capacity. A short ADC
    /// read fails the whole call so a partial snapshot never escapes.
    pub fn read_cells(
        &self,
        adc: &mut dyn AdcArray,
        indicator: &mut dyn StatusIndicator,
    ) -> Result<PackSnapshot> {
        let raw = adc.read_all_channels(ADC_NEGATIVE_INPUT, &ADC_POSITIVE_INPUTS)?;
        let highest = self.wiring.highest_channel();
        if highest >= raw.len() {
            return Err(BmsError::MissingChannel {
                channel: highest,
                available: raw.len(),
            });
        }

        let mut cells = [0.0; CELL_COUNT];
        for (cell, voltage) in cells.iter_mut().enumerate() {
            *voltage = raw[self.wiring.channel(cell)];
        }

        let snapshot = summarize(cells);
        indicator.fill(status_colour(snapshot.capacity))?;
        Ok(snapshot)
    }
}

/// Compute totals and extremes for a set of logical cell voltages
///
/// Ties on the extremes resolve to the lowest cell index.
pub fn summarize(cells: [f64; CELL_COUNT]) -> PackSnapshot {
    let total_voltage: f64 = cells.iter().sum();

    let mut min_index = 0;
    let mut max_index = 0;
    for (i, &v) in cells.iter().enumerate() {
        if v < cells[min_index] {
            min_index = i;
        }
        if v > cells[max_index] {
            max_index = i;
        }
    }

    PackSnapshot {
        cells,
        total_voltage,
        mean_voltage: total_voltage / CELL_COUNT as f64,
        min_voltage: cells[min_index],
        min_index,
        max_voltage: cells[max_index],
        max_index,
        capacity: capacity(total_voltage),
    }
}

/// Linear state-of-charge estimate from pack voltage, clamped to 0..=100
pub fn capacity(total_voltage: f64) -> u8 {
    let percent = ((100.0 / (V_FULL - V_EMPTY)) * (total_voltage - V_EMPTY)).round_ties_even();
    percent.clamp(0.0, 100.0) as u8
}

/// Indicator colour fading from red (empty) to green (full)
pub fn status_colour(capacity: u8) -> Rgb {
    let capacity = capacity as f64;
    Rgb {
        r: ((-255.0 / 100.0) * capacity + 255.0) as u8,
        g: ((255.0 / 100.0) * capacity) as u8,
        b: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAdc, MockIndicator};

    #[test]
    fn test_capacity_is_clamped() {
        assert_eq!(capacity(0.0), 0);
        assert_eq!(capacity(60.0), 0);
        assert_eq!(capacity(V_EMPTY), 0);
        assert_eq!(capacity(76.0), 50);
        assert_eq!(capacity(V_FULL), 100);
        assert_eq!(capacity(95.0), 100);
        assert_eq!(capacity(f64::MAX), 100);
        assert_eq!(capacity(f64::MIN), 0);
    }

    #[test]
    fn test_capacity_rounds_to_nearest_percent() {
        // 6.25 * 0.24 falls just short of 1.5
        assert_eq!(capacity(68.24), 1);
        // Exact halves round to even
        assert_eq!(capacity(70.0), 12);
        assert_eq!(capacity(74.0), 38);
    }

    #[test]
    fn test_status_colour_endpoints() {
        assert_eq!(status_colour(0), Rgb { r: 255, g: 0, b: 0 });
        let full = status_colour(100);
        assert_eq!(full.r, 0);
        assert!(full.g >= 254);
        assert_eq!(full.b, 0);
    }

    #[test]
    fn test_summarize_picks_first_extreme() {
        let mut cells = [3.8; CELL_COUNT];
        cells[4] = 3.6;
        cells[9] = 3.6;
        cells[2] = 4.0;
        cells[15] = 4.0;
        let snap = summarize(cells);
        assert_eq!(snap.min_index, 4);
        assert_eq!(snap.max_index, 2);
        assert!((snap.min_voltage - 3.6).abs() < 1e-9);
        assert!((snap.max_voltage - 4.0).abs() < 1e-9);
        assert!((snap.spread() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_read_cells_applies_wiring() {
        let adc = MockAdc::new();
        let mut cells = [0.0; CELL_COUNT];
        for (i, v) in cells.iter_mut().enumerate() {
            *v = 3.5 + i as f64 * 0.01;
        }
        adc.set_cells(&Wiring::default(), &cells);

        let mut adc_handle = adc.clone();
        let mut indicator = MockIndicator::new();
        let telemetry = CellTelemetry::default();
        let snap = telemetry
            .read_cells(&mut adc_handle, &mut indicator)
            .unwrap();

        assert_eq!(snap.cells, cells);
        assert_eq!(snap.min_index, 0);
        assert_eq!(snap.max_index, CELL_COUNT - 1);
        assert_eq!(indicator.last(), Some(status_colour(snap.capacity)));
    }

    #[test]
    fn test_short_read_is_rejected() {
        let mut adc = MockAdc::with_channel_count(8);
        let mut indicator = MockIndicator::new();
        let err = CellTelemetry::default()
            .read_cells(&mut adc, &mut indicator)
            .unwrap_err();
        assert!(matches!(err, BmsError::MissingChannel { channel: 20, available: 8 }));
        assert_eq!(indicator.last(), None);
    }
}
