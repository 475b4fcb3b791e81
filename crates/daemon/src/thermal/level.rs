//! Thermal alert levels and hysteretic band classification

use serde::Serialize;
use std::fmt;

/// Number of alert bands.
pub const LEVEL_COUNT: usize = 8;

/// Discrete alert level derived from the hottest observed temperature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalLevel {
    Under,
    Cool,
    Normal,
    Warm,
    Hot,
    Danger,
    Shutdown,
    Critical,
}

impl ThermalLevel {
    /// All levels, coldest first.
    pub const ALL: [ThermalLevel; LEVEL_COUNT] = [
        ThermalLevel::Under,
        ThermalLevel::Cool,
        ThermalLevel::Normal,
        ThermalLevel::Warm,
        ThermalLevel::Hot,
        ThermalLevel::Danger,
        ThermalLevel::Shutdown,
        ThermalLevel::Critical,
    ];

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|l| *l == self).unwrap_or(0)
    }

    pub fn name(self) -> &'static str {
        match self {
            ThermalLevel::Under => "under",
            ThermalLevel::Cool => "cool",
            ThermalLevel::Normal => "normal",
            ThermalLevel::Warm => "warm",
            ThermalLevel::Hot => "hot",
            ThermalLevel::Danger => "danger",
            ThermalLevel::Shutdown => "shutdown",
            ThermalLevel::Critical => "critical",
        }
    }

    /// One band colder, saturating at the bottom.
    pub fn step_down(self) -> ThermalLevel {
        let idx = self.index();
        Self::ALL[idx.saturating_sub(1)]
    }
}

impl fmt::Display for ThermalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Threshold table with a hysteresis band.
#[derive(Debug, Clone)]
pub struct ThermalBands {
    thresholds: [f64; LEVEL_COUNT],
    band: f64,
}

impl ThermalBands {
    pub fn new(thresholds: [f64; LEVEL_COUNT], band: f64) -> Self {
        Self { thresholds, band }
    }

    /// The highest level whose threshold `h` meets.
    pub fn classify(&self, h: f64) -> ThermalLevel {
        for idx in (0..LEVEL_COUNT).rev() {
            if h >= self.thresholds[idx] {
                return ThermalLevel::ALL[idx];
            }
        }
        ThermalLevel::Under
    }

    /// Advance `current` given a new hottest reading.
    ///
    /// Ascent goes straight to the classified level. Descent is damped:
    /// one band per evaluation, and only once `h` has fallen below the
    /// current band's threshold minus the hysteresis band.
    pub fn step(&self, current: ThermalLevel, h: f64) -> ThermalLevel {
        let raw = self.classify(h);
        if raw > current {
            raw
        } else if raw < current && h < self.thresholds[current.index()] - self.band {
            current.step_down()
        } else {
            current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bands() -> ThermalBands {
        ThermalBands::new([0.0, 30.0, 40.0, 50.0, 60.0, 65.0, 70.0, 75.0], 2.0)
    }

    #[test]
    fn test_classify_picks_highest_met_threshold() {
        let b = bands();
        assert_eq!(b.classify(-5.0), ThermalLevel::Under);
        assert_eq!(b.classify(29.9), ThermalLevel::Under);
        assert_eq!(b.classify(30.0), ThermalLevel::Cool);
        assert_eq!(b.classify(44.0), ThermalLevel::Normal);
        assert_eq!(b.classify(80.0), ThermalLevel::Critical);
    }

    #[test]
    fn test_hysteresis_sequence() {
        let b = bands();
        let mut level = ThermalLevel::Under;
        let mut observed = Vec::new();
        for h in [38.0, 42.0, 52.0, 49.0, 47.0] {
            level = b.step(level, h);
            observed.push(level);
        }
        // The 49 reading sits inside the hysteresis band (T[warm] - 2 = 48)
        // and holds warm; 47 crosses it and descends.
        assert_eq!(
            observed,
            vec![
                ThermalLevel::Cool,
                ThermalLevel::Normal,
                ThermalLevel::Warm,
                ThermalLevel::Warm,
                ThermalLevel::Normal,
            ]
        );
    }

    #[test]
    fn test_no_descent_at_threshold_minus_band() {
        let b = bands();
        // Exactly at T[warm] - band: still warm.
        assert_eq!(b.step(ThermalLevel::Warm, 48.0), ThermalLevel::Warm);
        assert_eq!(b.step(ThermalLevel::Warm, 47.9), ThermalLevel::Normal);
    }

    #[test]
    fn test_ascent_can_jump_multiple_bands() {
        let b = bands();
        assert_eq!(b.step(ThermalLevel::Cool, 76.0), ThermalLevel::Critical);
    }

    #[test]
    fn test_descent_is_single_step() {
        let b = bands();
        // Even a huge drop only descends one band per evaluation.
        assert_eq!(b.step(ThermalLevel::Hot, 10.0), ThermalLevel::Warm);
    }

    #[test]
    fn test_step_down_saturates() {
        assert_eq!(ThermalLevel::Under.step_down(), ThermalLevel::Under);
    }

    #[test]
    fn test_level_ordering() {
        assert!(ThermalLevel::Critical > ThermalLevel::Shutdown);
        assert!(ThermalLevel::Under < ThermalLevel::Cool);
    }
}
