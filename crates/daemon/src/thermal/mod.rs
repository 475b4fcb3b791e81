//! Thermal monitoring and fan control
//!
//! A periodic reader gathers the PMC board temperature and per-disk SMART
//! temperatures, feeds the hottest reading to the hysteretic fan governor,
//! and publishes the combined snapshot for the IPC surface.

pub mod governor;
pub mod level;
pub mod reader;

pub use governor::{FanGovernor, FanState, ShutdownRequest};
pub use level::{ThermalBands, ThermalLevel, LEVEL_COUNT};
pub use reader::TemperatureReader;

use serde::Serialize;

/// Last known reading for one disk device.
#[derive(Debug, Clone, Serialize)]
pub struct DiskTemp {
    pub device: String,
    /// Most recent successful reading; kept across failed polls.
    pub temp_c: Option<f64>,
    /// Consecutive failed polls since the last success.
    pub stale_count: u32,
}

/// Shared thermal snapshot, written by the temperature poller and read by
/// the IPC server. The lock is held only for field copies.
#[derive(Debug, Clone, Serialize)]
pub struct ThermalStatus {
    pub board_temp_c: Option<f64>,
    pub board_stale_count: u32,
    pub disks: Vec<DiskTemp>,
    pub hottest_c: Option<f64>,
    pub level: ThermalLevel,
    /// Duty cycle most recently commanded to the fan.
    pub fan_duty: u8,
    /// Duty cycle the governor is ramping toward.
    pub fan_target: u8,
}

impl Default for ThermalStatus {
    fn default() -> Self {
        Self {
            board_temp_c: None,
            board_stale_count: 0,
            disks: Vec::new(),
            hottest_c: None,
            level: ThermalLevel::Under,
            fan_duty: 0,
            fan_target: 0,
        }
    }
}
