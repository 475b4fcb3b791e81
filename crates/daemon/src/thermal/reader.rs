//! Periodic temperature acquisition
//!
//! Polls the PMC board sensor and the per-disk SMART temperatures through
//! the external disk-temperature tool. A failing source never fails the
//! tick; it is marked stale and retried next round.

use super::governor::FanGovernor;
use super::{DiskTemp, ThermalStatus};
use crate::pmc::{registers, PmcClient, PmcError};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, warn};

static TEMP_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(-?\d+(?:\.\d+)?)").expect("valid temperature regex"));

/// Last known reading and staleness for one source.
#[derive(Debug, Clone, Default)]
struct SourceState {
    last: Option<f64>,
    stale: u32,
}

pub struct TemperatureReader {
    client: PmcClient,
    governor: FanGovernor,
    status: Arc<RwLock<ThermalStatus>>,
    tool: PathBuf,
    devices: Vec<String>,
    interval: Duration,
    subprocess_timeout: Duration,
    board: SourceState,
    disks: Vec<SourceState>,
}

impl TemperatureReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: PmcClient,
        governor: FanGovernor,
        status: Arc<RwLock<ThermalStatus>>,
        tool: PathBuf,
        devices: Vec<String>,
        interval: Duration,
        subprocess_timeout: Duration,
    ) -> Self {
        let disks = vec![SourceState::default(); devices.len()];
        Self {
            client,
            governor,
            status,
            tool,
            devices,
            interval,
            subprocess_timeout,
            board: SourceState::default(),
            disks,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await?;
        }
    }

    /// One acquisition round: board sensor, every disk, then the governor.
    async fn tick(&mut self) -> Result<()> {
        match self.client.get_u8(&registers::TMP).await {
            Ok(temp) => {
                self.board.last = Some(f64::from(temp));
                self.board.stale = 0;
            }
            Err(e @ PmcError::LinkIO(_)) => {
                // A dead link will not come back on its own; let the
                // supervisor decide.
                return Err(e.into());
            }
            Err(e) => {
                self.board.stale += 1;
                warn!(
                    "board temperature read failed ({} consecutive): {}",
                    self.board.stale, e
                );
            }
        }

        for idx in 0..self.devices.len() {
            let reading = self.read_disk_temp(&self.devices[idx]).await;
            match reading {
                Some(temp) => {
                    self.disks[idx].last = Some(temp);
                    self.disks[idx].stale = 0;
                }
                None => self.disks[idx].stale += 1,
            }
        }

        let hottest = self
            .board
            .last
            .into_iter()
            .chain(self.disks.iter().filter_map(|d| d.last))
            .fold(None::<f64>, |acc, t| Some(acc.map_or(t, |a| a.max(t))));

        let fan = match self.governor.evaluate(hottest).await {
            Ok(fan) => fan,
            Err(e @ PmcError::LinkIO(_)) => return Err(e.into()),
            Err(e) => {
                warn!("fan update failed: {}", e);
                self.governor.state()
            }
        };

        let mut status = self.status.write().await;
        status.board_temp_c = self.board.last;
        status.board_stale_count = self.board.stale;
        status.disks = self
            .devices
            .iter()
            .zip(&self.disks)
            .map(|(device, s)| DiskTemp {
                device: device.clone(),
                temp_c: s.last,
                stale_count: s.stale,
            })
            .collect();
        status.hottest_c = hottest;
        status.level = fan.level;
        status.fan_duty = fan.duty;
        status.fan_target = fan.target;
        Ok(())
    }

    /// Run the external tool for one device and parse its Celsius output.
    async fn read_disk_temp(&self, device: &str) -> Option<f64> {
        let mut cmd = Command::new(&self.tool);
        cmd.arg(device)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match time::timeout(self.subprocess_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("disk temperature tool failed for {}: {}", device, e);
                return None;
            }
            Err(_) => {
                warn!(
                    "disk temperature tool timed out for {} after {:?}",
                    device, self.subprocess_timeout
                );
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                "disk temperature tool exited with {} for {}",
                output.status, device
            );
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_temperature(&stdout) {
            Some(temp) => {
                debug!("{}: {:.1} C", device, temp);
                Some(temp)
            }
            None => {
                warn!(
                    "disk temperature tool produced no reading for {}: {:?}",
                    device,
                    stdout.trim()
                );
                None
            }
        }
    }
}

/// Extract the first numeric Celsius value from tool output.
fn parse_temperature(output: &str) -> Option<f64> {
    TEMP_PATTERN
        .captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::serial::{FrameReader, FrameWriter};
    use crate::thermal::ThermalLevel;
    use tokio::io::{duplex, split};
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_temperature_plain() {
        assert_eq!(parse_temperature("42\n"), Some(42.0));
        assert_eq!(parse_temperature("38.5"), Some(38.5));
    }

    #[test]
    fn test_parse_temperature_with_label() {
        assert_eq!(parse_temperature("temperature: 41 C"), Some(41.0));
    }

    #[test]
    fn test_parse_temperature_garbage() {
        assert_eq!(parse_temperature("no reading"), None);
        assert_eq!(parse_temperature(""), None);
    }

    /// Mock PMC answering TMP reads and acking FAN writes.
    fn mock_client(board_temp: u8) -> PmcClient {
        let (host, pmc) = duplex(1024);
        let (hr, hw) = split(host);
        let client = PmcClient::spawn(hr, hw);
        tokio::spawn(async move {
            let (pr, pw) = split(pmc);
            let mut reader = FrameReader::new(pr);
            let mut writer = FrameWriter::new(pw);
            while let Ok(Some(frame)) = reader.read_frame().await {
                if frame == "TMP" {
                    writer
                        .write_frame(&format!("TMP={:02x}", board_temp))
                        .await
                        .unwrap();
                } else {
                    writer.write_frame("ACK").await.unwrap();
                }
            }
        });
        client
    }

    fn reader_with(devices: Vec<String>, tool: &str, board_temp: u8) -> TemperatureReader {
        let client = mock_client(board_temp);
        let config = Config::default();
        // Receivers are dropped on purpose; the governor logs and carries on
        // when nobody is listening.
        let (shutdown_tx, _) = mpsc::channel(8);
        let (event_tx, _) = mpsc::channel(8);
        let governor = FanGovernor::new(client.clone(), &config, shutdown_tx, event_tx);
        TemperatureReader::new(
            client,
            governor,
            Arc::new(RwLock::new(ThermalStatus::default())),
            PathBuf::from(tool),
            devices,
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_tick_publishes_board_temperature() {
        let mut reader = reader_with(Vec::new(), "/bin/true", 0x2c);
        let status = Arc::clone(&reader.status);

        reader.tick().await.unwrap();

        let s = status.read().await.clone();
        assert_eq!(s.board_temp_c, Some(44.0));
        assert_eq!(s.hottest_c, Some(44.0));
        assert_eq!(s.level, ThermalLevel::Normal);
        assert_eq!(s.board_stale_count, 0);
    }

    #[tokio::test]
    async fn test_disk_source_via_external_tool() {
        // `echo <device>` stands in for the tool: the device name doubles
        // as the reported temperature.
        let mut reader = reader_with(vec!["57".to_string()], "/bin/echo", 0x20);
        let status = Arc::clone(&reader.status);

        reader.tick().await.unwrap();

        let s = status.read().await.clone();
        assert_eq!(s.board_temp_c, Some(32.0));
        assert_eq!(s.disks.len(), 1);
        assert_eq!(s.disks[0].temp_c, Some(57.0));
        // The disk is the hottest source.
        assert_eq!(s.hottest_c, Some(57.0));
    }

    #[tokio::test]
    async fn test_failing_tool_marks_source_stale() {
        let mut reader = reader_with(
            vec!["/dev/sda".to_string()],
            "/nonexistent/disktemp",
            0x28,
        );
        let status = Arc::clone(&reader.status);

        reader.tick().await.unwrap();
        reader.tick().await.unwrap();

        let s = status.read().await.clone();
        assert_eq!(s.disks[0].temp_c, None);
        assert_eq!(s.disks[0].stale_count, 2);
        // The board reading alone still drives the governor.
        assert_eq!(s.hottest_c, Some(40.0));
    }
}
