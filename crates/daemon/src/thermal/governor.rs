//! Fan governor: hysteretic temperature-to-duty control
//!
//! Maps the hottest observed temperature to an alert level and a fan duty
//! cycle, ramping rather than stepping, and escalates to a scheduled or
//! immediate shutdown at the top bands.

use super::level::{ThermalBands, ThermalLevel};
use crate::config::Config;
use crate::events::Event;
use crate::pmc::{registers, PmcClient, PmcError};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{info, warn};

/// Highest duty cycle the firmware accepts; `FAN=100` is rejected, so full
/// speed is commanded as 99.
pub const FULL_SPEED: u8 = 99;

/// Shutdown escalation requests sent to the controller runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// Orderly shutdown after a grace delay; may still be cancelled.
    Deferred { grace: Duration },
    /// Cancel a pending deferred shutdown.
    Cancel,
    /// Orderly shutdown now; never cancelled.
    Immediate,
}

/// Governor outputs for the shared snapshot.
#[derive(Debug, Clone, Copy)]
pub struct FanState {
    pub level: ThermalLevel,
    pub duty: u8,
    pub target: u8,
}

pub struct FanGovernor {
    client: PmcClient,
    bands: ThermalBands,
    duties: [u8; super::LEVEL_COUNT],
    increment: u8,
    decrement: u8,
    shutdown_grace: Duration,
    level: ThermalLevel,
    duty: u8,
    last_written: Option<u8>,
    shutdown_tx: mpsc::Sender<ShutdownRequest>,
    event_tx: mpsc::Sender<Event>,
}

impl FanGovernor {
    pub fn new(
        client: PmcClient,
        config: &Config,
        shutdown_tx: mpsc::Sender<ShutdownRequest>,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            client,
            bands: ThermalBands::new(config.temp_thresholds, config.hysteresis_band),
            duties: config.fan_duties,
            increment: config.fan_speed_increment,
            decrement: config.fan_speed_decrement,
            shutdown_grace: config.shutdown_grace,
            // No readings yet: coldest band, so the first reading ascends
            // freely to wherever it belongs.
            level: ThermalLevel::Under,
            duty: config.fan_speed_normal.min(FULL_SPEED),
            last_written: None,
            shutdown_tx,
            event_tx,
        }
    }

    pub fn state(&self) -> FanState {
        FanState {
            level: self.level,
            duty: self.duty,
            target: self.target_duty(),
        }
    }

    /// Evaluate one tick. `None` means no reading exists and the previous
    /// state is held.
    pub async fn evaluate(&mut self, hottest: Option<f64>) -> Result<FanState, PmcError> {
        let Some(h) = hottest else {
            return Ok(self.state());
        };

        let old = self.level;
        let new = self.bands.step(old, h);
        if new != old {
            self.level = new;
            info!(
                "temperature level {} -> {} (hottest {:.1} C)",
                old, new, h
            );
            if self
                .event_tx
                .send(Event::TemperatureLevelChanged {
                    new_level: new,
                    old_level: old,
                    hottest_c: h,
                })
                .await
                .is_err()
            {
                warn!("event channel closed, temperature change not dispatched");
            }
            self.escalate(old, new).await;
        }

        let target = self.target_duty();
        let next = match self.level {
            ThermalLevel::Shutdown | ThermalLevel::Critical => FULL_SPEED,
            ThermalLevel::Danger => self.duty.max(target),
            _ => ramp(self.duty, target, self.increment, self.decrement),
        }
        .min(FULL_SPEED);

        self.duty = next;
        if self.last_written != Some(next) {
            self.client.set_u8(&registers::FAN, next).await?;
            self.last_written = Some(next);
        }
        Ok(self.state())
    }

    fn target_duty(&self) -> u8 {
        match self.level {
            ThermalLevel::Shutdown | ThermalLevel::Critical => FULL_SPEED,
            ThermalLevel::Danger => self
                .duty
                .max(self.duties[ThermalLevel::Danger.index()])
                .min(FULL_SPEED),
            level => self.duties[level.index()].min(FULL_SPEED),
        }
    }

    async fn escalate(&self, old: ThermalLevel, new: ThermalLevel) {
        let request = if new == ThermalLevel::Critical {
            Some(ShutdownRequest::Immediate)
        } else if new == ThermalLevel::Shutdown && old < ThermalLevel::Shutdown {
            Some(ShutdownRequest::Deferred {
                grace: self.shutdown_grace,
            })
        } else if old >= ThermalLevel::Shutdown && new < ThermalLevel::Shutdown {
            Some(ShutdownRequest::Cancel)
        } else {
            None
        };

        if let Some(request) = request {
            if self.shutdown_tx.send(request).await.is_err() {
                warn!("runtime channel closed, shutdown escalation lost");
            }
        }
    }
}

/// Move `duty` one configured step toward `target`.
fn ramp(duty: u8, target: u8, increment: u8, decrement: u8) -> u8 {
    if duty < target {
        duty.saturating_add(increment).min(target)
    } else if duty > target {
        duty.saturating_sub(decrement).max(target)
    } else {
        duty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{FrameReader, FrameWriter};
    use std::sync::Arc;
    use tokio::io::{duplex, split};
    use tokio::sync::Mutex;

    /// Mock PMC that acks every FAN write and records the duty values.
    fn mock_client() -> (PmcClient, Arc<Mutex<Vec<u8>>>) {
        let (host, pmc) = duplex(1024);
        let (hr, hw) = split(host);
        let client = PmcClient::spawn(hr, hw);

        let written = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&written);
        tokio::spawn(async move {
            let (pr, pw) = split(pmc);
            let mut reader = FrameReader::new(pr);
            let mut writer = FrameWriter::new(pw);
            while let Ok(Some(frame)) = reader.read_frame().await {
                if let Some(hex) = frame.strip_prefix("FAN=") {
                    log.lock().await.push(u8::from_str_radix(hex, 16).unwrap());
                    writer.write_frame("ACK").await.unwrap();
                }
            }
        });

        (client, written)
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.temp_thresholds = [0.0, 30.0, 40.0, 50.0, 60.0, 65.0, 70.0, 75.0];
        config.fan_duties = [10, 20, 40, 60, 80, 90, 99, 99];
        config.fan_speed_normal = 20;
        config.fan_speed_increment = 10;
        config.fan_speed_decrement = 5;
        config.hysteresis_band = 2.0;
        config
    }

    fn governor(
        config: &Config,
    ) -> (
        FanGovernor,
        Arc<Mutex<Vec<u8>>>,
        mpsc::Receiver<ShutdownRequest>,
        mpsc::Receiver<Event>,
    ) {
        let (client, written) = mock_client();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::channel(8);
        (
            FanGovernor::new(client, config, shutdown_tx, event_tx),
            written,
            shutdown_rx,
            event_rx,
        )
    }

    #[tokio::test]
    async fn test_no_reading_holds_state() {
        let config = test_config();
        let (mut gov, written, _srx, _erx) = governor(&config);

        let state = gov.evaluate(None).await.unwrap();
        assert_eq!(state.level, ThermalLevel::Under);
        assert!(written.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_duty_ramps_toward_target() {
        let config = test_config();
        let (mut gov, written, _srx, mut erx) = governor(&config);

        // 44 C classifies as normal; target duty 40 from a start of 20.
        let s1 = gov.evaluate(Some(44.0)).await.unwrap();
        assert_eq!(s1.level, ThermalLevel::Normal);
        assert_eq!(s1.duty, 30);
        let s2 = gov.evaluate(Some(44.0)).await.unwrap();
        assert_eq!(s2.duty, 40);
        let s3 = gov.evaluate(Some(44.0)).await.unwrap();
        assert_eq!(s3.duty, 40);

        // Only two writes: the final steady tick repeats the last value.
        assert_eq!(*written.lock().await, vec![30, 40]);

        let event = erx.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::TemperatureLevelChanged {
                new_level: ThermalLevel::Normal,
                old_level: ThermalLevel::Under,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_danger_forces_floor_immediately() {
        let config = test_config();
        let (mut gov, written, _srx, _erx) = governor(&config);

        let state = gov.evaluate(Some(66.0)).await.unwrap();
        assert_eq!(state.level, ThermalLevel::Danger);
        assert_eq!(state.duty, 90);
        assert_eq!(*written.lock().await, vec![90]);
    }

    #[tokio::test]
    async fn test_full_speed_is_ninety_nine() {
        let config = test_config();
        let (mut gov, written, mut srx, _erx) = governor(&config);

        let state = gov.evaluate(Some(71.0)).await.unwrap();
        assert_eq!(state.level, ThermalLevel::Shutdown);
        assert_eq!(state.duty, FULL_SPEED);
        assert_eq!(*written.lock().await, vec![99]);

        assert!(matches!(
            srx.recv().await.unwrap(),
            ShutdownRequest::Deferred { .. }
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancelled_on_descent() {
        let config = test_config();
        let (mut gov, _written, mut srx, _erx) = governor(&config);

        gov.evaluate(Some(71.0)).await.unwrap();
        assert!(matches!(
            srx.recv().await.unwrap(),
            ShutdownRequest::Deferred { .. }
        ));

        // Well below T[shutdown] - band: descends to danger and cancels.
        let state = gov.evaluate(Some(50.0)).await.unwrap();
        assert_eq!(state.level, ThermalLevel::Danger);
        assert_eq!(srx.recv().await.unwrap(), ShutdownRequest::Cancel);
    }

    #[tokio::test]
    async fn test_critical_requests_immediate_shutdown() {
        let config = test_config();
        let (mut gov, _written, mut srx, _erx) = governor(&config);

        gov.evaluate(Some(80.0)).await.unwrap();
        assert_eq!(srx.recv().await.unwrap(), ShutdownRequest::Immediate);
    }

    #[tokio::test]
    async fn test_rejected_fan_write_surfaces() {
        // A PMC that answers ERR to everything.
        let (host, pmc) = duplex(1024);
        let (hr, hw) = split(host);
        let client = PmcClient::spawn(hr, hw);
        tokio::spawn(async move {
            let (pr, pw) = split(pmc);
            let mut reader = FrameReader::new(pr);
            let mut writer = FrameWriter::new(pw);
            while let Ok(Some(_)) = reader.read_frame().await {
                writer.write_frame("ERR").await.unwrap();
            }
        });

        let config = test_config();
        let (shutdown_tx, _srx) = mpsc::channel(8);
        let (event_tx, _erx) = mpsc::channel(8);
        let mut gov = FanGovernor::new(client, &config, shutdown_tx, event_tx);

        assert!(matches!(
            gov.evaluate(Some(44.0)).await,
            Err(PmcError::CommandRejected(_))
        ));
    }
}
