// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Temperature sensors and their polling tasks.
//!
//! A [`Sensor`] wraps a `tempN_input` file; a [`SensorMonitor`] samples
//! it on a fixed tick and publishes a windowed moving average, which is
//! the only temperature value curves ever see.

use crate::config::SensorConfig;
use crate::error::Result;
use crate::rolling::RollingWindow;
use crate::supervisor::ShutdownToken;
use crate::sysfs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Samples kept in the temperature moving-average window.
pub const TEMP_ROLLING_WINDOW_SIZE: usize = 10;

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

/// A configured temperature input, bound to a controller at startup.
///
/// The moving average is written by the owning monitor task and read by
/// curve evaluation on other tasks; it is published atomically.
#[derive(Debug)]
pub struct Sensor {
    pub id: String,
    pub label: String,
    pub index: u8,
    /// Absolute path to the `tempN_input` file.
    pub input_path: PathBuf,
    /// Lowest plausible reading, millidegrees C.
    pub min_value: i64,
    /// Highest plausible reading, millidegrees C.
    pub max_value: i64,
    /// f64 bits of the current moving average, millidegrees C.
    moving_avg: AtomicU64,
}

impl Sensor {
    pub fn new(config: &SensorConfig, label: String, input_path: PathBuf) -> Self {
        Self {
            id: config.id.clone(),
            label,
            index: config.index,
            input_path,
            min_value: config.min,
            max_value: config.max,
            moving_avg: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Read the current temperature in millidegrees C.
    pub fn read_value(&self) -> Result<i64> {
        sysfs::read_integer(&self.input_path)
    }

    /// Latest published moving average, millidegrees C.
    pub fn moving_avg(&self) -> f64 {
        f64::from_bits(self.moving_avg.load(Ordering::Relaxed))
    }

    pub(crate) fn publish_moving_avg(&self, value: f64) {
        self.moving_avg.store(value.to_bits(), Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

/// Periodic task keeping one sensor's moving average fresh.
pub struct SensorMonitor {
    sensor: Arc<Sensor>,
    poll_rate: Duration,
    window: RollingWindow,
}

impl SensorMonitor {
    pub fn new(sensor: Arc<Sensor>, poll_rate: Duration) -> Self {
        let mut window = RollingWindow::new(TEMP_ROLLING_WINDOW_SIZE);
        // the binder seeds the average with one synchronous read; start
        // the window from that value rather than from empty
        window.push(sensor.moving_avg());
        Self {
            sensor,
            poll_rate,
            window,
        }
    }

    pub async fn run(mut self, shutdown: ShutdownToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.poll_rate);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => self.sample(),
                _ = shutdown.cancelled() => {
                    log::info!("Sensor monitor {} stopping", self.sensor.id);
                    return Ok(());
                }
            }
        }
    }

    fn sample(&mut self) {
        let value = match self.sensor.read_value() {
            Ok(v) => v,
            Err(e) => {
                // transient: keep the last average, try again next tick
                log::warn!("Sensor {}: {e}", self.sensor.id);
                return;
            }
        };

        if value < self.sensor.min_value || value > self.sensor.max_value {
            log::warn!(
                "Sensor {}: reading {value} outside plausible range [{}, {}]",
                self.sensor.id,
                self.sensor.min_value,
                self.sensor.max_value
            );
        }

        self.window.push(value as f64);
        self.sensor.publish_moving_avg(self.window.avg());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::fs;

    fn sensor_config() -> SensorConfig {
        SensorConfig {
            id: "cpu_temp".to_string(),
            platform: "mockchip".to_string(),
            index: 1,
            min: 0,
            max: 100_000,
        }
    }

    #[test]
    fn test_read_value_parses_millidegrees() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("temp1_input");
        fs::write(&input, "54000\n").unwrap();

        let sensor = Sensor::new(&sensor_config(), "CPU".to_string(), input);
        assert_eq!(sensor.read_value().unwrap(), 54000);
    }

    #[test]
    fn test_read_value_missing_file() {
        let sensor = Sensor::new(
            &sensor_config(),
            "CPU".to_string(),
            PathBuf::from("/nonexistent/temp1_input"),
        );
        assert!(matches!(sensor.read_value(), Err(Error::SysfsRead { .. })));
    }

    #[test]
    fn test_read_value_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("temp1_input");
        fs::write(&input, "not-a-number\n").unwrap();

        let sensor = Sensor::new(&sensor_config(), "CPU".to_string(), input);
        assert!(matches!(sensor.read_value(), Err(Error::SysfsParse { .. })));
    }

    #[test]
    fn test_moving_avg_publication() {
        let tmp = tempfile::tempdir().unwrap();
        let input = tmp.path().join("temp1_input");
        fs::write(&input, "60000\n").unwrap();

        let sensor = Arc::new(Sensor::new(&sensor_config(), "CPU".to_string(), input));
        sensor.publish_moving_avg(60000.0);

        let mut monitor = SensorMonitor::new(sensor.clone(), Duration::from_millis(10));
        monitor.sample();
        assert_eq!(sensor.moving_avg(), 60000.0);
    }
}
