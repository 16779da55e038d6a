// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Binding declarative configs to discovered hardware.
//!
//! Sensors and fans are matched to controllers by `(platform, index)`;
//! a config entry that matches nothing is a fatal configuration error.
//! The result is the application context all tasks share: maps built
//! once here and read-only afterwards.

use crate::config::Config;
use crate::curve::CurveRegistry;
use crate::error::{Error, Result};
use crate::fan::Fan;
use crate::sensor::Sensor;
use crate::sysfs::{self, Controller};
use std::collections::HashMap;
use std::sync::Arc;

/// Everything the supervisor's tasks operate on. Constructed once at
/// startup; object references stay stable for the process lifetime.
#[derive(Debug)]
pub struct AppContext {
    pub sensors: HashMap<String, Arc<Sensor>>,
    pub fans: Vec<Arc<Fan>>,
    pub curves: Arc<CurveRegistry>,
}

/// Match every configured sensor, curve and fan against the discovered
/// controllers and build the shared context.
pub fn bind(controllers: &[Controller], config: &Config) -> Result<AppContext> {
    let mut sensors: HashMap<String, Arc<Sensor>> = HashMap::new();

    for sensor_config in &config.sensors {
        let input = controllers
            .iter()
            .filter(|c| c.platform == sensor_config.platform)
            .find_map(|c| c.temp_inputs.get(&sensor_config.index))
            .ok_or_else(|| {
                Error::config(format!(
                    "sensor {:?} matches no controller (platform {:?}, temp index {})",
                    sensor_config.id, sensor_config.platform, sensor_config.index
                ))
            })?;

        let label = sysfs::read_label(input);
        let sensor = Arc::new(Sensor::new(sensor_config, label, input.clone()));

        // seed the moving average so curves see a real temperature
        // before the monitor's first tick
        let initial = sensor.read_value()?;
        sensor.publish_moving_avg(initial as f64);

        log::debug!(
            "Mapped sensor config {} to {}",
            sensor.id,
            sensor.input_path.display()
        );
        if sensors.insert(sensor.id.clone(), sensor).is_some() {
            return Err(Error::config(format!(
                "duplicate sensor id {:?}",
                sensor_config.id
            )));
        }
    }

    let curves = Arc::new(CurveRegistry::build(&config.curves, &sensors)?);

    let mut fans: Vec<Arc<Fan>> = Vec::new();
    for fan_config in &config.fans {
        let (pwm_output, rpm_input) = controllers
            .iter()
            .filter(|c| c.platform == fan_config.platform)
            .find_map(|c| {
                let pwm = c.pwm_outputs.get(&fan_config.index)?;
                let rpm = c.rpm_inputs.get(&fan_config.index)?;
                Some((pwm, rpm))
            })
            .ok_or_else(|| {
                Error::config(format!(
                    "fan {:?} matches no controller (platform {:?}, pwm index {})",
                    fan_config.id, fan_config.platform, fan_config.index
                ))
            })?;

        if !curves.contains(&fan_config.curve) {
            return Err(Error::config(format!(
                "fan {:?} references unknown curve {:?}",
                fan_config.id, fan_config.curve
            )));
        }
        if fans.iter().any(|f| f.id == fan_config.id) {
            return Err(Error::config(format!(
                "duplicate fan id {:?}",
                fan_config.id
            )));
        }

        let label = sysfs::read_label(rpm_input);
        let fan = Fan::new(
            fan_config,
            label,
            pwm_output.clone(),
            rpm_input.clone(),
            config.rpm_rolling_window_size,
        )?;

        log::debug!(
            "Mapped fan config {} to {} (original pwm_enable={})",
            fan.id,
            fan.pwm_path.display(),
            fan.original_pwm_enable()
        );
        fans.push(Arc::new(fan));
    }

    Ok(AppContext {
        sensors,
        fans,
        curves,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CurveConfig, CurveKind, FanConfig, SensorConfig};
    use crate::sysfs::SysfsProbe;
    use std::fs;
    use std::path::Path;

    fn mock_device(root: &Path) {
        let dev = root.join("hwmon0");
        fs::create_dir_all(&dev).unwrap();
        fs::write(dev.join("name"), "mockchip\n").unwrap();
        fs::write(dev.join("pwm1"), "128\n").unwrap();
        fs::write(dev.join("pwm1_enable"), "2\n").unwrap();
        fs::write(dev.join("fan1_input"), "900\n").unwrap();
        fs::write(dev.join("temp1_input"), "42000\n").unwrap();
    }

    fn base_config() -> Config {
        Config {
            sensors: vec![SensorConfig {
                id: "cpu_temp".to_string(),
                platform: "mockchip".to_string(),
                index: 1,
                min: 0,
                max: 100_000,
            }],
            fans: vec![FanConfig {
                id: "cpu_fan".to_string(),
                platform: "mockchip".to_string(),
                index: 1,
                curve: "cpu_curve".to_string(),
                never_stop: false,
            }],
            curves: vec![CurveConfig {
                id: "cpu_curve".to_string(),
                kind: CurveKind::Linear {
                    sensor: "cpu_temp".to_string(),
                    min_temp: Some(40_000),
                    max_temp: Some(80_000),
                    steps: None,
                },
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_bind_matches_by_platform_and_index() {
        let tmp = tempfile::tempdir().unwrap();
        mock_device(tmp.path());
        let controllers =
            SysfsProbe::with_roots(tmp.path(), tmp.path().join("no-i2c")).find_controllers();

        let ctx = bind(&controllers, &base_config()).unwrap();
        assert_eq!(ctx.fans.len(), 1);
        assert_eq!(ctx.fans[0].original_pwm_enable(), 2);
        // moving average seeded from the first read
        assert_eq!(ctx.sensors["cpu_temp"].moving_avg(), 42_000.0);
    }

    #[test]
    fn test_unbound_sensor_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        mock_device(tmp.path());
        let controllers =
            SysfsProbe::with_roots(tmp.path(), tmp.path().join("no-i2c")).find_controllers();

        let mut config = base_config();
        config.sensors[0].platform = "otherchip".to_string();
        assert!(matches!(
            bind(&controllers, &config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_unbound_fan_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        mock_device(tmp.path());
        let controllers =
            SysfsProbe::with_roots(tmp.path(), tmp.path().join("no-i2c")).find_controllers();

        let mut config = base_config();
        config.fans[0].index = 3;
        assert!(matches!(
            bind(&controllers, &config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_fan_with_unknown_curve_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        mock_device(tmp.path());
        let controllers =
            SysfsProbe::with_roots(tmp.path(), tmp.path().join("no-i2c")).find_controllers();

        let mut config = base_config();
        config.fans[0].curve = "ghost".to_string();
        assert!(matches!(
            bind(&controllers, &config),
            Err(Error::Config(_))
        ));
    }
}
