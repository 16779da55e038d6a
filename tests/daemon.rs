// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! End-to-end scenarios against a mock sysfs.
//!
//! A temp directory stands in for `/sys/class/hwmon`; a background task
//! plays the kernel, mapping PWM writes to tachometer readings through
//! a simple bench model so characterization and stall detection can be
//! exercised for real.

use fancurved::bind::{self, AppContext};
use fancurved::config::{Config, CurveConfig, CurveKind, FanConfig, SensorConfig};
use fancurved::controller::{ControllerSettings, FanController, RpmSampler};
use fancurved::error::Error;
use fancurved::persistence::{FanCurveSnapshot, Persistence};
use fancurved::supervisor::{ShutdownToken, Supervisor};
use fancurved::sysfs::SysfsProbe;
use serial_test::serial;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Mock rig
// ---------------------------------------------------------------------------

struct MockRig {
    _tmp: TempDir,
    hwmon_root: PathBuf,
    device: PathBuf,
    db: PathBuf,
}

impl MockRig {
    /// One controller ("mockchip") with pwm1 + fan1_input + temp1_input.
    /// The fan starts at PWM 0 in automatic mode (`pwm1_enable = 2`).
    fn new(temp_millic: i64) -> Self {
        let tmp = TempDir::new().unwrap();
        let hwmon_root = tmp.path().join("hwmon");
        let device = hwmon_root.join("hwmon0");
        fs::create_dir_all(&device).unwrap();
        fs::write(device.join("name"), "mockchip\n").unwrap();
        fs::write(device.join("pwm1"), "0\n").unwrap();
        fs::write(device.join("pwm1_enable"), "2\n").unwrap();
        fs::write(device.join("fan1_input"), "0\n").unwrap();
        fs::write(device.join("temp1_input"), format!("{temp_millic}\n")).unwrap();

        let db = tmp.path().join("db");
        Self {
            _tmp: tmp,
            hwmon_root,
            device,
            db,
        }
    }

    fn config(&self) -> Config {
        Config {
            db_path: self.db.clone(),
            temp_sensor_polling_rate_ms: 10,
            rpm_polling_rate_ms: 5,
            rpm_rolling_window_size: 10,
            controller_adjustment_tick_rate_ms: 10,
            characterization_dwell_ms: 10,
            characterization_step: 10,
            // far beyond any test's runtime; stall tests dial it down
            stall_timeout_ms: 10_000,
            sensors: vec![SensorConfig {
                id: "cpu_temp".to_string(),
                platform: "mockchip".to_string(),
                index: 1,
                min: 0,
                max: 120_000,
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
        }
    }

    fn bind(&self, config: &Config) -> AppContext {
        let controllers = SysfsProbe::with_roots(&self.hwmon_root, self.hwmon_root.join("no-i2c"))
            .find_controllers();
        bind::bind(&controllers, config).unwrap()
    }

    fn read(&self, file: &str) -> String {
        fs::read_to_string(self.device.join(file))
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    /// Play the kernel: every millisecond, map the current PWM through
    /// the bench model and update the tachometer file.
    fn spawn_rpm_model(&self, token: ShutdownToken) -> tokio::task::JoinHandle<()> {
        let pwm_path = self.device.join("pwm1");
        let rpm_path = self.device.join("fan1_input");
        let staging = self.device.join("fan1_input.next");
        tokio::spawn(async move {
            while !token.is_cancelled() {
                if let Ok(raw) = fs::read_to_string(&pwm_path) {
                    if let Ok(pwm) = raw.trim().parse::<i64>() {
                        // rename so readers never observe a torn write
                        if fs::write(&staging, format!("{}\n", bench_rpm(pwm))).is_ok() {
                            let _ = fs::rename(&staging, &rpm_path);
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    }
}

/// rpm(pwm) = max(0, 20 * (pwm - 40)): dead below PWM 41, 4200 at 250.
fn bench_rpm(pwm: i64) -> i64 {
    (20 * (pwm - 40)).max(0)
}

/// The snapshot a characterization sweep of the bench model produces.
fn bench_snapshot() -> FanCurveSnapshot {
    (0..=250)
        .step_by(10)
        .map(|pwm| (pwm as u8, vec![bench_rpm(pwm) as f64]))
        .collect()
}

fn spawn_controller(
    ctx: &AppContext,
    config: &Config,
    token: &ShutdownToken,
) -> tokio::task::JoinHandle<Result<(), Error>> {
    let controller = FanController::new(
        ctx.fans[0].clone(),
        ctx.curves.clone(),
        Arc::new(Persistence::new(config.db_path.clone())),
        ControllerSettings::from_config(config),
    );
    tokio::spawn(controller.run(token.clone()))
}

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// With no persisted data the controller sweeps the PWM range down and
/// back up in steps of 10, persists one window per visited PWM, and
/// derives the fan's usable range from the samples.
#[tokio::test]
async fn test_characterization_sweep_and_persistence() {
    let rig = MockRig::new(60_000);
    let config = rig.config();
    let ctx = rig.bind(&config);
    let fan = ctx.fans[0].clone();

    let token = ShutdownToken::new();
    let model = rig.spawn_rpm_model(token.clone());
    let handle = spawn_controller(&ctx, &config, &token);

    let store = Persistence::new(config.db_path.clone());
    wait_until(|| store.load("cpu_fan").is_some(), "persisted characterization").await;

    let data = store.load("cpu_fan").unwrap();
    let expected_keys: Vec<u8> = (0..=250).step_by(10).map(|v| v as u8).collect();
    let keys: Vec<u8> = data.keys().copied().collect();
    assert_eq!(keys, expected_keys);

    assert_eq!(fan.start_pwm(), 50);
    assert_eq!(fan.max_pwm(), 250);
    assert!(fan.min_pwm() <= fan.start_pwm() && fan.start_pwm() <= fan.max_pwm());

    token.cancel();
    handle.await.unwrap().unwrap();
    model.await.unwrap();

    // restoration put the fan back into automatic mode
    assert_eq!(rig.read("pwm1_enable"), "2");
}

/// With persisted data the controller goes straight to steady-state
/// control. 60C on a [40C, 80C] window targets 128, which the fan's
/// measured [50, 250] range maps to an effective PWM of 150.
#[tokio::test]
async fn test_steady_state_control() {
    let rig = MockRig::new(60_000);
    let config = rig.config();
    Persistence::new(config.db_path.clone())
        .save("cpu_fan", &bench_snapshot())
        .unwrap();

    let ctx = rig.bind(&config);
    let token = ShutdownToken::new();
    let handle = spawn_controller(&ctx, &config, &token);

    wait_until(|| rig.read("pwm1") == "150", "effective PWM of 150").await;
    assert_eq!(rig.read("pwm1_enable"), "1");

    token.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(rig.read("pwm1_enable"), "2");
}

/// A fan that reads 0 RPM at a duty cycle that should spin it is
/// declared stuck after the stall timeout, and restoration still puts
/// the original enable mode back.
#[tokio::test]
async fn test_stall_recovery() {
    let rig = MockRig::new(60_000);
    let mut config = rig.config();
    config.stall_timeout_ms = 60;
    Persistence::new(config.db_path.clone())
        .save("cpu_fan", &bench_snapshot())
        .unwrap();

    let ctx = rig.bind(&config);
    let token = ShutdownToken::new();

    // the tachometer file stays at 0: the sampler keeps publishing a
    // zero moving average while the controller drives PWM 150
    let sampler = RpmSampler::new(
        ctx.fans[0].clone(),
        config.rpm_polling_rate(),
        config.rpm_rolling_window_size,
    );
    let sampler_handle = tokio::spawn(sampler.run(token.clone()));
    let handle = spawn_controller(&ctx, &config, &token);

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("controller should give up on a stuck fan")
        .unwrap();
    assert!(matches!(outcome, Err(Error::FanStuck(_))));
    assert_eq!(rig.read("pwm1_enable"), "2");

    token.cancel();
    sampler_handle.await.unwrap().unwrap();
}

/// SIGTERM mid-run shuts the whole supervisor down cleanly and leaves
/// every fan either restored or at full speed.
#[tokio::test]
#[serial]
async fn test_sigterm_shuts_down_and_restores() {
    let rig = MockRig::new(60_000);
    let config = rig.config();
    Persistence::new(config.db_path.clone())
        .save("cpu_fan", &bench_snapshot())
        .unwrap();

    let ctx = rig.bind(&config);
    let token = ShutdownToken::new();
    let model = rig.spawn_rpm_model(token.clone());
    let supervisor = Supervisor::new(ctx, config).without_root_check();
    let handle = tokio::spawn(supervisor.run(token.clone()));

    wait_until(|| rig.read("pwm1") == "150", "the control loop to engage").await;
    // SAFETY: sending ourselves a signal the supervisor has a handler for
    unsafe { libc::kill(libc::getpid(), libc::SIGTERM) };

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor should shut down on SIGTERM")
        .unwrap();
    assert!(outcome.is_ok());
    model.await.unwrap();

    let restored = rig.read("pwm1_enable") == "2" || rig.read("pwm1") == "255";
    assert!(restored, "fan neither restored nor at full speed");
}

/// A curve cycle is rejected at bind time, before anything touches
/// sysfs.
#[tokio::test]
async fn test_curve_cycle_rejected_before_any_write() {
    let rig = MockRig::new(60_000);
    let mut config = rig.config();
    config.curves = vec![
        CurveConfig {
            id: "a".to_string(),
            kind: CurveKind::Function {
                function: fancurved::config::CurveFunction::Max,
                curves: vec!["b".to_string()],
            },
        },
        CurveConfig {
            id: "b".to_string(),
            kind: CurveKind::Function {
                function: fancurved::config::CurveFunction::Max,
                curves: vec!["a".to_string()],
            },
        },
    ];
    config.fans[0].curve = "a".to_string();

    let controllers = SysfsProbe::with_roots(&rig.hwmon_root, rig.hwmon_root.join("no-i2c"))
        .find_controllers();
    let err = bind::bind(&controllers, &config).unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    // nothing was written
    assert_eq!(rig.read("pwm1"), "0");
    assert_eq!(rig.read("pwm1_enable"), "2");
}
