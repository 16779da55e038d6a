// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! PWM fan access and characterization data.
//!
//! A [`Fan`] wraps a `pwmN` output and its paired `fanN_input`
//! tachometer. Besides raw reads and writes it tracks the PWM range the
//! fan actually responds to (`min_pwm`/`start_pwm`/`max_pwm`), derived
//! from per-PWM RPM observations collected during characterization.

use crate::config::FanConfig;
use crate::error::{Error, Result};
use crate::rolling::RollingWindow;
use crate::sysfs;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI16, AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

pub const MIN_PWM_VALUE: u8 = 0;
pub const MAX_PWM_VALUE: u8 = 255;

/// `pwmN_enable` modes. 0 disables control, 3/5 are vendor-specific.
pub const PWM_ENABLE_MANUAL: u8 = 1;
pub const PWM_ENABLE_AUTO: u8 = 2;

/// Sentinel for "the controller never wrote this fan".
const PWM_NEVER_SET: i16 = -1;

// ---------------------------------------------------------------------------
// Fan
// ---------------------------------------------------------------------------

/// A configured fan, bound to a controller at startup.
///
/// Scalar state (boundaries, last set PWM, RPM average) is published
/// atomically: the controller task writes the PWM fields, the RPM
/// sampler writes the average and the curve data, and either side may
/// read the other's latest snapshot.
#[derive(Debug)]
pub struct Fan {
    pub id: String,
    pub label: String,
    pub index: u8,
    /// Absolute path to the `pwmN` file.
    pub pwm_path: PathBuf,
    /// Absolute path to the `fanN_input` file.
    pub rpm_path: PathBuf,
    /// Absolute path to the `pwmN_enable` file.
    pub enable_path: PathBuf,
    pub never_stop: bool,
    /// Curve that drives this fan.
    pub curve_id: String,
    /// Enable mode captured at startup, restored at shutdown.
    original_pwm_enable: u8,

    min_pwm: AtomicU8,
    start_pwm: AtomicU8,
    max_pwm: AtomicU8,
    /// Last value written through [`Fan::set_pwm`], or [`PWM_NEVER_SET`].
    last_set_pwm: AtomicI16,
    /// f64 bits of the RPM moving average.
    rpm_avg: AtomicU64,

    window_size: usize,
    /// PWM -> rolling window of RPM observations.
    curve_data: Mutex<BTreeMap<u8, RollingWindow>>,
}

impl Fan {
    /// Bind a configured fan to its sysfs files. Reads and remembers the
    /// current `pwm_enable` mode so it can be restored at shutdown; a fan
    /// whose enable mode cannot be read is not controllable.
    pub fn new(
        config: &FanConfig,
        label: String,
        pwm_path: PathBuf,
        rpm_path: PathBuf,
        window_size: usize,
    ) -> Result<Self> {
        let enable_path = {
            let file = pwm_path.file_name().unwrap_or_default().to_string_lossy();
            pwm_path.with_file_name(format!("{file}_enable"))
        };
        let original_pwm_enable = sysfs::read_integer(&enable_path)?.clamp(0, u8::MAX as i64) as u8;
        Ok(Self {
            id: config.id.clone(),
            label,
            index: config.index,
            pwm_path,
            rpm_path,
            enable_path,
            never_stop: config.never_stop,
            curve_id: config.curve.clone(),
            original_pwm_enable,
            min_pwm: AtomicU8::new(MIN_PWM_VALUE),
            start_pwm: AtomicU8::new(MIN_PWM_VALUE),
            max_pwm: AtomicU8::new(MAX_PWM_VALUE),
            last_set_pwm: AtomicI16::new(PWM_NEVER_SET),
            rpm_avg: AtomicU64::new(0f64.to_bits()),
            window_size,
            curve_data: Mutex::new(BTreeMap::new()),
        })
    }

    // -- sysfs operations ---------------------------------------------------

    /// Current duty cycle, 0-255.
    pub fn read_pwm(&self) -> Result<u8> {
        Ok(sysfs::read_integer(&self.pwm_path)?.clamp(0, 255) as u8)
    }

    /// Current fan speed in RPM.
    pub fn read_rpm(&self) -> Result<u32> {
        Ok(sysfs::read_integer(&self.rpm_path)?.max(0) as u32)
    }

    /// Write a duty cycle. Skipped when `value` matches the last write
    /// and the kernel still reports it (the kernel did not silently
    /// change the duty cycle underneath us).
    pub fn set_pwm(&self, value: u8) -> Result<()> {
        if self.last_set_pwm() == Some(value) && self.read_pwm().ok() == Some(value) {
            return Ok(());
        }
        sysfs::write_integer(&self.pwm_path, value as i64)?;
        self.last_set_pwm.store(value as i16, Ordering::Relaxed);
        Ok(())
    }

    pub fn read_pwm_enable(&self) -> Result<u8> {
        Ok(sysfs::read_integer(&self.enable_path)?.clamp(0, u8::MAX as i64) as u8)
    }

    pub fn set_pwm_enable(&self, mode: u8) -> Result<()> {
        sysfs::write_integer(&self.enable_path, mode as i64)
    }

    /// True when the kernel is driving the fan itself.
    pub fn is_pwm_auto(&self) -> Result<bool> {
        Ok(self.read_pwm_enable()? == PWM_ENABLE_AUTO)
    }

    /// Force manual mode so that subsequent `set_pwm` writes stick.
    pub fn ensure_manual(&self) -> Result<()> {
        if self.read_pwm_enable()? != PWM_ENABLE_MANUAL {
            self.set_pwm_enable(PWM_ENABLE_MANUAL)?;
        }
        Ok(())
    }

    // -- published scalar state ---------------------------------------------

    pub fn original_pwm_enable(&self) -> u8 {
        self.original_pwm_enable
    }

    pub fn last_set_pwm(&self) -> Option<u8> {
        match self.last_set_pwm.load(Ordering::Relaxed) {
            PWM_NEVER_SET => None,
            v => Some(v as u8),
        }
    }

    pub fn min_pwm(&self) -> u8 {
        self.min_pwm.load(Ordering::Relaxed)
    }

    pub fn start_pwm(&self) -> u8 {
        self.start_pwm.load(Ordering::Relaxed)
    }

    pub fn max_pwm(&self) -> u8 {
        self.max_pwm.load(Ordering::Relaxed)
    }

    pub fn rpm_avg(&self) -> f64 {
        f64::from_bits(self.rpm_avg.load(Ordering::Relaxed))
    }

    pub(crate) fn publish_rpm_avg(&self, value: f64) {
        self.rpm_avg.store(value.to_bits(), Ordering::Relaxed);
    }

    // -- characterization data ----------------------------------------------

    /// Append an RPM observation to the rolling window of its PWM.
    pub fn record_rpm_sample(&self, pwm: u8, rpm: f64) {
        let mut data = self.curve_data.lock().unwrap();
        data.entry(pwm)
            .or_insert_with(|| RollingWindow::new(self.window_size))
            .push(rpm);
    }

    /// Window contents per PWM, for persistence.
    pub fn snapshot_curve_data(&self) -> BTreeMap<u8, Vec<f64>> {
        let data = self.curve_data.lock().unwrap();
        data.iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(&pwm, w)| (pwm, w.values()))
            .collect()
    }

    /// Derive `(start_pwm, max_pwm)` from the observations collected so
    /// far: `start_pwm` is the lowest PWM that produced any rotation,
    /// `max_pwm` the PWM with the highest average RPM (ties resolve to
    /// the lowest PWM). Without any data the full range is assumed.
    pub fn pwm_boundaries(&self) -> (u8, u8) {
        let data = self.curve_data.lock().unwrap();
        let averages: BTreeMap<u8, f64> = data
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(&pwm, w)| (pwm, w.avg()))
            .collect();

        if averages.is_empty() {
            return (MIN_PWM_VALUE, MAX_PWM_VALUE);
        }

        let mut start_pwm = MIN_PWM_VALUE;
        let mut max_pwm = MIN_PWM_VALUE;
        let mut max_rpm = f64::NEG_INFINITY;
        let mut seen_spin = false;

        for (&pwm, &avg) in &averages {
            if avg > max_rpm {
                max_rpm = avg;
                max_pwm = pwm;
            }
            if avg > 0.0 && !seen_spin {
                start_pwm = pwm;
                seen_spin = true;
            }
        }

        (start_pwm, max_pwm)
    }

    /// Store derived boundaries, keeping `min_pwm <= start_pwm <=
    /// max_pwm` intact and a floor of 1 for fans that must never stop.
    pub fn apply_boundaries(&self, start: u8, max: u8) {
        let start = if self.never_stop { start.max(1) } else { start };
        let max = max.max(start);
        self.start_pwm.store(start, Ordering::Relaxed);
        self.max_pwm.store(max, Ordering::Relaxed);
        self.min_pwm.store(start, Ordering::Relaxed);
    }

    /// Attach a persisted characterization snapshot: rebuild the rolling
    /// windows from the raw samples and derive the PWM boundaries.
    /// A snapshot without a single usable observation is rejected and
    /// triggers re-characterization.
    pub fn attach_curve_data(&self, snapshot: &BTreeMap<u8, Vec<f64>>) -> Result<()> {
        let usable = snapshot
            .values()
            .any(|samples| samples.iter().any(|v| v.is_finite()));
        if !usable {
            return Err(Error::persistence(format!(
                "no usable characterization data for fan {}",
                self.id
            )));
        }
        if snapshot
            .values()
            .flatten()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(Error::persistence(format!(
                "corrupt characterization data for fan {}",
                self.id
            )));
        }

        {
            let mut data = self.curve_data.lock().unwrap();
            data.clear();
            for (&pwm, samples) in snapshot {
                data.insert(pwm, RollingWindow::from_values(self.window_size, samples));
            }
        }

        let (start, max) = self.pwm_boundaries();
        self.apply_boundaries(start, max);

        let dense = self.dense_rpm_table();
        log::debug!(
            "Fan {}: attached curve data, start_pwm={} max_pwm={} (expected RPM at full duty: {:.0})",
            self.id,
            self.start_pwm(),
            self.max_pwm(),
            dense[MAX_PWM_VALUE as usize]
        );
        Ok(())
    }

    /// Dense average-RPM table over the full PWM range, for diagnostics.
    pub fn dense_rpm_table(&self) -> Vec<f64> {
        let data = self.curve_data.lock().unwrap();
        let averages: BTreeMap<u8, f64> = data
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(&pwm, w)| (pwm, w.avg()))
            .collect();
        fill_dense(&averages)
    }
}

// ---------------------------------------------------------------------------
// Dense interpolation fill
// ---------------------------------------------------------------------------

/// Expand sparse per-PWM averages into a dense 256-entry table.
///
/// Gaps between defined PWMs are interpolated linearly; below the lowest
/// defined PWM the lowest average is repeated, above the highest the
/// highest. Filling an already-dense table is a no-op.
pub fn fill_dense(averages: &BTreeMap<u8, f64>) -> Vec<f64> {
    let mut table = vec![0.0; 256];
    if averages.is_empty() {
        return table;
    }

    let mut defined = averages.iter().map(|(&pwm, &avg)| (pwm as usize, avg));
    let (first_pwm, first_avg) = defined.next().unwrap();

    for slot in table.iter_mut().take(first_pwm) {
        *slot = first_avg;
    }
    table[first_pwm] = first_avg;

    let (mut prev_pwm, mut prev_avg) = (first_pwm, first_avg);
    for (pwm, avg) in defined {
        let span = (pwm - prev_pwm) as f64;
        for i in prev_pwm + 1..pwm {
            let ratio = (i - prev_pwm) as f64 / span;
            table[i] = prev_avg + ratio * (avg - prev_avg);
        }
        table[pwm] = avg;
        prev_pwm = pwm;
        prev_avg = avg;
    }

    for slot in table.iter_mut().skip(prev_pwm + 1) {
        *slot = prev_avg;
    }
    table
}
