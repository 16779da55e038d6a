// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Per-fan control tasks.
//!
//! Each configured fan gets a [`FanController`] running the state
//! machine init -> characterizing -> running -> restoring, plus an
//! [`RpmSampler`] that keeps the RPM moving average and the per-PWM
//! observation windows fresh. Restoration always runs before the
//! controller task returns, whether it stops through cancellation or
//! through an error.

use crate::config::Config;
use crate::curve::CurveRegistry;
use crate::error::{Error, Result};
use crate::fan::{Fan, MAX_PWM_VALUE};
use crate::persistence::Persistence;
use crate::rolling::RollingWindow;
use crate::supervisor::ShutdownToken;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// During characterization a fan counts as stuck when it reads 0 RPM at
/// a PWM this far above one it already spun at.
const STUCK_SAFETY_MARGIN: u8 = 20;

/// Transient tick failures tolerated before the controller gives up.
const MAX_CONSECUTIVE_TICK_ERRORS: u32 = 3;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Adjustment tick of the running control loop.
    pub tick_rate: Duration,
    /// Dwell at each PWM step of the characterization sweep.
    pub dwell: Duration,
    /// PWM decrement between sweep steps.
    pub sweep_step: u8,
    /// How long 0 RPM at a spinning duty cycle is tolerated.
    pub stall_timeout: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tick_rate: config.adjustment_tick_rate(),
            dwell: config.characterization_dwell(),
            sweep_step: config.characterization_step,
            stall_timeout: config.stall_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Fan controller
// ---------------------------------------------------------------------------

pub struct FanController {
    fan: Arc<Fan>,
    curves: Arc<CurveRegistry>,
    persistence: Arc<Persistence>,
    settings: ControllerSettings,
}

impl FanController {
    pub fn new(
        fan: Arc<Fan>,
        curves: Arc<CurveRegistry>,
        persistence: Arc<Persistence>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            fan,
            curves,
            persistence,
            settings,
        }
    }

    /// Drive the fan until cancellation or a fatal fan error. The
    /// original `pwm_enable` mode is restored (or the fan forced to
    /// full speed) before this returns.
    pub async fn run(self, shutdown: ShutdownToken) -> Result<()> {
        let outcome = self.control(&shutdown).await;
        if let Err(e) = &outcome {
            log::error!("Fan {}: {e}", self.fan.id);
        }
        self.restore();
        outcome
    }

    async fn control(&self, shutdown: &ShutdownToken) -> Result<()> {
        match self.persistence.load(&self.fan.id) {
            Some(data) => match self.fan.attach_curve_data(&data) {
                Ok(()) => log::info!(
                    "Fan {}: loaded characterization, start_pwm={} max_pwm={}",
                    self.fan.id,
                    self.fan.start_pwm(),
                    self.fan.max_pwm()
                ),
                Err(e) => {
                    log::warn!("Fan {}: {e}", self.fan.id);
                    self.characterize(shutdown).await?;
                }
            },
            None => self.characterize(shutdown).await?,
        }

        if shutdown.is_cancelled() {
            return Ok(());
        }
        self.run_loop(shutdown).await
    }

    /// One-shot sweep measuring the fan's RPM response across the PWM
    /// range: step from the top down to 0 and back up, dwelling at each
    /// step, then derive the usable PWM range and persist the samples.
    async fn characterize(&self, shutdown: &ShutdownToken) -> Result<()> {
        log::info!("Fan {}: starting characterization sweep", self.fan.id);
        self.fan.ensure_manual()?;

        let step = self.settings.sweep_step.max(1) as usize;
        let ascending: Vec<u8> = (0u16..=255).step_by(step).map(|v| v as u8).collect();
        let sweep: Vec<u8> = ascending
            .iter()
            .rev()
            .chain(ascending.iter())
            .copied()
            .collect();
        let mut observed_start: Option<u8> = None;

        for pwm in sweep {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            self.fan.set_pwm(pwm)?;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.dwell) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }

            let rpm = self.fan.read_rpm()?;
            self.fan.record_rpm_sample(pwm, rpm as f64);

            if rpm > 0 {
                observed_start = Some(observed_start.map_or(pwm, |s| s.min(pwm)));
            } else if let Some(start) = observed_start {
                if pwm >= start.saturating_add(STUCK_SAFETY_MARGIN) {
                    return Err(Error::FanStuck(self.fan.id.clone()));
                }
            }
        }

        let (start, max) = self.fan.pwm_boundaries();
        self.fan.apply_boundaries(start, max);
        log::info!(
            "Fan {}: sweep done, start_pwm={} max_pwm={}",
            self.fan.id,
            self.fan.start_pwm(),
            self.fan.max_pwm()
        );

        if let Err(e) = self
            .persistence
            .save(&self.fan.id, &self.fan.snapshot_curve_data())
        {
            // non-fatal: the fan just gets characterized again next start
            log::error!("Fan {}: could not persist characterization: {e}", self.fan.id);
        }
        Ok(())
    }

    async fn run_loop(&self, shutdown: &ShutdownToken) -> Result<()> {
        self.fan.ensure_manual()?;
        log::info!("Fan {}: entering control loop", self.fan.id);

        let mut tick = tokio::time::interval(self.settings.tick_rate);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut consecutive_errors = 0u32;
        let mut above_start_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.cancelled() => return Ok(()),
            }

            match self.step(&mut above_start_since) {
                Ok(()) => consecutive_errors = 0,
                Err(e @ Error::FanStuck(_)) => return Err(e),
                Err(e) => {
                    consecutive_errors += 1;
                    log::error!(
                        "Fan {}: control tick failed ({consecutive_errors} consecutive): {e}",
                        self.fan.id
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_TICK_ERRORS {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// One control tick: evaluate the curve, map the target through the
    /// fan's usable range, write it, and watch for a stall.
    fn step(&self, above_start_since: &mut Option<Instant>) -> Result<()> {
        let target = self.curves.evaluate(&self.fan.curve_id)?;
        let effective = effective_pwm(
            target,
            self.fan.min_pwm(),
            self.fan.max_pwm(),
            self.fan.start_pwm(),
            self.fan.never_stop,
        );
        self.fan.set_pwm(effective)?;

        if effective >= self.fan.start_pwm() {
            let since = above_start_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.settings.stall_timeout && self.fan.rpm_avg() <= 0.0 {
                return Err(Error::FanStuck(self.fan.id.clone()));
            }
        } else {
            *above_start_since = None;
        }
        Ok(())
    }

    /// Put the fan back the way we found it. Errors here never abort
    /// restoration; the last resort is full speed, so that an abandoned
    /// fan can never cook the machine.
    fn restore(&self) {
        let original = self.fan.original_pwm_enable();
        log::info!("Fan {}: restoring fan settings", self.fan.id);

        match self.fan.set_pwm_enable(original) {
            Ok(()) => {
                log::info!("Fan {}: restored pwm_enable={original}", self.fan.id);
                return;
            }
            Err(e) => {
                log::warn!("Fan {}: could not restore pwm_enable={original}: {e}", self.fan.id);
            }
        }

        match self.fan.set_pwm(MAX_PWM_VALUE) {
            Ok(()) => log::warn!("Fan {}: restored to maximum speed", self.fan.id),
            Err(e) => log::error!(
                "Fan {}: unable to restore fan, make sure it is running: {e}",
                self.fan.id
            ),
        }
    }
}

/// Map a curve target (0-255) into the fan's usable PWM range, raising
/// the result to `start_pwm` for fans that must never stop.
pub fn effective_pwm(target: u8, min_pwm: u8, max_pwm: u8, start_pwm: u8, never_stop: bool) -> u8 {
    let span = max_pwm.saturating_sub(min_pwm) as f64;
    let mut effective = (min_pwm as f64 + target as f64 / 255.0 * span).round() as u8;
    if never_stop && effective < start_pwm {
        effective = start_pwm;
    }
    effective
}

// ---------------------------------------------------------------------------
// RPM sampler
// ---------------------------------------------------------------------------

/// Periodic task appending `(current_pwm, current_rpm)` observations to
/// a fan's curve data and publishing its RPM moving average.
pub struct RpmSampler {
    fan: Arc<Fan>,
    poll_rate: Duration,
    window: RollingWindow,
}

impl RpmSampler {
    pub fn new(fan: Arc<Fan>, poll_rate: Duration, window_size: usize) -> Self {
        Self {
            fan,
            poll_rate,
            window: RollingWindow::new(window_size),
        }
    }

    pub async fn run(mut self, shutdown: ShutdownToken) -> Result<()> {
        let mut tick = tokio::time::interval(self.poll_rate);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => self.sample(),
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }

    fn sample(&mut self) {
        let (pwm, rpm) = match (self.fan.read_pwm(), self.fan.read_rpm()) {
            (Ok(pwm), Ok(rpm)) => (pwm, rpm),
            (Err(e), _) | (_, Err(e)) => {
                // transient, same as a skipped control tick
                log::debug!("Fan {}: RPM sample skipped: {e}", self.fan.id);
                return;
            }
        };

        log::debug!("Measured RPM {rpm} at PWM {pwm} for fan {}", self.fan.id);
        self.window.push(rpm as f64);
        self.fan.publish_rpm_avg(self.window.avg());
        self.fan.record_rpm_sample(pwm, rpm as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_pwm_maps_through_fan_range() {
        // a 60C reading on a [40C, 80C] window targets 128; a fan that
        // runs between 50 and 250 lands at 150
        assert_eq!(effective_pwm(128, 50, 250, 50, false), 150);
        assert_eq!(effective_pwm(0, 50, 250, 50, false), 50);
        assert_eq!(effective_pwm(255, 50, 250, 50, false), 250);
    }

    #[test]
    fn test_effective_pwm_never_stop_floor() {
        assert_eq!(effective_pwm(10, 0, 255, 60, true), 60);
        assert_eq!(effective_pwm(10, 0, 255, 60, false), 10);
        // above the floor the curve wins
        assert_eq!(effective_pwm(200, 0, 255, 60, true), 200);
    }

    #[test]
    fn test_effective_pwm_degenerate_range() {
        assert_eq!(effective_pwm(128, 100, 100, 100, false), 100);
    }
}
