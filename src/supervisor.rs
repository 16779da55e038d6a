// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Task supervision and shutdown.
//!
//! The supervisor owns every task of the daemon: one monitor per
//! sensor, one controller plus one RPM sampler per fan, and a signal
//! listener. All of them share a [`ShutdownToken`]; the first task
//! error (or SIGINT/SIGTERM) cancels the rest, and the supervisor
//! returns only after every fan controller has finished restoring its
//! fan.

use crate::bind::AppContext;
use crate::config::Config;
use crate::controller::{ControllerSettings, FanController, RpmSampler};
use crate::error::{Error, Result};
use crate::persistence::Persistence;
use crate::sensor::SensorMonitor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinSet;

// ---------------------------------------------------------------------------
// Shutdown token
// ---------------------------------------------------------------------------

/// Shared cancellation flag. Tasks poll [`ShutdownToken::cancelled`] in
/// their tick loops and must observe a cancel within one tick period.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // register interest before checking the flag, so a cancel
            // racing with this call cannot be lost
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Root check
// ---------------------------------------------------------------------------

/// Fan control writes to /sys, which needs euid 0.
pub fn require_root() -> Result<()> {
    // SAFETY: geteuid just returns the process's effective user id
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(Error::NotRoot);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    ctx: AppContext,
    config: Config,
    check_root: bool,
}

impl Supervisor {
    pub fn new(ctx: AppContext, config: Config) -> Self {
        Self {
            ctx,
            config,
            check_root: true,
        }
    }

    /// Skip the euid check. Integration tests drive a mock sysfs and
    /// don't need privileges.
    pub fn without_root_check(mut self) -> Self {
        self.check_root = false;
        self
    }

    /// Run every task to completion. Returns the first task error, or
    /// `Ok(())` after a clean signal-initiated shutdown.
    pub async fn run(self, shutdown: ShutdownToken) -> Result<()> {
        if self.check_root {
            require_root()?;
        }
        if self.ctx.fans.is_empty() {
            return Err(Error::config("no valid fan configurations"));
        }

        let persistence = Arc::new(Persistence::new(self.config.db_path.clone()));
        let settings = ControllerSettings::from_config(&self.config);
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for sensor in self.ctx.sensors.values() {
            let monitor = SensorMonitor::new(sensor.clone(), self.config.temp_polling_rate());
            tasks.spawn(monitor.run(shutdown.clone()));
        }

        for fan in &self.ctx.fans {
            let controller = FanController::new(
                fan.clone(),
                self.ctx.curves.clone(),
                persistence.clone(),
                settings.clone(),
            );
            tasks.spawn(controller.run(shutdown.clone()));

            let sampler = RpmSampler::new(
                fan.clone(),
                self.config.rpm_polling_rate(),
                self.config.rpm_rolling_window_size,
            );
            tasks.spawn(sampler.run(shutdown.clone()));
        }

        tasks.spawn(wait_for_signals(shutdown.clone()));

        log::info!(
            "Supervising {} sensor(s) and {} fan(s)",
            self.ctx.sensors.len(),
            self.ctx.fans.len()
        );

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("Task failed: {e}");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    shutdown.cancel();
                }
                Err(e) => {
                    log::error!("Task panicked: {e}");
                    shutdown.cancel();
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!("All tasks stopped, exiting");
                Ok(())
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM and cancel the shared token. Finishes
/// silently when some other task cancels first.
async fn wait_for_signals(shutdown: ShutdownToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| Error::config(format!("cannot install SIGINT handler: {e}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| Error::config(format!("cannot install SIGTERM handler: {e}")))?;

    tokio::select! {
        _ = sigint.recv() => log::info!("Received SIGINT, exiting..."),
        _ = sigterm.recv() => log::info!("Received SIGTERM, exiting..."),
        _ = shutdown.cancelled() => return Ok(()),
    }

    shutdown.cancel();
    Ok(())
}
