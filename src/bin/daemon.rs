// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! fancurved: fan control daemon.
//!
//! Without a subcommand this runs the control loops until SIGINT or
//! SIGTERM; `fancurved detect` probes the hardware and prints what it
//! finds.

use clap::{Parser, Subcommand};
use fancurved::bind;
use fancurved::config::{self, Config};
use fancurved::fan::PWM_ENABLE_AUTO;
use fancurved::supervisor::{ShutdownToken, Supervisor};
use fancurved::sysfs::{self, Controller, SysfsProbe};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "fancurved", about = "Linux fan control daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect fans and sensors and print them as a list.
    Detect,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config_path = config::resolve_config_path(Some(&cli.config));
    let cfg = config::load_config(&config_path)?;

    match cli.command {
        Some(Command::Detect) => {
            detect();
            Ok(())
        }
        None => run_daemon(cfg).await,
    }
}

async fn run_daemon(cfg: Config) -> anyhow::Result<()> {
    let controllers = SysfsProbe::new().find_controllers();
    log::info!("Discovered {} controller(s)", controllers.len());

    let ctx = bind::bind(&controllers, &cfg)?;
    let supervisor = Supervisor::new(ctx, cfg);
    supervisor.run(ShutdownToken::new()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Detect
// ---------------------------------------------------------------------------

fn detect() {
    let controllers = SysfsProbe::new().find_controllers();
    if controllers.is_empty() {
        println!("No hwmon controllers found");
        return;
    }

    for controller in &controllers {
        print_controller(controller);
    }
}

fn print_controller(controller: &Controller) {
    println!("> {} (platform: {})", controller.identifier, controller.platform);

    if !controller.pwm_outputs.is_empty() {
        println!("  {:<7} {:>5}  {:<16} {:>6} {:>4} {:>5}", "Fans", "Index", "Label", "RPM", "PWM", "Auto");
        for (&index, pwm_path) in &controller.pwm_outputs {
            let rpm = controller
                .rpm_inputs
                .get(&index)
                .map(|p| sysfs::read_string(p))
                .unwrap_or_default();
            let label = controller
                .rpm_inputs
                .get(&index)
                .map(|p| sysfs::read_label(p))
                .unwrap_or_else(|| format!("fan{index}"));
            let pwm = sysfs::read_string(pwm_path);
            let enable_path = {
                let file = pwm_path.file_name().unwrap_or_default().to_string_lossy();
                pwm_path.with_file_name(format!("{file}_enable"))
            };
            let auto = sysfs::read_string(&enable_path) == PWM_ENABLE_AUTO.to_string();
            println!("  {:<7} {:>5}  {:<16} {:>6} {:>4} {:>5}", "", index, label, rpm, pwm, auto);
        }
    }

    if !controller.temp_inputs.is_empty() {
        println!("  {:<7} {:>5}  {:<16} {:>8}", "Sensors", "Index", "Label", "Value");
        for (&index, input) in &controller.temp_inputs {
            let label = sysfs::read_label(input);
            let value = sysfs::read_string(input);
            println!("  {:<7} {:>5}  {:<16} {:>8}", "", index, label, value);
        }
    }

    println!();
}
