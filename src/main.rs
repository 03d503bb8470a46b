use std::{
    io::{self, Write},
    process::{self, ExitCode},
};

use anyhow::Result;
use burn::{backend::Autodiff, train::TrainingInterrupter};
use clap::Parser;
use cli::{Args, Settings};
use error::ConfigError;
use tracing_subscriber::EnvFilter;
use training::{default_device, train, StopReason};

pub mod artifact;
pub mod cli;
pub mod data;
pub mod error;
pub mod model;
pub mod module;
pub mod symbols;
pub mod training;

#[cfg(feature = "wgpu")]
type Backend = burn::backend::Wgpu<f32, i32>;

#[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
type Backend = burn::backend::NdArray<f32>;

type AutodiffBackend = Autodiff<Backend>;

/// Exit status used when a second interrupt aborts the emergency save.
const ABORT_STATUS: i32 = 130;

const CONFIG_ERROR_STATUS: u8 = 1;

fn interrupter() -> Result<TrainingInterrupter> {
    let interrupter = TrainingInterrupter::new();
    let handle = interrupter.clone();

    ctrlc::set_handler(move || {
        if handle.should_stop() {
            process::exit(ABORT_STATUS);
        }
        handle.stop();
    })?;

    Ok(interrupter)
}

fn run(settings: Settings) -> Result<()> {
    let report = train::<AutodiffBackend>(
        &settings,
        default_device::<AutodiffBackend>(),
        interrupter()?,
    )?;

    match report.stop {
        StopReason::Completed => tracing::info!("Trained for {} epochs", report.epochs.len()),
        StopReason::EarlyStopped => {
            tracing::info!("Stopped early after {} epochs", report.epochs.len())
        }
        StopReason::Interrupted => tracing::info!(
            "Training interrupted after {} complete epochs",
            report.epochs.len()
        ),
    }

    Ok(())
}

/// Configuration problems are printed to stdout and end the process with
/// status 1.
fn config_failure(out: &mut impl Write, err: &ConfigError) -> u8 {
    // Nothing useful is left to do if stdout is gone.
    let _ = writeln!(out, "{err}");
    CONFIG_ERROR_STATUS
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("captcha_trainer=info")),
        )
        .init();

    let settings = match Args::parse().into_settings() {
        Ok(settings) => settings,
        Err(err) => {
            return ExitCode::from(config_failure(&mut io::stdout(), &err));
        }
    };

    match run(settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<ConfigError>() {
            Some(config_error) => {
                ExitCode::from(config_failure(&mut io::stdout(), config_error))
            }
            None => {
                tracing::error!("{err:#}");
                ExitCode::FAILURE
            }
        },
    }
}
