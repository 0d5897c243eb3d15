//! pinlock command-line interface: enrollment, unlock, and freshness checks.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;
use pinlock_core::logging::{self, LogFormat};
use pinlock_core::{FileStore, LockPolicyEngine, PinlockConfig, UnlockOutcome};
use rpassword::prompt_password;
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

/// Exit status reported by `required` when the caller must prompt.
const EXIT_UNLOCK_REQUIRED: i32 = 2;

/// Top-level command-line options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "pinlock",
    version,
    about = "PIN re-authentication gate with brute-force lockout."
)]
struct Cli {
    /// Path to the pinlock configuration file.
    #[arg(short, long, default_value = "/etc/pinlock.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enroll a new PIN, replacing any existing one.
    Enroll {
        /// PIN to enroll; prompted twice when omitted.
        #[arg(long)]
        pin: Option<String>,
    },

    /// Remove the enrolled PIN. Lockout and unlock history are kept.
    Clear,

    /// Verify a PIN, prompting until it matches or lockout kicks in.
    ///
    /// Consecutive failures are counted per invocation; only an armed
    /// lockout window is persisted. Repeated one-shot `--pin` runs each
    /// start a fresh count and so never arm a lockout on their own; use
    /// the interactive prompt when brute-force protection matters.
    Unlock {
        /// PIN to try once without prompting (does not accumulate failures
        /// across invocations).
        #[arg(long)]
        pin: Option<String>,
    },

    /// Show enrollment, lockout, and last-unlock information.
    Status,

    /// Exit 0 when a recent unlock is still fresh, 2 when a prompt is needed.
    Required {
        /// Freshness window in seconds; defaults to policy.freshness_window_secs.
        #[arg(long)]
        within: Option<u64>,
    },

    /// Record a success from another credential source (e.g. biometrics).
    ExternalSuccess,

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = "/etc/pinlock.toml")]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

/// Dispatch to the requested subcommand, returning the process exit code.
fn run() -> Result<i32> {
    logging::init("warn", LogFormat::Plain);
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(PinlockConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(0);
            }

            let cfg = load_config(&file)?;
            println!(
                "Configuration valid (max retries {}, lockout {}s, store {}).",
                cfg.policy.max_retry_count,
                cfg.policy.failure_delay_secs,
                cfg.store_path().display()
            );
            Ok(0)
        }
        Commands::Enroll { pin } => {
            let engine = open_engine(&cli.config)?;
            let pin = match pin {
                Some(pin) => Zeroizing::new(pin),
                None => prompt_new_pin()?,
            };
            if pin.is_empty() {
                bail!("refusing to enroll an empty PIN");
            }
            engine.enroll(&pin)?;
            println!("PIN enrolled.");
            Ok(0)
        }
        Commands::Clear => {
            let engine = open_engine(&cli.config)?;
            if !engine.is_enrolled()? {
                println!("No PIN enrolled; nothing to clear.");
                return Ok(0);
            }
            engine.clear_enrollment()?;
            println!("PIN enrollment removed.");
            Ok(0)
        }
        Commands::Unlock { pin } => {
            let mut engine = open_engine(&cli.config)?;
            if let Some(pin) = pin {
                let pin = Zeroizing::new(pin);
                let outcome = engine.attempt_unlock(&pin)?;
                return Ok(report_outcome(&outcome));
            }

            loop {
                let pin = Zeroizing::new(prompt_password("PIN: ")?);
                let outcome = engine.attempt_unlock(&pin)?;
                let code = report_outcome(&outcome);
                if !matches!(outcome, UnlockOutcome::MismatchFailure { limit_exceeded: false }) {
                    return Ok(code);
                }
            }
        }
        Commands::Status => {
            let engine = open_engine(&cli.config)?;
            let record = engine.record()?;
            println!("Enrolled:    {}", yes_no(record.is_enrolled()));
            println!("Locked out:  {}", yes_no(engine.is_locked_out()?));
            println!(
                "Lockout armed at: {}",
                describe_millis(record.failure_block_started_at)
            );
            println!(
                "Last unlock: {}",
                describe_millis(record.last_successful_unlock_at)
            );
            println!(
                "Unlock required now: {}",
                yes_no(engine.requires_unlock()?)
            );
            Ok(0)
        }
        Commands::Required { within } => {
            let config = load_config(&cli.config)?;
            let window = within
                .map(Duration::from_secs)
                .or_else(|| config.freshness_window());
            let engine = engine_for(&config);
            let required = match window {
                Some(window) => engine.should_prompt_within(window)?,
                None => engine.requires_unlock()?,
            };
            if required {
                println!("Unlock required.");
                Ok(EXIT_UNLOCK_REQUIRED)
            } else {
                println!("Unlock not required.");
                Ok(0)
            }
        }
        Commands::ExternalSuccess => {
            let mut engine = open_engine(&cli.config)?;
            engine.record_external_success()?;
            warn!("unlock granted by external credential source");
            println!("External unlock recorded.");
            Ok(0)
        }
    }
}

fn load_config(path: &Path) -> Result<PinlockConfig> {
    PinlockConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn engine_for(config: &PinlockConfig) -> LockPolicyEngine<FileStore> {
    LockPolicyEngine::from_config(config, FileStore::new(config.store_path()))
}

fn open_engine(path: &Path) -> Result<LockPolicyEngine<FileStore>> {
    let config = load_config(path)?;
    Ok(engine_for(&config))
}

/// Prompt for a new PIN twice and insist both entries agree.
fn prompt_new_pin() -> Result<Zeroizing<String>> {
    let first = Zeroizing::new(prompt_password("New PIN: ")?);
    let second = Zeroizing::new(prompt_password("Confirm PIN: ")?);
    if *first != *second {
        bail!("PIN entries did not match");
    }
    Ok(first)
}

/// Print a human-readable line for `outcome` and pick an exit code.
fn report_outcome(outcome: &UnlockOutcome) -> i32 {
    match outcome {
        UnlockOutcome::Success => {
            println!("Unlocked.");
            0
        }
        UnlockOutcome::MismatchFailure {
            limit_exceeded: true,
        } => {
            eprintln!("{outcome}. Too many attempts; unlock is now blocked.");
            1
        }
        _ => {
            eprintln!("{outcome}.");
            1
        }
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// Render an epoch-millis timestamp relative to now.
fn describe_millis(millis: Option<i64>) -> String {
    let Some(at) = millis else {
        return "never".to_string();
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let ago = (now - at).max(0) / 1000;
    format!("{at} ({ago}s ago)")
}
