use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use vatnet::demo::{self, Scenario};
use vatnet::{VatConfig, swiss, wire};

#[derive(Parser)]
#[command(name = "vatnet", version, about = "Vat messaging runtime tooling")]
struct Cli {
    /// JSON file with vat configuration
    #[arg(short = 'c', long = "config", global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a built-in scenario and print every frame that crossed the wire
    Demo {
        scenario: DemoScenario,
        /// Also print the vats' transcript lines
        #[arg(long)]
        transcript: bool,
    },
    /// Validate a file of JSON-lines wire messages
    Check {
        file: PathBuf,
        /// Print each message as CBOR hex instead of normalised JSON
        #[arg(long)]
        cbor: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DemoScenario {
    Respond,
    LocalVow,
    ThirdParty,
    FanOut,
}

impl From<DemoScenario> for Scenario {
    fn from(value: DemoScenario) -> Self {
        match value {
            DemoScenario::Respond => Scenario::Respond,
            DemoScenario::LocalVow => Scenario::LocalVow,
            DemoScenario::ThirdParty => Scenario::ThirdParty,
            DemoScenario::FanOut => Scenario::FanOut,
        }
    }
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = VatConfig::load_or_default(cli.config.as_deref())?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Command::Demo {
            scenario,
            transcript,
        } => cmd_demo(scenario.into(), transcript, &config),
        Command::Check { file, cbor } => cmd_check(&file, cbor),
    }
}

fn cmd_demo(scenario: Scenario, transcript: bool, config: &VatConfig) -> Result<()> {
    info!(%scenario, "running scenario");
    let outcome = demo::run(scenario, config)?;
    for frame in &outcome.frames {
        println!("{frame}");
    }
    if transcript {
        for line in &outcome.transcript {
            println!("# {line}");
        }
    }
    info!(frames = outcome.frames.len(), "scenario finished");
    Ok(())
}

fn cmd_check(file: &Path, cbor: bool) -> Result<()> {
    let text = fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut checked = 0usize;
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message = wire::from_json(line).with_context(|| format!("line {}", idx + 1))?;
        if cbor {
            let bytes = wire::to_cbor(&message)?;
            if wire::from_cbor(&bytes)? != message {
                bail!("line {}: message does not survive CBOR framing", idx + 1);
            }
            println!("{}", swiss::to_hex(&bytes));
        } else {
            println!("{}", wire::to_json(&message)?);
        }
        checked += 1;
    }
    info!(checked, "wire messages valid");
    Ok(())
}
