//! cgmm - fit Gaussian mixtures to the colors of an image.
//!
//! The heavy lifting happens in `color-gmm-gpu`; this binary loads images,
//! resolves configuration, paces the fit and reports the result.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use color_gmm_gpu::ColorSpace;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{config as config_cmd, fit, seeds, OutputFormat};
use config::{Backend, Config};

/// Fit a Gaussian mixture to the colors of an image.
///
/// Run `cgmm fit <IMAGE>` to fit with the configured defaults.
#[derive(Parser, Debug)]
#[command(
    name = "cgmm",
    author,
    version,
    about = "Color GMM: expectation-maximization over image color histograms",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log line format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Fit a mixture to an image and report the clusters.
    Fit {
        /// Image file (PNG or JPEG).
        image: PathBuf,

        /// Number of clusters (2-32).
        #[arg(short = 'k', long)]
        clusters: Option<usize>,

        /// Convergence steps (1-64).
        #[arg(short = 'n', long)]
        iterations: Option<u32>,

        /// Pause between steps in milliseconds.
        #[arg(long)]
        step_delay_ms: Option<u64>,

        /// How pixel values are interpreted: srgb or linear.
        #[arg(long)]
        color_space: Option<ColorSpace>,

        /// Engine to run the fit on: gpu or cpu.
        #[arg(short, long)]
        backend: Option<Backend>,

        /// Also write the JSON report to this file.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format: text or json.
        #[arg(short, long, default_value = "text")]
        format: String,

        /// List the N most populated color bins with their dominant cluster.
        #[arg(long, value_name = "N")]
        bins: Option<usize>,
    },

    /// Print the hue-spaced seed means used to start a fit.
    Seeds {
        /// Number of seeds (defaults to the configured cluster count).
        clusters: Option<usize>,

        /// Output format: text or json.
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Configuration subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration.
    Show,

    /// Set a configuration value.
    Set {
        /// Configuration key.
        key: String,
        /// Configuration value.
        value: String,
    },

    /// Get a configuration value.
    Get {
        /// Configuration key.
        key: String,
    },

    /// Reset configuration to defaults.
    Reset,

    /// Show path to config file.
    Path,
}

fn init_tracing(cli: &Cli) {
    let level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    // RUST_LOG wins over the verbosity flags when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = Config::load()?;

    match cli.command {
        Commands::Fit {
            image,
            clusters,
            iterations,
            step_delay_ms,
            color_space,
            backend,
            output,
            format,
            bins,
        } => {
            // Flags take precedence over file and environment
            let mut config = config;
            if let Some(clusters) = clusters {
                config.clusters = clusters;
            }
            if let Some(iterations) = iterations {
                config.iterations = iterations;
            }
            if let Some(delay) = step_delay_ms {
                config.step_delay_ms = delay;
            }
            if let Some(color_space) = color_space {
                config.color_space = color_space;
            }
            if let Some(backend) = backend {
                config.backend = backend;
            }

            let format: OutputFormat = format.parse()?;
            let args = fit::FitArgs {
                image,
                output,
                format,
                bins,
            };
            fit::execute(&config, args).await?;
        }

        Commands::Seeds { clusters, format } => {
            let format: OutputFormat = format.parse()?;
            seeds::execute(clusters.unwrap_or(config.clusters), format)?;
        }

        Commands::Config(config_cmd_inner) => {
            let mut config = config;
            match config_cmd_inner {
                ConfigCommands::Show => {
                    config_cmd::show(&config)?;
                }
                ConfigCommands::Set { key, value } => {
                    config_cmd::set(&mut config, &key, &value)?;
                }
                ConfigCommands::Get { key } => {
                    config_cmd::get(&config, &key)?;
                }
                ConfigCommands::Reset => {
                    config_cmd::reset()?;
                }
                ConfigCommands::Path => {
                    if let Some(path) = Config::config_file_path() {
                        println!("{}", path.display());
                    } else {
                        println!("(no config file path available)");
                    }
                }
            }
        }
    }

    Ok(())
}
