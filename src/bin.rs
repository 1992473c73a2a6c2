//! Binary entry point for `relay-bot`.
//!
//! This module provides the command-line interface for relay-bot with options
//! for configuration file paths, logging verbosity and tracing export, plus a
//! few maintenance commands. It initializes the necessary components and starts
//! the service.

use clap::Parser;
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::{Protocol, WithExportConfig};
use relay_bot::{
    Runtime, RuntimeOptions,
    base::{config::Config, types::Void},
};
use tracing::{error, info};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt};

/// Relay-bot – a chat participant that answers when it is addressed.
///
/// Configuration can come from `config.toml` or `RELAY_BOT_*` environment
/// variables. Lines are read from stdin as `name: text`, and replies are
/// printed as `@name reply`.
#[derive(Parser, Debug)]
#[command(version, author, about, long_about = None)]
struct Args {
    /// Override the config file path (optional).
    ///
    /// By default, the bot will look for a config file at `.hidden/config.toml`
    /// in the current directory.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
    /// Increase log verbosity (-v, -vv, etc.).
    ///
    /// Use multiple times to increase verbosity:
    /// - No flag: INFO level
    /// - -v: DEBUG level
    /// - -vv or more: TRACE level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Export spans to an OTLP collector over HTTP.
    ///
    /// The endpoint is taken from the standard `OTEL_EXPORTER_OTLP_*` variables.
    #[arg(long)]
    otlp: bool,
    /// Keep conversation history in memory only.
    #[arg(long)]
    ephemeral: bool,
    /// Check the configured API key with a minimal request and exit.
    #[arg(long, conflicts_with = "reset")]
    validate_key: bool,
    /// Forget the stored history of a participant and exit.
    #[arg(long, value_name = "PARTICIPANT")]
    reset: Option<String>,
}

/// Main entry point for the relay-bot binary.
///
/// Sets up logging based on verbosity, loads configuration, and starts the bot
/// (or runs the requested maintenance command).
#[tokio::main]
async fn main() -> Void {
    let args = Args::parse();

    // Construct the level filter.

    let level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    let level_filter = tracing_subscriber::filter::LevelFilter::from_level(level);

    // Prepare the log layer.

    let stdout = tracing_subscriber::fmt::layer()
        .without_time()
        .with_ansi(true)
        .with_level(true)
        .with_file(false)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    // Prepare the otlp layer.

    let otel = if args.otlp {
        let exporter = opentelemetry_otlp::SpanExporter::builder().with_http().with_protocol(Protocol::HttpBinary).build()?;
        let tracer = opentelemetry_sdk::trace::SdkTracerProvider::builder().with_simple_exporter(exporter).build().tracer("relay-bot");

        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry().with(otel).with(level_filter).with(stdout).init();

    let config = Config::load(args.config.as_deref())?;
    let options = RuntimeOptions { ephemeral: args.ephemeral };

    // Maintenance commands.

    if args.validate_key {
        let runtime = Runtime::new(config, options)?;

        if runtime.llm.validate_credential(&runtime.config.api_key).await {
            info!("API key is valid");
            return Ok(());
        }

        error!("API key was rejected");
        std::process::exit(1);
    }

    if let Some(participant) = args.reset {
        let runtime = Runtime::new(config, options)?;
        let before = runtime.store.message_count(&participant).await;

        runtime.store.reset(&participant).await?;
        info!("Forgot {before} stored messages for `{participant}`");

        return Ok(());
    }

    relay_bot::start(config, options).await
}
