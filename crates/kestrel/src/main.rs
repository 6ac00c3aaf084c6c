//! Inspect kestrel's context budgeting and resilience settings offline.
//!
//! # Examples
//!
//! ```sh
//! # Run one context preparation over components from a file
//! kestrel compact --components components.json --strategy aggressive --max-tokens 8000
//!
//! # Print a backoff schedule
//! kestrel backoff --initial-ms 250 --max-ms 10000 --attempts 8 --jitter
//!
//! # Validate a runtime config file
//! kestrel check-config runtime.json
//! ```
//!
//! Logs go to stderr. `-v` enables debug output, `-vv` trace; `RUST_LOG`
//! overrides both.

use clap::{Parser, Subcommand};
use kestrel::AgentError;
use kestrel::api::retry::BackoffConfig;
use kestrel::config::RuntimeConfig;
use kestrel::context::{
    ContextComponent, ConversationCompactor, StaticPlugin, StrategyKind, TruncatingCompactor,
};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "kestrel", version, about = "Agent runtime tooling")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble context from a components file and report budget and
    /// compaction
    Compact {
        /// JSON array of context components
        #[arg(long)]
        components: PathBuf,

        /// Runtime config supplying the context window and strategy
        #[arg(long)]
        config: Option<PathBuf>,

        /// Strategy override: lazy, proactive, aggressive, rolling_window, adaptive
        #[arg(long)]
        strategy: Option<String>,

        /// Context window override
        #[arg(long)]
        max_tokens: Option<usize>,
    },

    /// Print the delay for each retry attempt
    Backoff {
        #[arg(long, default_value_t = 500)]
        initial_ms: u64,

        #[arg(long, default_value_t = 8_000)]
        max_ms: u64,

        #[arg(long, default_value_t = 2.0)]
        multiplier: f64,

        #[arg(long, default_value_t = 6)]
        attempts: u32,

        /// Apply random jitter (±10%)
        #[arg(long)]
        jitter: bool,
    },

    /// Validate a runtime config file
    CheckConfig { file: PathBuf },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn compact(
    components: PathBuf,
    config: Option<PathBuf>,
    strategy: Option<String>,
    max_tokens: Option<usize>,
) -> Result<String, AgentError> {
    let mut runtime = match config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(name) = strategy {
        runtime.strategy = StrategyKind::from_name(&name)
            .ok_or_else(|| AgentError::Config(format!("unknown strategy '{name}'")))?;
    }
    if let Some(tokens) = max_tokens {
        runtime.context.max_context_tokens = tokens;
    }

    let raw = std::fs::read_to_string(&components)
        .map_err(|e| AgentError::Config(format!("{}: {e}", components.display())))?;
    let parsed: Vec<ContextComponent> = serde_json::from_str(&raw)
        .map_err(|e| AgentError::Config(format!("{}: {e}", components.display())))?;
    info!(
        "Loaded {} component(s) from {}",
        parsed.len(),
        components.display()
    );

    let manager = parsed.into_iter().fold(
        runtime
            .context_manager()
            .with_compactor(TruncatingCompactor::new())
            .with_compactor(ConversationCompactor::default()),
        |m, c| m.with_plugin(StaticPlugin::new(c)),
    );
    let prepared = manager.prepare();
    let report = serde_json::json!({
        "strategy": manager.strategy().name(),
        "budget": prepared.budget,
        "compaction": prepared.compaction,
        "overflow": prepared.overflow,
    });
    serde_json::to_string_pretty(&report).map_err(|e| AgentError::State(e.to_string()))
}

fn backoff(
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    attempts: u32,
    jitter: bool,
) -> String {
    let config = BackoffConfig::new(
        Duration::from_millis(initial_ms),
        Duration::from_millis(max_ms),
    )
    .with_multiplier(multiplier)
    .with_jitter(jitter);
    let mut total = Duration::ZERO;
    let mut out = String::new();
    for attempt in 1..=attempts {
        let delay = config.delay(attempt);
        total += delay;
        out.push_str(&format!(
            "attempt {attempt:>2}: {:>8.3}s  (cumulative {:.3}s)\n",
            delay.as_secs_f64(),
            total.as_secs_f64()
        ));
    }
    out
}

fn check_config(file: PathBuf) -> Result<String, AgentError> {
    let config = RuntimeConfig::load(&file)?;
    let hooks: usize = config.hooks.0.values().map(Vec::len).sum();
    Ok(format!(
        "{}: ok\n  max_iterations: {}\n  context window: {} tokens ({} reserved)\n  strategy: {}\n  command hooks: {hooks}\n",
        file.display(),
        config.harness.max_iterations,
        config.context.max_context_tokens,
        config.context.response_reserve,
        config.strategy.build().name(),
    ))
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let outcome = match cli.command {
        Command::Compact {
            components,
            config,
            strategy,
            max_tokens,
        } => compact(components, config, strategy, max_tokens),
        Command::Backoff {
            initial_ms,
            max_ms,
            multiplier,
            attempts,
            jitter,
        } => Ok(backoff(initial_ms, max_ms, multiplier, attempts, jitter)),
        Command::CheckConfig { file } => check_config(file),
    };

    match outcome {
        Ok(output) => println!("{}", output.trim_end()),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
