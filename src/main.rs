//! Isolate runner CLI entry point.
//!
//! Runs one script in a fresh isolate, evaluates it and prints the collected
//! guest output as JSON.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use isolate_runner_common::{ConfigFile, RuntimeConfig};
use isolate_runner_host::{IsolateRunner, OutputLog};

/// Script run when neither a path nor `--eval` is given.
const DEMO_SCRIPT: &str = r#"
import { format } from "format";
stdout("Hello, World!");
"#;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path of the script to run
    script: Option<PathBuf>,

    /// Inline script source (takes precedence over the path)
    #[arg(short, long)]
    eval: Option<String>,

    /// TOML configuration file
    #[arg(long, env = "ISOLATE_RUNNER_CONFIG")]
    config: Option<PathBuf>,

    /// Evaluation timeout in milliseconds (overrides the config file)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl Cli {
    fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                ConfigFile::from_file(path)
                    .with_context(|| format!("Failed to load config from {}", path.display()))?
                    .runtime
            }
            None => RuntimeConfig::default(),
        };

        if let Some(timeout_ms) = self.timeout_ms {
            config.execution.timeout_ms = timeout_ms;
        }

        Ok(config)
    }

    async fn source(&self) -> anyhow::Result<String> {
        if let Some(source) = &self.eval {
            return Ok(source.clone());
        }

        match &self.script {
            Some(path) => tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read script {}", path.display())),
            None => Ok(DEMO_SCRIPT.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,isolate_runner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.runtime_config()?;
    let source = cli.source().await?;

    info!(
        memory_limit_mb = config.isolate.memory_limit_mb,
        timeout_ms = config.execution.timeout_ms,
        "Configuration loaded"
    );

    let execution = config.execution.clone();
    let runner = IsolateRunner::with_config(source, config);
    let output = OutputLog::attach(runner.events());

    let main = runner.ready().await.context("Isolate setup failed")?;
    let evaluated = main.evaluate(&execution).await;

    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("Failed to serialize output")?
    );

    drop(main);
    runner.dispose().await;

    let result = evaluated.context("Evaluation failed")?;
    info!(
        duration_ms = result.metrics.duration.as_millis(),
        memory_used_bytes = result.metrics.memory_used_bytes,
        "Script finished"
    );

    Ok(())
}
