use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::Level;

use hookline_core::events::GenerationEvent;
use hookline_core::request::GenerationRequest;
use hookline_engine::{for_each_bounded, GenerationOrchestrator, ItemStore, OrchestratorConfig};
use hookline_gateway::client::DEFAULT_ENDPOINT;
use hookline_gateway::{GatewayConfig, HttpGenerationService, ReliableConfig, ReliableService};
use hookline_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "hookline", version, about = "Stream generated content ideas")]
struct Cli {
    /// Default log level; RUST_LOG overrides it.
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate one batch per content type and print the resulting lists.
    Generate(GenerateArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, env = "HOOKLINE_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    #[arg(long, env = "HOOKLINE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[arg(long)]
    category: String,

    #[arg(long)]
    focus: String,

    /// Repeat to generate several content types.
    #[arg(long = "content-type", default_value = "videos")]
    content_types: Vec<String>,

    /// Sessions allowed in flight at once.
    #[arg(long, default_value_t = 2)]
    concurrency: usize,

    #[arg(long, default_value_t = 4)]
    batch_size: usize,

    /// Place the batch above existing items and ask for fresh ideas.
    #[arg(long)]
    new_batch: bool,

    /// Business profile as a JSON object.
    #[arg(long)]
    profile: Option<String>,

    #[arg(long, default_value_t = 3)]
    max_retries: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        json: cli.json_logs,
        ..Default::default()
    });

    match cli.command {
        Command::Generate(args) => generate(args, &telemetry).await,
    }
}

async fn generate(
    args: GenerateArgs,
    telemetry: &hookline_telemetry::TelemetryGuard,
) -> anyhow::Result<()> {
    let profile = match &args.profile {
        Some(raw) => serde_json::from_str(raw).context("--profile is not valid JSON")?,
        None => Value::Null,
    };

    let http = HttpGenerationService::new(GatewayConfig {
        endpoint: args.endpoint.clone(),
        bearer_token: args.token.map(SecretString::from),
        ..Default::default()
    })
    .context("failed to build HTTP client")?;
    let service = ReliableService::new(
        http,
        ReliableConfig {
            max_retries: args.max_retries,
            ..Default::default()
        },
    );

    let mut orchestrator = GenerationOrchestrator::new(
        Arc::new(service),
        Arc::new(ItemStore::new()),
        OrchestratorConfig {
            batch_size: args.batch_size,
            ..Default::default()
        },
    );
    if let Some(metrics) = telemetry.metrics() {
        orchestrator = orchestrator.with_metrics(metrics);
    }
    let orchestrator = Arc::new(orchestrator);

    let printer = tokio::spawn(log_events(orchestrator.subscribe()));

    let interrupt = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, cancelling sessions");
                orchestrator.cancel_all();
            }
        })
    };

    let requests: Vec<GenerationRequest> = unique(&args.content_types)
        .into_iter()
        .map(|content_type| {
            let request = GenerationRequest::new(content_type, &args.category, &args.focus)
                .with_profile(profile.clone());
            if args.new_batch {
                request.new_batch()
            } else {
                request
            }
        })
        .collect();

    tracing::info!(
        endpoint = %args.endpoint,
        sessions = requests.len(),
        concurrency = args.concurrency,
        "starting generation"
    );

    let result = for_each_bounded(&requests, args.concurrency, |request| {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            let received = orchestrator.start(request.clone()).wait().await.into_result()?;
            let items = orchestrator.store().snapshot(&request.key());
            tracing::info!(content_type = %request.content_type, received, "session finished");
            println!(
                "{}",
                serde_json::json!({ "contentType": request.content_type, "items": items })
            );
            Ok::<_, hookline_engine::EngineError>(())
        }
    })
    .await;

    interrupt.abort();
    printer.abort();

    if let Some(metrics) = telemetry.metrics() {
        for metric in metrics.snapshot() {
            tracing::debug!(metric = %metric.name, value = metric.value, labels = ?metric.labels, "metric");
        }
    }

    result.context("generation failed")
}

/// First occurrence of each content type, in order. A repeated type would
/// supersede its own earlier session.
fn unique(content_types: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    content_types
        .iter()
        .map(String::as_str)
        .filter(|ct| seen.insert(*ct))
        .collect()
}

async fn log_events(mut rx: broadcast::Receiver<GenerationEvent>) {
    loop {
        match rx.recv().await {
            Ok(GenerationEvent::ItemProgress {
                key, slot, progress, ..
            }) => {
                tracing::debug!(content_type = %key.content_type, slot, progress, "progress");
            }
            Ok(GenerationEvent::ItemReady { key, slot, item, .. }) => {
                tracing::info!(
                    content_type = %key.content_type,
                    slot,
                    hook = item.hook.as_deref().unwrap_or(""),
                    "item ready"
                );
            }
            Ok(GenerationEvent::Completed {
                key,
                warning: Some(warning),
                ..
            }) => {
                tracing::warn!(content_type = %key.content_type, "{warning}");
            }
            Ok(GenerationEvent::Failed { key, message, kind, .. }) => {
                tracing::error!(content_type = %key.content_type, kind = %kind, "{message}");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
