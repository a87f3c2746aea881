use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fuschia_await::{
  ConsumerRegistry, EventRouter, JsonLinesConsumer, ResumeCoordinator, SweeperConfig,
  TimeoutSweeper, WaitRegistry,
};
use fuschia_config::{RetryBlock, ServiceConfig, WaitBlock};
use fuschia_engine::{ChannelEngine, EngineCall};
use fuschia_retry::{
  Cleanup, CleanupConfig, ContextCache, NodeSnapshot, RetryDispatcher, RetryExecutor,
  RetryScheduler,
};
use fuschia_store::{ExecutionRecord, MemoryStore, SqliteStore, Store};

/// Fuschia coordinator - wait states and retries for workflow executions
#[derive(Parser)]
#[command(name = "fuschia-coordinator")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.fuschia)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Service config file (JSON)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Keep all state in memory instead of <data-dir>/coordinator.db
  #[arg(long, global = true)]
  in_memory: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run the sweeper, dispatcher and cleanup loops, reading message events
  /// as JSON lines from stdin, until Ctrl-C
  Serve,

  /// Manage executions
  Execution {
    #[command(subcommand)]
    command: ExecutionCommand,
  },

  /// Register waits and deliver events
  Wait {
    #[command(subcommand)]
    command: WaitCommand,
  },

  /// Schedule retries
  Retry {
    #[command(subcommand)]
    command: RetryCommand,
  },
}

#[derive(Subcommand)]
enum ExecutionCommand {
  /// Create an execution (trigger payload on stdin)
  Create {
    #[arg(long)]
    workflow: String,
  },
}

#[derive(Subcommand)]
enum WaitCommand {
  /// Park a node until events arrive (wait block JSON on stdin)
  Register {
    #[arg(long)]
    execution: String,
    #[arg(long)]
    node: String,
  },

  /// Deliver an API callback (payload on stdin)
  Callback {
    #[arg(long)]
    execution: String,
    #[arg(long)]
    correlation: String,
  },

  /// Deliver a message-bus event (payload on stdin)
  Message {
    #[arg(long)]
    topic: String,
  },
}

#[derive(Subcommand)]
enum RetryCommand {
  /// Retry a failed node ({retry, nodeConfig, inputData, executionContext} on stdin)
  Node {
    #[arg(long)]
    execution: String,
    #[arg(long)]
    node: String,
    /// The failed node run
    #[arg(long)]
    target: String,
  },

  /// Restart a failed execution ({retry, triggerData} on stdin)
  Execution {
    #[arg(long)]
    execution: String,
  },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeRetryRequest {
  #[serde(default)]
  retry: RetryBlock,
  #[serde(flatten)]
  snapshot: NodeSnapshot,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionRetryRequest {
  #[serde(default)]
  retry: RetryBlock,
  #[serde(default)]
  trigger_data: serde_json::Value,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(io::stderr)
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let cli = Cli::parse();

  let Some(command) = cli.command else {
    println!("fuschia-coordinator - use --help to see available commands");
    return Ok(());
  };

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".fuschia"),
  };
  let config = load_config(cli.config.as_deref())?;

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let services = Services::open(&data_dir, cli.in_memory, config).await?;
    run(command, services).await
  })
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
  let Some(path) = path else {
    return Ok(ServiceConfig::default());
  };
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read config file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Everything one coordinator instance runs, wired to a [`ChannelEngine`]
/// whose calls are logged.
struct Services {
  config: ServiceConfig,
  store: Arc<dyn Store>,
  engine_calls: mpsc::UnboundedReceiver<EngineCall>,
  registry: WaitRegistry,
  router: Arc<EventRouter>,
  sweeper: TimeoutSweeper,
  scheduler: Arc<RetryScheduler>,
  cleanup: Cleanup,
}

impl Services {
  async fn open(data_dir: &Path, in_memory: bool, config: ServiceConfig) -> Result<Self> {
    let store: Arc<dyn Store> = if in_memory {
      Arc::new(MemoryStore::new())
    } else {
      tokio::fs::create_dir_all(data_dir)
        .await
        .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;
      let db_path = data_dir.join("coordinator.db");
      let url = format!("sqlite://{}", db_path.display());
      let store = SqliteStore::connect(&url)
        .await
        .with_context(|| format!("failed to open database: {}", db_path.display()))?;
      Arc::new(store)
    };

    let instance_id = config
      .instance_id
      .clone()
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    info!(%instance_id, in_memory, "coordinator instance");

    let (engine, engine_calls) = ChannelEngine::pair();
    let engine = Arc::new(engine);

    let coordinator = Arc::new(ResumeCoordinator::new(
      store.clone(),
      engine.clone(),
      &instance_id,
    ));
    let router = Arc::new(EventRouter::new(
      store.clone(),
      coordinator.clone(),
      config.message_paths.clone(),
      config.ingest_cas_retries,
    ));
    let sweeper = TimeoutSweeper::new(
      store.clone(),
      engine.clone(),
      coordinator,
      SweeperConfig {
        interval: Duration::from_secs(config.sweep_interval_secs),
        batch_size: config.sweep_batch_size,
        claim_ttl: secs(config.claim_ttl_secs),
      },
    );

    let cache = Arc::new(ContextCache::new());
    let executor = RetryExecutor::new(
      store.clone(),
      engine.clone(),
      engine.clone(),
      cache.clone(),
    );
    let scheduler = Arc::new(RetryScheduler::new(
      store.clone(),
      engine.clone(),
      executor,
      config.dispatch_batch_size,
    ));
    let cleanup = Cleanup::new(
      store.clone(),
      engine,
      cache,
      CleanupConfig {
        interval: Duration::from_secs(config.cleanup_interval_secs),
        terminal_retention: chrono::Duration::days(config.terminal_retention_days.into()),
        stale_after: chrono::Duration::days(config.stale_after_days.into()),
        batch_size: config.dispatch_batch_size,
      },
    );

    Ok(Self {
      config,
      registry: WaitRegistry::new(store.clone()),
      store,
      engine_calls,
      router,
      sweeper,
      scheduler,
      cleanup,
    })
  }

  /// Log engine calls made so far.
  fn flush_engine_calls(&mut self) {
    while let Ok(call) = self.engine_calls.try_recv() {
      log_engine_call(&call);
    }
  }
}

fn secs(n: u64) -> chrono::Duration {
  i64::try_from(n)
    .ok()
    .and_then(chrono::Duration::try_seconds)
    .unwrap_or(chrono::Duration::MAX)
}

fn log_engine_call(call: &EngineCall) {
  match serde_json::to_string(call) {
    Ok(json) => info!(call = %json, "engine_call"),
    Err(e) => error!(error = %e, "engine_call_not_serializable"),
  }
}

async fn run(command: Commands, mut services: Services) -> Result<()> {
  match command {
    Commands::Serve => serve(services).await,
    Commands::Execution { command } => match command {
      ExecutionCommand::Create { workflow } => {
        let mut record = ExecutionRecord::new(
          uuid::Uuid::new_v4().to_string(),
          workflow,
          Utc::now(),
        );
        record.trigger_data.0 = read_payload_from_stdin()?;
        services
          .store
          .create_execution(&record)
          .await
          .context("failed to create execution")?;
        print_json(&serde_json::json!({ "executionId": record.execution_id }))
      }
    },
    Commands::Wait { command } => {
      match command {
        WaitCommand::Register { execution, node } => {
          let block: WaitBlock = serde_json::from_value(read_payload_from_stdin()?)
            .context("failed to parse wait block from stdin")?;
          let state = services
            .registry
            .register(&execution, &node, &block)
            .await
            .context("failed to register wait state")?;
          print_json(&state)?;
        }
        WaitCommand::Callback {
          execution,
          correlation,
        } => {
          let payload = read_payload_from_stdin()?;
          let outcome = services
            .router
            .handle_api_response(&execution, &correlation, payload)
            .await
            .context("failed to handle callback")?;
          print_json(&outcome)?;
        }
        WaitCommand::Message { topic } => {
          let payload = read_payload_from_stdin()?;
          let outcome = services
            .router
            .handle_message_event(&topic, payload)
            .await
            .context("failed to handle message event")?;
          print_json(&outcome)?;
        }
      }
      services.flush_engine_calls();
      Ok(())
    }
    Commands::Retry { command } => match command {
      RetryCommand::Node {
        execution,
        node,
        target,
      } => {
        let request: NodeRetryRequest = serde_json::from_value(read_payload_from_stdin()?)
          .context("failed to parse node retry request from stdin")?;
        let schedule = services
          .scheduler
          .create_for_node(&execution, &node, &target, &request.retry, request.snapshot)
          .await
          .context("failed to schedule node retry")?;
        print_json(&schedule)
      }
      RetryCommand::Execution { execution } => {
        let request: ExecutionRetryRequest = serde_json::from_value(read_payload_from_stdin()?)
          .context("failed to parse execution retry request from stdin")?;
        let schedule = services
          .scheduler
          .create_for_execution(&execution, &request.retry, request.trigger_data)
          .await
          .context("failed to schedule execution retry")?;
        print_json(&schedule)
      }
    },
  }
}

async fn serve(services: Services) -> Result<()> {
  let Services {
    config,
    mut engine_calls,
    router,
    sweeper,
    scheduler,
    cleanup,
    ..
  } = services;
  let cancel = CancellationToken::new();

  let consumers = ConsumerRegistry::new(router, cancel.clone());
  consumers
    .start("stdin", Box::new(JsonLinesConsumer::new(tokio::io::stdin())))
    .context("failed to start stdin consumer")?;

  let dispatcher = RetryDispatcher::new(
    scheduler,
    Duration::from_secs(config.dispatch_interval_secs),
  );
  let mut tasks = tokio::task::JoinSet::new();
  tasks.spawn({
    let cancel = cancel.clone();
    async move { sweeper.run(cancel).await }
  });
  tasks.spawn({
    let cancel = cancel.clone();
    async move { dispatcher.run(cancel).await }
  });
  tasks.spawn({
    let cancel = cancel.clone();
    async move { cleanup.run(cancel).await }
  });
  let logger = tokio::spawn(async move {
    while let Some(call) = engine_calls.recv().await {
      log_engine_call(&call);
    }
  });

  tokio::signal::ctrl_c()
    .await
    .context("failed to listen for ctrl-c")?;
  info!("shutting down");
  cancel.cancel();
  consumers.shutdown().await;
  while let Some(joined) = tasks.join_next().await {
    if let Err(e) = joined {
      error!(error = %e, "service task panicked");
    }
  }
  logger.abort();
  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    // No stdin pipe, use empty object
    Ok(serde_json::json!({}))
  } else {
    let mut input = String::new();
    io::stdin()
      .read_to_string(&mut input)
      .context("failed to read payload from stdin")?;

    if input.trim().is_empty() {
      Ok(serde_json::json!({}))
    } else {
      serde_json::from_str(&input).context("failed to parse payload JSON from stdin")
    }
  }
}
