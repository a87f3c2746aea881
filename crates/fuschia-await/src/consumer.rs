//! Message consumers and the registry that owns them.
//!
//! A consumer decodes records from some transport into
//! [`InboundMessage`]s and feeds them to the [`EventRouter`]. The
//! [`ConsumerRegistry`] starts each consumer on its own task under a child
//! cancellation token and tracks it by name until it is stopped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AwaitError;
use crate::router::EventRouter;

/// Transport a consumer reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
  /// In-process mpsc channel.
  Channel,
  /// Newline-delimited JSON records from an async reader.
  JsonLines,
}

impl fmt::Display for TransportKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TransportKind::Channel => f.write_str("channel"),
      TransportKind::JsonLines => f.write_str("json_lines"),
    }
  }
}

/// One decoded message-bus record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
  pub topic: String,
  pub payload: Value,
}

#[async_trait]
pub trait Consumer: Send + 'static {
  fn kind(&self) -> TransportKind;

  /// Feed records to `router` until the transport ends or `cancel` fires.
  async fn run(self: Box<Self>, router: Arc<EventRouter>, cancel: CancellationToken)
  -> Result<(), AwaitError>;
}

async fn deliver(router: &EventRouter, message: InboundMessage) {
  match router
    .handle_message_event(&message.topic, message.payload)
    .await
  {
    Ok(outcome) => debug!(topic = %message.topic, ?outcome, "message_ingested"),
    Err(e) => error!(topic = %message.topic, error = %e, "message_ingest_failed"),
  }
}

/// Reads [`InboundMessage`]s from an in-process channel.
pub struct ChannelConsumer {
  receiver: mpsc::Receiver<InboundMessage>,
}

impl ChannelConsumer {
  pub fn new(receiver: mpsc::Receiver<InboundMessage>) -> Self {
    Self { receiver }
  }

  /// A consumer plus the sender that feeds it.
  pub fn with_buffer_size(buffer_size: usize) -> (Self, mpsc::Sender<InboundMessage>) {
    let (sender, receiver) = mpsc::channel(buffer_size);
    (Self::new(receiver), sender)
  }
}

#[async_trait]
impl Consumer for ChannelConsumer {
  fn kind(&self) -> TransportKind {
    TransportKind::Channel
  }

  async fn run(
    mut self: Box<Self>,
    router: Arc<EventRouter>,
    cancel: CancellationToken,
  ) -> Result<(), AwaitError> {
    loop {
      tokio::select! {
        _ = cancel.cancelled() => break,
        message = self.receiver.recv() => match message {
          Some(message) => deliver(&router, message).await,
          None => break,
        },
      }
    }
    Ok(())
  }
}

/// Reads `{"topic": .., "payload": ..}` lines. Lines that do not decode are
/// logged and skipped.
pub struct JsonLinesConsumer<R> {
  reader: R,
}

impl<R> JsonLinesConsumer<R>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  pub fn new(reader: R) -> Self {
    Self { reader }
  }
}

#[async_trait]
impl<R> Consumer for JsonLinesConsumer<R>
where
  R: AsyncRead + Unpin + Send + 'static,
{
  fn kind(&self) -> TransportKind {
    TransportKind::JsonLines
  }

  async fn run(
    self: Box<Self>,
    router: Arc<EventRouter>,
    cancel: CancellationToken,
  ) -> Result<(), AwaitError> {
    let mut lines = BufReader::new(self.reader).lines();
    loop {
      let line = tokio::select! {
        _ = cancel.cancelled() => break,
        line = lines.next_line() => line?,
      };
      let Some(line) = line else { break };
      if line.trim().is_empty() {
        continue;
      }
      match serde_json::from_str::<InboundMessage>(&line) {
        Ok(message) => deliver(&router, message).await,
        Err(e) => warn!(error = %e, "json_line_skipped"),
      }
    }
    Ok(())
  }
}

struct Running {
  kind: TransportKind,
  cancel: CancellationToken,
  handle: JoinHandle<()>,
}

/// Named, running consumers.
pub struct ConsumerRegistry {
  router: Arc<EventRouter>,
  cancel: CancellationToken,
  running: RwLock<HashMap<String, Running>>,
}

impl ConsumerRegistry {
  /// Consumers started here stop when `cancel` fires.
  pub fn new(router: Arc<EventRouter>, cancel: CancellationToken) -> Self {
    Self {
      router,
      cancel,
      running: RwLock::new(HashMap::new()),
    }
  }

  pub fn start(&self, name: &str, consumer: Box<dyn Consumer>) -> Result<(), AwaitError> {
    let mut running = self.running.write().unwrap_or_else(PoisonError::into_inner);
    if running.contains_key(name) {
      return Err(AwaitError::ConsumerExists(name.to_string()));
    }

    let kind = consumer.kind();
    let cancel = self.cancel.child_token();
    let router = Arc::clone(&self.router);
    let task_cancel = cancel.clone();
    let task_name = name.to_string();
    let handle = tokio::spawn(async move {
      match consumer.run(router, task_cancel).await {
        Ok(()) => info!(consumer = %task_name, "consumer stopped"),
        Err(e) => error!(consumer = %task_name, error = %e, "consumer failed"),
      }
    });

    info!(consumer = name, %kind, "consumer started");
    running.insert(
      name.to_string(),
      Running {
        kind,
        cancel,
        handle,
      },
    );
    Ok(())
  }

  /// Cancel a consumer and wait for its task. Returns `false` if no
  /// consumer has that name.
  pub async fn stop(&self, name: &str) -> bool {
    let removed = self
      .running
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(name);
    let Some(consumer) = removed else {
      return false;
    };
    consumer.cancel.cancel();
    if let Err(e) = consumer.handle.await {
      error!(consumer = name, error = %e, "consumer task panicked");
    }
    true
  }

  pub fn kind_of(&self, name: &str) -> Option<TransportKind> {
    self
      .running
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(name)
      .map(|r| r.kind)
  }

  /// Names and transports of consumers whose task has not finished, sorted
  /// by name.
  pub fn active(&self) -> Vec<(String, TransportKind)> {
    let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
    let mut active: Vec<_> = running
      .iter()
      .filter(|(_, r)| !r.handle.is_finished())
      .map(|(name, r)| (name.clone(), r.kind))
      .collect();
    active.sort();
    active
  }

  /// Stop every consumer.
  pub async fn shutdown(&self) {
    let drained: Vec<(String, Running)> = self
      .running
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .drain()
      .collect();
    for (name, consumer) in drained {
      consumer.cancel.cancel();
      if let Err(e) = consumer.handle.await {
        error!(consumer = %name, error = %e, "consumer task panicked");
      }
    }
    info!("consumer registry shut down");
  }
}
