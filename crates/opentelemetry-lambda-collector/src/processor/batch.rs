//! Groups payloads before they reach the exporters.
//!
//! A batch is sent when it holds `send_batch_size` items, when `timeout`
//! elapses, and on shutdown.

use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, Processor, ProcessorFactory,
    decode_config,
};
use crate::config::duration_ms;
use crate::signal::{
    BoxFuture, ClientInfo, Consumer, ConsumerError, SharedConsumer, Signal, SignalKind,
};
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `batch` processor config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    /// Item count that triggers a send.
    pub send_batch_size: usize,
    /// Longest time a batch is held.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            send_batch_size: 8192,
            timeout: Duration::from_millis(200),
        }
    }
}

struct Batcher {
    id: ComponentId,
    send_batch_size: usize,
    next: SharedConsumer,
    pending: Mutex<Option<(ClientInfo, Signal)>>,
}

impl Batcher {
    fn take(&self) -> Option<(ClientInfo, Signal)> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Adds `signal` to the pending batch and returns the batch if it is full.
    fn add(&self, info: ClientInfo, signal: Signal) -> Result<Option<(ClientInfo, Signal)>, Signal> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.as_mut() {
            Some((_, batch)) => batch.append(signal)?,
            None => *pending = Some((info, signal)),
        }

        let full = pending
            .as_ref()
            .is_some_and(|(_, batch)| batch.item_count() >= self.send_batch_size);
        Ok(if full { pending.take() } else { None })
    }

    async fn flush(&self) -> Result<(), ConsumerError> {
        match self.take() {
            Some((info, batch)) => {
                tracing::trace!(processor = %self.id, items = batch.item_count(), "Sending batch");
                self.next.consume(info, batch).await
            }
            None => Ok(()),
        }
    }
}

/// Size- and time-triggered batching processor.
pub struct BatchProcessor {
    batcher: Arc<Batcher>,
    timeout: Duration,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BatchProcessor {
    /// Creates a processor forwarding to `next`.
    pub fn new(id: ComponentId, config: &BatchConfig, next: SharedConsumer) -> Self {
        Self {
            batcher: Arc::new(Batcher {
                id,
                send_batch_size: config.send_batch_size.max(1),
                next,
                pending: Mutex::new(None),
            }),
            timeout: config.timeout,
            timer: Mutex::new(None),
        }
    }

    /// Returns the number of items waiting in the current batch.
    pub fn pending(&self) -> usize {
        self.batcher
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |(_, batch)| batch.item_count())
    }
}

impl Consumer for BatchProcessor {
    fn consume(&self, info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(async move {
            match self.batcher.add(info.clone(), signal) {
                Ok(Some((info, batch))) => self.batcher.next.consume(info, batch).await,
                Ok(None) => Ok(()),
                Err(other) => self.batcher.next.consume(info, other).await,
            }
        })
    }
}

impl Component for BatchProcessor {
    fn start(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
            if timer.is_some() || self.timeout.is_zero() {
                return Ok(());
            }

            let token = CancellationToken::new();
            let batcher = self.batcher.clone();
            let period = self.timeout;
            let cancelled = token.clone();
            let handle = tokio::spawn(async move {
                let mut ticks = tokio::time::interval(period);
                ticks.tick().await;
                loop {
                    tokio::select! {
                        _ = cancelled.cancelled() => break,
                        _ = ticks.tick() => {
                            if let Err(error) = batcher.flush().await {
                                tracing::error!(processor = %batcher.id, %error, "Failed to send batch");
                            }
                        }
                    }
                }
            });
            *timer = Some((token, handle));
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            let timer = self
                .timer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some((token, handle)) = timer {
                token.cancel();
                let _ = handle.await;
            }

            if let Err(error) = self.batcher.flush().await {
                tracing::error!(processor = %self.batcher.id, %error, "Failed to send final batch");
            }
            Ok(())
        })
    }
}

impl Processor for BatchProcessor {}

/// Factory for `batch`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProcessorFactory;

impl ProcessorFactory for BatchProcessorFactory {
    fn type_name(&self) -> &'static str {
        "batch"
    }

    fn signals(&self) -> &'static [SignalKind] {
        &SignalKind::ALL
    }

    fn create(
        &self,
        _ctx: &BuildContext,
        id: &ComponentId,
        config: &serde_yaml::Value,
        _kind: SignalKind,
        next: SharedConsumer,
    ) -> Result<Arc<dyn Processor>, ComponentError> {
        let config: BatchConfig = decode_config(id, config)?;
        if config.send_batch_size == 0 {
            return Err(ComponentError::Invalid {
                id: id.clone(),
                reason: "send_batch_size must be at least 1".to_string(),
            });
        }
        Ok(Arc::new(BatchProcessor::new(id.clone(), &config, next)))
    }
}
