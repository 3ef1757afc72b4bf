//! Bounded queue between receivers and the slow export path.
//!
//! `consume` only enqueues. A single forwarder task drains the queue into
//! the next consumer, and it runs only while the function is being invoked
//! or the environment is shutting down. Stopping the forwarder pushes a
//! sentinel and waits for the task, so every item queued before the stop
//! has been handed downstream before the sandbox can freeze.

use super::ProcessorError;
use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, Processor, ProcessorFactory,
    decode_config,
};
use crate::lifecycle::{LifecycleListener, Notifier};
use crate::signal::{BoxFuture, ClientInfo, Consumer, ConsumerError, SharedConsumer, Signal, SignalKind};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Default queue capacity.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 200;

/// `decouple` processor config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoupleConfig {
    /// Items the queue holds before producers wait.
    pub max_queue_size: usize,
}

impl Default for DecoupleConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

struct Item {
    info: ClientInfo,
    signal: Signal,
}

type Queue = mpsc::Receiver<Option<Item>>;

/// Queueing processor driven by lifecycle notifications.
pub struct DecoupleProcessor {
    id: ComponentId,
    capacity: usize,
    sender: mpsc::Sender<Option<Item>>,
    receiver: Arc<Mutex<Queue>>,
    next: SharedConsumer,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl DecoupleProcessor {
    /// Creates the processor and registers it with `notifier`.
    ///
    /// # Errors
    ///
    /// Fails without a notifier or with a zero queue size.
    pub fn new(
        id: ComponentId,
        config: &DecoupleConfig,
        notifier: Option<&Notifier>,
        next: SharedConsumer,
    ) -> Result<Arc<Self>, ProcessorError> {
        let notifier = notifier.ok_or(ProcessorError::NoLifecycleNotifier)?;
        if config.max_queue_size == 0 {
            return Err(ProcessorError::InvalidQueueSize);
        }

        let (sender, receiver) = mpsc::channel(config.max_queue_size);
        let processor = Arc::new(Self {
            id,
            capacity: config.max_queue_size,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            next,
            forwarder: Mutex::new(None),
        });
        notifier.add_listener(processor.clone());
        Ok(processor)
    }

    /// Starts the forwarder. Does nothing when it is already running.
    pub async fn start_forwarding(&self) {
        let mut forwarder = self.forwarder.lock().await;
        if forwarder.is_some() {
            return;
        }

        tracing::debug!(processor = %self.id, "Starting decouple forwarder");
        *forwarder = Some(tokio::spawn(forward(
            self.id.to_string(),
            self.receiver.clone(),
            self.next.clone(),
        )));
    }

    /// Drains the queue and stops the forwarder. Returns once every item
    /// queued before the call has been handed to the next consumer.
    pub async fn stop_forwarding(&self) {
        let mut forwarder = self.forwarder.lock().await;
        let Some(handle) = forwarder.take() else {
            return;
        };

        tracing::debug!(processor = %self.id, "Draining decouple forwarder");
        if self.sender.send(None).await.is_err() {
            handle.abort();
            return;
        }
        if let Err(error) = handle.await {
            tracing::warn!(processor = %self.id, %error, "Decouple forwarder ended abnormally");
        }
    }

    /// Returns true while the forwarder task runs.
    pub async fn is_forwarding(&self) -> bool {
        self.forwarder.lock().await.is_some()
    }

    /// Returns the number of queued items.
    pub fn queued(&self) -> usize {
        self.capacity - self.sender.capacity()
    }
}

async fn forward(id: String, queue: Arc<Mutex<Queue>>, next: SharedConsumer) {
    let mut queue = queue.lock().await;
    while let Some(Some(item)) = queue.recv().await {
        if let Err(error) = next.consume(item.info, item.signal).await {
            tracing::error!(processor = %id, %error, "Dropping item rejected downstream");
        }
    }
    tracing::debug!(processor = %id, "Decouple forwarder stopped");
}

impl Consumer for DecoupleProcessor {
    fn consume(&self, info: ClientInfo, signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        Box::pin(async move {
            self.sender
                .send(Some(Item { info, signal }))
                .await
                .map_err(|_| ConsumerError::Closed(self.id.to_string()))
        })
    }
}

impl Component for DecoupleProcessor {
    fn shutdown(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            self.stop_forwarding().await;
            Ok(())
        })
    }
}

impl Processor for DecoupleProcessor {}

impl LifecycleListener for DecoupleProcessor {
    fn function_invoked(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.start_forwarding())
    }

    fn function_finished(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.stop_forwarding())
    }

    fn environment_shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.start_forwarding())
    }
}

/// Factory for `decouple`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoupleProcessorFactory;

impl ProcessorFactory for DecoupleProcessorFactory {
    fn type_name(&self) -> &'static str {
        "decouple"
    }

    fn signals(&self) -> &'static [SignalKind] {
        &SignalKind::ALL
    }

    fn create(
        &self,
        ctx: &BuildContext,
        id: &ComponentId,
        config: &serde_yaml::Value,
        _kind: SignalKind,
        next: SharedConsumer,
    ) -> Result<Arc<dyn Processor>, ComponentError> {
        let config: DecoupleConfig = decode_config(id, config)?;
        let processor = DecoupleProcessor::new(id.clone(), &config, ctx.notifier.as_ref(), next)
            .map_err(|source| ComponentError::Processor {
                id: id.clone(),
                source,
            })?;
        Ok(processor)
    }
}
