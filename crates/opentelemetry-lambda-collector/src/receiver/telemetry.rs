//! Telemetry API receiver.
//!
//! Runs a translating [`Listener`] on a fixed port, subscribes it to the
//! Telemetry API when started, and routes every translated signal into the
//! pipelines that list the receiver.

use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, ReceiverFactory, decode_config,
};
use crate::event::Event;
use crate::listener::{EventSink, Listener};
use crate::signal::{BoxFuture, ClientInfo, SignalKind, SignalRouter};
use crate::telemetry_api::{
    BufferingConfig, SubscribeOutcome, TelemetryApiClient, TelemetrySubscription, TelemetryType,
};
use crate::translator::{Temporality, Translator};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// `metrics` section of the receiver config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsSection {
    /// `cumulative` or `delta`, any case.
    pub temporality: Option<String>,
}

/// `telemetryapi` receiver config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryReceiverConfig {
    /// Listener port; the variant's default when unset.
    pub port: Option<u16>,
    /// Streams to subscribe to; the variant's default when unset.
    pub types: Option<Vec<TelemetryType>>,
    /// Buffering `maxItems`.
    pub max_items: Option<u32>,
    /// Buffering `maxBytes`.
    pub max_bytes: Option<u32>,
    /// Buffering `timeoutMs`.
    pub timeout_ms: Option<u32>,
    /// Render platform events as log records.
    pub log_report: bool,
    /// Metric options.
    pub metrics: MetricsSection,
}

impl TelemetryReceiverConfig {
    fn buffering(&self) -> BufferingConfig {
        let defaults = BufferingConfig::default();
        BufferingConfig {
            max_items: self.max_items.unwrap_or(defaults.max_items),
            max_bytes: self.max_bytes.unwrap_or(defaults.max_bytes),
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
        }
    }
}

struct TranslatingSink {
    id: ComponentId,
    translator: Translator,
    next: SignalRouter,
}

impl TranslatingSink {
    async fn route(&self, signals: impl IntoIterator<Item = crate::signal::Signal>) {
        for signal in signals {
            let kind = signal.kind();
            if let Err(error) = self.next.route(ClientInfo::default(), signal).await {
                tracing::error!(receiver = %self.id, %kind, %error, "Failed to deliver translated telemetry");
            }
        }
    }
}

impl EventSink for TranslatingSink {
    fn handle(&self, events: Vec<Event>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let translation = self.translator.translate(&events);
            self.route(translation.into_signals()).await;
        })
    }
}

/// Telemetry API receiver component.
pub struct TelemetryReceiver {
    id: ComponentId,
    port: u16,
    subscription_types: Vec<TelemetryType>,
    buffering: BufferingConfig,
    runtime_api: Option<String>,
    extension_id: Option<String>,
    sink: Arc<TranslatingSink>,
    listener: Mutex<Listener>,
}

impl TelemetryReceiver {
    /// Returns the listener's bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.local_addr()
    }

    async fn subscribe(&self, uri: String) -> Result<(), ComponentError> {
        let (Some(runtime_api), Some(extension_id)) = (&self.runtime_api, &self.extension_id)
        else {
            tracing::debug!(receiver = %self.id, "Not registered with a Lambda host, skipping subscribe");
            return Ok(());
        };

        let api_error = |source| ComponentError::Api {
            id: self.id.clone(),
            source,
        };
        let client = TelemetryApiClient::new(runtime_api).map_err(api_error)?;
        let subscription = TelemetrySubscription::new(self.subscription_types.clone(), uri)
            .with_buffering(self.buffering);

        match client.subscribe(extension_id, &subscription).await.map_err(api_error)? {
            SubscribeOutcome::Subscribed => {
                tracing::debug!(receiver = %self.id, types = ?self.subscription_types, "Subscribed to Telemetry API")
            }
            SubscribeOutcome::Accepted => {
                tracing::debug!(receiver = %self.id, "Telemetry API accepted subscription without delivery")
            }
        }
        Ok(())
    }
}

impl Component for TelemetryReceiver {
    fn start(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            let uri = self
                .listener
                .lock()
                .await
                .start(Some(self.port))
                .await
                .map_err(|source| ComponentError::Listener {
                    id: self.id.clone(),
                    source,
                })?;
            self.subscribe(uri).await
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), ComponentError>> {
        Box::pin(async {
            self.listener
                .lock()
                .await
                .shutdown()
                .await
                .map_err(|source| ComponentError::Listener {
                    id: self.id.clone(),
                    source,
                })
        })
    }
}

/// Factory for `telemetryapi` and `telemetryapi_logs`.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryReceiverFactory {
    type_name: &'static str,
    default_port: u16,
    default_types: &'static [TelemetryType],
    signals: &'static [SignalKind],
}

impl TelemetryReceiverFactory {
    /// `telemetryapi`: platform and function streams, every signal.
    pub fn combined() -> Self {
        Self {
            type_name: "telemetryapi",
            default_port: 4325,
            default_types: &[TelemetryType::Platform, TelemetryType::Function],
            signals: &SignalKind::ALL,
        }
    }

    /// `telemetryapi_logs`: function logs only.
    pub fn logs_only() -> Self {
        Self {
            type_name: "telemetryapi_logs",
            default_port: 4327,
            default_types: &[TelemetryType::Function],
            signals: &[SignalKind::Logs],
        }
    }

    /// Builds the receiver directly from a typed config.
    pub fn build(
        &self,
        ctx: &BuildContext,
        id: &ComponentId,
        config: &TelemetryReceiverConfig,
        next: SignalRouter,
    ) -> Result<TelemetryReceiver, ComponentError> {
        let temporality = match config.metrics.temporality.as_deref() {
            Some(value) => value
                .parse::<Temporality>()
                .map_err(|reason| ComponentError::Invalid {
                    id: id.clone(),
                    reason,
                })?,
            None => ctx.host.metrics_temporality.unwrap_or_default(),
        };

        let mut builder = Translator::builder()
            .log_report(config.log_report)
            .temporality(temporality);
        if let Some(instance) = &ctx.host.service_instance_id {
            builder = builder.service_instance_id(instance.clone());
        }

        let sink = Arc::new(TranslatingSink {
            id: id.clone(),
            translator: builder.build(),
            next,
        });
        let listener = Listener::translating(sink.clone(), ctx.host.sam_local);

        Ok(TelemetryReceiver {
            id: id.clone(),
            port: config.port.unwrap_or(self.default_port),
            subscription_types: config
                .types
                .clone()
                .unwrap_or_else(|| self.default_types.to_vec()),
            buffering: config.buffering(),
            runtime_api: ctx.host.runtime_api.clone(),
            extension_id: ctx.host.extension_id.clone(),
            sink,
            listener: Mutex::new(listener),
        })
    }
}

impl ReceiverFactory for TelemetryReceiverFactory {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn signals(&self) -> &'static [SignalKind] {
        self.signals
    }

    fn create(
        &self,
        ctx: &BuildContext,
        id: &ComponentId,
        config: &serde_yaml::Value,
        next: SignalRouter,
    ) -> Result<Arc<dyn Component>, ComponentError> {
        let config: TelemetryReceiverConfig = decode_config(id, config)?;
        Ok(Arc::new(self.build(ctx, id, &config, next)?))
    }
}
