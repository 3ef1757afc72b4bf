//! Extension lifecycle manager.
//!
//! Startup registers with the Extensions API, stands up the queueing
//! Telemetry listener, subscribes it to platform events, loads and rewrites
//! the pipeline config, and starts the pipeline. The event loop then follows
//! the host:
//!
//! - `INVOKE`: notify function-invoked, wait for the invocation's
//!   `platform.runtimeDone`, notify function-finished
//! - `SHUTDOWN` or cancellation: notify environment-shutdown, stop the
//!   listener, stop the pipeline
//!
//! Startup failures are reported with `init/error`, later ones with
//! `exit/error`.

use crate::component::{BuildContext, Factories, HostContext};
use crate::config::Settings;
use crate::converter::{
    AccountIdProcessor, Converter, DecoupleAfterBatch, DisableQueuedRetry,
    ExtensionInjection, apply_all,
};
use crate::error::{CollectorError, Result};
use crate::extension_api::{EventKind, ExtensionClient, RegisterResponse};
use crate::lifecycle::{LifecycleEvent, Notifier};
use crate::listener::{Listener, ListenerError};
use crate::pipeline::Pipeline;
use crate::telemetry_api::{TelemetryApiClient, TelemetrySubscription};
use serde_yaml::Value;
use tokio_util::sync::CancellationToken;

/// Drives the extension through the Lambda lifecycle.
pub struct Manager {
    settings: Settings,
    extension_name: String,
    factories: Factories,
    injected_extensions: Vec<(String, Value)>,
    client: ExtensionClient,
    notifier: Notifier,
    listener: Option<Listener>,
    pipeline: Option<Pipeline>,
}

impl Manager {
    /// Creates a manager registering as `extension_name`.
    ///
    /// # Errors
    ///
    /// Returns an error when `AWS_LAMBDA_RUNTIME_API` is unset.
    pub fn new(settings: Settings, extension_name: impl Into<String>) -> Result<Self> {
        let client = ExtensionClient::new(settings.require_runtime_api()?)?;
        Ok(Self {
            settings,
            extension_name: extension_name.into(),
            factories: Factories::builtin(),
            injected_extensions: Vec::new(),
            client,
            notifier: Notifier::new(),
            listener: None,
            pipeline: None,
        })
    }

    /// Replaces the component factories.
    pub fn with_factories(mut self, factories: Factories) -> Self {
        self.factories = factories;
        self
    }

    /// Extension configs merged into every pipeline config.
    pub fn with_extensions(mut self, extensions: impl IntoIterator<Item = (String, Value)>) -> Self {
        self.injected_extensions = extensions.into_iter().collect();
        self
    }

    /// Lifecycle notifier shared with pipeline components.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Runs startup and the event loop until `SHUTDOWN` or `cancel`.
    ///
    /// # Errors
    ///
    /// Returns the first startup error, or an error from the event poll or
    /// from stopping the pipeline.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        if let Err(error) = self.start(&cancel).await {
            tracing::error!(error = %error, "Failed to start the extension");
            self.report(ReportKind::Init, &error).await;
            self.teardown().await;
            return Err(error);
        }

        let result = self.event_loop(&cancel).await;
        if let Err(error) = &result {
            self.report(ReportKind::Exit, error).await;
        }
        result
    }

    async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        let receives_invokes = self.settings.init_type.receives_invokes();
        let events: &[EventKind] = if receives_invokes {
            &[EventKind::Invoke, EventKind::Shutdown]
        } else {
            &[EventKind::Shutdown]
        };

        let registered = self.client.register(&self.extension_name, events).await?;
        tracing::info!(
            extension = %self.extension_name,
            init_type = %self.settings.init_type,
            "Registered with the Extensions API"
        );

        if receives_invokes {
            self.subscribe_listener(&registered).await?;
        } else {
            tracing::debug!("No invocations are delivered in this mode, skipping Telemetry listener");
        }

        let mut conf = self.settings.load_pipeline_config()?;
        self.rewrite(&mut conf, &registered)?;

        let ctx = BuildContext::new(self.notifier.clone()).with_host(HostContext {
            runtime_api: self.settings.runtime_api.clone(),
            extension_id: Some(registered.extension_id.clone()),
            sam_local: self.settings.sam_local,
            service_instance_id: Some(registered.extension_id.clone()),
            metrics_temporality: self.settings.temporality(),
        });
        let pipeline = Pipeline::build(&conf, &self.factories, &ctx)?;
        tracing::debug!(pipelines = ?pipeline.names(), "Pipeline built");

        let pipeline = self.pipeline.insert(pipeline);
        pipeline.start(cancel).await?;
        Ok(())
    }

    async fn subscribe_listener(&mut self, registered: &RegisterResponse) -> Result<()> {
        let listener = self.listener.insert(Listener::queueing(self.settings.sam_local));
        let uri = listener.start(None).await?;

        let runtime_api = self.settings.require_runtime_api()?;
        let outcome = TelemetryApiClient::new(runtime_api)?
            .subscribe(
                &registered.extension_id,
                &TelemetrySubscription::platform_events(uri),
            )
            .await?;
        tracing::debug!(?outcome, "Subscribed Telemetry listener to platform events");
        Ok(())
    }

    fn rewrite(
        &self,
        conf: &mut crate::confmap::ConfMap,
        registered: &RegisterResponse,
    ) -> Result<()> {
        let account_id = registered
            .account_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(AccountIdProcessor::new);
        let injection = ExtensionInjection::new(self.injected_extensions.clone());

        let mut converters: Vec<&dyn Converter> = Vec::with_capacity(4);
        if let Some(account_id) = &account_id {
            converters.push(account_id);
        }
        converters.push(&DisableQueuedRetry);
        converters.push(&DecoupleAfterBatch);
        if !injection.is_empty() {
            converters.push(&injection);
        }

        apply_all(conf, &converters)?;
        Ok(())
    }

    async fn event_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            tracing::debug!("Waiting for next event");
            let event = match self.client.next_event(cancel).await {
                Ok(event) => event,
                Err(_) if cancel.is_cancelled() => {
                    tracing::info!("Cancelled, shutting down");
                    return self.shutdown().await;
                }
                Err(error) => {
                    tracing::warn!(%error, "Error waiting for extension event");
                    if let Err(shutdown_error) = self.shutdown().await {
                        tracing::warn!(error = %shutdown_error, "Failed to shut down after poll error");
                    }
                    return Err(error.into());
                }
            };

            match event.event_type {
                EventKind::Shutdown => {
                    tracing::info!(reason = ?event.shutdown_reason, "Received SHUTDOWN event");
                    return self.shutdown().await;
                }
                EventKind::Invoke => {
                    self.notifier.notify(LifecycleEvent::FunctionInvoked).await;
                    self.wait_for_invocation(&event.request_id, cancel).await;
                    self.notifier.notify(LifecycleEvent::FunctionFinished).await;
                }
                EventKind::Unknown => {
                    tracing::debug!("Ignoring unknown event type");
                }
            }
        }
    }

    async fn wait_for_invocation(&self, request_id: &str, cancel: &CancellationToken) {
        let Some(listener) = &self.listener else {
            return;
        };
        match listener.wait(request_id, cancel).await {
            Ok(()) => {}
            Err(ListenerError::Cancelled { .. }) => {
                tracing::debug!(request_id, "Stopped waiting for runtimeDone");
            }
            Err(error) => {
                tracing::error!(%error, request_id, "Problem waiting for platform.runtimeDone event");
            }
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.notifier.notify(LifecycleEvent::EnvironmentShutdown).await;
        if let Some(listener) = self.listener.as_mut() {
            listener.shutdown().await?;
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.stop().await?;
        }
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some(listener) = self.listener.as_mut()
            && let Err(error) = listener.shutdown().await
        {
            tracing::warn!(%error, "Failed to stop Telemetry listener");
        }
        if let Some(pipeline) = &self.pipeline
            && let Err(error) = pipeline.stop().await
        {
            tracing::warn!(%error, "Failed to stop pipeline");
        }
    }

    async fn report(&self, kind: ReportKind, error: &CollectorError) {
        let error_type = error.error_type();
        let result = match kind {
            ReportKind::Init => self.client.init_error(&error_type).await,
            ReportKind::Exit => self.client.exit_error(&error_type).await,
        };
        match result {
            Ok(status) => tracing::debug!(status = %status.status, "Reported error to the host"),
            Err(report_error) => {
                tracing::warn!(error = %report_error, "Failed to report error to the host")
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ReportKind {
    Init,
    Exit,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("extension_name", &self.extension_name)
            .field("init_type", &self.settings.init_type)
            .field("listener", &self.listener)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_new_requires_runtime_api() {
        let err = Manager::new(Settings::default(), "ext").unwrap_err();
        assert!(matches!(
            err,
            CollectorError::Config(ConfigError::MissingRuntimeApi)
        ));
    }

    #[test]
    fn test_rewrite_applies_converters_in_order() {
        let settings = Settings {
            runtime_api: Some("127.0.0.1:9001".to_string()),
            ..Default::default()
        };
        let manager = Manager::new(settings, "ext")
            .unwrap()
            .with_extensions([("health_check".to_string(), Value::Null)]);
        let registered = RegisterResponse {
            extension_id: "id".to_string(),
            account_id: Some("123456789012".to_string()),
            ..Default::default()
        };

        let mut conf = crate::confmap::ConfMap::from_yaml(
            "exporters:\n  otlphttp:\n    endpoint: http://x\nservice:\n  pipelines:\n    traces:\n      processors: [batch]\n",
        )
        .unwrap();
        manager.rewrite(&mut conf, &registered).unwrap();

        let processors: Vec<String> = conf
            .decode("service::pipelines::traces::processors")
            .unwrap();
        assert_eq!(processors, ["resource/aws-account-id", "batch", "decouple"]);
        assert_eq!(
            conf.get("exporters::otlphttp::sending_queue::enabled"),
            Some(&Value::Bool(false))
        );
        assert!(conf.contains("extensions::health_check"));

        let once = conf.clone();
        manager.rewrite(&mut conf, &registered).unwrap();
        assert_eq!(conf, once);
    }
}
