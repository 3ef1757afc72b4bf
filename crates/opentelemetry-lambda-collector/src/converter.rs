//! Rewrites applied to the pipeline config before it is built.
//!
//! Each [`Converter`] inspects a [`ConfMap`] and returns a merge patch.
//! Converters are idempotent: applying one to its own output changes
//! nothing.

use crate::confmap::{ConfMap, ConfMapError};
use serde_yaml::{Mapping, Value};

/// Name of the processor injected after `batch`.
pub const DECOUPLE_PROCESSOR: &str = "decouple";
/// Name of the batching processor.
pub const BATCH_PROCESSOR: &str = "batch";
/// Processor injected by [`AccountIdProcessor`].
pub const ACCOUNT_ID_PROCESSOR: &str = "resource/aws-account-id";
/// Resource attribute carrying the AWS account id.
pub const ACCOUNT_ID_ATTRIBUTE: &str = "cloud.account.id";

/// Exporter types that run their own send queue.
pub const QUEUING_EXPORTERS: &[&str] = &[
    "awskinesis",
    "coralogix",
    "datadog",
    "dynatrace",
    "googlecloud",
    "googlecloudpubsub",
    "googlemanagedprometheus",
    "humio",
    "influxdb",
    "jaeger",
    "kafka",
    "logzio",
    "loki",
    "mezmo",
    "observiq",
    "opencensus",
    "otlp",
    "otlphttp",
    "pulsar",
    "sapm",
    "signalfx",
    "skywalking",
    "splunkhec",
    "sumologic",
    "tanzuobservability",
    "zipkin",
];

const PIPELINES: &str = "service::pipelines";

/// Errors from applying a converter.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// A converter failed.
    #[error("converter {converter} failed")]
    Failed {
        /// Converter name.
        converter: &'static str,
        /// Underlying error.
        #[source]
        source: ConfMapError,
    },
}

/// A config rewrite expressed as a merge patch.
pub trait Converter: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Computes the patch for `conf`. An empty patch means no change.
    fn patch(&self, conf: &ConfMap) -> Result<ConfMap, ConvertError>;

    /// Computes the patch and merges it into `conf`.
    fn convert(&self, conf: &mut ConfMap) -> Result<(), ConvertError> {
        let patch = self.patch(conf)?;
        if !patch.is_empty() {
            tracing::debug!(converter = self.name(), "Applying config patch");
            conf.merge(patch);
        }
        Ok(())
    }
}

/// Returns the part of a component id before the first `/`.
pub fn base_name(id: &str) -> &str {
    id.split('/').next().unwrap_or(id)
}

fn processors_path(pipeline: &str) -> String {
    format!("{PIPELINES}::{pipeline}::processors")
}

/// Ensures every pipeline whose last `batch` is not followed by `decouple`
/// ends with `decouple`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoupleAfterBatch;

impl DecoupleAfterBatch {
    fn needs_decouple(processors: &[Value]) -> bool {
        processors
            .iter()
            .filter_map(Value::as_str)
            .fold(false, |needs, name| match base_name(name) {
                BATCH_PROCESSOR => true,
                DECOUPLE_PROCESSOR => false,
                _ => needs,
            })
    }
}

impl Converter for DecoupleAfterBatch {
    fn name(&self) -> &'static str {
        "decouple-after-batch"
    }

    fn patch(&self, conf: &ConfMap) -> Result<ConfMap, ConvertError> {
        let mut patch = ConfMap::new();

        for pipeline in conf.keys(PIPELINES) {
            let path = processors_path(&pipeline);
            let Some(processors) = conf.get(&path).and_then(Value::as_sequence) else {
                continue;
            };
            if Self::needs_decouple(processors) {
                let mut processors = processors.clone();
                processors.push(Value::from(DECOUPLE_PROCESSOR));
                patch.set(&path, Value::Sequence(processors));
            }
        }

        Ok(patch)
    }
}

/// Turns off the send queue of every recognized queuing exporter, so that
/// nothing is left buffered when the sandbox freezes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisableQueuedRetry;

impl Converter for DisableQueuedRetry {
    fn name(&self) -> &'static str {
        "disable-queued-retry"
    }

    fn patch(&self, conf: &ConfMap) -> Result<ConfMap, ConvertError> {
        let mut patch = ConfMap::new();
        for exporter in conf.keys("exporters") {
            if QUEUING_EXPORTERS.contains(&base_name(&exporter)) {
                patch.set(&format!("exporters::{exporter}::sending_queue::enabled"), false);
            }
        }
        Ok(patch)
    }
}

/// Adds `cloud.account.id` to every pipeline through a `resource` processor
/// placed first.
#[derive(Debug, Clone)]
pub struct AccountIdProcessor {
    account_id: String,
}

impl AccountIdProcessor {
    /// Creates the converter for `account_id`.
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }
}

impl Converter for AccountIdProcessor {
    fn name(&self) -> &'static str {
        "account-id"
    }

    fn patch(&self, conf: &ConfMap) -> Result<ConfMap, ConvertError> {
        let mut patch = ConfMap::new();
        if self.account_id.is_empty() {
            return Ok(patch);
        }

        for pipeline in conf.keys(PIPELINES) {
            if !conf
                .get(&format!("{PIPELINES}::{pipeline}"))
                .is_some_and(Value::is_mapping)
            {
                continue;
            }

            let path = processors_path(&pipeline);
            let existing = conf
                .get(&path)
                .and_then(Value::as_sequence)
                .cloned()
                .unwrap_or_default();
            if existing.first().and_then(Value::as_str) == Some(ACCOUNT_ID_PROCESSOR) {
                continue;
            }

            let mut processors = Vec::with_capacity(existing.len() + 1);
            processors.push(Value::from(ACCOUNT_ID_PROCESSOR));
            processors.extend(existing);
            patch.set(&path, Value::Sequence(processors));
        }

        let mut attribute = Mapping::new();
        attribute.insert("key".into(), ACCOUNT_ID_ATTRIBUTE.into());
        attribute.insert("value".into(), self.account_id.as_str().into());
        attribute.insert("action".into(), "insert".into());
        patch.set(
            &format!("processors::{ACCOUNT_ID_PROCESSOR}::attributes"),
            Value::Sequence(vec![Value::Mapping(attribute)]),
        );

        Ok(patch)
    }
}

/// Merges extension configs into `extensions` and enables them in
/// `service::extensions`.
#[derive(Debug, Clone, Default)]
pub struct ExtensionInjection {
    extensions: Vec<(String, Value)>,
}

impl ExtensionInjection {
    /// Creates a converter for the given `(name, config)` pairs.
    pub fn new(extensions: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            extensions: extensions.into_iter().collect(),
        }
    }

    /// Returns true when there is nothing to inject.
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl Converter for ExtensionInjection {
    fn name(&self) -> &'static str {
        "extension-injection"
    }

    fn patch(&self, conf: &ConfMap) -> Result<ConfMap, ConvertError> {
        let mut patch = ConfMap::new();
        if self.extensions.is_empty() {
            return Ok(patch);
        }

        let mut enabled: Vec<Value> = match conf.get("service::extensions") {
            Some(Value::Sequence(items)) => items.clone(),
            Some(Value::String(name)) => vec![Value::from(name.as_str())],
            _ => Vec::new(),
        };

        for (name, config) in &self.extensions {
            patch.set(&format!("extensions::{name}"), config.clone());
            if !enabled.iter().any(|v| v.as_str() == Some(name)) {
                enabled.push(Value::from(name.as_str()));
            }
        }
        patch.set("service::extensions", Value::Sequence(enabled));

        Ok(patch)
    }
}

/// Applies `converters` in order.
pub fn apply_all(conf: &mut ConfMap, converters: &[&dyn Converter]) -> Result<(), ConvertError> {
    for converter in converters {
        converter.convert(conf)?;
    }
    Ok(())
}
