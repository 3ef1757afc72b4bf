//! Lambda resource attribute detection.
//!
//! The Telemetry API translator stamps every signal it synthesizes with a
//! static resource describing the function. Detection follows the
//! OpenTelemetry SDK's `ResourceDetector` pattern and the result is converted
//! once into the protobuf `Resource` carried by OTLP requests.

use opentelemetry::{KeyValue, Value};
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue as ProtoKeyValue, any_value};
use opentelemetry_proto::tonic::resource::v1::Resource as ProtoResource;
use opentelemetry_sdk::resource::{Resource, ResourceDetector};
use std::env;

/// Attribute names used across the crate.
pub mod semconv {
    pub use opentelemetry_semantic_conventions::attribute::{
        CLOUD_PLATFORM, CLOUD_PROVIDER, CLOUD_REGION, FAAS_COLDSTART, FAAS_INVOCATION_ID,
        FAAS_MAX_MEMORY, FAAS_NAME, FAAS_TRIGGER, FAAS_VERSION,
    };
    pub use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

    /// Cloud provider hosting the function.
    pub const FAAS_PROVIDER: &str = "faas.provider";
    /// Region the function was invoked in.
    pub const FAAS_INVOKED_REGION: &str = "faas.invoked_region";
    /// Execution id set by some Lambda instrumentations.
    pub const FAAS_EXECUTION: &str = "faas.execution";
    /// Account owning the function.
    pub const CLOUD_ACCOUNT_ID: &str = "cloud.account.id";
    /// Unique id of the collector instance.
    pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";
    /// Error classification on failed spans.
    pub const ERROR_TYPE: &str = "error.type";
}

const AWS_REGION: &str = "AWS_REGION";
const AWS_LAMBDA_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";
const AWS_LAMBDA_FUNCTION_VERSION: &str = "AWS_LAMBDA_FUNCTION_VERSION";
const AWS_LAMBDA_FUNCTION_MEMORY_SIZE: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
const UNKNOWN_SERVICE: &str = "unknown_service";

/// Detects the function's identity from the Lambda environment.
///
/// # Environment Variables
///
/// - `OTEL_SERVICE_NAME` - `service.name`, overriding the function name
/// - `AWS_LAMBDA_FUNCTION_NAME` - `faas.name`, and `service.name` fallback
/// - `AWS_LAMBDA_FUNCTION_VERSION` - `faas.version`
/// - `AWS_LAMBDA_FUNCTION_MEMORY_SIZE` - `faas.max_memory`, converted from MB to bytes
/// - `AWS_REGION` - `faas.invoked_region` and `cloud.region`
///
/// Unlike the SDK's own detectors this one always returns the provider
/// attributes, so `sam local` and unit tests see the same shape as Lambda.
#[derive(Debug, Default)]
pub struct LambdaResourceDetector;

impl LambdaResourceDetector {
    /// Creates a new detector.
    pub fn new() -> Self {
        Self
    }
}

impl ResourceDetector for LambdaResourceDetector {
    fn detect(&self) -> Resource {
        let function_name = env::var(AWS_LAMBDA_FUNCTION_NAME).ok();
        let service_name = env::var(OTEL_SERVICE_NAME)
            .ok()
            .or_else(|| function_name.clone())
            .unwrap_or_else(|| UNKNOWN_SERVICE.to_string());

        let mut attributes = vec![
            KeyValue::new(semconv::FAAS_PROVIDER, "aws"),
            KeyValue::new(semconv::CLOUD_PROVIDER, "aws"),
            KeyValue::new(semconv::CLOUD_PLATFORM, "aws_lambda"),
            KeyValue::new(semconv::SERVICE_NAME, service_name),
        ];

        if let Some(name) = function_name {
            attributes.push(KeyValue::new(semconv::FAAS_NAME, name));
        }

        if let Ok(version) = env::var(AWS_LAMBDA_FUNCTION_VERSION) {
            attributes.push(KeyValue::new(semconv::FAAS_VERSION, version));
        }

        if let Ok(memory) = env::var(AWS_LAMBDA_FUNCTION_MEMORY_SIZE)
            && let Ok(mb) = memory.parse::<i64>()
        {
            attributes.push(KeyValue::new(semconv::FAAS_MAX_MEMORY, mb * 1024 * 1024));
        }

        if let Ok(region) = env::var(AWS_REGION) {
            attributes.push(KeyValue::new(semconv::FAAS_INVOKED_REGION, region.clone()));
            attributes.push(KeyValue::new(semconv::CLOUD_REGION, region));
        }

        Resource::builder_empty().with_attributes(attributes).build()
    }
}

/// Detects the Lambda resource, adding `service.instance.id` when known.
pub fn detect_resource(service_instance_id: Option<&str>) -> Resource {
    let mut builder = Resource::builder_empty().with_detector(Box::new(LambdaResourceDetector));
    if let Some(id) = service_instance_id {
        builder = builder.with_attribute(KeyValue::new(semconv::SERVICE_INSTANCE_ID, id.to_string()));
    }
    builder.build()
}

/// Converts an SDK resource to the protobuf form carried by OTLP requests.
///
/// Attributes are sorted by key so repeated conversions compare equal.
pub fn to_proto_resource(resource: &Resource) -> ProtoResource {
    let mut attributes: Vec<ProtoKeyValue> = resource
        .iter()
        .map(|(key, value)| ProtoKeyValue {
            key: key.to_string(),
            value: Some(to_any_value(value)),
        })
        .collect();
    attributes.sort_by(|a, b| a.key.cmp(&b.key));

    ProtoResource {
        attributes,
        ..Default::default()
    }
}

fn to_any_value(value: &Value) -> AnyValue {
    let value = match value {
        Value::Bool(b) => any_value::Value::BoolValue(*b),
        Value::I64(i) => any_value::Value::IntValue(*i),
        Value::F64(f) => any_value::Value::DoubleValue(*f),
        other => any_value::Value::StringValue(other.as_str().into_owned()),
    };
    AnyValue { value: Some(value) }
}
