//! Edits resource attributes on every payload.

use crate::component::{
    BuildContext, Component, ComponentError, ComponentId, Processor, ProcessorFactory,
    decode_config,
};
use crate::signal::{
    BoxFuture, ClientInfo, Consumer, ConsumerError, SharedConsumer, Signal, SignalKind,
};
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::resource::v1::Resource;
use serde::Deserialize;
use std::sync::Arc;

/// What an edit does with its key.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeAction {
    /// Set the value only when the key is absent.
    Insert,
    /// Set the value whether or not the key exists.
    Upsert,
    /// Set the value only when the key exists.
    Update,
    /// Remove the key.
    Delete,
}

/// One attribute edit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeEdit {
    /// Attribute key.
    pub key: String,
    /// New value; ignored by `delete`.
    #[serde(default)]
    pub value: serde_yaml::Value,
    /// Edit kind.
    pub action: AttributeAction,
}

/// `resource` processor config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceConfig {
    /// Edits applied in order.
    pub attributes: Vec<AttributeEdit>,
}

fn to_any_value(value: &serde_yaml::Value) -> Option<AnyValue> {
    use serde_yaml::Value;

    let value = match value {
        Value::String(s) => any_value::Value::StringValue(s.clone()),
        Value::Bool(b) => any_value::Value::BoolValue(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => any_value::Value::IntValue(i),
            None => any_value::Value::DoubleValue(n.as_f64()?),
        },
        Value::Null | Value::Sequence(_) | Value::Mapping(_) | Value::Tagged(_) => return None,
    };
    Some(AnyValue { value: Some(value) })
}

/// Applies attribute edits to resources.
pub struct ResourceProcessor {
    edits: Vec<(String, AttributeAction, Option<AnyValue>)>,
    next: SharedConsumer,
}

impl ResourceProcessor {
    /// Creates a processor applying `config` and forwarding to `next`.
    pub fn new(id: &ComponentId, config: &ResourceConfig, next: SharedConsumer) -> Result<Self, ComponentError> {
        let edits = config
            .attributes
            .iter()
            .map(|edit| {
                let value = to_any_value(&edit.value);
                if value.is_none() && edit.action != AttributeAction::Delete {
                    return Err(ComponentError::Invalid {
                        id: id.clone(),
                        reason: format!("attribute {} needs a scalar value", edit.key),
                    });
                }
                Ok((edit.key.clone(), edit.action, value))
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { edits, next })
    }

    fn apply(&self, resource: &mut Option<Resource>) {
        let resource = resource.get_or_insert_with(Resource::default);

        for (key, action, value) in &self.edits {
            let position = resource.attributes.iter().position(|kv| &kv.key == key);
            match (action, position) {
                (AttributeAction::Delete, Some(i)) => {
                    resource.attributes.remove(i);
                }
                (AttributeAction::Insert, None) | (AttributeAction::Upsert, None) => {
                    resource.attributes.push(KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
                (AttributeAction::Update, Some(i)) | (AttributeAction::Upsert, Some(i)) => {
                    resource.attributes[i].value = value.clone();
                }
                _ => {}
            }
        }
    }

    fn process(&self, signal: &mut Signal) {
        match signal {
            Signal::Traces(req) => req
                .resource_spans
                .iter_mut()
                .for_each(|rs| self.apply(&mut rs.resource)),
            Signal::Metrics(req) => req
                .resource_metrics
                .iter_mut()
                .for_each(|rm| self.apply(&mut rm.resource)),
            Signal::Logs(req) => req
                .resource_logs
                .iter_mut()
                .for_each(|rl| self.apply(&mut rl.resource)),
        }
    }
}

impl Consumer for ResourceProcessor {
    fn consume(&self, info: ClientInfo, mut signal: Signal) -> BoxFuture<'_, Result<(), ConsumerError>> {
        self.process(&mut signal);
        self.next.consume(info, signal)
    }
}

impl Component for ResourceProcessor {}

impl Processor for ResourceProcessor {}

/// Factory for `resource`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceProcessorFactory;

impl ProcessorFactory for ResourceProcessorFactory {
    fn type_name(&self) -> &'static str {
        "resource"
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
        let config: ResourceConfig = decode_config(id, config)?;
        Ok(Arc::new(ResourceProcessor::new(id, &config, next)?))
    }
}
