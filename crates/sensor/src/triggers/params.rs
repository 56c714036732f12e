//! Parameter substitution from resolved events into trigger resources.

use serde_json::Value;
use tracing::debug;

use super::EventMap;
use crate::crd::{ParameterOperation, TriggerParameter, TriggerParameterSource, TriggerTemplate};
use crate::{jsonpath, template, Error, Result};

/// Resolve a parameter source against the resolved events.
///
/// Falls back to the literal `value` when the event is missing, its payload cannot be
/// decoded or the key does not exist. Without a fallback these are parameter errors.
pub fn resolve_param_value(src: &TriggerParameterSource, events: &EventMap) -> Result<String> {
    let fallback = |reason: String| match &src.value {
        Some(value) => {
            debug!(dependency = %src.dependency_name, %reason, "using default parameter value");
            Ok(value.clone())
        }
        None => Err(Error::Parameter(reason)),
    };

    let Some(event) = events.get(&src.dependency_name) else {
        return fallback(format!(
            "no resolved event for dependency '{}'",
            src.dependency_name
        ));
    };

    let (key, tmpl, payload) = if src.context_key.is_some() || src.context_template.is_some() {
        (
            src.context_key.as_deref(),
            src.context_template.as_deref(),
            serde_json::to_value(&event.context)?,
        )
    } else if src.data_key.is_some() || src.data_template.is_some() {
        let data = match event.data_as_json() {
            Ok(data) => data,
            Err(e) => return fallback(e.to_string()),
        };
        (src.data_key.as_deref(), src.data_template.as_deref(), data)
    } else {
        return match &src.value {
            Some(value) => Ok(value.clone()),
            None => Ok(event.to_json().to_string()),
        };
    };

    if let Some(tmpl) = tmpl {
        match template::render_input(tmpl, &payload) {
            Ok(rendered) => return Ok(rendered),
            Err(e) if key.is_none() => return fallback(e.to_string()),
            Err(e) => debug!(error = %e, "template failed, falling back to key"),
        }
    }

    match key.and_then(|k| jsonpath::get(&payload, k)) {
        Some(found) => Ok(jsonpath::value_to_string(found)),
        None => fallback(format!(
            "key '{}' not found in event of dependency '{}'",
            key.unwrap_or_default(),
            src.dependency_name
        )),
    }
}

/// Apply each parameter to `resource` in order.
pub fn apply_params(
    mut resource: Value,
    params: &[TriggerParameter],
    events: &EventMap,
) -> Result<Value> {
    for param in params {
        let src = param.src.as_ref().ok_or_else(|| {
            Error::Parameter(format!("parameter for '{}' has no source", param.dest))
        })?;
        let mut value = resolve_param_value(src, events)?;

        if param.operation != ParameterOperation::Overwrite {
            if let Some(current) = jsonpath::get(&resource, &param.dest) {
                let current = jsonpath::value_to_string(current);
                value = match param.operation {
                    ParameterOperation::Append => current + &value,
                    _ => value + &current,
                };
            }
        }

        jsonpath::set(&mut resource, &param.dest, Value::String(value))?;
    }
    Ok(resource)
}

/// Build a JSON request body from payload parameters.
pub fn construct_payload(events: &EventMap, params: &[TriggerParameter]) -> Result<Value> {
    apply_params(Value::Object(serde_json::Map::new()), params, events)
}

/// Apply template-level parameters to the trigger template itself.
pub fn apply_template_parameters(
    template: &TriggerTemplate,
    params: &[TriggerParameter],
    events: &EventMap,
) -> Result<TriggerTemplate> {
    if params.is_empty() {
        return Ok(template.clone());
    }
    let applied = apply_params(serde_json::to_value(template)?, params, events)?;
    serde_json::from_value(applied)
        .map_err(|e| Error::Parameter(format!("parameters produced an invalid trigger template: {}", e)))
}
