use std::collections::HashSet;

use globset::Glob;

use super::expr::{self, normalize};
use super::filter::parse_time_of_day;
use super::gate::Gates;
use super::value_expr::ValueExpr;
use super::weight::BUCKETS;
use crate::crd::{
    Comparator, EventDependency, JsonType, Sensor, Trigger, TriggerParameter, TriggerKind,
};
use crate::triggers::backoff::BackoffSchedule;
use crate::{Error, Result};

/// Check a sensor definition. Every failure is an [`Error::Validation`] that is fatal
/// for the sensor until its spec is fixed.
pub fn validate_sensor(sensor: &Sensor) -> Result<Gates> {
    if sensor.metadata.name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::Validation("sensor has no name".to_string()));
    }

    let spec = &sensor.spec;
    if spec.dependencies.is_empty() {
        return Err(Error::Validation("no event dependencies found".to_string()));
    }
    if spec.triggers.is_empty() {
        return Err(Error::Validation("no triggers found".to_string()));
    }

    let mut names = HashSet::new();
    for dep in &spec.dependencies {
        validate_dependency(dep)?;
        if !names.insert(normalize(&dep.name)) {
            return Err(Error::Validation(format!("duplicate dependency name '{}'", dep.name)));
        }
    }

    for group in &spec.dependency_groups {
        if !expr::is_valid_identifier(&group.name) {
            return Err(Error::Validation(format!(
                "dependency group name '{}' must contain only letters, digits, '_' or '-'",
                group.name
            )));
        }
        if group.dependencies.is_empty() {
            return Err(Error::Validation(format!(
                "dependency group '{}' has no dependencies",
                group.name
            )));
        }
        if !names.insert(normalize(&group.name)) {
            return Err(Error::Validation(format!(
                "dependency group name '{}' collides with another dependency or group",
                group.name
            )));
        }
    }

    let mut trigger_names = HashSet::new();
    let mut total_weight = 0u32;
    for trigger in &spec.triggers {
        validate_trigger(trigger)?;
        let name = &trigger.template.name;
        if !trigger_names.insert(name.clone()) {
            return Err(Error::Validation(format!("duplicate trigger name '{}'", name)));
        }
        if names.contains(&normalize(name)) {
            return Err(Error::Validation(format!(
                "trigger name '{}' collides with a dependency or group",
                name
            )));
        }
        if trigger.weight > BUCKETS {
            return Err(Error::Validation(format!(
                "trigger '{}': weight {} exceeds {}",
                name, trigger.weight, BUCKETS
            )));
        }
        total_weight = total_weight.saturating_add(trigger.weight);
    }
    if total_weight != 0 && total_weight != BUCKETS {
        return Err(Error::Validation(format!(
            "trigger weights add up to {}, must add up to exactly {}",
            total_weight, BUCKETS
        )));
    }

    Gates::compile(spec)
}

fn validate_dependency(dep: &EventDependency) -> Result<()> {
    if !expr::is_valid_identifier(&dep.name) {
        return Err(Error::Validation(format!(
            "dependency name '{}' must contain only letters, digits, '_' or '-'",
            dep.name
        )));
    }
    if dep.event_source_name.is_empty() || dep.event_name.is_empty() {
        return Err(Error::Validation(format!(
            "dependency '{}' must set eventSourceName and eventName",
            dep.name
        )));
    }
    for pattern in [&dep.event_source_name, &dep.event_name] {
        Glob::new(pattern).map_err(|e| {
            Error::Validation(format!("dependency '{}': invalid pattern: {}", dep.name, e))
        })?;
    }

    let Some(filters) = &dep.filters else {
        return Ok(());
    };

    if let Some(time) = &filters.time {
        let start = time.start.as_deref().filter(|s| !s.is_empty()).map(parse_time_of_day).transpose()?;
        let stop = time.stop.as_deref().filter(|s| !s.is_empty()).map(parse_time_of_day).transpose()?;
        if let (Some(start), Some(stop)) = (start, stop) {
            if stop <= start {
                return Err(Error::Validation(format!(
                    "dependency '{}': time filter stop {} must be after start {}",
                    dep.name, stop, start
                )));
            }
        }
    }

    for data in &filters.data {
        if data.path.is_empty() {
            return Err(Error::Validation(format!(
                "dependency '{}': data filter path is empty",
                dep.name
            )));
        }
        if data.value.is_empty() {
            return Err(Error::Validation(format!(
                "dependency '{}': data filter on '{}' has no values",
                dep.name, data.path
            )));
        }
        let comparator = data.comparator.unwrap_or_default();
        if data.value_type == JsonType::String
            && !matches!(comparator, Comparator::Equal | Comparator::NotEqual)
        {
            return Err(Error::Validation(format!(
                "dependency '{}': string filter on '{}' only supports '=' and '!='",
                dep.name, data.path
            )));
        }
    }

    for filter in &filters.exprs {
        let parsed = ValueExpr::parse(&filter.expr).map_err(|e| {
            Error::Validation(format!("dependency '{}': {}", dep.name, e))
        })?;
        let bound: HashSet<&str> = filter.fields.iter().map(|f| f.name.as_str()).collect();
        if let Some(field) = filter.fields.iter().find(|f| f.path.is_empty() || f.name.is_empty()) {
            return Err(Error::Validation(format!(
                "dependency '{}': expression field '{}' needs a path and a name",
                dep.name, field.name
            )));
        }
        if let Some(unbound) = parsed.fields().into_iter().find(|f| !bound.contains(f.as_str())) {
            return Err(Error::Validation(format!(
                "dependency '{}': expression '{}' reads '{}' which no field binds",
                dep.name, filter.expr, unbound
            )));
        }
    }

    Ok(())
}

fn validate_trigger(trigger: &Trigger) -> Result<()> {
    let template = &trigger.template;
    if template.name.is_empty() {
        return Err(Error::Validation("trigger template has no name".to_string()));
    }
    let kind = template.kind()?;

    validate_parameters(&template.name, &trigger.parameters)?;
    match kind {
        TriggerKind::K8s => {
            if let Some(k8s) = &template.k8s {
                validate_parameters(&template.name, &k8s.parameters)?;
                validate_source(&template.name, &k8s.source)?;
            }
        }
        TriggerKind::Http => {
            if let Some(http) = &template.http {
                if http.url.is_empty() {
                    return Err(Error::Validation(format!("trigger '{}': http url is empty", template.name)));
                }
                url::Url::parse(&http.url).map_err(|e| {
                    Error::Validation(format!("trigger '{}': invalid http url '{}': {}", template.name, http.url, e))
                })?;
                validate_parameters(&template.name, &http.parameters)?;
                validate_parameters(&template.name, &http.payload)?;
            }
        }
        TriggerKind::Nats => {
            if let Some(nats) = &template.nats {
                if nats.url.is_empty() || nats.subject.is_empty() {
                    return Err(Error::Validation(format!(
                        "trigger '{}': nats url and subject are required",
                        template.name
                    )));
                }
                validate_parameters(&template.name, &nats.parameters)?;
                validate_parameters(&template.name, &nats.payload)?;
            }
        }
        TriggerKind::Slack => {
            if let Some(slack) = &template.slack {
                validate_parameters(&template.name, &slack.parameters)?;
            }
        }
        TriggerKind::OpenWhisk => {
            if let Some(ow) = &template.open_whisk {
                validate_parameters(&template.name, &ow.parameters)?;
                validate_parameters(&template.name, &ow.payload)?;
            }
        }
        TriggerKind::ArgoWorkflow => {
            if let Some(argo) = &template.argo_workflow {
                validate_parameters(&template.name, &argo.parameters)?;
                validate_source(&template.name, &argo.source)?;
            }
        }
        _ => {}
    }

    if let Some(policy) = &trigger.policy {
        if let Some(status) = &policy.status {
            if status.allow.is_empty() {
                return Err(Error::Validation(format!(
                    "trigger '{}': status policy allows no status codes",
                    template.name
                )));
            }
        }
        if let Some(k8s) = &policy.k8s {
            BackoffSchedule::from_spec(&k8s.backoff)?;
        }
    }
    if let Some(retry) = &trigger.retry_strategy {
        BackoffSchedule::from_spec(retry)?;
    }
    if let Some(limit) = &trigger.rate_limit {
        if limit.requests_per_unit == 0 {
            return Err(Error::Validation(format!(
                "trigger '{}': rate limit needs at least one request per unit",
                template.name
            )));
        }
    }

    Ok(())
}

fn validate_source(trigger: &str, source: &crate::crd::ArtifactLocation) -> Result<()> {
    let set = [
        source.inline.is_some(),
        source.resource.is_some(),
        source.file.is_some(),
        source.url.is_some(),
        source.configmap.is_some(),
    ]
    .iter()
    .filter(|s| **s)
    .count();
    if set != 1 {
        return Err(Error::Validation(format!(
            "trigger '{}': resource source must set exactly one of inline, resource, file, url, configmap",
            trigger
        )));
    }
    Ok(())
}

fn validate_parameters(trigger: &str, parameters: &[TriggerParameter]) -> Result<()> {
    for param in parameters {
        if param.dest.is_empty() {
            return Err(Error::Validation(format!(
                "trigger '{}': parameter destination is empty",
                trigger
            )));
        }
        let Some(src) = &param.src else {
            return Err(Error::Validation(format!(
                "trigger '{}': parameter for '{}' has no source",
                trigger, param.dest
            )));
        };
        if src.dependency_name.is_empty() {
            return Err(Error::Validation(format!(
                "trigger '{}': parameter for '{}' has no dependencyName",
                trigger, param.dest
            )));
        }
        if src.context_key.is_some() && src.data_key.is_some() {
            return Err(Error::Validation(format!(
                "trigger '{}': parameter for '{}' sets both contextKey and dataKey",
                trigger, param.dest
            )));
        }
        if src.context_template.is_some() && src.data_template.is_some() {
            return Err(Error::Validation(format!(
                "trigger '{}': parameter for '{}' sets both contextTemplate and dataTemplate",
                trigger, param.dest
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_sensor;

    fn sensor(spec_yaml: &str) -> Sensor {
        let doc = format!(
            "apiVersion: tripwire.io/v1alpha1\nkind: Sensor\nmetadata:\n  name: s\nspec:\n{}",
            spec_yaml
        );
        parse_sensor(doc.as_bytes()).unwrap()
    }

    const DEPS: &str = r#"
  dependencies:
    - name: dep-a
      eventSourceName: webhook
      eventName: a
    - name: dep-b
      eventSourceName: "calendar-*"
      eventName: b
"#;

    #[test]
    fn test_valid_sensor() {
        let s = sensor(&format!(
            "{}  triggers:\n    - template:\n        name: t\n        log: {{}}\n      conditions: dep-a || dep-b\n",
            DEPS
        ));
        let gates = validate_sensor(&s).unwrap();
        assert_eq!(gates.triggers().len(), 1);
    }

    #[test]
    fn test_no_triggers() {
        let s = sensor(&format!("{}  triggers: []\n", DEPS));
        assert!(matches!(validate_sensor(&s), Err(Error::Validation(_))));
    }

    #[test]
    fn test_unknown_condition_identifier() {
        let s = sensor(&format!(
            "{}  triggers:\n    - template:\n        name: t\n        log: {{}}\n      conditions: dep-a && dep-z\n",
            DEPS
        ));
        let err = validate_sensor(&s).unwrap_err().to_string();
        assert!(err.contains("dep_z"));
    }

    #[test]
    fn test_time_filter_stop_before_start() {
        let s = sensor(
            r#"
  dependencies:
    - name: dep-a
      eventSourceName: webhook
      eventName: a
      filters:
        time:
          start: "18:00:00"
          stop: "09:00:00"
  triggers:
    - template:
        name: t
        log: {}
"#,
        );
        assert!(matches!(validate_sensor(&s), Err(Error::Validation(_))));
    }

    fn weighted(a: u32, b: u32) -> Sensor {
        sensor(&format!(
            "{}  triggers:\n    - template:\n        name: t1\n        log: {{}}\n      weight: {}\n    - template:\n        name: t2\n        log: {{}}\n      weight: {}\n",
            DEPS, a, b
        ))
    }

    #[test]
    fn test_weights_must_cover_every_bucket() {
        assert!(validate_sensor(&weighted(30, 70)).is_ok());
        assert!(matches!(validate_sensor(&weighted(20, 20)), Err(Error::Validation(_))));
        assert!(matches!(validate_sensor(&weighted(100, 0)), Ok(_)));
    }

    #[test]
    fn test_oversized_weight_is_rejected() {
        assert!(matches!(
            validate_sensor(&weighted(u32::MAX, 1)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_weights_over_one_hundred() {
        let s = sensor(&format!(
            "{}  triggers:\n    - template:\n        name: t1\n        log: {{}}\n      weight: 60\n    - template:\n        name: t2\n        log: {{}}\n      weight: 50\n",
            DEPS
        ));
        assert!(matches!(validate_sensor(&s), Err(Error::Validation(_))));
    }

    #[test]
    fn test_context_and_data_key_are_exclusive() {
        let s = sensor(&format!(
            r#"{}  triggers:
    - template:
        name: t
        http:
          url: http://localhost/x
          payload:
            - src:
                dependencyName: dep-a
                contextKey: id
                dataKey: body.id
              dest: id
"#,
            DEPS
        ));
        assert!(matches!(validate_sensor(&s), Err(Error::Validation(_))));
    }

    #[test]
    fn test_http_url_must_parse() {
        let s = sensor(&format!(
            "{}  triggers:\n    - template:\n        name: t\n        http:\n          url: not a url\n",
            DEPS
        ));
        assert!(matches!(validate_sensor(&s), Err(Error::Validation(_))));
    }

    #[test]
    fn test_trigger_with_two_backends() {
        let s = sensor(&format!(
            "{}  triggers:\n    - template:\n        name: t\n        log: {{}}\n        http:\n          url: http://x\n",
            DEPS
        ));
        assert!(matches!(validate_sensor(&s), Err(Error::Validation(_))));
    }

    fn with_expr(expr: &str) -> Sensor {
        sensor(&format!(
            r#"
  dependencies:
    - name: dep-a
      eventSourceName: webhook
      eventName: a
      filters:
        exprs:
          - expr: "{}"
            fields:
              - path: body.count
                name: count
  triggers:
    - template:
        name: t
        log: {{}}
"#,
            expr
        ))
    }

    #[test]
    fn test_expr_filters_are_checked() {
        assert!(validate_sensor(&with_expr("count > 2")).is_ok());
        assert!(matches!(
            validate_sensor(&with_expr("count >")),
            Err(Error::Validation(_))
        ));
        let err = validate_sensor(&with_expr("count > limit")).unwrap_err().to_string();
        assert!(err.contains("limit"));
    }

    #[test]
    fn test_rate_limit_needs_requests() {
        let limited = |n: u32| {
            sensor(&format!(
                "{}  triggers:
    - template:
        name: t
        log: {{}}
      rateLimit:
        unit: Minute
        requestsPerUnit: {}
",
                DEPS, n
            ))
        };
        assert!(validate_sensor(&limited(10)).is_ok());
        assert!(matches!(validate_sensor(&limited(0)), Err(Error::Validation(_))));
    }
}
