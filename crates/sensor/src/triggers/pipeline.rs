use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{self, BackoffSchedule};
use super::{params, EventMap, TriggerOutput, TriggerRegistry};
use crate::crd::Trigger as TriggerSpec;
use crate::{Error, Result};

/// Errors that another attempt cannot fix.
fn is_permanent(err: &Error) -> bool {
    matches!(
        err,
        Error::Parameter(_) | Error::Validation(_) | Error::Config(_) | Error::Cancelled
    )
}

/// Run one trigger against the resolved events: apply template parameters, pick the
/// backend, then fetch, parameterize, execute and check the policy. Execution waits
/// for the trigger's `rateLimit` and is retried under its `retryStrategy`.
pub async fn run_trigger(
    registry: &TriggerRegistry,
    spec: &TriggerSpec,
    events: &EventMap,
    cancel: &CancellationToken,
) -> Result<TriggerOutput> {
    let template = params::apply_template_parameters(&spec.template, &spec.parameters, events)?;
    let trigger = registry
        .get_trigger(&template, spec.policy.as_ref())
        .await?
        .ok_or_else(|| {
            Error::Execution(format!(
                "no backend available for trigger {} of type {}",
                template.name,
                template
                    .kind()
                    .map(|k| k.to_string())
                    .unwrap_or_else(|_| "unknown".to_string())
            ))
        })?;

    debug!(trigger = %template.name, kind = %trigger.trigger_type(), "fetching trigger resource");
    let resource = trigger.fetch_resource(cancel).await?;
    let resource = trigger.apply_resource_parameters(events, resource).await?;

    if let Some(limit) = &spec.rate_limit {
        registry
            .clients()
            .rate_limits()
            .acquire(&template.name, limit, cancel)
            .await?;
    }

    let output = match &spec.retry_strategy {
        Some(strategy) => {
            let schedule = BackoffSchedule::from_spec(strategy)?;
            let backend = trigger.as_ref();
            let name = template.name.as_str();
            backoff::retry(&schedule, cancel, |e| !is_permanent(e), || {
                let resource = resource.clone();
                async move {
                    backend.execute(cancel, events, resource).await.inspect_err(|e| {
                        warn!(trigger = %name, error = %e, "trigger execution failed");
                    })
                }
            })
            .await?
        }
        None => trigger.execute(cancel, events, resource).await?,
    };

    trigger.apply_policy(cancel, &output).await?;
    info!(trigger = %template.name, "trigger completed");
    Ok(output)
}
