//! Remote commands

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use voc_core::CommandKind;
use voc_runtime::{CommandInvoker, VehicleRecord};

use crate::output::OutputContext;

/// Parse the JSON parameters of a named call
pub fn parse_params(params: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = params else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("Invalid JSON parameters")?;
    if !value.is_object() {
        bail!("Parameters must be a JSON object");
    }
    Ok(Some(value))
}

/// Submit a command and wait for its outcome.
///
/// Fails unless the vehicle reports success.
pub async fn invoke(
    invoker: &Arc<CommandInvoker>,
    vehicle: &VehicleRecord,
    kind: CommandKind,
    params: Option<Value>,
    ctx: &OutputContext,
) -> Result<()> {
    let handle = invoker
        .submit(&vehicle.id, kind.clone(), params)
        .await
        .with_context(|| format!("Failed to send {} to {}", kind, vehicle.id))?;
    ctx.info(&format!(
        "Sent {} to {} (invocation {}), waiting for the vehicle",
        kind, vehicle.id, handle.remote_id
    ));

    let outcome = invoker.await_result(&handle).await?;
    if !outcome.is_success() {
        bail!("{} on {}: {}", kind, vehicle.id, outcome);
    }
    ctx.success(&format!("{} on {}: {}", kind, vehicle.id, outcome));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params(None).unwrap(), None);
        assert_eq!(
            parse_params(Some(r#"{"runtime": 10}"#)).unwrap(),
            Some(json!({"runtime": 10}))
        );
        assert!(parse_params(Some("[1]")).is_err());
        assert!(parse_params(Some("{")).is_err());
    }
}
