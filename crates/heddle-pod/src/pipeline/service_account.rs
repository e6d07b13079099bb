//! Service accounts of the step pod and its executor

use k8s_openapi::api::core::v1::{PodSpec, SecretVolumeSource, Volume};
use tracing::debug;

use heddle_common::{Error, Result};

use super::volumes::add_volume;
use crate::cluster::ServiceAccountTokens;
use crate::constants::SA_TOKEN_VOLUME_NAME;
use crate::types::{Template, WorkflowSpec};

fn non_empty(name: &Option<String>) -> Option<&str> {
    name.as_deref().filter(|n| !n.is_empty())
}

/// Service account the executor containers run as, template over workflow
pub fn executor_service_account<'a>(tmpl: &'a Template, wf: &'a WorkflowSpec) -> Option<&'a str> {
    tmpl.executor
        .as_ref()
        .and_then(|e| non_empty(&e.service_account_name))
        .or_else(|| wf.executor.as_ref().and_then(|e| non_empty(&e.service_account_name)))
}

/// Set the pod's service account and mount the executor's token
///
/// Without an executor account the executor borrows the pod's token, so
/// disabling automount then leaves it with no API access at all.
pub async fn setup_service_account(
    mut spec: PodSpec,
    tmpl: &Template,
    wf: &WorkflowSpec,
    namespace: &str,
    tokens: &dyn ServiceAccountTokens,
) -> Result<PodSpec> {
    if let Some(name) =
        non_empty(&tmpl.service_account_name).or(non_empty(&wf.service_account_name))
    {
        spec.service_account_name = Some(name.to_string());
    }

    let automount = tmpl
        .automount_service_account_token
        .or(wf.automount_service_account_token);
    if automount == Some(false) {
        spec.automount_service_account_token = Some(false);
    }

    match executor_service_account(tmpl, wf) {
        Some(account) => {
            let secret_name = tokens.token_secret_name(namespace, account).await?;
            debug!(account, secret = %secret_name, "mounting executor service account token");
            add_volume(
                spec.volumes.get_or_insert_with(Vec::new),
                Volume {
                    name: SA_TOKEN_VOLUME_NAME.to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(secret_name),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )?;
        }
        None if automount == Some(false) => {
            return Err(Error::bad_request_for_field(
                "executor.serviceAccountName",
                "executor.serviceAccountName must not be empty if automountServiceAccountToken is false",
            ));
        }
        None => {}
    }
    Ok(spec)
}
