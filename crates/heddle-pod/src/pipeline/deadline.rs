//! Deadline resolution
//!
//! Three clocks bound a step: the workflow deadline, the template's
//! `activeDeadlineSeconds`, and the template `timeout` counted from the node's
//! start. The first two become the pod's `activeDeadlineSeconds`; the third
//! is checked once the pod is assembled.

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Container;

use heddle_common::{Error, Result};

use crate::constants::{ENV_DEBUG_PAUSE_AFTER, ENV_DEBUG_PAUSE_BEFORE};
use crate::types::{NodeStatus, Template};

/// Outcome of resolving the pod's active deadline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveDeadline {
    /// Create the pod with this `activeDeadlineSeconds` (none when `None`)
    Seconds(Option<i64>),
    /// No time is left to run the pod, so none may be created
    Expired,
}

/// Resolve the pod's `activeDeadlineSeconds`
///
/// Exit handlers ignore the workflow deadline so they still run after it has
/// passed. A template deadline of zero or less leaves no time at all and
/// expires the step like a passed workflow deadline. A step paused for
/// debugging never gets a deadline.
pub fn resolve(
    workflow_deadline: Option<DateTime<Utc>>,
    template_deadline_seconds: Option<i64>,
    on_exit_pod: bool,
    debug_paused: bool,
    now: DateTime<Utc>,
) -> ActiveDeadline {
    let seconds = match workflow_deadline {
        Some(deadline) if !on_exit_pod => {
            let remaining = (deadline - now).num_seconds();
            if remaining <= 0 {
                return ActiveDeadline::Expired;
            }
            match template_deadline_seconds {
                Some(tmpl) if tmpl <= remaining => Some(tmpl),
                _ => Some(remaining),
            }
        }
        _ => template_deadline_seconds,
    };
    if seconds.is_some_and(|s| s <= 0) {
        return ActiveDeadline::Expired;
    }

    if debug_paused {
        return ActiveDeadline::Seconds(None);
    }
    ActiveDeadline::Seconds(seconds)
}

/// Whether any main container requests a debug pause
pub fn is_debug_paused(main_containers: &[Container]) -> bool {
    main_containers
        .iter()
        .flat_map(|c| c.env.iter().flatten())
        .any(|e| e.name == ENV_DEBUG_PAUSE_BEFORE || e.name == ENV_DEBUG_PAUSE_AFTER)
}

/// Deadline handed to the executor: the earlier of the workflow deadline and
/// the caller's execution deadline
pub fn execution_deadline(
    workflow_deadline: Option<DateTime<Utc>>,
    execution_deadline: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (workflow_deadline, execution_deadline) {
        (Some(wf), Some(exec)) => Some(wf.min(exec)),
        (wf, exec) => wf.or(exec),
    }
}

/// RFC3339 form of a deadline; no deadline is the zero time
pub fn format_deadline(deadline: Option<DateTime<Utc>>) -> String {
    let zero = Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).single();
    deadline
        .or(zero)
        .map(|d| d.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| "0001-01-01T00:00:00Z".to_string())
}

/// Absolute deadline implied by the template's `timeout`
///
/// Fails when the timeout has already elapsed.
pub fn template_deadline(
    tmpl: &Template,
    node: Option<&NodeStatus>,
    node_name: &str,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let (Some(node), Some(timeout)) = (node, tmpl.timeout.as_deref()) else {
        return Ok(None);
    };
    if timeout.trim().is_empty() {
        return Ok(None);
    }
    let duration = humantime::parse_duration(timeout.trim()).map_err(|e| {
        Error::bad_request_for_field("timeout", format!("invalid timeout format. {}", e))
    })?;
    let duration = chrono::Duration::from_std(duration).map_err(|e| {
        Error::bad_request_for_field("timeout", format!("invalid timeout format. {}", e))
    })?;
    let deadline = node.started_at.unwrap_or(now) + duration;
    if now > deadline {
        return Err(Error::deadline_exceeded(node_name));
    }
    Ok(Some(deadline))
}

/// Tighten `activeDeadlineSeconds` to the template deadline
///
/// With one second or less left the pod would be dead on arrival, so the step
/// fails instead.
pub fn apply_template_deadline(
    active_deadline_seconds: Option<i64>,
    template_deadline: Option<DateTime<Utc>>,
    node_name: &str,
    now: DateTime<Utc>,
) -> Result<Option<i64>> {
    let Some(deadline) = template_deadline else {
        return Ok(active_deadline_seconds);
    };
    let remaining = (deadline - now).num_seconds();
    if remaining <= 1 {
        return Err(Error::deadline_exceeded(node_name));
    }
    match active_deadline_seconds {
        Some(current) if current <= remaining => Ok(Some(current)),
        _ => Ok(Some(remaining)),
    }
}
