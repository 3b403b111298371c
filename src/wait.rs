//! Bounded polling waits for pod state transitions.
//!
//! The orchestrator gives us no completion callback for pod scheduling, so we
//! poll with an explicit interval/timeout pair. Scheduling failures (image
//! pull errors, unschedulable pods) are reported distinctly from command
//! failures inside the container.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use tokio::time::Instant;

use crate::context::Ctx;

#[derive(Debug, Clone, Copy)]
pub struct WaitParams {
    pub timeout: Duration,
    pub interval: Duration,
}

impl WaitParams {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        WaitParams { timeout, interval }
    }
}

/// Waits until a helper pod reaches Running. Fails on Failed/Succeeded
/// phases, on pull errors while Pending, on timeout, and on interrupt.
pub async fn wait_for_running(ctx: &Ctx, pod_name: &str, params: WaitParams) -> Result<()> {
    let pods = ctx.pods();
    let deadline = Instant::now() + params.timeout;

    while Instant::now() < deadline {
        let pod = pods
            .get(pod_name)
            .await
            .with_context(|| format!("failed to get pod {pod_name}"))?;

        match phase(&pod) {
            "Running" => return Ok(()),
            "Failed" | "Succeeded" => {
                bail!("pod {pod_name} ended before running: {}", failure_reason(&pod))
            }
            _ => {
                if let Some(reason) = scheduling_error(&pod) {
                    bail!("pod {pod_name} cannot be scheduled: {reason}");
                }
            }
        }

        sleep_or_cancel(ctx, params.interval).await?;
    }

    Err(anyhow!("timeout waiting for pod {pod_name} to start"))
}

/// Waits until a run-to-completion pod succeeds. A Failed phase surfaces the
/// terminal reason from the container status.
pub async fn wait_for_succeeded(ctx: &Ctx, pod_name: &str, params: WaitParams) -> Result<()> {
    let pods = ctx.pods();
    let deadline = Instant::now() + params.timeout;

    while Instant::now() < deadline {
        let pod = pods
            .get(pod_name)
            .await
            .with_context(|| format!("failed to get pod {pod_name}"))?;

        match phase(&pod) {
            "Succeeded" => return Ok(()),
            "Failed" => bail!("pod {pod_name} failed: {}", failure_reason(&pod)),
            "Pending" => {
                if let Some(reason) = scheduling_error(&pod) {
                    bail!("pod {pod_name} cannot be scheduled: {reason}");
                }
            }
            _ => {}
        }

        sleep_or_cancel(ctx, params.interval).await?;
    }

    Err(anyhow!("timeout waiting for pod {pod_name} to complete"))
}

/// Waits until a session pod is Running with a ready container.
pub async fn wait_for_ready(ctx: &Ctx, pod_name: &str, params: WaitParams) -> Result<()> {
    let pods = ctx.pods();
    let deadline = Instant::now() + params.timeout;

    while Instant::now() < deadline {
        let pod = pods
            .get(pod_name)
            .await
            .with_context(|| format!("failed to get pod {pod_name}"))?;

        match phase(&pod) {
            "Running" if container_ready(&pod) => return Ok(()),
            "Failed" | "Succeeded" => {
                bail!("pod {pod_name} ended with status {}", phase(&pod))
            }
            _ => {
                if let Some(reason) = scheduling_error(&pod) {
                    bail!("pod {pod_name} cannot be scheduled: {reason}");
                }
            }
        }

        sleep_or_cancel(ctx, params.interval).await?;
    }

    Err(anyhow!("timeout waiting for pod {pod_name} to become ready"))
}

async fn sleep_or_cancel(ctx: &Ctx, interval: Duration) -> Result<()> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(anyhow!("operation interrupted")),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

pub fn phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or("")
}

fn container_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| statuses.iter().any(|cs| cs.ready))
        .unwrap_or(false)
}

/// Detects a pod that will never start: image pull failures while Pending.
pub fn scheduling_error(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    for cs in statuses {
        if let Some(waiting) = cs.state.as_ref().and_then(|state| state.waiting.as_ref()) {
            match waiting.reason.as_deref() {
                Some("ImagePullBackOff") | Some("ErrImagePull") => {
                    return Some(format!(
                        "failed to pull image: {}",
                        waiting.message.as_deref().unwrap_or("unknown error")
                    ));
                }
                _ => {}
            }
        }
    }
    None
}

/// Extracts the terminal failure reason from a Failed pod's container status.
pub fn failure_reason(pod: &Pod) -> String {
    if let Some(statuses) = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
    {
        for cs in statuses {
            if let Some(terminated) = cs.state.as_ref().and_then(|state| state.terminated.as_ref()) {
                if let Some(reason) = terminated.reason.as_deref() {
                    if let Some(message) = terminated.message.as_deref() {
                        return format!("{reason}: {message}");
                    }
                    return format!("{reason} (exit code {})", terminated.exit_code);
                }
                return format!("exit code {}", terminated.exit_code);
            }
            if let Some(waiting) = cs.state.as_ref().and_then(|state| state.waiting.as_ref()) {
                if let Some(reason) = waiting.reason.as_deref() {
                    return format!(
                        "{reason}: {}",
                        waiting.message.as_deref().unwrap_or("no details")
                    );
                }
            }
        }
    }
    "unknown reason".to_string()
}
