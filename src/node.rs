//! Worker node listing and access checks.

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ListParams;

use crate::context::Ctx;
use crate::meta;
use crate::workspace;

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub group: String,
    pub cpu_cores: i64,
    pub memory_bytes: i64,
    pub gpus: i64,
    pub ready: bool,
}

/// Lists worker nodes, skipping control plane nodes.
pub async fn list_workers(ctx: &Ctx) -> Result<Vec<NodeInfo>> {
    let nodes = ctx
        .nodes()
        .list(&ListParams::default())
        .await
        .context("failed to list nodes")?;

    let mut workers = Vec::new();
    for node in &nodes.items {
        let labels = node.metadata.labels.clone().unwrap_or_default();
        if labels.contains_key("node-role.kubernetes.io/control-plane")
            || labels.contains_key("node-role.kubernetes.io/master")
        {
            continue;
        }
        workers.push(node_info(node));
    }
    Ok(workers)
}

/// Returns the allocatable CPU cores, memory bytes and GPU count of a node.
pub async fn resources(ctx: &Ctx, node_name: &str) -> Result<(i64, i64, i64)> {
    let node = ctx
        .nodes()
        .get(node_name)
        .await
        .with_context(|| format!("node {node_name} not found"))?;
    let info = node_info(&node);
    Ok((info.cpu_cores, info.memory_bytes, info.gpus))
}

/// Rejects operations targeting a node the current workspace is not allowed
/// to place pods on. Checked before any provisioning happens.
pub async fn validate_access(ctx: &Ctx, node_name: &str) -> Result<()> {
    let ws = workspace::current(ctx).await?;

    let node = ctx
        .nodes()
        .get(node_name)
        .await
        .with_context(|| format!("node {node_name} not found"))?;
    let node_group = node
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(meta::LABEL_NODE_GROUP))
        .cloned()
        .unwrap_or_default();

    if !workspace::can_access_node(&ws.node_group, &node_group) {
        bail!(
            "workspace {:?} (node group: {}) cannot access node {:?} (node group: {})",
            ws.name,
            display_group(&ws.node_group),
            node_name,
            display_group(&node_group),
        );
    }
    Ok(())
}

fn display_group(group: &str) -> &str {
    if group.is_empty() {
        "-"
    } else {
        group
    }
}

fn node_info(node: &Node) -> NodeInfo {
    let name = node.metadata.name.clone().unwrap_or_default();
    let labels = node.metadata.labels.clone().unwrap_or_default();
    let group = labels.get(meta::LABEL_NODE_GROUP).cloned().unwrap_or_default();

    let allocatable = node
        .status
        .as_ref()
        .and_then(|status| status.allocatable.clone())
        .unwrap_or_default();

    let cpu_cores = allocatable.get("cpu").map(parse_cpu_cores).unwrap_or(0);
    let memory_bytes = allocatable.get("memory").map(parse_bytes).unwrap_or(0);
    let gpus = allocatable
        .get(meta::GPU_RESOURCE)
        .and_then(|quantity| quantity.0.parse::<i64>().ok())
        .unwrap_or(0);

    let ready = node
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|cond| cond.type_ == "Ready" && cond.status == "True")
        })
        .unwrap_or(false);

    NodeInfo {
        name,
        group,
        cpu_cores,
        memory_bytes,
        gpus,
        ready,
    }
}

/// Parses a CPU quantity into whole cores, rounding millis up.
pub fn parse_cpu_cores(quantity: &Quantity) -> i64 {
    let raw = quantity.0.as_str();
    if let Some(millis) = raw.strip_suffix('m') {
        let millis: i64 = millis.parse().unwrap_or(0);
        return (millis + 999) / 1000;
    }
    raw.parse().unwrap_or(0)
}

/// Parses a memory quantity into bytes. Handles binary (Ki/Mi/Gi/Ti) and
/// decimal (k/M/G/T) suffixes.
pub fn parse_bytes(quantity: &Quantity) -> i64 {
    let raw = quantity.0.as_str();
    let suffixes: [(&str, i64); 8] = [
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
        ("T", 1_000_000_000_000),
        ("G", 1_000_000_000),
        ("M", 1_000_000),
        ("k", 1_000),
    ];
    for (suffix, factor) in suffixes {
        if let Some(number) = raw.strip_suffix(suffix) {
            return number.parse::<i64>().unwrap_or(0) * factor;
        }
    }
    raw.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantity(raw: &str) -> Quantity {
        Quantity(raw.to_string())
    }

    #[test]
    fn cpu_cores_round_millis_up() {
        assert_eq!(parse_cpu_cores(&quantity("8")), 8);
        assert_eq!(parse_cpu_cores(&quantity("3500m")), 4);
        assert_eq!(parse_cpu_cores(&quantity("1000m")), 1);
    }

    #[test]
    fn memory_suffixes_parse_to_bytes() {
        assert_eq!(parse_bytes(&quantity("1Ki")), 1024);
        assert_eq!(parse_bytes(&quantity("16Gi")), 16 * (1 << 30));
        assert_eq!(parse_bytes(&quantity("1G")), 1_000_000_000);
        assert_eq!(parse_bytes(&quantity("12345")), 12345);
    }

    #[test]
    fn garbage_quantities_parse_to_zero() {
        assert_eq!(parse_cpu_cores(&quantity("lots")), 0);
        assert_eq!(parse_bytes(&quantity("many")), 0);
    }
}
