//! Workspaces are namespaces carrying a garage workspace label. A workspace
//! may be pinned to a node group through the namespace's node-selector
//! annotation; sessions and volumes can only land on nodes of that group.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ListParams;

use crate::context::Ctx;
use crate::meta;

#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub name: String,
    /// Node group from the node-selector annotation, empty if unrestricted.
    pub node_group: String,
}

/// Returns the workspace backing the current namespace.
pub async fn current(ctx: &Ctx) -> Result<WorkspaceInfo> {
    let ns = ctx
        .namespaces()
        .get(&ctx.namespace)
        .await
        .with_context(|| format!("workspace {} not found", ctx.namespace))?;
    Ok(from_namespace(&ns))
}

/// Lists all garage workspaces visible to the caller.
pub async fn list(ctx: &Ctx) -> Result<Vec<WorkspaceInfo>> {
    let lp = ListParams::default().labels(meta::LABEL_WORKSPACE_ID);
    let namespaces = ctx
        .namespaces()
        .list(&lp)
        .await
        .context("failed to list workspaces")?;
    Ok(namespaces.items.iter().map(from_namespace).collect())
}

/// Whether a workspace bound to `workspace_group` may place pods on a node in
/// `node_group`. Ungrouped nodes are open to every workspace.
pub fn can_access_node(workspace_group: &str, node_group: &str) -> bool {
    node_group.is_empty() || workspace_group == node_group
}

fn from_namespace(ns: &Namespace) -> WorkspaceInfo {
    let name = ns.metadata.name.clone().unwrap_or_default();
    let node_group = ns
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(meta::ANNOTATION_NODE_SELECTOR))
        .and_then(|selector| parse_node_group(selector))
        .unwrap_or_default();
    WorkspaceInfo { name, node_group }
}

/// Parses `node-restriction.kubernetes.io/nodegroup=<group>` selectors.
fn parse_node_group(selector: &str) -> Option<String> {
    let (key, value) = selector.split_once('=')?;
    if key == meta::LABEL_NODE_GROUP {
        Some(value.to_string())
    } else {
        None
    }
}
