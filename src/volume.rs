//! Volume management. A volume is a PVC named `<node>-<volume>` pinned to one
//! node; a non-empty boot-image annotation marks it as an OS volume that can
//! host a session.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource,
    Pod, PodSpec, ResourceRequirements, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{DeleteParams, ListParams, ObjectMeta, PostParams};
use tracing::debug;

use crate::context::Ctx;
use crate::meta;
use crate::node;
use crate::session;
use crate::wait::{self, WaitParams};

/// Identity of a volume: `<node>/<volume>`, unique within a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRef {
    pub node: String,
    pub volume: String,
}

impl VolumeRef {
    /// Parses user input of the form `<node>/<volume>`.
    pub fn parse(path: &str) -> Result<Self> {
        match path.split_once('/') {
            Some((node, volume)) if !node.is_empty() && !volume.is_empty() => Ok(VolumeRef {
                node: node.to_string(),
                volume: volume.to_string(),
            }),
            _ => Err(anyhow!(
                "invalid volume path {path:?}, expected <node>/<volume>"
            )),
        }
    }

    /// The backing PVC name. Prefixed with the node so the same volume name
    /// can exist on different nodes.
    pub fn pvc_name(&self) -> String {
        format!("{}-{}", self.node, self.volume)
    }
}

impl fmt::Display for VolumeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.volume)
    }
}

#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub node: String,
    pub volume: String,
    pub status: String,
    pub size: String,
    /// Boot image from the annotation; None for plain data volumes.
    pub image: Option<String>,
    pub age: String,
}

impl VolumeInfo {
    pub fn is_os_volume(&self) -> bool {
        self.image.is_some()
    }
}

pub struct CreateOptions {
    pub size: Option<String>,
    /// If set, creates an OS volume: the image goes into the boot-image
    /// annotation and a binder pod triggers PVC binding and caches the image.
    pub image: Option<String>,
}

/// Lists all garage volumes in the current workspace.
pub async fn list(ctx: &Ctx) -> Result<Vec<VolumeInfo>> {
    let lp = ListParams::default().labels(&format!(
        "{}={}",
        meta::LABEL_MANAGED_BY,
        meta::MANAGED_BY
    ));
    let pvcs = ctx
        .pvcs()
        .list(&lp)
        .await
        .with_context(|| format!("failed to list volumes in workspace {}", ctx.namespace))?;

    let mut volumes = Vec::new();
    for pvc in &pvcs.items {
        volumes.push(volume_info(ctx, pvc).await);
    }
    Ok(volumes)
}

/// Returns one volume by reference, or an error if it does not exist.
pub async fn get(ctx: &Ctx, vref: &VolumeRef) -> Result<VolumeInfo> {
    let pvc = ctx
        .pvcs()
        .get_opt(&vref.pvc_name())
        .await
        .context("failed to look up volume")?
        .ok_or_else(|| anyhow!("volume {vref} not found"))?;
    Ok(volume_info(ctx, &pvc).await)
}

/// Whether the volume exists at all.
pub async fn exists(ctx: &Ctx, vref: &VolumeRef) -> Result<bool> {
    let pvc = ctx
        .pvcs()
        .get_opt(&vref.pvc_name())
        .await
        .context("failed to look up volume")?;
    Ok(pvc.is_some())
}

/// Creates a new volume. OS volumes additionally run a binder pod so the PVC
/// binds and the boot image lands in the node's cache; the pod and the PVC
/// are both covered by the cleanup registry until the create finishes.
pub async fn create(ctx: &Ctx, vref: &VolumeRef, opts: CreateOptions) -> Result<()> {
    node::validate_access(ctx, &vref.node).await?;

    let size = opts.size.unwrap_or_else(|| meta::DEFAULT_VOLUME_SIZE.to_string());
    let pvc = new_pvc(vref, &size, opts.image.as_deref(), &ctx.namespace);
    let pvc_name = vref.pvc_name();

    ctx.pvcs()
        .create(&PostParams::default(), &pvc)
        .await
        .map_err(|err| classify_create_error(err, vref))?;
    debug!(volume = %vref, %size, "created pvc");

    let Some(image) = opts.image else {
        return Ok(());
    };

    // The PVC only needs cleanup while the binder pod is in flight.
    register_pvc_cleanup(ctx, &pvc_name);

    let binder = new_binder_pod(&pvc_name, &vref.node, &image, &ctx.namespace);
    let binder_name = binder.metadata.name.clone().unwrap_or_default();
    if let Err(err) = ctx.pods().create(&PostParams::default(), &binder).await {
        ctx.cleanup.unregister();
        let _ = ctx.pvcs().delete(&pvc_name, &DeleteParams::default()).await;
        return Err(err).context("failed to create binder pod");
    }
    register_pod_cleanup(ctx, &binder_name, "binder pod");

    let wait = WaitParams::new(Duration::from_secs(300), Duration::from_secs(2));
    if let Err(err) = wait::wait_for_succeeded(ctx, &binder_name, wait).await {
        if ctx.cleanup.was_interrupted() {
            ctx.cleanup.wait_for_cleanup().await;
            return Ok(());
        }
        ctx.cleanup.unregister(); // binder pod
        ctx.cleanup.unregister(); // pvc
        let _ = ctx.pods().delete(&binder_name, &DeleteParams::default()).await;
        let _ = ctx.pvcs().delete(&pvc_name, &DeleteParams::default()).await;
        return Err(err).context("volume binding failed");
    }

    ctx.cleanup.unregister(); // binder pod
    ctx.cleanup.unregister(); // pvc
    let _ = ctx.pods().delete(&binder_name, &DeleteParams::default()).await;
    Ok(())
}

/// Creates the destination PVC for a copy, cloning size and boot-image marker
/// from the source. Registers a cleanup entry for the new PVC; the caller
/// decides its fate and must unregister exactly once.
pub(crate) async fn provision_clone(
    ctx: &Ctx,
    dst: &VolumeRef,
    src: &VolumeInfo,
) -> Result<String> {
    let pvc = new_pvc(dst, &src.size, src.image.as_deref(), &ctx.namespace);
    let pvc_name = dst.pvc_name();
    ctx.pvcs()
        .create(&PostParams::default(), &pvc)
        .await
        .map_err(|err| classify_create_error(err, dst))?;
    register_pvc_cleanup(ctx, &pvc_name);
    Ok(pvc_name)
}

/// Deletes a volume. Refused while the volume still has an active session.
pub async fn delete(ctx: &Ctx, vref: &VolumeRef) -> Result<()> {
    if let Some(mode) = session::mode_of(ctx, vref).await? {
        bail!(
            "cannot delete volume {vref}: active {mode} session exists, \
             delete the session first with: garage delete session {vref}"
        );
    }

    match ctx.pvcs().delete(&vref.pvc_name(), &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Err(anyhow!("volume {vref} not found")),
        Err(err) => Err(err).with_context(|| format!("failed to delete volume {vref}")),
    }
}

fn classify_create_error(err: kube::Error, vref: &VolumeRef) -> anyhow::Error {
    match err {
        kube::Error::Api(ref api) if api.code == 409 => {
            anyhow!("volume {vref} already exists")
        }
        kube::Error::Api(ref api) if api.code == 403 => {
            anyhow!("not allowed to create volume {vref}: {}", api.message)
        }
        other => anyhow::Error::new(other).context(format!("failed to create volume {vref}")),
    }
}

pub(crate) fn register_pvc_cleanup(ctx: &Ctx, pvc_name: &str) {
    let pvcs = ctx.pvcs();
    let name = pvc_name.to_string();
    ctx.cleanup.register(move || async move {
        eprint!("Cleaning up volume {name}...");
        match pvcs.delete(&name, &DeleteParams::default()).await {
            Ok(_) => eprintln!(" done"),
            Err(err) => eprintln!(" failed: {err}"),
        }
    });
}

pub(crate) fn register_pod_cleanup(ctx: &Ctx, pod_name: &str, what: &'static str) {
    let pods = ctx.pods();
    let name = pod_name.to_string();
    ctx.cleanup.register(move || async move {
        eprint!("Cleaning up {what} {name}...");
        match pods.delete(&name, &DeleteParams::default()).await {
            Ok(_) => eprintln!(" done"),
            Err(err) => eprintln!(" failed: {err}"),
        }
    });
}

async fn volume_info(ctx: &Ctx, pvc: &PersistentVolumeClaim) -> VolumeInfo {
    let labels = pvc.metadata.labels.clone().unwrap_or_default();
    let annotations = pvc.metadata.annotations.clone().unwrap_or_default();
    let pvc_name = pvc.metadata.name.clone().unwrap_or_default();

    let node = annotations
        .get(meta::ANNOTATION_SELECTED_NODE)
        .or_else(|| labels.get(meta::LABEL_NODE_NAME))
        .cloned()
        .unwrap_or_default();
    let volume = labels
        .get(meta::LABEL_VOLUME_NAME)
        .cloned()
        .unwrap_or_else(|| pvc_name.clone());
    let image = annotations.get(meta::ANNOTATION_BOOT_IMAGE).cloned();

    let size = pvc
        .spec
        .as_ref()
        .and_then(|spec| spec.resources.as_ref())
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get("storage"))
        .map(|quantity| quantity.0.clone())
        .unwrap_or_else(|| "N/A".to_string());

    let status = derive_status(ctx, pvc, &pvc_name).await;

    let age = pvc
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| {
            let elapsed = k8s_openapi::chrono::Utc::now() - time.0;
            format_age(elapsed.num_seconds().max(0))
        })
        .unwrap_or_default();

    VolumeInfo {
        node,
        volume,
        status,
        size,
        image,
        age,
    }
}

/// Volume status: binding in progress shows as Initializing, an associated
/// session pod's phase wins over the PVC phase.
async fn derive_status(ctx: &Ctx, pvc: &PersistentVolumeClaim, pvc_name: &str) -> String {
    let pvc_phase = pvc
        .status
        .as_ref()
        .and_then(|status| status.phase.clone())
        .unwrap_or_default();

    if let Ok(Some(binder)) = ctx.pods().get_opt(&binder_pod_name(pvc_name)).await {
        return match wait::phase(&binder) {
            "Failed" => "InitFailed".to_string(),
            _ => "Initializing".to_string(),
        };
    }
    if let Ok(Some(pod)) = ctx.pods().get_opt(pvc_name).await {
        let phase = wait::phase(&pod);
        if !phase.is_empty() {
            return phase.to_string();
        }
    }
    pvc_phase
}

pub(crate) fn binder_pod_name(pvc_name: &str) -> String {
    format!("bind-{pvc_name}")
}

/// Builds the PVC for a volume. The boot-image annotation is only set for OS
/// volumes.
pub(crate) fn new_pvc(
    vref: &VolumeRef,
    size: &str,
    image: Option<&str>,
    namespace: &str,
) -> PersistentVolumeClaim {
    let mut annotations = BTreeMap::new();
    if let Some(image) = image {
        annotations.insert(meta::ANNOTATION_BOOT_IMAGE.to_string(), image.to_string());
    }

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(vref.pvc_name()),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels(vref)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn managed_labels(vref: &VolumeRef) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            meta::LABEL_MANAGED_BY.to_string(),
            meta::MANAGED_BY.to_string(),
        ),
        (meta::LABEL_NODE_NAME.to_string(), vref.node.clone()),
        (meta::LABEL_VOLUME_NAME.to_string(), vref.volume.clone()),
    ])
}

/// The binder pod mounts the fresh PVC once and exits immediately; its only
/// job is to trigger binding and pull the boot image onto the node.
fn new_binder_pod(pvc_name: &str, node_name: &str, image: &str, namespace: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(binder_pod_name(pvc_name)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (
                    meta::LABEL_MANAGED_BY.to_string(),
                    meta::MANAGED_BY.to_string(),
                ),
                (meta::LABEL_POD_MODE.to_string(), "bind".to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_selector: Some(BTreeMap::from([(
                meta::LABEL_HOSTNAME.to_string(),
                node_name.to_string(),
            )])),
            containers: vec![Container {
                name: "bind".to_string(),
                image: Some(image.to_string()),
                resources: Some(capped_resources()),
                volume_mounts: Some(vec![mount("data", "/mnt/data", false)]),
                command: Some(vec!["true".to_string()]),
                ..Default::default()
            }],
            volumes: Some(vec![pvc_volume("data", pvc_name, false)]),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Zero requests with modest limits, shared by binder/copy helper pods.
pub(crate) fn capped_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("0".to_string())),
            ("memory".to_string(), Quantity("0".to_string())),
        ])),
        limits: Some(BTreeMap::from([
            (
                "cpu".to_string(),
                Quantity(meta::HELPER_CPU_LIMIT.to_string()),
            ),
            (
                "memory".to_string(),
                Quantity(meta::HELPER_MEMORY_LIMIT.to_string()),
            ),
        ])),
        ..Default::default()
    }
}

pub(crate) fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

pub(crate) fn pvc_volume(name: &str, claim: &str, read_only: bool) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: read_only.then_some(true),
        }),
        ..Default::default()
    }
}

pub(crate) fn format_age(secs: i64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}
