//! Sessions: ephemeral compute pods bound to one OS volume.
//!
//! A session pod shares the volume's `<node>-<volume>` name, which is what
//! guarantees at most one session per volume.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{AttachParams, DeleteParams, ListParams, LogParams, ObjectMeta, PostParams};
use tracing::debug;

use crate::context::Ctx;
use crate::meta;
use crate::node;
use crate::volume::{self, VolumeRef};
use crate::wait::{self, WaitParams};

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub pod_name: String,
    pub node: String,
    pub volume: String,
    pub mode: String,
    pub status: String,
    pub gpus: i64,
    pub age: String,
}

#[derive(Debug, Clone)]
pub struct MountOption {
    /// PVC name of the extra volume to mount.
    pub claim: String,
    /// Path inside the session.
    pub path: String,
}

impl MountOption {
    /// Parses `<node>/<volume>:<path>` mount arguments.
    pub fn parse(arg: &str) -> Result<Self> {
        let (volume, path) = arg
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid mount {arg:?}, expected <node>/<volume>:<path>"))?;
        if !path.starts_with('/') {
            bail!("mount path {path:?} must be absolute");
        }
        let vref = VolumeRef::parse(volume)?;
        Ok(MountOption {
            claim: vref.pvc_name(),
            path: path.to_string(),
        })
    }
}

pub struct RunOptions {
    pub gpus: i64,
    /// Command to run; interactive shell when empty.
    pub command: Vec<String>,
    pub mounts: Vec<MountOption>,
}

pub struct SessionStart {
    pub pod_name: String,
    /// True when a live session already existed and was reused.
    pub existing: bool,
}

pub fn session_pod_name(vref: &VolumeRef) -> String {
    vref.pvc_name()
}

/// Returns the mode of the volume's active session, or None when the volume
/// is free. Terminated pods do not count as sessions.
pub async fn mode_of(ctx: &Ctx, vref: &VolumeRef) -> Result<Option<String>> {
    let pod = ctx
        .pods()
        .get_opt(&session_pod_name(vref))
        .await
        .with_context(|| format!("failed to check session for volume {vref}"))?;
    let Some(pod) = pod else {
        return Ok(None);
    };

    match wait::phase(&pod) {
        "Succeeded" | "Failed" => Ok(None),
        _ => Ok(Some(mode_label(&pod))),
    }
}

/// Lists sessions in the current workspace.
pub async fn list(ctx: &Ctx) -> Result<Vec<SessionInfo>> {
    let lp = ListParams::default().labels(&format!(
        "{}={},{}",
        meta::LABEL_MANAGED_BY,
        meta::MANAGED_BY,
        meta::LABEL_SESSION_MODE
    ));
    let pods = ctx
        .pods()
        .list(&lp)
        .await
        .with_context(|| format!("failed to list sessions in workspace {}", ctx.namespace))?;
    Ok(pods.items.iter().map(session_info).collect())
}

/// Starts a GPU session on an OS volume, or reuses the live one.
pub async fn run(ctx: &Ctx, vref: &VolumeRef, opts: RunOptions) -> Result<SessionStart> {
    node::validate_access(ctx, &vref.node).await?;
    let image = boot_image(ctx, vref).await?;

    let pod_name = session_pod_name(vref);
    if reuse_or_clear(ctx, &pod_name).await? {
        return Ok(SessionStart {
            pod_name,
            existing: true,
        });
    }

    let (total_cpu, total_mem, total_gpu) = node::resources(ctx, &vref.node).await?;
    if total_gpu == 0 {
        bail!("node {} has no GPUs available", vref.node);
    }
    if opts.gpus < 1 || opts.gpus > total_gpu {
        bail!(
            "requested {} GPUs but node {} has {total_gpu}",
            opts.gpus,
            vref.node
        );
    }
    let (cpu_limit, mem_limit) = run_limits(total_cpu, total_mem, total_gpu, opts.gpus);

    let pod = new_session_pod(SessionPodParams {
        vref,
        image: &image,
        namespace: &ctx.namespace,
        mode: meta::SESSION_MODE_RUN,
        gpus: opts.gpus,
        cpu_limit: Some(cpu_limit.to_string()),
        mem_limit: Some(mem_limit.to_string()),
        command: &opts.command,
        mounts: &opts.mounts,
    });
    ctx.pods()
        .create(&PostParams::default(), &pod)
        .await
        .with_context(|| format!("failed to create session for volume {vref}"))?;
    debug!(volume = %vref, gpus = opts.gpus, "created run session");

    Ok(SessionStart {
        pod_name,
        existing: false,
    })
}

/// Starts a CPU-only maintenance session on an OS volume.
pub async fn edit(ctx: &Ctx, vref: &VolumeRef, mounts: Vec<MountOption>) -> Result<SessionStart> {
    node::validate_access(ctx, &vref.node).await?;
    let image = boot_image(ctx, vref).await?;

    let pod_name = session_pod_name(vref);
    if reuse_or_clear(ctx, &pod_name).await? {
        return Ok(SessionStart {
            pod_name,
            existing: true,
        });
    }

    let pod = new_session_pod(SessionPodParams {
        vref,
        image: &image,
        namespace: &ctx.namespace,
        mode: meta::SESSION_MODE_EDIT,
        gpus: 0,
        cpu_limit: Some(meta::HELPER_CPU_LIMIT.to_string()),
        mem_limit: Some(meta::HELPER_MEMORY_LIMIT.to_string()),
        command: &[],
        mounts: &mounts,
    });
    ctx.pods()
        .create(&PostParams::default(), &pod)
        .await
        .with_context(|| format!("failed to create session for volume {vref}"))?;
    debug!(volume = %vref, "created edit session");

    Ok(SessionStart {
        pod_name,
        existing: false,
    })
}

/// Stops the volume's session by deleting its pod. The volume stays intact.
pub async fn stop(ctx: &Ctx, vref: &VolumeRef) -> Result<()> {
    match ctx
        .pods()
        .delete(&session_pod_name(vref), &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => {
            Err(anyhow!("no session found for volume {vref}"))
        }
        Err(err) => Err(err).with_context(|| format!("failed to stop session for volume {vref}")),
    }
}

pub struct LogsOptions {
    pub follow: bool,
    pub tail: Option<i64>,
}

/// Prints session logs to stdout, optionally following the stream.
pub async fn logs(ctx: &Ctx, vref: &VolumeRef, opts: LogsOptions) -> Result<()> {
    let pod_name = session_pod_name(vref);
    let lp = LogParams {
        container: Some("main".to_string()),
        follow: opts.follow,
        tail_lines: opts.tail,
        ..Default::default()
    };

    if !opts.follow {
        let text = ctx
            .pods()
            .logs(&pod_name, &lp)
            .await
            .with_context(|| format!("failed to get logs for session {vref}"))?;
        print!("{text}");
        return Ok(());
    }

    let stream = ctx
        .pods()
        .log_stream(&pod_name, &lp)
        .await
        .with_context(|| format!("failed to stream logs for session {vref}"))?;
    let mut lines = stream.lines();
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            line = lines.try_next() => match line? {
                Some(line) => println!("{line}"),
                None => return Ok(()),
            },
        }
    }
}

/// Attaches an interactive shell to the running session, piping the local
/// terminal through the exec channel.
pub async fn attach(ctx: &Ctx, vref: &VolumeRef) -> Result<()> {
    let pod_name = session_pod_name(vref);
    let wait = WaitParams::new(Duration::from_secs(120), Duration::from_secs(1));
    wait::wait_for_ready(ctx, &pod_name, wait).await?;

    let ap = AttachParams::interactive_tty();
    let mut attached = ctx
        .pods()
        .exec(&pod_name, vec!["/bin/sh"], &ap)
        .await
        .with_context(|| format!("failed to attach to session {vref}"))?;

    let mut remote_stdin = attached
        .stdin()
        .ok_or_else(|| anyhow!("exec channel has no stdin"))?;
    let mut remote_stdout = attached
        .stdout()
        .ok_or_else(|| anyhow!("exec channel has no stdout"))?;

    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let _ = tokio::io::copy(&mut stdin, &mut remote_stdin).await;
    });
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let _ = tokio::io::copy(&mut remote_stdout, &mut stdout).await;
    });

    attached
        .join()
        .await
        .with_context(|| format!("session {vref} exec channel failed"))
}

/// Session resource caps: 7/8 of the node, scaled by the GPU share.
pub(crate) fn run_limits(
    total_cpu_cores: i64,
    total_mem_bytes: i64,
    total_gpus: i64,
    gpus: i64,
) -> (i64, i64) {
    let cpu = (7 * total_cpu_cores * gpus) / (8 * total_gpus);
    let mem = (7 * total_mem_bytes * gpus) / (8 * total_gpus);
    (cpu.max(1), mem)
}

async fn boot_image(ctx: &Ctx, vref: &VolumeRef) -> Result<String> {
    let info = volume::get(ctx, vref).await?;
    info.image
        .ok_or_else(|| anyhow!("volume {vref} is not an OS volume (no boot image configured)"))
}

/// Reuses a live session pod, or deletes a terminated leftover so a new one
/// can take its name. Returns true when the existing session should be used.
async fn reuse_or_clear(ctx: &Ctx, pod_name: &str) -> Result<bool> {
    let Some(pod) = ctx
        .pods()
        .get_opt(pod_name)
        .await
        .context("failed to check for existing session")?
    else {
        return Ok(false);
    };

    match wait::phase(&pod) {
        "Running" | "Pending" => Ok(true),
        _ => {
            ctx.pods()
                .delete(pod_name, &DeleteParams::default())
                .await
                .context("failed to clean up terminated session pod")?;
            // Give the API server a moment to release the name.
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(false)
        }
    }
}

struct SessionPodParams<'a> {
    vref: &'a VolumeRef,
    image: &'a str,
    namespace: &'a str,
    mode: &'a str,
    gpus: i64,
    cpu_limit: Option<String>,
    mem_limit: Option<String>,
    command: &'a [String],
    mounts: &'a [MountOption],
}

fn new_session_pod(params: SessionPodParams<'_>) -> Pod {
    let mut volume_mounts = vec![volume::mount("boot-volume", meta::BOOT_MOUNT_PATH, false)];
    let mut volumes = vec![volume::pvc_volume(
        "boot-volume",
        &params.vref.pvc_name(),
        false,
    )];
    for (i, extra) in params.mounts.iter().enumerate() {
        let name = format!("mount-{i}");
        volume_mounts.push(volume::mount(&name, &extra.path, false));
        volumes.push(volume::pvc_volume(&name, &extra.claim, false));
    }

    let mut limits = BTreeMap::new();
    if let Some(cpu) = params.cpu_limit {
        limits.insert("cpu".to_string(), Quantity(cpu));
    }
    if let Some(mem) = params.mem_limit {
        limits.insert("memory".to_string(), Quantity(mem));
    }
    if params.gpus > 0 {
        limits.insert(
            meta::GPU_RESOURCE.to_string(),
            Quantity(params.gpus.to_string()),
        );
    }

    let mut container = Container {
        name: "main".to_string(),
        image: Some(params.image.to_string()),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("0".to_string())),
                ("memory".to_string(), Quantity("0".to_string())),
            ])),
            limits: Some(limits),
            ..Default::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    if params.command.is_empty() {
        container.command = Some(vec!["/bin/sh".to_string()]);
        container.stdin = Some(true);
        container.tty = Some(true);
    } else {
        container.command = Some(vec!["/bin/sh".to_string(), "-c".to_string()]);
        container.args = Some(vec![params.command.join(" ")]);
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(session_pod_name(params.vref)),
            namespace: Some(params.namespace.to_string()),
            labels: Some(BTreeMap::from([
                (
                    meta::LABEL_MANAGED_BY.to_string(),
                    meta::MANAGED_BY.to_string(),
                ),
                (meta::LABEL_NODE_NAME.to_string(), params.vref.node.clone()),
                (
                    meta::LABEL_VOLUME_NAME.to_string(),
                    params.vref.volume.clone(),
                ),
                (
                    meta::LABEL_SESSION_MODE.to_string(),
                    params.mode.to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_selector: Some(BTreeMap::from([(
                meta::LABEL_HOSTNAME.to_string(),
                params.vref.node.clone(),
            )])),
            containers: vec![container],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mode_label(pod: &Pod) -> String {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(meta::LABEL_SESSION_MODE))
        .cloned()
        .unwrap_or_else(|| meta::SESSION_MODE_EDIT.to_string())
}

fn session_info(pod: &Pod) -> SessionInfo {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let gpus = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .filter_map(|c| c.resources.as_ref())
                .filter_map(|r| r.limits.as_ref())
                .filter_map(|l| l.get(meta::GPU_RESOURCE))
                .filter_map(|q| q.0.parse::<i64>().ok())
                .sum()
        })
        .unwrap_or(0);

    let age = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|time| {
            let elapsed = k8s_openapi::chrono::Utc::now() - time.0;
            volume::format_age(elapsed.num_seconds().max(0))
        })
        .unwrap_or_default();

    SessionInfo {
        pod_name: pod.metadata.name.clone().unwrap_or_default(),
        node: labels.get(meta::LABEL_NODE_NAME).cloned().unwrap_or_default(),
        volume: labels
            .get(meta::LABEL_VOLUME_NAME)
            .cloned()
            .unwrap_or_default(),
        mode: mode_label(pod),
        status: wait::phase(pod).to_string(),
        gpus,
        age,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vref() -> VolumeRef {
        VolumeRef::parse("ferrari/os-volume").unwrap()
    }

    #[test]
    fn session_and_volume_share_a_name() {
        assert_eq!(session_pod_name(&vref()), "ferrari-os-volume");
    }

    #[test]
    fn run_limits_scale_with_gpu_share() {
        // 8 GPUs, 64 cores, 512Gi: one GPU gets 7 cores and 56Gi
        let gi = 1i64 << 30;
        let (cpu, mem) = run_limits(64, 512 * gi, 8, 1);
        assert_eq!(cpu, 7);
        assert_eq!(mem, 56 * gi);

        // all GPUs get 7/8 of the node
        let (cpu, mem) = run_limits(64, 512 * gi, 8, 8);
        assert_eq!(cpu, 56);
        assert_eq!(mem, 448 * gi);
    }

    #[test]
    fn run_limits_never_drop_below_one_core() {
        let (cpu, _) = run_limits(4, 1 << 30, 8, 1);
        assert_eq!(cpu, 1);
    }

    #[test]
    fn mount_options_parse() {
        let opt = MountOption::parse("ferrari/data:/datasets").unwrap();
        assert_eq!(opt.claim, "ferrari-data");
        assert_eq!(opt.path, "/datasets");

        assert!(MountOption::parse("ferrari/data").is_err());
        assert!(MountOption::parse("ferrari/data:relative").is_err());
    }

    #[test]
    fn interactive_session_pod_gets_a_tty() {
        let pod = new_session_pod(SessionPodParams {
            vref: &vref(),
            image: "cuda:12.5",
            namespace: "ws-test",
            mode: meta::SESSION_MODE_RUN,
            gpus: 2,
            cpu_limit: Some("14".to_string()),
            mem_limit: Some("1073741824".to_string()),
            command: &[],
            mounts: &[],
        });
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.stdin, Some(true));
        assert_eq!(container.tty, Some(true));
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits.get(meta::GPU_RESOURCE).unwrap().0, "2");
        assert_eq!(limits.get("cpu").unwrap().0, "14");
    }

    #[test]
    fn batch_session_pod_wraps_the_command() {
        let command = vec!["python".to_string(), "train.py".to_string()];
        let pod = new_session_pod(SessionPodParams {
            vref: &vref(),
            image: "cuda:12.5",
            namespace: "ws-test",
            mode: meta::SESSION_MODE_RUN,
            gpus: 1,
            cpu_limit: None,
            mem_limit: None,
            command: &command,
            mounts: &[],
        });
        let container = &pod.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.command.as_ref().unwrap(), &["/bin/sh", "-c"]);
        assert_eq!(container.args.as_ref().unwrap(), &["python train.py"]);
        assert!(container.tty.is_none());
    }

    #[test]
    fn extra_mounts_land_in_the_pod_spec() {
        let mounts = vec![MountOption::parse("ferrari/data:/datasets").unwrap()];
        let pod = new_session_pod(SessionPodParams {
            vref: &vref(),
            image: "cuda:12.5",
            namespace: "ws-test",
            mode: meta::SESSION_MODE_EDIT,
            gpus: 0,
            cpu_limit: None,
            mem_limit: None,
            command: &[],
            mounts: &mounts,
        });
        let spec = pod.spec.unwrap();
        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 2);
        assert_eq!(
            volumes[1]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "ferrari-data"
        );
        let mounts = spec.containers[0].volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[1].mount_path, "/datasets");
    }
}
