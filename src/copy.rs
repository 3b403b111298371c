//! Volume copying.
//!
//! Same-node copies run one helper pod mounting both volumes and `cp -a`-ing
//! between them. Cross-node copies provision one sleeping helper pod per node
//! and relay a tar stream from the source pod's stdout into the destination
//! pod's stdin over two exec channels, so the nodes never need to reach each
//! other directly and nothing is staged in the client.
//!
//! Every provisioned object is covered by the cleanup registry from the
//! moment it exists until its fate is decided, keeping teardown strictly
//! LIFO: helper pods are always deleted before the volume they mount.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{AttachParams, DeleteParams, ObjectMeta, PostParams};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

use crate::context::Ctx;
use crate::meta;
use crate::node;
use crate::session;
use crate::volume::{self, VolumeRef};
use crate::wait::{self, WaitParams};

/// Progress is reported once per this many transferred bytes.
const REPORT_EVERY: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct CopyParams {
    /// Wait for a streaming helper pod to reach Running.
    pub start_wait: WaitParams,
    /// Wait for a same-node copy pod to run to completion.
    pub complete_wait: WaitParams,
}

impl Default for CopyParams {
    fn default() -> Self {
        CopyParams {
            start_wait: WaitParams::new(Duration::from_secs(300), Duration::from_millis(500)),
            complete_wait: WaitParams::new(Duration::from_secs(1800), Duration::from_secs(2)),
        }
    }
}

/// Copies a whole volume to a brand-new destination volume, which inherits
/// the source's size and boot-image marker.
///
/// On ordinary failure the destination volume is deleted again; when an
/// interrupt already started tearing the process down, that teardown owns all
/// cleanup and this function returns quietly once it has finished.
pub async fn copy(ctx: &Ctx, src: &VolumeRef, dst: &VolumeRef, params: CopyParams) -> Result<()> {
    node::validate_access(ctx, &dst.node).await?;

    let src_info = volume::get(ctx, src).await?;

    if let Some(mode) = session::mode_of(ctx, src).await? {
        bail!("source volume {src} has an active {mode} session, delete it first");
    }
    if volume::exists(ctx, dst).await? {
        bail!("destination volume {dst} already exists");
    }

    println!("Creating destination volume {dst} ({})...", src_info.size);
    let dst_pvc = volume::provision_clone(ctx, dst, &src_info).await?;
    let src_pvc = src.pvc_name();

    let result = if src.node == dst.node {
        copy_same_node(ctx, &src.node, &src_pvc, &dst_pvc, params).await
    } else {
        copy_cross_node(ctx, &src.node, &dst.node, &src_pvc, &dst_pvc, params).await
    };

    if let Err(err) = result {
        if ctx.cleanup.was_interrupted() {
            ctx.cleanup.wait_for_cleanup().await;
            return Ok(());
        }
        ctx.cleanup.unregister();
        print!("Copy failed, cleaning up destination volume...");
        let _ = std::io::stdout().flush();
        match ctx.pvcs().delete(&dst_pvc, &DeleteParams::default()).await {
            Ok(_) => println!(" done"),
            Err(delete_err) => {
                println!(" failed");
                warn!(pvc = %dst_pvc, error = %delete_err, "failed to delete destination volume");
            }
        }
        return Err(err);
    }

    // The destination volume persists from here on.
    ctx.cleanup.unregister();
    println!("Successfully copied {src} to {dst}");
    Ok(())
}

/// Runs one helper pod mounting the source read-only and the destination
/// read-write, and waits for its recursive copy to finish.
async fn copy_same_node(
    ctx: &Ctx,
    node_name: &str,
    src_pvc: &str,
    dst_pvc: &str,
    params: CopyParams,
) -> Result<()> {
    println!("Copying volume contents (same node)...");
    let pod = new_local_copy_pod(node_name, src_pvc, dst_pvc, &ctx.namespace);
    let pod_name = pod.metadata.name.clone().unwrap_or_default();

    ctx.pods()
        .create(&PostParams::default(), &pod)
        .await
        .context("failed to create copy pod")?;
    volume::register_pod_cleanup(ctx, &pod_name, "copy pod");

    let result = wait::wait_for_succeeded(ctx, &pod_name, params.complete_wait).await;

    if ctx.cleanup.was_interrupted() {
        // The interrupt teardown owns the helper pod now.
        return result;
    }
    ctx.cleanup.unregister();
    let _ = ctx.pods().delete(&pod_name, &DeleteParams::default()).await;
    result
}

/// Provisions one sleeping helper pod per node and relays a tar stream
/// between them over two exec channels.
async fn copy_cross_node(
    ctx: &Ctx,
    src_node: &str,
    dst_node: &str,
    src_pvc: &str,
    dst_pvc: &str,
    params: CopyParams,
) -> Result<()> {
    println!("Copying volume contents (cross-node via tar stream)...");
    let pods = ctx.pods();

    let src_pod = new_stream_pod(
        &format!("copy-src-{src_pvc}"),
        src_node,
        src_pvc,
        &ctx.namespace,
        true,
    );
    let src_pod_name = src_pod.metadata.name.clone().unwrap_or_default();
    pods.create(&PostParams::default(), &src_pod)
        .await
        .context("failed to create source copy pod")?;
    volume::register_pod_cleanup(ctx, &src_pod_name, "source copy pod");

    let dst_pod = new_stream_pod(
        &format!("copy-dst-{dst_pvc}"),
        dst_node,
        dst_pvc,
        &ctx.namespace,
        false,
    );
    let dst_pod_name = dst_pod.metadata.name.clone().unwrap_or_default();
    if let Err(err) = pods.create(&PostParams::default(), &dst_pod).await {
        ctx.cleanup.unregister();
        let _ = pods.delete(&src_pod_name, &DeleteParams::default()).await;
        return Err(err).context("failed to create destination copy pod");
    }
    volume::register_pod_cleanup(ctx, &dst_pod_name, "destination copy pod");

    let result = stream_volume(ctx, &src_pod_name, &dst_pod_name, params).await;

    if ctx.cleanup.was_interrupted() {
        // The interrupt teardown owns both helper pods now.
        return result;
    }
    // Helper pods are ephemeral regardless of outcome; tear down in LIFO
    // order so registry entries match what is actually left.
    ctx.cleanup.unregister();
    let _ = pods.delete(&dst_pod_name, &DeleteParams::default()).await;
    ctx.cleanup.unregister();
    let _ = pods.delete(&src_pod_name, &DeleteParams::default()).await;
    result
}

/// Waits for both helper pods, then pipes `tar cf -` on the source side into
/// `tar xf -` on the destination side. The relay and the destination drain
/// run as independent tasks; the first error aborts the whole operation.
async fn stream_volume(
    ctx: &Ctx,
    src_pod_name: &str,
    dst_pod_name: &str,
    params: CopyParams,
) -> Result<()> {
    print!("  Waiting for copy pods to start...");
    let _ = std::io::stdout().flush();
    wait::wait_for_running(ctx, src_pod_name, params.start_wait)
        .await
        .context("source pod failed to start")?;
    wait::wait_for_running(ctx, dst_pod_name, params.start_wait)
        .await
        .context("destination pod failed to start")?;
    println!(" done");

    let pods = ctx.pods();
    let read_params = AttachParams::default().stdin(false).stdout(true).stderr(true);
    let write_params = AttachParams::default().stdin(true).stdout(false).stderr(true);

    let mut src = pods
        .exec(
            src_pod_name,
            vec!["tar", "cf", "-", "-C", "/data", "."],
            &read_params,
        )
        .await
        .context("failed to open source exec channel")?;
    let mut dst = pods
        .exec(dst_pod_name, vec!["tar", "xf", "-", "-C", "/data"], &write_params)
        .await
        .context("failed to open destination exec channel")?;

    let mut src_stdout = src
        .stdout()
        .ok_or_else(|| anyhow!("source exec channel has no stdout"))?;
    let mut src_stderr = src
        .stderr()
        .ok_or_else(|| anyhow!("source exec channel has no stderr"))?;
    let dst_stdin = dst
        .stdin()
        .ok_or_else(|| anyhow!("destination exec channel has no stdin"))?;
    let mut dst_stderr = dst
        .stderr()
        .ok_or_else(|| anyhow!("destination exec channel has no stderr"))?;
    let src_status = src
        .take_status()
        .ok_or_else(|| anyhow!("source exec status already taken"))?;
    let dst_status = dst
        .take_status()
        .ok_or_else(|| anyhow!("destination exec status already taken"))?;

    println!("  Streaming data between nodes...");
    let transferred = Arc::new(AtomicU64::new(0));
    let (tx, mut rx) = mpsc::channel::<Result<()>>(2);

    // Source side: drive the tar output into the destination's stdin, then
    // close it so the extracting tar sees EOF.
    {
        let tx = tx.clone();
        let transferred = transferred.clone();
        tokio::spawn(async move {
            let result = async {
                let mut writer = ProgressWriter::new(dst_stdin, transferred);
                let mut stderr_buf = Vec::new();
                let (copied, _) = tokio::join!(
                    tokio::io::copy(&mut src_stdout, &mut writer),
                    src_stderr.read_to_end(&mut stderr_buf),
                );
                let copy_result = copied.map(|_| ());
                let _ = writer.shutdown().await;
                let status = src_status.await;
                exec_outcome("source", status, &stderr_buf)?;
                copy_result.context("tar stream relay failed")
            }
            .await;
            let _ = tx.send(result).await;
        });
    }

    // Destination side: wait for the extracting tar to finish.
    tokio::spawn(async move {
        let result = async {
            let mut stderr_buf = Vec::new();
            let _ = dst_stderr.read_to_end(&mut stderr_buf).await;
            let status = dst_status.await;
            exec_outcome("destination", status, &stderr_buf)
        }
        .await;
        let _ = tx.send(result).await;
    });

    for _ in 0..2 {
        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(anyhow!("copy interrupted")),
            outcome = rx.recv() => {
                outcome
                    .ok_or_else(|| anyhow!("copy stream task exited unexpectedly"))?
                    .context("copy stream failed")?;
            }
        }
    }

    println!(
        "\r  Transferred: {}",
        format_bytes(transferred.load(Ordering::Relaxed))
    );
    Ok(())
}

/// Maps an exec channel's terminal status (plus captured stderr) to a result.
fn exec_outcome(side: &str, status: Option<Status>, stderr: &[u8]) -> Result<()> {
    let stderr_text = String::from_utf8_lossy(stderr);
    let stderr_text = stderr_text.trim();
    match status {
        Some(status) if status.status.as_deref() == Some("Success") => Ok(()),
        Some(status) => {
            let message = status
                .message
                .unwrap_or_else(|| "command failed".to_string());
            if stderr_text.is_empty() {
                bail!("{side} stream failed: {message}");
            }
            bail!("{side} stream failed: {message}: {stderr_text}");
        }
        None => {
            if stderr_text.is_empty() {
                bail!("{side} exec channel closed without reporting status");
            }
            bail!("{side} exec channel closed without reporting status: {stderr_text}");
        }
    }
}

/// Counting writer wrapped around the destination's stdin. Reports cumulative
/// progress once per [`REPORT_EVERY`] bytes to avoid flooding the terminal.
struct ProgressWriter<W> {
    inner: W,
    transferred: Arc<AtomicU64>,
    last_report: u64,
}

impl<W> ProgressWriter<W> {
    fn new(inner: W, transferred: Arc<AtomicU64>) -> Self {
        ProgressWriter {
            inner,
            transferred,
            last_report: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let me = &mut *self;
        match Pin::new(&mut me.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                let total = me.transferred.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
                if total - me.last_report >= REPORT_EVERY {
                    me.last_report = total;
                    print!("\r  Transferred: {}", format_bytes(total));
                    let _ = std::io::stdout().flush();
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Helper pod for same-node copies: source mounted read-only at /src,
/// destination read-write at /dst, one attribute-preserving recursive copy.
fn new_local_copy_pod(node_name: &str, src_pvc: &str, dst_pvc: &str, namespace: &str) -> Pod {
    helper_pod(
        &format!("copy-{dst_pvc}"),
        node_name,
        namespace,
        vec![
            volume::mount("src", "/src", true),
            volume::mount("dst", "/dst", false),
        ],
        vec![
            volume::pvc_volume("src", src_pvc, true),
            volume::pvc_volume("dst", dst_pvc, false),
        ],
        vec!["cp -a /src/. /dst/".to_string()],
    )
}

/// Helper pod for cross-node copies: mounts one volume at /data and sleeps
/// until killed so we can exec the tar commands into it.
fn new_stream_pod(
    pod_name: &str,
    node_name: &str,
    pvc_name: &str,
    namespace: &str,
    read_only: bool,
) -> Pod {
    helper_pod(
        pod_name,
        node_name,
        namespace,
        vec![volume::mount("data", "/data", read_only)],
        vec![volume::pvc_volume("data", pvc_name, read_only)],
        vec!["sleep 3600".to_string()],
    )
}

fn helper_pod(
    pod_name: &str,
    node_name: &str,
    namespace: &str,
    mounts: Vec<k8s_openapi::api::core::v1::VolumeMount>,
    volumes: Vec<k8s_openapi::api::core::v1::Volume>,
    args: Vec<String>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (
                    meta::LABEL_MANAGED_BY.to_string(),
                    meta::MANAGED_BY.to_string(),
                ),
                (meta::LABEL_POD_MODE.to_string(), "copy".to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_selector: Some(BTreeMap::from([(
                meta::LABEL_HOSTNAME.to_string(),
                node_name.to_string(),
            )])),
            containers: vec![Container {
                name: "copy".to_string(),
                image: Some(meta::HELPER_IMAGE.to_string()),
                resources: Some(volume::capped_resources()),
                volume_mounts: Some(mounts),
                command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                args: Some(args),
                ..Default::default()
            }],
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http::{Method, Request, Response};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, Namespace, Node, PodStatus,
    };
    use kube::client::Body;
    use kube::Client;
    use tokio_util::sync::CancellationToken;
    use tower_test::mock::{self, Handle};

    use super::*;
    use crate::cleanup::CleanupRegistry;

    #[test]
    fn local_copy_pod_mounts_source_read_only() {
        let pod = new_local_copy_pod("ferrari", "ferrari-data-a", "ferrari-data-b", "ws-test");
        assert_eq!(pod.metadata.name.as_deref(), Some("copy-ferrari-data-b"));

        let spec = pod.spec.unwrap();
        assert_eq!(
            spec.node_selector.unwrap().get(meta::LABEL_HOSTNAME).unwrap(),
            "ferrari"
        );
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));

        let mounts = spec.containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts[0].mount_path, "/src");
        assert_eq!(mounts[0].read_only, Some(true));
        assert_eq!(mounts[1].mount_path, "/dst");
        assert_eq!(mounts[1].read_only, None);

        let volumes = spec.volumes.unwrap();
        let src_claim = volumes[0].persistent_volume_claim.as_ref().unwrap();
        assert_eq!(src_claim.claim_name, "ferrari-data-a");
        assert_eq!(src_claim.read_only, Some(true));

        let args = spec.containers[0].args.clone().unwrap();
        assert_eq!(args, vec!["cp -a /src/. /dst/"]);
    }

    #[test]
    fn stream_pods_sleep_until_killed() {
        let src = new_stream_pod("copy-src-ferrari-os", "ferrari", "ferrari-os", "ws", true);
        let dst = new_stream_pod("copy-dst-porsche-os", "porsche", "porsche-os", "ws", false);

        let src_spec = src.spec.unwrap();
        assert_eq!(
            src_spec.containers[0].args.clone().unwrap(),
            vec!["sleep 3600"]
        );
        assert_eq!(
            src_spec.volumes.unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .read_only,
            Some(true)
        );

        let dst_spec = dst.spec.unwrap();
        assert_eq!(
            dst_spec.node_selector.unwrap().get(meta::LABEL_HOSTNAME).unwrap(),
            "porsche"
        );
        assert_eq!(
            dst_spec.volumes.unwrap()[0]
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .read_only,
            None
        );
    }

    #[test]
    fn bytes_format_coarsely() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn exec_success_status_is_ok() {
        let status = Status {
            status: Some("Success".to_string()),
            ..Default::default()
        };
        assert!(exec_outcome("source", Some(status), b"").is_ok());
    }

    #[test]
    fn exec_failure_folds_in_stderr() {
        let status = Status {
            status: Some("Failure".to_string()),
            message: Some("command terminated with exit code 2".to_string()),
            ..Default::default()
        };
        let err = exec_outcome("destination", Some(status), b"tar: write error\n").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("destination stream failed"));
        assert!(text.contains("exit code 2"));
        assert!(text.contains("tar: write error"));
    }

    #[test]
    fn missing_exec_status_is_an_error() {
        let err = exec_outcome("source", None, b"").unwrap_err();
        assert!(err.to_string().contains("without reporting status"));
    }

    #[tokio::test]
    async fn progress_writer_counts_every_byte() {
        let (client, mut server) = tokio::io::duplex(64);
        let transferred = Arc::new(AtomicU64::new(0));
        let mut writer = ProgressWriter::new(client, transferred.clone());

        let payload = vec![7u8; 1000];
        let write = async {
            writer.write_all(&payload).await.unwrap();
            writer.shutdown().await.unwrap();
        };
        let read = async {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            received
        };
        let (_, received) = tokio::join!(write, read);

        assert_eq!(received.len(), 1000);
        assert_eq!(transferred.load(Ordering::Relaxed), 1000);
    }

    #[tokio::test]
    async fn relay_through_a_bounded_pipe_does_not_deadlock() {
        // The pipe buffer (64 bytes) is far smaller than the payload, so this
        // only completes if reader and writer genuinely run concurrently.
        let (client, server) = tokio::io::duplex(64);
        let transferred = Arc::new(AtomicU64::new(0));
        let mut writer = ProgressWriter::new(client, transferred.clone());

        let payload = vec![42u8; 64 * 1024];
        let source = payload.clone();
        let pump = tokio::spawn(async move {
            let mut reader = std::io::Cursor::new(source);
            tokio::io::copy(&mut reader, &mut writer).await.unwrap();
            writer.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        let mut server = server;
        server.read_to_end(&mut received).await.unwrap();
        pump.await.unwrap();

        assert_eq!(received, payload);
        assert_eq!(transferred.load(Ordering::Relaxed), payload.len() as u64);
    }

    fn json_response(body: Vec<u8>) -> Response<Body> {
        Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    fn not_found() -> Response<Body> {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "not found",
            "reason": "NotFound",
            "code": 404,
        });
        Response::builder()
            .status(404)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&status).unwrap()))
            .unwrap()
    }

    fn delete_ok() -> Response<Body> {
        let status = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Success",
        });
        json_response(serde_json::to_vec(&status).unwrap())
    }

    fn failed_copy_pod() -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("copy-ferrari-data-b".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Failed".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            reason: Some("Error".to_string()),
                            exit_code: 1,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn respond(method: &Method, path: &str, deletes: &Arc<Mutex<Vec<String>>>) -> Response<Body> {
        if method == Method::DELETE {
            deletes.lock().unwrap().push(path.to_string());
            return delete_ok();
        }
        match path {
            "/api/v1/namespaces/ws-test" => {
                let ns = Namespace {
                    metadata: ObjectMeta {
                        name: Some("ws-test".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                json_response(serde_json::to_vec(&ns).unwrap())
            }
            "/api/v1/nodes/ferrari" => {
                let node = Node {
                    metadata: ObjectMeta {
                        name: Some("ferrari".to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                json_response(serde_json::to_vec(&node).unwrap())
            }
            p if p.ends_with("/persistentvolumeclaims/ferrari-data-a") => {
                let src = VolumeRef::parse("ferrari/data-a").unwrap();
                let pvc = volume::new_pvc(&src, "10Gi", None, "ws-test");
                json_response(serde_json::to_vec(&pvc).unwrap())
            }
            p if p.ends_with("/pods/copy-ferrari-data-b") => {
                json_response(serde_json::to_vec(&failed_copy_pod()).unwrap())
            }
            p if p.ends_with("/pods/bind-ferrari-data-a") => not_found(),
            p if p.ends_with("/pods/ferrari-data-a") => not_found(),
            p if p.ends_with("/persistentvolumeclaims/ferrari-data-b") => not_found(),
            p if p.ends_with("/persistentvolumeclaims") && method == Method::POST => {
                let dst = VolumeRef::parse("ferrari/data-b").unwrap();
                let pvc = volume::new_pvc(&dst, "10Gi", None, "ws-test");
                json_response(serde_json::to_vec(&pvc).unwrap())
            }
            p if p.ends_with("/pods") && method == Method::POST => {
                json_response(serde_json::to_vec(&failed_copy_pod()).unwrap())
            }
            _ => not_found(),
        }
    }

    async fn serve_cluster(
        mut handle: Handle<Request<Body>, Response<Body>>,
        deletes: Arc<Mutex<Vec<String>>>,
    ) {
        while let Some((request, send)) = handle.next_request().await {
            let method = request.method().clone();
            let path = request.uri().path().to_string();
            send.send_response(respond(&method, &path, &deletes));
        }
    }

    #[tokio::test]
    async fn failed_copy_deletes_the_destination_volume() {
        let (mock_service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        let deletes: Arc<Mutex<Vec<String>>> = Arc::default();
        let server = tokio::spawn(serve_cluster(handle, deletes.clone()));

        let ctx = Ctx {
            client: Client::new(mock_service, "ws-test"),
            namespace: "ws-test".to_string(),
            cleanup: Arc::new(CleanupRegistry::new()),
            cancel: CancellationToken::new(),
        };
        let src = VolumeRef::parse("ferrari/data-a").unwrap();
        let dst = VolumeRef::parse("ferrari/data-b").unwrap();
        let params = CopyParams {
            start_wait: WaitParams::new(Duration::from_secs(1), Duration::from_millis(10)),
            complete_wait: WaitParams::new(Duration::from_secs(1), Duration::from_millis(10)),
        };

        let err = copy(&ctx, &src, &dst, params).await.unwrap_err();
        assert!(err.to_string().contains("failed"), "got: {err:#}");

        // The helper pod and the half-copied destination volume are both
        // gone, pod first (LIFO order).
        let issued = deletes.lock().unwrap().clone();
        let pod_delete = issued
            .iter()
            .position(|p| p.ends_with("/pods/copy-ferrari-data-b"))
            .expect("helper pod delete was not issued");
        let pvc_delete = issued
            .iter()
            .position(|p| p.ends_with("/persistentvolumeclaims/ferrari-data-b"))
            .expect("destination volume delete was not issued");
        assert!(pod_delete < pvc_delete);

        // The registry is empty: a teardown sweep issues no further deletes.
        ctx.cleanup.run_all().await;
        assert_eq!(deletes.lock().unwrap().len(), issued.len());
        server.abort();
    }
}
