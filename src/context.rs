use std::sync::Arc;

use anyhow::Result;
use k8s_openapi::api::core::v1::{Namespace, Node, PersistentVolumeClaim, Pod};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use crate::cleanup::CleanupRegistry;

/// Operation context threaded through every function that talks to the
/// cluster. Owns the cleanup registry so tests can construct their own
/// instance instead of sharing process-global state.
pub struct Ctx {
    pub client: Client,
    pub namespace: String,
    pub cleanup: Arc<CleanupRegistry>,
    pub cancel: CancellationToken,
}

impl Ctx {
    /// Connects using the ambient kubeconfig (in-cluster config, KUBECONFIG,
    /// then ~/.kube/config). The workspace is the namespace unless overridden.
    pub async fn connect(namespace: Option<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        let namespace = namespace.unwrap_or_else(|| client.default_namespace().to_string());
        Ok(Ctx {
            client,
            namespace,
            cleanup: Arc::new(CleanupRegistry::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    pub fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }
}
