//! Shared label/annotation keys and defaults for garage-managed objects.

// Label keys stamped on every object we create
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "garage";
pub const LABEL_NODE_NAME: &str = "garage.dev/node-name";
pub const LABEL_VOLUME_NAME: &str = "garage.dev/volume-name";
pub const LABEL_SESSION_MODE: &str = "garage.dev/session-mode";
pub const LABEL_POD_MODE: &str = "garage.dev/mode";
pub const LABEL_WORKSPACE_ID: &str = "garage.dev/workspace-id";

// Annotation keys
pub const ANNOTATION_BOOT_IMAGE: &str = "garage.dev/boot-image";
pub const ANNOTATION_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";
pub const ANNOTATION_NODE_SELECTOR: &str = "scheduler.alpha.kubernetes.io/node-selector";

// Cluster-side labels we only read
pub const LABEL_NODE_GROUP: &str = "node-restriction.kubernetes.io/nodegroup";
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

pub const SESSION_MODE_EDIT: &str = "edit";
pub const SESSION_MODE_RUN: &str = "run";

pub const DEFAULT_BOOT_IMAGE: &str = "nvcr.io/nvidia/cuda:12.5.0-base-ubuntu22.04";
pub const DEFAULT_VOLUME_SIZE: &str = "10Gi";

/// Image used for binder and copy helper pods.
pub const HELPER_IMAGE: &str = "busybox:latest";

/// Where a session pod mounts its OS volume.
pub const BOOT_MOUNT_PATH: &str = "/workspace";

// Resource caps for helper pods and edit sessions
pub const HELPER_CPU_LIMIT: &str = "4";
pub const HELPER_MEMORY_LIMIT: &str = "16Gi";

pub const GPU_RESOURCE: &str = "nvidia.com/gpu";
