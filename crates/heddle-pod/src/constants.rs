//! Well-known names and paths shared by the controller and the executor
//!
//! The executor binary reads these same names at runtime, so they are part of
//! the wire contract of every synthesized pod.

// =============================================================================
// Container names
// =============================================================================

/// Name of the user's main container (single-container templates)
pub const MAIN_CONTAINER_NAME: &str = "main";

/// Name of the executor sidecar that watches main and collects outputs
pub const WAIT_CONTAINER_NAME: &str = "wait";

/// Name of the executor init container that stages inputs
pub const INIT_CONTAINER_NAME: &str = "init";

// =============================================================================
// Environment variables set on every container
// =============================================================================

/// Serialized template definition
pub const ENV_TEMPLATE: &str = "HEDDLE_TEMPLATE";
/// Whether the wait container should capture script output
pub const ENV_INCLUDE_SCRIPT_OUTPUT: &str = "HEDDLE_INCLUDE_SCRIPT_OUTPUT";
/// Execution deadline (RFC3339)
pub const ENV_DEADLINE: &str = "HEDDLE_DEADLINE";
/// Path of the file the user writes progress into
pub const ENV_PROGRESS_FILE: &str = "HEDDLE_PROGRESS_FILE";
/// How often the executor patches progress into the pod
pub const ENV_PROGRESS_PATCH_TICK_DURATION: &str = "HEDDLE_PROGRESS_PATCH_TICK_DURATION";
/// How often the executor reads the progress file
pub const ENV_PROGRESS_FILE_TICK_DURATION: &str = "HEDDLE_PROGRESS_FILE_TICK_DURATION";
/// Name of the container the variable is set on
pub const ENV_CONTAINER_NAME: &str = "HEDDLE_CONTAINER_NAME";

// =============================================================================
// Environment variables set on executor containers
// =============================================================================

/// Pod name, via downward API
pub const ENV_POD_NAME: &str = "HEDDLE_POD_NAME";
/// Selected container runtime executor
pub const ENV_CONTAINER_RUNTIME_EXECUTOR: &str = "HEDDLE_CONTAINER_RUNTIME_EXECUTOR";
/// Owning workflow's name
pub const ENV_WORKFLOW_NAME: &str = "HEDDLE_WORKFLOW_NAME";
/// Node IP, via downward API (kubelet executor)
pub const ENV_NODE_IP: &str = "HEDDLE_NODE_IP";
/// Kubelet port (kubelet executor)
pub const ENV_KUBELET_PORT: &str = "HEDDLE_KUBELET_PORT";
/// Skip kubelet TLS verification (kubelet executor)
pub const ENV_KUBELET_INSECURE: &str = "HEDDLE_KUBELET_INSECURE";

/// Presence on a main container pauses it before the user command runs
pub const ENV_DEBUG_PAUSE_BEFORE: &str = "HEDDLE_DEBUG_PAUSE_BEFORE";
/// Presence on a main container pauses it after the user command exits
pub const ENV_DEBUG_PAUSE_AFTER: &str = "HEDDLE_DEBUG_PAUSE_AFTER";

// =============================================================================
// Volumes and paths
// =============================================================================

/// Executor scratch volume shared by every container
pub const VAR_RUN_VOLUME_NAME: &str = "var-run-heddle";
/// Mount path of the executor scratch volume
pub const VAR_RUN_PATH: &str = "/var/run/heddle";
/// Executor binary copied into the scratch volume by init (emissary)
pub const EMISSARY_BINARY_PATH: &str = "/var/run/heddle/heddle-exec";

/// Shared emptyDir the init container stages input artifacts into
pub const INPUT_ARTIFACTS_VOLUME_NAME: &str = "input-artifacts";
/// Where the init container mounts the input artifacts volume
pub const ARTIFACT_BASE_DIR: &str = "/heddle/inputs/artifacts";
/// Prefix under which executor containers see main's filesystem
pub const MAIN_FILESYSTEM_DIR: &str = "/mainctrfs";

/// Shared emptyDir holding script sources
pub const STAGING_VOLUME_NAME: &str = "heddle-staging";
/// Mount path of the script staging volume
pub const STAGING_DIR: &str = "/heddle/staging";

/// Mount root for artifact credential secrets
pub const SECRET_VOL_MOUNT_PATH: &str = "/heddle/secret";

/// Default progress file location
pub const PROGRESS_FILE_PATH: &str = "/var/run/heddle/progress";

/// Default kubeconfig volume name
pub const KUBECONFIG_DEFAULT_VOLUME_NAME: &str = "kubeconfig";
/// Default kubeconfig mount path
pub const KUBECONFIG_DEFAULT_MOUNT_PATH: &str = "/kube/config";

/// Volume holding the executor service account's token
pub const SA_TOKEN_VOLUME_NAME: &str = "exec-sa-token";
/// Where the executor service account token is mounted
pub const SA_TOKEN_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// hostPath volume exposing the container engine socket
pub const DOCKER_SOCK_VOLUME_NAME: &str = "docker-sock";
/// POSIX container engine socket
pub const DOCKER_SOCK_PATH: &str = "/var/run/docker.sock";
/// Windows container engine named pipe
pub const DOCKER_SOCK_PATH_WINDOWS: &str = r"\\.\pipe\docker_engine";

/// Node selector key identifying a node's operating system
pub const NODE_OS_LABEL: &str = "kubernetes.io/os";
/// Node label used for retry anti-affinity
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

// =============================================================================
// Local template variables
// =============================================================================

/// Resolved pod name, available to `{{pod.name}}`
pub const LOCAL_VAR_POD_NAME: &str = "pod.name";

/// Executor binary name inside the executor image
pub const EXECUTOR_BINARY: &str = "heddle-exec";

/// Maximum length of a Kubernetes object name
pub const MAX_K8S_NAME_LENGTH: usize = 253;
