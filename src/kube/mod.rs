//! Kubernetes implementations of the provider seams: agent state in pod
//! annotations, token-review authentication, and pod lifecycle hooks.

pub mod agent;
pub mod auth;
pub mod patch;
pub mod provider;
pub mod state;

/// Pods opt in to management with this label set to `"true"`.
pub const LABEL_RUNNER: &str = "runner-manager.dev/runner";

/// Runner group the pod wants to join, set by the pod template.
pub const ANNOTATION_RUNNER_GROUP: &str = "runner-manager.dev/runner-group";

/// Comma-separated runner labels, set by the pod template.
pub const ANNOTATION_RUNNER_LABELS: &str = "runner-manager.dev/runner-labels";

/// Serialized agent record, owned by the controller.
pub const ANNOTATION_RUNNER_STATE: &str = "runner-manager.dev/runner-state";

/// Keeps the pod around until the agent record is deleted.
pub const FINALIZER: &str = "runner-manager.dev/finalizer";

/// Discourages scale-down of busy runners.
pub const ANNOTATION_DELETION_COST: &str = "controller.kubernetes.io/pod-deletion-cost";

/// Blocks autoscaler eviction of busy runners.
pub const ANNOTATION_SAFE_TO_EVICT: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

pub use agent::AgentProvider;
pub use provider::ControllerProvider;
