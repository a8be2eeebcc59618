//! Provisioning engine: permission reconciliation, constraint policy patching,
//! propagation waits, and the orchestrator that sequences them.

pub mod orchestrator;
pub mod patcher;
pub mod reconciler;
pub mod reporter;
pub mod roles;
pub mod scopes;
pub mod waiter;

pub use orchestrator::{Provisioner, ScopeCheck, Session, TeardownReport};
pub use patcher::{PatchOutcome, PolicyPatcher};
pub use reconciler::PermissionReconciler;
pub use roles::RoleTable;
pub use waiter::{PropagationWaiter, WaitReport};
