//! Controllers for the Kubexpose operator
//!
//! The controller watches Kubexpose resources and the Services and
//! Deployments they own, and reconciles each Kubexpose toward a running
//! tunnel with its URL on status.

mod kubexpose;

pub use kubexpose::{error_policy, reconcile, Context, KubexposeController};
