//! Custom Resource Definitions for the Kubexpose operator
//!
//! - Kubexpose: a request to expose a Deployment on a public tunnel URL

mod kubexpose;

pub use kubexpose::{Kubexpose, KubexposeSpec, KubexposeStatus};
