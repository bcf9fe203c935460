//! Reconciliation engine
//!
//! Compares the current and desired snapshots of a cluster and plans the
//! remediation tasks that bring one to the other. The engine is pure
//! planning: it never touches infrastructure, and everything it needs from
//! the outside world (reachability, identities, metrics) is injected.
//!
//! The entry point is [`Reconciler::decide`], followed by [`apply`] to
//! write the decision into the cluster state. Workers interact with the
//! resulting queue through the [`dispatch`] functions.

pub mod backoff;
pub mod decision;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod pipeline;
pub mod projection;
pub mod rolling;
pub mod unreachable;

#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;

pub use backoff::FibonacciBackoff;
pub use decision::{Decision, Plan, Reconciler, apply};
pub use error::{DispatchError, EngineError, OracleError};
pub use health::{HealthOracle, HealthReport, VpnDrift};
pub use identity::{DefaultIdentity, IdentityGenerator};
pub use metrics::{DecisionOutcome, MetricsSink, NoopMetrics};
