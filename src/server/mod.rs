//! Log interpretation: classify output lines, fold them into server state,
//! and drive the attachment that produces them.

mod classifier;
mod controller;
mod metrics;
mod state;

pub use classifier::{Event, RuleSpec, Ruleset};
#[cfg(test)]
pub use classifier::EventKind;
pub use controller::{ControllerConfig, SessionController, StateUpdate, Subscription};
pub use metrics::{ProcMetrics, ProcessMetrics, ResourceSample};
pub use state::{Phase, ServerStateView};
