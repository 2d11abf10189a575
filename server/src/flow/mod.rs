//! Flow subsystem: graph model, runtime context, executors, and the
//! resumable engine orchestrating them.

pub mod context;
pub mod engine;
pub mod executors;
pub mod graph;

pub use context::{AuthenticatedUser, FlowContext, FlowStatus, FlowType};
pub use engine::{FlowEngine, FlowStepRequest, FlowStepResponse, StepType};
pub use graph::{FlowGraph, GraphDefinition};
