//! Flow definitions and durable run execution.
//!
//! A [`FlowDefinition`] is a typed graph of send, decision, delay and exit
//! nodes. The [`FlowEngine`] steps [`Run`]s through it, committing every
//! transition with an optimistic version check; [`FlowWorker`] resumes
//! waiting runs when they come due.

pub mod backoff;
pub mod engine;
pub mod graph;
pub mod predicate;
pub mod run;
pub mod store;
pub mod worker;

pub use engine::FlowEngine;
pub use graph::{Edge, ExitOutcome, FlowDefinition, FlowStatus, Node, NodeKind};
pub use predicate::Predicate;
pub use run::{Run, StepRecord};
pub use store::FlowStore;
pub use worker::FlowWorker;
