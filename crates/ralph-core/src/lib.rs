//! Core library for the autonomous construct loop: plan storage, ticket
//! store client, agent executor, reconciler, scheduler, and the state
//! machine that ties them together.

pub mod analysis;
pub mod config;
pub mod construct;
pub mod executor;
pub mod git;
pub mod ids;
pub mod ledger;
pub mod model;
pub mod orch_state;
pub mod plan_file;
pub mod reconcile;
pub mod scheduler;
pub mod stages;
pub mod ticket_store;

pub use config::GlobalConfig;
pub use construct::ConstructStateMachine;
pub use model::{Issue, PlanConfig, Priority, Task, TaskStatus, Tombstone, TombstoneKind};
pub use orch_state::{OrchestrationState, Stage};
pub use plan_file::PlanFile;
pub use ticket_store::{TicketStore, TixClient, TixError};
