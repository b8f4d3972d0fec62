pub mod config;
pub mod events;
pub mod paths;
pub mod types;

pub use config::Config;
pub use events::BrokerEvent;
pub use types::{
    Artifact, ErrorCode, Id, MachineSummary, Pattern, Project, Run, RunError, RunStatus, Step,
    StepNotes, StepRole, TaskType, Variable,
};
