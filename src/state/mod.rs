//! The state system.
//!
//! A state system records, for every attribute of an attribute tree, the
//! value the attribute had over time. It is built incrementally by a single
//! writer, the `StateSystemBuilder`, while any number of readers query it
//! through a shared `StateSystem` handle.

use thiserror::Error;

pub mod attribute;
pub mod stack;
pub mod store;
pub mod system;
pub mod value;

pub use attribute::{AttributeTree, Quark};
pub use store::StateInterval;
pub use system::{
    BuildingQueryPolicy, Phase, StateSystem, StateSystemBuilder, StateSystemConfig,
};
pub use value::{CustomStateValue, CustomValueRegistry, StateValue};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateSystemError {
    #[error("attribute {quark} modified at {time}, before its last modification at {last}")]
    OutOfOrder { quark: Quark, time: u64, last: u64 },
    #[error("state system is closed")]
    Closed,
    #[error("state system is not started")]
    NotStarted,
    #[error("state system build failed: {0}")]
    Failed(String),
    #[error("state at {0} is not available yet")]
    NotYetAvailable(u64),
    #[error("attribute {0} does not exist")]
    InvalidAttribute(Quark),
    #[error("attribute paths must have at least one segment")]
    EmptyPath,
    #[error("attribute {0} does not hold a stack")]
    NotAStack(Quark),
    #[error("custom value type {0} is not registered")]
    UnregisteredCustomValue(u8),
    #[error("unknown values cannot be stored")]
    UnknownValue,
}

impl StateSystemError {
    /// Returns true if the error leaves the state system unusable, in which
    /// case the build must be aborted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StateSystemError::OutOfOrder { .. }
                | StateSystemError::Closed
                | StateSystemError::NotStarted
                | StateSystemError::Failed(_)
        )
    }
}
