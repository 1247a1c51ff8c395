//! Delegation lifecycle: the state machine, credit escrow arithmetic and the
//! deferred confirmation timer.

pub mod engine;
pub mod scheduler;

pub use engine::{LifecycleEngine, LifecycleError, QUESTIONNAIRE_TYPE};
pub use scheduler::ConfirmationScheduler;
