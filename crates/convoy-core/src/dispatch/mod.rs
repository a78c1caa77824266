pub mod conflict;
pub mod coordinator;
pub mod queue;
pub mod registry;
pub(crate) mod task;

pub use conflict::decide;
pub use coordinator::{ConflictReport, blocking_reasons, evaluate, find_conflicts, topological_sort};
pub use queue::{DispatchConfig, GroupSubmission, Submission, TaskQueue};
pub use registry::{CallableRegistry, FnCallable, callable};

use crate::models::DispatchError;

pub type DispatchResult<T> = Result<T, DispatchError>;
