pub mod call_request;
pub mod error;
pub mod report;
pub mod resource;
pub mod snapshot;

pub use call_request::{
    Callable, CallRequest, CallRequestId, CancelHook, CancellationToken, GroupId,
    LifecycleCallback, LifecycleHook, OBFUSCATED_VALUE, WorkFuture,
};
pub use error::{DispatchError, DispatchErrorKind};
pub use report::{TaskReport, TaskSnapshot, TaskState};
pub use resource::{Decision, Operation, ResourceClaim, ResourceFootprint, ResourceType};
pub use snapshot::{ArchivedCallSnapshot, QueuedCallSnapshot};
