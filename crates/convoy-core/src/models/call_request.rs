use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::error::DispatchError;
use crate::models::report::TaskReport;
use crate::models::resource::ResourceFootprint;
use crate::models::snapshot::QueuedCallSnapshot;

pub const OBFUSCATED_VALUE: &str = "**OBFUSCATED**";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallRequestId(Uuid);

impl CallRequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        raw.parse::<Uuid>().map(Self).map_err(|_| {
            DispatchError::invalid_input(format!("malformed call request id '{raw}'"))
        })
    }
}

impl Display for CallRequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for GroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Points in a call's life at which registered callbacks fire.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleHook {
    Enqueue,
    Dequeue,
    Run,
    Success,
    Failure,
    Cancel,
    Complete,
}

impl LifecycleHook {
    pub const ALL: [LifecycleHook; 7] = [
        LifecycleHook::Enqueue,
        LifecycleHook::Dequeue,
        LifecycleHook::Run,
        LifecycleHook::Success,
        LifecycleHook::Failure,
        LifecycleHook::Cancel,
        LifecycleHook::Complete,
    ];
}

pub type LifecycleCallback = Arc<dyn Fn(&CallRequest, &TaskReport) + Send + Sync>;

/// Control hook used to request cooperative cancellation of the underlying
/// work. An error return means the work was NOT cancelled.
pub type CancelHook = Arc<dyn Fn(&CallRequest, &TaskReport) -> Result<(), DispatchError> + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub type WorkFuture = Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;

/// The work function behind a call request. The dispatch core never looks
/// inside; it only starts the work and tracks its lifecycle.
pub trait Callable: Send + Sync {
    fn name(&self) -> &str;

    fn begin(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        token: CancellationToken,
    ) -> WorkFuture;
}

/// An immutable description of one unit of asynchronous work and the
/// resources it touches.
///
/// Constructed builder-style by an external collaborator. Callback and
/// dependency registration must complete before the request is enqueued.
pub struct CallRequest {
    id: CallRequestId,
    group_id: Option<GroupId>,
    callable: Arc<dyn Callable>,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    resources: ResourceFootprint,
    tags: Vec<String>,
    weight: u32,
    asynchronous: bool,
    archive: bool,
    obfuscate_args: bool,
    timeout: Option<Duration>,
    dependencies: BTreeSet<CallRequestId>,
    lifecycle_callbacks: HashMap<LifecycleHook, Vec<LifecycleCallback>>,
    cancel_hook: Option<CancelHook>,
}

impl CallRequest {
    pub fn new(callable: Arc<dyn Callable>) -> Self {
        Self {
            id: CallRequestId::generate(),
            group_id: None,
            callable,
            args: Vec::new(),
            kwargs: Map::new(),
            resources: ResourceFootprint::new(),
            tags: Vec::new(),
            weight: 1,
            asynchronous: false,
            archive: false,
            obfuscate_args: false,
            timeout: None,
            dependencies: BTreeSet::new(),
            lifecycle_callbacks: HashMap::new(),
            cancel_hook: None,
        }
    }

    /// Rebuild a request from a persisted queued-call snapshot.
    ///
    /// Lifecycle callbacks and the cancel hook are not persisted; the
    /// composition root re-registers behavior after rehydration.
    pub fn restore(
        snapshot: QueuedCallSnapshot,
        callable: Arc<dyn Callable>,
    ) -> Result<Self, DispatchError> {
        if callable.name() != snapshot.callable_name {
            return Err(DispatchError::invalid_input(format!(
                "callable '{}' does not match persisted callable '{}'",
                callable.name(),
                snapshot.callable_name
            )));
        }
        Ok(Self {
            id: snapshot.id,
            group_id: snapshot.group_id,
            callable,
            args: snapshot.args,
            kwargs: snapshot.kwargs,
            resources: snapshot.resources,
            tags: snapshot.tags,
            weight: snapshot.weight,
            asynchronous: snapshot.asynchronous,
            archive: snapshot.archive,
            obfuscate_args: snapshot.obfuscate_args,
            timeout: snapshot.timeout,
            dependencies: snapshot.depends_on,
            lifecycle_callbacks: HashMap::new(),
            cancel_hook: None,
        })
    }

    // builder-style construction -------------------------------------------

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_resources(mut self, resources: ResourceFootprint) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_obfuscated_args(mut self, obfuscate_args: bool) -> Self {
        self.obfuscate_args = obfuscate_args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    // dependency and hook registration -------------------------------------

    pub fn depends_on(&mut self, other: CallRequestId) {
        self.dependencies.insert(other);
    }

    /// Append a callback for the given hook. Registration order is preserved
    /// and every registered callback is invoked.
    pub fn add_life_cycle_callback(&mut self, hook: LifecycleHook, callback: LifecycleCallback) {
        self.lifecycle_callbacks
            .entry(hook)
            .or_default()
            .push(callback);
    }

    pub fn set_cancel_hook(&mut self, hook: CancelHook) {
        self.cancel_hook = Some(hook);
    }

    // accessors ------------------------------------------------------------

    pub fn id(&self) -> CallRequestId {
        self.id
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.group_id
    }

    pub(crate) fn set_group(&mut self, group_id: GroupId) {
        self.group_id = Some(group_id);
    }

    pub fn callable_name(&self) -> &str {
        self.callable.name()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn resources(&self) -> &ResourceFootprint {
        &self.resources
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    pub fn archive(&self) -> bool {
        self.archive
    }

    pub fn obfuscate_args(&self) -> bool {
        self.obfuscate_args
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn dependencies(&self) -> &BTreeSet<CallRequestId> {
        &self.dependencies
    }

    pub fn callbacks_for(&self, hook: LifecycleHook) -> &[LifecycleCallback] {
        self.lifecycle_callbacks
            .get(&hook)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn cancel_hook(&self) -> Option<&CancelHook> {
        self.cancel_hook.as_ref()
    }

    pub fn has_cancel_hook(&self) -> bool {
        self.cancel_hook.is_some()
    }

    pub(crate) fn begin_work(&self, token: CancellationToken) -> WorkFuture {
        self.callable
            .begin(self.args.clone(), self.kwargs.clone(), token)
    }

    pub fn arg_reprs(&self) -> Vec<String> {
        if self.obfuscate_args {
            return self.args.iter().map(|_| OBFUSCATED_VALUE.to_string()).collect();
        }
        self.args.iter().map(Value::to_string).collect()
    }

    pub fn kwarg_reprs(&self) -> Vec<(String, String)> {
        self.kwargs
            .iter()
            .map(|(key, value)| {
                let repr = if self.obfuscate_args {
                    OBFUSCATED_VALUE.to_string()
                } else {
                    value.to_string()
                };
                (key.clone(), repr)
            })
            .collect()
    }
}

impl Display for CallRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut rendered: Vec<String> = self.arg_reprs();
        rendered.extend(
            self.kwarg_reprs()
                .into_iter()
                .map(|(key, value)| format!("{key}={value}")),
        );
        write!(
            f,
            "CallRequest: {}({})",
            self.callable_name(),
            rendered.join(", ")
        )
    }
}

impl fmt::Debug for CallRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallRequest")
            .field("id", &self.id)
            .field("callable", &self.callable_name())
            .field("weight", &self.weight)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopCallable;

    impl Callable for NoopCallable {
        fn name(&self) -> &str {
            "noop"
        }

        fn begin(
            &self,
            _args: Vec<Value>,
            _kwargs: Map<String, Value>,
            _token: CancellationToken,
        ) -> WorkFuture {
            Box::pin(async { Ok(Value::Null) })
        }
    }

    #[test]
    fn display_renders_args_and_kwargs() {
        let mut kwargs = Map::new();
        kwargs.insert("force".to_string(), json!(true));
        let request = CallRequest::new(Arc::new(NoopCallable))
            .with_args(vec![json!("repo-1")])
            .with_kwargs(kwargs);

        assert_eq!(request.to_string(), r#"CallRequest: noop("repo-1", force=true)"#);
    }

    #[test]
    fn display_obfuscates_when_requested() {
        let mut kwargs = Map::new();
        kwargs.insert("password".to_string(), json!("hunter2"));
        let request = CallRequest::new(Arc::new(NoopCallable))
            .with_args(vec![json!("secret")])
            .with_kwargs(kwargs)
            .with_obfuscated_args(true);

        let rendered = request.to_string();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains(OBFUSCATED_VALUE));
    }

    #[test]
    fn callbacks_preserve_registration_order() {
        let mut request = CallRequest::new(Arc::new(NoopCallable));
        request.add_life_cycle_callback(LifecycleHook::Complete, Arc::new(|_, _| {}));
        request.add_life_cycle_callback(LifecycleHook::Complete, Arc::new(|_, _| {}));

        assert_eq!(request.callbacks_for(LifecycleHook::Complete).len(), 2);
        assert!(request.callbacks_for(LifecycleHook::Success).is_empty());
    }
}
