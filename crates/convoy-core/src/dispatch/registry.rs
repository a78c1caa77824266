use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::models::call_request::{Callable, CancellationToken, WorkFuture};
use crate::models::error::{DispatchError, DispatchErrorKind};

/// Name-keyed registry of callables, used to turn persisted queued-call
/// snapshots back into runnable work after a restart.
#[derive(Default)]
pub struct CallableRegistry {
    callables: HashMap<String, Arc<dyn Callable>>,
}

impl CallableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, callable: Arc<dyn Callable>) -> Result<(), DispatchError> {
        let name = callable.name().to_string();
        if self.callables.contains_key(&name) {
            return Err(DispatchError::new(
                DispatchErrorKind::DuplicateCallable,
                format!("callable '{name}' is already registered"),
            ));
        }
        self.callables.insert(name, callable);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Callable>> {
        self.callables.get(name).cloned()
    }

    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.callables.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Adapts an async closure into a [`Callable`].
pub struct FnCallable<F> {
    name: String,
    work: F,
}

impl<F, Fut> FnCallable<F>
where
    F: Fn(Vec<Value>, Map<String, Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, work: F) -> Self {
        Self {
            name: name.into(),
            work,
        }
    }
}

impl<F, Fut> Callable for FnCallable<F>
where
    F: Fn(Vec<Value>, Map<String, Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        token: CancellationToken,
    ) -> WorkFuture {
        Box::pin((self.work)(args, kwargs, token))
    }
}

/// Convenience constructor for closure-backed callables.
pub fn callable<F, Fut>(name: impl Into<String>, work: F) -> Arc<dyn Callable>
where
    F: Fn(Vec<Value>, Map<String, Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
{
    Arc::new(FnCallable::new(name, work))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Arc<dyn Callable> {
        callable(name, |_args, _kwargs, _token| async { Ok(Value::Null) })
    }

    #[test]
    fn register_and_resolve_round_trip() {
        let mut registry = CallableRegistry::new();
        registry.register(noop("repo_sync")).unwrap();

        assert!(registry.resolve("repo_sync").is_some());
        assert!(registry.resolve("missing").is_none());
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let mut registry = CallableRegistry::new();
        registry.register(noop("repo_sync")).unwrap();

        let error = registry.register(noop("repo_sync")).unwrap_err();
        assert_eq!(error.kind, DispatchErrorKind::DuplicateCallable);
    }

    #[test]
    fn registered_names_are_sorted() {
        let mut registry = CallableRegistry::new();
        registry.register(noop("unbind")).unwrap();
        registry.register(noop("bind")).unwrap();

        assert_eq!(registry.registered_names(), vec!["bind", "unbind"]);
    }
}
