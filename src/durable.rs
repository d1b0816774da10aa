//! The "named, memoized, at-least-once sub-unit" abstraction called for by
//! the design note in spec §9: "the Orchestrator's step loop is structured as
//! a sequence of named sub-units so any job-queue runtime providing 'run this
//! named sub-step with memoization and retry' can host it; the engine must
//! not depend on a specific runtime's APIs beyond this abstraction."
//!
//! Grounded on `everruns-durable`'s `WorkflowExecutor`/event-sourced sub-step
//! shape: the host owns persistence and memoization, the engine only calls
//! named steps.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;

use dashmap::DashMap;

/// A runtime capable of hosting named, memoized sub-units. `run_sub_unit`
/// executes `f` and should return the same value on a subsequent call with
/// the same `(execution_id, name)` without re-running `f`'s side effects,
/// once `f` has completed successfully at least once.
pub trait DurableRuntime: Send + Sync {
    fn run_sub_unit<'a, T, Fut>(
        &'a self,
        execution_id: &'a str,
        name: &'a str,
        f: Fut,
    ) -> Pin<Box<dyn Future<Output = T> + Send + 'a>>
    where
        Fut: Future<Output = T> + Send + 'a,
        T: Clone + Send + Sync + 'static;
}

/// Default in-process runtime: memoizes sub-unit results for the lifetime of
/// this instance (typically one per running worker process). A production
/// deployment swaps this for an adapter over its actual job-queue runtime
/// (e.g. a durable-execution service) implementing the same trait; the
/// Orchestrator itself is agnostic to which one is plugged in.
#[derive(Default)]
pub struct InProcessDurableRuntime {
    memo: DashMap<String, Box<dyn Any + Send + Sync>>,
}

impl InProcessDurableRuntime {
    pub fn new() -> Self {
        Self {
            memo: DashMap::new(),
        }
    }

    /// Drops memoized results for one execution, e.g. once it reaches a
    /// terminal state and its sub-units will never be re-entered.
    pub fn forget_execution(&self, execution_id: &str) {
        self.memo
            .retain(|key, _| !key.starts_with(&format!("{execution_id}:")));
    }
}

impl DurableRuntime for InProcessDurableRuntime {
    fn run_sub_unit<'a, T, Fut>(
        &'a self,
        execution_id: &'a str,
        name: &'a str,
        f: Fut,
    ) -> Pin<Box<dyn Future<Output = T> + Send + 'a>>
    where
        Fut: Future<Output = T> + Send + 'a,
        T: Clone + Send + Sync + 'static,
    {
        Box::pin(async move {
            let key = format!("{execution_id}:{name}");
            if let Some(cached) = self.memo.get(&key) {
                if let Some(v) = cached.downcast_ref::<T>() {
                    return v.clone();
                }
            }
            let result = f.await;
            self.memo.insert(key, Box::new(result.clone()));
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn re_entering_a_sub_unit_does_not_repeat_side_effects() {
        let runtime = InProcessDurableRuntime::new();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            runtime
                .run_sub_unit("exec-1", "step-a", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    42i32
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_sub_units_run_independently() {
        let runtime = InProcessDurableRuntime::new();
        let a: i32 = runtime.run_sub_unit("exec-1", "a", async { 1 }).await;
        let b: i32 = runtime.run_sub_unit("exec-1", "b", async { 2 }).await;
        assert_eq!((a, b), (1, 2));
    }
}
