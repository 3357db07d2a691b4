use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::Dynamic;
use crate::engine::{ComputeGoal, GoalContext};
use crate::error::GoalError;
use crate::executor::Executor;
use crate::future::GoalFuture;
use crate::listener::{GoalListener, Listeners};

/// The public contract for a unit of asynchronous, potentially dependent
/// computation.
///
/// A goal is a named node producing a type-erased value. The graph is wired
/// implicitly: each goal knows how to produce its immediate dependencies, and
/// [`run`](Self::run) drives the whole subgraph to completion without
/// blocking the caller. Outputs travel as [`Dynamic`] so heterogeneous goals
/// can share one dependency list; [`GoalHandle`] restores the concrete type
/// at the edges.
pub trait Goal: Send + Sync {
    fn name(&self) -> &str;

    /// The immediate dependency set. Pure, and re-evaluated at every
    /// [`run`](Self::run): membership can change with external state, which
    /// is exactly how the cache layer severs dependency edges for results it
    /// already holds.
    fn dependencies(&self) -> Vec<SharedGoal>;

    /// Starts this goal and, recursively, its dependencies. Idempotent:
    /// concurrent or repeated calls trigger exactly one compute invocation.
    /// Never blocks the calling thread.
    fn run(&self);

    /// A handle to the (possibly unresolved) result slot. Cancelling it with
    /// `interrupt = true` calls back into [`abort`](Self::abort).
    fn result(&self) -> GoalFuture<Dynamic>;

    /// Registers a one-shot hook fired after dependencies resolve, right
    /// before the compute step. Dropped if the goal is already terminal.
    fn on_start(&self, hook: Box<dyn FnOnce() + Send>);

    /// Interrupts an in-flight computation cooperatively. Does not resolve
    /// the result slot, and does not cancel dependency goals, which may be
    /// shared with other consumers.
    fn abort(&self);

    /// Forces a result from outside, aborting any in-flight computation
    /// first. Returns whether the value was applied; `false` means the goal
    /// was already terminal.
    fn complete(&self, value: Dynamic) -> bool;

    fn listeners(&self) -> &Listeners;
}

pub type SharedGoal = Arc<dyn Goal>;

/// A typed wrapper over an erased [`Goal`].
///
/// Values flow through the graph as [`Dynamic`]; the handle downcasts them
/// back to `T` at the boundary. A mismatch between `T` and the goal's actual
/// output type is a wiring bug and panics, mirroring how dependency outputs
/// are resolved inside the engine.
pub struct GoalHandle<T> {
    goal: SharedGoal,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for GoalHandle<T> {
    fn clone(&self) -> Self {
        Self {
            goal: Arc::clone(&self.goal),
            _marker: PhantomData,
        }
    }
}

impl<T> GoalHandle<T>
where
    T: Send + Sync + 'static,
{
    pub fn from_erased(goal: SharedGoal) -> Self {
        Self {
            goal,
            _marker: PhantomData,
        }
    }

    pub fn erased(&self) -> SharedGoal {
        Arc::clone(&self.goal)
    }

    pub fn name(&self) -> &str {
        self.goal.name()
    }

    pub fn run(&self) {
        self.goal.run();
    }

    pub fn result(&self) -> GoalFuture<Dynamic> {
        self.goal.result()
    }

    /// Blocking convenience: `run()` followed by a wait on the result.
    pub fn get(&self) -> Result<Arc<T>, GoalError> {
        self.goal.run();
        let value = self.goal.result().wait().into_result()?;
        Ok(downcast::<T>(self.goal.name(), value))
    }

    /// Forces a result, aborting any in-flight computation first. Returns
    /// whether the value was applied.
    pub fn complete(&self, value: Arc<T>) -> bool {
        self.goal.complete(value as Dynamic)
    }

    pub fn abort(&self) {
        self.goal.abort();
    }

    /// Cancels the result slot; with `interrupt = true` the in-flight
    /// compute step is aborted as well.
    pub fn cancel(&self, interrupt: bool) -> bool {
        self.goal.result().cancel(interrupt)
    }

    /// One-shot completion callback, dispatched on `executor` rather than
    /// the thread that resolved the goal.
    pub fn on_complete(
        &self,
        executor: &Arc<Executor>,
        callback: impl FnOnce(Result<Arc<T>, GoalError>) + Send + 'static,
    ) {
        let name = self.goal.name().to_owned();
        self.goal.result().on_done(executor, move |outcome| {
            let result = outcome
                .clone()
                .into_result()
                .map(|value| downcast::<T>(&name, value));
            callback(result);
        });
    }

    /// One-shot hook fired right before the compute step.
    pub fn on_start(&self, hook: impl FnOnce() + Send + 'static) {
        self.goal.on_start(Box::new(hook));
    }

    pub fn add_listener(&self, listener: &Arc<dyn GoalListener>) {
        self.goal.listeners().add(listener);
    }
}

fn downcast<T>(goal: &str, value: Dynamic) -> Arc<T>
where
    T: Send + Sync + 'static,
{
    value
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("Type mismatch in result of goal '{goal}'"))
}

/// Fluent constructor for the common fixed-dependency case.
///
/// ```rust
/// use std::sync::Arc;
/// use telos::{Executor, GoalBuilder};
///
/// let executor = Executor::pool(2).unwrap();
///
/// let base = GoalBuilder::new("base", executor.clone()).build(|_, _| Ok(21u32));
/// let doubled = GoalBuilder::new("doubled", executor)
///     .depends_on(&base)
///     .build(|ctx, inputs| {
///         let base: &u32 = ctx.input(inputs, 0);
///         Ok(base * 2)
///     });
///
/// assert_eq!(*doubled.get().unwrap(), 42);
/// ```
pub struct GoalBuilder {
    name: String,
    executor: Arc<Executor>,
    dependencies: Vec<SharedGoal>,
}

impl GoalBuilder {
    pub fn new(name: impl Into<String>, executor: Arc<Executor>) -> Self {
        Self {
            name: name.into(),
            executor,
            dependencies: Vec::new(),
        }
    }

    pub fn depends_on<D>(mut self, handle: &GoalHandle<D>) -> Self
    where
        D: Send + Sync + 'static,
    {
        self.dependencies.push(handle.erased());
        self
    }

    pub fn depends_on_erased(mut self, goal: SharedGoal) -> Self {
        self.dependencies.push(goal);
        self
    }

    /// Finishes the goal. `compute` receives the dependency outputs in the
    /// order they were declared; use [`GoalContext::input`] to recover their
    /// concrete types.
    pub fn build<T, F>(self, compute: F) -> GoalHandle<T>
    where
        T: Send + Sync + 'static,
        F: Fn(&GoalContext, &[Dynamic]) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let dependencies = self.dependencies;
        let goal = ComputeGoal::new(
            self.name,
            self.executor,
            move || dependencies.clone(),
            move |ctx, inputs| compute(ctx, inputs).map(|value| Arc::new(value) as Dynamic),
        );

        GoalHandle::from_erased(goal)
    }
}
