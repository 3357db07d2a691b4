use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::Dynamic;
use crate::error::GoalError;
use crate::executor::Executor;
use crate::future::{GoalFuture, Outcome};
use crate::goal::{Goal, SharedGoal};
use crate::listener::Listeners;

type DepsFn = Box<dyn Fn() -> Vec<SharedGoal> + Send + Sync>;
type ComputeFn = Box<dyn Fn(&GoalContext, &[Dynamic]) -> anyhow::Result<Dynamic> + Send + Sync>;
type StartHook = Box<dyn FnOnce() + Send>;

/// Passed to every compute step.
///
/// Cancellation is cooperative: there is no preemption, so long-running
/// steps should poll [`is_cancelled`](Self::is_cancelled) and bail out once
/// it fires.
pub struct GoalContext {
    pub cancel: CancellationToken,
}

impl GoalContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves the dependency output at `index` into its concrete type.
    ///
    /// # Panics
    /// Panics on a type mismatch, which indicates miswired dependencies.
    pub fn input<'a, T>(&self, inputs: &'a [Dynamic], index: usize) -> &'a T
    where
        T: Send + Sync + 'static,
    {
        inputs[index]
            .downcast_ref::<T>()
            .expect("Type mismatch in dependency resolution")
    }
}

/// The concrete goal state machine.
///
/// States: not started → starting (waiting on dependencies) → computing →
/// terminal. The entry guard makes [`run`](Goal::run) idempotent under
/// concurrent callers; the lock covers only the state transition, never the
/// compute step, so unrelated goals execute fully in parallel.
///
/// Dependencies are fanned out eagerly (each told to `run()` so it occupies
/// executor capacity immediately) and their conjunction is awaited through
/// completion callbacks rather than by blocking a thread: the last
/// dependency to settle schedules this goal's compute step as a continuation
/// on the injected executor.
pub struct ComputeGoal {
    name: String,
    executor: Arc<Executor>,
    deps: DepsFn,
    compute: ComputeFn,
    future: GoalFuture<Dynamic>,
    started: Mutex<bool>,
    token: CancellationToken,
    listeners: Listeners,
    start_hooks: Mutex<Vec<StartHook>>,
    weak: Weak<Self>,
}

impl ComputeGoal {
    pub fn new(
        name: impl Into<String>,
        executor: Arc<Executor>,
        deps: impl Fn() -> Vec<SharedGoal> + Send + Sync + 'static,
        compute: impl Fn(&GoalContext, &[Dynamic]) -> anyhow::Result<Dynamic> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let future = GoalFuture::new();

            // Cancelling the public result future aborts the computation.
            let hook = weak.clone();
            future.set_cancel_hook(move |interrupt| {
                if interrupt {
                    if let Some(goal) = hook.upgrade() {
                        goal.abort();
                    }
                }
            });

            Self {
                name: name.into(),
                executor,
                deps: Box::new(deps),
                compute: Box::new(compute),
                future,
                started: Mutex::new(false),
                token: CancellationToken::new(),
                listeners: Listeners::new(),
                start_hooks: Mutex::new(Vec::new()),
                weak: weak.clone(),
            }
        })
    }

    /// Whether `run()` has been observed, or the result is already terminal.
    pub fn is_started(&self) -> bool {
        *self.started.lock().unwrap() || self.future.is_done()
    }

    fn schedule(self: Arc<Self>, inputs: Vec<Dynamic>) {
        if self.future.is_done() || self.token.is_cancelled() {
            return;
        }

        let executor = Arc::clone(&self.executor);
        executor.spawn(move || self.execute(inputs));
    }

    fn execute(self: Arc<Self>, inputs: Vec<Dynamic>) {
        // An abort or an external complete() may have landed between
        // scheduling and pickup by a worker.
        if self.future.is_done() || self.token.is_cancelled() {
            return;
        }

        for hook in self.start_hooks.lock().unwrap().drain(..) {
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                tracing::warn!(goal = %self.name, "Start hook panicked");
            }
        }

        self.listeners.notify_start(&self.name);
        debug!(goal = %self.name, "computing");

        let ctx = GoalContext {
            cancel: self.token.clone(),
        };

        let result = match catch_unwind(AssertUnwindSafe(|| (self.compute)(&ctx, &inputs))) {
            Ok(result) => result,
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("Goal panicked: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("Goal panicked: {s}")
                } else {
                    String::from("Goal panicked with unknown payload")
                };

                Err(anyhow::anyhow!(msg))
            }
        };

        match result {
            Ok(value) => {
                // resolve() is idempotent: if a concurrent complete() or
                // cancel won the race, the value is discarded and no
                // listener fires twice.
                if self.future.resolve(Outcome::Resolved(value.clone())) {
                    self.listeners.notify_complete(&self.name, &value);
                }
            }
            Err(err) => {
                let err = GoalError::from(err);
                if self.future.resolve(Outcome::Failed(err.clone())) {
                    self.listeners.notify_failed(&self.name, &err);
                }
            }
        }
    }
}

impl Goal for ComputeGoal {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> Vec<SharedGoal> {
        (self.deps)()
    }

    fn run(&self) {
        {
            let mut started = self.started.lock().unwrap();
            if *started || self.future.is_done() {
                return;
            }
            *started = true;
            // Lock released here; the fan-out below must not serialize
            // unrelated goals.
        }

        let Some(this) = self.weak.upgrade() else {
            return;
        };

        let deps = (self.deps)();
        for dep in &deps {
            dep.run();
        }

        if deps.is_empty() {
            this.schedule(Vec::new());
            return;
        }

        let futures: Vec<GoalFuture<Dynamic>> = deps.iter().map(|dep| dep.result()).collect();
        let remaining = Arc::new(AtomicUsize::new(futures.len()));

        for future in &futures {
            let this = Arc::clone(&this);
            let remaining = Arc::clone(&remaining);
            let futures = futures.clone();

            future.on_done_inline(move |outcome| match outcome {
                Outcome::Resolved(_) => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        // Last dependency settled; gather outputs in
                        // declaration order and schedule the compute step.
                        let mut inputs = Vec::with_capacity(futures.len());
                        for future in &futures {
                            match future.peek() {
                                Some(Outcome::Resolved(value)) => inputs.push(value),
                                // A cancel raced the countdown.
                                _ => return,
                            }
                        }
                        this.schedule(inputs);
                    }
                }
                Outcome::Failed(err) => {
                    // First failure wins; the compute step never runs.
                    if this.future.resolve(Outcome::Failed(err.clone())) {
                        this.listeners.notify_failed(&this.name, err);
                    }
                }
                Outcome::Cancelled => {
                    this.future.resolve(Outcome::Cancelled);
                }
            });
        }
    }

    fn result(&self) -> GoalFuture<Dynamic> {
        self.future.clone()
    }

    fn on_start(&self, hook: Box<dyn FnOnce() + Send>) {
        if !self.future.is_done() {
            self.start_hooks.lock().unwrap().push(hook);
        }
    }

    fn abort(&self) {
        debug!(goal = %self.name, "abort requested");
        self.token.cancel();
    }

    fn complete(&self, value: Dynamic) -> bool {
        self.abort();
        let applied = self.future.resolve(Outcome::Resolved(value.clone()));
        if applied {
            self.listeners.notify_complete(&self.name, &value);
        }
        applied
    }

    fn listeners(&self) -> &Listeners {
        &self.listeners
    }
}
