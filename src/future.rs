use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::GoalError;
use crate::executor::Executor;

/// Terminal state of a goal's result slot.
#[derive(Clone)]
pub enum Outcome<T> {
    Resolved(T),
    Failed(GoalError),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved(_))
    }

    pub fn into_result(self) -> Result<T, GoalError> {
        match self {
            Outcome::Resolved(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(GoalError::Cancelled),
        }
    }
}

impl<T> std::fmt::Debug for Outcome<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Resolved(_) => write!(f, "Resolved(..)"),
            Outcome::Failed(err) => write!(f, "Failed({err})"),
            Outcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;
type CancelHook = Box<dyn FnOnce(bool) + Send + 'static>;

enum State<T> {
    Pending {
        callbacks: Vec<(Callback<T>, Option<Arc<Executor>>)>,
        on_cancel: Option<CancelHook>,
    },
    Done(Outcome<T>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// A settable, cancelable handle to a goal's eventual result.
///
/// The slot transitions monotonically from pending to exactly one terminal
/// [`Outcome`]; the first write wins and later writes are no-ops. Cloning
/// yields another handle to the same slot.
///
/// Completion callbacks registered with [`on_done`](Self::on_done) are
/// dispatched on the supplied executor, never on the thread that resolved
/// the slot, which rules out reentrant deadlocks in user code.
pub struct GoalFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for GoalFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> GoalFuture<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending {
                    callbacks: Vec::new(),
                    on_cancel: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Registers the hook invoked at most once when this future is cancelled.
    /// Dropped silently if the slot is already terminal.
    pub(crate) fn set_cancel_hook(&self, hook: impl FnOnce(bool) + Send + 'static) {
        let mut state = self.shared.state.lock().unwrap();
        if let State::Pending { on_cancel, .. } = &mut *state {
            *on_cancel = Some(Box::new(hook));
        }
    }

    /// Writes the terminal outcome. Returns whether this call resolved the
    /// slot; `false` means it was already terminal and nothing changed.
    pub(crate) fn resolve(&self, outcome: Outcome<T>) -> bool {
        let callbacks = {
            let mut state = self.shared.state.lock().unwrap();
            if matches!(&*state, State::Done(_)) {
                return false;
            }
            match std::mem::replace(&mut *state, State::Done(outcome.clone())) {
                State::Pending { callbacks, .. } => callbacks,
                State::Done(_) => Vec::new(),
            }
        };

        self.shared.cond.notify_all();
        for (callback, executor) in callbacks {
            dispatch(executor, callback, &outcome);
        }

        true
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.shared.state.lock().unwrap(), State::Done(_))
    }

    /// Non-blocking read of the terminal outcome, if any.
    pub fn peek(&self) -> Option<Outcome<T>> {
        match &*self.shared.state.lock().unwrap() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Blocks the calling thread until the slot is terminal.
    pub fn wait(&self) -> Outcome<T> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            match &*state {
                State::Done(outcome) => return outcome.clone(),
                State::Pending { .. } => state = self.shared.cond.wait(state).unwrap(),
            }
        }
    }

    /// Blocks until the slot is terminal or the timeout elapses. This is the
    /// primitive for racing a goal against an external timer; goals carry no
    /// built-in timeout of their own.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock().unwrap();

        loop {
            if let State::Done(outcome) = &*state {
                return Some(outcome.clone());
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let (next, result) = self
                .shared
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;

            if result.timed_out() && matches!(&*state, State::Pending { .. }) {
                return None;
            }
        }
    }

    /// Registers a one-shot completion callback, dispatched on `executor`.
    /// If the slot is already terminal the callback is still dispatched
    /// through the executor rather than run inline.
    pub fn on_done(
        &self,
        executor: &Arc<Executor>,
        callback: impl FnOnce(&Outcome<T>) + Send + 'static,
    ) {
        self.register(Some(Arc::clone(executor)), Box::new(callback));
    }

    /// Inline variant reserved for cheap engine bookkeeping (dependency
    /// countdowns, work-tree invalidation). Runs on the resolving thread.
    pub(crate) fn on_done_inline(&self, callback: impl FnOnce(&Outcome<T>) + Send + 'static) {
        self.register(None, Box::new(callback));
    }

    fn register(&self, executor: Option<Arc<Executor>>, callback: Callback<T>) {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            State::Pending { callbacks, .. } => callbacks.push((callback, executor)),
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(state);
                dispatch(executor, callback, &outcome);
            }
        }
    }

    /// Cancels the slot, invoking the goal's abort hook with the `interrupt`
    /// flag. Returns whether this call performed the cancellation.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let (hook, callbacks) = {
            let mut state = self.shared.state.lock().unwrap();
            if matches!(&*state, State::Done(_)) {
                return false;
            }
            match std::mem::replace(&mut *state, State::Done(Outcome::Cancelled)) {
                State::Pending {
                    callbacks,
                    on_cancel,
                } => (on_cancel, callbacks),
                State::Done(_) => (None, Vec::new()),
            }
        };

        self.shared.cond.notify_all();

        if let Some(hook) = hook {
            hook(interrupt);
        }

        let outcome = Outcome::Cancelled;
        for (callback, executor) in callbacks {
            dispatch(executor, callback, &outcome);
        }

        true
    }
}

fn dispatch<T>(executor: Option<Arc<Executor>>, callback: Callback<T>, outcome: &Outcome<T>)
where
    T: Clone + Send + 'static,
{
    match executor {
        Some(executor) => {
            let outcome = outcome.clone();
            executor.spawn(move || run_callback(callback, &outcome));
        }
        None => run_callback(callback, outcome),
    }
}

fn run_callback<T>(callback: Callback<T>, outcome: &Outcome<T>) {
    // A panicking callback must not poison the resolving thread or the slot.
    if catch_unwind(AssertUnwindSafe(|| callback(outcome))).is_err() {
        tracing::warn!("Completion callback panicked");
    }
}
