use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use crate::core::Dynamic;
use crate::error::GoalError;

/// Observer of goal lifecycle events.
///
/// For any single run, `on_goal_start` fires at most once before the compute
/// step, followed by exactly one of `on_goal_complete` / `on_goal_failed`.
/// All methods default to no-ops so implementors override only what they
/// observe.
pub trait GoalListener: Send + Sync {
    fn on_goal_start(&self, _goal: &str) {}
    fn on_goal_complete(&self, _goal: &str, _value: &Dynamic) {}
    fn on_goal_failed(&self, _goal: &str, _error: &GoalError) {}
}

/// A weakly-referenced, thread-safe listener registry.
///
/// The registry holds [`Weak`] references: callers must keep their listener
/// `Arc` alive for as long as they want events, and dropped listeners are
/// pruned on the next notification. Iteration works over a snapshot, so
/// listeners may register concurrently while events fire.
#[derive(Default)]
pub struct Listeners {
    inner: Mutex<Vec<Weak<dyn GoalListener>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: &Arc<dyn GoalListener>) {
        self.inner.lock().unwrap().push(Arc::downgrade(listener));
    }

    fn snapshot(&self) -> Vec<Arc<dyn GoalListener>> {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|weak| weak.strong_count() > 0);
        inner.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn notify_start(&self, goal: &str) {
        for listener in self.snapshot() {
            guarded(goal, "on_goal_start", || listener.on_goal_start(goal));
        }
    }

    pub(crate) fn notify_complete(&self, goal: &str, value: &Dynamic) {
        for listener in self.snapshot() {
            guarded(goal, "on_goal_complete", || {
                listener.on_goal_complete(goal, value)
            });
        }
    }

    pub(crate) fn notify_failed(&self, goal: &str, error: &GoalError) {
        for listener in self.snapshot() {
            guarded(goal, "on_goal_failed", || {
                listener.on_goal_failed(goal, error)
            });
        }
    }
}

/// A listener panic must never corrupt the result slot of the goal that
/// fired the event.
fn guarded(goal: &str, event: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(goal, event, "Listener panicked");
    }
}
