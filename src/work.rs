use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use crate::core::Dynamic;
use crate::future::GoalFuture;

/// Progress counters carried by a [`WorkNode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: u64,
    pub max: u64,
}

/// A named tree mirroring goal completion, addressed by dotted paths.
///
/// The tree is purely observational: it watches result futures, it never
/// schedules anything. Its one concurrency discipline is the lazy `is_done`
/// flag, invalidated up the parent chain whenever a child changes and
/// recomputed on the next read rather than on every event.
pub struct WorkTree {
    root: Arc<WorkNode>,
}

impl WorkTree {
    pub fn new() -> Self {
        Self {
            root: WorkNode::new(String::new(), Weak::new()),
        }
    }

    pub fn root(&self) -> &Arc<WorkNode> {
        &self.root
    }

    /// Finds the node at `path`, lazily creating intermediate nodes so the
    /// tree shape always matches the address.
    pub fn node(&self, path: &str) -> Arc<WorkNode> {
        let mut node = Arc::clone(&self.root);
        for part in path.split('.').filter(|p| !p.is_empty()) {
            node = WorkNode::child(&node, part);
        }
        node
    }

    /// Creates (or finds) the node at `path` and ties it to `future`.
    pub fn attach(&self, path: &str, future: GoalFuture<Dynamic>) -> Arc<WorkNode> {
        let node = self.node(path);
        node.attach(future);
        node
    }

    pub fn is_done(&self) -> bool {
        self.root.is_done()
    }

    pub fn cancel(&self, interrupt: bool) {
        self.root.cancel(interrupt);
    }

    /// Prunes finished subtrees.
    pub fn cleanup(&self) {
        self.root.cleanup();
    }
}

impl Default for WorkTree {
    fn default() -> Self {
        Self::new()
    }
}

/// One node of the [`WorkTree`].
///
/// `is_done` derives from "own future resolved AND all children done";
/// nodes without an attached future count their own part as done.
pub struct WorkNode {
    name: String,
    parent: Weak<WorkNode>,
    future: Mutex<Option<GoalFuture<Dynamic>>>,
    children: Mutex<BTreeMap<String, Arc<WorkNode>>>,
    progress: Mutex<Progress>,
    done: Mutex<DoneFlag>,
}

/// Cached completion state. `value: None` means dirty; the epoch counts
/// invalidations so a recomputation that raced one is never cached.
struct DoneFlag {
    epoch: u64,
    value: Option<bool>,
}

impl WorkNode {
    fn new(name: String, parent: Weak<WorkNode>) -> Arc<Self> {
        Arc::new(Self {
            name,
            parent,
            future: Mutex::new(None),
            children: Mutex::new(BTreeMap::new()),
            progress: Mutex::new(Progress::default()),
            done: Mutex::new(DoneFlag {
                epoch: 0,
                value: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn child(self: &Arc<Self>, name: &str) -> Arc<WorkNode> {
        let child = {
            let mut children = self.children.lock().unwrap();
            match children.get(name) {
                Some(child) => return Arc::clone(child),
                None => {
                    let child = WorkNode::new(name.to_owned(), Arc::downgrade(self));
                    children.insert(name.to_owned(), Arc::clone(&child));
                    child
                }
            }
        };

        // A new child changes the subtree's completion state.
        self.invalidate_up();
        child
    }

    /// Ties this node to a goal's result future and invalidates the chain
    /// once the future settles.
    pub fn attach(self: &Arc<Self>, future: GoalFuture<Dynamic>) {
        *self.future.lock().unwrap() = Some(future.clone());
        self.invalidate_up();

        let weak = Arc::downgrade(self);
        future.on_done_inline(move |_| {
            if let Some(node) = weak.upgrade() {
                node.invalidate_up();
            }
        });
    }

    pub fn set_progress(&self, current: u64, max: u64) {
        *self.progress.lock().unwrap() = Progress { current, max };
    }

    pub fn progress(&self) -> Progress {
        *self.progress.lock().unwrap()
    }

    /// Progress summed over the whole subtree.
    pub fn total_progress(&self) -> Progress {
        let mut total = self.progress();
        let children: Vec<_> = self.children.lock().unwrap().values().cloned().collect();
        for child in children {
            let sub = child.total_progress();
            total.current += sub.current;
            total.max += sub.max;
        }
        total
    }

    /// Lazily recomputed: push-based invalidation, pull-based recomputation.
    pub fn is_done(&self) -> bool {
        let epoch = {
            let flag = self.done.lock().unwrap();
            if let Some(done) = flag.value {
                return done;
            }
            flag.epoch
        };

        let own = self
            .future
            .lock()
            .unwrap()
            .as_ref()
            .is_none_or(|future| future.is_done());

        // Snapshot, so no lock is held across the recursion.
        let children: Vec<_> = self.children.lock().unwrap().values().cloned().collect();
        let done = own && children.iter().all(|child| child.is_done());

        // Cache only if no invalidation landed during the recomputation;
        // a stale flag written here would mask the resolution that caused
        // that invalidation until the next one.
        let mut flag = self.done.lock().unwrap();
        if flag.epoch == epoch {
            flag.value = Some(done);
        }
        done
    }

    fn invalidate_up(&self) {
        self.mark_dirty();

        let mut parent = self.parent.upgrade();
        while let Some(node) = parent {
            node.mark_dirty();
            parent = node.parent.upgrade();
        }
    }

    fn mark_dirty(&self) {
        let mut flag = self.done.lock().unwrap();
        flag.epoch += 1;
        flag.value = None;
    }

    /// Cascades depth-first: cancels this node's future, then every child.
    pub fn cancel(&self, interrupt: bool) {
        let future = self.future.lock().unwrap().clone();
        if let Some(future) = future {
            future.cancel(interrupt);
        }

        let children: Vec<_> = self.children.lock().unwrap().values().cloned().collect();
        for child in children {
            child.cancel(interrupt);
        }
    }

    /// Removes finished child subtrees, recursing first so nested finished
    /// work disappears in one pass.
    pub fn cleanup(&self) {
        let children: Vec<_> = self.children.lock().unwrap().values().cloned().collect();
        for child in &children {
            child.cleanup();
        }

        self.children
            .lock()
            .unwrap()
            .retain(|_, child| !child.is_done());
    }
}
