use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::core::{Dynamic, Identity};
use crate::engine::{ComputeGoal, GoalContext};
use crate::executor::Executor;
use crate::goal::GoalHandle;
use crate::store::Store;

/// A decorator that substitutes stored results for recomputation.
///
/// [`wrap`](Self::wrap) takes a goal and a content [`Identity`] and returns a
/// goal with an identical external contract. The wrapper checks the store
/// *before* producing any dependency edge: on a hit the wrapped goal (and
/// therefore its whole dependency subgraph) is never started at all, which is
/// where the real performance win lives. On a miss the wrapped goal runs as
/// the sole dependency and its result is persisted as a side effect of
/// success, never on failure.
///
/// The check-then-act over the store is deliberately not locked across the
/// whole sequence: two callers can both miss and both compute, settling on
/// last-write-wins at `put`. Equal identities imply equivalent values, so the
/// race is harmless.
pub struct Cacher<T> {
    store: Arc<dyn Store<T>>,
    executor: Arc<Executor>,
    registry: Mutex<HashMap<String, HashSet<Identity>>>,
}

impl<T> Cacher<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn Store<T>>, executor: Arc<Executor>) -> Self {
        Self {
            store,
            executor,
            registry: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store<T>> {
        &self.store
    }

    /// Wraps `goal` so its result is served from the store under `id` when
    /// present, and persisted there once computed otherwise.
    pub fn wrap(&self, name: impl Into<String>, goal: GoalHandle<T>, id: Identity) -> GoalHandle<T> {
        let name = name.into();
        self.registry
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_default()
            .insert(id);

        let deps_store = Arc::clone(&self.store);
        let deps_goal = goal.clone();
        let deps = move || {
            if deps_store.contains(&id) {
                Vec::new()
            } else {
                vec![deps_goal.erased()]
            }
        };

        let store = Arc::clone(&self.store);
        let goal_name = name.clone();
        let compute = move |_: &GoalContext, _: &[Dynamic]| {
            // Re-check at execution time: another consumer may have
            // populated the store while our dependency was running.
            if store.contains(&id) {
                match store.get(&id) {
                    Ok(value) => return Ok(value as Dynamic),
                    Err(err) => {
                        // A corrupt or unreadable entry is not fatal; evict
                        // it and fall through to recomputation.
                        tracing::warn!(goal = %goal_name, error = %err, "Cache read failed, recomputing");
                        store.invalidate(&id);
                    }
                }
            }

            // Already resolved when it ran as our dependency; on the
            // fall-through path this drives the subgraph from here.
            let value = goal.get().map_err(anyhow::Error::from)?;

            if let Err(err) = store.put(id, Arc::clone(&value)) {
                // The computed value is still returned to the caller.
                tracing::warn!(goal = %goal_name, error = %err, "Failed to persist computed value");
            }

            Ok(value as Dynamic)
        };

        GoalHandle::from_erased(ComputeGoal::new(name, Arc::clone(&self.executor), deps, compute))
    }

    /// Recursively wraps a tree of named sub-results, extending the parent
    /// identity with each child's local name. Registered names are the
    /// dotted paths below `name`.
    pub fn wrap_node(&self, name: &str, node: DataNode<T>, id: Identity) -> DataNode<T> {
        match node {
            DataNode::Leaf(goal) => DataNode::Leaf(self.wrap(name, goal, id)),
            DataNode::Branch(children) => DataNode::Branch(
                children
                    .into_iter()
                    .map(|(child_name, child)| {
                        let path = if name.is_empty() {
                            child_name.clone()
                        } else {
                            format!("{name}.{child_name}")
                        };
                        let wrapped = self.wrap_node(&path, child, id.extend(&child_name));
                        (child_name, wrapped)
                    })
                    .collect(),
            ),
        }
    }

    /// Drops every entry whose registered name matches the glob pattern.
    /// Eventually consistent: goals already reading mid-computation are not
    /// interrupted.
    pub fn invalidate(&self, pattern: &str) -> Result<(), glob::PatternError> {
        let matcher = glob::Pattern::new(pattern)?;
        let mut registry = self.registry.lock().unwrap();

        registry.retain(|name, ids| {
            if matcher.matches(name) {
                for id in ids.iter() {
                    self.store.invalidate(id);
                }
                false
            } else {
                true
            }
        });

        Ok(())
    }

    /// Drops everything, registered or not.
    pub fn invalidate_all(&self) {
        self.registry.lock().unwrap().clear();
        self.store.invalidate_all();
    }
}

/// A tree of named sub-results produced by one logical unit of work.
///
/// The cache layer wraps every leaf with an identity derived from the root
/// identity and the path of names leading to it, so per-leaf keys stay
/// stable without manual enumeration.
pub enum DataNode<T> {
    Leaf(GoalHandle<T>),
    Branch(BTreeMap<String, DataNode<T>>),
}

impl<T> DataNode<T>
where
    T: Send + Sync + 'static,
{
    pub fn leaf(goal: GoalHandle<T>) -> Self {
        DataNode::Leaf(goal)
    }

    pub fn branch(children: impl IntoIterator<Item = (String, DataNode<T>)>) -> Self {
        DataNode::Branch(children.into_iter().collect())
    }

    /// Looks up a node by dotted path.
    pub fn get(&self, path: &str) -> Option<&DataNode<T>> {
        let mut node = self;
        for part in path.split('.') {
            match node {
                DataNode::Branch(children) => node = children.get(part)?,
                DataNode::Leaf(_) => return None,
            }
        }
        Some(node)
    }

    /// All leaf goals in the subtree, depth-first.
    pub fn leaves(&self) -> Vec<&GoalHandle<T>> {
        match self {
            DataNode::Leaf(goal) => vec![goal],
            DataNode::Branch(children) => {
                children.values().flat_map(DataNode::leaves).collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::goal::{Goal, GoalBuilder};
    use crate::store::{FileStore, MemoryStore};

    fn counted_goal(
        executor: &Arc<Executor>,
        calls: &Arc<AtomicUsize>,
        value: u32,
    ) -> GoalHandle<u32> {
        let calls = Arc::clone(calls);
        GoalBuilder::new("inner", Arc::clone(executor)).build(move |_, _| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    }

    #[test]
    fn test_hit_severs_dependency_edge() {
        let executor = Executor::pool(2).unwrap();
        let store = Arc::new(MemoryStore::new(8));
        let cacher = Cacher::new(store.clone() as Arc<dyn Store<u32>>, executor.clone());

        let id = Identity::of("k1");
        store.put(id, Arc::new(42u32)).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let inner = counted_goal(&executor, &calls, 0);
        let wrapped = cacher.wrap("cached", inner, id);

        // The cached wrapper exposes no dependencies at all.
        assert!(wrapped.erased().dependencies().is_empty());
        assert_eq!(*wrapped.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_miss_computes_once_and_persists() {
        let executor = Executor::pool(2).unwrap();
        let store: Arc<MemoryStore<u32>> = Arc::new(MemoryStore::new(8));
        let cacher = Cacher::new(store.clone() as Arc<dyn Store<u32>>, executor.clone());

        let id = Identity::of("k1");
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = counted_goal(&executor, &calls, 42);
        let wrapped = cacher.wrap("cached", inner, id);

        assert_eq!(wrapped.erased().dependencies().len(), 1);
        assert_eq!(*wrapped.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*store.get(&id).unwrap(), 42);

        // A fresh wrapper over the now-populated store short-circuits.
        let second = counted_goal(&executor, &calls, 0);
        let wrapped = cacher.wrap("cached", second, id);
        assert_eq!(*wrapped.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_corrupt_entry_falls_through_to_recompute() {
        let executor = Executor::pool(4).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = Arc::new(FileStore::<u32>::new(root.clone()));
        let cacher = Cacher::new(store.clone() as Arc<dyn Store<u32>>, executor.clone());

        let id = Identity::of("k1");
        std::fs::write(root.join(format!("{}.cbor", id.to_hex())), b"not cbor").unwrap();
        assert!(store.contains(&id));

        let calls = Arc::new(AtomicUsize::new(0));
        let inner = counted_goal(&executor, &calls, 42);
        let wrapped = cacher.wrap("cached", inner, id);

        // The unreadable entry is evicted, computation falls through, and
        // the fresh value replaces it.
        assert_eq!(*wrapped.get().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*store.get(&id).unwrap(), 42);
    }

    #[test]
    fn test_rewrap_does_not_duplicate_registry() {
        let executor = Executor::pool(2).unwrap();
        let store = Arc::new(MemoryStore::new(8));
        let cacher = Cacher::new(store.clone() as Arc<dyn Store<u32>>, executor.clone());

        let id = Identity::of("k");
        for _ in 0..3 {
            let calls = Arc::new(AtomicUsize::new(0));
            let _ = cacher.wrap("cached", counted_goal(&executor, &calls, 1), id);
        }

        let registry = cacher.registry.lock().unwrap();
        assert_eq!(registry["cached"].len(), 1);
    }

    #[test]
    fn test_failure_is_never_stored() {
        let executor = Executor::pool(2).unwrap();
        let store = Arc::new(MemoryStore::new(8));
        let cacher = Cacher::new(store.clone() as Arc<dyn Store<u32>>, executor.clone());

        let id = Identity::of("bad");
        let inner: GoalHandle<u32> = GoalBuilder::new("inner", executor.clone())
            .build(|_, _| anyhow::bail!("boom"));
        let wrapped = cacher.wrap("cached", inner, id);

        assert!(wrapped.get().is_err());
        assert!(!store.contains(&id));
    }

    #[test]
    fn test_wrap_node_derives_child_keys() {
        let executor = Executor::pool(2).unwrap();
        let store: Arc<MemoryStore<u32>> = Arc::new(MemoryStore::new(8));
        let cacher = Cacher::new(store.clone() as Arc<dyn Store<u32>>, executor.clone());

        let make = |value| {
            GoalBuilder::new("leaf", executor.clone()).build(move |_, _| Ok::<u32, _>(value))
        };

        let tree = DataNode::branch([
            ("left".to_string(), DataNode::leaf(make(1))),
            ("right".to_string(), DataNode::leaf(make(2))),
        ]);

        let root = Identity::of("root");
        let wrapped = cacher.wrap_node("", tree, root);

        for leaf in wrapped.leaves() {
            leaf.get().unwrap();
        }

        assert_eq!(*store.get(&root.extend("left")).unwrap(), 1);
        assert_eq!(*store.get(&root.extend("right")).unwrap(), 2);
    }

    #[test]
    fn test_invalidate_by_namespace() {
        let executor = Executor::pool(2).unwrap();
        let store = Arc::new(MemoryStore::new(8));
        let cacher = Cacher::new(store.clone() as Arc<dyn Store<u32>>, executor.clone());

        let id_a = Identity::of("a");
        let id_b = Identity::of("b");
        store.put(id_a, Arc::new(1u32)).unwrap();
        store.put(id_b, Arc::new(2u32)).unwrap();

        let _ = cacher.wrap("raw.a", counted_goal(&executor, &Arc::new(AtomicUsize::new(0)), 1), id_a);
        let _ = cacher.wrap("fit.b", counted_goal(&executor, &Arc::new(AtomicUsize::new(0)), 2), id_b);

        cacher.invalidate("raw.*").unwrap();
        assert!(!store.contains(&id_a));
        assert!(store.contains(&id_b));
    }
}
