use std::sync::Arc;

use crate::core::Dynamic;
use crate::engine::ComputeGoal;
use crate::executor::Executor;
use crate::goal::{GoalHandle, SharedGoal};

/// A goal with no computation of its own, used to synchronize on a batch.
///
/// The group's future resolves once every member has resolved, and fails
/// with the first member failure. All engine semantics apply unchanged;
/// aborting the group never cancels the members, which may be shared with
/// other consumers.
pub struct GoalGroup;

impl GoalGroup {
    pub fn new(
        name: impl Into<String>,
        executor: Arc<Executor>,
        goals: Vec<SharedGoal>,
    ) -> GoalHandle<()> {
        let goal = ComputeGoal::new(
            name,
            executor,
            move || goals.clone(),
            |_, _| Ok(Arc::new(()) as Dynamic),
        );

        GoalHandle::from_erased(goal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GoalError;
    use crate::goal::GoalBuilder;

    #[test]
    fn test_group_waits_for_all() {
        let executor = Executor::pool(4).unwrap();

        let goals: Vec<GoalHandle<u32>> = (0..3)
            .map(|i| {
                GoalBuilder::new(format!("g{i}"), executor.clone()).build(move |_, _| {
                    std::thread::sleep(std::time::Duration::from_millis(10 * i));
                    Ok(i as u32)
                })
            })
            .collect();

        let members = goals.iter().map(GoalHandle::erased).collect();
        let group = GoalGroup::new("batch", executor, members);

        group.get().unwrap();
        for (i, goal) in goals.iter().enumerate() {
            assert_eq!(*goal.get().unwrap(), i as u32);
        }
    }

    #[test]
    fn test_group_propagates_first_failure() {
        let executor = Executor::pool(4).unwrap();

        let ok_a = GoalBuilder::new("a", executor.clone()).build(|_, _| Ok(1u32));
        let bad = GoalBuilder::new("b", executor.clone())
            .build(|_, _| -> anyhow::Result<u32> { anyhow::bail!("boom") });
        let ok_c = GoalBuilder::new("c", executor.clone()).build(|_, _| Ok(3u32));

        let group = GoalGroup::new(
            "batch",
            executor,
            vec![ok_a.erased(), bad.erased(), ok_c.erased()],
        );

        let err = group.get().unwrap_err();
        match err {
            GoalError::Failed(inner) => assert!(inner.to_string().contains("boom")),
            other => panic!("unexpected error: {other}"),
        }

        // Sibling results stay independently resolved.
        assert_eq!(*ok_a.get().unwrap(), 1);
        assert_eq!(*ok_c.get().unwrap(), 3);
    }
}
