//! The priority/preemption placement algorithm.
//!
//! One call schedules one admission cycle over an immutable snapshot and
//! returns proposals only; the caller applies them. Agents and pending tasks
//! are partitioned by pool label into independent universes, each partition
//! schedules its zero-slot and positive-slot pools independently, and within
//! a pool priority levels are walked in ascending numeric order with no
//! cross-priority backfill: a level that leaves any task unplaced halts all
//! lower levels of that pool.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, instrument, warn};

use mlgrid_id::{AgentId, GroupId, TaskId};

use super::fitting::{AgentCapacity, FittingPolicy};
use crate::cluster::{ClusterSnapshot, Task};

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that reject a whole admission cycle.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A task references a group the snapshot does not contain. The cycle is
    /// rejected wholesale, never partially applied.
    #[error("task {task_id} references unknown group {group_id}")]
    DanglingGroup { task_id: TaskId, group_id: GroupId },
}

/// One proposed admission: bind the task to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub task_id: TaskId,
    pub agent_id: AgentId,
}

/// Proposals for one admission cycle.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOutcome {
    /// Pending tasks to transition to allocated, with their agent.
    pub to_admit: Vec<Admission>,

    /// Running tasks whose allocation must be released. Their capacity
    /// becomes usable on a later cycle, once the release is observed.
    pub to_preempt: Vec<TaskId>,

    pub stats: CycleStats,
}

/// Counters for one cycle, logged by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub partitions: usize,
    pub pending_considered: usize,
    pub admitted: usize,
    pub preempted: usize,
    pub unplaced: usize,
}

/// Which capacity dimension a pool is metered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    ZeroSlot,
    Positive,
}

/// The cycle-based priority scheduler.
pub struct PriorityScheduler<P: FittingPolicy> {
    policy: P,
    preemption_enabled: bool,
}

impl<P: FittingPolicy> PriorityScheduler<P> {
    pub fn new(policy: P, preemption_enabled: bool) -> Self {
        Self {
            policy,
            preemption_enabled,
        }
    }

    /// Computes admission and preemption proposals for one cycle.
    #[instrument(skip_all, fields(tasks = snapshot.tasks.len(), agents = snapshot.agents.len()))]
    pub fn schedule(&self, snapshot: &ClusterSnapshot) -> SchedulerResult<ScheduleOutcome> {
        // An inconsistent snapshot rejects the cycle before any decision is
        // made.
        for task in &snapshot.tasks {
            if !snapshot.groups.contains_key(&task.group) {
                return Err(SchedulerError::DanglingGroup {
                    task_id: task.id,
                    group_id: task.group,
                });
            }
        }

        let mut outcome = ScheduleOutcome::default();

        // Pool label -> independent scheduling universe. BTreeMap keeps the
        // partition walk deterministic.
        let mut partitions: BTreeMap<Option<&str>, Vec<&Task>> = BTreeMap::new();
        for task in &snapshot.tasks {
            partitions
                .entry(task.pool_label.as_deref())
                .or_default()
                .push(task);
        }

        outcome.stats.partitions = partitions.len();

        for (label, tasks) in partitions {
            let mut capacity: Vec<AgentCapacity> = snapshot
                .agents
                .iter()
                .filter(|a| a.pool_label.as_deref() == label)
                .map(AgentCapacity::from_agent)
                .collect();

            let pending: Vec<&Task> = tasks.iter().copied().filter(|t| t.is_pending()).collect();
            outcome.stats.pending_considered += pending.len();

            if pending.is_empty() {
                continue;
            }

            if capacity.is_empty() {
                // No agent carries this label; its tasks are unschedulable
                // this cycle but other partitions are unaffected.
                warn!(
                    pool_label = label.unwrap_or("<none>"),
                    pending = pending.len(),
                    "no agents match pool label, tasks unschedulable"
                );
                outcome.stats.unplaced += pending.len();
                continue;
            }

            for kind in [PoolKind::ZeroSlot, PoolKind::Positive] {
                self.schedule_pool(kind, snapshot, &pending, tasks.as_slice(), &mut capacity, &mut outcome);
            }
        }

        info!(
            partitions = outcome.stats.partitions,
            admitted = outcome.stats.admitted,
            preempted = outcome.stats.preempted,
            unplaced = outcome.stats.unplaced,
            "admission cycle computed"
        );

        Ok(outcome)
    }

    /// Schedules one pool (zero-slot or positive) of one partition.
    fn schedule_pool(
        &self,
        kind: PoolKind,
        snapshot: &ClusterSnapshot,
        pending: &[&Task],
        partition_tasks: &[&Task],
        capacity: &mut Vec<AgentCapacity>,
        outcome: &mut ScheduleOutcome,
    ) {
        let in_pool = |t: &Task| match kind {
            PoolKind::ZeroSlot => t.is_zero_slot(),
            PoolKind::Positive => !t.is_zero_slot(),
        };

        // Priority level -> tasks, ascending by priority value. Snapshot
        // tasks arrive in submission order, preserved within a level.
        let mut levels: BTreeMap<i32, Vec<&Task>> = BTreeMap::new();
        for task in pending.iter().copied().filter(|t| in_pool(t)) {
            let priority = snapshot.groups[&task.group].priority;
            levels.entry(priority).or_default().push(task);
        }

        let mut preempted: HashSet<TaskId> = outcome.to_preempt.iter().copied().collect();

        for (priority, level) in levels {
            let mut level_blocked = false;

            for task in level {
                if self.exceeds_partition_capacity(kind, task, capacity) {
                    // No finite amount of preemption satisfies this task.
                    debug!(task_id = %task.id, slots = task.slots_needed, "demand exceeds partition capacity");
                    level_blocked = true;
                    outcome.stats.unplaced += 1;
                    continue;
                }

                if let Some(idx) = self.try_fit(kind, task, capacity) {
                    reserve(kind, task, &mut capacity[idx]);
                    outcome.to_admit.push(Admission {
                        task_id: task.id,
                        agent_id: capacity[idx].agent_id,
                    });
                    outcome.stats.admitted += 1;
                    continue;
                }

                if self.preemption_enabled {
                    self.try_preempt(
                        kind,
                        snapshot,
                        task,
                        priority,
                        partition_tasks,
                        capacity,
                        &mut preempted,
                        outcome,
                    );
                }

                // Admittable at the earliest on a later cycle, after victim
                // releases are observed.
                level_blocked = true;
                outcome.stats.unplaced += 1;
            }

            if level_blocked {
                // No cross-priority backfill: lower levels of this pool are
                // not attempted this cycle.
                debug!(priority, pool = ?kind, "level left tasks unplaced, halting lower levels");
                break;
            }
        }
    }

    fn exceeds_partition_capacity(
        &self,
        kind: PoolKind,
        task: &Task,
        capacity: &[AgentCapacity],
    ) -> bool {
        match kind {
            PoolKind::Positive => {
                task.slots_needed > capacity.iter().map(|a| a.total_slots).sum::<u32>()
            }
            PoolKind::ZeroSlot => capacity.iter().map(|a| a.total_zero_slot_quota).sum::<u32>() == 0,
        }
    }

    fn try_fit(&self, kind: PoolKind, task: &Task, capacity: &[AgentCapacity]) -> Option<usize> {
        match kind {
            PoolKind::Positive => self.policy.select_slots(task.slots_needed, capacity),
            PoolKind::ZeroSlot => self.policy.select_zero_slot(capacity),
        }
    }

    /// Selects victims so `task` would fit, or changes nothing.
    ///
    /// Eligible victims are started tasks of the same partition and pool at
    /// strictly lower priority (numerically higher). Lowest priority first;
    /// within a priority the most recently allocated first, so the oldest
    /// work keeps running. Victims are released into the working capacity
    /// and the triggering task's demand is reserved there, so the rest of
    /// the level neither re-selects a victim nor double-counts freed
    /// capacity. The task itself is not admitted this cycle.
    #[allow(clippy::too_many_arguments)]
    fn try_preempt(
        &self,
        kind: PoolKind,
        snapshot: &ClusterSnapshot,
        task: &Task,
        priority: i32,
        partition_tasks: &[&Task],
        capacity: &mut Vec<AgentCapacity>,
        preempted: &mut HashSet<TaskId>,
        outcome: &mut ScheduleOutcome,
    ) {
        let in_pool = |t: &Task| match kind {
            PoolKind::ZeroSlot => t.is_zero_slot(),
            PoolKind::Positive => !t.is_zero_slot(),
        };

        let mut candidates: Vec<&Task> = partition_tasks
            .iter()
            .copied()
            .filter(|t| {
                t.container_started
                    && t.allocation.is_some()
                    && in_pool(t)
                    && !preempted.contains(&t.id)
                    && snapshot.groups[&t.group].priority > priority
            })
            .collect();

        candidates.sort_by(|a, b| {
            let pa = snapshot.groups[&a.group].priority;
            let pb = snapshot.groups[&b.group].priority;
            pb.cmp(&pa)
                .then_with(|| {
                    let ta = a.allocation.as_ref().map(|al| al.created_at);
                    let tb = b.allocation.as_ref().map(|al| al.created_at);
                    tb.cmp(&ta)
                })
                .then_with(|| b.id.cmp(&a.id))
        });

        let mut victims: Vec<&Task> = Vec::new();
        let mut fit: Option<usize> = None;

        for victim in candidates {
            let Some(allocation) = victim.allocation.as_ref() else {
                continue;
            };
            let Some(idx) = capacity.iter().position(|a| a.agent_id == allocation.agent) else {
                continue;
            };
            release(kind, victim, &mut capacity[idx]);
            victims.push(victim);

            if let Some(idx) = self.try_fit(kind, task, capacity) {
                fit = Some(idx);
                break;
            }
        }

        match fit {
            Some(idx) => {
                reserve(kind, task, &mut capacity[idx]);
                for victim in victims {
                    debug!(task_id = %task.id, victim = %victim.id, "selected preemption victim");
                    preempted.insert(victim.id);
                    outcome.to_preempt.push(victim.id);
                    outcome.stats.preempted += 1;
                }
            }
            None => {
                // Lower-priority capacity alone cannot satisfy the task;
                // undo the simulated releases.
                for victim in victims {
                    let Some(allocation) = victim.allocation.as_ref() else {
                        continue;
                    };
                    if let Some(idx) = capacity.iter().position(|a| a.agent_id == allocation.agent)
                    {
                        reserve(kind, victim, &mut capacity[idx]);
                    }
                }
            }
        }
    }
}

fn reserve(kind: PoolKind, task: &Task, agent: &mut AgentCapacity) {
    match kind {
        PoolKind::Positive => agent.remaining_slots -= task.slots_needed,
        PoolKind::ZeroSlot => agent.remaining_zero_slot_quota -= 1,
    }
}

fn release(kind: PoolKind, task: &Task, agent: &mut AgentCapacity) {
    match kind {
        PoolKind::Positive => agent.remaining_slots += task.slots_needed,
        PoolKind::ZeroSlot => agent.remaining_zero_slot_quota += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Agent, Allocation, Group};
    use crate::scheduler::BestFit;
    use chrono::{Duration, Utc};
    use mlgrid_id::AllocationId;

    struct Fixture {
        snapshot: ClusterSnapshot,
        tick: i64,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                snapshot: ClusterSnapshot::default(),
                tick: 0,
            }
        }

        fn group(&mut self, priority: i32) -> GroupId {
            let group = Group {
                id: GroupId::new(),
                priority,
            };
            let id = group.id;
            self.snapshot.groups.insert(id, group);
            id
        }

        fn agent(&mut self, slots: u32, quota: u32, label: Option<&str>) -> AgentId {
            let agent = Agent {
                id: AgentId::new(),
                slots,
                zero_slot_capacity: quota,
                used_slots: 0,
                zero_slot_containers: 0,
                pool_label: label.map(String::from),
            };
            let id = agent.id;
            self.snapshot.agents.push(agent);
            id
        }

        fn pending(&mut self, group: GroupId, slots: u32, label: Option<&str>) -> TaskId {
            self.tick += 1;
            let task = Task {
                id: TaskId::new(),
                group,
                slots_needed: slots,
                rank: 0,
                submitted_at: Utc::now() + Duration::seconds(self.tick),
                pool_label: label.map(String::from),
                allocation: None,
                container_started: false,
            };
            let id = task.id;
            self.snapshot.tasks.push(task);
            id
        }

        fn running(&mut self, group: GroupId, slots: u32, agent: AgentId) -> TaskId {
            self.tick += 1;
            let task = Task {
                id: TaskId::new(),
                group,
                slots_needed: slots,
                rank: 0,
                submitted_at: Utc::now() + Duration::seconds(self.tick),
                pool_label: None,
                allocation: Some(Allocation {
                    id: AllocationId::new(),
                    agent,
                    created_at: Utc::now() + Duration::seconds(self.tick),
                }),
                container_started: true,
            };
            let id = task.id;
            // Running tasks consume live capacity in the snapshot.
            let a = self
                .snapshot
                .agents
                .iter_mut()
                .find(|a| a.id == agent)
                .unwrap();
            if slots == 0 {
                a.zero_slot_containers += 1;
            } else {
                a.used_slots += slots;
            }
            self.snapshot.tasks.push(task);
            id
        }
    }

    fn schedule(fixture: &Fixture, preemption: bool) -> ScheduleOutcome {
        PriorityScheduler::new(BestFit, preemption)
            .schedule(&fixture.snapshot)
            .unwrap()
    }

    fn admitted(outcome: &ScheduleOutcome) -> Vec<TaskId> {
        outcome.to_admit.iter().map(|a| a.task_id).collect()
    }

    #[test]
    fn dangling_group_rejects_the_cycle() {
        let mut fixture = Fixture::new();
        fixture.agent(4, 1, None);
        fixture.pending(GroupId::new(), 1, None);
        let err = PriorityScheduler::new(BestFit, false)
            .schedule(&fixture.snapshot)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DanglingGroup { .. }));
    }

    #[test]
    fn higher_priority_level_is_served_first() {
        let mut fixture = Fixture::new();
        fixture.agent(4, 4, None);
        let p50 = fixture.group(50);
        let p40 = fixture.group(40);
        let low = fixture.pending(p50, 3, None);
        let high = fixture.pending(p40, 3, None);

        let outcome = schedule(&fixture, false);
        // Only one fits; priority 40 wins even though it was submitted later.
        assert_eq!(admitted(&outcome), vec![high]);
        let _ = low;
    }

    #[test]
    fn non_fit_does_not_block_same_level_siblings() {
        let mut fixture = Fixture::new();
        fixture.agent(4, 4, None);
        let p50 = fixture.group(50);
        let wide = fixture.pending(p50, 4, None);
        let narrow = fixture.pending(p50, 4, None);

        let outcome = schedule(&fixture, false);
        assert_eq!(admitted(&outcome), vec![wide]);
        assert_eq!(outcome.stats.unplaced, 1);
        let _ = narrow;
    }

    #[test]
    fn blocked_level_halts_lower_levels() {
        // Both p50 tasks would fit individually, but the unfit 12-slot task
        // blocks its own level and everything below it.
        let mut fixture = Fixture::new();
        fixture.agent(4, 4, None);
        fixture.agent(4, 4, None);
        let p50 = fixture.group(50);
        let p40 = fixture.group(40);
        fixture.pending(p50, 4, None);
        fixture.pending(p50, 1, None);
        fixture.pending(p40, 12, None);

        let outcome = schedule(&fixture, false);
        assert!(outcome.to_admit.is_empty());
        assert!(outcome.to_preempt.is_empty());
    }

    #[test]
    fn oversized_task_never_preempts() {
        let mut fixture = Fixture::new();
        let agent = fixture.agent(4, 4, None);
        let p50 = fixture.group(50);
        let p40 = fixture.group(40);
        fixture.running(p50, 4, agent);
        fixture.pending(p40, 12, None);

        let outcome = schedule(&fixture, true);
        assert!(outcome.to_admit.is_empty());
        assert!(outcome.to_preempt.is_empty());
    }

    #[test]
    fn preemption_frees_lower_priority_capacity() {
        let mut fixture = Fixture::new();
        let agent = fixture.agent(4, 4, None);
        let p50 = fixture.group(50);
        let p40 = fixture.group(40);
        let victim = fixture.running(p50, 4, agent);
        let zero = fixture.pending(p50, 0, None);
        let wide = fixture.pending(p40, 4, None);

        let outcome = schedule(&fixture, true);
        // The zero-slot pool is independent and admits; the positive task
        // only selects its victim.
        assert_eq!(admitted(&outcome), vec![zero]);
        assert_eq!(outcome.to_preempt, vec![victim]);
        let _ = wide;
    }

    #[test]
    fn preemption_never_selects_equal_or_higher_priority() {
        let mut fixture = Fixture::new();
        let agent = fixture.agent(4, 4, None);
        let p40 = fixture.group(40);
        let p40_b = fixture.group(40);
        fixture.running(p40, 4, agent);
        fixture.pending(p40_b, 4, None);

        let outcome = schedule(&fixture, true);
        assert!(outcome.to_admit.is_empty());
        assert!(outcome.to_preempt.is_empty());
    }

    #[test]
    fn preemption_victims_are_most_recently_allocated_first() {
        let mut fixture = Fixture::new();
        let agent = fixture.agent(4, 4, None);
        let p50 = fixture.group(50);
        let p40 = fixture.group(40);
        let older = fixture.running(p50, 2, agent);
        let newer = fixture.running(p50, 2, agent);
        fixture.pending(p40, 2, None);

        let outcome = schedule(&fixture, true);
        assert_eq!(outcome.to_preempt, vec![newer]);
        let _ = older;
    }

    #[test]
    fn zero_slot_preemption_uses_quota_dimension() {
        let mut fixture = Fixture::new();
        let agent = fixture.agent(4, 1, None);
        let p50 = fixture.group(50);
        let p40 = fixture.group(40);
        let victim = fixture.running(p50, 0, agent);
        fixture.pending(p40, 0, None);

        let outcome = schedule(&fixture, true);
        assert!(outcome.to_admit.is_empty());
        assert_eq!(outcome.to_preempt, vec![victim]);
    }

    #[test]
    fn unmatched_label_does_not_block_other_partitions() {
        let mut fixture = Fixture::new();
        fixture.agent(4, 4, Some("A"));
        fixture.agent(4, 4, Some("A"));
        let p50 = fixture.group(50);
        let p40 = fixture.group(40);
        let a1 = fixture.pending(p50, 4, Some("A"));
        let a2 = fixture.pending(p50, 1, Some("A"));
        fixture.pending(p40, 4, Some("B"));

        let outcome = schedule(&fixture, false);
        let mut got = admitted(&outcome);
        got.sort();
        let mut want = vec![a1, a2];
        want.sort();
        assert_eq!(got, want);
    }
}
