//! Admission-cycle behavior of the priority scheduler over realistic
//! cluster snapshots.

use chrono::{Duration, Utc};
use rstest::rstest;

use mlgrid_exec_plane::cluster::{Agent, Allocation, ClusterSnapshot, Group, Task};
use mlgrid_exec_plane::scheduler::{BestFit, PriorityScheduler, ScheduleOutcome};
use mlgrid_id::{AgentId, AllocationId, GroupId, TaskId};

struct Cluster {
    snapshot: ClusterSnapshot,
    tick: i64,
}

impl Cluster {
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

    fn agent(&mut self, slots: u32, zero_slot_capacity: u32, label: Option<&str>) -> AgentId {
        let agent = Agent {
            id: AgentId::new(),
            slots,
            zero_slot_capacity,
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

    fn running(&mut self, group: GroupId, slots: u32, agent_id: AgentId) -> TaskId {
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
                agent: agent_id,
                created_at: Utc::now() + Duration::seconds(self.tick),
            }),
            container_started: true,
        };
        let agent = self
            .snapshot
            .agents
            .iter_mut()
            .find(|a| a.id == agent_id)
            .unwrap();
        if slots == 0 {
            agent.zero_slot_containers += 1;
        } else {
            agent.used_slots += slots;
        }
        let id = task.id;
        self.snapshot.tasks.push(task);
        id
    }

    fn schedule(&self, preemption: bool) -> ScheduleOutcome {
        PriorityScheduler::new(BestFit, preemption)
            .schedule(&self.snapshot)
            .unwrap()
    }
}

fn admitted(outcome: &ScheduleOutcome) -> Vec<TaskId> {
    outcome.to_admit.iter().map(|a| a.task_id).collect()
}

#[test]
fn mixed_priorities_admit_everything_that_fits() {
    // 2 agents x 4 slots. Of {4@p50, 1@p50, 1@p40, 0@p40, 4@p40, 0@p50}
    // only the wide p50 task is left behind: the p40 level consumes 5 slots
    // and a skipped task never blocks its level siblings.
    let mut cluster = Cluster::new();
    cluster.agent(4, 4, None);
    cluster.agent(4, 4, None);
    let p50 = cluster.group(50);
    let p40 = cluster.group(40);

    let wide_p50 = cluster.pending(p50, 4, None);
    let one_p50 = cluster.pending(p50, 1, None);
    let one_p40 = cluster.pending(p40, 1, None);
    let zero_p40 = cluster.pending(p40, 0, None);
    let wide_p40 = cluster.pending(p40, 4, None);
    let zero_p50 = cluster.pending(p50, 0, None);

    let outcome = cluster.schedule(false);

    let got: std::collections::HashSet<_> = admitted(&outcome).into_iter().collect();
    let want: std::collections::HashSet<_> =
        [one_p50, one_p40, zero_p40, wide_p40, zero_p50].into_iter().collect();
    assert_eq!(got, want);
    assert!(!got.contains(&wide_p50));
    assert!(outcome.to_preempt.is_empty());
}

#[test]
fn decisions_are_proposals_and_mutate_nothing() {
    let mut cluster = Cluster::new();
    cluster.agent(4, 4, None);
    cluster.agent(4, 4, None);
    let p50 = cluster.group(50);
    cluster.pending(p50, 4, None);
    cluster.pending(p50, 1, None);

    let before = cluster.snapshot.agents.clone();
    let outcome = cluster.schedule(false);
    assert_eq!(outcome.to_admit.len(), 2);

    for (agent, original) in cluster.snapshot.agents.iter().zip(&before) {
        assert_eq!(agent.used_slots, original.used_slots);
        assert_eq!(agent.zero_slot_containers, original.zero_slot_containers);
    }
}

#[test]
fn unfit_task_halts_its_level_and_everything_below() {
    // Both p50 tasks fit individually, but the 12-slot p40 task cannot be
    // placed anywhere, which blocks the p40 level and (no backfill) the
    // whole p50 level too.
    let mut cluster = Cluster::new();
    cluster.agent(4, 4, None);
    cluster.agent(4, 4, None);
    let p50 = cluster.group(50);
    let p40 = cluster.group(40);
    cluster.pending(p50, 4, None);
    cluster.pending(p50, 1, None);
    cluster.pending(p40, 12, None);

    let outcome = cluster.schedule(false);
    assert!(outcome.to_admit.is_empty());
    assert!(outcome.to_preempt.is_empty());
}

#[rstest]
#[case(10)]
#[case(40)]
#[case(90)]
fn oversized_demand_never_admits_or_preempts(#[case] priority: i32) {
    let mut cluster = Cluster::new();
    let agent = cluster.agent(4, 4, None);
    let low = cluster.group(99);
    cluster.running(low, 4, agent);
    let group = cluster.group(priority);
    cluster.pending(group, 5, None);

    let outcome = cluster.schedule(true);
    assert!(outcome.to_admit.is_empty());
    assert!(outcome.to_preempt.is_empty());
}

#[test]
fn unmatched_pool_label_is_isolated() {
    // Agents only exist for pool "A"; the "B" task neither schedules nor
    // blocks the other partition, despite its higher priority.
    let mut cluster = Cluster::new();
    cluster.agent(4, 4, Some("A"));
    cluster.agent(4, 4, Some("A"));
    let p50 = cluster.group(50);
    let p40 = cluster.group(40);
    let wide_a = cluster.pending(p50, 4, Some("A"));
    let one_a = cluster.pending(p50, 1, Some("A"));
    let orphan_b = cluster.pending(p40, 4, Some("B"));

    let outcome = cluster.schedule(false);
    let got: std::collections::HashSet<_> = admitted(&outcome).into_iter().collect();
    assert_eq!(got, [wide_a, one_a].into_iter().collect());
    assert!(!got.contains(&orphan_b));
}

#[test]
fn zero_slot_pool_is_independent_of_blocked_positive_pool() {
    // The positive pool is saturated by a running task, yet zero-slot quota
    // remains, so zero-slot tasks at any priority are admitted.
    let mut cluster = Cluster::new();
    let agent = cluster.agent(4, 4, None);
    let p50 = cluster.group(50);
    let p40 = cluster.group(40);
    cluster.running(p50, 4, agent);
    let blocked = cluster.pending(p40, 2, None);
    let zero = cluster.pending(p50, 0, None);

    let outcome = cluster.schedule(false);
    assert_eq!(admitted(&outcome), vec![zero]);
    let _ = blocked;
}

#[test]
fn preemption_selects_lower_priority_victim_without_admitting() {
    let mut cluster = Cluster::new();
    let agent = cluster.agent(4, 4, None);
    let p50 = cluster.group(50);
    let p40 = cluster.group(40);
    let victim = cluster.running(p50, 4, agent);
    let zero = cluster.pending(p50, 0, None);
    let contender = cluster.pending(p40, 4, None);

    let outcome = cluster.schedule(true);
    // The zero-slot task is admitted; the wide p40 task only frees capacity
    // for a later cycle.
    assert_eq!(admitted(&outcome), vec![zero]);
    assert_eq!(outcome.to_preempt, vec![victim]);
    let _ = contender;
}

#[test]
fn zero_slot_contention_preempts_on_the_quota_dimension() {
    let mut cluster = Cluster::new();
    let agent = cluster.agent(4, 1, None);
    let p50 = cluster.group(50);
    let p40 = cluster.group(40);
    let victim = cluster.running(p50, 0, agent);
    cluster.pending(p40, 0, None);

    let outcome = cluster.schedule(true);
    assert!(outcome.to_admit.is_empty());
    assert_eq!(outcome.to_preempt, vec![victim]);
}

#[rstest]
fn preemption_disabled_never_selects_victims(#[values(0, 4)] slots: u32) {
    let mut cluster = Cluster::new();
    let agent = cluster.agent(4, 1, None);
    let p50 = cluster.group(50);
    let p40 = cluster.group(40);
    cluster.running(p50, slots, agent);
    cluster.pending(p40, slots, None);

    let outcome = cluster.schedule(false);
    assert!(outcome.to_admit.is_empty());
    assert!(outcome.to_preempt.is_empty());
}
