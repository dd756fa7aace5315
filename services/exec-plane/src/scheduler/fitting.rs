//! Fitting policies: choosing an agent for one task's demand.

use mlgrid_id::AgentId;

use crate::cluster::Agent;

/// Working capacity counters for one agent during a scheduling cycle.
///
/// The scheduler mutates these as it reserves and releases capacity; the
/// underlying snapshot stays untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCapacity {
    pub agent_id: AgentId,
    pub total_slots: u32,
    pub total_zero_slot_quota: u32,
    pub remaining_slots: u32,
    pub remaining_zero_slot_quota: u32,
}

impl AgentCapacity {
    pub fn from_agent(agent: &Agent) -> Self {
        Self {
            agent_id: agent.id,
            total_slots: agent.slots,
            total_zero_slot_quota: agent.zero_slot_capacity,
            remaining_slots: agent.remaining_slots(),
            remaining_zero_slot_quota: agent.remaining_zero_slot_quota(),
        }
    }
}

/// Chooses a candidate agent for a demand against a capacity view.
///
/// Pure selection: implementations must not assume the returned reservation
/// is taken, and ties must break on the stable agent order of the input.
pub trait FittingPolicy: Send + Sync {
    /// Agent index for a positive slot demand, or `None` if nothing fits.
    fn select_slots(&self, demand: u32, agents: &[AgentCapacity]) -> Option<usize>;

    /// Agent index for a zero-slot task, or `None` if no quota remains.
    fn select_zero_slot(&self, agents: &[AgentCapacity]) -> Option<usize>;
}

/// Best-fit policy: tightest remaining slots wins.
///
/// Packing positive tasks tightly keeps the largest contiguous block of
/// slots free for wide gangs. Zero-slot tasks take the first agent with
/// spare quota.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestFit;

impl FittingPolicy for BestFit {
    fn select_slots(&self, demand: u32, agents: &[AgentCapacity]) -> Option<usize> {
        debug_assert!(demand > 0);
        let mut best: Option<(usize, u32)> = None;
        for (idx, agent) in agents.iter().enumerate() {
            if agent.remaining_slots < demand {
                continue;
            }
            let left_over = agent.remaining_slots - demand;
            match best {
                Some((_, best_left)) if best_left <= left_over => {}
                _ => best = Some((idx, left_over)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    fn select_zero_slot(&self, agents: &[AgentCapacity]) -> Option<usize> {
        agents
            .iter()
            .position(|a| a.remaining_zero_slot_quota > 0)
    }
}
