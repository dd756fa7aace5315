//! Execution plane - wires scheduler decisions to task actors.
//!
//! The plane owns the live cluster state, the per-task actor set, the
//! admission token pool and the feed routing table. One admission cycle
//! snapshots the state, runs the scheduler, and applies its proposals:
//! admissions become allocations plus freshly spawned actors, preemptions
//! become stop messages. Upward events from the actors flow through the
//! event pump, which keeps capacity accounting current and forwards
//! everything to the owning job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use mlgrid_events::{ContainerState, ExecPlaneEvent};
use mlgrid_id::{AgentId, TaskId};

use crate::actors::{
    spawn_actor, ActorHandle, ActorRef, PlacementSnapshot, TaskExecutionActor, TaskLaunchSpec,
    TaskMessage,
};
use crate::cluster::{Agent, ClusterError, ClusterState, Group, Task};
use crate::feed::ReconciliationFeed;
use crate::scheduler::{Admission, BestFit, CycleStats, PriorityScheduler, SchedulerError};
use crate::substrate::Substrate;
use crate::tokens::AdmissionTokenPool;

/// Errors from applying an admission cycle.
#[derive(Debug, Error)]
pub enum PlaneError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Knobs for the plane.
#[derive(Debug, Clone)]
pub struct PlaneConfig {
    pub admission_tokens: usize,
    pub preemption_enabled: bool,
    pub keep_resources: bool,
}

impl Default for PlaneConfig {
    fn default() -> Self {
        Self {
            admission_tokens: 8,
            preemption_enabled: false,
            keep_resources: false,
        }
    }
}

struct TaskRuntime {
    handle: ActorHandle<TaskMessage>,
    actor_ref: ActorRef,
    resource_name: String,
}

/// The live execution plane.
pub struct ExecutionPlane {
    state: Mutex<ClusterState>,
    scheduler: PriorityScheduler<BestFit>,
    substrate: Arc<dyn Substrate>,
    tokens: Arc<AdmissionTokenPool<TaskMessage>>,
    feed: Arc<ReconciliationFeed>,
    keep_resources: bool,

    /// Sender cloned into every actor.
    events_tx: mpsc::UnboundedSender<ExecPlaneEvent>,

    /// Events forwarded to the owning job after accounting.
    upward_tx: mpsc::UnboundedSender<ExecPlaneEvent>,

    actors: Mutex<HashMap<TaskId, TaskRuntime>>,
}

impl ExecutionPlane {
    /// Builds the plane. The returned receiver must be handed back to
    /// [`ExecutionPlane::run_event_pump`].
    pub fn new(
        substrate: Arc<dyn Substrate>,
        feed: Arc<ReconciliationFeed>,
        config: PlaneConfig,
        upward_tx: mpsc::UnboundedSender<ExecPlaneEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<ExecPlaneEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let plane = Self {
            state: Mutex::new(ClusterState::new()),
            scheduler: PriorityScheduler::new(BestFit, config.preemption_enabled),
            substrate,
            tokens: Arc::new(AdmissionTokenPool::new(config.admission_tokens)),
            feed,
            keep_resources: config.keep_resources,
            events_tx,
            upward_tx,
            actors: Mutex::new(HashMap::new()),
        };
        (plane, events_rx)
    }

    pub fn add_group(&self, group: Group) {
        self.state.lock().unwrap().add_group(group);
    }

    pub fn add_agent(&self, agent: Agent) {
        self.state.lock().unwrap().add_agent(agent);
    }

    pub fn submit_task(&self, task: Task) {
        debug!(task_id = %task.id, slots = task.slots_needed, "task submitted");
        self.state.lock().unwrap().submit_task(task);
    }

    /// Runs one admission cycle and applies its proposals.
    pub async fn run_cycle(&self) -> Result<CycleStats, PlaneError> {
        let snapshot = self.state.lock().unwrap().snapshot();
        let outcome = self.scheduler.schedule(&snapshot)?;
        let stats = outcome.stats;

        for admission in outcome.to_admit {
            if let Err(e) = self.admit(&admission).await {
                // One bad admission must not poison the rest of the cycle.
                warn!(task_id = %admission.task_id, error = %e, "admission could not be applied");
            }
        }

        for victim in outcome.to_preempt {
            info!(task_id = %victim, "preempting task");
            self.stop_task(victim).await;
        }

        Ok(stats)
    }

    async fn admit(&self, admission: &Admission) -> Result<(), PlaneError> {
        let Admission { task_id, agent_id } = *admission;

        let spec = {
            let mut state = self.state.lock().unwrap();
            state.allocate(task_id, agent_id)?;
            let task = state.task(task_id).ok_or(ClusterError::UnknownTask(task_id))?;
            TaskLaunchSpec {
                task_id,
                group_id: task.group,
                rank: task.rank,
                slots: task.slots_needed,
            }
        };

        info!(task_id = %task_id, agent_id = %agent_id, "task admitted");
        self.spawn_task_actor(spec);
        Ok(())
    }

    fn spawn_task_actor(&self, spec: TaskLaunchSpec) {
        let task_id = spec.task_id;
        let actor = TaskExecutionActor::new(
            spec,
            Arc::clone(&self.substrate),
            Arc::clone(&self.tokens),
            self.events_tx.clone(),
            self.keep_resources,
        );
        let resource_name = actor.resource_name().to_string();
        let (handle, actor_ref) = spawn_actor(actor, 64);

        // Route feed events before the first substrate call can produce any.
        self.feed.register(resource_name.clone(), handle.clone());

        if handle
            .try_send(TaskMessage::Launch {
                handle: handle.clone(),
            })
            .is_err()
        {
            warn!(task_id = %task_id, "task actor rejected launch message");
        }

        self.actors.lock().unwrap().insert(
            task_id,
            TaskRuntime {
                handle,
                actor_ref,
                resource_name,
            },
        );
    }

    /// Stops one task's actor; teardown and state cleanup follow through
    /// the event pump.
    pub async fn stop_task(&self, task_id: TaskId) {
        let handle = {
            let actors = self.actors.lock().unwrap();
            actors.get(&task_id).map(|rt| rt.handle.clone())
        };
        match handle {
            Some(handle) => {
                if handle.send(TaskMessage::Stop).await.is_err() {
                    debug!(task_id = %task_id, "stop for already-exited actor");
                }
            }
            None => debug!(task_id = %task_id, "stop for unknown task ignored"),
        }
    }

    /// Substrate-reported placement of a task, if its actor is alive.
    pub async fn placement(&self, task_id: TaskId) -> Option<PlacementSnapshot> {
        let handle = {
            let actors = self.actors.lock().unwrap();
            actors.get(&task_id).map(|rt| rt.handle.clone())
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        handle?
            .send(TaskMessage::Placement { reply: reply_tx })
            .await
            .ok()?;
        reply_rx.await.ok()
    }

    /// Consumes actor events: accounting first, then forward upward.
    pub async fn run_event_pump(
        &self,
        mut events_rx: mpsc::UnboundedReceiver<ExecPlaneEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }

                event = events_rx.recv() => match event {
                    Some(event) => self.apply_event(event),
                    None => break,
                },
            }
        }
    }

    fn apply_event(&self, event: ExecPlaneEvent) {
        if let ExecPlaneEvent::Lifecycle(lifecycle) = &event {
            match lifecycle.state {
                ContainerState::Running => {
                    if let Err(e) = self.state.lock().unwrap().mark_started(lifecycle.task_id) {
                        warn!(task_id = %lifecycle.task_id, error = %e, "running report for unknown task");
                    }
                }
                ContainerState::Terminated => {
                    self.state.lock().unwrap().remove_task(lifecycle.task_id);
                    if let Some(runtime) = self.actors.lock().unwrap().remove(&lifecycle.task_id) {
                        self.feed.unregister(&runtime.resource_name);
                    }
                }
                _ => {}
            }
        }

        if self.upward_tx.send(event).is_err() {
            debug!("job owner channel closed, dropping event");
        }
    }

    /// Stops every task actor, aborting stragglers at the deadline.
    pub async fn stop_all(&self, deadline: Duration) {
        let drained: Vec<(TaskId, TaskRuntime)> = {
            let mut actors = self.actors.lock().unwrap();
            actors.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "stopping all task actors");

        for (_, runtime) in &drained {
            let _ = runtime.handle.try_send(TaskMessage::Stop);
        }

        let started = Instant::now();
        for (task_id, runtime) in drained {
            while runtime.actor_ref.is_running() && started.elapsed() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            if runtime.actor_ref.is_running() {
                warn!(task_id = %task_id, "task actor missed shutdown deadline, aborting");
                runtime.actor_ref.abort();
            }
            self.feed.unregister(&runtime.resource_name);
        }
    }
}
