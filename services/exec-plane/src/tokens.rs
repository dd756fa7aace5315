//! Admission token pool bounding concurrent substrate create operations.
//!
//! Batch admissions can put hundreds of create calls in flight at once;
//! the pool caps them. A task actor requests a token before touching the
//! substrate and releases it when its creates finish. Grants arrive as
//! ordinary actor messages, so a stopping actor never blocks on a grant
//! that will not come: `release` removes it from the wait queue instead.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tracing::{debug, warn};

use mlgrid_id::TaskId;

use crate::actors::{ActorHandle, Message};

/// Grant of one admission slot, delivered to the requester's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenGrant;

struct PoolState<M: Message> {
    available: usize,
    holders: HashSet<TaskId>,
    waiters: VecDeque<(TaskId, ActorHandle<M>)>,
}

/// Bounded pool of substrate-create tokens.
///
/// Contract: exactly one grant per outstanding request; `release` is safe
/// from every caller state (queued, granted-but-unconsumed, done) and never
/// leaks capacity.
pub struct AdmissionTokenPool<M: Message + From<TokenGrant>> {
    capacity: usize,
    // Never held across an await; grant delivery uses try_send.
    state: Mutex<PoolState<M>>,
}

impl<M: Message + From<TokenGrant>> AdmissionTokenPool<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(PoolState {
                available: capacity,
                holders: HashSet::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests a token for `task`. The grant is sent to `handle` either
    /// immediately or when a slot frees up.
    pub fn request(&self, task: TaskId, handle: ActorHandle<M>) {
        let mut state = self.state.lock().unwrap();
        if state.available > 0 {
            state.available -= 1;
            Self::grant(&mut state, task, &handle);
        } else {
            debug!(task_id = %task, "admission token pool exhausted, queueing");
            state.waiters.push_back((task, handle));
        }
    }

    /// Returns `task`'s slot, whatever state its request is in.
    pub fn release(&self, task: TaskId) {
        let mut state = self.state.lock().unwrap();
        if state.holders.remove(&task) {
            Self::grant_next(&mut state);
            return;
        }
        // Not a holder: drop a queued request if one exists. Anything else
        // is a stale release and a no-op.
        state.waiters.retain(|(t, _)| *t != task);
    }

    /// Tokens currently available, for introspection.
    pub fn available(&self) -> usize {
        self.state.lock().unwrap().available
    }

    fn grant(state: &mut PoolState<M>, task: TaskId, handle: &ActorHandle<M>) {
        if handle.try_send(M::from(TokenGrant)).is_ok() {
            state.holders.insert(task);
        } else {
            // Requester died before the grant landed; the slot goes to the
            // next waiter.
            warn!(task_id = %task, "token grant undeliverable, recycling slot");
            Self::grant_next(state);
        }
    }

    fn grant_next(state: &mut PoolState<M>) {
        while let Some((task, handle)) = state.waiters.pop_front() {
            if handle.try_send(M::from(TokenGrant)).is_ok() {
                state.holders.insert(task);
                return;
            }
            warn!(task_id = %task, "queued token requester gone, skipping");
        }
        state.available += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{spawn_actor, Actor, ActorContext, ActorError};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum TestMsg {
        Grant,
    }

    impl From<TokenGrant> for TestMsg {
        fn from(_: TokenGrant) -> Self {
            TestMsg::Grant
        }
    }

    struct Recorder {
        grants_tx: mpsc::UnboundedSender<TaskId>,
        task: TaskId,
    }

    #[async_trait]
    impl Actor for Recorder {
        type Message = TestMsg;

        fn name(&self) -> &str {
            "recorder"
        }

        async fn handle(
            &mut self,
            _msg: TestMsg,
            _ctx: &mut ActorContext,
        ) -> Result<bool, ActorError> {
            let _ = self.grants_tx.send(self.task);
            Ok(true)
        }
    }

    fn recorder(
        pool_task: TaskId,
        grants_tx: mpsc::UnboundedSender<TaskId>,
    ) -> crate::actors::ActorHandle<TestMsg> {
        let (handle, _ref) = spawn_actor(
            Recorder {
                grants_tx,
                task: pool_task,
            },
            16,
        );
        handle
    }

    #[tokio::test]
    async fn grants_up_to_capacity_then_queues() {
        let pool = AdmissionTokenPool::<TestMsg>::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = TaskId::new();
        let second = TaskId::new();
        pool.request(first, recorder(first, tx.clone()));
        pool.request(second, recorder(second, tx.clone()));

        assert_eq!(rx.recv().await.unwrap(), first);
        assert_eq!(pool.available(), 0);

        pool.release(first);
        assert_eq!(rx.recv().await.unwrap(), second);

        pool.release(second);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn release_while_queued_removes_from_wait_set() {
        let pool = AdmissionTokenPool::<TestMsg>::new(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = TaskId::new();
        let second = TaskId::new();
        let third = TaskId::new();
        pool.request(first, recorder(first, tx.clone()));
        pool.request(second, recorder(second, tx.clone()));
        pool.request(third, recorder(third, tx.clone()));

        assert_eq!(rx.recv().await.unwrap(), first);

        // The queued second caller stops waiting; its slot must not leak and
        // the third caller is served next.
        pool.release(second);
        pool.release(first);
        assert_eq!(rx.recv().await.unwrap(), third);
    }

    #[tokio::test]
    async fn stale_release_is_a_noop() {
        let pool = AdmissionTokenPool::<TestMsg>::new(2);
        pool.release(TaskId::new());
        assert_eq!(pool.available(), 2);
    }
}
