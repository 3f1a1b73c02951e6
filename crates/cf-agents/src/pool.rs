//! Worker-agent pool.
//!
//! Capacity is a counting semaphore of `max_concurrent` permits; membership
//! mutates under one mutex. Agents are reused per `(project, role)` when
//! idle and created on demand otherwise. Every lifecycle transition is
//! persisted through the store, which broadcasts the deltas.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

use cf_core::store::{Result as StoreResult, Store};
use cf_core::types::{AgentRecord, AgentRole, AgentStatus, Id};

// ---------------------------------------------------------------------------
// PoolSlot
// ---------------------------------------------------------------------------

/// One unit of execution capacity bound to an agent. Dropping the slot
/// without `release` frees the capacity but leaves the agent row as-is, so
/// always route slots back through the pool.
pub struct PoolSlot {
    pub agent: AgentRecord,
    _permit: OwnedSemaphorePermit,
}

// ---------------------------------------------------------------------------
// AgentPool
// ---------------------------------------------------------------------------

pub struct AgentPool {
    store: Arc<Store>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    idle: Mutex<HashMap<(Id, AgentRole), Vec<Id>>>,
    /// Signalled whenever capacity frees up, so coordinator loops parked on
    /// a saturated pool re-enter their dispatch pass.
    released: Notify,
}

impl AgentPool {
    pub fn new(store: Arc<Store>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            store,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            idle: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Await the next capacity release.
    pub async fn slot_released(&self) {
        self.released.notified().await;
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Free capacity right now.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Acquire capacity without waiting. Returns `None` when the pool is
    /// saturated; the scheduler then parks until a completion frees a slot.
    pub async fn try_acquire(
        &self,
        project_id: Id,
        role: AgentRole,
    ) -> StoreResult<Option<PoolSlot>> {
        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            return Ok(None);
        };
        let agent = self.get_or_create(project_id, role).await?;
        Ok(Some(PoolSlot {
            agent,
            _permit: permit,
        }))
    }

    /// Acquire capacity, suspending until a slot frees up.
    pub async fn acquire(&self, project_id: Id, role: AgentRole) -> StoreResult<PoolSlot> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("pool semaphore closed");
        let agent = self.get_or_create(project_id, role).await?;
        Ok(PoolSlot {
            agent,
            _permit: permit,
        })
    }

    async fn get_or_create(&self, project_id: Id, role: AgentRole) -> StoreResult<AgentRecord> {
        let reusable = {
            let mut idle = self.idle.lock().expect("pool membership lock poisoned");
            idle.get_mut(&(project_id, role)).and_then(Vec::pop)
        };
        match reusable {
            Some(agent_id) => self.store.get_agent(agent_id).await,
            None => {
                let agent = self.store.create_agent(project_id, role).await?;
                tracing::debug!(agent_id = agent.id, role = %role, project_id, "agent created");
                Ok(agent)
            }
        }
    }

    /// Persist the agent as busy on a task. Call after the task claim
    /// succeeded so the `busy requires current_task_id` invariant holds.
    pub async fn mark_busy(&self, slot: &PoolSlot, task_id: Id) -> StoreResult<()> {
        self.store
            .update_agent_status(slot.agent.id, AgentStatus::Idle, AgentStatus::Busy, Some(task_id))
            .await?;
        Ok(())
    }

    /// Return an agent to idle and free its capacity.
    pub async fn release(&self, slot: PoolSlot) -> StoreResult<()> {
        let PoolSlot { agent, _permit } = slot;
        let agent = self.store.get_agent(agent.id).await?;
        if agent.status == AgentStatus::Busy {
            self.store
                .update_agent_status(agent.id, AgentStatus::Busy, AgentStatus::Idle, None)
                .await?;
        }
        {
            let mut idle = self.idle.lock().expect("pool membership lock poisoned");
            idle.entry((agent.project_id, agent.role))
                .or_default()
                .push(agent.id);
        }
        drop(_permit);
        self.released.notify_waiters();
        Ok(())
    }

    /// Recover an agent whose slot future was aborted (the permit already
    /// freed itself when the future dropped). Resets the record to idle and
    /// makes the agent reusable.
    pub async fn release_abandoned(&self, agent_id: Id) -> StoreResult<()> {
        let agent = self.store.get_agent(agent_id).await?;
        if agent.status == AgentStatus::Busy {
            self.store
                .update_agent_status(agent_id, AgentStatus::Busy, AgentStatus::Idle, None)
                .await?;
        }
        {
            let mut idle = self.idle.lock().expect("pool membership lock poisoned");
            idle.entry((agent.project_id, agent.role))
                .or_default()
                .push(agent_id);
        }
        self.released.notify_waiters();
        Ok(())
    }

    /// Stop and forget every idle agent of a project (session teardown).
    pub async fn retire_idle(&self, project_id: Id) -> StoreResult<()> {
        let to_retire: Vec<Id> = {
            let mut idle = self.idle.lock().expect("pool membership lock poisoned");
            let keys: Vec<(Id, AgentRole)> = idle
                .keys()
                .filter(|(pid, _)| *pid == project_id)
                .copied()
                .collect();
            keys.into_iter()
                .flat_map(|k| idle.remove(&k).unwrap_or_default())
                .collect()
        };
        for agent_id in to_retire {
            self.store
                .update_agent_status(agent_id, AgentStatus::Idle, AgentStatus::Stopping, None)
                .await?;
            self.store
                .update_agent_status(agent_id, AgentStatus::Stopping, AgentStatus::Stopped, None)
                .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::store::NewProject;
    use cf_core::types::SourceType;

    async fn pool_with_project(max: usize) -> (Arc<Store>, AgentPool, Id) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let project = store
            .create_project(NewProject {
                name: "p".into(),
                description: String::new(),
                source_type: SourceType::Empty,
                source_location: None,
                source_branch: None,
                workspace_path: "/tmp/pool-test".into(),
            })
            .await
            .unwrap();
        let pool = AgentPool::new(store.clone(), max);
        (store, pool, project.id)
    }

    #[tokio::test]
    async fn capacity_is_bounded_by_max_concurrent() {
        let (_store, pool, project_id) = pool_with_project(2).await;
        let a = pool
            .try_acquire(project_id, AgentRole::Backend)
            .await
            .unwrap()
            .unwrap();
        let _b = pool
            .try_acquire(project_id, AgentRole::Frontend)
            .await
            .unwrap()
            .unwrap();
        assert!(pool
            .try_acquire(project_id, AgentRole::Test)
            .await
            .unwrap()
            .is_none());

        pool.release(a).await.unwrap();
        assert!(pool
            .try_acquire(project_id, AgentRole::Test)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn idle_agents_are_reused_per_role() {
        let (store, pool, project_id) = pool_with_project(3).await;
        let slot = pool
            .try_acquire(project_id, AgentRole::Backend)
            .await
            .unwrap()
            .unwrap();
        let first_id = slot.agent.id;
        pool.release(slot).await.unwrap();

        let again = pool
            .try_acquire(project_id, AgentRole::Backend)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.agent.id, first_id);

        // a different role spawns a fresh agent
        let other = pool
            .try_acquire(project_id, AgentRole::Review)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(other.agent.id, first_id);
        assert_eq!(store.list_agents(project_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn busy_and_release_update_the_record() {
        let (store, pool, project_id) = pool_with_project(1).await;
        let slot = pool
            .try_acquire(project_id, AgentRole::Backend)
            .await
            .unwrap()
            .unwrap();
        pool.mark_busy(&slot, 42).await.unwrap();

        let busy = store.get_agent(slot.agent.id).await.unwrap();
        assert_eq!(busy.status, AgentStatus::Busy);
        assert_eq!(busy.current_task_id, Some(42));

        let agent_id = slot.agent.id;
        pool.release(slot).await.unwrap();
        let idle = store.get_agent(agent_id).await.unwrap();
        assert_eq!(idle.status, AgentStatus::Idle);
        assert_eq!(idle.current_task_id, None);
    }

    #[tokio::test]
    async fn retire_idle_stops_agents() {
        let (store, pool, project_id) = pool_with_project(2).await;
        let slot = pool
            .try_acquire(project_id, AgentRole::Backend)
            .await
            .unwrap()
            .unwrap();
        let agent_id = slot.agent.id;
        pool.release(slot).await.unwrap();

        pool.retire_idle(project_id).await.unwrap();
        let stopped = store.get_agent(agent_id).await.unwrap();
        assert_eq!(stopped.status, AgentStatus::Stopped);

        // retired agents are not reused
        let fresh = pool
            .try_acquire(project_id, AgentRole::Backend)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(fresh.agent.id, agent_id);
    }

    #[tokio::test]
    async fn blocking_acquire_waits_for_release() {
        let (_store, pool, project_id) = pool_with_project(1).await;
        let pool = Arc::new(pool);
        let slot = pool.acquire(project_id, AgentRole::Backend).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(project_id, AgentRole::Backend).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(slot).await.unwrap();
        let acquired = tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(acquired.is_ok());
    }
}
