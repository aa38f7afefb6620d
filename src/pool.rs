//! The virtual user pool: spawns and retires virtual users to match a target.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::HttpTransport;
use crate::logger::RequestLoggerTx;
use crate::metrics::Aggregator;
use crate::scenario::{Scenario, ScenarioContext};
use crate::user::{user_main, UserExit, UserState, VirtualUser, VirtualUserState};

/// The pool's view of one spawned virtual user.
struct UserHandle {
    state: UserState,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

type Registry = Arc<Mutex<BTreeMap<usize, UserHandle>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, BTreeMap<usize, UserHandle>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns every virtual user of a run.
///
/// Users are identified by a monotonically increasing id starting at 1. When the
/// target drops, the oldest users are retired first. A retired user finishes its
/// current iteration before exiting, and removes itself from the pool on exit.
pub struct VirtualUserPool {
    scenario: Scenario,
    host: Option<Url>,
    think_time: Duration,
    transport: Arc<dyn HttpTransport>,
    /// Canceled on hard shutdown, aborts in-flight requests.
    cancel: CancellationToken,
    aggregator: Arc<Aggregator>,
    logger: RequestLoggerTx,
    registry: Registry,
    next_id: usize,
    exited: Arc<Notify>,
    faults: Arc<AtomicUsize>,
    peak_users: usize,
}
impl VirtualUserPool {
    pub(crate) fn new(
        scenario: Scenario,
        host: Option<Url>,
        think_time: Duration,
        transport: Arc<dyn HttpTransport>,
        cancel: CancellationToken,
        aggregator: Arc<Aggregator>,
        logger: RequestLoggerTx,
    ) -> Self {
        VirtualUserPool {
            scenario,
            host,
            think_time,
            transport,
            cancel,
            aggregator,
            logger,
            registry: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: 1,
            exited: Arc::new(Notify::new()),
            faults: Arc::new(AtomicUsize::new(0)),
            peak_users: 0,
        }
    }

    /// Spawn or retire users until `target` users are Idle or Running.
    pub fn reconcile(&mut self, target: usize) {
        let mut registry = lock(&self.registry);
        let active: Vec<usize> = registry
            .iter()
            .filter(|(_, user)| user.state.get().is_active())
            .map(|(id, _)| *id)
            .collect();

        if target > active.len() {
            let spawn = target - active.len();
            debug!("spawning {} users ({} -> {})", spawn, active.len(), target);
            for _ in 0..spawn {
                let id = self.next_id;
                self.next_id += 1;
                let handle = self.spawn_user(id);
                registry.insert(id, handle);
            }
        } else if target < active.len() {
            let retire = active.len() - target;
            debug!("retiring {} users ({} -> {})", retire, active.len(), target);
            // BTreeMap iterates in id order, oldest first.
            for id in active.iter().take(retire) {
                if let Some(user) = registry.get(id) {
                    user.state.stop();
                    user.stop.cancel();
                }
            }
        }

        self.peak_users = self.peak_users.max(target);
    }

    fn spawn_user(&self, id: usize) -> UserHandle {
        let state = UserState::new();
        let stop = CancellationToken::new();
        let user = VirtualUser {
            id,
            scenario_name: self.scenario.name.clone(),
            function: self.scenario.function.clone(),
            context: ScenarioContext::new(
                id,
                self.host.clone(),
                self.transport.clone(),
                self.cancel.clone(),
            ),
            think_time: self.think_time,
            state: state.clone(),
            stop: stop.clone(),
            aggregator: self.aggregator.clone(),
            logger: self.logger.clone(),
        };

        let registry = self.registry.clone();
        let exited = self.exited.clone();
        let faults = self.faults.clone();
        let user_state = state.clone();
        let task = tokio::spawn(async move {
            if user_main(user).await == UserExit::Faulted {
                faults.fetch_add(1, Ordering::SeqCst);
            }
            user_state.set(VirtualUserState::Stopped);
            lock(&registry).remove(&id);
            exited.notify_waiters();
        });

        UserHandle { state, stop, task }
    }

    /// Mark every user Stopping.
    pub fn stop_all(&self) {
        let registry = lock(&self.registry);
        debug!("stopping all {} users", registry.len());
        for user in registry.values() {
            user.state.stop();
            user.stop.cancel();
        }
    }

    /// Wait for every user to exit, returning `false` if some are still running
    /// after `timeout`.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.exited.notified();
            if self.is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep(Duration::from_millis(50)) => {},
            }
        }
    }

    /// Abort whatever is still running, returning how many tasks were aborted.
    pub fn abort_remaining(&self) -> usize {
        let mut registry = lock(&self.registry);
        let remaining = registry.len();
        for (id, user) in registry.iter() {
            warn!("aborting user {}", id);
            user.task.abort();
            user.state.set(VirtualUserState::Stopped);
        }
        registry.clear();
        remaining
    }

    /// Users that have not yet exited, including those finishing a last iteration.
    pub fn len(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Users counted toward the target: Idle or Running.
    pub fn active_count(&self) -> usize {
        self.count(VirtualUserState::is_active)
    }

    pub fn running_count(&self) -> usize {
        self.count(|state| state == VirtualUserState::Running)
    }

    fn count<F: Fn(VirtualUserState) -> bool>(&self, filter: F) -> usize {
        lock(&self.registry)
            .values()
            .filter(|user| filter(user.state.get()))
            .count()
    }

    /// Users retired because their scenario failed fatally or panicked.
    pub fn faults(&self) -> usize {
        self.faults.load(Ordering::SeqCst)
    }

    /// Highest number of active users this pool has been asked to hold.
    pub fn peak_users(&self) -> usize {
        self.peak_users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{TransportRequest, TransportResponse};
    use crate::scenario::ScenarioResult;
    use async_trait::async_trait;

    struct SlowTransport(Duration);

    #[async_trait]
    impl HttpTransport for SlowTransport {
        async fn do_request(&self, _request: TransportRequest) -> TransportResponse {
            tokio::time::sleep(self.0).await;
            TransportResponse {
                status: Some(200),
                elapsed: self.0,
                error: None,
                size_bytes: Some(0),
            }
        }
    }

    async fn front_page(ctx: ScenarioContext) -> ScenarioResult {
        Ok(vec![ctx.get("/").await?])
    }

    fn pool(latency: Duration, think_time: Duration) -> (VirtualUserPool, CancellationToken) {
        let cancel = CancellationToken::new();
        let pool = VirtualUserPool::new(
            Scenario::new("front_page", front_page),
            Some(Url::parse("http://localhost/").unwrap()),
            think_time,
            Arc::new(SlowTransport(latency)),
            cancel.clone(),
            Arc::new(Aggregator::new(2)),
            None,
        );
        (pool, cancel)
    }

    #[tokio::test]
    async fn grows_and_shrinks() {
        let (mut pool, _) = pool(Duration::from_millis(5), Duration::from_millis(20));
        pool.reconcile(5);
        assert_eq!(pool.active_count(), 5);
        assert_eq!(pool.len(), 5);
        assert_eq!(pool.peak_users(), 5);

        // Reconciling to the same target is a no-op.
        pool.reconcile(5);
        assert_eq!(pool.len(), 5);

        pool.reconcile(2);
        assert_eq!(pool.active_count(), 2);
        assert!(!pool.wait_until_empty(Duration::from_millis(10)).await);

        // The oldest users were retired.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let ids: Vec<usize> = lock(&pool.registry).keys().copied().collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(pool.peak_users(), 5);

        // New users get new ids.
        pool.reconcile(3);
        let ids: Vec<usize> = lock(&pool.registry).keys().copied().collect();
        assert_eq!(ids, vec![4, 5, 6]);

        pool.stop_all();
        assert_eq!(pool.active_count(), 0);
        assert!(pool.wait_until_empty(Duration::from_secs(5)).await);
        assert_eq!(pool.faults(), 0);
    }

    #[tokio::test]
    async fn stopping_users_finish_their_iteration() {
        let (mut pool, _) = pool(Duration::from_millis(200), Duration::ZERO);
        pool.reconcile(3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.running_count(), 3);
        pool.reconcile(0);
        // Still finishing their request.
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.len(), 3);
        assert!(pool.wait_until_empty(Duration::from_secs(5)).await);
        assert_eq!(pool.aggregator.snapshot().count, 3);
    }

    #[tokio::test]
    async fn hard_cancel_and_abort() {
        let (mut pool, cancel) = pool(Duration::from_secs(60), Duration::ZERO);
        pool.reconcile(4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert!(pool.wait_until_empty(Duration::from_secs(5)).await);
        // Canceled requests are not recorded.
        assert_eq!(pool.aggregator.snapshot().count, 0);
        assert_eq!(pool.abort_remaining(), 0);
    }

    #[tokio::test]
    async fn faults_are_counted() {
        let cancel = CancellationToken::new();
        let mut pool = VirtualUserPool::new(
            Scenario::new("broken", |ctx: ScenarioContext| async move {
                // No host configured, relative paths are fatal.
                Ok(vec![ctx.get("/").await?])
            }),
            None,
            Duration::ZERO,
            Arc::new(SlowTransport(Duration::ZERO)),
            cancel,
            Arc::new(Aggregator::new(1)),
            None,
        );
        pool.reconcile(2);
        assert!(pool.wait_until_empty(Duration::from_secs(5)).await);
        assert_eq!(pool.faults(), 2);
        assert_eq!(pool.aggregator.snapshot().failure_count, 2);
    }
}
