//! Pooled execution over a set of workers
//!
//! The pool multiplexes callers over fixed or elastic worker membership.
//! Capacity is one semaphore sized `max_workers * permits`: callers that
//! exceed it suspend rather than fail, and resume in arrival order as
//! permits free up. Crashed members are detected via their fate channel
//! and replaced; elastic members idle past their time-to-live are retired
//! by a background reaper.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use drover_ipc::WorkerError;

use crate::error::ExecError;
use crate::manager::WorkerManager;
use crate::platform::{PlatformWorker, WorkerId};
use crate::worker::{single_value, EncodeFn, ExecuteStream, Worker, WorkerFate, WorkerOptions};

/// Membership policy for a pool.
#[derive(Debug, Clone)]
pub enum PoolSizing {
    /// Exactly `size` workers for the pool's lifetime.
    Fixed { size: usize },
    /// Between `min_size` and `max_size` workers; members idle for
    /// `time_to_live` are retired down to `min_size`.
    Elastic {
        min_size: usize,
        max_size: usize,
        time_to_live: Duration,
    },
}

impl PoolSizing {
    fn min_workers(&self) -> usize {
        match self {
            Self::Fixed { size } => *size,
            Self::Elastic { min_size, .. } => *min_size,
        }
    }

    fn max_workers(&self) -> usize {
        match self {
            Self::Fixed { size } => *size,
            Self::Elastic { max_size, .. } => *max_size,
        }
    }

    fn time_to_live(&self) -> Option<Duration> {
        match self {
            Self::Fixed { .. } => None,
            Self::Elastic { time_to_live, .. } => Some(*time_to_live),
        }
    }

    fn validate(&self) -> Result<(), WorkerError> {
        match self {
            Self::Fixed { size } if *size == 0 => {
                Err(WorkerError::spawn("pool size must be at least 1"))
            }
            Self::Elastic {
                min_size, max_size, ..
            } if *max_size == 0 || min_size > max_size => Err(WorkerError::spawn(
                "elastic pool requires 0 < max_size and min_size <= max_size",
            )),
            _ => Ok(()),
        }
    }
}

/// Hook run against each worker right after spawn, before it joins the
/// membership. Failure aborts the spawn.
pub type OnCreateFn<I, E, O> =
    Arc<dyn Fn(Worker<I, E, O>) -> BoxFuture<'static, Result<(), WorkerError>> + Send + Sync>;

pub struct PoolOptions<I, E, O> {
    pub sizing: PoolSizing,
    /// Concurrent requests per worker.
    pub permits: usize,
    pub encode: Option<EncodeFn<I>>,
    pub on_create: Option<OnCreateFn<I, E, O>>,
}

impl<I, E, O> Default for PoolOptions<I, E, O> {
    fn default() -> Self {
        Self {
            sizing: PoolSizing::Fixed {
                size: num_cpus::get(),
            },
            permits: 1,
            encode: None,
            on_create: None,
        }
    }
}

impl<I, E, O> Clone for PoolOptions<I, E, O> {
    fn clone(&self) -> Self {
        Self {
            sizing: self.sizing.clone(),
            permits: self.permits,
            encode: self.encode.clone(),
            on_create: self.on_create.clone(),
        }
    }
}

struct Member<I, E, O> {
    worker: Worker<I, E, O>,
    last_activity: Instant,
}

struct Registry<I, E, O> {
    members: HashMap<WorkerId, Member<I, E, O>>,
    /// Spawns reserved but not yet inserted, so concurrent acquirers do
    /// not overshoot `max_workers`.
    spawning: usize,
}

impl<I, E, O> Default for Registry<I, E, O> {
    fn default() -> Self {
        Self {
            members: HashMap::new(),
            spawning: 0,
        }
    }
}

struct PoolInner<I, E, O> {
    manager: WorkerManager<I, E, O>,
    sizing: PoolSizing,
    permits_per_worker: usize,
    encode: Option<EncodeFn<I>>,
    on_create: Option<OnCreateFn<I, E, O>>,
    /// Total request capacity across the pool at maximum membership.
    capacity: Arc<Semaphore>,
    /// Signalled whenever a member permit frees up or a member joins, so
    /// waiting acquirers re-check the registry.
    membership: Notify,
    registry: Mutex<Registry<I, E, O>>,
    shutdown: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<I, E, O> Drop for PoolInner<I, E, O> {
    fn drop(&mut self) {
        if let Ok(mut reaper) = self.reaper.lock() {
            if let Some(task) = reaper.take() {
                task.abort();
            }
        }
    }
}

/// A pool of workers sharing one request interface. Cheap to clone; every
/// clone names the same pool.
pub struct WorkerPool<I, E, O> {
    inner: Arc<PoolInner<I, E, O>>,
}

impl<I, E, O> Clone for WorkerPool<I, E, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, E, O> WorkerPool<I, E, O>
where
    I: Send + 'static,
    E: Send + 'static,
    O: Send + 'static,
{
    /// Build a pool, eagerly spawning the minimum membership.
    pub async fn new(
        platform: Arc<dyn PlatformWorker<I, E, O>>,
        options: PoolOptions<I, E, O>,
    ) -> Result<Self, WorkerError> {
        options.sizing.validate()?;
        let permits = options.permits.max(1);
        let capacity = options.sizing.max_workers() * permits;
        let inner = Arc::new(PoolInner {
            manager: WorkerManager::new(platform),
            sizing: options.sizing,
            permits_per_worker: permits,
            encode: options.encode,
            on_create: options.on_create,
            capacity: Arc::new(Semaphore::new(capacity)),
            membership: Notify::new(),
            registry: Mutex::new(Registry::default()),
            shutdown: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        for _ in 0..inner.sizing.min_workers() {
            spawn_member(&inner).await?;
        }

        if let Some(ttl) = inner.sizing.time_to_live() {
            let reaper = tokio::spawn(reap_idle(Arc::downgrade(&inner), ttl));
            if let Ok(mut slot) = inner.reaper.lock() {
                *slot = Some(reaper);
            }
        }

        Ok(Self { inner })
    }

    pub fn worker_count(&self) -> usize {
        match self.inner.registry.lock() {
            Ok(registry) => registry.members.len(),
            Err(_) => 0,
        }
    }

    /// Execute a request on some pool member, suspending while all
    /// capacity is taken. The ticket inside the returned stream holds the
    /// member's permit until the stream is dropped.
    pub async fn execute(&self, message: I) -> Result<PoolStream<I, E, O>, ExecError<E>> {
        let (worker, ticket) = self.acquire().await?;
        let stream = worker.submit(message, None).await?;
        Ok(PoolStream {
            stream,
            _ticket: ticket,
        })
    }

    /// Single-value convenience over [`execute`](Self::execute).
    pub async fn execute_once(&self, message: I) -> Result<O, ExecError<E>> {
        let stream = self.execute(message).await?;
        single_value(stream).await
    }

    fn snapshot(&self) -> Vec<Worker<I, E, O>> {
        match self.inner.registry.lock() {
            Ok(registry) => registry
                .members
                .values()
                .filter(|member| member.worker.is_open())
                .map(|member| member.worker.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Reserve pool capacity, then bind it to a member with a free
    /// permit, spawning a new member when allowed.
    async fn acquire(&self) -> Result<(Worker<I, E, O>, PoolTicket<I, E, O>), ExecError<E>> {
        let capacity_permit = self
            .inner
            .capacity
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecError::Worker(WorkerError::unknown("pool is shut down")))?;

        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                return Err(ExecError::Worker(WorkerError::unknown("pool is shut down")));
            }

            // Register for membership changes before inspecting the
            // registry, so a permit freed in between is not missed.
            let notified = self.inner.membership.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let decision = {
                let mut registry = self.inner.registry.lock().map_err(|_| {
                    ExecError::Worker(WorkerError::unknown("pool registry poisoned"))
                })?;

                let best = registry
                    .members
                    .values_mut()
                    .filter(|member| member.worker.is_open())
                    .max_by_key(|member| member.worker.available_permits());
                if let Some(member) = best {
                    if let Some(permit) = member.worker.try_acquire_permit() {
                        member.last_activity = Instant::now();
                        let worker = member.worker.clone();
                        let ticket = PoolTicket {
                            pool: self.inner.clone(),
                            worker_id: worker.id(),
                            _worker_permit: Some(permit),
                            _capacity_permit: Some(capacity_permit),
                        };
                        return Ok((worker, ticket));
                    }
                }

                let population = registry.members.len() + registry.spawning;
                if population < self.inner.sizing.max_workers() {
                    registry.spawning += 1;
                    Decision::Spawn
                } else {
                    Decision::Retry
                }
            };

            match decision {
                Decision::Spawn => {
                    let spawned = spawn_member(&self.inner).await;
                    if let Ok(mut registry) = self.inner.registry.lock() {
                        registry.spawning -= 1;
                    }
                    spawned.map_err(ExecError::Worker)?;
                }
                Decision::Retry => {
                    // Every member permit is in flight; park until one
                    // frees up or the membership changes.
                    notified.await;
                }
            }
        }
    }

    /// Fire-and-forget send to every current member. Members that fail at
    /// the transport level are skipped; application-level failures
    /// propagate.
    pub async fn broadcast(&self, message: I) -> Result<(), ExecError<E>>
    where
        I: Clone,
    {
        for worker in self.snapshot() {
            match worker.notify(message.clone()).await {
                Ok(()) => {}
                Err(ExecError::Worker(cause)) => {
                    debug!(worker_id = worker.id(), error = %cause, "skipping broadcast to failed worker");
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Shut the pool down: reject new callers, stop replacement, and drop
    /// all members so their backing units terminate.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.capacity.close();
        if let Ok(mut reaper) = self.inner.reaper.lock() {
            if let Some(task) = reaper.take() {
                task.abort();
            }
        }
        if let Ok(mut registry) = self.inner.registry.lock() {
            registry.members.clear();
        }
        self.inner.membership.notify_waiters();
    }
}

enum Decision {
    Spawn,
    Retry,
}

/// Permits owned for one pooled request: the member's own permit and the
/// pool-wide capacity permit. Released together when the stream drops.
struct PoolTicket<I, E, O> {
    pool: Arc<PoolInner<I, E, O>>,
    worker_id: WorkerId,
    _worker_permit: Option<OwnedSemaphorePermit>,
    _capacity_permit: Option<OwnedSemaphorePermit>,
}

impl<I, E, O> Drop for PoolTicket<I, E, O> {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.pool.registry.lock() {
            if let Some(member) = registry.members.get_mut(&self.worker_id) {
                member.last_activity = Instant::now();
            }
        }
        // Return the permits before waking acquirers, or a woken task
        // would find them still taken and go back to sleep unnotified.
        self._worker_permit.take();
        self._capacity_permit.take();
        self.pool.membership.notify_waiters();
    }
}

/// Response stream for one pooled request; holds its ticket until dropped.
pub struct PoolStream<I, E, O> {
    stream: ExecuteStream<I, E, O>,
    _ticket: PoolTicket<I, E, O>,
}

impl<I, E, O> Stream for PoolStream<I, E, O> {
    type Item = Result<O, ExecError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

/// Spawn one worker, run the creation hook, and add it to the membership
/// with a monitor that replaces it on abnormal termination.
fn spawn_member<I, E, O>(inner: &Arc<PoolInner<I, E, O>>) -> BoxFuture<'_, Result<(), WorkerError>>
where
    I: Send + 'static,
    E: Send + 'static,
    O: Send + 'static,
{
    Box::pin(async move {
        let options = WorkerOptions {
            permits: inner.permits_per_worker,
            encode: inner.encode.clone(),
            queue: None,
        };
        let worker = inner.manager.spawn(options).await?;
        if let Some(on_create) = &inner.on_create {
            on_create(worker.clone()).await?;
        }

        let id = worker.id();
        let fate = worker.subscribe_fate();
        {
            let mut registry = inner
                .registry
                .lock()
                .map_err(|_| WorkerError::unknown("pool registry poisoned"))?;
            registry.members.insert(
                id,
                Member {
                    worker,
                    last_activity: Instant::now(),
                },
            );
        }
        tokio::spawn(monitor_member(Arc::downgrade(inner), id, fate));
        inner.membership.notify_waiters();
        debug!(worker_id = id, "pool member joined");
        Ok(())
    })
}

/// Watch one member's fate and replace it when it dies while the pool is
/// below its minimum membership. Replacement retries with backoff until a
/// spawn succeeds or the pool goes away.
async fn monitor_member<I, E, O>(
    pool: Weak<PoolInner<I, E, O>>,
    id: WorkerId,
    mut fate: tokio::sync::watch::Receiver<WorkerFate>,
) where
    I: Send + 'static,
    E: Send + 'static,
    O: Send + 'static,
{
    let cause = match fate
        .wait_for(|state| matches!(state, WorkerFate::Closed(_)))
        .await
        .as_deref()
    {
        Ok(WorkerFate::Closed(Some(error))) => Some(error.clone()),
        _ => None,
    };

    let needs_replacement = {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        match &cause {
            Some(error) => warn!(worker_id = id, error = %error, "pool member died"),
            None => debug!(worker_id = id, "pool member closed"),
        }

        let Ok(mut registry) = inner.registry.lock() else {
            return;
        };
        if registry.members.remove(&id).is_none() {
            // Already retired by the reaper.
            return;
        }
        let below_min = registry.members.len() + registry.spawning < inner.sizing.min_workers();
        if below_min {
            registry.spawning += 1;
        }
        below_min
    };
    if !needs_replacement {
        return;
    }

    // Only the Weak is held across the sleeps, so a retrying monitor
    // never keeps a dropped pool alive.
    let mut delay = Duration::from_millis(100);
    loop {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.shutdown.load(Ordering::SeqCst) {
            release_spawn_slot(&inner);
            return;
        }
        match spawn_member(&inner).await {
            Ok(()) => {
                release_spawn_slot(&inner);
                return;
            }
            Err(error) => {
                error!(worker_id = id, error = %error, "failed to replace dead pool member; retrying");
            }
        }
        drop(inner);
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(5));
    }
}

fn release_spawn_slot<I, E, O>(inner: &PoolInner<I, E, O>) {
    if let Ok(mut registry) = inner.registry.lock() {
        registry.spawning -= 1;
    }
}

/// Periodically retire elastic members idle past their time-to-live,
/// never below the minimum membership.
async fn reap_idle<I, E, O>(pool: Weak<PoolInner<I, E, O>>, ttl: Duration) {
    let period = (ttl / 4).max(Duration::from_millis(10));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut retired = Vec::new();
        {
            let Ok(mut registry) = inner.registry.lock() else {
                return;
            };
            let min = inner.sizing.min_workers();
            let now = Instant::now();
            let idle: Vec<WorkerId> = registry
                .members
                .iter()
                .filter(|(_, member)| {
                    member.worker.available_permits() == member.worker.permit_count()
                        && now.duration_since(member.last_activity) >= ttl
                })
                .map(|(id, _)| *id)
                .collect();
            for id in idle {
                if registry.members.len() <= min {
                    break;
                }
                if let Some(member) = registry.members.remove(&id) {
                    debug!(worker_id = id, "retiring idle pool member");
                    retired.push(member);
                }
            }
        }
        // Worker teardown happens here, outside the registry lock.
        drop(retired);
    }
}
