//! Bounded, health-checked connection pool.
//!
//! Checkout probes every connection and retires those that have lived past the
//! idle-refresh threshold, so a server-side idle disconnect is caught here rather than
//! by the query that would have used the dead socket. A background sweep does the same
//! for connections sitting idle between requests.

use crate::config::PoolConfig;
use crate::traits::ManageConnection;
use crate::PoolError;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

struct IdleConnection<C> {
    connection: C,
    created_at: Instant,
    last_validated_at: Instant,
    generation: u64,
}

struct PoolShared<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConnection<M::Connection>>>,
    permits: Arc<Semaphore>,
    generation: AtomicU64,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub outstanding: usize,
    pub max_connections: usize,
    pub generation: u64,
}

pub struct ConnectionPoolManager<M: ManageConnection> {
    shared: Arc<PoolShared<M>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ManageConnection> ConnectionPoolManager<M> {
    pub fn new(manager: M, config: PoolConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            shared: Arc::new(PoolShared {
                manager,
                config: PoolConfig {
                    max_connections,
                    ..config
                },
                idle: Mutex::new(VecDeque::with_capacity(max_connections)),
                permits: Arc::new(Semaphore::new(max_connections)),
                generation: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            maintenance: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Starts the maintenance sweep and opens `min_idle` warm connections.
    pub async fn init(&self) -> Result<(), PoolError> {
        self.spawn_maintenance();

        let warm = self
            .shared
            .config
            .min_idle
            .min(self.shared.config.max_connections);
        for _ in 0..warm {
            let connection = self.shared.open().await?;
            let now = Instant::now();
            self.shared.idle().push_back(IdleConnection {
                connection,
                created_at: now,
                last_validated_at: now,
                generation: self.shared.current_generation(),
            });
        }

        info!(
            max_connections = self.shared.config.max_connections,
            warm,
            "connection pool initialised"
        );
        Ok(())
    }

    pub async fn acquire(&self) -> Result<ConnectionHandle<M>, PoolError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }

        let wait = shared.config.acquire_timeout;
        let permit = match timeout(wait, shared.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                warn!(waited_ms = wait.as_millis() as u64, "connection pool exhausted");
                return Err(PoolError::PoolExhausted(wait));
            }
        };

        let permit = match shared.checkout(permit).await {
            Ok(handle) => return Ok(handle),
            Err((permit, error)) => {
                warn!(error = %error, "all checkout attempts failed, rebuilding pool");
                permit
            }
        };

        shared.rebuild().await;

        match shared.checkout(permit).await {
            Ok(handle) => Ok(handle),
            Err((_permit, error)) => Err(PoolError::AllAttemptsFailed {
                attempts: shared.config.max_retries.max(1),
                last_error: error.to_string(),
            }),
        }
    }

    /// Returns a handle; equivalent to dropping it.
    pub fn release(&self, handle: ConnectionHandle<M>) {
        drop(handle);
    }

    pub fn status(&self) -> PoolStatus {
        let max_connections = self.shared.config.max_connections;
        PoolStatus {
            idle: self.shared.idle().len(),
            outstanding: max_connections.saturating_sub(self.shared.permits.available_permits()),
            max_connections,
            generation: self.shared.current_generation(),
        }
    }

    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(task) = self.maintenance_slot().take() {
            task.abort();
        }
        self.shared.permits.close();

        let drained = self.shared.idle().drain(..).collect::<Vec<_>>();
        let count = drained.len();
        for idle in drained {
            self.shared.manager.close(idle.connection).await;
        }

        info!(closed = count, "connection pool shut down");
    }

    fn spawn_maintenance(&self) {
        let weak = Arc::downgrade(&self.shared);
        let every = self.shared.config.maintenance_interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                shared.maintain().await;
            }
        });

        if let Some(previous) = self.maintenance_slot().replace(task) {
            previous.abort();
        }
    }

    fn maintenance_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.maintenance.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<M: ManageConnection> Drop for ConnectionPoolManager<M> {
    fn drop(&mut self) {
        if let Some(task) = self.maintenance_slot().take() {
            task.abort();
        }
    }
}

impl<M: ManageConnection> PoolShared<M> {
    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection<M::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn is_stale(&self, created_at: Instant) -> bool {
        created_at.elapsed() >= self.config.idle_refresh_threshold
    }

    async fn open(&self) -> Result<M::Connection, PoolError> {
        match timeout(self.config.acquire_timeout, self.manager.connect()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Connect(format!(
                "connect timed out after {:?}",
                self.config.acquire_timeout
            ))),
        }
    }

    async fn probe(&self, connection: &mut M::Connection) -> Result<(), PoolError> {
        match timeout(self.config.probe_timeout, self.manager.probe(connection)).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Probe(format!(
                "probe timed out after {:?}",
                self.config.probe_timeout
            ))),
        }
    }

    /// Allows up to `max_retries` failed connects or probes; hands the permit back on
    /// failure so the caller can retry after a rebuild without re-queueing. Retiring a
    /// stale or old-generation idle connection does not count as a failure.
    async fn checkout(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
    ) -> Result<ConnectionHandle<M>, (OwnedSemaphorePermit, PoolError)> {
        let attempts = self.config.max_retries.max(1);
        let mut failures = 0;
        let mut last_error = PoolError::Connect("no attempt made".to_string());

        while failures < attempts {
            let attempt = failures + 1;
            let generation = self.current_generation();
            let reused = self.idle().pop_back();

            let (mut connection, created_at) = match reused {
                Some(idle) if idle.generation != generation => {
                    self.manager.close(idle.connection).await;
                    continue;
                }
                Some(idle) if self.is_stale(idle.created_at) => {
                    debug!(
                        age_ms = idle.created_at.elapsed().as_millis() as u64,
                        "retiring connection past idle-refresh threshold"
                    );
                    self.manager.close(idle.connection).await;
                    continue;
                }
                Some(idle) => (idle.connection, idle.created_at),
                None => match self.open().await {
                    Ok(connection) => (connection, Instant::now()),
                    Err(error) => {
                        warn!(attempt, error = %error, "connect attempt failed");
                        failures += 1;
                        last_error = error;
                        continue;
                    }
                },
            };

            match self.probe(&mut connection).await {
                Ok(()) => {
                    return Ok(ConnectionHandle {
                        connection: Some(connection),
                        created_at,
                        last_validated_at: Instant::now(),
                        generation,
                        broken: false,
                        pool: Arc::downgrade(self),
                        _permit: permit,
                    });
                }
                Err(error) => {
                    debug!(attempt, error = %error, "discarding connection that failed its probe");
                    self.manager.close(connection).await;
                    failures += 1;
                    last_error = error;
                }
            }
        }

        Err((permit, last_error))
    }

    async fn rebuild(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let drained = self.idle().drain(..).collect::<Vec<_>>();
        let count = drained.len();
        for idle in drained {
            self.manager.close(idle.connection).await;
        }
        info!(generation, closed = count, "connection pool rebuilt");
    }

    /// Probes the least recently used idle connections, replacing stale ones. Only
    /// touches as many connections as there are free permits.
    async fn maintain(&self) {
        let mut permits = Vec::new();
        while permits.len() < self.config.maintenance_sample {
            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }

        let batch = {
            let mut idle = self.idle();
            (0..permits.len())
                .map_while(|_| idle.pop_front())
                .collect::<Vec<_>>()
        };
        if batch.is_empty() {
            return;
        }

        let generation = self.current_generation();
        let (mut refreshed, mut replaced, mut retired) = (0usize, 0usize, 0usize);

        for mut entry in batch {
            if entry.generation != generation {
                self.manager.close(entry.connection).await;
                retired += 1;
                continue;
            }

            if self.is_stale(entry.created_at) {
                self.manager.close(entry.connection).await;
                match self.open().await {
                    Ok(connection) => {
                        let now = Instant::now();
                        self.return_idle(IdleConnection {
                            connection,
                            created_at: now,
                            last_validated_at: now,
                            generation,
                        });
                        replaced += 1;
                    }
                    Err(error) => {
                        warn!(error = %error, "could not replace stale idle connection");
                        retired += 1;
                    }
                }
                continue;
            }

            match self.probe(&mut entry.connection).await {
                Ok(()) => {
                    entry.last_validated_at = Instant::now();
                    self.return_idle(entry);
                    refreshed += 1;
                }
                Err(error) => {
                    debug!(error = %error, "idle connection failed maintenance probe");
                    self.manager.close(entry.connection).await;
                    retired += 1;
                }
            }
        }

        debug!(refreshed, replaced, retired, "pool maintenance sweep finished");
        drop(permits);
    }

    fn return_idle(&self, entry: IdleConnection<M::Connection>) {
        if self.closed.load(Ordering::Acquire) || entry.generation != self.current_generation() {
            self.retire_detached(entry.connection);
            return;
        }
        self.idle().push_back(entry);
    }

    fn retire_detached(&self, connection: M::Connection) {
        drop(connection);
    }

    fn check_in(self: &Arc<Self>, mut handle_state: CheckIn<M::Connection>) {
        let closed = self.closed.load(Ordering::Acquire);
        let retired = handle_state.broken
            || closed
            || handle_state.generation != self.current_generation()
            || self.is_stale(handle_state.created_at)
            || self.manager.has_closed(&mut handle_state.connection);

        if !retired {
            self.idle().push_back(IdleConnection {
                connection: handle_state.connection,
                created_at: handle_state.created_at,
                last_validated_at: handle_state.last_validated_at,
                generation: handle_state.generation,
            });
            return;
        }

        debug!(broken = handle_state.broken, "closing released connection");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(self);
                runtime.spawn(async move {
                    shared.manager.close(handle_state.connection).await;
                });
            }
            Err(_) => self.retire_detached(handle_state.connection),
        }
    }
}

struct CheckIn<C> {
    connection: C,
    created_at: Instant,
    last_validated_at: Instant,
    generation: u64,
    broken: bool,
}

/// A checked-out connection. Dropping it returns the connection to the pool, or closes
/// it when it was marked broken, went stale, or outlived a pool rebuild.
pub struct ConnectionHandle<M: ManageConnection> {
    connection: Option<M::Connection>,
    created_at: Instant,
    last_validated_at: Instant,
    generation: u64,
    broken: bool,
    pool: Weak<PoolShared<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ManageConnection> ConnectionHandle<M> {
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_validated_at(&self) -> Instant {
        self.last_validated_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The connection will be closed instead of returned on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<M: ManageConnection> Deref for ConnectionHandle<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("connection is present until the handle drops")
    }
}

impl<M: ManageConnection> DerefMut for ConnectionHandle<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("connection is present until the handle drops")
    }
}

impl<M: ManageConnection> Drop for ConnectionHandle<M> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(pool) => pool.check_in(CheckIn {
                connection,
                created_at: self.created_at,
                last_validated_at: self.last_validated_at,
                generation: self.generation,
                broken: self.broken,
            }),
            None => drop(connection),
        }
    }
}
