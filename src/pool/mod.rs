//! 会话池：按 (user_id, session_id) 缓存 MemoryKeeper，受容量与空闲时间约束
//!
//! - 索引是一把只在内存操作期间持有的 std Mutex，从不跨 await；
//! - 每个会话一个 tokio Mutex，同一会话的操作串行，不同会话互不阻塞；
//! - 驱逐（LRU 或空闲）先持久化 dirty 会话再移除，持久化失败则保留条目；
//! - 冷路径先插入已加锁的占位条目，再在该锁内恢复或新建会话。

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{BackendKind, MemoryError, MemoryResult};
use crate::core::Backends;
use crate::memory::keeper::{KeeperSettings, MemoryKeeper};
use crate::memory::model::SessionStatus;

/// 单次 resolve / lock 的最大重试轮数（并发驱逐导致的重来）
const MAX_ATTEMPTS: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.session_id)
    }
}

/// 冷路径行为
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestoreMode {
    /// 有持久化状态则恢复，否则新建
    #[default]
    Auto,
    /// 只恢复；没有持久化状态返回 SessionNotFound
    Only,
    /// 丢弃快照里的缓冲，沿用已持久化的编号新建；会话已结束时返回 SessionEnded
    Fresh,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoolSettings {
    pub max_sessions: usize,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            session_ttl: Duration::from_secs(1800),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoolStats {
    pub count: usize,
    pub capacity: usize,
    pub ttl_secs: u64,
    pub dirty_count: usize,
    pub avg_age_secs: f64,
    pub oldest_age_secs: f64,
    pub utilization: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    /// 持久化失败、保留在池中的会话数
    pub retained: usize,
}

struct SessionSlot {
    key: SessionKey,
    state: Arc<AsyncMutex<Option<MemoryKeeper>>>,
    /// 全局递增的访问序号，用于 LRU
    access_tick: AtomicU64,
    /// 最近访问时间（相对池创建时刻的毫秒数）
    last_access_ms: AtomicU64,
    created_at: Instant,
    dirty: OnceLock<Arc<AtomicBool>>,
}

impl SessionSlot {
    fn is_dirty(&self) -> bool {
        self.dirty
            .get()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn tick(&self) -> u64 {
        self.access_tick.load(Ordering::SeqCst)
    }
}

/// resolve 的结果；持有者可随时 lock，如期间被驱逐会自动重新解析
#[derive(Clone)]
pub struct SessionHandle {
    slot: Arc<SessionSlot>,
    mode: RestoreMode,
}

impl SessionHandle {
    pub fn key(&self) -> &SessionKey {
        &self.slot.key
    }
}

/// 持有会话锁期间可读写 MemoryKeeper
pub struct SessionGuard {
    key: SessionKey,
    keeper: OwnedMappedMutexGuard<Option<MemoryKeeper>, MemoryKeeper>,
}

impl SessionGuard {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }
}

impl Deref for SessionGuard {
    type Target = MemoryKeeper;

    fn deref(&self) -> &Self::Target {
        &self.keeper
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.keeper
    }
}

pub struct SessionPool {
    backends: Backends,
    keeper_settings: KeeperSettings,
    settings: PoolSettings,
    entries: Mutex<HashMap<SessionKey, Arc<SessionSlot>>>,
    clock: AtomicU64,
    epoch: Instant,
}

impl SessionPool {
    pub fn new(backends: Backends, keeper_settings: KeeperSettings, settings: PoolSettings) -> Self {
        Self {
            backends,
            keeper_settings,
            settings,
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Arc<SessionSlot>>> {
        // 索引锁内不会 panic；即便中毒也继续使用其中数据
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self, slot: &SessionSlot) {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        slot.access_tick.store(tick, Ordering::SeqCst);
        slot.last_access_ms.store(self.now_ms(), Ordering::SeqCst);
    }

    fn idle_for(&self, slot: &SessionSlot) -> Duration {
        let last = slot.last_access_ms.load(Ordering::SeqCst);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.entries().contains_key(key)
    }

    /// 从索引移除，仅当条目仍是同一个 slot 且（可选）自 tick 之后未被访问
    fn remove_if_current(&self, slot: &Arc<SessionSlot>, tick: Option<u64>) -> bool {
        let mut entries = self.entries();
        let current = entries
            .get(&slot.key)
            .is_some_and(|s| Arc::ptr_eq(s, slot));
        let untouched = tick.map_or(true, |t| slot.tick() == t);
        if current && untouched {
            entries.remove(&slot.key);
            true
        } else {
            false
        }
    }

    /// 解析会话：热路径只更新 LRU；冷路径恢复或新建，必要时先驱逐 LRU
    pub async fn resolve(&self, key: SessionKey, mode: RestoreMode) -> MemoryResult<SessionHandle> {
        for _ in 0..MAX_ATTEMPTS {
            let placeholder = {
                let mut entries = self.entries();
                if let Some(slot) = entries.get(&key) {
                    self.touch(slot);
                    tracing::debug!(session = %key, "session pool hit");
                    return Ok(SessionHandle {
                        slot: Arc::clone(slot),
                        mode,
                    });
                }
                if entries.len() >= self.settings.max_sessions {
                    None
                } else {
                    let state = Arc::new(AsyncMutex::new(None));
                    let guard = Arc::clone(&state).try_lock_owned().map_err(|_| {
                        MemoryError::Store("new session slot already locked".into())
                    })?;
                    let slot = Arc::new(SessionSlot {
                        key: key.clone(),
                        state,
                        access_tick: AtomicU64::new(0),
                        last_access_ms: AtomicU64::new(0),
                        created_at: Instant::now(),
                        dirty: OnceLock::new(),
                    });
                    self.touch(&slot);
                    entries.insert(key.clone(), Arc::clone(&slot));
                    Some((slot, guard))
                }
            };

            match placeholder {
                Some((slot, guard)) => return self.load(slot, guard, mode).await,
                None => self.evict_lru().await?,
            }
        }
        Err(MemoryError::CapacityExceeded {
            capacity: self.settings.max_sessions,
            reason: "pool churn while admitting session".into(),
        })
    }

    async fn load(
        &self,
        slot: Arc<SessionSlot>,
        mut guard: OwnedMutexGuard<Option<MemoryKeeper>>,
        mode: RestoreMode,
    ) -> MemoryResult<SessionHandle> {
        let key = &slot.key;
        let backends = self.backends.clone();
        let settings = self.keeper_settings.clone();
        let loaded = match mode {
            RestoreMode::Fresh => {
                MemoryKeeper::create(backends, settings, &key.user_id, &key.session_id).await
            }
            RestoreMode::Auto => {
                match MemoryKeeper::restore(backends.clone(), settings.clone(), &key.user_id, &key.session_id)
                    .await
                {
                    Ok(Some(keeper)) => Ok(keeper),
                    Ok(None) => {
                        MemoryKeeper::create(backends, settings, &key.user_id, &key.session_id)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            RestoreMode::Only => {
                match MemoryKeeper::restore(backends, settings, &key.user_id, &key.session_id).await {
                    Ok(Some(keeper)) => Ok(keeper),
                    Ok(None) => Err(MemoryError::SessionNotFound {
                        user_id: key.user_id.clone(),
                        session_id: key.session_id.clone(),
                    }),
                    Err(e) => Err(e),
                }
            }
        };

        match loaded {
            Ok(keeper) => {
                let _ = slot.dirty.set(keeper.dirty_flag());
                *guard = Some(keeper);
                drop(guard);
                tracing::info!(session = %key, ?mode, "session admitted");
                Ok(SessionHandle { slot, mode })
            }
            Err(e) => {
                self.remove_if_current(&slot, None);
                drop(guard);
                tracing::warn!(session = %key, ?mode, error = %e, "session admission failed");
                // 恢复失败不降级为空会话；后端错误统一以可重试形式上抛
                Err(match e {
                    MemoryError::Store(msg) => MemoryError::transient(BackendKind::Store, msg),
                    other => other,
                })
            }
        }
    }

    /// 为准入腾出一个位置；LRU 受害者持久化失败时返回 CapacityExceeded
    async fn evict_lru(&self) -> MemoryResult<()> {
        let victim = {
            let entries = self.entries();
            entries.values().min_by_key(|slot| slot.tick()).cloned()
        };
        let Some(victim) = victim else {
            return Err(MemoryError::CapacityExceeded {
                capacity: self.settings.max_sessions,
                reason: "pool has no capacity".into(),
            });
        };
        let tick = victim.tick();
        let mut guard = Arc::clone(&victim.state).lock_owned().await;

        if let Some(keeper) = guard.as_ref() {
            if keeper.is_dirty() {
                if let Err(e) = keeper.persist_snapshot().await {
                    tracing::warn!(session = %victim.key, error = %e, "LRU eviction aborted, victim stays resident");
                    return Err(MemoryError::CapacityExceeded {
                        capacity: self.settings.max_sessions,
                        reason: format!("could not persist LRU session {}: {e}", victim.key),
                    });
                }
            }
        }

        if self.remove_if_current(&victim, Some(tick)) {
            *guard = None;
            tracing::info!(session = %victim.key, "evicted least-recently-used session");
        }
        Ok(())
    }

    /// 加锁；条目在解析后被驱逐时重新解析
    pub async fn lock(&self, handle: &SessionHandle) -> MemoryResult<SessionGuard> {
        let mut handle = handle.clone();
        for _ in 0..MAX_ATTEMPTS {
            let guard = Arc::clone(&handle.slot.state).lock_owned().await;
            match OwnedMutexGuard::try_map(guard, |state| state.as_mut()) {
                Ok(keeper) => {
                    self.touch(&handle.slot);
                    return Ok(SessionGuard {
                        key: handle.slot.key.clone(),
                        keeper,
                    });
                }
                Err(guard) => {
                    drop(guard);
                    tracing::debug!(session = %handle.slot.key, "slot evicted before lock, re-resolving");
                    // 被驱逐前已经持久化的状态属于本句柄，不能按 Fresh 丢弃
                    let mode = match handle.mode {
                        RestoreMode::Fresh => RestoreMode::Auto,
                        mode => mode,
                    };
                    handle = self.resolve(handle.slot.key.clone(), mode).await?;
                }
            }
        }
        Err(MemoryError::CapacityExceeded {
            capacity: self.settings.max_sessions,
            reason: format!("session {} evicted repeatedly while acquiring", handle.slot.key),
        })
    }

    /// resolve + lock
    pub async fn acquire(&self, key: SessionKey, mode: RestoreMode) -> MemoryResult<SessionGuard> {
        let handle = self.resolve(key, mode).await?;
        self.lock(&handle).await
    }

    /// 释放句柄：已结束且无待写状态的会话直接移出池，其余仅刷新访问时间
    pub async fn release(&self, handle: SessionHandle) {
        let slot = handle.slot;
        let mut guard = Arc::clone(&slot.state).lock_owned().await;
        let finished = guard
            .as_ref()
            .is_some_and(|k| k.status() == SessionStatus::Ended && !k.is_dirty());
        if finished {
            if self.remove_if_current(&slot, None) {
                *guard = None;
                tracing::debug!(session = %slot.key, "released ended session");
            }
        } else if guard.is_some() {
            self.touch(&slot);
        }
    }

    /// 空闲清扫：逐个加锁，持久化后移除超过 TTL 的会话
    pub async fn evict_idle(&self) -> SweepReport {
        let ttl = self.settings.session_ttl;
        let candidates: Vec<(Arc<SessionSlot>, u64)> = {
            let entries = self.entries();
            entries
                .values()
                .filter(|slot| self.idle_for(slot) > ttl)
                .map(|slot| (Arc::clone(slot), slot.tick()))
                .collect()
        };

        let mut report = SweepReport::default();
        for (slot, tick) in candidates {
            let mut guard = Arc::clone(&slot.state).lock_owned().await;
            if slot.tick() != tick || self.idle_for(&slot) <= ttl {
                continue;
            }
            if let Some(keeper) = guard.as_ref() {
                if keeper.is_dirty() {
                    if let Err(e) = keeper.persist_snapshot().await {
                        tracing::error!(session = %slot.key, error = %e, "idle eviction failed to persist, keeping session");
                        report.retained += 1;
                        continue;
                    }
                }
            }
            if self.remove_if_current(&slot, Some(tick)) {
                *guard = None;
                report.evicted += 1;
                tracing::info!(session = %slot.key, idle = ?self.idle_for(&slot), "evicted idle session");
            }
        }
        report
    }

    /// 后台空闲清扫任务，token 取消后退出
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let interval = self.settings.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::info!("session sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = pool.evict_idle().await;
                        if report.evicted > 0 || report.retained > 0 {
                            tracing::info!(evicted = report.evicted, retained = report.retained, "idle sweep finished");
                        }
                    }
                }
            }
        })
    }

    /// 关闭：持久化所有 dirty 会话并清空池；失败的条目保留，返回最后一个错误
    pub async fn shutdown(&self) -> MemoryResult<usize> {
        let slots: Vec<Arc<SessionSlot>> = self.entries().values().cloned().collect();
        let mut persisted = 0;
        let mut last_error = None;
        for slot in slots {
            let mut guard = Arc::clone(&slot.state).lock_owned().await;
            if let Some(keeper) = guard.as_ref() {
                if keeper.is_dirty() {
                    match keeper.persist_snapshot().await {
                        Ok(()) => persisted += 1,
                        Err(e) => {
                            tracing::error!(session = %slot.key, error = %e, "failed to persist session on shutdown");
                            last_error = Some(e);
                            continue;
                        }
                    }
                }
            }
            if self.remove_if_current(&slot, None) {
                *guard = None;
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(persisted),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let entries = self.entries();
        let count = entries.len();
        let capacity = self.settings.max_sessions;
        let ages: Vec<f64> = entries
            .values()
            .map(|slot| slot.created_at.elapsed().as_secs_f64())
            .collect();
        PoolStats {
            count,
            capacity,
            ttl_secs: self.settings.session_ttl.as_secs(),
            dirty_count: entries.values().filter(|slot| slot.is_dirty()).count(),
            avg_age_secs: if ages.is_empty() {
                0.0
            } else {
                ages.iter().sum::<f64>() / ages.len() as f64
            },
            oldest_age_secs: ages.iter().copied().fold(0.0, f64::max),
            utilization: if capacity == 0 {
                0.0
            } else {
                count as f64 / capacity as f64
            },
        }
    }
}
