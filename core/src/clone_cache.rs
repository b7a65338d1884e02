//! TTL- and size-bounded cache of shallow repository working copies.
//!
//! Entries live in a map behind a coarse mutex; the actual clone happens
//! under a per-repo async mutex so concurrent callers wait instead of
//! cloning twice. The cache mutex is never held across I/O. Clones are
//! staged into a `.partial` directory and renamed into place, so a clone is
//! either fully present or absent. A background sweep evicts by age, then by
//! LRU under total-size pressure. Entries still held by a reader are never
//! deleted by the sweep; they are marked evicted and removed from disk when
//! the last handle drops.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::CloneCacheConfig;
use crate::metrics::MetricsRegistry;
use crate::safe_cmd::CloneOptions;
use crate::safe_cmd::SafeCommand;
use crate::safe_cmd::directory_size;
use crate::safe_cmd::ensure_valid_repo;

/// Performs the actual clone into a destination directory.
///
/// The production implementation is [`GitCloner`]; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait Cloner: Send + Sync {
    async fn clone_into(&self, repo: &str, dest: &Path, cancel: &CancellationToken) -> Result<()>;
}

/// `git clone` through [`SafeCommand`]: hooks disabled, shallow, size quota
/// enforced before the clone is published.
pub struct GitCloner {
    git: SafeCommand,
    max_size_bytes: u64,
}

impl GitCloner {
    pub fn new(git: SafeCommand, max_size_bytes: u64) -> Self {
        Self { git, max_size_bytes }
    }
}

#[async_trait]
impl Cloner for GitCloner {
    async fn clone_into(&self, repo: &str, dest: &Path, cancel: &CancellationToken) -> Result<()> {
        let options = CloneOptions {
            branch: None,
            shallow: true,
            max_size_bytes: Some(self.max_size_bytes),
        };
        self.git.git_clone(repo, dest, &options, cancel).await
    }
}

#[derive(Debug)]
struct EntryState {
    cloned: bool,
    created: Instant,
}

#[derive(Debug)]
struct CacheEntry {
    repo: String,
    /// Unique per entry generation, so a deferred-evicted clone can coexist
    /// on disk with its replacement.
    path: PathBuf,
    staging: PathBuf,
    /// Per-repo mutex: guards the clone itself and the entry state.
    state: AsyncMutex<EntryState>,
    refcount: AtomicUsize,
    evicted: AtomicBool,
    size_bytes: AtomicU64,
    last_access: StdMutex<Instant>,
}

impl CacheEntry {
    fn touch(&self) {
        *self.last_access.lock().expect("cache entry lock") = Instant::now();
    }

    fn last_access(&self) -> Instant {
        *self.last_access.lock().expect("cache entry lock")
    }

    fn held(&self) -> bool {
        self.refcount.load(Ordering::Acquire) > 0
    }
}

/// Scoped handle to a cached clone. Dropping it releases the refcount;
/// dropping the last refcount on an evicted entry removes it from disk.
#[derive(Debug)]
pub struct CloneHandle {
    entry: Arc<CacheEntry>,
}

impl CloneHandle {
    pub fn path(&self) -> &Path {
        &self.entry.path
    }

    pub fn repo(&self) -> &str {
        &self.entry.repo
    }
}

impl Drop for CloneHandle {
    fn drop(&mut self) {
        let remaining = self.entry.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.entry.evicted.load(Ordering::Acquire) {
            debug!(
                repo = self.entry.repo.as_str(),
                "removing evicted clone on last release"
            );
            let _ = std::fs::remove_dir_all(&self.entry.path);
        }
    }
}

pub struct CloneCache {
    config: CloneCacheConfig,
    cloner: Arc<dyn Cloner>,
    metrics: Arc<MetricsRegistry>,
    entries: StdMutex<HashMap<String, Arc<CacheEntry>>>,
    generation: AtomicU64,
    sweeper: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl CloneCache {
    pub fn new(
        config: CloneCacheConfig,
        cloner: Arc<dyn Cloner>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            cloner,
            metrics,
            entries: StdMutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            sweeper: StdMutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Production `git`-backed cache.
    pub fn with_git(
        config: CloneCacheConfig,
        redactor: Arc<crate::redact::SecretRedactor>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let max_size_bytes = config.max_clone_bytes();
        let cloner = Arc::new(GitCloner::new(
            SafeCommand::new("git", redactor),
            max_size_bytes,
        ));
        Self::new(config, cloner, metrics)
    }

    /// Get a handle to a fresh clone of `repo`, cloning if absent or stale.
    /// At most one clone per repo is in flight at any instant.
    pub async fn acquire(&self, repo: &str, cancel: &CancellationToken) -> Result<CloneHandle> {
        ensure_valid_repo(repo)?;
        let entry = self.entry_for(repo);

        // The map mutex is released; the per-repo mutex covers the I/O.
        let mut state = entry.state.lock().await;

        if state.cloned {
            let fresh = state.created.elapsed() < self.config.max_age() && entry.path.is_dir();
            if fresh {
                self.metrics.inc_counter("clone_cache_hits_total", &[], 1);
                entry.touch();
                entry.refcount.fetch_add(1, Ordering::AcqRel);
                return Ok(CloneHandle {
                    entry: Arc::clone(&entry),
                });
            }
            debug!(repo, "cached clone stale, removing");
            let _ = tokio::fs::remove_dir_all(&entry.path).await;
            state.cloned = false;
        }

        self.metrics.inc_counter("clone_cache_misses_total", &[], 1);
        tokio::fs::create_dir_all(&self.config.clone_dir)
            .await
            .map_err(TriageErr::Io)?;

        // Stage into a partial directory and rename into place so readers
        // never observe a half-written clone.
        let _ = tokio::fs::remove_dir_all(&entry.staging).await;

        info!(repo, dest = %entry.path.display(), "cloning repository");
        if let Err(err) = Cloner::clone_into(&*self.cloner, repo, &entry.staging, cancel).await {
            let _ = tokio::fs::remove_dir_all(&entry.staging).await;
            return Err(err);
        }

        let size = directory_size(&entry.staging).map_err(TriageErr::Io)?;
        tokio::fs::rename(&entry.staging, &entry.path)
            .await
            .map_err(TriageErr::Io)?;

        state.cloned = true;
        state.created = Instant::now();
        entry.size_bytes.store(size, Ordering::Release);
        entry.touch();
        entry.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(CloneHandle {
            entry: Arc::clone(&entry),
        })
    }

    fn entry_for(&self, repo: &str) -> Arc<CacheEntry> {
        let mut entries = self.entries.lock().expect("clone cache lock");
        if let Some(existing) = entries.get(repo)
            && !existing.evicted.load(Ordering::Acquire)
        {
            return Arc::clone(existing);
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let safe_name = format!("{}.{generation}", repo.replace('/', "_"));
        let entry = Arc::new(CacheEntry {
            repo: repo.to_string(),
            path: self.config.clone_dir.join(&safe_name),
            staging: self.config.clone_dir.join(format!("{safe_name}.partial")),
            state: AsyncMutex::new(EntryState {
                cloned: false,
                created: Instant::now(),
            }),
            refcount: AtomicUsize::new(0),
            evicted: AtomicBool::new(false),
            size_bytes: AtomicU64::new(0),
            last_access: StdMutex::new(Instant::now()),
        });
        entries.insert(repo.to_string(), Arc::clone(&entry));
        entry
    }

    /// Spawn the periodic eviction sweep. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock().expect("clone cache lock");
        if sweeper.is_some() {
            return;
        }
        let cache = Arc::clone(self);
        let interval = self.config.cleanup_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cache.cancel.cancelled() => break,
                    _ = ticker.tick() => cache.sweep(),
                }
            }
        }));
    }

    /// One eviction pass: expired entries first, then LRU-by-last-access
    /// until the combined size fits the total quota. Entries held by a
    /// reader are marked evicted but their files are left for the final
    /// handle drop to remove.
    pub fn sweep(&self) {
        let max_age = self.config.max_age();
        let max_total = self.config.max_total_bytes();
        let mut delete_now: Vec<(String, PathBuf)> = Vec::new();

        {
            let mut entries = self.entries.lock().expect("clone cache lock");

            let mut expired: Vec<String> = Vec::new();
            for (repo, entry) in entries.iter() {
                // try_lock: an in-flight clone holds the state mutex and is
                // by definition not evictable.
                let Ok(state) = entry.state.try_lock() else {
                    continue;
                };
                if state.cloned && state.created.elapsed() > max_age {
                    expired.push(repo.clone());
                }
            }
            for repo in expired {
                if let Some(entry) = entries.remove(&repo) {
                    entry.evicted.store(true, Ordering::Release);
                    if !entry.held() {
                        delete_now.push((repo, entry.path.clone()));
                    }
                }
            }

            let mut total: u64 = entries
                .values()
                .map(|entry| entry.size_bytes.load(Ordering::Acquire))
                .sum();
            if total > max_total {
                let mut by_age: Vec<(String, Instant, u64)> = entries
                    .iter()
                    .filter(|(_, entry)| {
                        !entry.held()
                            && entry.state.try_lock().map(|s| s.cloned).unwrap_or(false)
                    })
                    .map(|(repo, entry)| {
                        (
                            repo.clone(),
                            entry.last_access(),
                            entry.size_bytes.load(Ordering::Acquire),
                        )
                    })
                    .collect();
                by_age.sort_by_key(|(_, last_access, _)| *last_access);
                for (repo, _, size) in by_age {
                    if total <= max_total {
                        break;
                    }
                    if let Some(entry) = entries.remove(&repo) {
                        entry.evicted.store(true, Ordering::Release);
                        delete_now.push((repo, entry.path.clone()));
                        total = total.saturating_sub(size);
                    }
                }
            }
        }

        // Disk I/O happens strictly outside the map mutex.
        for (repo, path) in delete_now {
            self.metrics.inc_counter("clone_cache_evictions_total", &[], 1);
            debug!(repo = repo.as_str(), "evicting cached clone");
            if let Err(err) = std::fs::remove_dir_all(&path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(repo = repo.as_str(), error = %err, "failed to remove evicted clone");
            }
        }
    }

    /// Stop the sweeper and drop every unheld clone. Called from
    /// `Agent::stop`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().expect("clone cache lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let victims: Vec<PathBuf> = {
            let mut entries = self.entries.lock().expect("clone cache lock");
            let unheld: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| !entry.held())
                .map(|(repo, _)| repo.clone())
                .collect();
            unheld
                .into_iter()
                .filter_map(|repo| {
                    entries.remove(&repo).map(|entry| {
                        entry.evicted.store(true, Ordering::Release);
                        entry.path.clone()
                    })
                })
                .collect()
        };
        for path in victims {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Fake cloner that writes a small tree and counts invocations.
    struct FakeCloner {
        calls: AtomicU32,
        payload_bytes: usize,
        delay: Duration,
    }

    impl FakeCloner {
        fn new(payload_bytes: usize) -> Self {
            Self {
                calls: AtomicU32::new(0),
                payload_bytes,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl Cloner for FakeCloner {
        async fn clone_into(
            &self,
            _repo: &str,
            dest: &Path,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("main.py"), vec![b'x'; self.payload_bytes])?;
            Ok(())
        }
    }

    fn cache_config(dir: &Path) -> CloneCacheConfig {
        CloneCacheConfig {
            clone_dir: dir.to_path_buf(),
            clone_cache_ttl_secs: 3600,
            clone_max_size_mb: 1,
            max_total_size_mb: 1,
            cleanup_interval_secs: 300,
        }
    }

    fn new_cache(dir: &Path, cloner: Arc<FakeCloner>) -> CloneCache {
        CloneCache::new(cache_config(dir), cloner, Arc::new(MetricsRegistry::new()))
    }

    #[tokio::test]
    async fn second_acquire_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = Arc::new(FakeCloner::new(16));
        let cache = new_cache(dir.path(), Arc::clone(&cloner));
        let cancel = CancellationToken::new();

        let first = cache.acquire("acme/api", &cancel).await.unwrap();
        assert!(first.path().join("main.py").exists());
        drop(first);

        let second = cache.acquire("acme/api", &cancel).await.unwrap();
        assert_eq!(cloner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.repo(), "acme/api");
    }

    #[tokio::test]
    async fn concurrent_acquires_clone_once() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = Arc::new(FakeCloner {
            delay: Duration::from_millis(30),
            ..FakeCloner::new(16)
        });
        let cache = Arc::new(new_cache(dir.path(), Arc::clone(&cloner)));
        let cancel = CancellationToken::new();

        let a = {
            let cache = Arc::clone(&cache);
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.acquire("acme/api", &cancel).await })
        };
        let b = {
            let cache = Arc::clone(&cache);
            let cancel = cancel.clone();
            tokio::spawn(async move { cache.acquire("acme/api", &cancel).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(cloner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_recloned() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = Arc::new(FakeCloner::new(16));
        let mut config = cache_config(dir.path());
        config.clone_cache_ttl_secs = 0;
        let cache = CloneCache::new(config, Arc::<FakeCloner>::clone(&cloner), Arc::new(MetricsRegistry::new()));
        let cancel = CancellationToken::new();

        drop(cache.acquire("acme/api", &cancel).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(cache.acquire("acme/api", &cancel).await.unwrap());
        assert_eq!(cloner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sweep_defers_removal_of_held_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = Arc::new(FakeCloner::new(16));
        let mut config = cache_config(dir.path());
        config.clone_cache_ttl_secs = 0;
        let cache = CloneCache::new(config, cloner, Arc::new(MetricsRegistry::new()));
        let cancel = CancellationToken::new();

        let held = cache.acquire("acme/held", &cancel).await.unwrap();
        let held_path = held.path().to_path_buf();
        let idle = cache.acquire("acme/idle", &cancel).await.unwrap();
        let idle_path = idle.path().to_path_buf();
        drop(idle);

        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.sweep();

        assert!(held_path.exists(), "held clone must survive the sweep");
        assert!(!idle_path.exists(), "idle expired clone must be removed");

        // The held entry was marked evicted; the last drop removes it.
        drop(held);
        assert!(!held_path.exists());
    }

    #[tokio::test]
    async fn size_pressure_evicts_least_recently_used() {
        let dir = tempfile::tempdir().unwrap();
        // Each fake clone is ~700 KiB; the 1 MiB total quota only fits one.
        let cloner = Arc::new(FakeCloner::new(700 * 1024));
        let cache = new_cache(dir.path(), cloner);
        let cancel = CancellationToken::new();

        let old = cache.acquire("acme/old", &cancel).await.unwrap();
        let old_path = old.path().to_path_buf();
        drop(old);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = cache.acquire("acme/new", &cancel).await.unwrap();
        let newer_path = newer.path().to_path_buf();
        drop(newer);

        cache.sweep();
        assert!(!old_path.exists(), "LRU entry should be evicted");
        assert!(newer_path.exists(), "most recent entry should survive");
    }

    #[tokio::test]
    async fn shutdown_removes_unheld_clones() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = Arc::new(FakeCloner::new(16));
        let cache = Arc::new(new_cache(dir.path(), cloner));
        cache.start_sweeper();
        let cancel = CancellationToken::new();

        let handle = cache.acquire("acme/api", &cancel).await.unwrap();
        let path = handle.path().to_path_buf();
        drop(handle);

        cache.shutdown().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn invalid_repo_is_rejected_before_any_io() {
        let dir = tempfile::tempdir().unwrap();
        let cloner = Arc::new(FakeCloner::new(16));
        let cache = new_cache(dir.path(), cloner);
        let err = cache
            .acquire("owner/repo;rm -rf /", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TriageErr::InvalidInput(_)));
    }
}
