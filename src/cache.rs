//! Filesystem backed screenshot cache
//!
//! `ScreenshotCache` owns every image under the screenshot directory. An
//! image is looked up by the key derived from its url and, when missing,
//! rendered by the external renderer. The check-then-render section runs
//! under a lock so a url is rendered by at most one caller at a time; late
//! arrivals wait for the lock and then find the finished image.
//!
//! The renderer writes into a uniquely named temporary file that is renamed
//! onto the final path only after a successful run, so a reader never sees
//! a half written image.

use crate::{
    derive_key, is_regular_file, screenshot_path, CacheMetrics, Config, Invocation, LockStrategy,
    ProcessRunner, ScreenshotError, Screenshot, ScriptTemplate, SubprocessRunner,
};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub const CONTENT_TYPE_PNG: &str = "image/png";
pub const NO_STORE: &str = "no-store";

/// Extra time given to the runner beyond the render timeout before the
/// cache stops waiting for it.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// High level entry point for cached screenshots
///
/// # Examples
///
/// ```rust,no_run
/// use page_snapshot::{Config, ScreenshotCache};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config {
///         renderer_path: Some("/usr/local/bin/phantomjs".into()),
///         ..Default::default()
///     };
///     if let Some(cache) = ScreenshotCache::from_config(&config)? {
///         let shot = cache.get_or_generate("https://example.com/", false).await?;
///         println!("{} bytes, {}", shot.data.len(), shot.cache_control);
///     }
///     Ok(())
/// }
/// ```
pub struct ScreenshotCache {
    cache_dir: PathBuf,
    renderer: PathBuf,
    renderer_args: Vec<String>,
    render_timeout: Duration,
    cache_max_age: Duration,
    template: ScriptTemplate,
    runner: Arc<dyn ProcessRunner>,
    locks: KeyLocks,
    renders_in_flight: AtomicUsize,
    metrics: Arc<CacheMetrics>,
}

impl ScreenshotCache {
    /// Build the cache described by `config`.
    ///
    /// Returns `Ok(None)` when no usable renderer is configured: the
    /// screenshot feature is then simply absent. A template that cannot be
    /// loaded or a screenshot directory that cannot be created is fatal.
    pub fn from_config(config: &Config) -> Result<Option<Self>, ScreenshotError> {
        let renderer = match &config.renderer_path {
            None => {
                warn!("No renderer configured, so no screenshots are available");
                return Ok(None);
            }
            Some(path) if !is_regular_file(path) => {
                warn!(
                    "Could not find {} so no screenshots are available",
                    path.display()
                );
                return Ok(None);
            }
            Some(path) => path.clone(),
        };

        let template = ScriptTemplate::load_or_embedded(config.template_path.as_deref())?;
        let cache = Self::new(
            config,
            renderer,
            template,
            Arc::new(SubprocessRunner::new()),
            Arc::new(CacheMetrics::new()),
        )?;
        info!(
            "Will use {} to create screenshots in {}",
            cache.renderer.display(),
            cache.cache_dir.display()
        );
        Ok(Some(cache))
    }

    pub fn new(
        config: &Config,
        renderer: PathBuf,
        template: ScriptTemplate,
        runner: Arc<dyn ProcessRunner>,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Self, ScreenshotError> {
        let cache_dir = config.screenshot_dir();
        std::fs::create_dir_all(&cache_dir)?;
        let cache_dir = std::fs::canonicalize(&cache_dir)?;

        Ok(Self {
            cache_dir,
            renderer,
            renderer_args: config.renderer_args.clone(),
            render_timeout: config.render_timeout,
            cache_max_age: config.cache_max_age,
            template,
            runner,
            locks: KeyLocks::new(config.lock_strategy),
            renders_in_flight: AtomicUsize::new(0),
            metrics,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn renderer(&self) -> &Path {
        &self.renderer
    }

    pub fn renders_in_flight(&self) -> usize {
        self.renders_in_flight.load(Ordering::Relaxed)
    }

    /// Number of keys with a holder or waiter on their lock.
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }

    /// Where the image for `url` is (or would be) stored.
    pub fn path_for(&self, url: &str) -> PathBuf {
        screenshot_path(&self.cache_dir, &derive_key(url))
    }

    /// Return the screenshot for `url`, rendering it first if needed.
    ///
    /// With `refresh` the cached image is discarded first and the response
    /// is marked `no-store`.
    pub async fn get_or_generate(
        &self,
        url: &str,
        refresh: bool,
    ) -> Result<Screenshot, ScreenshotError> {
        if url.is_empty() {
            return Err(ScreenshotError::EmptyUrl);
        }

        let key = derive_key(url);
        let path = screenshot_path(&self.cache_dir, &key);
        let _lease = self.locks.acquire(&key).await;

        if refresh {
            self.remove_image(&path).await;
        }

        // A refresh always renders: the rename replaces an image that could
        // not be deleted above.
        let generated = if !refresh && file_exists(&path).await {
            debug!("Cache hit for {} ({})", url, key);
            self.metrics.record_hit();
            false
        } else {
            self.metrics.record_miss();
            if !self.generate(url, &path).await? {
                return Err(ScreenshotError::NotFound(url.to_string()));
            }
            true
        };

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ScreenshotError::NotFound(url.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Screenshot {
            key,
            data,
            content_type: CONTENT_TYPE_PNG,
            cache_control: self.cache_control(refresh),
            generated,
        })
    }

    /// Drop the cached image for `url`. Returns whether one existed.
    pub async fn invalidate(&self, url: &str) -> Result<bool, ScreenshotError> {
        if url.is_empty() {
            return Err(ScreenshotError::EmptyUrl);
        }

        let key = derive_key(url);
        let path = screenshot_path(&self.cache_dir, &key);
        let _lease = self.locks.acquire(&key).await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Removed cached screenshot {}", path.display());
                self.metrics.record_invalidation();
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn cache_control(&self, refresh: bool) -> String {
        if refresh {
            NO_STORE.to_string()
        } else {
            format!("public, max-age={}", self.cache_max_age.as_secs())
        }
    }

    /// Best effort removal ahead of a refresh.
    async fn remove_image(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                debug!("Deleted {} for refresh", path.display());
                self.metrics.record_invalidation();
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Could not delete {} before refresh, rendering over it: {}",
                path.display(),
                e
            ),
        }
    }

    /// Render `url` into `path`. `Ok(false)` when the renderer succeeded
    /// but wrote no image.
    async fn generate(&self, url: &str, path: &Path) -> Result<bool, ScreenshotError> {
        let job = RenderJob::new(&self.cache_dir);
        let script = self.template.build(url, &job.output_path);
        tokio::fs::write(&job.script_path, script).await?;
        info!("Going to create {}", job.script_path.display());

        let invocation = Invocation::new(&self.renderer, &self.cache_dir, self.render_timeout)
            .args(&self.renderer_args)
            .arg(job.script_path.as_os_str());

        let in_flight = InFlight::enter(&self.renders_in_flight, &self.metrics);
        let report = match timeout(self.render_timeout + KILL_GRACE, self.runner.run(&invocation)).await {
            Ok(report) => report,
            Err(_) => {
                warn!("Gave up waiting on {}", invocation);
                Err(ScreenshotError::Timeout(self.render_timeout))
            }
        };
        let report = report.and_then(|report| report.into_result(&invocation));
        in_flight.finish(report.as_ref().err());

        if let Err(e) = report {
            warn!("Screenshot of {} failed: {}", url, e);
            return Err(e);
        }

        if file_exists(&job.output_path).await {
            tokio::fs::rename(&job.output_path, path).await?;
            Ok(true)
        } else {
            warn!("{} exited cleanly but wrote no image for {}", invocation, url);
            Ok(false)
        }
    }
}

/// Counts one render as in flight until dropped, including when the
/// caller's future is dropped mid-render.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    metrics: &'a CacheMetrics,
    start: Instant,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, metrics: &'a CacheMetrics) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics.render_started();
        Self {
            counter,
            metrics,
            start: Instant::now(),
        }
    }

    fn finish(self, error: Option<&ScreenshotError>) {
        self.metrics.render_finished(self.start.elapsed(), error);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
        self.metrics.render_ended();
    }
}

/// Scratch files of one render attempt, removed on drop.
struct RenderJob {
    script_path: PathBuf,
    output_path: PathBuf,
}

impl RenderJob {
    fn new(cache_dir: &Path) -> Self {
        let id = uuid::Uuid::new_v4();
        Self {
            script_path: cache_dir.join(format!("render-{id}.js")),
            output_path: cache_dir.join(format!("render-{id}.png")),
        }
    }
}

impl Drop for RenderJob {
    fn drop(&mut self) {
        for path in [&self.script_path, &self.output_path] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Could not remove {}: {}", path.display(), e),
            }
        }
    }
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Registry of async locks keyed by cache key.
struct KeyLocks {
    strategy: LockStrategy,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    fn new(strategy: LockStrategy) -> Self {
        Self {
            strategy,
            locks: DashMap::new(),
        }
    }

    fn slot(&self, key: &str) -> String {
        match self.strategy {
            LockStrategy::PerKey => key.to_string(),
            LockStrategy::Global => String::new(),
        }
    }

    async fn acquire(&self, key: &str) -> KeyLease<'_> {
        let slot = self.slot(key);
        let lock = self
            .locks
            .entry(slot.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        KeyLease {
            locks: self,
            slot,
            guard: Some(lock.lock_owned().await),
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Holds a key's lock; forgets the key once nobody else is waiting on it.
struct KeyLease<'a> {
    locks: &'a KeyLocks,
    slot: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.slot, |_, lock| Arc::strong_count(lock) == 1);
    }
}
