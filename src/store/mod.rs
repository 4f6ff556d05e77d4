use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::index::Index;
use crate::primary::{PrimaryIter, PrimaryStorage};
use crate::scheduler::{BackgroundTask, Scheduler};
use crate::types::{KeySize, KeyedBlock, Size, Work};

const LOCK_FILE: &str = "cinder.lock";
const INDEX_FILE: &str = "cinder.index";
const BUCKETS_FILE: &str = "cinder.buckets";

/// How long an over-rate writer is parked before its put returns.
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(25);

/// The store façade: a primary log holding full keys and values, and an
/// index mapping key prefixes to positions in it.
///
/// Writes go to the primary first, then the index; both stage work in
/// memory until the background flusher (or `close`) commits it. Because the
/// index only keeps prefixes, every read confirms the candidate block
/// against the full key in the primary.
pub struct Store<P: PrimaryStorage> {
    inner: Arc<StoreInner<P>>,
    scheduler: Scheduler,
    _lock: FileLock,
}

struct StoreInner<P: PrimaryStorage> {
    index: Index<P>,
    primary: Arc<P>,
    state: Mutex<StoreState>,
    rate: Mutex<RateState>,
    burst_rate: Work,
    sync_interval: Duration,
}

struct StoreState {
    open: bool,
    running: bool,
    err: Option<Error>,
}

struct RateState {
    /// Rate at which data was last observed to flush, in bytes per second.
    /// Zero until a flush has exceeded the burst threshold.
    rate: f64,
    last_flush: Instant,
}

impl<P: PrimaryStorage> Store<P> {
    /// Opens a store in `config.dir`, taking an exclusive lock on it. If the
    /// index is empty but the primary already holds records, the index is
    /// rebuilt from the primary before the store is handed out.
    pub fn open(config: StoreConfig, primary: P) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;

        let primary = Arc::new(primary);
        let index = Index::open(
            config.dir.join(INDEX_FILE),
            config.dir.join(BUCKETS_FILE),
            Arc::clone(&primary),
            config.index_bits,
        )?;

        let store = Self {
            inner: Arc::new(StoreInner {
                index,
                primary,
                state: Mutex::new(StoreState {
                    open: true,
                    running: false,
                    err: None,
                }),
                rate: Mutex::new(RateState {
                    rate: 0.0,
                    last_flush: Instant::now(),
                }),
                burst_rate: config.burst_rate,
                sync_interval: config.sync_interval,
            }),
            scheduler: Scheduler::new(),
            _lock: lock,
        };
        store.inner.recover()?;
        Ok(store)
    }

    /// Starts the periodic background flusher. Idempotent; must be called
    /// from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock()?;
        if !state.open {
            return Err(Error::Closed);
        }
        if state.running {
            return Ok(());
        }
        state.running = true;
        drop(state);

        self.scheduler.register(Arc::new(FlushTask {
            store: Arc::clone(&self.inner),
        }))
    }

    /// Writes a key-value pair. Content-addressed keys are immutable, so a
    /// key that is already present is rejected with `KeyExists` rather than
    /// silently written twice.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.check_writable()?;
        if self.has(key)? {
            return Err(Error::KeyExists);
        }

        let block = self.inner.primary.put(key, value)?;
        let index_key = self.inner.primary.index_key(key)?;
        self.inner.index.put(
            &index_key,
            KeyedBlock {
                block,
                key_size: key.len() as KeySize,
            },
        )?;

        // Admission control: writers outrunning the flusher get parked once
        // the backlog passes the burst threshold.
        let sleep = {
            let rate = self.inner.rate.lock()?;
            let elapsed = rate.last_flush.elapsed().as_secs_f64();
            let work = self.inner.outstanding()?;
            let current = (work as f64 / elapsed).ceil();
            rate.rate > 0.0 && current > rate.rate && work > self.inner.burst_rate
        };
        if sleep {
            thread::sleep(BACKPRESSURE_SLEEP);
        }
        Ok(())
    }

    /// Returns the value for a key, if present.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.check_open()?;
        let index_key = self.inner.primary.index_key(key)?;
        let found = match self.inner.index.get(&index_key)? {
            Some(found) => found,
            None => return Ok(None),
        };
        // The index stores only prefixes; the hit is real only if the full
        // key in the primary matches.
        let (primary_key, value) = self.inner.primary.get(found.block.offset)?;
        if primary_key.as_slice() != key {
            return Ok(None);
        }
        Ok(Some(value))
    }

    /// Returns whether a key is present.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        self.inner.check_open()?;
        let index_key = self.inner.primary.index_key(key)?;
        let found = match self.inner.index.get(&index_key)? {
            Some(found) => found,
            None => return Ok(false),
        };
        let primary_key = self.inner.primary.get_index_key(found.block.offset)?;
        Ok(primary_key == index_key)
    }

    /// Returns the size of the value stored for a key, without reading it.
    pub fn get_size(&self, key: &[u8]) -> Result<Option<Size>> {
        self.inner.check_open()?;
        let index_key = self.inner.primary.index_key(key)?;
        let found = match self.inner.index.get(&index_key)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let primary_key = self.inner.primary.get_index_key(found.block.offset)?;
        if primary_key != index_key {
            return Ok(None);
        }
        Ok(Some(found.block.size - Size::from(found.key_size)))
    }

    /// Commits outstanding work now instead of waiting for the flusher.
    /// Failures are stored and surfaced through `err`.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Returns the error a background flush left behind, if any. While one
    /// is set the store stays readable but rejects writes.
    pub fn err(&self) -> Option<Error> {
        self.inner.stored_err()
    }

    /// Stops the flusher, commits outstanding work and closes both files.
    /// A second close is a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock()?;
            if !state.open {
                return Ok(());
            }
            state.open = false;
            state.running = false;
        }
        self.scheduler.shutdown().await?;

        if self.inner.outstanding()? > 0 {
            if let Err(e) = self.inner.commit() {
                self.inner.set_err(e);
            }
        }
        if let Some(err) = self.inner.stored_err() {
            return Err(err);
        }

        self.inner.index.close()?;
        self.inner.primary.close()?;
        Ok(())
    }
}

impl<P: PrimaryStorage> StoreInner<P> {
    fn check_open(&self) -> Result<()> {
        if !self.state.lock()?.open {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        let state = self.state.lock()?;
        if !state.open {
            return Err(Error::Closed);
        }
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        Ok(())
    }

    fn stored_err(&self) -> Option<Error> {
        match self.state.lock() {
            Ok(state) => state.err.clone(),
            Err(_) => Some(Error::MutexPoisoned),
        }
    }

    fn set_err(&self, err: Error) {
        if let Ok(mut state) = self.state.lock() {
            state.err = Some(err);
        }
    }

    fn outstanding(&self) -> Result<Work> {
        Ok(self.index.outstanding_work()? + self.primary.outstanding_work()?)
    }

    /// One flush cycle: commit outstanding work and track the rate it moved
    /// at, for admission control.
    fn flush(&self) {
        if let Ok(mut rate) = self.rate.lock() {
            rate.last_flush = Instant::now();
        }
        let outstanding = match self.outstanding() {
            Ok(work) => work,
            Err(e) => {
                self.set_err(e);
                return;
            }
        };
        if outstanding == 0 {
            return;
        }

        match self.commit() {
            Ok(work) => {
                if let Ok(mut rate) = self.rate.lock() {
                    let elapsed = rate.last_flush.elapsed().as_secs_f64();
                    if work > self.burst_rate && elapsed > 0.0 {
                        rate.rate = (work as f64 / elapsed).ceil();
                    }
                }
                tracing::debug!(bytes = work, "committed outstanding work");
            }
            Err(e) => {
                tracing::error!(error = %e, "background flush failed");
                self.set_err(e);
            }
        }
    }

    /// Flushes primary then index, then makes both durable. The index goes
    /// second so it never refers to primary bytes that were not written.
    fn commit(&self) -> Result<Work> {
        let primary_work = self.primary.flush()?;
        let index_work = self.index.flush()?;
        self.primary.sync()?;
        self.index.sync()?;
        Ok(primary_work + index_work)
    }

    /// Rebuilds the index by replaying the primary, for stores whose index
    /// was never persisted (or was deleted along with its bucket table).
    fn recover(&self) -> Result<()> {
        if self.index.file_len()? > 0 {
            return Ok(());
        }
        let mut iter = self.primary.iter()?;
        let mut restored = 0usize;
        while let Some((pos, key, value)) = iter.next()? {
            let index_key = self.primary.index_key(&key)?;
            self.index.put(
                &index_key,
                KeyedBlock::new(pos, (key.len() + value.len()) as Size, key.len() as KeySize),
            )?;
            restored += 1;
        }
        if restored > 0 {
            self.index.flush()?;
            self.index.sync()?;
            tracing::info!(records = restored, "rebuilt index from primary log");
        }
        Ok(())
    }
}

/// The periodic flush task registered by `Store::start`.
struct FlushTask<P: PrimaryStorage> {
    store: Arc<StoreInner<P>>,
}

#[async_trait::async_trait]
impl<P: PrimaryStorage> BackgroundTask for FlushTask<P> {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn interval(&self) -> Duration {
        self.store.sync_interval
    }

    async fn execute(&self) -> Result<()> {
        self.store.flush();
        Ok(())
    }
}
