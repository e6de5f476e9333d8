//! Results recorded so far, vectors still to run, and the lock that keeps them apart.

use itertools::Itertools;
use log::{info, warn};
use probe_data::{ProbeResult, TestVector};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Every result recorded so far, keyed by vector. Persisted whole, never incrementally.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStore {
    results: BTreeMap<TestVector, ProbeResult>,
}

impl CheckpointStore {
    pub fn from_file<A: AsRef<Path>>(path: A) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let store = serde_json::from_reader(reader)?;
        Ok(store)
    }

    /// Loads `path`, a missing file is the first run and gives an empty store.
    pub fn load<A: AsRef<Path>>(path: A) -> io::Result<Self> {
        match Self::from_file(&path) {
            Ok(store) => {
                info!("Loaded {} results from {:?}", store.len(), path.as_ref());
                Ok(store)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No checkpoint at {:?}, starting over", path.as_ref());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Replaces `path` atomically, a crash mid-write leaves the old checkpoint intact.
    pub fn write_bytes<A: AsRef<Path>>(path: A, data: &[u8]) -> io::Result<()> {
        let path = path.as_ref();
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut file = tempfile::NamedTempFile::new_in(directory)?;
        {
            let mut writer = std::io::BufWriter::new(file.as_file_mut());
            writer.write_all(data)?;
            writer.flush()?;
        }
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn save<A: AsRef<Path>>(&self, path: A) -> io::Result<()> {
        Self::write_bytes(path, &self.to_bytes()?)
    }

    /// Returns false and keeps the old entry if `result.vector` was already recorded.
    pub fn insert(&mut self, result: ProbeResult) -> bool {
        if self.results.contains_key(&result.vector) {
            return false;
        }
        self.results.insert(result.vector, result);
        true
    }

    pub fn contains(&self, vector: &TestVector) -> bool {
        self.results.contains_key(vector)
    }

    pub fn get(&self, vector: &TestVector) -> Option<&ProbeResult> {
        self.results.get(vector)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn vectors(&self) -> impl Iterator<Item = TestVector> + '_ {
        self.results.keys().copied()
    }

    pub fn results(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.values()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOrder {
    Sorted,
    /// A random seed is drawn and logged when none is given.
    Shuffled(Option<u64>),
}

/// Vectors still waiting to be probed.
#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: VecDeque<TestVector>,
}

impl WorkQueue {
    /// Every candidate not yet in `store`, duplicates dropped.
    pub fn build<I>(candidates: I, store: &CheckpointStore, order: QueueOrder) -> Self
    where
        I: IntoIterator<Item = TestVector>,
    {
        let mut pending: Vec<TestVector> = candidates
            .into_iter()
            .filter(|v| !store.contains(v))
            .collect();
        pending.sort_unstable();
        pending.dedup();

        match order {
            QueueOrder::Sorted => {}
            QueueOrder::Shuffled(seed) => {
                let seed = seed.unwrap_or_else(rand::random);
                info!("Shuffling {} vectors with seed: {}", pending.len(), seed);
                pending.shuffle(&mut Isaac64Rng::seed_from_u64(seed));
            }
        }

        Self {
            pending: pending.into(),
        }
    }

    pub fn pop(&mut self) -> Option<TestVector> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestVector> {
        self.pending.iter()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub recorded: usize,
    pub pending: usize,
    pub in_flight: usize,
}

impl Progress {
    pub fn remaining(&self) -> usize {
        self.pending + self.in_flight
    }

    pub fn total(&self) -> usize {
        self.recorded + self.remaining()
    }
}

#[derive(Debug)]
struct Inner {
    queue: WorkQueue,
    in_flight: BTreeSet<TestVector>,
    store: CheckpointStore,
}

/// Queue and store behind one lock.
///
/// A vector is pending, in flight or recorded, never two of them at once. In-flight
/// vectors are not persisted; a vector lost with the process is simply queued again
/// on the next start.
#[derive(Debug)]
pub struct RunState {
    inner: Mutex<Inner>,
    draining: AtomicBool,
}

impl RunState {
    pub fn new(queue: WorkQueue, store: CheckpointStore) -> Self {
        let queue = WorkQueue {
            pending: queue
                .pending
                .into_iter()
                .filter(|v| !store.contains(v))
                .collect(),
        };

        Self {
            inner: Mutex::new(Inner {
                queue,
                in_flight: BTreeSet::new(),
                store,
            }),
            draining: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic while holding the lock cannot leave the maps half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands out the next pending vector, `None` once the queue is empty or drained.
    pub fn next_vector(&self) -> Option<TestVector> {
        if self.is_draining() {
            return None;
        }

        let mut inner = self.lock();
        let vector = inner.queue.pop()?;
        inner.in_flight.insert(vector);
        Some(vector)
    }

    /// Records the result of an in-flight vector.
    pub fn record(&self, result: ProbeResult) {
        let mut inner = self.lock();
        if !inner.in_flight.remove(&result.vector) {
            warn!(
                "Dropping result for {} which is not in flight",
                result.vector
            );
            return;
        }
        if !inner.store.insert(result) {
            warn!("Result recorded twice");
        }
    }

    /// Stop handing out work; in-flight vectors still get recorded.
    pub fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> Progress {
        let inner = self.lock();
        Progress {
            recorded: inner.store.len(),
            pending: inner.queue.len(),
            in_flight: inner.in_flight.len(),
        }
    }

    /// Number of recorded results per outcome name.
    pub fn outcome_counts(&self) -> BTreeMap<&'static str, usize> {
        let inner = self.lock();
        inner
            .store
            .results()
            .map(|result| result.outcome.name())
            .counts()
            .into_iter()
            .collect()
    }

    /// Serializes the whole store while holding the lock; writing happens after release.
    pub fn checkpoint<A: AsRef<Path>>(&self, path: A) -> io::Result<usize> {
        let (data, count) = {
            let inner = self.lock();
            (inner.store.to_bytes()?, inner.store.len())
        };
        CheckpointStore::write_bytes(path, &data)?;
        Ok(count)
    }
}
