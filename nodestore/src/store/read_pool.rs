//! Background read threads for async prefetch.
//!
//! Requests queue in key order so the backend sees tight access patterns;
//! a generation counter ticks each time a worker wraps past the end of the
//! queue, which is what `wait_reads` observes. Shutdown is cooperative:
//! queued reads are discarded and the threads joined.

use alloy_primitives::B256;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

/// Implemented by each store topology; workers route the read back through
/// the owner's full fetch path so caches are populated.
pub(crate) trait PrefetchTarget: Send + Sync {
    fn prefetch(&self, hash: &B256, seq: u32);
}

struct ReadState {
    queue: BTreeMap<B256, u32>,
    last: B256,
    shut: bool,
    generation: u64,
}

struct ReadShared {
    state: Mutex<ReadState>,
    work: Condvar,
    generations: Condvar,
}

pub(crate) struct ReadPool {
    shared: Arc<ReadShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ReadPool {
    pub(crate) fn new(read_threads: usize, target: Weak<dyn PrefetchTarget>) -> Self {
        let shared = Arc::new(ReadShared {
            state: Mutex::new(ReadState {
                queue: BTreeMap::new(),
                last: B256::ZERO,
                shut: false,
                generation: 0,
            }),
            work: Condvar::new(),
            generations: Condvar::new(),
        });
        let mut threads = Vec::with_capacity(read_threads);
        for i in 0..read_threads {
            let shared = Arc::clone(&shared);
            let target = Weak::clone(&target);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("prefetch-{i}"))
                    .spawn(move || worker(shared, target))
                    .expect("spawn prefetch thread"),
            );
        }
        Self {
            shared,
            threads: Mutex::new(threads),
        }
    }

    pub(crate) fn enqueue(&self, hash: &B256, seq: u32) {
        let mut state = self.shared.state.lock().expect("read lock");
        if state.shut {
            return;
        }
        if state.queue.insert(*hash, seq).is_none() {
            self.shared.work.notify_one();
        }
    }

    /// Block until pending reads drain. Waking two generations out covers
    /// requests racing in behind the current queue position.
    pub(crate) fn wait_reads(&self) {
        let mut state = self.shared.state.lock().expect("read lock");
        let wake_generation = state.generation + 2;
        while !state.shut && !state.queue.is_empty() && state.generation < wake_generation {
            state = self.shared.generations.wait(state).expect("read lock");
        }
    }

    pub(crate) fn stop(&self) {
        {
            let mut state = self.shared.state.lock().expect("read lock");
            if state.shut {
                return;
            }
            state.shut = true;
            self.shared.work.notify_all();
            self.shared.generations.notify_all();
        }
        let mut threads = self.threads.lock().expect("read threads lock");
        for thread in threads.drain(..) {
            let _ = thread.join();
        }
    }
}

impl Drop for ReadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker(shared: Arc<ReadShared>, target: Weak<dyn PrefetchTarget>) {
    loop {
        let (hash, seq) = {
            let mut state = shared.state.lock().expect("read lock");
            loop {
                if state.shut {
                    return;
                }
                if !state.queue.is_empty() {
                    break;
                }
                // All work is done.
                shared.generations.notify_all();
                state = shared.work.wait(state).expect("read lock");
            }
            // Read in key order to make the backend more efficient.
            let next = state.queue.range(state.last..).next().map(|(&k, &s)| (k, s));
            let (hash, seq) = match next {
                Some(entry) => entry,
                None => {
                    // Wrapped: a generation has completed.
                    state.generation += 1;
                    shared.generations.notify_all();
                    let (&hash, &seq) = state.queue.iter().next().expect("nonempty queue");
                    (hash, seq)
                }
            };
            state.queue.remove(&hash);
            state.last = hash;
            (hash, seq)
        };
        // The store owns this pool; a failed upgrade means teardown is in
        // progress and the queued read can be discarded.
        if let Some(target) = target.upgrade() {
            target.prefetch(&hash, seq);
        }
    }
}
