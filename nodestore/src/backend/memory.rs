//! In-memory backend, used for tests and ephemeral stores.

use super::{Backend, Fetched};
use crate::object::NodeObject;
use alloy_primitives::B256;
use eyre::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<B256, Arc<NodeObject>>>,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn store(&self, object: &Arc<NodeObject>) -> Result<()> {
        let mut objects = self.objects.lock().expect("backend lock");
        objects.insert(*object.hash(), Arc::clone(object));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn fetch(&self, hash: &B256) -> Result<Fetched> {
        let objects = self.objects.lock().expect("backend lock");
        Ok(match objects.get(hash) {
            Some(object) => Fetched::Found(Arc::clone(object)),
            None => Fetched::NotFound,
        })
    }

    fn for_each(&self, f: &mut dyn FnMut(Arc<NodeObject>)) -> Result<()> {
        let objects = self.objects.lock().expect("backend lock");
        for object in objects.values() {
            f(Arc::clone(object));
        }
        Ok(())
    }

    fn fd_limit(&self) -> u32 {
        0
    }

    fn write_load(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
