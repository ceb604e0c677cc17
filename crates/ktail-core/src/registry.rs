use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;

use ktail_types::{ContainerKey, ContainerSpec, PodSnapshot};

use crate::tailer::Tailer;

/// A running tailer together with the snapshot it was started from
pub struct TailerEntry<T> {
    pub pod: PodSnapshot,
    pub container: ContainerSpec,
    tailer: Arc<T>,
    task: JoinHandle<()>,
}

impl<T: Tailer> TailerEntry<T> {
    pub fn new(pod: PodSnapshot, container: ContainerSpec, tailer: Arc<T>, task: JoinHandle<()>) -> Self {
        Self {
            pod,
            container,
            tailer,
            task,
        }
    }

    /// Ask the tailer to stop without waiting for its task
    pub fn stop(&self) {
        self.tailer.stop();
    }

    /// Give up the entry, keeping only its task handle
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

/// Map of active tailers keyed by container, behind a single lock
pub struct TailerRegistry<T> {
    entries: Mutex<HashMap<ContainerKey, TailerEntry<T>>>,
}

impl<T: Tailer> TailerRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Take the registry lock.
    ///
    /// Lookups, inserts and removals made through one guard are atomic with
    /// respect to every other guard. Never hold it across an `.await`.
    pub fn lock(&self) -> RegistryGuard<'_, T> {
        RegistryGuard {
            entries: self.entries.lock(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Sorted list of registered keys
    pub fn keys(&self) -> Vec<ContainerKey> {
        let mut keys: Vec<ContainerKey> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remove every entry (shutdown only)
    pub fn drain(&self) -> Vec<(ContainerKey, TailerEntry<T>)> {
        self.entries.lock().drain().collect()
    }
}

impl<T: Tailer> Default for TailerRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to the registry
pub struct RegistryGuard<'a, T> {
    entries: MutexGuard<'a, HashMap<ContainerKey, TailerEntry<T>>>,
}

impl<T: Tailer> RegistryGuard<'_, T> {
    pub fn contains(&self, key: &ContainerKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert unless the key is occupied, in which case the entry is handed back
    pub fn try_insert(&mut self, key: ContainerKey, entry: TailerEntry<T>) -> Result<(), TailerEntry<T>> {
        match self.entries.entry(key) {
            Entry::Occupied(_) => Err(entry),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, key: &ContainerKey) -> Option<TailerEntry<T>> {
        self.entries.remove(key)
    }
}
