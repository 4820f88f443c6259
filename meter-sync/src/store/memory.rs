use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::store::{Collection, KvBackend, KvWrite, StoreError};

#[derive(Default)]
struct MemoryState {
    next_seq: u64,
    entries: HashMap<(Collection, String), (u64, String)>,
}

/// In memory backend.
/// Nothing survives the process; intended for tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Internal("memory backend mutex poisoned".into()))
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, collection: Collection, key: &str) -> Result<Option<String>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .get(&(collection, key.to_string()))
            .map(|(_, value)| value.clone()))
    }

    async fn list(&self, collection: Collection) -> Result<Vec<(String, String)>, StoreError> {
        let state = self.lock()?;
        let mut rows: Vec<(u64, String, String)> = state
            .entries
            .iter()
            .filter(|((c, _), _)| *c == collection)
            .map(|((_, key), (seq, value))| (*seq, key.clone(), value.clone()))
            .collect();
        rows.sort_by_key(|(seq, _, _)| *seq);

        Ok(rows.into_iter().map(|(_, key, value)| (key, value)).collect())
    }

    async fn apply(&self, writes: Vec<KvWrite>) -> Result<(), StoreError> {
        // All writes happen under one lock acquisition, so readers never see
        // half of a batch.
        let mut state = self.lock()?;

        for write in writes {
            match write {
                KvWrite::Put {
                    collection,
                    key,
                    value,
                } => {
                    let next_seq = state.next_seq;
                    let slot = state
                        .entries
                        .entry((collection, key))
                        .or_insert((next_seq, String::new()));
                    slot.1 = value;
                    if slot.0 == next_seq {
                        state.next_seq += 1;
                    }
                }
                KvWrite::Delete { collection, key } => {
                    state.entries.remove(&(collection, key));
                }
            }
        }

        Ok(())
    }
}
