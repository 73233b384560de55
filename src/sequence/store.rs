//! Keyed collection of active sequences.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use uuid::Uuid;

use super::{AbortReason, Sequence};

/// Active sequences of one consumer (or one partition of it).
///
/// Ids are unique: adding a sequence whose id is already present aborts the
/// previous entry before replacing it. Entries keep insertion order, which
/// is also the tie-break for prefix lookups. Once disposed, the store
/// aborts every sequence added to it.
pub struct SequenceStore {
    id: Uuid,
    entries: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    sequences: Vec<Arc<Sequence>>,
    disposed: Option<AbortReason>,
}

impl Default for SequenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceStore {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Store identity, for logging.
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a sequence, aborting and replacing any entry with the same id.
    ///
    /// On a disposed store the sequence is aborted with the disposal reason
    /// and not kept.
    pub fn add(&self, sequence: Arc<Sequence>) -> Arc<Sequence> {
        let mut entries = self.entries();
        if let Some(reason) = entries.disposed.clone() {
            drop(entries);
            sequence.abort(reason);
            debug!(
                store_id = %self.id,
                sequence_id = %sequence.id(),
                "Sequence added to a disposed store, aborted"
            );
            return sequence;
        }
        let sequences = &mut entries.sequences;

        if let Some(position) = sequences.iter().position(|s| s.id() == sequence.id()) {
            let previous = sequences.remove(position);
            if previous.abort(AbortReason::Replaced) {
                warn!(
                    store_id = %self.id,
                    sequence_id = %previous.id(),
                    "Sequence replaced while still pending"
                );
            }
            previous.release();
        }

        sequences.push(Arc::clone(&sequence));
        sequence
    }

    /// Look up a sequence by exact id, or by id prefix when `match_prefix` is set.
    ///
    /// With several prefix matches the first inserted wins.
    pub fn get(&self, id: &str, match_prefix: bool) -> Option<Arc<Sequence>> {
        self.entries()
            .sequences
            .iter()
            .find(|s| {
                if match_prefix {
                    s.id().starts_with(id)
                } else {
                    s.id() == id
                }
            })
            .cloned()
    }

    /// Remove a sequence. No-op if absent.
    pub fn remove(&self, id: &str) {
        let removed = {
            let sequences = &mut self.entries().sequences;
            sequences
                .iter()
                .position(|s| s.id() == id)
                .map(|position| sequences.remove(position))
        };

        if let Some(sequence) = removed {
            sequence.release();
        }
    }

    /// Pending sequences, in insertion order.
    pub fn get_pending_sequences(&self) -> Vec<Arc<Sequence>> {
        self.entries()
            .sequences
            .iter()
            .filter(|s| s.is_pending())
            .cloned()
            .collect()
    }

    pub fn has_pending_sequences(&self) -> bool {
        self.entries().sequences.iter().any(|s| s.is_pending())
    }

    pub fn len(&self) -> usize {
        self.entries().sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().sequences.is_empty()
    }

    /// Abort every sequence with `reason`, wait for their processing, then release them.
    ///
    /// Sequences added afterwards are aborted with the same reason.
    pub async fn dispose(&self, reason: AbortReason) {
        let sequences = {
            let mut entries = self.entries();
            entries.disposed = Some(reason.clone());
            std::mem::take(&mut entries.sequences)
        };

        for sequence in &sequences {
            sequence.abort(reason.clone());
        }

        for sequence in &sequences {
            if let Err(e) = sequence.processing_completed().await {
                debug!(
                    store_id = %self.id,
                    sequence_id = %sequence.id(),
                    error = %e,
                    "Aborted sequence processing ended with error"
                );
            }
            sequence.release();
        }

        if !sequences.is_empty() {
            debug!(
                store_id = %self.id,
                count = sequences.len(),
                reason = %reason,
                "Sequence store disposed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> Arc<Sequence> {
        Sequence::chunks(id, Some(10), 16)
    }

    #[tokio::test]
    async fn test_add_and_get_exact() {
        let store = SequenceStore::new();
        store.add(pending("abc"));

        assert!(store.get("abc", false).is_some());
        assert!(store.get("ab", false).is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_aborts_previous() {
        let store = SequenceStore::new();
        let first = store.add(pending("abc"));
        let second = store.add(pending("abc"));

        assert!(first.is_aborted());
        assert_eq!(first.abort_reason(), Some(AbortReason::Replaced));
        assert!(second.is_pending());
        assert_eq!(store.len(), 1);
        assert!(Arc::ptr_eq(&store.get("abc", false).unwrap(), &second));
    }

    #[tokio::test]
    async fn test_prefix_match_first_inserted_wins() {
        let store = SequenceStore::new();
        let first = store.add(pending("batch-1"));
        store.add(pending("batch-2"));

        let found = store.get("batch-", true).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        assert!(store.get("batch-", false).is_none());
        assert!(store.get("other", true).is_none());
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let store = SequenceStore::new();
        store.add(pending("aaa"));

        store.remove("zzz");
        store.remove("zzz");

        assert_eq!(store.len(), 1);
        assert!(store.get("aaa", false).unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_pending_excludes_terminal() {
        let store = SequenceStore::new();
        store.add(pending("aaa"));
        store.add(pending("bbb")).complete();
        store.add(pending("ccc")).abort(AbortReason::ConsumerAborted);

        let ids: Vec<_> = store
            .get_pending_sequences()
            .iter()
            .map(|s| s.id().to_string())
            .collect();
        assert_eq!(ids, vec!["aaa"]);

        store.get("aaa", false).unwrap().complete();
        assert!(store.get_pending_sequences().is_empty());
        assert!(!store.has_pending_sequences());
    }

    #[tokio::test]
    async fn test_dispose_aborts_and_releases() {
        let store = SequenceStore::new();
        let a = store.add(pending("aaa"));
        let b = store.add(pending("bbb"));

        store.dispose(AbortReason::ConsumerAborted).await;

        assert!(store.is_empty());
        assert_eq!(a.abort_reason(), Some(AbortReason::ConsumerAborted));
        assert_eq!(b.abort_reason(), Some(AbortReason::ConsumerAborted));
    }

    #[tokio::test]
    async fn test_add_after_dispose_aborts_sequence() {
        let store = SequenceStore::new();
        store.dispose(AbortReason::ConsumerAborted).await;

        let late = store.add(pending("late"));

        assert_eq!(late.abort_reason(), Some(AbortReason::ConsumerAborted));
        assert!(store.is_empty());
        assert!(store.get("late", false).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_adds_leave_one_live_sequence() {
        let store = Arc::new(SequenceStore::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.add(pending("same")) }));
        }

        let mut added = Vec::new();
        for handle in handles {
            added.push(handle.await.unwrap());
        }

        assert_eq!(store.len(), 1);
        let live: Vec<_> = added.iter().filter(|s| !s.is_aborted()).collect();
        assert_eq!(live.len(), 1);
        assert!(Arc::ptr_eq(live[0], &store.get("same", false).unwrap()));
    }
}
