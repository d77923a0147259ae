//! Buffered writes of Sosa entries.

use crate::config::DEFAULT_BATCH_SIZE;
use crate::store::SosaTransaction;
use crate::types::SosaEntry;

/// Buffers entries and upserts them through a transaction in bounded batches.
///
/// A flush happens when the buffer reaches the threshold; callers must call
/// [`flush`](Self::flush) once the traversal is over.
pub struct BatchWriter<'a, E> {
    tx: &'a mut dyn SosaTransaction<Error = E>,
    buffer: Vec<SosaEntry>,
    threshold: usize,
    written: u64,
    skipped: u64,
    flushes: u64,
}

impl<'a, E> BatchWriter<'a, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Create a writer flushing every `threshold` entries (0 means the default).
    pub fn new(tx: &'a mut dyn SosaTransaction<Error = E>, threshold: usize) -> Self {
        let threshold = if threshold == 0 { DEFAULT_BATCH_SIZE } else { threshold };
        Self {
            tx,
            buffer: Vec::with_capacity(threshold),
            threshold,
            written: 0,
            skipped: 0,
            flushes: 0,
        }
    }

    /// Buffer one entry, flushing if the threshold is reached.
    pub async fn push(&mut self, entry: SosaEntry) -> Result<(), E> {
        self.buffer.push(entry);
        if self.buffer.len() >= self.threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write everything buffered.
    pub async fn flush(&mut self) -> Result<(), E> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let written = self.tx.insert_or_update(&batch).await?;
        self.written += written as u64;
        self.skipped += (batch.len() - written) as u64;
        self.flushes += 1;
        tracing::debug!(
            tree_id = self.tx.scope().tree_id.0,
            user_id = self.tx.scope().user_id.0,
            batch_len = batch.len(),
            written,
            "Flushed sosa batch"
        );
        self.buffer = batch;
        self.buffer.clear();
        Ok(())
    }

    /// Entries waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Entries persisted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Entries dropped by the store for exceeding its generation cap.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Number of batches written.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemorySosaStore, SosaIndexStore};
    use crate::types::{IndividualId, Scope, SosaNumber};

    fn entry(sosa: u64) -> SosaEntry {
        SosaEntry::new(
            Scope::new(1, 1),
            SosaNumber::new(sosa).unwrap(),
            IndividualId::new(format!("I{}", sosa)),
        )
    }

    #[tokio::test]
    async fn test_flushes_at_threshold() {
        let store = InMemorySosaStore::new();
        let mut tx = store.begin(&Scope::new(1, 1)).await.unwrap();
        {
            let mut writer = BatchWriter::new(tx.as_mut(), 3);
            for n in 1..=7 {
                writer.push(entry(n)).await.unwrap();
            }
            assert_eq!(writer.flushes(), 2);
            assert_eq!(writer.pending(), 1);
            writer.flush().await.unwrap();
            assert_eq!(writer.written(), 7);
            assert_eq!(writer.flushes(), 3);

            // Nothing buffered: no extra batch.
            writer.flush().await.unwrap();
            assert_eq!(writer.flushes(), 3);
        }
        tx.commit(&IndividualId::new("I1")).await.unwrap();
        assert_eq!(store.count(&Scope::new(1, 1)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_counts_skipped_entries() {
        let store = InMemorySosaStore::with_max_generation(2);
        let mut tx = store.begin(&Scope::new(1, 1)).await.unwrap();
        let mut writer = BatchWriter::new(tx.as_mut(), 10);
        for n in 1..=5 {
            writer.push(entry(n)).await.unwrap();
        }
        writer.flush().await.unwrap();
        assert_eq!(writer.written(), 3);
        assert_eq!(writer.skipped(), 2);
    }

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = InMemorySosaStore::new();
        let scope = Scope::new(1, 1);
        let mut tx = store.begin(&scope).await.unwrap();
        {
            let mut writer = BatchWriter::new(tx.as_mut(), 0);
            writer.push(entry(2)).await.unwrap();
            let mut replacement = entry(2);
            replacement.individual_id = IndividualId::new("other");
            writer.push(replacement).await.unwrap();
            writer.flush().await.unwrap();
        }
        tx.commit(&IndividualId::new("I1")).await.unwrap();
        let gen2 = store.list_at_generation(&scope, 2).await.unwrap();
        assert_eq!(gen2.len(), 1);
        assert_eq!(gen2.values().next().unwrap(), &IndividualId::new("other"));
    }
}
