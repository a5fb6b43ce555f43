use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::revocation::store::{
    Byte1Key, Byte2Key, CacheStore, StoreResult, VariantKey, byte1_covered, byte2_covered,
    variant_declared,
};
use crate::revocation::types::{ChunkRecord, IndexRecord, Kid, KidEntry, SyncState};

#[derive(Debug, Default)]
struct Tables {
    kids: BTreeMap<Kid, KidEntry>,
    indices: BTreeMap<VariantKey, IndexRecord>,
    byte1: BTreeMap<Byte1Key, ChunkRecord>,
    byte2: BTreeMap<Byte2Key, ChunkRecord>,
    state: Option<SyncState>,
}

impl Tables {
    fn remove_variant(&mut self, kid: &Kid, variant: u8) {
        self.indices.retain(|(k, v), _| !(k == kid && *v == variant));
        self.byte1.retain(|(k, v, _), _| !(k == kid && *v == variant));
        self.byte2.retain(|(k, v, _, _), _| !(k == kid && *v == variant));
    }
}

/// An in-memory cache store.
///
/// Useful for testing and for deployments without Redis. Every write takes the
/// lock once, so multi-table diffs are never observed half-applied.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn kid_entries(&self) -> StoreResult<Vec<KidEntry>> {
        Ok(self.tables.read().await.kids.values().cloned().collect())
    }

    async fn kid_entry(&self, kid: &Kid) -> StoreResult<Option<KidEntry>> {
        Ok(self.tables.read().await.kids.get(kid).cloned())
    }

    async fn index(&self, kid: &Kid, variant: u8) -> StoreResult<Option<IndexRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.indices.get(&(kid.clone(), variant)).cloned())
    }

    async fn indices(&self) -> StoreResult<Vec<(VariantKey, IndexRecord)>> {
        let tables = self.tables.read().await;
        Ok(tables
            .indices
            .iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    async fn byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
    ) -> StoreResult<Option<ChunkRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.byte1.get(&(kid.clone(), variant, byte1)).cloned())
    }

    async fn byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    ) -> StoreResult<Option<ChunkRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.byte2.get(&(kid.clone(), variant, byte1, byte2)).cloned())
    }

    async fn byte1_keys(&self) -> StoreResult<Vec<Byte1Key>> {
        Ok(self.tables.read().await.byte1.keys().cloned().collect())
    }

    async fn byte2_keys(&self) -> StoreResult<Vec<Byte2Key>> {
        Ok(self.tables.read().await.byte2.keys().cloned().collect())
    }

    async fn sync_state(&self) -> StoreResult<Option<SyncState>> {
        Ok(self.tables.read().await.state.clone())
    }

    async fn apply_kid_list(&self, entries: Vec<KidEntry>) -> StoreResult<usize> {
        let mut tables = self.tables.write().await;
        let before = tables.indices.len() + tables.byte1.len() + tables.byte2.len();

        tables
            .indices
            .retain(|(kid, variant), _| variant_declared(&entries, kid, *variant));
        tables
            .byte1
            .retain(|(kid, variant, _), _| variant_declared(&entries, kid, *variant));
        tables
            .byte2
            .retain(|(kid, variant, _, _), _| variant_declared(&entries, kid, *variant));

        tables.kids = entries
            .into_iter()
            .map(|entry| (entry.kid.clone(), entry))
            .collect();

        Ok(before - (tables.indices.len() + tables.byte1.len() + tables.byte2.len()))
    }

    async fn apply_index(
        &self,
        kid: &Kid,
        variant: u8,
        record: IndexRecord,
    ) -> StoreResult<usize> {
        let mut tables = self.tables.write().await;
        let before = tables.byte1.len() + tables.byte2.len();

        tables.byte1.retain(|(k, v, b1), _| {
            !(k == kid && *v == variant) || byte1_covered(&record, *b1)
        });
        tables.byte2.retain(|(k, v, b1, b2), _| {
            !(k == kid && *v == variant) || byte2_covered(&record, *b1, *b2)
        });
        let removed = before - (tables.byte1.len() + tables.byte2.len());

        tables.indices.insert((kid.clone(), variant), record);
        Ok(removed)
    }

    async fn put_byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        record: ChunkRecord,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.byte1.insert((kid.clone(), variant, byte1), record);
        Ok(())
    }

    async fn put_byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
        record: ChunkRecord,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.byte2.insert((kid.clone(), variant, byte1, byte2), record);
        Ok(())
    }

    async fn delete_kid(&self, kid: &Kid) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.kids.remove(kid);
        tables.indices.retain(|(k, _), _| k != kid);
        tables.byte1.retain(|(k, _, _), _| k != kid);
        tables.byte2.retain(|(k, _, _, _), _| k != kid);
        Ok(())
    }

    async fn delete_variant(&self, kid: &Kid, variant: u8) -> StoreResult<()> {
        self.tables.write().await.remove_variant(kid, variant);
        Ok(())
    }

    async fn delete_byte1(&self, kid: &Kid, variant: u8, byte1: u8) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.byte1.remove(&(kid.clone(), variant, byte1));
        tables
            .byte2
            .retain(|(k, v, b1, _), _| !(k == kid && *v == variant && *b1 == byte1));
        Ok(())
    }

    async fn delete_byte2(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.byte2.remove(&(kid.clone(), variant, byte1, byte2));
        Ok(())
    }

    async fn save_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        self.tables.write().await.state = Some(state.clone());
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables.kids.clear();
        tables.indices.clear();
        tables.byte1.clear();
        tables.byte2.clear();
        Ok(())
    }
}
