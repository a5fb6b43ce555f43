use std::collections::HashMap;

use async_trait::async_trait;
use redis::{AsyncCommands, Pipeline, aio::ConnectionManager};
use serde::de::DeserializeOwned;

use crate::revocation::store::{
    Byte1Key, Byte2Key, CacheStore, StoreError, StoreResult, VariantKey, byte1_covered,
    byte2_covered, variant_declared,
};
use crate::revocation::types::{ChunkRecord, IndexRecord, Kid, KidEntry, SyncState};

const DEFAULT_PREFIX: &str = "revocation";

/// A Redis cache store.
///
/// Kid entries live in the hash `<prefix>:kids` and index rows in
/// `<prefix>:index` (field `<kid>:<variant>`). Chunk rows are split per
/// `(kid, variant)` into `<prefix>:byte1:<kid>:<variant>` (field `<byte1>`)
/// and `<prefix>:byte2:<kid>:<variant>` (field `<byte1>:<byte2>`), and the
/// set `<prefix>:partitions` lists every `(kid, variant)` that has chunk rows.
/// Values are JSON rows. Multi-key writes run inside `MULTI`/`EXEC`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Creates a new Redis store from a connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Namespace all keys under `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, table: &str) -> String {
        format!("{}:{table}", self.prefix)
    }

    fn byte1_key(&self, kid: &Kid, variant: u8) -> String {
        format!("{}:byte1:{}", self.prefix, variant_field(kid, variant))
    }

    fn byte2_key(&self, kid: &Kid, variant: u8) -> String {
        format!("{}:byte2:{}", self.prefix, variant_field(kid, variant))
    }

    async fn get_row<T: DeserializeOwned>(
        &self,
        key: String,
        field: String,
    ) -> StoreResult<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(key, field).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Writes a chunk row and registers its partition in one transaction.
    async fn put_chunk_row(
        &self,
        key: String,
        field: String,
        kid: &Kid,
        variant: u8,
        record: &ChunkRecord,
    ) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(key, field, serde_json::to_string(record)?)
            .ignore();
        pipe.sadd(self.key("partitions"), variant_field(kid, variant))
            .ignore();
        self.exec(pipe).await
    }

    async fn partitions(&self) -> StoreResult<Vec<VariantKey>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(self.key("partitions")).await?;
        members
            .iter()
            .map(|member| {
                parse_variant_field(member)
                    .ok_or_else(|| StoreError::msg(format!("Corrupt partition member: {member}")))
            })
            .collect()
    }

    async fn index_keys(&self) -> StoreResult<Vec<VariantKey>> {
        let mut conn = self.conn.clone();
        let fields: Vec<String> = conn.hkeys(self.key("index")).await?;
        fields
            .iter()
            .map(|field| {
                parse_variant_field(field)
                    .ok_or_else(|| StoreError::msg(format!("Corrupt index field: {field}")))
            })
            .collect()
    }

    /// Field names of one per-partition chunk hash.
    async fn fields(&self, key: String) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hkeys(key).await?)
    }

    async fn byte1_fields(&self, kid: &Kid, variant: u8) -> StoreResult<Vec<u8>> {
        self.fields(self.byte1_key(kid, variant))
            .await?
            .iter()
            .map(|field| {
                parse_byte1_field(field)
                    .ok_or_else(|| StoreError::msg(format!("Corrupt byte1 field: {field}")))
            })
            .collect()
    }

    async fn byte2_fields(&self, kid: &Kid, variant: u8) -> StoreResult<Vec<(u8, u8)>> {
        self.fields(self.byte2_key(kid, variant))
            .await?
            .iter()
            .map(|field| {
                parse_byte2_field(field)
                    .ok_or_else(|| StoreError::msg(format!("Corrupt byte2 field: {field}")))
            })
            .collect()
    }

    /// Row count of both chunk hashes of a partition.
    async fn chunk_rows(&self, kid: &Kid, variant: u8) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let (byte1, byte2): (usize, usize) = redis::pipe()
            .hlen(self.byte1_key(kid, variant))
            .hlen(self.byte2_key(kid, variant))
            .query_async(&mut conn)
            .await?;
        Ok(byte1 + byte2)
    }

    /// Queues removal of a partition's chunk hashes and its registration.
    fn queue_drop_partition(&self, pipe: &mut Pipeline, kid: &Kid, variant: u8) {
        pipe.del(self.byte1_key(kid, variant)).ignore();
        pipe.del(self.byte2_key(kid, variant)).ignore();
        pipe.srem(self.key("partitions"), variant_field(kid, variant))
            .ignore();
    }

    fn queue_hdel(pipe: &mut Pipeline, key: String, fields: Vec<String>) {
        if !fields.is_empty() {
            pipe.hdel(key, fields).ignore();
        }
    }

    async fn exec(&self, pipe: Pipeline) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

fn variant_field(kid: &Kid, variant: u8) -> String {
    format!("{kid}:{variant:02x}")
}

fn byte1_field(byte1: u8) -> String {
    format!("{byte1:02x}")
}

fn byte2_field(byte1: u8, byte2: u8) -> String {
    format!("{byte1:02x}:{byte2:02x}")
}

fn parse_bytes(field: &str, expected: usize) -> Option<Vec<u8>> {
    let bytes = field
        .split(':')
        .map(|part| u8::from_str_radix(part, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    (bytes.len() == expected).then_some(bytes)
}

fn parse_variant_field(field: &str) -> Option<VariantKey> {
    let (kid, variant) = field.split_once(':')?;
    let variant = parse_bytes(variant, 1)?;
    Some((Kid::from_hex(kid).ok()?, variant[0]))
}

fn parse_byte1_field(field: &str) -> Option<u8> {
    Some(parse_bytes(field, 1)?[0])
}

fn parse_byte2_field(field: &str) -> Option<(u8, u8)> {
    let bytes = parse_bytes(field, 2)?;
    Some((bytes[0], bytes[1]))
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn kid_entries(&self) -> StoreResult<Vec<KidEntry>> {
        let mut conn = self.conn.clone();
        let rows: HashMap<String, String> = conn.hgetall(self.key("kids")).await?;
        let mut entries = rows
            .values()
            .map(|raw| serde_json::from_str::<KidEntry>(raw))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| a.kid.cmp(&b.kid));
        Ok(entries)
    }

    async fn kid_entry(&self, kid: &Kid) -> StoreResult<Option<KidEntry>> {
        self.get_row(self.key("kids"), kid.to_hex()).await
    }

    async fn index(&self, kid: &Kid, variant: u8) -> StoreResult<Option<IndexRecord>> {
        self.get_row(self.key("index"), variant_field(kid, variant))
            .await
    }

    async fn indices(&self) -> StoreResult<Vec<(VariantKey, IndexRecord)>> {
        let mut conn = self.conn.clone();
        let rows: HashMap<String, String> = conn.hgetall(self.key("index")).await?;
        let mut indices = rows
            .iter()
            .map(|(field, raw)| {
                let key = parse_variant_field(field)
                    .ok_or_else(|| StoreError::msg(format!("Corrupt index field: {field}")))?;
                Ok((key, serde_json::from_str::<IndexRecord>(raw)?))
            })
            .collect::<StoreResult<Vec<_>>>()?;
        indices.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(indices)
    }

    async fn byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
    ) -> StoreResult<Option<ChunkRecord>> {
        self.get_row(self.byte1_key(kid, variant), byte1_field(byte1))
            .await
    }

    async fn byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    ) -> StoreResult<Option<ChunkRecord>> {
        self.get_row(self.byte2_key(kid, variant), byte2_field(byte1, byte2))
            .await
    }

    async fn byte1_keys(&self) -> StoreResult<Vec<Byte1Key>> {
        let mut keys = Vec::new();
        for (kid, variant) in self.partitions().await? {
            for byte1 in self.byte1_fields(&kid, variant).await? {
                keys.push((kid.clone(), variant, byte1));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn byte2_keys(&self) -> StoreResult<Vec<Byte2Key>> {
        let mut keys = Vec::new();
        for (kid, variant) in self.partitions().await? {
            for (byte1, byte2) in self.byte2_fields(&kid, variant).await? {
                keys.push((kid.clone(), variant, byte1, byte2));
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn sync_state(&self) -> StoreResult<Option<SyncState>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.key("state")).await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn apply_kid_list(&self, entries: Vec<KidEntry>) -> StoreResult<usize> {
        let stale_index: Vec<VariantKey> = self
            .index_keys()
            .await?
            .into_iter()
            .filter(|(kid, variant)| !variant_declared(&entries, kid, *variant))
            .collect();
        let stale_partitions: Vec<VariantKey> = self
            .partitions()
            .await?
            .into_iter()
            .filter(|(kid, variant)| !variant_declared(&entries, kid, *variant))
            .collect();

        let mut removed = stale_index.len();
        for (kid, variant) in &stale_partitions {
            removed += self.chunk_rows(kid, *variant).await?;
        }

        let rows = entries
            .iter()
            .map(|entry| Ok((entry.kid.to_hex(), serde_json::to_string(entry)?)))
            .collect::<StoreResult<Vec<(String, String)>>>()?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.key("kids")).ignore();
        if !rows.is_empty() {
            pipe.hset_multiple(self.key("kids"), rows.as_slice()).ignore();
        }
        Self::queue_hdel(
            &mut pipe,
            self.key("index"),
            stale_index
                .iter()
                .map(|(kid, variant)| variant_field(kid, *variant))
                .collect(),
        );
        for (kid, variant) in &stale_partitions {
            self.queue_drop_partition(&mut pipe, kid, *variant);
        }
        self.exec(pipe).await?;

        Ok(removed)
    }

    async fn apply_index(
        &self,
        kid: &Kid,
        variant: u8,
        record: IndexRecord,
    ) -> StoreResult<usize> {
        let stale_byte1: Vec<String> = self
            .byte1_fields(kid, variant)
            .await?
            .into_iter()
            .filter(|b1| !byte1_covered(&record, *b1))
            .map(byte1_field)
            .collect();
        let stale_byte2: Vec<String> = self
            .byte2_fields(kid, variant)
            .await?
            .into_iter()
            .filter(|(b1, b2)| !byte2_covered(&record, *b1, *b2))
            .map(|(b1, b2)| byte2_field(b1, b2))
            .collect();
        let removed = stale_byte1.len() + stale_byte2.len();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(
            self.key("index"),
            variant_field(kid, variant),
            serde_json::to_string(&record)?,
        )
        .ignore();
        Self::queue_hdel(&mut pipe, self.byte1_key(kid, variant), stale_byte1);
        Self::queue_hdel(&mut pipe, self.byte2_key(kid, variant), stale_byte2);
        self.exec(pipe).await?;

        Ok(removed)
    }

    async fn put_byte1_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        record: ChunkRecord,
    ) -> StoreResult<()> {
        self.put_chunk_row(
            self.byte1_key(kid, variant),
            byte1_field(byte1),
            kid,
            variant,
            &record,
        )
        .await
    }

    async fn put_byte2_chunks(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
        record: ChunkRecord,
    ) -> StoreResult<()> {
        self.put_chunk_row(
            self.byte2_key(kid, variant),
            byte2_field(byte1, byte2),
            kid,
            variant,
            &record,
        )
        .await
    }

    async fn delete_kid(&self, kid: &Kid) -> StoreResult<()> {
        let index: Vec<VariantKey> = self
            .index_keys()
            .await?
            .into_iter()
            .filter(|(k, _)| k == kid)
            .collect();
        let partitions: Vec<VariantKey> = self
            .partitions()
            .await?
            .into_iter()
            .filter(|(k, _)| k == kid)
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hdel(self.key("kids"), kid.to_hex()).ignore();
        Self::queue_hdel(
            &mut pipe,
            self.key("index"),
            index
                .iter()
                .map(|(k, variant)| variant_field(k, *variant))
                .collect(),
        );
        for (k, variant) in &partitions {
            self.queue_drop_partition(&mut pipe, k, *variant);
        }
        self.exec(pipe).await
    }

    async fn delete_variant(&self, kid: &Kid, variant: u8) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hdel(self.key("index"), variant_field(kid, variant))
            .ignore();
        self.queue_drop_partition(&mut pipe, kid, variant);
        self.exec(pipe).await
    }

    async fn delete_byte1(&self, kid: &Kid, variant: u8, byte1: u8) -> StoreResult<()> {
        let byte2: Vec<String> = self
            .byte2_fields(kid, variant)
            .await?
            .into_iter()
            .filter(|(b1, _)| *b1 == byte1)
            .map(|(b1, b2)| byte2_field(b1, b2))
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hdel(self.byte1_key(kid, variant), byte1_field(byte1))
            .ignore();
        Self::queue_hdel(&mut pipe, self.byte2_key(kid, variant), byte2);
        self.exec(pipe).await
    }

    async fn delete_byte2(
        &self,
        kid: &Kid,
        variant: u8,
        byte1: u8,
        byte2: u8,
    ) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hdel(self.byte2_key(kid, variant), byte2_field(byte1, byte2))
            .await?;
        Ok(())
    }

    async fn save_sync_state(&self, state: &SyncState) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(state)?;
        let _: () = conn.set(self.key("state"), value).await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        let partitions = self.partitions().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.key("kids")).ignore();
        pipe.del(self.key("index")).ignore();
        for (kid, variant) in &partitions {
            self.queue_drop_partition(&mut pipe, kid, *variant);
        }
        pipe.del(self.key("partitions")).ignore();
        self.exec(pipe).await
    }
}
