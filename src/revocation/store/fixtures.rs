//! Behaviour every [`CacheStore`] backend has to share, run against each of them.

use std::collections::BTreeMap;

use crate::revocation::store::CacheStore;
use crate::revocation::types::{
    Byte2Entry, ChunkRecord, HashPrefix, IndexEntry, IndexRecord, Kid, KidEntry, SyncState,
};

pub(crate) fn kid(byte: u8) -> Kid {
    Kid::new([byte; 8])
}

pub(crate) fn kid_entry(byte: u8, variants: &[u8]) -> KidEntry {
    KidEntry {
        kid: kid(byte),
        hash_variants: variants.iter().map(|v| (*v, 1)).collect(),
    }
}

pub(crate) fn index_record(partitions: &[(u8, &[u8])]) -> IndexRecord {
    let index = partitions
        .iter()
        .map(|(b1, b2s)| {
            let byte2 = b2s
                .iter()
                .map(|b2| {
                    (
                        *b2,
                        Byte2Entry {
                            timestamp: 10,
                            count: 1,
                        },
                    )
                })
                .collect();
            (
                *b1,
                IndexEntry {
                    timestamp: 10,
                    count: b2s.len() as u32,
                    byte2,
                },
            )
        })
        .collect();
    IndexRecord {
        index,
        synced_at: 1,
    }
}

pub(crate) fn chunk(byte: u8) -> ChunkRecord {
    ChunkRecord {
        chunks: vec![HashPrefix::from([byte; 16])],
        synced_at: 1,
    }
}

/// Kid 1 with variants 0a and 0b, kid 2 with 0a. Each pair holds the
/// partitions `42 -> 17` and `42 -> 18` with their chunk rows.
pub(crate) async fn seed(store: &dyn CacheStore) {
    store
        .apply_kid_list(vec![kid_entry(1, &[0x0a, 0x0b]), kid_entry(2, &[0x0a])])
        .await
        .unwrap();
    for (k, v) in [(1, 0x0a), (1, 0x0b), (2, 0x0a)] {
        store
            .apply_index(&kid(k), v, index_record(&[(0x42, &[0x17, 0x18])]))
            .await
            .unwrap();
        store
            .put_byte1_chunks(&kid(k), v, 0x42, chunk(0x42))
            .await
            .unwrap();
        for b2 in [0x17, 0x18] {
            store
                .put_byte2_chunks(&kid(k), v, 0x42, b2, chunk(b2))
                .await
                .unwrap();
        }
    }
}

pub(crate) async fn apply_kid_list_cascades_removed_kid(store: &dyn CacheStore) {
    seed(store).await;
    let removed = store
        .apply_kid_list(vec![kid_entry(1, &[0x0a, 0x0b])])
        .await
        .unwrap();

    // one index, one byte1 and two byte2 rows of kid 2
    assert_eq!(removed, 4);
    assert!(store.kid_entry(&kid(2)).await.unwrap().is_none());
    assert!(store.index(&kid(2), 0x0a).await.unwrap().is_none());
    assert!(store.byte1_keys().await.unwrap().iter().all(|(k, _, _)| *k == kid(1)));
    assert!(
        store
            .byte2_keys()
            .await
            .unwrap()
            .iter()
            .all(|(k, _, _, _)| *k == kid(1))
    );
    assert_eq!(store.byte2_keys().await.unwrap().len(), 4);
}

pub(crate) async fn apply_kid_list_cascades_dropped_variant(store: &dyn CacheStore) {
    seed(store).await;
    store
        .apply_kid_list(vec![kid_entry(1, &[0x0a]), kid_entry(2, &[0x0a])])
        .await
        .unwrap();

    assert!(store.index(&kid(1), 0x0b).await.unwrap().is_none());
    assert!(store.index(&kid(1), 0x0a).await.unwrap().is_some());
    assert!(
        store
            .byte1_chunks(&kid(1), 0x0b, 0x42)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .byte2_keys()
            .await
            .unwrap()
            .iter()
            .all(|(_, v, _, _)| *v == 0x0a)
    );
}

pub(crate) async fn apply_index_prunes_vanished_partitions(store: &dyn CacheStore) {
    seed(store).await;
    let removed = store
        .apply_index(&kid(1), 0x0a, index_record(&[(0x42, &[0x17])]))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(
        store
            .byte2_chunks(&kid(1), 0x0a, 0x42, 0x18)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .byte2_chunks(&kid(1), 0x0a, 0x42, 0x17)
            .await
            .unwrap()
            .is_some()
    );

    let removed = store
        .apply_index(&kid(1), 0x0a, index_record(&[]))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    // other (kid, variant) pairs are untouched
    assert!(
        store
            .byte1_chunks(&kid(1), 0x0b, 0x42)
            .await
            .unwrap()
            .is_some()
    );
    assert_eq!(store.byte1_keys().await.unwrap().len(), 2);
}

pub(crate) async fn point_deletes(store: &dyn CacheStore) {
    seed(store).await;

    store.delete_byte2(&kid(1), 0x0a, 0x42, 0x17).await.unwrap();
    assert_eq!(store.byte2_keys().await.unwrap().len(), 5);

    store.delete_byte1(&kid(1), 0x0a, 0x42).await.unwrap();
    assert!(
        store
            .byte2_chunks(&kid(1), 0x0a, 0x42, 0x18)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .byte2_chunks(&kid(1), 0x0b, 0x42, 0x18)
            .await
            .unwrap()
            .is_some()
    );

    store.delete_variant(&kid(1), 0x0b).await.unwrap();
    assert!(store.index(&kid(1), 0x0b).await.unwrap().is_none());
    assert!(store.kid_entry(&kid(1)).await.unwrap().is_some());
    assert!(store.byte1_keys().await.unwrap().iter().all(|(_, v, _)| *v != 0x0b));

    store.delete_kid(&kid(2)).await.unwrap();
    assert!(store.kid_entry(&kid(2)).await.unwrap().is_none());
    assert!(store.indices().await.unwrap().iter().all(|((k, _), _)| *k == kid(1)));
    assert!(store.byte1_keys().await.unwrap().is_empty());
}

pub(crate) async fn clear_keeps_sync_state(store: &dyn CacheStore) {
    seed(store).await;
    store.save_sync_state(&SyncState::new(true)).await.unwrap();
    store.clear().await.unwrap();

    assert!(store.kid_entries().await.unwrap().is_empty());
    assert!(store.indices().await.unwrap().is_empty());
    assert!(store.byte1_keys().await.unwrap().is_empty());
    assert!(store.byte2_keys().await.unwrap().is_empty());
    assert_eq!(store.sync_state().await.unwrap(), Some(SyncState::new(true)));
}

pub(crate) async fn index_roundtrip(store: &dyn CacheStore) {
    let mut record = index_record(&[(0xa6, &[0xb8])]);
    record.index.insert(
        0x01,
        IndexEntry {
            timestamp: 5,
            count: 0,
            byte2: BTreeMap::new(),
        },
    );
    store
        .apply_kid_list(vec![kid_entry(3, &[0x0c])])
        .await
        .unwrap();
    store.apply_index(&kid(3), 0x0c, record.clone()).await.unwrap();
    assert_eq!(store.index(&kid(3), 0x0c).await.unwrap(), Some(record));
}
