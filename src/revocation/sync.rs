//! Four-phase incremental refresh of the cache store.
//!
//! Phases run strictly in order (kid list, index, byte1 chunks, byte2 chunks)
//! and each one is committed to the persisted [`SyncState`] before the next
//! starts. A pass that stops early keeps `last_sync_finish` untouched and the
//! next call resumes after the last committed phase.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::errors::{RevocationError, RevocationResult};
use super::fetcher::{Fetched, RemoteListFetcher};
use super::store::CacheStore;
use super::types::{ChunkRecord, HashPrefix, IndexRecord, Kid, SyncPhase, SyncState};

/// What happened to one resource during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Skipped,
    Downloaded { pruned: usize },
    NotModified,
    Absent,
}

/// Counters collected over one pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Last phase committed when the pass returned.
    pub phase: SyncPhase,
    pub completed: bool,
    pub cancelled: bool,
    pub requests: usize,
    pub downloads: usize,
    pub not_modified: usize,
    pub absent: usize,
    pub pruned: usize,
}

impl SyncReport {
    /// Returns `false` when the step leaves its phase incomplete.
    fn record(&mut self, step: Step) -> bool {
        match step {
            Step::Skipped => return true,
            Step::Downloaded { pruned } => {
                self.downloads += 1;
                self.pruned += pruned;
            }
            Step::NotModified => self.not_modified += 1,
            Step::Absent => self.absent += 1,
        }
        self.requests += 1;
        step != Step::Absent
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub state: SyncState,
    pub report: SyncReport,
}

/// Cooperative cancellation of a running pass.
#[derive(Debug, Clone, Default)]
pub struct SyncHandle {
    cancelled: Arc<AtomicBool>,
}

impl SyncHandle {
    /// Stop the running pass at the next partition boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

/// Timestamps a pass compares cached rows against, in epoch seconds.
#[derive(Debug, Clone, Copy)]
struct PassClock {
    start: i64,
    last_finish: i64,
    /// Set when the pass continues an interrupted one instead of starting over.
    resumed: bool,
}

impl PassClock {
    /// Rows stamped with the start of a resumed pass were written by that pass.
    fn written_this_pass(&self, synced_at: i64) -> bool {
        self.resumed && synced_at >= self.start
    }
}

#[derive(Clone)]
pub struct Synchronizer {
    fetcher: Arc<RemoteListFetcher>,
    store: Arc<dyn CacheStore>,
    update_interval: TimeDelta,
    permits: Arc<Semaphore>,
    handle: SyncHandle,
}

impl Synchronizer {
    pub fn new(
        fetcher: Arc<RemoteListFetcher>,
        store: Arc<dyn CacheStore>,
        update_interval: TimeDelta,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            fetcher,
            store,
            update_interval,
            permits: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
            handle: SyncHandle::default(),
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// An interrupted pass that started too long ago is restarted from scratch.
    fn is_stale(&self, state: &SyncState, now: DateTime<Utc>) -> bool {
        state.last_sync_start > state.last_sync_finish
            && now - state.last_sync_start > self.update_interval
    }

    /// Run one pass starting from `state` and return the state it left behind.
    pub async fn sync(&self, mut state: SyncState) -> RevocationResult<SyncOutcome> {
        self.handle.reset();
        let now = Utc::now();

        let resumed = state.is_interrupted() && !self.is_stale(&state, now);
        if !resumed {
            info!("Starting revocation list sync");
            state.last_sync_start = now;
            state.phase = SyncPhase::Completed;
        } else {
            info!(
                "Resuming revocation list sync started at {} after {:?}",
                state.last_sync_start, state.phase
            );
        }
        self.store.save_sync_state(&state).await?;

        let clock = PassClock {
            start: state.last_sync_start.timestamp(),
            last_finish: state.last_sync_finish.timestamp(),
            resumed,
        };
        let mut report = SyncReport::default();

        loop {
            let next = state.phase.next();
            if next == SyncPhase::Completed {
                break;
            }
            if self.handle.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let complete = match next {
                SyncPhase::KidList => self.sync_kid_list(&state, &mut report).await?,
                SyncPhase::Index => self.sync_indices(clock, &mut report).await?,
                SyncPhase::ByteOne => self.sync_byte1_chunks(clock, &mut report).await?,
                SyncPhase::ByteTwo => self.sync_byte2_chunks(clock, &mut report).await?,
                SyncPhase::Completed => true,
            };

            if !complete {
                report.cancelled |= self.handle.is_cancelled();
                warn!("Revocation sync stopped in phase {next:?}; will resume on next call");
                break;
            }

            state.phase = next;
            self.store.save_sync_state(&state).await?;
            debug!("Committed sync phase {next:?}");
        }

        if state.phase == SyncPhase::ByteTwo {
            state.last_sync_finish = state.last_sync_start;
            state.phase = SyncPhase::Completed;
            self.store.save_sync_state(&state).await?;
            report.completed = true;
            info!(
                "Revocation list sync completed: {} requests, {} downloads, {} rows pruned",
                report.requests, report.downloads, report.pruned
            );
        }

        report.phase = state.phase;
        Ok(SyncOutcome { state, report })
    }

    async fn sync_kid_list(
        &self,
        state: &SyncState,
        report: &mut SyncReport,
    ) -> RevocationResult<bool> {
        let cached = self.store.kid_entries().await?;
        let since = (state.has_synced() && !cached.is_empty()).then_some(state.last_sync_finish);

        let step = match self.fetcher.fetch_kid_list(since).await? {
            Fetched::Modified(entries) => {
                info!("Kid list changed: {} kids published", entries.len());
                let pruned = self.store.apply_kid_list(entries).await?;
                Step::Downloaded { pruned }
            }
            Fetched::NotModified => Step::NotModified,
            Fetched::Absent(_) => Step::Absent,
        };
        Ok(report.record(step))
    }

    async fn sync_indices(&self, clock: PassClock, report: &mut SyncReport) -> RevocationResult<bool> {
        let mut jobs = Vec::new();
        for entry in self.store.kid_entries().await? {
            for variant in entry.hash_variants.keys() {
                jobs.push((entry.kid.clone(), *variant));
            }
        }

        let mut set = JoinSet::new();
        let mut interrupted = false;
        for (kid, variant) in jobs {
            if self.handle.is_cancelled() {
                interrupted = true;
                break;
            }
            let permit = self.acquire().await?;
            let this = self.clone();
            set.spawn(async move {
                let _permit = permit;
                this.sync_index(kid, variant, clock).await
            });
        }

        Ok(collect(set, report).await? && !interrupted)
    }

    async fn sync_index(&self, kid: Kid, variant: u8, clock: PassClock) -> RevocationResult<Step> {
        let cached = self.store.index(&kid, variant).await?;
        if cached
            .as_ref()
            .is_some_and(|record| clock.written_this_pass(record.synced_at))
        {
            return Ok(Step::Skipped);
        }

        let since = cached.and(epoch_seconds(clock.last_finish));
        Ok(match self.fetcher.fetch_index(&kid, variant, since).await? {
            Fetched::Modified(index) => {
                debug!("Index {kid}/{variant:02x} changed: {} partitions", index.len());
                let record = IndexRecord {
                    index,
                    synced_at: clock.start,
                };
                let pruned = self.store.apply_index(&kid, variant, record).await?;
                Step::Downloaded { pruned }
            }
            Fetched::NotModified => Step::NotModified,
            Fetched::Absent(_) => Step::Absent,
        })
    }

    async fn sync_byte1_chunks(
        &self,
        clock: PassClock,
        report: &mut SyncReport,
    ) -> RevocationResult<bool> {
        let mut set = JoinSet::new();
        let mut interrupted = false;

        'indices: for ((kid, variant), record) in self.store.indices().await? {
            for (byte1, entry) in record.index {
                if self.handle.is_cancelled() {
                    interrupted = true;
                    break 'indices;
                }
                let cached = self.store.byte1_chunks(&kid, variant, byte1).await?;
                if !is_due(entry.timestamp, cached.as_ref(), clock) {
                    continue;
                }

                let permit = self.acquire().await?;
                let this = self.clone();
                let kid = kid.clone();
                set.spawn(async move {
                    let _permit = permit;
                    let since = cached.as_ref().and_then(|row| epoch_seconds(row.synced_at));
                    let fetched = this
                        .fetcher
                        .fetch_byte1_chunks(&kid, variant, byte1, since)
                        .await?;
                    let (row, step) = chunk_update(fetched, cached, clock);
                    if let Some(row) = row {
                        this.store
                            .put_byte1_chunks(&kid, variant, byte1, row)
                            .await?;
                    }
                    Ok(step)
                });
            }
        }

        Ok(collect(set, report).await? && !interrupted)
    }

    async fn sync_byte2_chunks(
        &self,
        clock: PassClock,
        report: &mut SyncReport,
    ) -> RevocationResult<bool> {
        let mut set = JoinSet::new();
        let mut interrupted = false;

        'indices: for ((kid, variant), record) in self.store.indices().await? {
            for (byte1, entry) in record.index {
                for (byte2, sub) in entry.byte2 {
                    if self.handle.is_cancelled() {
                        interrupted = true;
                        break 'indices;
                    }
                    let cached = self.store.byte2_chunks(&kid, variant, byte1, byte2).await?;
                    if !is_due(sub.timestamp, cached.as_ref(), clock) {
                        continue;
                    }

                    let permit = self.acquire().await?;
                    let this = self.clone();
                    let kid = kid.clone();
                    set.spawn(async move {
                        let _permit = permit;
                        let since = cached.as_ref().and_then(|row| epoch_seconds(row.synced_at));
                        let fetched = this
                            .fetcher
                            .fetch_byte2_chunks(&kid, variant, byte1, byte2, since)
                            .await?;
                        let (row, step) = chunk_update(fetched, cached, clock);
                        if let Some(row) = row {
                            this.store
                                .put_byte2_chunks(&kid, variant, byte1, byte2, row)
                                .await?;
                        }
                        Ok(step)
                    });
                }
            }
        }

        Ok(collect(set, report).await? && !interrupted)
    }

    async fn acquire(&self) -> RevocationResult<tokio::sync::OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RevocationError::Fatal(format!("Sync worker pool closed: {e}")))
    }
}

fn epoch_seconds(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// A chunk list is fetched when nothing is cached for it, or when its index
/// timestamp is newer than both the last finished pass and the cached row.
fn is_due(index_timestamp: i64, cached: Option<&ChunkRecord>, clock: PassClock) -> bool {
    match cached {
        None => true,
        Some(row) => index_timestamp > clock.last_finish.max(row.synced_at),
    }
}

/// Turns a chunk fetch into the row to persist, if any.
fn chunk_update(
    fetched: Fetched<Vec<HashPrefix>>,
    cached: Option<ChunkRecord>,
    clock: PassClock,
) -> (Option<ChunkRecord>, Step) {
    match fetched {
        Fetched::Modified(chunks) => (
            Some(ChunkRecord {
                chunks,
                synced_at: clock.start,
            }),
            Step::Downloaded { pruned: 0 },
        ),
        // re-stamp so the partition is not re-checked against the same index timestamp
        Fetched::NotModified => (
            cached.map(|row| ChunkRecord {
                synced_at: clock.start,
                ..row
            }),
            Step::NotModified,
        ),
        Fetched::Absent(_) => (None, Step::Absent),
    }
}

async fn collect(
    mut set: JoinSet<RevocationResult<Step>>,
    report: &mut SyncReport,
) -> RevocationResult<bool> {
    let mut complete = true;
    let mut failure = None;

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(step)) => complete &= report.record(step),
            Ok(Err(e)) => {
                failure.get_or_insert(e);
            }
            Err(e) => {
                error!("Sync task failed to complete: {}", e);
                failure.get_or_insert(RevocationError::Fatal(format!("Sync task failed: {e}")));
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(complete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> PassClock {
        PassClock {
            start: 2_000,
            last_finish: 1_000,
            resumed: false,
        }
    }

    fn row(synced_at: i64) -> ChunkRecord {
        ChunkRecord {
            chunks: vec![],
            synced_at,
        }
    }

    #[test]
    fn test_is_due() {
        assert!(is_due(0, None, clock()));
        assert!(!is_due(900, Some(&row(500)), clock()));
        assert!(is_due(1_100, Some(&row(500)), clock()));
        assert!(!is_due(1_100, Some(&row(1_500)), clock()));
        assert!(is_due(1_600, Some(&row(1_500)), clock()));
    }

    #[test]
    fn test_index_rows_from_earlier_passes_are_refreshed() {
        let fresh = clock();
        assert!(!fresh.written_this_pass(2_000));
        assert!(!fresh.written_this_pass(1_500));

        let resumed = PassClock {
            resumed: true,
            ..clock()
        };
        assert!(resumed.written_this_pass(2_000));
        // stamped by an abandoned pass that started after the last finish
        assert!(!resumed.written_this_pass(1_500));
        assert!(!resumed.written_this_pass(500));
    }

    #[test]
    fn test_chunk_update_restamps_on_not_modified() {
        let (rec, step) = chunk_update(Fetched::NotModified, Some(row(500)), clock());
        assert_eq!(step, Step::NotModified);
        assert_eq!(rec.unwrap().synced_at, 2_000);

        let (rec, _) = chunk_update(Fetched::NotModified, None, clock());
        assert!(rec.is_none());

        let (rec, step) = chunk_update(
            Fetched::Absent(crate::revocation::errors::AbsentReason::NetworkUnavailable),
            Some(row(500)),
            clock(),
        );
        assert!(rec.is_none());
        assert_eq!(step, Step::Absent);
    }

    #[test]
    fn test_report_counts() {
        let mut report = SyncReport::default();
        assert!(report.record(Step::Skipped));
        assert!(report.record(Step::Downloaded { pruned: 3 }));
        assert!(report.record(Step::NotModified));
        assert!(!report.record(Step::Absent));
        assert_eq!(report.requests, 3);
        assert_eq!(report.downloads, 1);
        assert_eq!(report.pruned, 3);
        assert_eq!(report.absent, 1);
    }

    #[test]
    fn test_sync_handle_cancel() {
        let handle = SyncHandle::default();
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.clone().is_cancelled());
        handle.reset();
        assert!(!handle.is_cancelled());
    }
}
