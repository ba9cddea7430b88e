//! The concurrent fetch pipeline.
//!
//! The entry range is partitioned into work units of at most the server's
//! batch hint. A bounded pool of workers pulls units off a FIFO queue,
//! fetches and decodes them (re-requesting the tail whenever the server
//! answers with a short prefix), and pushes completed batches into an
//! ordering buffer; a single reorder stage drains the buffer in strict index
//! order and hands every entry to the sink exactly once, gap-free.
//!
//! Backpressure: a unit holds a window permit from the moment it is
//! dispatched until the reorder stage has drained its entries. Permits are
//! acquired under the queue lock, so units enter the window in index order
//! and the buffer can never hold more than the window's worth of batches
//! ahead of the next expected index. The lowest outstanding unit always has
//! a permit and an owning worker, so the drain front always advances.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::LogTransport;
use crate::entry::Entry;
use crate::error::MirrorError;

/// Window permits per worker; each unit carries at most one batch of
/// entries, so the ordering buffer stays under ~4 batches per worker.
const WINDOW_UNITS_PER_WORKER: usize = 4;

/// Entry indexes `start..end` to fetch as one `get-entries` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkUnit {
    start: u64,
    end: u64,
}

enum Msg {
    Batch {
        start: u64,
        entries: Vec<Entry>,
        permit: OwnedSemaphorePermit,
    },
    Failed(MirrorError),
}

/// Fetch `start..end`, deliver every entry to `sink` in strict index order.
///
/// Workers check the cancellation token before each request and again before
/// enqueueing results, so an abort drains the pipeline within a bounded time.
/// The first failure wins; everything in flight is cancelled behind it.
pub async fn fetch_ordered(
    transport: Arc<dyn LogTransport>,
    start: u64,
    end: u64,
    batch: u64,
    workers: usize,
    cancel: &CancellationToken,
    sink: &mut dyn FnMut(Entry) -> Result<(), MirrorError>,
) -> Result<(), MirrorError> {
    assert!(batch > 0 && workers > 0);
    if start >= end {
        return Ok(());
    }

    let mut units = VecDeque::new();
    let mut at = start;
    while at < end {
        let unit_end = (at + batch).min(end);
        units.push_back(WorkUnit { start: at, end: unit_end });
        at = unit_end;
    }

    let queue = Arc::new(Mutex::new(units));
    let window = Arc::new(Semaphore::new(workers * WINDOW_UNITS_PER_WORKER));
    let (tx, mut rx) = mpsc::channel::<Msg>(workers);

    let handles: Vec<JoinHandle<()>> = (0..workers)
        .map(|_| {
            tokio::spawn(worker(
                Arc::clone(&transport),
                Arc::clone(&queue),
                Arc::clone(&window),
                tx.clone(),
                cancel.clone(),
            ))
        })
        .collect();
    drop(tx);

    let mut pending: BTreeMap<u64, (Vec<Entry>, OwnedSemaphorePermit)> = BTreeMap::new();
    let mut next = start;
    let mut result = Ok(());

    while next < end {
        let Some(msg) = rx.recv().await else {
            // Workers are gone without finishing the range; only an external
            // cancellation gets us here.
            result = Err(MirrorError::Cancelled);
            break;
        };
        match msg {
            Msg::Failed(err) => {
                cancel.cancel();
                result = Err(err);
                break;
            }
            Msg::Batch { start, entries, permit } => {
                pending.insert(start, (entries, permit));
                while let Some((entries, permit)) = pending.remove(&next) {
                    for entry in entries {
                        debug_assert_eq!(entry.index, next);
                        if let Err(err) = sink(entry) {
                            cancel.cancel();
                            // Fall through so workers shut down below.
                            result = Err(err);
                            next = end;
                            break;
                        }
                        next += 1;
                    }
                    drop(permit);
                    if result.is_err() {
                        break;
                    }
                }
            }
        }
    }

    drop(rx);
    for handle in handles {
        let _ = handle.await;
    }
    result
}

async fn worker(
    transport: Arc<dyn LogTransport>,
    queue: Arc<Mutex<VecDeque<WorkUnit>>>,
    window: Arc<Semaphore>,
    results: mpsc::Sender<Msg>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        // Take the next unit and its window permit atomically so units enter
        // the window in index order.
        let (unit, permit) = {
            let mut queue = queue.lock().await;
            if queue.is_empty() {
                return;
            }
            let permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = Arc::clone(&window).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let unit = queue.pop_front().expect("checked non-empty under lock");
            (unit, permit)
        };

        // Fetch until the unit is covered. Servers may answer with any
        // non-empty prefix; the unreturned tail is simply the next request,
        // with no retry charged. Completing the unit here keeps one batch
        // per permit, so the lowest outstanding unit always has an owning
        // worker and the drain front cannot stall.
        let mut entries = Vec::with_capacity((unit.end - unit.start) as usize);
        let mut cursor = unit.start;
        while cursor < unit.end {
            if cancel.is_cancelled() {
                return;
            }
            let mut raw = match transport.get_entries(cursor, unit.end - 1).await {
                Ok(raw) => raw,
                Err(err) => {
                    cancel.cancel();
                    let _ = results.send(Msg::Failed(err)).await;
                    return;
                }
            };
            if raw.is_empty() {
                cancel.cancel();
                let _ = results
                    .send(Msg::Failed(MirrorError::TransientNetwork {
                        url: format!("get-entries start={cursor}"),
                        attempts: 1,
                        reason: "log returned an empty entry list".into(),
                    }))
                    .await;
                return;
            }
            // Anything past the requested range would be refetched by a
            // later unit anyway.
            raw.truncate((unit.end - cursor) as usize);

            for raw_entry in raw {
                let entry = Entry::new(cursor, raw_entry.leaf_input, raw_entry.extra_data);
                if let Err(err) = entry.decode() {
                    cancel.cancel();
                    let _ = results.send(Msg::Failed(err)).await;
                    return;
                }
                entries.push(entry);
                cursor += 1;
            }
            if cursor < unit.end {
                debug!(start = cursor, end = unit.end, "short response, fetching the tail");
            }
        }

        if cancel.is_cancelled() {
            return;
        }
        if results
            .send(Msg::Batch {
                start: unit.start,
                entries,
                permit,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}
