//! Worker orchestration shared by the pipeline stages: cooperative
//! cancellation, worker-count clamping, file partitioning, and join
//! with first-error propagation.

use hittools::err::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Cooperative cancellation flag shared by every worker of a pipeline.
/// Workers check it between chunks and finish their current shard
/// cleanly when it is set.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Route SIGINT to this token. The handler owns only a clone of the
    /// token, so the dispatch stays with the pipeline that installed it.
    pub fn hook_interrupt(&self) {
        let token = self.clone();
        let result = ctrlc::set_handler(move || {
            info!("interrupt received, stopping workers at the next chunk boundary");
            token.cancel();
        });
        if let Err(e) = result {
            warn!(error = %e, "could not install interrupt handler");
        }
    }
}

/// Validate a requested worker count and clamp it to the number of
/// work items.
pub fn clamp_workers(requested: u32, n_items: usize) -> Result<usize> {
    if requested == 0 || requested > 128 {
        return Err(Error::Validation(format!(
            "thread count must be between 1 and 128, got {requested}"
        )));
    }
    Ok((requested as usize).min(n_items.max(1)))
}

/// Round-robin partition of `items` across `n` workers. Every item
/// lands in exactly one part; parts may be empty when `n > items`.
pub fn partition<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    let mut parts = vec![Vec::new(); n];
    for (i, item) in items.iter().enumerate() {
        parts[i % n].push(item.clone());
    }
    parts
}

/// Shared pull queue for stages whose workers self-schedule files.
/// Each element is handed out exactly once.
pub struct FileQueue {
    files: Mutex<VecDeque<(usize, PathBuf)>>,
    total: usize,
}

impl FileQueue {
    pub fn new(files: Vec<PathBuf>) -> FileQueue {
        let total = files.len();
        FileQueue {
            files: Mutex::new(files.into_iter().enumerate().collect()),
            total,
        }
    }

    /// Next unprocessed file and its position in the original list.
    pub fn pop(&self) -> Option<(usize, PathBuf)> {
        self.files.lock().pop_front()
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

/// Join workers in spawn order, returning their results in that order.
/// The first worker error wins; panics are resumed on the caller.
pub fn join_all<T>(handles: Vec<JoinHandle<Result<T>>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(handles.len());
    let mut first_err = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
