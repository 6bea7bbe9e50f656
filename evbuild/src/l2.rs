//! L2 condition filtering: evaluate the compiled condition program
//! against every L1 event and re-emit the accepted ones with their
//! counter and flag values attached.

use crate::driver::{self, CancelToken};
use crate::files;
use hittools::cfg::{self, ChannelMap, L2Condition};
use hittools::de;
use hittools::err::{Error, Result};
use hittools::rules::Program;
use hittools::ser::ShardWriter;
use hittools::EventWriter;
use std::path::{Path, PathBuf};
use std::thread;
use tracing::{info, warn};

/// Events between cancellation checks inside one shard.
const CANCEL_CHECK_EVERY: u64 = 4096;

pub struct L2Engine {
    ch_map: ChannelMap,
    program: Option<Program>,
    cancel: CancelToken,
    dir: PathBuf,
}

impl L2Engine {
    /// `dir` holds the L1 shards and receives the L2 shards.
    pub fn new(dir: &Path) -> L2Engine {
        L2Engine {
            ch_map: Vec::new(),
            program: None,
            cancel: CancelToken::new(),
            dir: dir.to_path_buf(),
        }
    }

    pub fn load_channel_settings(&mut self, path: &Path) -> Result<()> {
        let map = cfg::ChannelSettings::load_map(path)?;
        if map.is_empty() {
            return Err(Error::ConfigMissing(format!(
                "no channel settings found in {}",
                path.display()
            )));
        }
        self.ch_map = map;
        Ok(())
    }

    /// Load and compile the condition program. Channel settings must be
    /// loaded first so counter tables can be resolved.
    pub fn load_conditions(&mut self, path: &Path) -> Result<()> {
        if self.ch_map.is_empty() {
            return Err(Error::ConfigMissing(
                "channel settings must be loaded before the condition program".into(),
            ));
        }
        let conditions = L2Condition::load(path)?;
        self.program = Some(Program::compile(&conditions, &self.ch_map)?);
        Ok(())
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Filter all L1 shards. Shards are split round-robin across
    /// workers; each worker owns a mutable copy of the program and one
    /// output shard `L2_{worker}.evts.zst`.
    pub fn build(&self, n_workers: u32) -> Result<()> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| Error::ConfigMissing("condition program not loaded".into()))?;

        let shards = files::find_shards(&self.dir, "L1");
        if shards.is_empty() {
            return Err(Error::Validation(format!(
                "no L1 shards found in {}",
                self.dir.display()
            )));
        }
        let n_workers = driver::clamp_workers(n_workers, shards.len())?;

        let parts = driver::partition(&shards, n_workers);
        let mut handles = Vec::with_capacity(n_workers);
        for (worker, part) in parts.into_iter().enumerate() {
            let program = program.clone();
            let cancel = self.cancel.clone();
            let shard = files::shard_path(&self.dir, "L2", worker);
            handles.push(thread::spawn(move || {
                filter_worker(worker, part, program, &shard, &cancel)
            }));
        }
        let totals = driver::join_all(handles)?;
        let (seen, kept) = totals
            .iter()
            .fold((0u64, 0u64), |(s, k), (a, b)| (s + a, k + b));
        info!(seen, kept, "condition filtering finished");
        Ok(())
    }
}

fn filter_worker(
    worker: usize,
    shards: Vec<PathBuf>,
    mut program: Program,
    out_shard: &Path,
    cancel: &CancelToken,
) -> Result<(u64, u64)> {
    let mut writer = ShardWriter::create(out_shard)?;
    let mut seen = 0u64;
    let mut kept = 0u64;

    for path in &shards {
        if cancel.is_cancelled() {
            break;
        }
        info!(worker, shard = %path.display(), "filtering");
        let events = match de::open_shard(path) {
            Ok(events) => events,
            Err(e) => {
                warn!(worker, shard = %path.display(), error = %e, "skipping shard");
                continue;
            }
        };
        for event in events {
            if seen % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
                break;
            }
            let mut event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!(worker, shard = %path.display(), error = %e, "corrupt shard tail, rest skipped");
                    break;
                }
            };
            seen += 1;
            if event.hits.is_empty() {
                continue;
            }
            if program.evaluate(&event) {
                let (counters, flags) = program.side_channels();
                event.counters = counters;
                event.flags = flags;
                writer.write(&event)?;
                kept += 1;
            }
        }
    }
    // Flush before reporting cancellation: partial shards are valid.
    writer.finish()?;
    if cancel.is_cancelled() {
        info!(worker, seen, kept, "cancelled, shard flushed");
        return Err(Error::Cancelled);
    }
    Ok((seen, kept))
}
