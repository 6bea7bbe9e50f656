//! L1 coincidence building: stream raw hit files in chunks, apply
//! per-channel time offsets, and emit one event per surviving trigger.

use crate::chunk::ChunkedHitStream;
use crate::driver::{self, CancelToken};
use crate::files;
use hittools::cfg::{self, ChannelMap, TimeOffsets};
use hittools::de::HitFile;
use hittools::err::{Error, Result};
use hittools::ser::ShardWriter;
use hittools::{pat, EventWriter, Hit};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

pub struct L1Builder {
    ch_map: Arc<ChannelMap>,
    offsets: TimeOffsets,
    files: Vec<PathBuf>,
    window_ns: f64,
    ref_mod: usize,
    ref_ch: usize,
    cancel: CancelToken,
    out_dir: PathBuf,
}

impl L1Builder {
    pub fn new(out_dir: &Path) -> L1Builder {
        L1Builder {
            ch_map: Arc::new(Vec::new()),
            offsets: TimeOffsets::default(),
            files: Vec::new(),
            window_ns: 1000.,
            ref_mod: 0,
            ref_ch: 0,
            cancel: CancelToken::new(),
            out_dir: out_dir.to_path_buf(),
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
        self.ch_map = Arc::new(map);
        Ok(())
    }

    pub fn load_file_list(&mut self, files: Vec<PathBuf>) -> Result<()> {
        if files.is_empty() {
            return Err(Error::Validation("file list is empty".into()));
        }
        self.files = files;
        Ok(())
    }

    pub fn load_time_offsets(&mut self, path: &Path) -> Result<()> {
        let offsets = TimeOffsets::load(path)?;
        if offsets.is_empty() {
            return Err(Error::ConfigMissing(format!(
                "no time offsets found in {}",
                path.display()
            )));
        }
        self.offsets = offsets;
        Ok(())
    }

    /// Half-width of the coincidence window, nanoseconds.
    pub fn set_coincidence_window(&mut self, window_ns: f64) {
        self.window_ns = window_ns;
    }

    pub fn set_reference(&mut self, ref_mod: usize, ref_ch: usize) {
        self.ref_mod = ref_mod;
        self.ref_ch = ref_ch;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Build events from all input files. Files are split round-robin
    /// across workers; each worker owns one output shard
    /// `L1_{worker}.evts.zst`.
    pub fn build(&self, n_workers: u32) -> Result<()> {
        if self.ch_map.is_empty() {
            return Err(Error::ConfigMissing("channel settings not loaded".into()));
        }
        if self.files.is_empty() {
            return Err(Error::Validation("file list is empty".into()));
        }
        if self.offsets.is_empty() {
            return Err(Error::ConfigMissing("time offsets not loaded".into()));
        }
        let n_workers = driver::clamp_workers(n_workers, self.files.len())?;

        // The chosen reference must be one the alignment stage actually
        // produced offsets for.
        let reference = self
            .offsets
            .reference(self.ref_mod, self.ref_ch)
            .ok_or_else(|| {
                Error::Range(format!(
                    "time reference module {} channel {} has no offsets; \
                     rerun the alignment stage or fix TimeReferenceMod/TimeReferenceCh",
                    self.ref_mod, self.ref_ch
                ))
            })?;
        let reference = Arc::new(reference.clone());
        info!(ref_mod = self.ref_mod, ref_ch = self.ref_ch, "using time reference");

        let parts = driver::partition(&self.files, n_workers);
        let mut handles = Vec::with_capacity(n_workers);
        for (worker, part) in parts.into_iter().enumerate() {
            let map = Arc::clone(&self.ch_map);
            let reference = Arc::clone(&reference);
            let cancel = self.cancel.clone();
            let window_ns = self.window_ns;
            let shard = files::shard_path(&self.out_dir, "L1", worker);
            handles.push(thread::spawn(move || {
                build_worker(worker, part, &map, &reference, window_ns, &shard, &cancel)
            }));
        }
        let counts = driver::join_all(handles)?;
        info!(events = counts.iter().sum::<u64>(), "coincidence building finished");
        Ok(())
    }
}

fn build_worker(
    worker: usize,
    files: Vec<PathBuf>,
    map: &ChannelMap,
    reference: &[Vec<f64>],
    window_ns: f64,
    shard: &Path,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut writer = ShardWriter::create(shard)?;
    let mut n_events = 0;
    for (position, path) in files.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        info!(
            worker,
            file = %path.display(),
            progress = format!("{}/{}", position + 1, files.len()),
            "building events"
        );
        // Unreadable inputs are transient: log, skip, keep going.
        let mut reader = match HitFile::open(path) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(worker, file = %path.display(), error = %e, "skipping file");
                continue;
            }
        };
        let n = build_file(path, &mut reader, map, reference, window_ns, &mut writer, cancel)?;
        n_events += n;
        info!(worker, file = %path.display(), events = n, "file done");
    }
    // Flush before reporting cancellation: partial shards are valid.
    writer.finish()?;
    if cancel.is_cancelled() {
        info!(worker, events = n_events, "cancelled, shard flushed");
        return Err(Error::Cancelled);
    }
    Ok(n_events)
}

/// Build all events of one file. Read failures are logged and abandon
/// the rest of the file; only shard-write failures propagate.
fn build_file(
    path: &Path,
    reader: &mut HitFile,
    map: &ChannelMap,
    reference: &[Vec<f64>],
    window_ns: f64,
    writer: &mut impl EventWriter,
    cancel: &CancelToken,
) -> Result<u64> {
    let filter = |hit: &Hit| -> Option<f64> {
        let ch = cfg::lookup(map, hit.module, hit.channel)?;
        if hit.charge_long as u32 <= ch.threshold_adc {
            return None;
        }
        let offset = reference
            .get(hit.module as usize)?
            .get(hit.channel as usize)?;
        Some(hit.timestamp_ps / 1000. - offset)
    };
    let stream = match ChunkedHitStream::with_wrap_repair(reader, filter) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "skipping file");
            return Ok(0);
        }
    };

    let mut n_events = 0;
    for chunk in stream {
        if cancel.is_cancelled() {
            break;
        }
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "chunk read failed, rest of file skipped");
                break;
            }
        };
        n_events += pat::build_events(&chunk.hits, map, window_ns, &chunk.interior, |event| {
            writer.write(&event)
        })?;
        debug!(
            file = %path.display(),
            through = chunk.interior.end,
            events = n_events,
            "chunk done"
        );
    }
    Ok(n_events)
}
