//! Time-offset calibration: build Δt histograms between every
//! trigger-capable reference channel and all other channels, then read
//! each offset off the histogram peak.

use crate::chunk::ChunkedHitStream;
use crate::driver::{self, CancelToken, FileQueue};
use hittools::cfg::{self, ChannelMap, DetectorType, TimeOffsets};
use hittools::de::HitFile;
use hittools::err::{Error, Result};
use hittools::hist::{Hist1, Hist2};
use hittools::{pat, Hit};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Bin count of the diagnostic ADC spectra.
const ADC_BINS: usize = 32_000;

/// Δt × partner-id histogram and ADC spectrum of one channel.
#[derive(Clone)]
struct ChannelHists {
    time: Hist2,
    adc: Hist1,
}

type HistGrid = Vec<Vec<ChannelHists>>;

fn new_grid(map: &ChannelMap, window_ns: f64, n_ids: usize) -> HistGrid {
    let nbins = (window_ns.round() as usize).max(1);
    map.iter()
        .map(|module| {
            module
                .iter()
                .map(|_| ChannelHists {
                    time: Hist2::new(nbins, -window_ns, window_ns, n_ids),
                    adc: Hist1::new(ADC_BINS, 0., ADC_BINS as f64),
                })
                .collect()
        })
        .collect()
}

pub struct TimeAlignment {
    ch_map: Arc<ChannelMap>,
    files: Vec<PathBuf>,
    window_ns: f64,
    hists: HistGrid,
    cancel: CancelToken,
    out_dir: PathBuf,
}

impl TimeAlignment {
    pub fn new(out_dir: &Path) -> TimeAlignment {
        TimeAlignment {
            ch_map: Arc::new(Vec::new()),
            files: Vec::new(),
            window_ns: 1000.,
            hists: Vec::new(),
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

    /// Half-width of the Δt axis, nanoseconds.
    pub fn set_time_window(&mut self, window_ns: f64) {
        self.window_ns = window_ns;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Fill the histograms from all input files with `n_workers`
    /// parallel workers pulling from a shared queue. Each worker fills
    /// private histograms; the merge adds them bin-wise in worker-id
    /// order so repeated runs are bit-identical.
    pub fn fill(&mut self, n_workers: u32) -> Result<()> {
        if self.ch_map.is_empty() {
            return Err(Error::ConfigMissing("channel settings not loaded".into()));
        }
        if self.files.is_empty() {
            return Err(Error::Validation("file list is empty".into()));
        }
        let n_workers = driver::clamp_workers(n_workers, self.files.len())?;
        let n_ids = (cfg::max_id(&self.ch_map).max(0) as usize) + 1;

        let queue = Arc::new(FileQueue::new(self.files.clone()));
        let mut handles = Vec::with_capacity(n_workers);
        for worker in 0..n_workers {
            let queue = Arc::clone(&queue);
            let map = Arc::clone(&self.ch_map);
            let cancel = self.cancel.clone();
            let window_ns = self.window_ns;
            handles.push(thread::spawn(move || {
                fill_worker(worker, &queue, &map, window_ns, n_ids, &cancel)
            }));
        }

        let worker_grids = driver::join_all(handles)?;
        let mut merged = new_grid(&self.ch_map, self.window_ns, n_ids);
        for grid in &worker_grids {
            for (merged_row, row) in merged.iter_mut().zip(grid) {
                for (into, from) in merged_row.iter_mut().zip(row) {
                    into.time.add(&from.time);
                    into.adc.add(&from.adc);
                }
            }
        }
        self.hists = merged;
        Ok(())
    }

    /// Extract the offset table from the filled histograms: for every
    /// populated reference channel, project each partner channel's Δt
    /// slice, rebin it by detector type, and take the highest bin's
    /// centre. The reference's own offset is zero by construction.
    pub fn compute_offsets(&self) -> Result<TimeOffsets> {
        if self.hists.is_empty() {
            return Err(Error::ConfigMissing("histograms not filled".into()));
        }
        let map = &self.ch_map;
        let mut table = Vec::with_capacity(map.len());
        for (ref_mod, module) in map.iter().enumerate() {
            let mut ref_row = Vec::with_capacity(module.len());
            for (ref_ch, _) in module.iter().enumerate() {
                let hist = &self.hists[ref_mod][ref_ch].time;
                if hist.entries() == 0 {
                    ref_row.push(Vec::new());
                    continue;
                }
                let mut slot = Vec::with_capacity(map.len());
                for (i_mod, chs) in map.iter().enumerate() {
                    let mut offsets = Vec::with_capacity(chs.len());
                    for (i_ch, ch) in chs.iter().enumerate() {
                        if ref_mod == i_mod && ref_ch == i_ch {
                            offsets.push(0.);
                            continue;
                        }
                        if ch.id < 0 {
                            offsets.push(0.);
                            continue;
                        }
                        let projection = hist.project_row(ch.id as usize);
                        let factor = DetectorType::parse(&ch.detector_type).rebin_factor();
                        let projection = projection.rebin(factor);
                        let offset = projection
                            .max_bin()
                            .map(|bin| projection.bin_center(bin))
                            .unwrap_or(0.);
                        offsets.push(offset);
                    }
                    slot.push(offsets);
                }
                ref_row.push(slot);
            }
            table.push(ref_row);
        }
        Ok(TimeOffsets::new(table))
    }

    /// Dump every non-empty histogram as TSV next to the offsets.
    pub fn save_histograms(&self) -> Result<()> {
        for (i_mod, module) in self.hists.iter().enumerate() {
            for (i_ch, hists) in module.iter().enumerate() {
                if hists.time.entries() > 0 {
                    let path = self.out_dir.join(format!("time_{i_mod:02}_{i_ch:02}.tsv"));
                    let mut wtr = tsv_writer(&path)?;
                    hists.time.tsv(&mut wtr)?;
                    wtr.flush()?;
                }
                if hists.adc.entries() > 0 {
                    let path = self.out_dir.join(format!("adc_{i_mod:02}_{i_ch:02}.tsv"));
                    let mut wtr = tsv_writer(&path)?;
                    hists.adc.tsv(&mut wtr)?;
                    wtr.flush()?;
                }
            }
        }
        Ok(())
    }

    /// Whole stage: fill, extract, and write `timeSettings.json` plus
    /// the diagnostic spectra.
    pub fn run(&mut self, n_workers: u32) -> Result<()> {
        self.fill(n_workers)?;
        let offsets = self.compute_offsets()?;
        let path = self.out_dir.join(crate::TIME_SETTINGS_FILE);
        offsets.save(&path)?;
        info!(path = %path.display(), "time offsets written");
        self.save_histograms()?;
        Ok(())
    }
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>> {
    Ok(csv::WriterBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .from_writer(BufWriter::new(File::create(path)?)))
}

fn fill_worker(
    worker: usize,
    queue: &FileQueue,
    map: &ChannelMap,
    window_ns: f64,
    n_ids: usize,
    cancel: &CancelToken,
) -> Result<HistGrid> {
    let mut grid = new_grid(map, window_ns, n_ids);
    while let Some((position, path)) = queue.pop() {
        if cancel.is_cancelled() {
            break;
        }
        info!(
            worker,
            file = %path.display(),
            progress = format!("{}/{}", position + 1, queue.total()),
            "filling histograms"
        );
        if let Err(e) = fill_file(&path, map, window_ns, &mut grid, cancel) {
            warn!(worker, file = %path.display(), error = %e, "skipping file");
        }
    }
    if cancel.is_cancelled() {
        info!(worker, "cancelled");
        return Err(Error::Cancelled);
    }
    Ok(grid)
}

/// Fill one file's worth of pairs. Alignment reads pre-aligned raw
/// files: no offsets are applied and the wraparound repair is skipped.
fn fill_file(
    path: &Path,
    map: &ChannelMap,
    window_ns: f64,
    grid: &mut HistGrid,
    cancel: &CancelToken,
) -> Result<()> {
    let mut reader = HitFile::open(path)?;
    let filter = |hit: &Hit| -> Option<f64> {
        let ch = cfg::lookup(map, hit.module, hit.channel)?;
        if hit.charge_long as u32 <= ch.threshold_adc {
            return None;
        }
        Some(hit.timestamp_ps / 1000.)
    };
    let stream = ChunkedHitStream::new(&mut reader, filter);
    for chunk in stream {
        if cancel.is_cancelled() {
            break;
        }
        let chunk = chunk?;
        for hit in &chunk.hits {
            if chunk.interior.contains(&hit.index) {
                grid[hit.module as usize][hit.channel as usize]
                    .adc
                    .fill(hit.charge_long as f64);
            }
        }
        pat::time_pairs(&chunk.hits, map, window_ns, &chunk.interior, |trig, dt, id| {
            if id >= 0 {
                grid[trig.module as usize][trig.channel as usize]
                    .time
                    .fill(dt, id as usize);
            }
        });
    }
    Ok(())
}
