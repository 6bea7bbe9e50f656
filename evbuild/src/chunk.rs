//! Bounded-memory chunked streaming of hit files, with overlap so
//! coincidences crossing a chunk boundary are never split, and repair
//! of wrapped 47-bit hardware timestamps.

use hittools::err::Result;
use hittools::pat::ScanHit;
use hittools::{Hit, HitReader, TS_PERIOD_PS};
use std::ops::Range;
use tracing::debug;

/// Hits held in memory per chunk.
pub const CHUNK_SIZE: u64 = 10_000_000;

/// Hits read before and after each chunk. Any coincidence window is
/// seen whole in at least one chunk as long as `OVERLAP` hits span more
/// time than the window half-width; at the acquisition rates this
/// pipeline is built for, 10k hits cover the largest windows in use
/// with plenty of margin.
pub const OVERLAP: u64 = 10_000;

/// One loaded chunk: filtered hits sorted ascending by mapped time,
/// plus the global index range this chunk is responsible for. Triggers
/// outside `interior` belong to a neighbouring chunk and must not be
/// emitted twice.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub hits: Vec<ScanHit>,
    pub interior: Range<u64>,
}

/// Repair state for a file whose timestamp counter wrapped: every hit
/// up to and including `boundary` gets a whole number of counter
/// periods added, keyed on the module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WrapRepair {
    boundary: u64,
}

/// Modules 0 and 1 roll over four counter periods, the rest two. The
/// multiples encode roll-over counts observed in real acquisition data
/// and must not be changed without revalidating against it.
fn wrap_adjust_ps(module: u8) -> f64 {
    if module <= 1 {
        4. * TS_PERIOD_PS
    } else {
        2. * TS_PERIOD_PS
    }
}

/// Iterator of `Chunk`s over a hit source.
///
/// `map` is the load-time filter: it returns the hit's mapped time in
/// nanoseconds (threshold and offset handling live in the closure), or
/// `None` to drop the hit.
pub struct ChunkedHitStream<'a, R, F> {
    reader: &'a mut R,
    map: F,
    chunk_size: u64,
    overlap: u64,
    len: u64,
    next_start: u64,
    wrap: Option<WrapRepair>,
}

impl<'a, R, F> ChunkedHitStream<'a, R, F>
where
    R: HitReader,
    F: FnMut(&Hit) -> Option<f64>,
{
    /// Stream a pre-aligned source; timestamps are taken as-is.
    pub fn new(reader: &'a mut R, map: F) -> ChunkedHitStream<'a, R, F> {
        Self::with_geometry(reader, map, CHUNK_SIZE, OVERLAP)
    }

    /// Stream a raw source, first checking for a wrapped timestamp
    /// counter and locating the repair boundary when needed.
    pub fn with_wrap_repair(reader: &'a mut R, map: F) -> Result<ChunkedHitStream<'a, R, F>> {
        let wrap = detect_wrap(reader, CHUNK_SIZE)?;
        let mut stream = Self::with_geometry(reader, map, CHUNK_SIZE, OVERLAP);
        stream.wrap = wrap;
        Ok(stream)
    }

    /// Explicit chunk geometry, for tests and diagnostics.
    pub fn with_geometry(
        reader: &'a mut R,
        map: F,
        chunk_size: u64,
        overlap: u64,
    ) -> ChunkedHitStream<'a, R, F> {
        let len = reader.len();
        ChunkedHitStream {
            reader,
            map,
            chunk_size,
            overlap,
            len,
            next_start: 0,
            wrap: None,
        }
    }

    pub fn set_wrap(&mut self, wrap: Option<WrapRepair>) {
        self.wrap = wrap;
    }

    pub fn wrap(&self) -> Option<WrapRepair> {
        self.wrap
    }
}

impl<R, F> Iterator for ChunkedHitStream<'_, R, F>
where
    R: HitReader,
    F: FnMut(&Hit) -> Option<f64>,
{
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Result<Chunk>> {
        if self.next_start >= self.len {
            return None;
        }
        let chunk_start = self.next_start;
        self.next_start = chunk_start.saturating_add(self.chunk_size);

        let read_start = chunk_start.saturating_sub(self.overlap);
        let read_end = (chunk_start + self.chunk_size + self.overlap).min(self.len);
        let raw = match self.reader.read_range(read_start, read_end) {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e)),
        };

        let mut hits = Vec::with_capacity(raw.len());
        for (k, mut hit) in raw.into_iter().enumerate() {
            let index = read_start + k as u64;
            if let Some(wrap) = self.wrap {
                if index <= wrap.boundary {
                    hit.timestamp_ps += wrap_adjust_ps(hit.module);
                }
            }
            if let Some(time_ns) = (self.map)(&hit) {
                hits.push(ScanHit {
                    index,
                    module: hit.module,
                    channel: hit.channel,
                    charge_long: hit.charge_long,
                    charge_short: hit.charge_short,
                    time_ns,
                });
            }
        }
        hits.sort_by(|a, b| a.time_ns.total_cmp(&b.time_ns));

        let interior = chunk_start..(chunk_start + self.chunk_size).min(self.len);
        Some(Ok(Chunk { hits, interior }))
    }
}

/// Check whether the file's timestamp counter wrapped (the file spans
/// more than one 47-bit period first-to-last) and if so find the last
/// record index still carrying un-unwrapped timestamps.
///
/// The boundary is the first index whose pre-adjustment gap to the next
/// record exceeds one period; when no such gap exists every record but
/// the last is adjusted.
pub fn detect_wrap(reader: &mut impl HitReader, scan_block: u64) -> Result<Option<WrapRepair>> {
    let len = reader.len();
    if len < 2 {
        return Ok(None);
    }
    let first = match reader.read_range(0, 1)?.first() {
        Some(h) => h.timestamp_ps,
        None => return Ok(None),
    };
    let last = match reader.read_range(len - 1, len)?.first() {
        Some(h) => h.timestamp_ps,
        None => return Ok(None),
    };
    if last - first <= TS_PERIOD_PS {
        return Ok(None);
    }

    let mut boundary = len - 2;
    let mut prev: Option<f64> = None;
    let mut pos = 0;
    'scan: while pos < len {
        let end = (pos + scan_block).min(len);
        let block = reader.read_range(pos, end)?;
        for (k, hit) in block.iter().enumerate() {
            if let Some(prev_ts) = prev {
                if hit.timestamp_ps - prev_ts > TS_PERIOD_PS {
                    boundary = pos + k as u64 - 1;
                    break 'scan;
                }
            }
            prev = Some(hit.timestamp_ps);
        }
        pos = end;
    }

    debug!(boundary, first, last, "timestamp counter wrapped, repairing");
    Ok(Some(WrapRepair { boundary }))
}
