pub mod cfg;
pub mod de;
pub mod err;
pub mod hist;
pub mod pat;
pub mod rules;
pub mod ser;

pub use err::{Error, Result};

/// One digitiser pulse as read from a raw hit file.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Hit {
    /// Digitiser module the pulse came from
    pub module: u8,
    /// Channel within the module
    pub channel: u8,
    /// Long-gate charge integral
    pub charge_long: u16,
    /// Short-gate charge integral
    pub charge_short: u16,
    /// Fine timestamp in picoseconds, as written by the hardware counter
    pub timestamp_ps: f64,
}

/// One member of a built event, with its time relative to the trigger.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct RelHit {
    /// Set when this hit's anti-coincidence partner fired inside the window
    pub is_with_ac: bool,
    pub module: u8,
    pub channel: u8,
    pub charge_long: u16,
    pub charge_short: u16,
    /// Time relative to the event trigger, nanoseconds
    pub rel_time_ns: f64,
}

/// A built coincidence event.
///
/// `hits[0]` is always the trigger hit with `rel_time_ns == 0`; the rest
/// are sorted ascending in relative time. The `counters` and `flags`
/// side-channels are empty until the condition stage fills them.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Event {
    pub trigger_time_ns: f64,
    pub hits: Vec<RelHit>,
    pub counters: Vec<(String, u64)>,
    pub flags: Vec<(String, bool)>,
}

/// Period of the 47-bit hardware timestamp counter, picoseconds.
pub const TS_PERIOD_PS: f64 = ((1u64 << 47) - 1) as f64;

/// Sequential, index-addressed source of hits.
///
/// Indices run over `[0, len())`. `read_range` is the only access path;
/// backends may be flat files, columnar tables, or in-memory vectors.
pub trait HitReader {
    /// Number of records in the source.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read all records with indices in `[start, end)`, clamped to the
    /// source length.
    fn read_range(&mut self, start: u64, end: u64) -> Result<Vec<Hit>>;
}

/// In-memory hit source, mainly for tests and small inputs.
impl HitReader for Vec<Hit> {
    fn len(&self) -> u64 {
        self.as_slice().len() as u64
    }

    fn read_range(&mut self, start: u64, end: u64) -> Result<Vec<Hit>> {
        let end = (end as usize).min(self.as_slice().len());
        let start = (start as usize).min(end);
        Ok(self[start..end].to_vec())
    }
}

/// Sink for built events. Writers are exclusive to one worker.
pub trait EventWriter {
    fn write(&mut self, event: &Event) -> Result<()>;

    /// Flush buffered state. Must be called before the writer is dropped.
    fn finish(&mut self) -> Result<()>;
}
