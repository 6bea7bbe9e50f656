//! Serialization of hit and event streams, supporting `.hits`,
//! `.evts.zst`, and `.tsv`

use crate::err::Result;
use crate::{Event, EventWriter, Hit};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use zstd::stream;

/// On-disk size of one fixed-width hit record.
///
/// Hit files stay uncompressed so the chunked reader can address any
/// record in O(1): byte offset = index * `HIT_RECORD_LEN`.
pub const HIT_RECORD_LEN: u64 = 14;

/// Serialize hits to the fixed-width `.hits` format.
pub fn hits(wtr: &mut impl Write, hits: &[Hit]) -> Result<()> {
    for hit in hits {
        hit_record(wtr, hit)?;
    }
    Ok(())
}

fn hit_record(wtr: &mut impl Write, hit: &Hit) -> Result<()> {
    wtr.write_all(&[hit.module, hit.channel])?;
    wtr.write_all(&hit.charge_long.to_le_bytes())?;
    wtr.write_all(&hit.charge_short.to_le_bytes())?;
    wtr.write_all(&hit.timestamp_ps.to_le_bytes())?;
    Ok(())
}

/// Serialize hits to tab-separated values
/// (module, channel, charge long, charge short, timestamp).
pub fn tsv(wtr: &mut csv::Writer<impl Write>, hits: &[Hit]) -> Result<()> {
    for hit in hits {
        wtr.write_record(&[
            hit.module.to_string(),
            hit.channel.to_string(),
            hit.charge_long.to_string(),
            hit.charge_short.to_string(),
            hit.timestamp_ps.to_string(),
        ])?;
    }
    Ok(())
}

/// Event shard writer: zstd-compressed stream of variable-length event
/// records. One writer per worker; `finish` must run before drop or the
/// trailing compressed frame is lost.
pub struct ShardWriter<W: Write> {
    enc: stream::write::Encoder<'static, W>,
}

impl<W: Write> ShardWriter<W> {
    pub fn new(wtr: W) -> Result<ShardWriter<W>> {
        Ok(ShardWriter {
            enc: stream::write::Encoder::new(wtr, 0)?,
        })
    }
}

impl ShardWriter<BufWriter<File>> {
    pub fn create(path: &Path) -> Result<ShardWriter<BufWriter<File>>> {
        let file = File::create(path)?;
        ShardWriter::new(BufWriter::new(file))
    }
}

impl<W: Write> EventWriter for ShardWriter<W> {
    fn write(&mut self, event: &Event) -> Result<()> {
        event_record(&mut self.enc, event)
    }

    fn finish(&mut self) -> Result<()> {
        self.enc.do_finish()?;
        Ok(())
    }
}

fn event_record(wtr: &mut impl Write, event: &Event) -> Result<()> {
    wtr.write_all(&event.trigger_time_ns.to_le_bytes())?;
    wtr.write_all(&(event.hits.len() as u32).to_le_bytes())?;
    for hit in &event.hits {
        wtr.write_all(&[hit.is_with_ac as u8, hit.module, hit.channel])?;
        wtr.write_all(&hit.charge_long.to_le_bytes())?;
        wtr.write_all(&hit.charge_short.to_le_bytes())?;
        wtr.write_all(&hit.rel_time_ns.to_le_bytes())?;
    }
    wtr.write_all(&(event.counters.len() as u16).to_le_bytes())?;
    for (name, count) in &event.counters {
        name_field(wtr, name)?;
        wtr.write_all(&count.to_le_bytes())?;
    }
    wtr.write_all(&(event.flags.len() as u16).to_le_bytes())?;
    for (name, value) in &event.flags {
        name_field(wtr, name)?;
        wtr.write_all(&[*value as u8])?;
    }
    Ok(())
}

fn name_field(wtr: &mut impl Write, name: &str) -> Result<()> {
    wtr.write_all(&(name.len() as u16).to_le_bytes())?;
    wtr.write_all(name.as_bytes())?;
    Ok(())
}
