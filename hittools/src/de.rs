//! Deserialization of hit and event streams, supporting `.hits`,
//! `.evts.zst`, and `.tsv`

use crate::err::{Error, Result};
use crate::ser::HIT_RECORD_LEN;
use crate::{Event, Hit, HitReader, RelHit};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use zstd::stream;

/// Longest accepted counter/flag name in an event record.
const MAX_NAME_LEN: u16 = 4096;

/// Read every hit record until the stream ends.
pub fn hits(mut rdr: impl Read) -> Result<Vec<Hit>> {
    let mut out = Vec::new();
    while let Some(hit) = hit_record(&mut rdr)? {
        out.push(hit);
    }
    Ok(out)
}

/// Deserialize hits from tab-separated values
/// (module, channel, charge long, charge short, timestamp).
pub fn tsv(rdr: &mut csv::Reader<impl Read>) -> Result<Vec<Hit>> {
    let mut out = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let field = |i: usize| {
            record
                .get(i)
                .ok_or_else(|| Error::Corrupt(format!("tsv record has {} fields", record.len())))
        };
        out.push(Hit {
            module: parse(field(0)?)?,
            channel: parse(field(1)?)?,
            charge_long: parse(field(2)?)?,
            charge_short: parse(field(3)?)?,
            timestamp_ps: parse(field(4)?)?,
        });
    }
    Ok(out)
}

fn parse<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse()
        .map_err(|_| Error::Corrupt(format!("unparsable tsv field {s:?}")))
}

/// Index-addressed reader over an uncompressed `.hits` file.
pub struct HitFile {
    file: File,
    len: u64,
}

impl HitFile {
    pub fn open(path: &Path) -> Result<HitFile> {
        let file = File::open(path)?;
        let bytes = file.metadata()?.len();
        if bytes % HIT_RECORD_LEN != 0 {
            return Err(Error::Corrupt(format!(
                "{}: {} bytes is not a whole number of hit records",
                path.display(),
                bytes
            )));
        }
        Ok(HitFile {
            file,
            len: bytes / HIT_RECORD_LEN,
        })
    }
}

impl HitReader for HitFile {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&mut self, start: u64, end: u64) -> Result<Vec<Hit>> {
        let end = end.min(self.len);
        if start >= end {
            return Ok(Vec::new());
        }
        self.file.seek(SeekFrom::Start(start * HIT_RECORD_LEN))?;
        let mut rdr = BufReader::new(&mut self.file);
        let mut out = Vec::with_capacity((end - start) as usize);
        for _ in start..end {
            match hit_record(&mut rdr)? {
                Some(hit) => out.push(hit),
                None => return Err(Error::Corrupt("hit file shrank while reading".into())),
            }
        }
        Ok(out)
    }
}

fn hit_record(rdr: &mut impl Read) -> Result<Option<Hit>> {
    let mut buf = [0u8; HIT_RECORD_LEN as usize];
    if !fill_or_eof(rdr, &mut buf)? {
        return Ok(None);
    }
    Ok(Some(Hit {
        module: buf[0],
        channel: buf[1],
        charge_long: u16::from_le_bytes([buf[2], buf[3]]),
        charge_short: u16::from_le_bytes([buf[4], buf[5]]),
        timestamp_ps: f64::from_le_bytes([
            buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13],
        ]),
    }))
}

/// Fill `buf` completely, or report a clean end of stream when no bytes
/// remain at all. A partial record is corruption.
fn fill_or_eof(rdr: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = rdr.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::Corrupt("truncated record at end of stream".into()));
        }
        filled += n;
    }
    Ok(true)
}

/// Streaming iterator over an event shard.
pub struct EventIter<R> {
    rdr: R,
}

impl<R: Read> Iterator for EventIter<R> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Result<Event>> {
        event_record(&mut self.rdr).transpose()
    }
}

/// Iterate events from a zstd-compressed shard stream.
pub fn events<R: Read>(rdr: R) -> Result<EventIter<stream::read::Decoder<'static, BufReader<R>>>> {
    Ok(EventIter {
        rdr: stream::read::Decoder::new(rdr)?,
    })
}

/// Open an `.evts.zst` shard on disk.
pub fn open_shard(path: &Path) -> Result<EventIter<stream::read::Decoder<'static, BufReader<File>>>> {
    events(File::open(path)?)
}

fn event_record(rdr: &mut impl Read) -> Result<Option<Event>> {
    let mut head = [0u8; 8];
    if !fill_or_eof(rdr, &mut head)? {
        return Ok(None);
    }
    let trigger_time_ns = f64::from_le_bytes(head);

    let n_hits = read_u32(rdr)?;
    let mut hits = Vec::with_capacity(n_hits as usize);
    for _ in 0..n_hits {
        let mut buf = [0u8; 15];
        if !fill_or_eof(rdr, &mut buf)? {
            return Err(Error::Corrupt("truncated event hit list".into()));
        }
        hits.push(RelHit {
            is_with_ac: buf[0] != 0,
            module: buf[1],
            channel: buf[2],
            charge_long: u16::from_le_bytes([buf[3], buf[4]]),
            charge_short: u16::from_le_bytes([buf[5], buf[6]]),
            rel_time_ns: f64::from_le_bytes([
                buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14],
            ]),
        });
    }

    let n_counters = read_u16(rdr)?;
    let mut counters = Vec::with_capacity(n_counters as usize);
    for _ in 0..n_counters {
        let name = name_field(rdr)?;
        counters.push((name, read_u64(rdr)?));
    }

    let n_flags = read_u16(rdr)?;
    let mut flags = Vec::with_capacity(n_flags as usize);
    for _ in 0..n_flags {
        let name = name_field(rdr)?;
        flags.push((name, read_u8(rdr)? != 0));
    }

    Ok(Some(Event {
        trigger_time_ns,
        hits,
        counters,
        flags,
    }))
}

fn name_field(rdr: &mut impl Read) -> Result<String> {
    let len = read_u16(rdr)?;
    if len > MAX_NAME_LEN {
        return Err(Error::Corrupt(format!("implausible name length {len}")));
    }
    let mut buf = vec![0u8; len as usize];
    if !fill_or_eof(rdr, &mut buf)? {
        return Err(Error::Corrupt("truncated name field".into()));
    }
    String::from_utf8(buf).map_err(|_| Error::Corrupt("name field is not UTF-8".into()))
}

fn read_u8(rdr: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    must_fill(rdr, &mut buf)?;
    Ok(buf[0])
}

fn read_u16(rdr: &mut impl Read) -> Result<u16> {
    let mut buf = [0u8; 2];
    must_fill(rdr, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(rdr: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    must_fill(rdr, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(rdr: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    must_fill(rdr, &mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn must_fill(rdr: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    if !fill_or_eof(rdr, buf)? {
        return Err(Error::Corrupt("truncated event record".into()));
    }
    Ok(())
}
