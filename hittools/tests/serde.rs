use hittools::de::{self, HitFile};
use hittools::ser::{self, ShardWriter};
use hittools::{Error, Event, EventWriter, Hit, HitReader, RelHit};

fn sample_hits() -> Vec<Hit> {
    (0..100)
        .map(|i| Hit {
            module: (i % 3) as u8,
            channel: (i % 16) as u8,
            charge_long: 1000 + i as u16,
            charge_short: 400 + i as u16,
            timestamp_ps: i as f64 * 12_500.,
        })
        .collect()
}

#[test]
fn hits_roundtrip_through_a_buffer() {
    let hits = sample_hits();
    let mut buf = Vec::new();
    ser::hits(&mut buf, &hits).unwrap();
    assert_eq!(buf.len() as u64, 100 * ser::HIT_RECORD_LEN);
    assert_eq!(de::hits(buf.as_slice()).unwrap(), hits);
}

#[test]
fn hit_file_reads_ranges_with_clamping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run0001_0000_a.hits");
    let hits = sample_hits();
    let mut buf = Vec::new();
    ser::hits(&mut buf, &hits).unwrap();
    std::fs::write(&path, &buf).unwrap();

    let mut file = HitFile::open(&path).unwrap();
    assert_eq!(file.len(), 100);

    assert_eq!(file.read_range(0, 10).unwrap(), hits[..10]);
    assert_eq!(file.read_range(95, 200).unwrap(), hits[95..]);
    assert_eq!(file.read_range(42, 43).unwrap(), hits[42..43]);
    assert!(file.read_range(100, 110).unwrap().is_empty());
    assert!(file.read_range(60, 60).unwrap().is_empty());
}

#[test]
fn partial_record_is_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.hits");
    let mut buf = Vec::new();
    ser::hits(&mut buf, &sample_hits()).unwrap();
    buf.truncate(buf.len() - 3);
    std::fs::write(&path, &buf).unwrap();

    assert!(matches!(HitFile::open(&path), Err(Error::Corrupt(_))));
    assert!(matches!(de::hits(buf.as_slice()), Err(Error::Corrupt(_))));
}

#[test]
fn hits_roundtrip_through_tsv() {
    let hits = sample_hits();
    let mut buf = Vec::new();
    {
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .delimiter(b'\t')
            .from_writer(&mut buf);
        ser::tsv(&mut wtr, &hits).unwrap();
        wtr.flush().unwrap();
    }
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .from_reader(buf.as_slice());
    assert_eq!(de::tsv(&mut rdr).unwrap(), hits);
}

#[test]
fn event_shard_roundtrip() {
    let events = vec![
        Event {
            trigger_time_ns: 1234.5,
            hits: vec![
                RelHit {
                    is_with_ac: false,
                    module: 0,
                    channel: 0,
                    charge_long: 900,
                    charge_short: 300,
                    rel_time_ns: 0.,
                },
                RelHit {
                    is_with_ac: true,
                    module: 1,
                    channel: 4,
                    charge_long: 70,
                    charge_short: 20,
                    rel_time_ns: -12.5,
                },
            ],
            counters: vec![("M".into(), 3)],
            flags: vec![("F".into(), true), ("V".into(), false)],
        },
        Event {
            trigger_time_ns: 99999.,
            hits: vec![RelHit {
                is_with_ac: false,
                module: 2,
                channel: 31,
                charge_long: 1,
                charge_short: 0,
                rel_time_ns: 0.,
            }],
            counters: Vec::new(),
            flags: Vec::new(),
        },
    ];

    let mut buf = Vec::new();
    {
        let mut writer = ShardWriter::new(&mut buf).unwrap();
        for e in &events {
            writer.write(e).unwrap();
        }
        writer.finish().unwrap();
    }

    let read: Vec<Event> = de::events(buf.as_slice())
        .unwrap()
        .collect::<hittools::Result<_>>()
        .unwrap();
    assert_eq!(read, events);
}

#[test]
fn empty_shard_yields_no_events() {
    let mut buf = Vec::new();
    {
        let mut writer = ShardWriter::new(&mut buf).unwrap();
        writer.finish().unwrap();
    }
    let mut iter = de::events(buf.as_slice()).unwrap();
    assert!(iter.next().is_none());
}

#[test]
fn in_memory_reader_matches_file_reader() {
    let mut hits = sample_hits();
    let from_mem = hits.read_range(10, 20).unwrap();
    assert_eq!(from_mem, sample_hits()[10..20]);
    assert_eq!(HitReader::len(&hits), 100);
}
