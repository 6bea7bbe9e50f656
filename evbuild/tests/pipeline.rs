use evbuild::align::TimeAlignment;
use evbuild::files;
use evbuild::l1::L1Builder;
use evbuild::l2::L2Engine;
use hittools::cfg::{ChannelMap, ChannelSettings, L2Condition, TimeOffsets};
use hittools::ser::{self, ShardWriter};
use hittools::{de, Error, Event, EventWriter, Hit, RelHit, TS_PERIOD_PS};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

fn hit(module: u8, channel: u8, t_ns: f64) -> Hit {
    Hit {
        module,
        channel,
        charge_long: 1000,
        charge_short: 400,
        timestamp_ps: t_ns * 1000.,
    }
}

fn write_hits(path: &Path, hits: &[Hit]) {
    let mut wtr = BufWriter::new(File::create(path).unwrap());
    ser::hits(&mut wtr, hits).unwrap();
}

fn save_map(dir: &Path, map: &ChannelMap) -> PathBuf {
    let path = dir.join("channelSettings.json");
    ChannelSettings::save_map(&path, map).unwrap();
    path
}

/// Offset table with a single populated reference slot.
fn offsets_for(map: &ChannelMap, ref_mod: usize, ref_ch: usize, value: impl Fn(usize, usize) -> f64) -> TimeOffsets {
    let mut table: Vec<Vec<Vec<Vec<f64>>>> = map
        .iter()
        .map(|chs| vec![Vec::new(); chs.len()])
        .collect();
    table[ref_mod][ref_ch] = map
        .iter()
        .enumerate()
        .map(|(m, chs)| (0..chs.len()).map(|c| value(m, c)).collect())
        .collect();
    TimeOffsets::new(table)
}

fn save_offsets(dir: &Path, offsets: &TimeOffsets) -> PathBuf {
    let path = dir.join("timeSettings.json");
    offsets.save(&path).unwrap();
    path
}

fn l1_builder(dir: &Path, map: &ChannelMap, window_ns: f64, files: Vec<PathBuf>) -> L1Builder {
    let offsets = offsets_for(map, 0, 0, |_, _| 0.);
    let mut builder = L1Builder::new(dir);
    builder.load_channel_settings(&save_map(dir, map)).unwrap();
    builder.load_time_offsets(&save_offsets(dir, &offsets)).unwrap();
    builder.load_file_list(files).unwrap();
    builder.set_coincidence_window(window_ns);
    builder.set_reference(0, 0);
    builder
}

fn read_shards(dir: &Path, prefix: &str) -> Vec<Event> {
    let mut events = Vec::new();
    for shard in files::find_shards(dir, prefix) {
        for event in de::open_shard(&shard).unwrap() {
            events.push(event.unwrap());
        }
    }
    events
}

#[test]
fn l1_builds_a_minimal_coincidence() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[2]);
    map[0][0].is_event_trigger = true;

    let input = dir.path().join("run0001_0000_a.hits");
    write_hits(&input, &[hit(0, 0, 100.), hit(0, 1, 130.)]);

    let builder = l1_builder(dir.path(), &map, 50., vec![input]);
    builder.build(1).unwrap();

    let events = read_shards(dir.path(), "L1");
    assert_eq!(events.len(), 1);
    let e = &events[0];
    assert_eq!(e.trigger_time_ns, 100.);
    assert_eq!(e.hits.len(), 2);
    assert_eq!(e.hits[0].rel_time_ns, 0.);
    assert_eq!((e.hits[1].module, e.hits[1].channel), (0, 1));
    assert_eq!(e.hits[1].rel_time_ns, 30.);
    assert!(e.counters.is_empty() && e.flags.is_empty());
}

#[test]
fn l1_applies_thresholds_and_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[3]);
    map[0][0].is_event_trigger = true;
    map[0][2].threshold_adc = 2000;

    let input = dir.path().join("run0001_0000_a.hits");
    // The channel-2 hit sits below threshold and must vanish.
    write_hits(&input, &[hit(0, 0, 100.), hit(0, 1, 130.), hit(0, 2, 110.)]);

    let offsets = offsets_for(&map, 0, 0, |m, c| if (m, c) == (0, 1) { 5. } else { 0. });
    let mut builder = L1Builder::new(dir.path());
    builder.load_channel_settings(&save_map(dir.path(), &map)).unwrap();
    builder.load_time_offsets(&save_offsets(dir.path(), &offsets)).unwrap();
    builder.load_file_list(vec![input]).unwrap();
    builder.set_coincidence_window(50.);
    builder.set_reference(0, 0);
    builder.build(1).unwrap();

    let events = read_shards(dir.path(), "L1");
    assert_eq!(events.len(), 1);
    let e = &events[0];
    assert_eq!(e.hits.len(), 2);
    // 130 ns shifted by the 5 ns channel offset.
    assert_eq!(e.hits[1].rel_time_ns, 25.);
}

#[test]
fn l1_trigger_priority_keeps_only_the_highest_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[3]);
    for (ch, id) in [(0, 5), (1, 3), (2, 7)] {
        map[0][ch].is_event_trigger = true;
        map[0][ch].id = id;
    }

    let input = dir.path().join("run0001_0000_a.hits");
    write_hits(&input, &[hit(0, 0, 100.), hit(0, 1, 110.), hit(0, 2, 120.)]);

    let builder = l1_builder(dir.path(), &map, 50., vec![input]);
    builder.build(1).unwrap();

    let events = read_shards(dir.path(), "L1");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].trigger_time_ns, 120.);
    assert_eq!(events[0].hits.len(), 3);
}

#[test]
fn l1_tags_anti_coincidence_partners() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[1, 1]);
    map[0][0].is_event_trigger = true;
    map[0][0].has_ac = true;
    map[0][0].ac_module = 1;
    map[0][0].ac_channel = 0;

    let input = dir.path().join("run0001_0000_a.hits");
    write_hits(&input, &[hit(0, 0, 100.), hit(1, 0, 110.)]);

    let builder = l1_builder(dir.path(), &map, 50., vec![input]);
    builder.build(1).unwrap();

    let events = read_shards(dir.path(), "L1");
    assert_eq!(events.len(), 1);
    assert!(events[0].hits[0].is_with_ac);
    assert!(!events[0].hits[1].is_with_ac);
}

#[test]
fn l1_rejects_an_unpopulated_reference() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[2]);
    map[0][0].is_event_trigger = true;

    let input = dir.path().join("run0001_0000_a.hits");
    write_hits(&input, &[hit(0, 0, 100.)]);

    let mut builder = l1_builder(dir.path(), &map, 50., vec![input]);
    builder.set_reference(0, 1); // slot exists but is empty
    let err = builder.build(1).unwrap_err();
    assert!(matches!(err, Error::Range(_)));
    // Failed before any worker started: no shard on disk.
    assert!(files::find_shards(dir.path(), "L1").is_empty());
}

#[test]
fn l1_repairs_wrapped_timestamp_counters() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[1, 1, 2]);
    map[2][0].is_event_trigger = true;

    // The first two records still carry un-unwrapped timestamps; the
    // rest already sit two counter periods later.
    let wrapped_ps = 2. * TS_PERIOD_PS;
    let ps = |module: u8, channel: u8, timestamp_ps: f64| Hit {
        module,
        channel,
        charge_long: 1000,
        charge_short: 400,
        timestamp_ps,
    };
    let input = dir.path().join("run0001_0000_a.hits");
    write_hits(
        &input,
        &[
            ps(2, 0, 1_000.),
            ps(2, 1, 2_000.),
            ps(2, 1, wrapped_ps + 3_000.),
            ps(2, 1, wrapped_ps + 4_000.),
        ],
    );

    let builder = l1_builder(dir.path(), &map, 50., vec![input]);
    builder.build(1).unwrap();

    let events = read_shards(dir.path(), "L1");
    assert_eq!(events.len(), 1);
    let e = &events[0];
    assert_eq!(e.hits.len(), 4);
    // Picosecond-to-nanosecond conversion near 2^48 rounds in the last
    // few ulps, so compare with a loose tolerance.
    for (rel_hit, expected) in e.hits.iter().zip([0., 1., 2., 3.]) {
        assert!((rel_hit.rel_time_ns - expected).abs() < 1e-3);
    }
}

#[test]
fn l1_event_multiset_is_independent_of_worker_count() {
    let mut map = ChannelSettings::template(&[2]);
    map[0][0].is_event_trigger = true;

    let mut shard_sets = Vec::new();
    for n_workers in [1u32, 2] {
        let dir = tempfile::tempdir().unwrap();
        let file_a = dir.path().join("run0001_0000_a.hits");
        let file_b = dir.path().join("run0001_0001_b.hits");
        write_hits(&file_a, &[hit(0, 0, 100.), hit(0, 1, 120.), hit(0, 0, 900.)]);
        write_hits(&file_b, &[hit(0, 0, 5000.), hit(0, 1, 5010.)]);

        let builder = l1_builder(dir.path(), &map, 50., vec![file_a, file_b]);
        builder.build(n_workers).unwrap();

        let mut events = read_shards(dir.path(), "L1");
        events.sort_by(|a, b| a.trigger_time_ns.total_cmp(&b.trigger_time_ns));
        shard_sets.push(events);
    }
    assert_eq!(shard_sets[0], shard_sets[1]);
    assert_eq!(shard_sets[0].len(), 3);
}

#[test]
fn l1_flushes_valid_shards_when_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[2]);
    map[0][0].is_event_trigger = true;

    let input = dir.path().join("run0001_0000_a.hits");
    write_hits(&input, &[hit(0, 0, 100.), hit(0, 1, 130.)]);

    let builder = l1_builder(dir.path(), &map, 50., vec![input]);
    builder.cancel_token().cancel();
    let err = builder.build(1).unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // The shard was still flushed: it exists and decodes cleanly,
    // with nothing in it.
    let shards = files::find_shards(dir.path(), "L1");
    assert_eq!(shards.len(), 1);
    assert!(read_shards(dir.path(), "L1").is_empty());
}

#[test]
fn alignment_finds_a_gaussian_peak() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[2]);
    map[0][0].is_event_trigger = true;

    let normal = Normal::new(42., 0.5).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut data = Vec::new();
    for i in 0..10_000u64 {
        let t0 = i as f64 * 10_000.; // 10 us apart, far beyond the window
        data.push(hit(0, 0, t0));
        data.push(hit(0, 1, t0 + normal.sample(&mut rng)));
    }
    let input = dir.path().join("run0001_0000_a.hits");
    write_hits(&input, &data);

    let mut align = TimeAlignment::new(dir.path());
    align
        .load_channel_settings(&save_map(dir.path(), &map))
        .unwrap();
    align.load_file_list(vec![input]).unwrap();
    align.set_time_window(1000.);
    align.fill(4).unwrap();

    let offsets = align.compute_offsets().unwrap();
    let peak = offsets.offset(0, 0, 0, 1).unwrap();
    assert!((peak - 42.).abs() <= 1., "peak at {peak}");
    assert_eq!(offsets.offset(0, 0, 0, 0), Some(0.));
    // The non-trigger channel never became a reference candidate.
    assert!(offsets.reference(0, 1).is_none());
}

#[test]
fn alignment_merge_is_deterministic_across_worker_counts() {
    let mut map = ChannelSettings::template(&[2]);
    map[0][0].is_event_trigger = true;

    let make_file = |path: &Path, base: f64, dt: f64| {
        let mut data = Vec::new();
        for i in 0..300u64 {
            let t0 = base + i as f64 * 10_000.;
            data.push(hit(0, 0, t0));
            data.push(hit(0, 1, t0 + dt));
        }
        write_hits(path, &data);
    };

    let mut results = Vec::new();
    for n_workers in [1u32, 2] {
        let dir = tempfile::tempdir().unwrap();
        let file_a = dir.path().join("run0001_0000_a.hits");
        let file_b = dir.path().join("run0001_0001_b.hits");
        make_file(&file_a, 0., 15.);
        make_file(&file_b, 5_000., 15.);

        let mut align = TimeAlignment::new(dir.path());
        align
            .load_channel_settings(&save_map(dir.path(), &map))
            .unwrap();
        align.load_file_list(vec![file_a, file_b]).unwrap();
        align.set_time_window(1000.);
        align.fill(n_workers).unwrap();
        results.push(align.compute_offsets().unwrap());
    }
    assert_eq!(results[0], results[1]);
    let peak = results[0].offset(0, 0, 0, 1).unwrap();
    assert!((peak - 15.).abs() <= 1., "peak at {peak}");
}

#[test]
fn l2_filters_events_and_exports_side_channels() {
    let dir = tempfile::tempdir().unwrap();
    let mut map = ChannelSettings::template(&[3]);
    map[0][0].tags = vec!["silicon".into()];
    map[0][1].tags = vec!["silicon".into()];
    map[0][2].tags = vec!["veto".into()];
    save_map(dir.path(), &map);

    let conditions = vec![
        L2Condition::Counter {
            name: "M".into(),
            tags: vec!["silicon".into()],
        },
        L2Condition::Counter {
            name: "VetoCounter".into(),
            tags: vec!["veto".into()],
        },
        L2Condition::Flag {
            name: "F".into(),
            monitor: "M".into(),
            operator: ">=".into(),
            value: 2,
        },
        L2Condition::Flag {
            name: "V".into(),
            monitor: "VetoCounter".into(),
            operator: "==".into(),
            value: 0,
        },
        L2Condition::Accept {
            name: "Main".into(),
            monitors: vec!["F".into(), "V".into()],
            operator: "AND".into(),
        },
    ];
    L2Condition::save(&dir.path().join("L2Settings.json"), &conditions).unwrap();

    let rel = |module: u8, channel: u8, rel_time_ns: f64| RelHit {
        is_with_ac: false,
        module,
        channel,
        charge_long: 800,
        charge_short: 300,
        rel_time_ns,
    };
    let accepted = Event {
        trigger_time_ns: 100.,
        hits: vec![rel(0, 0, 0.), rel(0, 1, 4.), rel(0, 0, 9.)],
        ..Event::default()
    };
    let vetoed = Event {
        trigger_time_ns: 200.,
        hits: vec![rel(0, 0, 0.), rel(0, 1, 4.), rel(0, 2, 1.)],
        ..Event::default()
    };
    let too_few = Event {
        trigger_time_ns: 300.,
        hits: vec![rel(0, 0, 0.)],
        ..Event::default()
    };
    let mut writer = ShardWriter::create(&dir.path().join("L1_0.evts.zst")).unwrap();
    for e in [&accepted, &vetoed, &too_few] {
        writer.write(e).unwrap();
    }
    writer.finish().unwrap();

    let mut engine = L2Engine::new(dir.path());
    engine
        .load_channel_settings(&dir.path().join("channelSettings.json"))
        .unwrap();
    engine
        .load_conditions(&dir.path().join("L2Settings.json"))
        .unwrap();
    engine.build(1).unwrap();

    let events = read_shards(dir.path(), "L2");
    assert_eq!(events.len(), 1);
    let e = &events[0];
    assert_eq!(e.trigger_time_ns, 100.);
    assert_eq!(
        e.counters,
        vec![("M".to_string(), 3), ("VetoCounter".to_string(), 0)]
    );
    assert_eq!(
        e.flags,
        vec![("F".to_string(), true), ("V".to_string(), true)]
    );
}

#[test]
fn l2_without_shards_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let map = ChannelSettings::template(&[1]);
    save_map(dir.path(), &map);
    L2Condition::save(&dir.path().join("L2Settings.json"), &L2Condition::template()).unwrap();

    let mut engine = L2Engine::new(dir.path());
    engine
        .load_channel_settings(&dir.path().join("channelSettings.json"))
        .unwrap();
    engine
        .load_conditions(&dir.path().join("L2Settings.json"))
        .unwrap();
    assert!(matches!(engine.build(1), Err(Error::Validation(_))));
}
