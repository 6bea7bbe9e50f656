//! Configuration formats: channel map, time offsets, condition program,
//! and the top-level run settings. All files are JSON; the field names
//! below match the on-disk keys exactly.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::err::{Error, Result};

/// Detector family attached to a channel, parsed case-insensitively
/// from the free-form `DetectorType` string.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DetectorType {
    Unknown,
    Ac,
    Pmt,
    HpGe,
    Si,
}

impl DetectorType {
    pub fn parse(s: &str) -> DetectorType {
        match s.to_ascii_lowercase().as_str() {
            "ac" => DetectorType::Ac,
            "pmt" => DetectorType::Pmt,
            "hpge" => DetectorType::HpGe,
            "si" => DetectorType::Si,
            _ => DetectorType::Unknown,
        }
    }

    /// Rebin factor applied to a time-difference projection before the
    /// peak position is read off. Slow detectors need wider bins.
    pub fn rebin_factor(self) -> usize {
        match self {
            DetectorType::HpGe => 100,
            DetectorType::Ac => 10,
            _ => 1,
        }
    }
}

/// Immutable per-channel record: identity, trigger capability,
/// threshold, anti-coincidence partner, geometry, calibration
/// polynomial, and the tag set used by the condition stage.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(rename = "IsEventTrigger")]
    pub is_event_trigger: bool,
    /// Dense global ordinal, unique across the detector
    #[serde(rename = "ID")]
    pub id: i32,
    #[serde(rename = "Module")]
    pub module: u32,
    #[serde(rename = "Channel")]
    pub channel: u32,
    #[serde(rename = "HasAC")]
    pub has_ac: bool,
    #[serde(rename = "ACModule")]
    pub ac_module: u32,
    #[serde(rename = "ACChannel")]
    pub ac_channel: u32,
    #[serde(rename = "Phi")]
    pub phi: f64,
    #[serde(rename = "Theta")]
    pub theta: f64,
    #[serde(rename = "Distance")]
    pub distance: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub p0: f64,
    pub p1: f64,
    pub p2: f64,
    pub p3: f64,
    /// Hits with `charge_long <= threshold_adc` are rejected at load
    #[serde(rename = "ThresholdADC")]
    pub threshold_adc: u32,
    #[serde(rename = "DetectorType")]
    pub detector_type: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

/// Dense channel map indexed `[module][channel]`.
pub type ChannelMap = Vec<Vec<ChannelSettings>>;

impl ChannelSettings {
    /// Load a channel map from `channelSettings.json`.
    pub fn load_map(path: &Path) -> Result<ChannelMap> {
        let file = File::open(path)?;
        let map: ChannelMap = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::json(path, e))?;
        Ok(map)
    }

    pub fn save_map(path: &Path, map: &ChannelMap) -> Result<()> {
        let file = File::create(path)?;
        let mut wtr = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut wtr, map).map_err(|e| Error::json(path, e))?;
        wtr.write_all(b"\n")?;
        Ok(())
    }

    /// Dense template map with auto-incremented IDs and placeholder
    /// AC partners. `chs_in_mod[i]` is the channel count of module `i`.
    pub fn template(chs_in_mod: &[u32]) -> ChannelMap {
        let mut id = 0;
        chs_in_mod
            .iter()
            .enumerate()
            .map(|(module, &n_chs)| {
                (0..n_chs)
                    .map(|channel| {
                        let ch = ChannelSettings {
                            is_event_trigger: false,
                            id,
                            module: module as u32,
                            channel,
                            has_ac: false,
                            ac_module: 128,
                            ac_channel: 128,
                            phi: 0.,
                            theta: 0.,
                            distance: 0.,
                            x: 0.,
                            y: 0.,
                            z: 0.,
                            p0: 0.,
                            p1: 1.,
                            p2: 0.,
                            p3: 0.,
                            threshold_adc: 0,
                            detector_type: String::new(),
                            tags: Vec::new(),
                        };
                        id += 1;
                        ch
                    })
                    .collect()
            })
            .collect()
    }
}

/// Look up one channel's settings, or `None` when `(module, channel)`
/// indexes outside the map.
pub fn lookup(map: &ChannelMap, module: u8, channel: u8) -> Option<&ChannelSettings> {
    map.get(module as usize)?.get(channel as usize)
}

/// Largest channel ID in the map, `-1` when the map is empty.
pub fn max_id(map: &ChannelMap) -> i32 {
    map.iter().flatten().map(|c| c.id).max().unwrap_or(-1)
}

#[derive(Serialize, Deserialize)]
struct OffsetEntry {
    #[serde(rename = "TimeOffset")]
    time_offset: f64,
}

/// Per-channel time offsets relative to every possible reference
/// channel: `[ref_module][ref_channel][module][channel]` in
/// nanoseconds. A reference slot that was never a calibration
/// candidate holds an empty array.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct TimeOffsets {
    table: Vec<Vec<Vec<Vec<f64>>>>,
}

impl TimeOffsets {
    /// Wrap a raw table, forcing each reference channel's offset to
    /// itself to zero.
    pub fn new(mut table: Vec<Vec<Vec<Vec<f64>>>>) -> TimeOffsets {
        for ref_mod in 0..table.len() {
            for ref_ch in 0..table[ref_mod].len() {
                let slot = &mut table[ref_mod][ref_ch];
                if let Some(offset) = slot.get_mut(ref_mod).and_then(|m| m.get_mut(ref_ch)) {
                    *offset = 0.;
                }
            }
        }
        TimeOffsets { table }
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// The `[module][channel]` offset table for one reference channel,
    /// or `None` when the slot is out of range or was never populated.
    pub fn reference(&self, ref_mod: usize, ref_ch: usize) -> Option<&Vec<Vec<f64>>> {
        let slot = self.table.get(ref_mod)?.get(ref_ch)?;
        if slot.is_empty() {
            None
        } else {
            Some(slot)
        }
    }

    pub fn offset(&self, ref_mod: usize, ref_ch: usize, module: usize, channel: usize) -> Option<f64> {
        self.reference(ref_mod, ref_ch)?
            .get(module)?
            .get(channel)
            .copied()
    }

    pub fn load(path: &Path) -> Result<TimeOffsets> {
        let file = File::open(path)?;
        let raw: Vec<Vec<Vec<Vec<OffsetEntry>>>> =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| Error::json(path, e))?;
        let table = raw
            .into_iter()
            .map(|ref_mod| {
                ref_mod
                    .into_iter()
                    .map(|ref_ch| {
                        ref_ch
                            .into_iter()
                            .map(|module| module.into_iter().map(|e| e.time_offset).collect())
                            .collect()
                    })
                    .collect()
            })
            .collect();
        Ok(TimeOffsets::new(table))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw: Vec<Vec<Vec<Vec<OffsetEntry>>>> = self
            .table
            .iter()
            .map(|ref_mod| {
                ref_mod
                    .iter()
                    .map(|ref_ch| {
                        ref_ch
                            .iter()
                            .map(|module| {
                                module
                                    .iter()
                                    .map(|&time_offset| OffsetEntry { time_offset })
                                    .collect()
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        let file = File::create(path)?;
        let mut wtr = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut wtr, &raw).map_err(|e| Error::json(path, e))?;
        wtr.write_all(b"\n")?;
        Ok(())
    }
}

/// One declaration of the condition program, tagged by `Type`.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum L2Condition {
    /// Counts event hits on channels whose tag set intersects `Tags`
    Counter {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Tags")]
        tags: Vec<String>,
    },
    /// Compares a named counter against a constant
    Flag {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Monitor")]
        monitor: String,
        #[serde(rename = "Operator")]
        operator: String,
        #[serde(rename = "Value")]
        value: i32,
    },
    /// Combines named flags under AND/OR; any passing clause keeps the event
    Accept {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Monitor")]
        monitors: Vec<String>,
        #[serde(rename = "Operator")]
        operator: String,
    },
}

impl L2Condition {
    pub fn load(path: &Path) -> Result<Vec<L2Condition>> {
        let file = File::open(path)?;
        let conditions = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::json(path, e))?;
        Ok(conditions)
    }

    pub fn save(path: &Path, conditions: &[L2Condition]) -> Result<()> {
        let file = File::create(path)?;
        let mut wtr = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut wtr, conditions).map_err(|e| Error::json(path, e))?;
        wtr.write_all(b"\n")?;
        Ok(())
    }

    /// Example program for the `init` template.
    pub fn template() -> Vec<L2Condition> {
        vec![
            L2Condition::Counter {
                name: "SiCounter".into(),
                tags: vec!["silicon".into()],
            },
            L2Condition::Flag {
                name: "SiFlag".into(),
                monitor: "SiCounter".into(),
                operator: ">=".into(),
                value: 1,
            },
            L2Condition::Accept {
                name: "SiAccept".into(),
                monitors: vec!["SiFlag".into()],
                operator: "AND".into(),
            },
        ]
    }
}

/// Top-level `settings.json`.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "Directory")]
    pub directory: String,
    #[serde(rename = "RunNumber")]
    pub run_number: u32,
    #[serde(rename = "StartVersion")]
    pub start_version: u32,
    #[serde(rename = "EndVersion")]
    pub end_version: u32,
    /// Half-width of the alignment time window, nanoseconds
    #[serde(rename = "TimeWindow")]
    pub time_window: f64,
    /// Half-width of the coincidence window, nanoseconds
    #[serde(rename = "CoincidenceWindow")]
    pub coincidence_window: f64,
    #[serde(rename = "ChannelSettings")]
    pub channel_settings: String,
    #[serde(rename = "L2Settings")]
    pub l2_settings: String,
    /// Zero means one worker per available core
    #[serde(rename = "NumberOfThread")]
    pub number_of_thread: u32,
    #[serde(rename = "TimeReferenceMod")]
    pub time_reference_mod: u32,
    #[serde(rename = "TimeReferenceCh")]
    pub time_reference_ch: u32,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            directory: String::new(),
            run_number: 0,
            start_version: 0,
            end_version: 0,
            time_window: 1000.,
            coincidence_window: 1000.,
            channel_settings: "channelSettings.json".into(),
            l2_settings: "L2Settings.json".into(),
            number_of_thread: 0,
            time_reference_mod: 9,
            time_reference_ch: 0,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let file = File::open(path)?;
        let settings = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::json(path, e))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut wtr = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut wtr, self).map_err(|e| Error::json(path, e))?;
        wtr.write_all(b"\n")?;
        Ok(())
    }
}
