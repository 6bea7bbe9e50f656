#![allow(dead_code)]

use hittools::cfg::{ChannelMap, ChannelSettings};
use hittools::pat::ScanHit;

/// Dense channel map with template defaults; tests mutate what they need.
pub fn basic_map(chs_in_mod: &[u32]) -> ChannelMap {
    ChannelSettings::template(chs_in_mod)
}

pub fn scan_hit(index: u64, module: u8, channel: u8, time_ns: f64) -> ScanHit {
    ScanHit {
        index,
        module,
        channel,
        charge_long: 100,
        charge_short: 50,
        time_ns,
    }
}
