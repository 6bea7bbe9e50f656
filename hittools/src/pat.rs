//! Coincidence scans over time-sorted hit slices: event building with
//! trigger priority and anti-coincidence tagging, and the
//! time-difference pair walk used for channel alignment.

use crate::cfg::{lookup, ChannelMap};
use crate::err::Result;
use crate::{Event, RelHit};
use std::ops::Range;

/// A hit prepared for scanning: time mapped to nanoseconds (offsets
/// already subtracted where applicable) and tagged with its global
/// record index in the source file.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ScanHit {
    pub index: u64,
    pub module: u8,
    pub channel: u8,
    pub charge_long: u16,
    pub charge_short: u16,
    pub time_ns: f64,
}

impl ScanHit {
    fn rel(&self, rel_time_ns: f64) -> RelHit {
        RelHit {
            is_with_ac: false,
            module: self.module,
            channel: self.channel,
            charge_long: self.charge_long,
            charge_short: self.charge_short,
            rel_time_ns,
        }
    }
}

/// Build coincidence events around every trigger-capable hit in
/// `hits`, which must be sorted ascending by `time_ns`.
///
/// Only triggers whose global index falls in `interior` seed events, so
/// a trigger sitting in the overlap region of two adjacent chunks is
/// emitted exactly once. All hits, interior or not, still count as
/// coincidence partners and as suppressing triggers.
///
/// Trigger priority: if another trigger-capable hit with `id >=` the
/// seed's id lies strictly inside the window, the candidate event is
/// discarded without being emitted.
///
/// Returns the number of events passed to `emit`.
pub fn build_events<F>(
    hits: &[ScanHit],
    map: &ChannelMap,
    window_ns: f64,
    interior: &Range<u64>,
    mut emit: F,
) -> Result<u64>
where
    F: FnMut(Event) -> Result<()>,
{
    let mut n_emitted = 0;
    for (i, trig) in hits.iter().enumerate() {
        if !interior.contains(&trig.index) {
            continue;
        }
        let trig_cfg = match lookup(map, trig.module, trig.channel) {
            Some(c) if c.is_event_trigger => c,
            _ => continue,
        };
        let trigger_id = trig_cfg.id;
        let t0 = trig.time_ns;

        let mut event = Event {
            trigger_time_ns: t0,
            hits: vec![trig.rel(0.)],
            ..Event::default()
        };
        let mut fill = true;

        for other in &hits[i + 1..] {
            let ts = other.time_ns - t0;
            if ts > window_ns {
                break;
            }
            let Some(c) = lookup(map, other.module, other.channel) else {
                continue;
            };
            if c.is_event_trigger && c.id >= trigger_id && ts < window_ns {
                fill = false;
                break;
            }
            event.hits.push(other.rel(ts));
        }
        if fill {
            for other in hits[..i].iter().rev() {
                let ts = other.time_ns - t0;
                if ts < -window_ns {
                    break;
                }
                let Some(c) = lookup(map, other.module, other.channel) else {
                    continue;
                };
                if c.is_event_trigger && c.id >= trigger_id && ts > -window_ns {
                    fill = false;
                    break;
                }
                event.hits.push(other.rel(ts));
            }
        }
        if !fill {
            continue;
        }

        event.hits[1..].sort_by(|a, b| a.rel_time_ns.total_cmp(&b.rel_time_ns));
        annotate_ac(&mut event, map, window_ns);
        emit(event)?;
        n_emitted += 1;
    }
    Ok(n_emitted)
}

/// Set `is_with_ac` on every hit whose anti-coincidence partner channel
/// also fired strictly inside the window. Idempotent.
pub fn annotate_ac(event: &mut Event, map: &ChannelMap, window_ns: f64) {
    for i in 0..event.hits.len() {
        let hit = event.hits[i];
        let Some(c) = lookup(map, hit.module, hit.channel) else {
            continue;
        };
        if !c.has_ac {
            continue;
        }
        let vetoed = event.hits.iter().enumerate().any(|(j, a)| {
            j != i
                && a.module as u32 == c.ac_module
                && a.channel as u32 == c.ac_channel
                && a.rel_time_ns.abs() < window_ns
        });
        if vetoed {
            event.hits[i].is_with_ac = true;
        }
    }
}

/// Walk the symmetric window around every trigger-capable hit and
/// report each (trigger, Δt, partner id) pair through `fill`.
///
/// The walk stops in each direction at the first hit outside the
/// window; pairs at exactly `|Δt| == window_ns` are still reported.
/// Only triggers inside `interior` are walked, so overlapping chunks
/// count every pair once.
pub fn time_pairs<F>(
    hits: &[ScanHit],
    map: &ChannelMap,
    window_ns: f64,
    interior: &Range<u64>,
    mut fill: F,
) where
    F: FnMut(&ScanHit, f64, i32),
{
    for (i, trig) in hits.iter().enumerate() {
        if !interior.contains(&trig.index) {
            continue;
        }
        match lookup(map, trig.module, trig.channel) {
            Some(c) if c.is_event_trigger => {}
            _ => continue,
        }
        let t0 = trig.time_ns;

        for other in &hits[i + 1..] {
            let dt = other.time_ns - t0;
            if dt > window_ns {
                break;
            }
            if let Some(c) = lookup(map, other.module, other.channel) {
                fill(trig, dt, c.id);
            }
        }
        for other in hits[..i].iter().rev() {
            let dt = other.time_ns - t0;
            if dt < -window_ns {
                break;
            }
            if let Some(c) = lookup(map, other.module, other.channel) {
                fill(trig, dt, c.id);
            }
        }
    }
}
