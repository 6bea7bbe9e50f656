//! Condition program: tag-based counters, comparison flags, and
//! acceptance clauses evaluated once per event.

use crate::cfg::{ChannelMap, L2Condition};
use crate::err::{Error, Result};
use crate::Event;
use tracing::warn;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CmpOp {
    fn parse(s: &str) -> Option<CmpOp> {
        match s {
            "==" => Some(CmpOp::Eq),
            "!=" => Some(CmpOp::Ne),
            "<" => Some(CmpOp::Lt),
            ">" => Some(CmpOp::Gt),
            "<=" => Some(CmpOp::Le),
            ">=" => Some(CmpOp::Ge),
            _ => None,
        }
    }

    fn eval(self, lhs: i128, rhs: i128) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Ge => lhs >= rhs,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AcceptLogic {
    And,
    Or,
}

/// Counts event hits on channels whose tag set intersects the
/// counter's tags. The enable table is resolved once at compile time.
#[derive(Clone, Debug)]
pub struct Counter {
    pub name: String,
    pub count: u64,
    enabled: Vec<Vec<bool>>,
}

impl Counter {
    fn compile(name: &str, tags: &[String], map: &ChannelMap) -> Counter {
        let enabled = map
            .iter()
            .map(|module| {
                module
                    .iter()
                    .map(|ch| tags.iter().any(|t| ch.tags.contains(t)))
                    .collect()
            })
            .collect();
        Counter {
            name: name.to_string(),
            count: 0,
            enabled,
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Count one hit. Indices are validated against both bounds before
    /// the table lookup; anything outside simply does not count.
    pub fn check(&mut self, module: i32, channel: i32) {
        if module < 0 || channel < 0 {
            return;
        }
        let (module, channel) = (module as usize, channel as usize);
        if let Some(row) = self.enabled.get(module) {
            if row.get(channel).copied().unwrap_or(false) {
                self.count += 1;
            }
        }
    }
}

/// Compares one named counter against a constant after every event.
#[derive(Clone, Debug)]
pub struct Flag {
    pub name: String,
    pub value: bool,
    monitor: String,
    op: Option<CmpOp>,
    threshold: i32,
}

impl Flag {
    fn compile(name: &str, monitor: &str, operator: &str, value: i32) -> Flag {
        let op = CmpOp::parse(operator);
        if op.is_none() {
            warn!(flag = name, operator, "unknown comparison operator, flag will never be set");
        }
        Flag {
            name: name.to_string(),
            value: false,
            monitor: monitor.to_string(),
            op,
            threshold: value,
        }
    }

    fn check(&mut self, counters: &[Counter]) {
        self.value = false;
        let Some(counter) = counters.iter().find(|c| c.name == self.monitor) else {
            return;
        };
        if let Some(op) = self.op {
            // Promote both sides so negative thresholds compare
            // mathematically instead of wrapping.
            self.value = op.eval(counter.count as i128, self.threshold as i128);
        }
    }
}

/// Combines named flags under AND/OR. A clause with no resolvable
/// monitors never accepts.
#[derive(Clone, Debug)]
pub struct Accept {
    pub name: String,
    monitors: Vec<String>,
    logic: Option<AcceptLogic>,
}

impl Accept {
    fn compile(name: &str, monitors: &[String], operator: &str) -> Accept {
        let logic = match operator {
            "AND" => Some(AcceptLogic::And),
            "OR" => Some(AcceptLogic::Or),
            _ => {
                warn!(accept = name, operator, "unknown logic operator, clause will never accept");
                None
            }
        };
        Accept {
            name: name.to_string(),
            monitors: monitors.to_vec(),
            logic,
        }
    }

    fn check(&self, flags: &[Flag]) -> bool {
        let resolve = |m: &String| flags.iter().find(|f| &f.name == m);
        match self.logic {
            Some(AcceptLogic::And) => {
                let mut resolved = 0;
                for flag in self.monitors.iter().filter_map(resolve) {
                    if !flag.value {
                        return false;
                    }
                    resolved += 1;
                }
                resolved > 0
            }
            Some(AcceptLogic::Or) => self
                .monitors
                .iter()
                .filter_map(resolve)
                .any(|flag| flag.value),
            None => false,
        }
    }
}

/// A compiled condition program. Each worker owns its own copy; state
/// is reset at the start of every event.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub counters: Vec<Counter>,
    pub flags: Vec<Flag>,
    pub accepts: Vec<Accept>,
}

impl Program {
    /// Resolve declarations against the channel map. Counter names must
    /// be unique so flag monitors are unambiguous.
    pub fn compile(conditions: &[L2Condition], map: &ChannelMap) -> Result<Program> {
        let mut program = Program::default();
        for condition in conditions {
            match condition {
                L2Condition::Counter { name, tags } => {
                    if program.counters.iter().any(|c| &c.name == name) {
                        return Err(Error::Validation(format!(
                            "duplicate counter name {name:?} in condition program"
                        )));
                    }
                    program.counters.push(Counter::compile(name, tags, map));
                }
                L2Condition::Flag {
                    name,
                    monitor,
                    operator,
                    value,
                } => program
                    .flags
                    .push(Flag::compile(name, monitor, operator, *value)),
                L2Condition::Accept {
                    name,
                    monitors,
                    operator,
                } => program
                    .accepts
                    .push(Accept::compile(name, monitors, operator)),
            }
        }
        Ok(program)
    }

    /// Evaluate one event. Returns true when any acceptance clause
    /// passes; counter and flag state afterwards describes this event.
    pub fn evaluate(&mut self, event: &Event) -> bool {
        for counter in &mut self.counters {
            counter.reset();
        }
        for hit in &event.hits {
            for counter in &mut self.counters {
                counter.check(hit.module as i32, hit.channel as i32);
            }
        }
        for flag in &mut self.flags {
            flag.check(&self.counters);
        }
        self.accepts.iter().any(|a| a.check(&self.flags))
    }

    /// Counter and flag values for the event most recently evaluated,
    /// in declaration order, for export alongside accepted events.
    pub fn side_channels(&self) -> (Vec<(String, u64)>, Vec<(String, bool)>) {
        let counters = self
            .counters
            .iter()
            .map(|c| (c.name.clone(), c.count))
            .collect();
        let flags = self
            .flags
            .iter()
            .map(|f| (f.name.clone(), f.value))
            .collect();
        (counters, flags)
    }
}
