//! Strategies that turn a master into concrete occurrences for one date.
//!
//! | Maker    | Behaviour                                                   |
//! |----------|-------------------------------------------------------------|
//! | `once`   | One occurrence at `start_time` (midnight when unset)        |
//! | `repeat` | Every `repeat_interval` ms from `start_time` to `end_time`  |
//!
//! A [`MakerRegistry`] picks the maker for a master's `schedule_type`: exact
//! key first, then regex patterns (when enabled), then the default maker.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use jobsched_core::GeneratorConfig;
use regex::Regex;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::types::{Schedule, ScheduleMaster};

/// Upper bound on occurrences a single master may produce for one date.
pub const MAX_OCCURRENCES_PER_DAY: usize = 86_400;

/// Pure function of (date, master) returning the occurrences for that date.
///
/// Returned schedules need no id; the generator assigns ids and resolves
/// dependency edges.
pub trait ScheduleMaker: Send + Sync {
    fn make(&self, date: NaiveDate, master: &ScheduleMaster) -> Result<Vec<Schedule>>;
}

fn at(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}

fn start_of(date: NaiveDate, master: &ScheduleMaster) -> DateTime<Utc> {
    at(date, master.start_time.unwrap_or(NaiveTime::MIN))
}

/// Compute the next fire time of `master` on `date` strictly *after* `from`.
///
/// Returns `None` once the day's window is exhausted, when the master does
/// not repeat and its single slot is not after `from`, or when the next slot
/// is not representable.
pub fn compute_next_run(
    master: &ScheduleMaster,
    date: NaiveDate,
    from: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let start = start_of(date, master);
    let end = match master.end_time {
        Some(t) => at(date, t),
        // Last millisecond of the day.
        None => at(date.succ_opt()?, NaiveTime::MIN) - TimeDelta::milliseconds(1),
    };

    let candidate = if from < start {
        start
    } else {
        match master.repeat_interval {
            Some(every) if every > 0 => {
                // Align to the grid anchored at `start`.
                let elapsed = (from - start).num_milliseconds();
                let steps = elapsed / every + 1;
                let offset = steps.checked_mul(every).and_then(TimeDelta::try_milliseconds)?;
                start.checked_add_signed(offset)?
            }
            _ => return None,
        }
    };

    (candidate <= end).then_some(candidate)
}

/// One occurrence per day.
#[derive(Debug, Default)]
pub struct OnceMaker;

impl ScheduleMaker for OnceMaker {
    fn make(&self, date: NaiveDate, master: &ScheduleMaster) -> Result<Vec<Schedule>> {
        Ok(vec![Schedule::from_master(master, start_of(date, master))])
    }
}

/// Fixed-interval occurrences within the master's daily window.
#[derive(Debug, Default)]
pub struct RepeatMaker;

impl ScheduleMaker for RepeatMaker {
    fn make(&self, date: NaiveDate, master: &ScheduleMaster) -> Result<Vec<Schedule>> {
        if let (Some(start), Some(end)) = (master.start_time, master.end_time) {
            if end < start {
                return Err(SchedulerError::Make {
                    master_id: master.id.clone(),
                    reason: format!("end_time {end} is before start_time {start}"),
                });
            }
        }

        let first = start_of(date, master);
        let mut out = vec![Schedule::from_master(master, first)];
        let mut last = first;
        while let Some(next) = compute_next_run(master, date, last) {
            if out.len() >= MAX_OCCURRENCES_PER_DAY {
                return Err(SchedulerError::Make {
                    master_id: master.id.clone(),
                    reason: format!("more than {MAX_OCCURRENCES_PER_DAY} occurrences on {date}"),
                });
            }
            out.push(Schedule::from_master(master, next));
            last = next;
        }
        Ok(out)
    }
}

/// Built-in makers by name.
fn builtin(name: &str) -> Option<Arc<dyn ScheduleMaker>> {
    match name {
        "once" => Some(Arc::new(OnceMaker)),
        "repeat" => Some(Arc::new(RepeatMaker)),
        _ => None,
    }
}

/// Maps `schedule_type` keys to makers.
pub struct MakerRegistry {
    exact: HashMap<String, Arc<dyn ScheduleMaker>>,
    patterns: Vec<(Regex, Arc<dyn ScheduleMaker>)>,
    regex_enabled: bool,
    default: Option<Arc<dyn ScheduleMaker>>,
}

impl MakerRegistry {
    /// Registry with no makers at all.
    pub fn empty() -> Self {
        Self {
            exact: HashMap::new(),
            patterns: Vec::new(),
            regex_enabled: false,
            default: None,
        }
    }

    /// `once` and `repeat` registered under their own names, `once` as default.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("once", Arc::new(OnceMaker));
        registry.register("repeat", Arc::new(RepeatMaker));
        registry.default = Some(Arc::new(OnceMaker));
        registry
    }

    /// Built-ins plus the aliases, patterns and default from configuration.
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let mut registry = Self::with_builtins();
        registry.regex_enabled = config.regex_enabled;
        registry.default = None;

        let mut aliases: Vec<_> = config.makers.iter().collect();
        aliases.sort();
        for (key, target) in aliases {
            let maker = builtin(target).ok_or_else(|| {
                SchedulerError::InvalidMakerConfig(format!("unknown maker {target:?} for {key:?}"))
            })?;
            if config.regex_enabled {
                registry.register_pattern(key, maker)?;
            } else {
                registry.register(key.clone(), maker);
            }
        }

        if !config.default_maker.is_empty() {
            let maker = builtin(&config.default_maker).ok_or_else(|| {
                SchedulerError::InvalidMakerConfig(format!(
                    "unknown default maker {:?}",
                    config.default_maker
                ))
            })?;
            registry.default = Some(maker);
        }
        Ok(registry)
    }

    pub fn register(&mut self, schedule_type: impl Into<String>, maker: Arc<dyn ScheduleMaker>) {
        self.exact.insert(schedule_type.into(), maker);
    }

    /// Register a maker for every `schedule_type` fully matching `pattern`.
    /// Only consulted while regex matching is enabled.
    pub fn register_pattern(&mut self, pattern: &str, maker: Arc<dyn ScheduleMaker>) -> Result<()> {
        let anchored = format!("^(?:{pattern})$");
        let regex = Regex::new(&anchored).map_err(|e| {
            SchedulerError::InvalidMakerConfig(format!("bad pattern {pattern:?}: {e}"))
        })?;
        self.patterns.push((regex, maker));
        Ok(())
    }

    pub fn set_regex_enabled(&mut self, enabled: bool) {
        self.regex_enabled = enabled;
    }

    pub fn set_default(&mut self, maker: Option<Arc<dyn ScheduleMaker>>) {
        self.default = maker;
    }

    pub fn resolve(&self, schedule_type: &str) -> Option<Arc<dyn ScheduleMaker>> {
        if let Some(maker) = self.exact.get(schedule_type) {
            return Some(Arc::clone(maker));
        }
        if self.regex_enabled {
            let matched = self.patterns.iter().find(|(re, _)| re.is_match(schedule_type));
            if let Some((regex, maker)) = matched {
                debug!(schedule_type, pattern = %regex, "maker matched by pattern");
                return Some(Arc::clone(maker));
            }
        }
        self.default.clone()
    }
}

impl Default for MakerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
