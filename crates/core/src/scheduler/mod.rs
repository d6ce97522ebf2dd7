//! Poisson event scheduler.
//!
//! Each sound class keeps its own next-event time on the audio clock. The
//! driver polls every class on a coarse tick with a lookahead window; events
//! that fall inside the window are handed over with their precomputed
//! `scheduled_time`, which the mixer honours to the sample.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::assets::{SoundCatalog, SoundVariant};
use crate::config::{ClassConfig, ClassConfigPatch, ReinforcementMode};

/// Upper bound of the uniform jitter added to a class's first event.
pub const FIRST_EVENT_JITTER_SECONDS: f64 = 2.0;

/// Draws one exponential inter-arrival time for `bpm` events per minute,
/// clamped to `[min_gap, max_gap]`. A non-positive rate never fires.
pub fn sample_interarrival<R: Rng + ?Sized>(
    rng: &mut R,
    bpm: f64,
    min_gap: f64,
    max_gap: Option<f64>,
) -> f64 {
    let lambda = bpm / 60.0;
    if !(lambda > 0.0) {
        return f64::INFINITY;
    }
    // (0, 1] so the logarithm stays finite.
    let u = 1.0 - rng.random::<f64>();
    let raw = -u.ln() / lambda;
    let lo = min_gap.max(0.0);
    let hi = max_gap.unwrap_or(f64::INFINITY).max(lo);
    raw.clamp(lo, hi)
}

/// A class event ready to be turned into a sound chain.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub class: String,
    pub variant: Arc<SoundVariant>,
    /// Audio-clock time in seconds at which playback must start.
    pub scheduled_time: f64,
    pub reinforcement_mode: ReinforcementMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub fired: u64,
    /// Due occurrences skipped because no variant was available.
    pub starved: u64,
}

#[derive(Debug, Clone)]
struct ClassSchedule {
    config: ClassConfig,
    next_event_time: f64,
}

#[derive(Debug)]
pub struct EventScheduler {
    classes: BTreeMap<String, ClassSchedule>,
    rng: SmallRng,
    stats: SchedulerStats,
}

impl Default for EventScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventScheduler {
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_os_rng())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed))
    }

    fn with_rng(rng: SmallRng) -> Self {
        Self {
            classes: BTreeMap::new(),
            rng,
            stats: SchedulerStats::default(),
        }
    }

    /// Registers (or re-registers) a class. The first event lands one
    /// inter-arrival plus up to two seconds of jitter after `now`.
    pub fn init_class(&mut self, class: &str, config: ClassConfig, now: f64) {
        let gap = self.sample(&config);
        let jitter = self.rng.random_range(0.0..FIRST_EVENT_JITTER_SECONDS);
        let next_event_time = now + gap + jitter;
        tracing::debug!(class, bpm = config.bpm, next_event_time, "class scheduled");
        self.classes.insert(
            class.to_string(),
            ClassSchedule {
                config,
                next_event_time,
            },
        );
    }

    /// Applies a partial update. A class that could not fire before (rate of
    /// zero, or disabled with a stale next time) is rescheduled from `now`.
    /// Returns `false` for unknown classes.
    pub fn update_config(&mut self, class: &str, patch: &ClassConfigPatch, now: f64) -> bool {
        let Some(entry) = self.classes.get_mut(class) else {
            return false;
        };
        let was_enabled = entry.config.enabled;
        patch.apply(&mut entry.config);
        let config = &entry.config;
        let stalled = !entry.next_event_time.is_finite()
            || (!was_enabled && config.enabled && entry.next_event_time < now);

        if patch.bpm.is_some() && !(config.bpm > 0.0) {
            entry.next_event_time = f64::INFINITY;
        } else if stalled {
            entry.next_event_time = now
                + sample_interarrival(&mut self.rng, config.bpm, config.min_gap, config.max_gap);
        }
        true
    }

    /// Replaces every class's configuration, registering new classes and
    /// dropping ones no longer configured.
    pub fn sync_classes(&mut self, configs: &BTreeMap<String, ClassConfig>, now: f64) {
        self.classes.retain(|name, _| configs.contains_key(name));
        for (name, config) in configs {
            match self.classes.get(name) {
                None => self.init_class(name, config.clone(), now),
                Some(existing) if existing.config != *config => {
                    let patch = ClassConfigPatch {
                        enabled: Some(config.enabled),
                        bpm: Some(config.bpm),
                        min_gap: Some(config.min_gap),
                        max_gap: Some(config.max_gap),
                        reinforcement_mode: Some(config.reinforcement_mode),
                    };
                    self.update_config(name, &patch, now);
                }
                Some(_) => {}
            }
        }
    }

    /// Moves overdue classes forward after a pause so they do not burst.
    pub fn rebase(&mut self, now: f64) {
        for schedule in self.classes.values_mut() {
            if schedule.next_event_time < now {
                let config = &schedule.config;
                schedule.next_event_time = now
                    + sample_interarrival(&mut self.rng, config.bpm, config.min_gap, config.max_gap);
            }
        }
    }

    pub fn next_event_time(&self, class: &str) -> Option<f64> {
        self.classes.get(class).map(|s| s.next_event_time)
    }

    pub fn class_config(&self, class: &str) -> Option<&ClassConfig> {
        self.classes.get(class).map(|s| &s.config)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Checks one class. When its next event falls within `now + window` a
    /// variant is picked and the schedule advances by a fresh inter-arrival.
    /// The schedule still advances when no variant is available. Disabled
    /// classes return `None` and are left untouched.
    pub fn check_lookahead(
        &mut self,
        class: &str,
        now: f64,
        window: f64,
        catalog: &SoundCatalog,
    ) -> Option<ScheduledEvent> {
        let schedule = self.classes.get_mut(class)?;
        if !schedule.config.enabled || schedule.next_event_time > now + window {
            return None;
        }

        let scheduled_time = schedule.next_event_time;
        let config = schedule.config.clone();
        schedule.next_event_time +=
            sample_interarrival(&mut self.rng, config.bpm, config.min_gap, config.max_gap);

        let variant = match catalog.pick_variant(class, now) {
            Ok(variant) => variant,
            Err(err) => {
                tracing::warn!(class, %err, "variant selection failed");
                None
            }
        };
        let Some(variant) = variant else {
            self.stats.starved += 1;
            tracing::trace!(class, scheduled_time, "no variant available, occurrence skipped");
            return None;
        };

        self.stats.fired += 1;
        Some(ScheduledEvent {
            class: class.to_string(),
            variant,
            scheduled_time,
            reinforcement_mode: config.reinforcement_mode,
        })
    }

    /// One driver tick: every class is checked once, in name order.
    pub fn poll(&mut self, now: f64, window: f64, catalog: &SoundCatalog) -> Vec<ScheduledEvent> {
        let names: Vec<String> = self.classes.keys().cloned().collect();
        names
            .iter()
            .filter_map(|class| self.check_lookahead(class, now, window, catalog))
            .collect()
    }

    fn sample(&mut self, config: &ClassConfig) -> f64 {
        sample_interarrival(&mut self.rng, config.bpm, config.min_gap, config.max_gap)
    }
}
