use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::{Deserialize, Serialize};

use crate::assets::{CacheStats, SoundCatalog, SoundVariant};
use crate::binaural::{BinauralGenerator, BinauralState};
use crate::config::{AudioConfig, ConfigSource};
use crate::fx::FxGraph;
use crate::scheduler::EventScheduler;
use crate::{EntrainError, Result};

/// Counters exposed by the audio side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioDiagnostics {
    pub active_sound_count: usize,
    pub cache_stats: CacheStats,
    /// Audio-clock time in seconds.
    pub audio_time: f64,
    pub events_fired: u64,
    /// Events skipped because their buffer was still loading.
    pub events_uncached: u64,
    /// Events skipped because their buffer failed to load earlier.
    pub events_unloadable: u64,
    /// Events skipped because no variant was available.
    pub events_starved: u64,
    /// Events skipped because the active-chain cap was reached.
    pub events_capped: u64,
    pub chains_completed: u64,
    pub load_failures: u64,
}

struct EngineState {
    scheduler: EventScheduler,
    fx: FxGraph,
    binaural: BinauralGenerator,
    frames_rendered: u64,
    sample_rate: u32,
    running: bool,
    binaural_enabled: bool,
    events_fired: u64,
    events_uncached: u64,
    events_unloadable: u64,
    events_capped: u64,
}

impl EngineState {
    fn now(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }
}

/// Audio façade: drives the scheduler from a coarse tick, renders sound
/// chains and the binaural bed on the audio clock, and loads missing buffers
/// off the tick path.
pub struct AudioEngine<C: ConfigSource> {
    config: C,
    catalog: Arc<SoundCatalog>,
    state: Arc<Mutex<EngineState>>,
    pending_loads: Arc<Mutex<HashSet<String>>>,
    load_threads: Mutex<Vec<JoinHandle<()>>>,
    load_failures: Arc<AtomicU64>,
}

impl<C: ConfigSource> AudioEngine<C> {
    /// Creates a stopped engine reading its settings from `config`.
    pub fn new(config: C, catalog: Arc<SoundCatalog>) -> Self {
        let audio = config.audio();
        let flicker_hz = config.visual().effective_target_hz();
        Self::with_parts(
            config,
            catalog,
            EventScheduler::new(),
            FxGraph::new(&audio),
            &audio,
            flicker_hz,
        )
    }

    /// Reproducible scheduling and jitter, for offline renders and tests.
    pub fn with_seed(config: C, catalog: Arc<SoundCatalog>, seed: u64) -> Self {
        let audio = config.audio();
        let flicker_hz = config.visual().effective_target_hz();
        Self::with_parts(
            config,
            catalog,
            EventScheduler::with_seed(seed),
            FxGraph::with_seed(&audio, seed.wrapping_add(1)),
            &audio,
            flicker_hz,
        )
    }

    fn with_parts(
        config: C,
        catalog: Arc<SoundCatalog>,
        scheduler: EventScheduler,
        fx: FxGraph,
        audio: &AudioConfig,
        flicker_hz: f64,
    ) -> Self {
        let sample_rate = audio.sample_rate.max(1);
        let state = EngineState {
            scheduler,
            fx,
            binaural: BinauralGenerator::new(sample_rate, &audio.binaural, flicker_hz),
            frames_rendered: 0,
            sample_rate,
            running: false,
            binaural_enabled: false,
            events_fired: 0,
            events_uncached: 0,
            events_unloadable: 0,
            events_capped: 0,
        };
        Self {
            config,
            catalog,
            state: Arc::new(Mutex::new(state)),
            pending_loads: Arc::new(Mutex::new(HashSet::new())),
            load_threads: Mutex::new(Vec::new()),
            load_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns the sound catalog shared with the background loaders.
    pub fn catalog(&self) -> &Arc<SoundCatalog> {
        &self.catalog
    }

    /// Audio-clock time in seconds: frames rendered over the sample rate.
    pub fn audio_time(&self) -> Result<f64> {
        Ok(self.lock_state()?.now())
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> Result<bool> {
        Ok(self.lock_state()?.running)
    }

    /// Decodes every catalogued variant up front. Failures are logged and
    /// counted; the return value is the number of buffers now cached.
    pub fn preload(&self) -> Result<usize> {
        let mut loaded = 0;
        for class in self.catalog.classes()? {
            for variant in self.catalog.variants_for_class(&class)? {
                match self.catalog.load_buffer(&variant) {
                    Ok(_) => loaded += 1,
                    Err(err) => {
                        self.load_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(id = %variant.id, %err, "preload failed");
                    }
                }
            }
        }
        Ok(loaded)
    }

    pub fn start(&self) -> Result<()> {
        let audio = self.config.audio();
        let mut state = self.lock_state()?;
        if state.running {
            return Ok(());
        }
        let now = state.now();
        state.running = true;
        state.scheduler.sync_classes(&audio.classes, now);
        state.scheduler.rebase(now);
        state.fx.apply_config(&audio);
        state
            .binaural
            .configure(&audio.binaural, self.config.visual().effective_target_hz());
        if audio.binaural.enabled {
            state.binaural.start(now);
            state.binaural_enabled = true;
        }
        tracing::info!(classes = audio.classes.len(), now, "audio engine started");
        Ok(())
    }

    /// Halts scheduling and fades the binaural bed out. Sounds already
    /// playing run to their end.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if !state.running {
            return Ok(());
        }
        let now = state.now();
        state.running = false;
        if state.binaural_enabled {
            state.binaural.stop(now);
            state.binaural_enabled = false;
        }
        tracing::info!(now, "audio engine stopped");
        Ok(())
    }

    /// One scheduler tick: pulls fresh configuration, applies neurofeedback
    /// and turns due events into sound chains. Returns the number of chains
    /// created.
    pub fn tick(&self) -> Result<usize> {
        let audio = self.config.audio();
        let flicker_hz = self.config.visual().effective_target_hz();
        let neurofeedback = self.config.neurofeedback();

        let mut to_load: Vec<Arc<SoundVariant>> = Vec::new();
        let mut created = 0;
        {
            let mut state = self.lock_state()?;
            if !state.running {
                return Ok(0);
            }
            let now = state.now();

            state.scheduler.sync_classes(&audio.classes, now);
            state.fx.apply_config(&audio);
            state.binaural.set_volume(audio.binaural.volume, now);
            state.binaural.configure(&audio.binaural, flicker_hz);
            match (audio.binaural.enabled, state.binaural_enabled) {
                (true, false) => state.binaural.start(now),
                (false, true) => state.binaural.stop(now),
                _ => {}
            }
            state.binaural_enabled = audio.binaural.enabled;

            let snapshot = neurofeedback.filter(|_| audio.neurofeedback.enabled);
            state
                .fx
                .apply_neurofeedback(snapshot.as_ref().map(|nf| nf.normalized_coherence()));
            state.fx.set_noise_volume(
                snapshot
                    .as_ref()
                    .map(|nf| nf.noise_volume_modulation)
                    .unwrap_or(1.0),
            );
            state.binaural.set_modulation(
                snapshot
                    .as_ref()
                    .map(|nf| nf.beat_volume_modulation)
                    .unwrap_or(1.0),
                now,
            );

            let window = audio.lookahead_ms.max(0.0) / 1000.0;
            let events = state.scheduler.poll(now, window, &self.catalog);
            for event in events {
                if let Some(cap) = audio.max_active_chains {
                    if state.fx.active_count() >= cap {
                        state.events_capped += 1;
                        tracing::debug!(class = %event.class, cap, "active chain cap reached, event dropped");
                        continue;
                    }
                }
                match self.catalog.cached_buffer(&event.variant)? {
                    Some(buffer) => {
                        state.fx.create_chain(
                            buffer,
                            &event.variant,
                            event.scheduled_time,
                            event.reinforcement_mode,
                        );
                        state.events_fired += 1;
                        created += 1;
                    }
                    None if self.catalog.has_failed(&event.variant)? => {
                        state.events_unloadable += 1;
                        tracing::debug!(id = %event.variant.id, "skipping event for a sound that failed to load");
                    }
                    None => {
                        state.events_uncached += 1;
                        to_load.push(event.variant.clone());
                    }
                }
            }
        }

        for variant in to_load {
            self.spawn_load(variant)?;
        }
        Ok(created)
    }

    /// Renders the next block on the audio clock into `left` and `right`.
    pub fn render(&self, left: &mut [f32], right: &mut [f32]) -> Result<()> {
        let frames = left.len().min(right.len());
        let mut state = self.lock_state()?;
        let frame_start = state.frames_rendered;
        state.fx.render(frame_start, &mut left[..frames], &mut right[..frames]);
        state
            .binaural
            .render(frame_start, &mut left[..frames], &mut right[..frames]);
        state.frames_rendered += frames as u64;
        Ok(())
    }

    /// Blocks until every background load started so far has finished.
    pub fn wait_for_loads(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.lock_threads()?);
        for handle in handles {
            handle
                .join()
                .map_err(|_| EntrainError::msg("asset load thread panicked"))?;
        }
        Ok(())
    }

    /// Snapshot of the binaural bed at the current audio time.
    pub fn binaural_state(&self) -> Result<BinauralState> {
        let state = self.lock_state()?;
        Ok(state.binaural.state(state.now()))
    }

    /// Read access to the active-sound set.
    pub fn with_fx<R>(&self, f: impl FnOnce(&FxGraph) -> R) -> Result<R> {
        Ok(f(&self.lock_state()?.fx))
    }

    /// Counters for the host's diagnostics read.
    pub fn diagnostics(&self) -> Result<AudioDiagnostics> {
        let cache_stats = self.catalog.cache_stats()?;
        let state = self.lock_state()?;
        Ok(AudioDiagnostics {
            active_sound_count: state.fx.active_count(),
            cache_stats,
            audio_time: state.now(),
            events_fired: state.events_fired,
            events_uncached: state.events_uncached,
            events_unloadable: state.events_unloadable,
            events_starved: state.scheduler.stats().starved,
            events_capped: state.events_capped,
            chains_completed: state.fx.completed_count(),
            load_failures: self.load_failures.load(Ordering::Relaxed),
        })
    }

    fn spawn_load(&self, variant: Arc<SoundVariant>) -> Result<()> {
        {
            let mut pending = self.lock_pending()?;
            if !pending.insert(variant.id.clone()) {
                return Ok(());
            }
            // A load that just failed has already recorded it.
            if self.catalog.has_failed(&variant)? {
                pending.remove(&variant.id);
                return Ok(());
            }
        }
        let catalog = self.catalog.clone();
        let pending = self.pending_loads.clone();
        let failures = self.load_failures.clone();
        let id = variant.id.clone();

        let spawned = thread::Builder::new()
            .name(format!("load-{id}"))
            .spawn(move || {
                match catalog.load_buffer(&variant) {
                    Ok(buffer) => {
                        tracing::debug!(id = %variant.id, seconds = buffer.duration_seconds(), "background load finished")
                    }
                    Err(err) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(id = %variant.id, %err, "background load failed");
                    }
                }
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&variant.id);
            });

        match spawned {
            Ok(handle) => {
                let mut threads = self.lock_threads()?;
                threads.retain(|handle| !handle.is_finished());
                threads.push(handle);
            }
            Err(err) => {
                self.lock_pending()?.remove(&id);
                tracing::warn!(%id, %err, "could not start background load");
            }
        }
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| EntrainError::Poisoned("audio engine state"))
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.pending_loads
            .lock()
            .map_err(|_| EntrainError::Poisoned("pending loads"))
    }

    fn lock_threads(&self) -> Result<MutexGuard<'_, Vec<JoinHandle<()>>>> {
        self.load_threads
            .lock()
            .map_err(|_| EntrainError::Poisoned("load threads"))
    }
}

impl<C: ConfigSource> std::fmt::Debug for AudioEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioEngine")
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{encode_wav, MemoryLoader};
    use crate::config::{AppConfig, ClassConfig, NeurofeedbackPolicy, ReinforcementMode, SharedConfig};
    use crate::neurofeedback::{Band, NeurofeedbackSnapshot};
    use std::collections::{BTreeMap, HashMap};

    const RATE: u32 = 8_000;
    const TICK_FRAMES: usize = 200;

    fn catalog(seconds: f64) -> Arc<SoundCatalog> {
        let samples = vec![0.25; (seconds * RATE as f64) as usize];
        let loader = MemoryLoader {
            manifest: r#"[
                {"id":"b1","class":"birds","path":"b1.wav","pan_policy":{"kind":"spatial"}},
                {"id":"b2","class":"birds","path":"b2.wav"}
            ]"#
            .to_string(),
            files: HashMap::from([
                ("b1.wav".to_string(), encode_wav(&samples, RATE).unwrap()),
                ("b2.wav".to_string(), encode_wav(&samples, RATE).unwrap()),
            ]),
        };
        let catalog = Arc::new(SoundCatalog::with_seed(Arc::new(loader), 3));
        catalog.load_manifest().unwrap();
        catalog
    }

    fn config(bpm: f64, mode: ReinforcementMode) -> AppConfig {
        let mut config = AppConfig::default();
        config.audio.sample_rate = RATE;
        config.audio.binaural.enabled = false;
        config.audio.classes = BTreeMap::from([(
            "birds".to_string(),
            ClassConfig {
                bpm,
                min_gap: 0.05,
                max_gap: Some(0.05),
                reinforcement_mode: mode,
                ..ClassConfig::default()
            },
        )]);
        config
    }

    fn run<C: ConfigSource>(engine: &AudioEngine<C>, ticks: usize) {
        let mut left = vec![0.0; TICK_FRAMES];
        let mut right = vec![0.0; TICK_FRAMES];
        for _ in 0..ticks {
            engine.tick().unwrap();
            engine.render(&mut left, &mut right).unwrap();
        }
    }

    #[test]
    fn uncached_events_trigger_background_loads() {
        let engine = AudioEngine::with_seed(config(1200.0, ReinforcementMode::Neutral), catalog(0.1), 1);
        engine.start().unwrap();
        run(&engine, 120);
        engine.wait_for_loads().unwrap();

        let before = engine.diagnostics().unwrap();
        assert!(before.events_uncached > 0);
        assert_eq!(before.cache_stats.total, 2);
        assert!(before.cache_stats.cached >= 1);

        engine.preload().unwrap();
        run(&engine, 40);
        assert!(engine.diagnostics().unwrap().events_fired > before.events_fired);
    }

    #[test]
    fn broken_assets_are_loaded_once_and_then_skipped() {
        let loader = MemoryLoader {
            manifest: r#"[{"id":"bad","class":"birds","path":"bad.wav"}]"#.to_string(),
            files: HashMap::from([("bad.wav".to_string(), b"not a wav file".to_vec())]),
        };
        let catalog = Arc::new(SoundCatalog::with_seed(Arc::new(loader), 8));
        catalog.load_manifest().unwrap();

        let engine = AudioEngine::with_seed(config(600.0, ReinforcementMode::Neutral), catalog.clone(), 8);
        engine.start().unwrap();
        for _ in 0..20 {
            run(&engine, 100);
            assert!(engine.lock_threads().unwrap().len() <= 1);
        }
        engine.wait_for_loads().unwrap();
        run(&engine, 100);

        let diagnostics = engine.diagnostics().unwrap();
        assert_eq!(diagnostics.load_failures, 1);
        assert!(diagnostics.events_unloadable > 0);
        assert_eq!(diagnostics.events_fired, 0);
        assert!(engine.lock_threads().unwrap().is_empty());

        catalog.clear_cache().unwrap();
        run(&engine, 100);
        engine.wait_for_loads().unwrap();
        assert_eq!(engine.diagnostics().unwrap().load_failures, 2);
    }

    #[test]
    fn chains_are_released_after_stop() {
        let engine = AudioEngine::with_seed(config(1200.0, ReinforcementMode::Neutral), catalog(0.1), 2);
        assert_eq!(engine.preload().unwrap(), 2);
        engine.start().unwrap();
        run(&engine, 100);
        let diagnostics = engine.diagnostics().unwrap();
        assert!(diagnostics.events_fired > 0);
        assert!(diagnostics.chains_completed > 0);

        assert!(engine.is_running().unwrap());
        engine.stop().unwrap();
        assert!(!engine.is_running().unwrap());
        run(&engine, 20);
        let diagnostics = engine.diagnostics().unwrap();
        assert_eq!(diagnostics.active_sound_count, 0);
        assert_eq!(diagnostics.events_fired, diagnostics.chains_completed);
    }

    #[test]
    fn active_chain_cap_drops_excess_events() {
        let mut config = config(1200.0, ReinforcementMode::Neutral);
        config.audio.max_active_chains = Some(1);
        let engine = AudioEngine::with_seed(config, catalog(5.0), 3);
        engine.preload().unwrap();
        engine.start().unwrap();
        run(&engine, 100);
        let diagnostics = engine.diagnostics().unwrap();
        assert_eq!(diagnostics.active_sound_count, 1);
        assert!(diagnostics.events_capped > 0);
    }

    #[test]
    fn stopped_engine_does_not_schedule() {
        let engine = AudioEngine::with_seed(config(1200.0, ReinforcementMode::Neutral), catalog(0.1), 4);
        engine.preload().unwrap();
        assert!(!engine.is_running().unwrap());
        run(&engine, 50);
        assert_eq!(engine.diagnostics().unwrap().events_fired, 0);
        assert!(engine.audio_time().unwrap() > 1.0);
    }

    #[test]
    fn neurofeedback_moves_reinforced_sounds_closer() {
        let mut app = config(1200.0, ReinforcementMode::Positive);
        app.audio.neurofeedback = NeurofeedbackPolicy {
            enabled: true,
            ..NeurofeedbackPolicy::default()
        };
        let shared = SharedConfig::new(app);
        shared.publish_neurofeedback(Some(NeurofeedbackSnapshot::new(1.0, Band::Alpha)));

        let engine = AudioEngine::with_seed(shared.clone(), catalog(5.0), 5);
        engine.preload().unwrap();
        engine.start().unwrap();
        run(&engine, 100);
        let distances = engine
            .with_fx(|fx| fx.chains().iter().map(|c| c.distance()).collect::<Vec<_>>())
            .unwrap();
        assert!(!distances.is_empty());
        assert!(distances.iter().all(|d| *d == Some(0.0)));

        shared.publish_neurofeedback(Some(NeurofeedbackSnapshot::new(0.0, Band::Alpha)));
        run(&engine, 1);
        let far = engine
            .with_fx(|fx| fx.chains().iter().all(|c| c.distance() == Some(1.0)))
            .unwrap();
        assert!(far);
    }

    #[test]
    fn binaural_follows_config_toggle() {
        let mut app = config(0.0, ReinforcementMode::Neutral);
        app.audio.binaural.enabled = true;
        app.audio.binaural.ramp_seconds = 0.0;
        let shared = SharedConfig::new(app);
        let engine = AudioEngine::with_seed(shared.clone(), catalog(0.1), 6);
        engine.start().unwrap();
        run(&engine, 2);
        assert!(engine.binaural_state().unwrap().level > 0.0);

        shared.update(|c| c.audio.binaural.enabled = false);
        run(&engine, 2);
        let state = engine.binaural_state().unwrap();
        assert!(!state.running);
        assert_eq!(state.level, 0.0);
    }
}
