//! Sound asset catalog.
//!
//! Variants come from a JSON manifest and are grouped by class. Selection is a
//! weighted draw over the variants whose cooldown has expired, falling back to
//! the whole class when every variant is cooling down. Decoded buffers are
//! cached; concurrent loads of the same variant share one fetch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use rand::distr::{weighted::WeightedIndex, Distribution};
use rand::{rngs::SmallRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{EntrainError, Result};

/// Stereo placement rule for a variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PanPolicy {
    Center,
    Fixed { pan: f64 },
    /// Uniform in `[-spread, spread]`.
    Random { spread: f64 },
    /// Follows the shared neurofeedback pan LFO.
    Spatial,
}

impl Default for PanPolicy {
    fn default() -> Self {
        Self::Center
    }
}

/// One playable sound, as described by the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundVariant {
    pub id: String,
    pub class: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub path: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_gain")]
    pub base_gain: f64,
    #[serde(default)]
    pub gain_jitter: f64,
    /// Playback-rate range `[min, max]`.
    #[serde(default = "default_pitch")]
    pub pitch_jitter: (f64, f64),
    #[serde(default)]
    pub pan_policy: PanPolicy,
    #[serde(default)]
    pub reverb_send: f64,
    /// Seconds before the variant may be picked again.
    #[serde(default)]
    pub cooldown: f64,
}

fn default_weight() -> f64 {
    1.0
}

fn default_gain() -> f64 {
    0.8
}

fn default_pitch() -> (f64, f64) {
    (1.0, 1.0)
}

impl SoundVariant {
    fn sanitized(mut self) -> Option<Self> {
        if !(self.weight.is_finite() && self.weight > 0.0) {
            tracing::warn!(id = %self.id, weight = self.weight, "dropping variant without positive weight");
            return None;
        }
        self.base_gain = self.base_gain.clamp(0.0, 1.0);
        self.gain_jitter = self.gain_jitter.max(0.0);
        self.reverb_send = self.reverb_send.clamp(0.0, 1.0);
        self.cooldown = self.cooldown.max(0.0);
        let (lo, hi) = self.pitch_jitter;
        self.pitch_jitter = (lo.min(hi).max(0.01), hi.max(lo).max(0.01));
        Some(self)
    }
}

/// Decoded mono audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub samples: Arc<[f32]>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples: samples.into(),
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }

    pub fn size_bytes(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

/// Decodes a WAV file and downmixes it to mono.
pub fn decode_wav(id: &str, bytes: &[u8]) -> Result<AudioBuffer> {
    let decode_err = |reason: String| EntrainError::Decode {
        id: id.to_string(),
        reason,
    };
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| decode_err(e.to_string()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| decode_err(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| decode_err(e.to_string()))?
        }
    };

    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok(AudioBuffer::new(spec.sample_rate, mono))
}

/// Source of the manifest and of raw asset bytes.
pub trait AssetLoader: Send + Sync {
    fn fetch_manifest(&self) -> Result<String>;
    fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>>;
}

/// Loads assets from a directory; paths in the manifest are relative to it.
#[derive(Debug, Clone)]
pub struct FsLoader {
    root: PathBuf,
    manifest: String,
}

impl FsLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest: "manifest.json".to_string(),
        }
    }

    pub fn with_manifest(mut self, name: impl Into<String>) -> Self {
        self.manifest = name.into();
        self
    }

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        std::fs::read(self.root.join(path)).map_err(|e| EntrainError::Network {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

impl AssetLoader for FsLoader {
    fn fetch_manifest(&self) -> Result<String> {
        let bytes = self.read(&self.manifest)?;
        String::from_utf8(bytes).map_err(|e| EntrainError::Network {
            path: self.manifest.clone(),
            reason: e.to_string(),
        })
    }

    fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.read(path)
    }
}

/// In-memory assets, e.g. bundled into the binary.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    pub manifest: String,
    pub files: HashMap<String, Vec<u8>>,
}

impl AssetLoader for MemoryLoader {
    fn fetch_manifest(&self) -> Result<String> {
        Ok(self.manifest.clone())
    }

    fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| EntrainError::Network {
            path: path.to_string(),
            reason: "not found".to_string(),
        })
    }
}

/// Cache occupancy figures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub cached: usize,
    pub total: usize,
    pub size_estimate_bytes: usize,
}

type SharedOutcome = std::result::Result<Arc<AudioBuffer>, String>;

/// Rendezvous for callers waiting on the same load.
#[derive(Default)]
struct InFlight {
    outcome: Mutex<Option<SharedOutcome>>,
    ready: Condvar,
}

impl InFlight {
    fn complete(&self, outcome: SharedOutcome) {
        let mut slot = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(outcome);
        self.ready.notify_all();
    }

    fn wait(&self) -> SharedOutcome {
        let mut slot = self.outcome.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            slot = self.ready.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct CatalogState {
    by_class: BTreeMap<String, Vec<Arc<SoundVariant>>>,
    last_played: HashMap<String, f64>,
    rng: SmallRng,
}

pub struct SoundCatalog {
    loader: Arc<dyn AssetLoader>,
    state: Mutex<CatalogState>,
    buffers: Mutex<HashMap<String, Arc<AudioBuffer>>>,
    in_flight: Mutex<HashMap<String, Arc<InFlight>>>,
    /// Ids whose last load failed.
    failed: Mutex<HashSet<String>>,
}

impl SoundCatalog {
    pub fn new(loader: Arc<dyn AssetLoader>) -> Self {
        Self::with_rng(loader, SmallRng::from_os_rng())
    }

    /// Deterministic selection for tests and offline renders.
    pub fn with_seed(loader: Arc<dyn AssetLoader>, seed: u64) -> Self {
        Self::with_rng(loader, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(loader: Arc<dyn AssetLoader>, rng: SmallRng) -> Self {
        Self {
            loader,
            state: Mutex::new(CatalogState {
                by_class: BTreeMap::new(),
                last_played: HashMap::new(),
                rng,
            }),
            buffers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
        }
    }

    /// Fetches and parses the manifest, replacing any registered variants.
    /// Returns the number of usable variants.
    pub fn load_manifest(&self) -> Result<usize> {
        let text = self.loader.fetch_manifest()?;
        let variants: Vec<SoundVariant> = serde_json::from_str(&text)?;
        {
            let mut state = self.lock_state()?;
            state.by_class.clear();
            state.last_played.clear();
        }
        self.lock_failed()?.clear();
        let count = self.register_variants(variants)?;
        tracing::info!(variants = count, "sound manifest loaded");
        Ok(count)
    }

    pub fn register_variants(&self, variants: Vec<SoundVariant>) -> Result<usize> {
        let mut state = self.lock_state()?;
        let mut count = 0;
        for variant in variants.into_iter().filter_map(SoundVariant::sanitized) {
            state
                .by_class
                .entry(variant.class.clone())
                .or_default()
                .push(Arc::new(variant));
            count += 1;
        }
        Ok(count)
    }

    pub fn classes(&self) -> Result<Vec<String>> {
        Ok(self.lock_state()?.by_class.keys().cloned().collect())
    }

    pub fn variants_for_class(&self, class: &str) -> Result<Vec<Arc<SoundVariant>>> {
        Ok(self
            .lock_state()?
            .by_class
            .get(class)
            .cloned()
            .unwrap_or_default())
    }

    /// Weighted draw among variants off cooldown at audio time `now`; the
    /// whole class is used when all are cooling down. The pick is stamped
    /// with `now`. `None` only when the class has no variants.
    pub fn pick_variant(&self, class: &str, now: f64) -> Result<Option<Arc<SoundVariant>>> {
        let mut state = self.lock_state()?;
        let CatalogState {
            by_class,
            last_played,
            rng,
        } = &mut *state;

        let Some(all) = by_class.get(class).filter(|v| !v.is_empty()) else {
            return Ok(None);
        };
        let ready: Vec<&Arc<SoundVariant>> = all
            .iter()
            .filter(|v| {
                last_played
                    .get(&v.id)
                    .map(|last| now - last >= v.cooldown)
                    .unwrap_or(true)
            })
            .collect();
        let pool: Vec<&Arc<SoundVariant>> = if ready.is_empty() {
            all.iter().collect()
        } else {
            ready
        };

        let index = WeightedIndex::new(pool.iter().map(|v| v.weight))
            .map(|dist| dist.sample(rng))
            .unwrap_or(0);
        let chosen = pool[index].clone();
        last_played.insert(chosen.id.clone(), now);
        Ok(Some(chosen))
    }

    pub fn cached_buffer(&self, variant: &SoundVariant) -> Result<Option<Arc<AudioBuffer>>> {
        Ok(self.lock_buffers()?.get(&variant.id).cloned())
    }

    /// Fetches and decodes a variant's buffer. Concurrent callers for the
    /// same id wait for the first caller's result.
    pub fn load_buffer(&self, variant: &SoundVariant) -> Result<Arc<AudioBuffer>> {
        let (slot, leader) = {
            let mut in_flight = self.lock_in_flight()?;
            if let Some(buffer) = self.cached_buffer(variant)? {
                return Ok(buffer);
            }
            match in_flight.get(&variant.id) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(InFlight::default());
                    in_flight.insert(variant.id.clone(), slot.clone());
                    (slot, true)
                }
            }
        };

        if !leader {
            return slot.wait().map_err(|reason| {
                EntrainError::msg(format!("shared load of `{}` failed: {reason}", variant.id))
            });
        }

        let outcome = self
            .loader
            .fetch_bytes(&variant.path)
            .and_then(|bytes| decode_wav(&variant.id, &bytes))
            .map(Arc::new);
        match &outcome {
            Ok(buffer) => {
                self.lock_buffers()?.insert(variant.id.clone(), buffer.clone());
                self.lock_failed()?.remove(&variant.id);
                tracing::debug!(id = %variant.id, seconds = buffer.duration_seconds(), "sound buffer cached");
            }
            Err(_) => {
                self.lock_failed()?.insert(variant.id.clone());
            }
        }
        slot.complete(match &outcome {
            Ok(buffer) => Ok(buffer.clone()),
            Err(err) => Err(err.to_string()),
        });
        self.lock_in_flight()?.remove(&variant.id);
        outcome
    }

    /// True when the variant's most recent load failed. Cleared by a
    /// successful load, [`clear_cache`](Self::clear_cache) or a manifest
    /// reload.
    pub fn has_failed(&self, variant: &SoundVariant) -> Result<bool> {
        Ok(self.lock_failed()?.contains(&variant.id))
    }

    /// Drops every decoded buffer and forgets failed loads.
    pub fn clear_cache(&self) -> Result<()> {
        self.lock_buffers()?.clear();
        self.lock_failed()?.clear();
        Ok(())
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        let total = self.lock_state()?.by_class.values().map(Vec::len).sum();
        let buffers = self.lock_buffers()?;
        Ok(CacheStats {
            cached: buffers.len(),
            total,
            size_estimate_bytes: buffers.values().map(|b| b.size_bytes()).sum(),
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, CatalogState>> {
        self.state
            .lock()
            .map_err(|_| EntrainError::Poisoned("sound catalog"))
    }

    fn lock_buffers(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<AudioBuffer>>>> {
        self.buffers
            .lock()
            .map_err(|_| EntrainError::Poisoned("buffer cache"))
    }

    fn lock_failed(&self) -> Result<MutexGuard<'_, HashSet<String>>> {
        self.failed
            .lock()
            .map_err(|_| EntrainError::Poisoned("failed loads"))
    }

    fn lock_in_flight(&self) -> Result<MutexGuard<'_, HashMap<String, Arc<InFlight>>>> {
        self.in_flight
            .lock()
            .map_err(|_| EntrainError::Poisoned("in-flight loads"))
    }
}

impl std::fmt::Debug for SoundCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoundCatalog").finish_non_exhaustive()
    }
}

/// Encodes mono samples as a 16-bit WAV. Used by tests and tooling.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)?;
        for &s in samples {
            writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
        }
        writer.finalize()?;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn variant(id: &str, class: &str, cooldown: f64) -> SoundVariant {
        SoundVariant {
            id: id.to_string(),
            class: class.to_string(),
            tags: vec![],
            path: format!("{id}.wav"),
            duration: 1.0,
            weight: 1.0,
            base_gain: 0.8,
            gain_jitter: 0.0,
            pitch_jitter: (1.0, 1.0),
            pan_policy: PanPolicy::Center,
            reverb_send: 0.2,
            cooldown,
        }
    }

    fn catalog_with(variants: Vec<SoundVariant>) -> SoundCatalog {
        let catalog = SoundCatalog::with_seed(Arc::new(MemoryLoader::default()), 7);
        catalog.register_variants(variants).unwrap();
        catalog
    }

    #[test]
    fn cooldown_spreads_picks_then_falls_back() {
        let catalog = catalog_with(vec![
            variant("a", "birds", 10.0),
            variant("b", "birds", 10.0),
            variant("c", "birds", 10.0),
        ]);
        let mut seen = Vec::new();
        for i in 0..3 {
            let pick = catalog.pick_variant("birds", i as f64 * 0.3).unwrap().unwrap();
            seen.push(pick.id.clone());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert!(catalog.pick_variant("birds", 0.9).unwrap().is_some());
    }

    #[test]
    fn empty_classes_yield_none() {
        let catalog = catalog_with(vec![variant("a", "birds", 0.0)]);
        assert!(catalog.pick_variant("wind", 0.0).unwrap().is_none());
    }

    #[test]
    fn weights_bias_the_draw() {
        let mut heavy = variant("heavy", "steps", 0.0);
        heavy.weight = 9.0;
        let catalog = catalog_with(vec![heavy, variant("light", "steps", 0.0)]);
        let heavy_picks = (0..2000)
            .filter(|i| catalog.pick_variant("steps", *i as f64).unwrap().unwrap().id == "heavy")
            .count();
        let share = heavy_picks as f64 / 2000.0;
        assert!((share - 0.9).abs() < 0.04, "{share}");
    }

    #[test]
    fn manifest_drops_invalid_weights_and_clamps_fields() {
        let loader = MemoryLoader {
            manifest: r#"[
                {"id":"a","class":"birds","path":"a.wav","weight":0},
                {"id":"b","class":"birds","path":"b.wav","base_gain":3.0,"pitch_jitter":[1.2,0.9]}
            ]"#
            .to_string(),
            files: HashMap::new(),
        };
        let catalog = SoundCatalog::with_seed(Arc::new(loader), 1);
        assert_eq!(catalog.load_manifest().unwrap(), 1);
        let b = &catalog.variants_for_class("birds").unwrap()[0];
        assert_eq!(b.base_gain, 1.0);
        assert_eq!(b.pitch_jitter, (0.9, 1.2));
    }

    #[test]
    fn manifest_parse_errors_surface() {
        let loader = MemoryLoader {
            manifest: "{ not json".to_string(),
            files: HashMap::new(),
        };
        let catalog = SoundCatalog::with_seed(Arc::new(loader), 1);
        assert!(matches!(catalog.load_manifest(), Err(EntrainError::Json(_))));
    }

    #[test]
    fn decodes_and_caches_buffers() {
        let wav = encode_wav(&[0.0, 0.5, -0.5, 0.25], 8_000).unwrap();
        let loader = MemoryLoader {
            manifest: String::new(),
            files: HashMap::from([("a.wav".to_string(), wav)]),
        };
        let catalog = SoundCatalog::with_seed(Arc::new(loader), 1);
        catalog.register_variants(vec![variant("a", "birds", 0.0)]).unwrap();
        let a = variant("a", "birds", 0.0);

        assert!(catalog.cached_buffer(&a).unwrap().is_none());
        let buffer = catalog.load_buffer(&a).unwrap();
        assert_eq!(buffer.sample_rate, 8_000);
        assert_eq!(buffer.samples.len(), 4);
        assert!((buffer.samples[1] - 0.5).abs() < 1e-3);

        let stats = catalog.cache_stats().unwrap();
        assert_eq!(stats, CacheStats { cached: 1, total: 1, size_estimate_bytes: 16 });
        catalog.clear_cache().unwrap();
        assert_eq!(catalog.cache_stats().unwrap().cached, 0);
    }

    #[test]
    fn missing_files_and_bad_bytes_are_errors() {
        let loader = MemoryLoader {
            manifest: String::new(),
            files: HashMap::from([("a.wav".to_string(), b"garbage".to_vec())]),
        };
        let catalog = SoundCatalog::with_seed(Arc::new(loader), 1);
        let err = catalog.load_buffer(&variant("a", "birds", 0.0)).unwrap_err();
        assert!(matches!(err, EntrainError::Decode { .. }));
        let err = catalog.load_buffer(&variant("zz", "birds", 0.0)).unwrap_err();
        assert!(matches!(err, EntrainError::Network { .. }));
    }

    #[test]
    fn fs_loader_reads_a_named_manifest() {
        let root = std::env::temp_dir().join(format!("entrain-assets-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        let manifest = serde_json::to_string(&vec![variant("rain", "weather", 0.0)]).unwrap();
        std::fs::write(root.join("scenes.json"), manifest).unwrap();
        std::fs::write(root.join("rain.wav"), encode_wav(&[0.0; 8], 8000).unwrap()).unwrap();

        let missing = SoundCatalog::with_seed(Arc::new(FsLoader::new(&root)), 1);
        assert!(matches!(missing.load_manifest(), Err(EntrainError::Network { .. })));

        let loader = FsLoader::new(&root).with_manifest("scenes.json");
        let catalog = SoundCatalog::with_seed(Arc::new(loader), 1);
        assert_eq!(catalog.load_manifest().unwrap(), 1);
        let rain = catalog.pick_variant("weather", 0.0).unwrap().unwrap();
        assert_eq!(catalog.load_buffer(&rain).unwrap().samples.len(), 8);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn failed_loads_are_remembered_until_the_cache_is_cleared() {
        let loader = MemoryLoader {
            manifest: String::new(),
            files: HashMap::from([("a.wav".to_string(), b"garbage".to_vec())]),
        };
        let catalog = SoundCatalog::with_seed(Arc::new(loader), 1);
        let broken = variant("a", "birds", 0.0);
        assert!(!catalog.has_failed(&broken).unwrap());

        assert!(catalog.load_buffer(&broken).is_err());
        assert!(catalog.has_failed(&broken).unwrap());
        assert!(!catalog.has_failed(&variant("b", "birds", 0.0)).unwrap());

        catalog.clear_cache().unwrap();
        assert!(!catalog.has_failed(&broken).unwrap());
    }

    struct SlowLoader {
        fetches: AtomicUsize,
        wav: Vec<u8>,
    }

    impl AssetLoader for SlowLoader {
        fn fetch_manifest(&self) -> Result<String> {
            Ok("[]".to_string())
        }

        fn fetch_bytes(&self, _path: &str) -> Result<Vec<u8>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(self.wav.clone())
        }
    }

    #[test]
    fn concurrent_loads_share_one_fetch() {
        let loader = Arc::new(SlowLoader {
            fetches: AtomicUsize::new(0),
            wav: encode_wav(&[0.1; 64], 8_000).unwrap(),
        });
        let catalog = Arc::new(SoundCatalog::with_seed(loader.clone(), 1));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let catalog = catalog.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    catalog.load_buffer(&variant("a", "birds", 0.0)).unwrap()
                })
            })
            .collect();
        let buffers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(loader.fetches.load(Ordering::SeqCst), 1);
        assert!(buffers.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
