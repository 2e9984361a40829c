#![allow(dead_code)]

use candle_core::{Device, Tensor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use inference_server::budget::GIB;
use inference_server::config::{BudgetSettings, GenerationDefaults, LoadSettings, ServeSettings};
use inference_server::device_detection::{
    AcceleratorInventory, DeviceDescriptor, DeviceKind, HardwareSource, GpuSnapshot,
};
use inference_server::error::{InferenceError, LoadError};
use inference_server::generation::{PlainFormat, PromptFormat};
use inference_server::loader::{
    plan_placement, DecodeSession, EncoderBundle, LanguageModel, LoadAttempt, ModelBackend, ModelLoader,
    Precision, TextEncoder, WeightFootprint,
};
use inference_server::service::InferenceService;

pub const EOS: u32 = 256;
pub const VOCAB: usize = 257;

/// Byte-level tokenizer: token `b` is byte `b`, 256 ends the sequence.
pub struct ByteEncoder {
    eos: Vec<u32>,
}

impl ByteEncoder {
    pub fn new() -> Self {
        Self { eos: vec![EOS] }
    }
}

impl TextEncoder for ByteEncoder {
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>, InferenceError> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, InferenceError> {
        let bytes: Vec<u8> = tokens.iter().filter(|&&t| t < 256).map(|&t| t as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos
    }
}

#[derive(Default)]
pub struct Stats {
    pub loads: AtomicUsize,
    pub encoder_loads: AtomicUsize,
    pub sessions: AtomicUsize,
    pub live_sessions: AtomicUsize,
    pub releases: AtomicUsize,
    pub forwards: AtomicUsize,
}

impl Stats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Scripted model: at generation step `k` it strongly prefers byte
/// `script[k]`, then EOS once the script runs out.
pub struct FakeModel {
    script: Arc<Vec<u8>>,
    capacity: usize,
    context_len: usize,
    step_delay: Duration,
    stats: Arc<Stats>,
    placement: String,
}

impl LanguageModel for FakeModel {
    fn new_session(&self) -> candle_core::Result<Box<dyn DecodeSession>> {
        self.stats.sessions.fetch_add(1, Ordering::SeqCst);
        self.stats.live_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            script: self.script.clone(),
            capacity: self.capacity,
            step_delay: self.step_delay,
            stats: self.stats.clone(),
            step: 0,
        }))
    }

    fn max_context_len(&self) -> usize {
        self.context_len
    }

    fn placement(&self) -> String {
        self.placement.clone()
    }

    fn release_memory(&self) {
        self.stats.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeSession {
    script: Arc<Vec<u8>>,
    capacity: usize,
    step_delay: Duration,
    stats: Arc<Stats>,
    step: usize,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.stats.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DecodeSession for FakeSession {
    fn forward(&mut self, tokens: &[u32], position: usize) -> candle_core::Result<Tensor> {
        self.stats.forwards.fetch_add(1, Ordering::SeqCst);
        if position + tokens.len() > self.capacity {
            return Err(candle_core::Error::Msg(format!(
                "DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\") at position {}",
                position
            )));
        }
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }

        let favoured = self
            .script
            .get(self.step)
            .map(|&b| b as usize)
            .unwrap_or(EOS as usize);
        self.step += 1;

        let mut logits = vec![0.0f32; VOCAB];
        // Runner-up keeps sampling non-trivial without leaving the script's alphabet.
        let runner_up = (favoured + 1) % 256;
        logits[favoured] = 6.0;
        logits[runner_up] = 5.0;
        Tensor::new(logits.as_slice(), &Device::Cpu)
    }
}

#[derive(Clone)]
pub struct FakeOptions {
    pub script: String,
    pub capacity: usize,
    pub context_len: usize,
    pub step_delay: Duration,
    /// Precisions whose load attempt fails.
    pub failing: Vec<Precision>,
    pub load_delay: Duration,
    pub encoder_fails: bool,
    /// Weight bytes the fake places under the attempt's budget.
    pub footprint: WeightFootprint,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            script: "fn main() { println!(\"hi\"); }".to_string(),
            capacity: 100_000,
            context_len: 4096,
            step_delay: Duration::ZERO,
            failing: Vec::new(),
            load_delay: Duration::ZERO,
            encoder_fails: false,
            footprint: WeightFootprint::uniform(GIB / 4, GIB / 16, 8),
        }
    }
}

pub struct FakeBackend {
    pub options: FakeOptions,
    pub stats: Arc<Stats>,
    pub attempts: Mutex<Vec<LoadAttempt>>,
    /// Held by a test to keep a load in progress.
    pub gate: Arc<Mutex<()>>,
}

impl FakeBackend {
    pub fn new(options: FakeOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            stats: Arc::new(Stats::default()),
            attempts: Mutex::new(Vec::new()),
            gate: Arc::new(Mutex::new(())),
        })
    }

    pub fn attempted(&self) -> Vec<Precision> {
        self.attempts.lock().iter().map(|a| a.precision).collect()
    }
}

impl ModelBackend for FakeBackend {
    fn load_encoder(&self, _settings: &LoadSettings) -> Result<EncoderBundle, LoadError> {
        self.stats.encoder_loads.fetch_add(1, Ordering::SeqCst);
        drop(self.gate.lock());
        if self.options.encoder_fails {
            return Err(LoadError::Tokenizer("tokenizer.json is corrupt".to_string()));
        }
        let prompt: Arc<dyn PromptFormat> = Arc::new(PlainFormat);
        Ok(EncoderBundle {
            encoder: Arc::new(ByteEncoder::new()),
            prompt,
        })
    }

    fn load_model(
        &self,
        attempt: &LoadAttempt,
        _settings: &LoadSettings,
    ) -> Result<Box<dyn LanguageModel>, LoadError> {
        self.attempts.lock().push(attempt.clone());
        if !self.options.load_delay.is_zero() {
            std::thread::sleep(self.options.load_delay);
        }
        if self.options.failing.contains(&attempt.precision) {
            return Err(LoadError::Device(format!(
                "{} weights do not fit",
                attempt.precision
            )));
        }
        let placement = plan_placement(attempt, &self.options.footprint)?;
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeModel {
            script: Arc::new(self.options.script.as_bytes().to_vec()),
            capacity: self.options.capacity,
            context_len: self.options.context_len,
            step_delay: self.options.step_delay,
            stats: self.stats.clone(),
            placement: placement.to_string(),
        }))
    }
}

pub struct FixedHardware(pub AcceleratorInventory);

impl HardwareSource for FixedHardware {
    fn detect(&self) -> AcceleratorInventory {
        self.0.clone()
    }

    fn snapshot(&self) -> Vec<GpuSnapshot> {
        self.0
            .devices
            .iter()
            .map(|d| GpuSnapshot {
                index: d.index,
                name: d.name.clone(),
                used_bytes: 0,
                total_bytes: d.total_bytes,
            })
            .collect()
    }
}

pub fn gpus(sizes_gib: &[u64]) -> AcceleratorInventory {
    let devices = sizes_gib
        .iter()
        .enumerate()
        .map(|(index, &gib)| DeviceDescriptor {
            index,
            id: format!("GPU-{}", index),
            name: format!("Fake GPU {}", index),
            kind: DeviceKind::Cuda,
            total_bytes: gib * GIB,
        })
        .collect();
    AcceleratorInventory::new(devices, Some(64 * GIB))
}

pub fn load_settings() -> LoadSettings {
    LoadSettings {
        model_id: "fake/coder".to_string(),
        load_in_4bit: true,
        host_fallback: false,
        ..LoadSettings::default()
    }
}

pub fn loader(backend: &Arc<FakeBackend>, inventory: AcceleratorInventory, settings: LoadSettings) -> ModelLoader {
    ModelLoader::new(
        backend.clone(),
        Arc::new(FixedHardware(inventory)),
        settings,
        BudgetSettings::default(),
    )
}

pub fn service_with(loader: ModelLoader, inventory: AcceleratorInventory, serve: ServeSettings) -> InferenceService {
    InferenceService::new(
        loader,
        Arc::new(FixedHardware(inventory)),
        GenerationDefaults::default(),
        &serve,
    )
}

/// A loaded model on one fake GPU, ready to serve.
pub async fn ready_service(options: FakeOptions) -> (InferenceService, Arc<FakeBackend>) {
    let backend = FakeBackend::new(options);
    let inventory = gpus(&[24]);
    let loader = loader(&backend, inventory.clone(), load_settings());
    loader.acquire().await.expect("fake model loads");
    (service_with(loader, inventory, ServeSettings::default()), backend)
}
