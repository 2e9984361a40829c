#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod budget;
pub mod config;
pub mod device_detection;
pub mod error;
pub mod generation;
pub mod loader;
pub mod server;
pub mod service;

pub use error::{ErrorKind, InferenceError, LoadError};
pub use generation::{FragmentStream, GenerateRequest, GenerationRequest, GenerationResult, StreamFragment};
pub use loader::{ModelLoader, Phase};
pub use service::{HealthReport, InferenceService, ServiceOutcome};
