mod coordinator;
pub mod decode;
pub mod prompt;
pub mod request;
pub mod sampling;
pub mod stream;

pub use coordinator::{GenerateOutcome, GenerationCoordinator};
pub use decode::{IncrementalDecoder, StopReason};
pub use prompt::{ChatTemplateFormat, PlainFormat, PromptFormat, RenderedPrompt};
pub use request::{GenerateRequest, GenerationRequest, GenerationResult, SamplingParams};
pub use stream::{FragmentStream, StreamFragment};
