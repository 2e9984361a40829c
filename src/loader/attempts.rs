use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use super::backend::{LanguageModel, ModelBackend};
use crate::budget::{BudgetPlan, MemoryBudget, ShardingStrategy};
use crate::config::LoadSettings;
use crate::device_detection::{AcceleratorInventory, DeviceKind};
use crate::error::LoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 4-bit GGUF weights.
    Quantized,
    Half,
    Full,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Precision::Quantized => "quantized",
            Precision::Half => "half",
            Precision::Full => "full",
        };
        f.write_str(name)
    }
}

/// Where an attempt puts the weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    Host,
    Accelerator { index: usize, kind: DeviceKind },
    /// Blocks spread over these accelerators, with overflow on the host.
    Balanced { kind: DeviceKind, devices: Vec<usize> },
}

fn device_name(kind: DeviceKind, index: usize) -> String {
    match kind {
        DeviceKind::Cuda => format!("cuda:{}", index),
        DeviceKind::Metal => format!("metal:{}", index),
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Host => f.write_str("cpu"),
            Target::Accelerator { index, kind } => f.write_str(&device_name(*kind, *index)),
            Target::Balanced { kind, devices } => {
                let names: Vec<String> = devices.iter().map(|index| device_name(*kind, *index)).collect();
                f.write_str(&names.join("+"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadAttempt {
    pub precision: Precision,
    pub strategy: ShardingStrategy,
    pub target: Target,
    /// Per-slot ceilings the weights are placed under, for balanced targets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<MemoryBudget>,
}

impl fmt::Display for LoadAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} ({})", self.precision, self.target, self.strategy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub attempt: LoadAttempt,
    pub error: String,
}

/// What the last acquisition tried and what it settled on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub succeeded: Option<LoadAttempt>,
    pub failures: Vec<AttemptFailure>,
}

/// Ordered fallback chain for the detected hardware. The first entry is the
/// preferred configuration; later entries trade speed or memory for safety.
pub fn plan_attempts(
    inventory: &AcceleratorInventory,
    plan: &BudgetPlan,
    settings: &LoadSettings,
) -> Vec<LoadAttempt> {
    let host = LoadAttempt {
        precision: Precision::Full,
        strategy: ShardingStrategy::HostOnly,
        target: Target::Host,
        budget: None,
    };

    let (target, budget) = match (plan.strategy, &plan.budget) {
        (ShardingStrategy::SingleDevice(index), _) => match inventory.device(index) {
            Some(device) => (
                Target::Accelerator {
                    index,
                    kind: device.kind,
                },
                None,
            ),
            None => return vec![host],
        },
        (ShardingStrategy::AutoBalance, Some(budget)) => {
            let devices: Vec<usize> = budget
                .accelerators()
                .map(|(index, _)| index)
                .filter(|index| inventory.device(*index).is_some())
                .collect();
            let Some(kind) = devices.first().and_then(|index| inventory.device(*index)).map(|d| d.kind) else {
                return vec![host];
            };
            (Target::Balanced { kind, devices }, Some(budget.clone()))
        }
        _ => return vec![host],
    };

    let mut attempts = Vec::with_capacity(3);
    if settings.load_in_4bit {
        attempts.push(LoadAttempt {
            precision: Precision::Quantized,
            strategy: plan.strategy,
            target: target.clone(),
            budget: budget.clone(),
        });
    }
    attempts.push(LoadAttempt {
        precision: Precision::Half,
        strategy: plan.strategy,
        target,
        budget,
    });
    if settings.host_fallback {
        attempts.push(host);
    }
    attempts
}

/// Tries each attempt in order and keeps the first model that loads.
pub fn run_attempts(
    backend: &dyn ModelBackend,
    attempts: &[LoadAttempt],
    settings: &LoadSettings,
) -> (Result<(Box<dyn LanguageModel>, LoadAttempt), LoadError>, Vec<AttemptFailure>) {
    let mut failures = Vec::new();

    for attempt in attempts {
        info!("Loading {} as {}", settings.model_id, attempt);
        match backend.load_model(attempt, settings) {
            Ok(model) => {
                info!("Model loaded as {}", attempt);
                return (Ok((model, attempt.clone())), failures);
            }
            Err(e) => {
                warn!("Load attempt {} failed: {}", attempt, e);
                failures.push(AttemptFailure {
                    attempt: attempt.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    let messages = if failures.is_empty() {
        vec!["no load attempts were planned".to_string()]
    } else {
        failures
            .iter()
            .map(|failure| format!("{}: {}", failure.attempt, failure.error))
            .collect()
    };
    (Err(LoadError::Exhausted(messages)), failures)
}
