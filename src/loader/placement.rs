//! Decoder block placement under a memory budget.
//!
//! Blocks go to the accelerators in index order, each taking a share of the
//! block bytes proportional to its ceiling. The embedding, final norm and
//! output head sit on the first accelerator and count against its ceiling.
//! Whatever the accelerators cannot hold overflows to the host slot.

use std::fmt;
use std::ops::Range;
use tracing::debug;

use super::attempts::{LoadAttempt, Target};
use crate::budget::MemoryBudget;
use crate::device_detection::DeviceKind;
use crate::error::LoadError;

/// Weight bytes of a decoder: the fixed part (embedding, final norm, output
/// head) and one entry per block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightFootprint {
    pub fixed_bytes: u64,
    pub layer_bytes: Vec<u64>,
}

impl WeightFootprint {
    pub fn uniform(fixed_bytes: u64, per_layer: u64, layers: usize) -> Self {
        Self {
            fixed_bytes,
            layer_bytes: vec![per_layer; layers],
        }
    }

    pub fn layer_count(&self) -> usize {
        self.layer_bytes.len()
    }

    pub fn layers_total(&self) -> u64 {
        self.layer_bytes.iter().sum()
    }

    pub fn total(&self) -> u64 {
        self.fixed_bytes + self.layers_total()
    }
}

/// A contiguous run of blocks on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub target: Target,
    pub layers: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPlacement {
    /// Holds the embedding, final norm and output head.
    pub head: Target,
    pub stages: Vec<Stage>,
}

impl LayerPlacement {
    pub fn single(target: Target, layers: usize) -> Self {
        Self {
            stages: vec![Stage {
                target: target.clone(),
                layers: 0..layers,
            }],
            head: target,
        }
    }

    /// Placed block count; equals the footprint's when placement succeeded.
    pub fn layer_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.layers.len()).sum()
    }
}

impl fmt::Display for LayerPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stages.iter().all(|stage| stage.target == self.head) {
            return write!(f, "{}", self.head);
        }
        let parts: Vec<String> = self
            .stages
            .iter()
            .map(|stage| format!("{}[{}..{}]", stage.target, stage.layers.start, stage.layers.end))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

/// Where the weights of `attempt` go. Balanced targets are split under the
/// attempt's budget; every other target takes all blocks.
pub fn plan_placement(attempt: &LoadAttempt, footprint: &WeightFootprint) -> Result<LayerPlacement, LoadError> {
    match (&attempt.target, &attempt.budget) {
        (Target::Balanced { kind, .. }, Some(budget)) => balance_layers(footprint, budget, *kind),
        (Target::Balanced { .. }, None) => Err(LoadError::Device(format!(
            "{} has no memory budget to balance against",
            attempt.target
        ))),
        (target, _) => Ok(LayerPlacement::single(target.clone(), footprint.layer_count())),
    }
}

pub fn balance_layers(
    footprint: &WeightFootprint,
    budget: &MemoryBudget,
    kind: DeviceKind,
) -> Result<LayerPlacement, LoadError> {
    let exceeds = || LoadError::ExceedsBudget {
        needed: footprint.total(),
        ceiling: budget.total(),
    };
    let devices: Vec<(usize, u64)> = budget.accelerators().collect();
    let Some(&(first, first_ceiling)) = devices.first() else {
        return Err(LoadError::Device("memory budget lists no accelerators".to_string()));
    };
    if footprint.fixed_bytes > first_ceiling {
        return Err(exceeds());
    }

    let rooms: Vec<u64> = devices
        .iter()
        .enumerate()
        .map(|(position, &(_, ceiling))| {
            if position == 0 {
                ceiling - footprint.fixed_bytes
            } else {
                ceiling
            }
        })
        .collect();
    let room_total: u64 = rooms.iter().sum();
    let layers_total = footprint.layers_total();
    let fits = layers_total <= room_total;

    let mut stages = Vec::new();
    let mut next = 0;
    for (position, (&(index, _), &room)) in devices.iter().zip(&rooms).enumerate() {
        let last = position + 1 == devices.len();
        // Short budgets fill each device to its ceiling.
        let share = if fits && !last {
            (layers_total as u128 * room as u128 / room_total.max(1) as u128) as u64
        } else {
            room
        };

        let start = next;
        let mut used = 0u64;
        while let Some(&bytes) = footprint.layer_bytes.get(next) {
            if used + bytes > room || used + bytes / 2 > share {
                break;
            }
            used += bytes;
            next += 1;
        }
        if next > start {
            debug!("Blocks {}..{} ({} bytes) on device {}", start, next, used, index);
            stages.push(Stage {
                target: Target::Accelerator { index, kind },
                layers: start..next,
            });
        }
    }

    let count = footprint.layer_count();
    if next < count {
        let rest: u64 = footprint.layer_bytes[next..].iter().sum();
        match budget.host_ceiling() {
            Some(host) if rest <= host => {
                debug!("Blocks {}..{} ({} bytes) overflow to the host", next, count, rest);
                stages.push(Stage {
                    target: Target::Host,
                    layers: next..count,
                });
            }
            _ => return Err(exceeds()),
        }
    }

    Ok(LayerPlacement {
        head: Target::Accelerator { index: first, kind },
        stages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{plan, ShardingStrategy, GIB};
    use crate::config::BudgetSettings;
    use crate::device_detection::{AcceleratorInventory, DeviceDescriptor};
    use crate::loader::Precision;

    fn budget_for(gpus: &[u64]) -> MemoryBudget {
        let devices = gpus
            .iter()
            .enumerate()
            .map(|(index, gib)| DeviceDescriptor {
                index,
                id: format!("GPU-{}", index),
                name: format!("GPU {}", index),
                kind: DeviceKind::Cuda,
                total_bytes: gib * GIB,
            })
            .collect();
        let inventory = AcceleratorInventory::new(devices, Some(64 * GIB));
        plan(&inventory, &BudgetSettings::default()).budget.unwrap()
    }

    fn cuda(index: usize) -> Target {
        Target::Accelerator {
            index,
            kind: DeviceKind::Cuda,
        }
    }

    #[test]
    fn test_splits_across_devices_in_proportion() {
        // {0: 9GiB, 1: 9GiB, cpu: 16GiB}; 15GiB of weights fit neither GPU alone.
        let budget = budget_for(&[12, 12]);
        let footprint = WeightFootprint::uniform(GIB, GIB / 2, 28);
        let placement = balance_layers(&footprint, &budget, DeviceKind::Cuda).unwrap();

        assert_eq!(placement.head, cuda(0));
        assert_eq!(
            placement.stages,
            vec![
                Stage {
                    target: cuda(0),
                    layers: 0..13
                },
                Stage {
                    target: cuda(1),
                    layers: 13..28
                },
            ]
        );
        assert_eq!(placement.layer_count(), 28);
        assert_eq!(placement.to_string(), "cuda:0[0..13], cuda:1[13..28]");
    }

    #[test]
    fn test_overflow_goes_to_host() {
        // {0: 5GiB, 1: 5GiB, cpu: 16GiB}
        let budget = budget_for(&[8, 8]);
        let footprint = WeightFootprint::uniform(GIB, GIB / 2, 20);
        let placement = balance_layers(&footprint, &budget, DeviceKind::Cuda).unwrap();

        let layers: Vec<(Target, Range<usize>)> = placement
            .stages
            .iter()
            .map(|stage| (stage.target.clone(), stage.layers.clone()))
            .collect();
        assert_eq!(
            layers,
            vec![(cuda(0), 0..8), (cuda(1), 8..18), (Target::Host, 18..20)]
        );
    }

    #[test]
    fn test_weights_beyond_whole_budget_are_rejected() {
        let budget = budget_for(&[8, 8]);
        let footprint = WeightFootprint::uniform(GIB, GIB, 40);
        let err = balance_layers(&footprint, &budget, DeviceKind::Cuda).unwrap_err();
        assert!(matches!(
            err,
            LoadError::ExceedsBudget { needed, ceiling } if needed == 41 * GIB && ceiling == 26 * GIB
        ));
    }

    #[test]
    fn test_fixed_weights_must_fit_first_device() {
        let budget = budget_for(&[8, 8]);
        let footprint = WeightFootprint::uniform(6 * GIB, GIB, 2);
        assert!(matches!(
            balance_layers(&footprint, &budget, DeviceKind::Cuda),
            Err(LoadError::ExceedsBudget { .. })
        ));
    }

    #[test]
    fn test_unbalanced_targets_take_every_block() {
        let attempt = LoadAttempt {
            precision: Precision::Half,
            strategy: ShardingStrategy::SingleDevice(0),
            target: cuda(0),
            budget: None,
        };
        let placement = plan_placement(&attempt, &WeightFootprint::uniform(GIB, GIB, 32)).unwrap();
        assert_eq!(placement, LayerPlacement::single(cuda(0), 32));
        assert_eq!(placement.to_string(), "cuda:0");
    }
}
