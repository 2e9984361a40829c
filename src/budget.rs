//! Per-device memory ceilings and sharding strategy.
//!
//! The reserve left on every accelerator has to cover the decode working set
//! (KV cache and activations grow with sequence length and model width), not
//! only the static weights. It is a tunable margin, not a computed optimum.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::config::BudgetSettings;
use crate::device_detection::AcceleratorInventory;

pub const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "device", rename_all = "snake_case")]
pub enum ShardingStrategy {
    HostOnly,
    SingleDevice(usize),
    AutoBalance,
}

impl fmt::Display for ShardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingStrategy::HostOnly => write!(f, "host-only"),
            ShardingStrategy::SingleDevice(index) => write!(f, "single-device(cuda:{})", index),
            ShardingStrategy::AutoBalance => write!(f, "auto-balance"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySlot {
    Accelerator(usize),
    Host,
}

impl fmt::Display for MemorySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySlot::Accelerator(index) => write!(f, "{}", index),
            MemorySlot::Host => write!(f, "cpu"),
        }
    }
}

/// Usable bytes per slot. Accelerator ceilings stay strictly below capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryBudget {
    ceilings: BTreeMap<MemorySlot, u64>,
}

impl MemoryBudget {
    pub fn ceiling(&self, slot: MemorySlot) -> Option<u64> {
        self.ceilings.get(&slot).copied()
    }

    pub fn host_ceiling(&self) -> Option<u64> {
        self.ceiling(MemorySlot::Host)
    }

    pub fn accelerators(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.ceilings.iter().filter_map(|(slot, bytes)| match slot {
            MemorySlot::Accelerator(index) => Some((*index, *bytes)),
            MemorySlot::Host => None,
        })
    }

    /// Sum of every ceiling, host overflow included.
    pub fn total(&self) -> u64 {
        self.ceilings.values().sum()
    }

    pub fn len(&self) -> usize {
        self.ceilings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ceilings.is_empty()
    }

    fn insert(&mut self, slot: MemorySlot, bytes: u64) {
        self.ceilings.insert(slot, bytes);
    }
}

impl fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ceilings
            .iter()
            .map(|(slot, bytes)| format!("{}: {}GiB", slot, bytes / GIB))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetPlan {
    pub strategy: ShardingStrategy,
    pub budget: Option<MemoryBudget>,
}

pub fn plan(inventory: &AcceleratorInventory, settings: &BudgetSettings) -> BudgetPlan {
    match inventory.devices.as_slice() {
        [] => BudgetPlan {
            strategy: ShardingStrategy::HostOnly,
            budget: None,
        },
        [only] => BudgetPlan {
            strategy: ShardingStrategy::SingleDevice(only.index),
            budget: None,
        },
        devices => {
            let mut budget = MemoryBudget::default();
            for device in devices {
                budget.insert(
                    MemorySlot::Accelerator(device.index),
                    device_ceiling(device.total_bytes, settings.reserve_bytes),
                );
            }
            let host = match inventory.host_memory_bytes {
                Some(host_total) => settings.host_overflow_bytes.min(host_total),
                None => settings.host_overflow_bytes,
            };
            budget.insert(MemorySlot::Host, host);
            info!("Multi-GPU mode across {} devices, max memory {}", devices.len(), budget);
            BudgetPlan {
                strategy: ShardingStrategy::AutoBalance,
                budget: Some(budget),
            }
        }
    }
}

fn device_ceiling(total: u64, reserve: u64) -> u64 {
    if total > reserve && reserve > 0 {
        total - reserve
    } else {
        total / 2
    }
}
