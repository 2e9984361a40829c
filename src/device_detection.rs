use serde::Serialize;
use std::process::Command;
use tracing::{debug, info, warn};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cuda,
    Metal,
}

/// One accelerator as seen at detection time. Not refreshed if the hardware changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AcceleratorInventory {
    pub count: usize,
    pub devices: Vec<DeviceDescriptor>,
    pub host_memory_bytes: Option<u64>,
}

impl AcceleratorInventory {
    pub fn new(devices: Vec<DeviceDescriptor>, host_memory_bytes: Option<u64>) -> Self {
        Self {
            count: devices.len(),
            devices,
            host_memory_bytes,
        }
    }

    pub fn host_only(host_memory_bytes: Option<u64>) -> Self {
        Self::new(Vec::new(), host_memory_bytes)
    }

    pub fn has_accelerator(&self) -> bool {
        self.count > 0
    }

    pub fn device(&self, index: usize) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.index == index)
    }
}

/// Live memory usage of one accelerator, reported by health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuSnapshot {
    pub index: usize,
    pub name: String,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Source of hardware facts. The system source shells out to vendor tools.
pub trait HardwareSource: Send + Sync {
    fn detect(&self) -> AcceleratorInventory;
    fn snapshot(&self) -> Vec<GpuSnapshot>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemHardware;

impl HardwareSource for SystemHardware {
    fn detect(&self) -> AcceleratorInventory {
        detect_available_devices()
    }

    fn snapshot(&self) -> Vec<GpuSnapshot> {
        query_nvidia_smi()
            .map(|rows| {
                rows.into_iter()
                    .map(|row| GpuSnapshot {
                        index: row.index,
                        name: row.name,
                        used_bytes: row.used_bytes,
                        total_bytes: row.total_bytes,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Detect available compute devices on the system
pub fn detect_available_devices() -> AcceleratorInventory {
    let mut devices = detect_cuda_devices().unwrap_or_default();

    if devices.is_empty() {
        devices = detect_metal_devices().unwrap_or_default();
    }

    let inventory = AcceleratorInventory::new(devices, get_system_memory());
    if inventory.has_accelerator() {
        for device in &inventory.devices {
            info!(
                "  GPU {}: {} | {:.1} GiB",
                device.index,
                device.name,
                device.total_bytes as f64 / (1024.0 * MIB as f64)
            );
        }
        info!("Detected {} accelerator(s)", inventory.count);
    } else {
        warn!("No accelerator detected, running on host memory only");
    }
    inventory
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SmiRow {
    index: usize,
    name: String,
    uuid: String,
    total_bytes: u64,
    used_bytes: u64,
}

fn query_nvidia_smi() -> Option<Vec<SmiRow>> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,uuid,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let rows = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout));
            if rows.is_empty() {
                None
            } else {
                Some(rows)
            }
        }
        Ok(output) => {
            debug!("nvidia-smi exited with {}", output.status);
            None
        }
        Err(e) => {
            debug!("nvidia-smi unavailable: {}", e);
            None
        }
    }
}

/// Parses `index, name, uuid, memory.total, memory.used` rows (MiB, no units).
fn parse_nvidia_smi(output: &str) -> Vec<SmiRow> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() < 5 {
                return None;
            }
            let index = parts[0].parse::<usize>().ok()?;
            let total_mib = parts[3].parse::<u64>().ok()?;
            let used_mib = parts[4].parse::<u64>().unwrap_or(0);
            Some(SmiRow {
                index,
                name: parts[1].to_string(),
                uuid: parts[2].to_string(),
                total_bytes: total_mib * MIB,
                used_bytes: used_mib * MIB,
            })
        })
        .collect()
}

/// Detect CUDA devices using nvidia-smi
fn detect_cuda_devices() -> Option<Vec<DeviceDescriptor>> {
    let rows = query_nvidia_smi()?;
    Some(
        rows.into_iter()
            .map(|row| {
                let id = if !row.uuid.is_empty() && row.uuid != "N/A" {
                    row.uuid
                } else {
                    format!("cuda:{}", row.index)
                };
                DeviceDescriptor {
                    index: row.index,
                    id,
                    name: row.name,
                    kind: DeviceKind::Cuda,
                    total_bytes: row.total_bytes,
                }
            })
            .collect(),
    )
}

/// Detect Metal devices on macOS
fn detect_metal_devices() -> Option<Vec<DeviceDescriptor>> {
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("system_profiler")
            .args(["SPDisplaysDataType", "-json"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let json_data: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        let displays = json_data["SPDisplaysDataType"].as_array()?;

        // Apple silicon shares system memory with the GPU.
        let unified = get_system_memory().unwrap_or(8 * 1024 * MIB);
        let devices: Vec<DeviceDescriptor> = displays
            .iter()
            .enumerate()
            .filter_map(|(index, display)| {
                let name = display["sppci_model"].as_str()?;
                let total_bytes = display["spdisplays_vram"]
                    .as_str()
                    .and_then(|vram| vram.split_whitespace().next())
                    .and_then(|num| num.parse::<u64>().ok())
                    .map(|mb| mb * MIB)
                    .unwrap_or(unified);
                Some(DeviceDescriptor {
                    index,
                    id: format!("metal:{}", index),
                    name: format!("Metal GPU ({})", name),
                    kind: DeviceKind::Metal,
                    total_bytes,
                })
            })
            .collect();

        if devices.is_empty() {
            None
        } else {
            Some(devices)
        }
    }

    #[cfg(not(target_os = "macos"))]
    None
}

/// Get total system memory
pub fn get_system_memory() -> Option<u64> {
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("sysctl").args(["-n", "hw.memsize"]).output().ok()?;
        return String::from_utf8_lossy(&output.stdout).trim().parse::<u64>().ok();
    }

    #[cfg(target_os = "linux")]
    {
        let content = std::fs::read_to_string("/proc/meminfo").ok()?;
        return parse_meminfo_total(&content);
    }

    #[cfg(target_os = "windows")]
    {
        let output = Command::new("wmic")
            .args(["computersystem", "get", "TotalPhysicalMemory", "/value"])
            .output()
            .ok()?;
        return parse_wmic_total(&String::from_utf8_lossy(&output.stdout));
    }

    #[allow(unreachable_code)]
    None
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_wmic_total(output: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("TotalPhysicalMemory="))
        .and_then(|bytes| bytes.trim().parse::<u64>().ok())
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_total(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.starts_with("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
