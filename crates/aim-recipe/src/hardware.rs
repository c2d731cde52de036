//! Hardware Detector: accelerator inventory of the local host.
//!
//! Detection never fails. A host without a recognised GPU tool reports an
//! unknown profile (count 0, no architecture, no memory) and the selector
//! falls back to constraints and safe defaults.

use std::time::Duration;

use aim_common::process::run_command;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Default timeout for each inventory tool
pub const DETECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Known architecture tags, longest match first
const KNOWN_ARCHITECTURES: &[&str] = &[
    "MI355X", "MI325X", "MI300X", "MI300A", "MI250X", "MI250", "MI210", "MI100", "GB200", "B200",
    "H200", "H100", "A100", "L40S", "L40", "A10G", "L4",
];

/// Accelerator vendor, used to pick container device flags
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    /// ROCm devices
    Amd,
    /// CUDA devices
    Nvidia,
    /// Nothing detected
    #[default]
    Unknown,
}

impl std::fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Amd => write!(f, "amd"),
            Self::Nvidia => write!(f, "nvidia"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// What the detector found, produced fresh for every resolution
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct HardwareProfile {
    /// Number of accelerators (0 = unknown)
    pub accelerator_count: u32,
    /// Memory per accelerator in bytes, if known
    #[serde(default)]
    pub memory_per_accelerator_bytes: Option<u64>,
    /// Normalised architecture tag (`MI300X`), if known
    #[serde(default)]
    pub architecture: Option<String>,
    /// Device vendor
    #[serde(default)]
    pub vendor: GpuVendor,
}

impl HardwareProfile {
    /// Profile for a host where nothing could be detected
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Declared profile with a count and optional architecture
    pub fn new(accelerator_count: u32, architecture: Option<&str>) -> Self {
        let architecture = architecture
            .map(crate::types::normalize_arch)
            .filter(|a| !a.is_empty());
        let vendor = architecture
            .as_deref()
            .map(vendor_for_arch)
            .unwrap_or_default();
        Self {
            accelerator_count,
            memory_per_accelerator_bytes: None,
            architecture,
            vendor,
        }
    }

    /// Set per-accelerator memory
    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory_per_accelerator_bytes = Some(bytes);
        self
    }

    /// Set the vendor explicitly
    pub fn with_vendor(mut self, vendor: GpuVendor) -> Self {
        self.vendor = vendor;
        self
    }
}

/// Source of hardware profiles
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HardwareDetector: Send + Sync {
    /// Inspect the environment; never fails
    async fn detect(&self) -> HardwareProfile;
}

/// Returns a profile declared in configuration or on the command line
#[derive(Clone, Debug)]
pub struct StaticDetector {
    profile: HardwareProfile,
}

impl StaticDetector {
    /// Wrap a declared profile
    pub fn new(profile: HardwareProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl HardwareDetector for StaticDetector {
    async fn detect(&self) -> HardwareProfile {
        self.profile.clone()
    }
}

/// Probes `rocm-smi`, then `nvidia-smi`, then visible-device variables.
#[derive(Clone, Debug)]
pub struct SystemDetector {
    timeout: Duration,
}

impl Default for SystemDetector {
    fn default() -> Self {
        Self {
            timeout: DETECT_TIMEOUT,
        }
    }
}

impl SystemDetector {
    /// Detector with a custom per-tool timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn probe_rocm(&self) -> Option<HardwareProfile> {
        let out = run_command(
            Command::new("rocm-smi").args(["--showproductname", "--showmeminfo", "vram", "--json"]),
            self.timeout,
            "rocm-smi inventory",
        )
        .await
        .ok()?;
        parse_rocm_smi_json(&out.stdout)
    }

    async fn probe_nvidia(&self) -> Option<HardwareProfile> {
        let out = run_command(
            Command::new("nvidia-smi").args([
                "--query-gpu=name,memory.total",
                "--format=csv,noheader,nounits",
            ]),
            self.timeout,
            "nvidia-smi inventory",
        )
        .await
        .ok()?;
        parse_nvidia_smi_csv(&out.stdout)
    }
}

#[async_trait]
impl HardwareDetector for SystemDetector {
    async fn detect(&self) -> HardwareProfile {
        let profile = match self.probe_rocm().await {
            Some(p) => p,
            None => match self.probe_nvidia().await {
                Some(p) => p,
                None => profile_from_env(|k| std::env::var(k).ok()),
            },
        };
        info!(
            accelerators = profile.accelerator_count,
            architecture = ?profile.architecture,
            memory_bytes = ?profile.memory_per_accelerator_bytes,
            vendor = %profile.vendor,
            "Detected hardware"
        );
        profile
    }
}

// =============================================================================
// Output parsing
// =============================================================================

/// Map a product name such as `AMD Instinct MI300X` to an architecture tag.
pub fn architecture_from_product(name: &str) -> Option<String> {
    let upper = name.to_uppercase();
    KNOWN_ARCHITECTURES
        .iter()
        .find(|arch| upper.contains(*arch))
        .map(|arch| arch.to_string())
}

fn vendor_for_arch(arch: &str) -> GpuVendor {
    if arch.starts_with("MI") {
        GpuVendor::Amd
    } else if KNOWN_ARCHITECTURES.contains(&arch) {
        GpuVendor::Nvidia
    } else {
        GpuVendor::Unknown
    }
}

/// Parse `rocm-smi --showproductname --showmeminfo vram --json`.
///
/// Output is an object keyed by `card0`, `card1`, ... Each card carries
/// its product name under "Card series" (or "Card SKU") and VRAM in bytes
/// under "VRAM Total Memory (B)".
pub fn parse_rocm_smi_json(stdout: &str) -> Option<HardwareProfile> {
    let value: serde_json::Value = serde_json::from_str(stdout).ok()?;
    let cards: Vec<&serde_json::Map<String, serde_json::Value>> = value
        .as_object()?
        .iter()
        .filter(|(k, _)| k.starts_with("card"))
        .filter_map(|(_, v)| v.as_object())
        .collect();
    if cards.is_empty() {
        return None;
    }

    let field = |card: &serde_json::Map<String, serde_json::Value>, names: &[&str]| {
        names.iter().find_map(|n| {
            card.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(n))
                .and_then(|(_, v)| v.as_str().map(str::to_string))
        })
    };

    let architecture = cards.iter().find_map(|card| {
        field(card, &["Card series", "Card SKU", "Device Name", "Card model"])
            .and_then(|name| architecture_from_product(&name))
    });
    let memory = cards
        .iter()
        .filter_map(|card| field(card, &["VRAM Total Memory (B)"]))
        .filter_map(|s| s.trim().parse::<u64>().ok())
        .min();

    Some(HardwareProfile {
        accelerator_count: cards.len() as u32,
        memory_per_accelerator_bytes: memory,
        architecture,
        vendor: GpuVendor::Amd,
    })
}

/// Parse `nvidia-smi --query-gpu=name,memory.total --format=csv,noheader,nounits`.
///
/// One line per GPU; memory is in MiB.
pub fn parse_nvidia_smi_csv(stdout: &str) -> Option<HardwareProfile> {
    let rows: Vec<(&str, Option<u64>)> = stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let mut parts = line.rsplitn(2, ',');
            let mem = parts.next().and_then(|m| m.trim().parse::<u64>().ok());
            let name = parts.next().unwrap_or(line).trim();
            (name, mem)
        })
        .collect();
    if rows.is_empty() {
        return None;
    }

    Some(HardwareProfile {
        accelerator_count: rows.len() as u32,
        memory_per_accelerator_bytes: rows
            .iter()
            .filter_map(|(_, m)| *m)
            .min()
            .map(|mib| mib * 1024 * 1024),
        architecture: rows
            .iter()
            .find_map(|(name, _)| architecture_from_product(name)),
        vendor: GpuVendor::Nvidia,
    })
}

/// Count devices from visible-device variables when no tool is available.
pub fn profile_from_env(lookup: impl Fn(&str) -> Option<String>) -> HardwareProfile {
    let count = |var: &str| {
        lookup(var).map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty() && *s != "-1")
                .count() as u32
        })
    };

    for (var, vendor) in [
        ("HIP_VISIBLE_DEVICES", GpuVendor::Amd),
        ("ROCR_VISIBLE_DEVICES", GpuVendor::Amd),
        ("CUDA_VISIBLE_DEVICES", GpuVendor::Nvidia),
    ] {
        if let Some(n) = count(var) {
            debug!(var, count = n, "Using visible-device fallback");
            return HardwareProfile {
                accelerator_count: n,
                vendor: if n > 0 { vendor } else { GpuVendor::Unknown },
                ..HardwareProfile::default()
            };
        }
    }
    HardwareProfile::unknown()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_names_map_to_tags() {
        assert_eq!(
            architecture_from_product("AMD Instinct MI300X").as_deref(),
            Some("MI300X")
        );
        assert_eq!(
            architecture_from_product("NVIDIA H100 80GB HBM3").as_deref(),
            Some("H100")
        );
        assert_eq!(architecture_from_product("Instinct MI250X/MI250").as_deref(), Some("MI250X"));
        assert_eq!(architecture_from_product("Radeon RX 7900"), None);
    }

    #[test]
    fn parses_rocm_smi() {
        let json = r#"{
            "card0": {"Card series": "AMD Instinct MI300X OAM", "VRAM Total Memory (B)": "205822885888"},
            "card1": {"Card series": "AMD Instinct MI300X OAM", "VRAM Total Memory (B)": "205822885888"},
            "system": {"Driver version": "6.8.5"}
        }"#;
        let profile = parse_rocm_smi_json(json).unwrap();
        assert_eq!(profile.accelerator_count, 2);
        assert_eq!(profile.architecture.as_deref(), Some("MI300X"));
        assert_eq!(profile.memory_per_accelerator_bytes, Some(205_822_885_888));
        assert_eq!(profile.vendor, GpuVendor::Amd);
    }

    #[test]
    fn rocm_smi_without_cards_is_none() {
        assert!(parse_rocm_smi_json(r#"{"system": {}}"#).is_none());
        assert!(parse_rocm_smi_json("not json").is_none());
    }

    #[test]
    fn parses_nvidia_smi() {
        let csv = "NVIDIA H100 80GB HBM3, 81559\nNVIDIA H100 80GB HBM3, 81559\n";
        let profile = parse_nvidia_smi_csv(csv).unwrap();
        assert_eq!(profile.accelerator_count, 2);
        assert_eq!(profile.architecture.as_deref(), Some("H100"));
        assert_eq!(profile.memory_per_accelerator_bytes, Some(81_559 * 1024 * 1024));
        assert_eq!(profile.vendor, GpuVendor::Nvidia);
        assert!(parse_nvidia_smi_csv("\n").is_none());
    }

    #[test]
    fn env_fallback_counts_devices() {
        let profile = profile_from_env(|k| (k == "HIP_VISIBLE_DEVICES").then(|| "0,1,2,3".to_string()));
        assert_eq!(profile.accelerator_count, 4);
        assert_eq!(profile.vendor, GpuVendor::Amd);

        let profile = profile_from_env(|k| (k == "CUDA_VISIBLE_DEVICES").then(String::new));
        assert_eq!(profile.accelerator_count, 0);
        assert_eq!(profile.vendor, GpuVendor::Unknown);

        assert_eq!(profile_from_env(|_| None), HardwareProfile::unknown());
    }

    #[test]
    fn declared_profiles_infer_vendor() {
        assert_eq!(HardwareProfile::new(8, Some("mi300x")).vendor, GpuVendor::Amd);
        assert_eq!(HardwareProfile::new(8, Some("H100")).vendor, GpuVendor::Nvidia);
        assert_eq!(HardwareProfile::new(0, None).architecture, None);
    }

    #[tokio::test]
    async fn static_detector_returns_declared_profile() {
        let profile = HardwareProfile::new(4, Some("MI300X")).with_memory(192 << 30);
        let detector = StaticDetector::new(profile.clone());
        assert_eq!(detector.detect().await, profile);
    }

    #[tokio::test]
    async fn detector_trait_can_be_mocked() {
        let mut mock = MockHardwareDetector::new();
        mock.expect_detect()
            .returning(|| HardwareProfile::new(2, Some("MI250")));
        assert_eq!(mock.detect().await.accelerator_count, 2);
    }
}
