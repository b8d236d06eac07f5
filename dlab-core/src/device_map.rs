use std::{fmt, str::FromStr};

use candle_core::utils::{cuda_is_available, metal_is_available};
use serde::{Deserialize, Serialize};

/// Where the user asked the lab to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DevicePreference {
    /// Pick a concrete device. Explicit choices pass through untouched, `Auto`
    /// walks CUDA, then Metal, then falls back to the CPU.
    pub fn resolve(self) -> ResolvedDevice {
        match self {
            Self::Cpu => ResolvedDevice::Cpu,
            Self::Cuda(ordinal) => ResolvedDevice::Cuda(ordinal),
            Self::Metal(ordinal) => ResolvedDevice::Metal(ordinal),
            Self::Auto if cuda_is_available() => ResolvedDevice::Cuda(0),
            Self::Auto if metal_is_available() => ResolvedDevice::Metal(0),
            Self::Auto => ResolvedDevice::Cpu,
        }
    }
}

/// Resolve an optional preference, treating a missing one as `auto`.
pub fn resolve_device(preference: Option<DevicePreference>) -> ResolvedDevice {
    preference.unwrap_or_default().resolve()
}

impl FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| format!("invalid device ordinal in {s:?}"))?;
                (kind, Some(ordinal))
            }
            None => (s.as_str(), None),
        };
        match (kind, ordinal) {
            ("" | "auto", None) => Ok(Self::Auto),
            ("cpu", None) => Ok(Self::Cpu),
            ("cuda" | "gpu", ordinal) => Ok(Self::Cuda(ordinal.unwrap_or(0))),
            ("mps" | "metal", ordinal) => Ok(Self::Metal(ordinal.unwrap_or(0))),
            _ => Err(format!(
                "unknown device {s:?}, expected one of auto, cpu, cuda[:N], mps, metal[:N]"
            )),
        }
    }
}

/// A concrete device choice. Displayed with the conventional short names
/// (`cpu`, `cuda`, `cuda:1`, `mps`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolvedDevice {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl ResolvedDevice {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for ResolvedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(0) => write!(f, "cuda"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(0) => write!(f, "mps"),
            Self::Metal(ordinal) => write!(f, "mps:{ordinal}"),
        }
    }
}
