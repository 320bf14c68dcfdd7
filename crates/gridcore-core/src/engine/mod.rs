//! Simulation engine capability surface.
//!
//! The driver and verifier see engines only through [`SimulationEngine`]:
//! step, snapshot, restore, step size. Two values satisfying the trait are
//! wired per stream, a **production** engine on the selected hardware
//! platform and a **reference** engine used only for verification, and
//! they are passed around explicitly, never through global state.
//!
//! The stream's downloaded files carry three documents:
//!
//! - `system.json`: particles, harmonic bonds, optional thermostat;
//! - `integrator.json`: step size;
//! - `state.json`: the serialized [`SimulationState`] to resume from.

mod harmonic;

pub use harmonic::HarmonicEngine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::FileMap;

/// Engine failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested compute platform is not compiled into this build.
    #[error("platform {0} is not available in this build")]
    PlatformUnavailable(Platform),

    /// A required stream file is absent.
    #[error("missing required file: {0}")]
    MissingFile(String),

    /// A stream document failed to parse or validate.
    #[error("invalid document {name}: {reason}")]
    InvalidDocument {
        /// Document filename.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// System and state disagree (for example particle counts).
    #[error("inconsistent system and state: {0}")]
    Inconsistent(String),
}

/// Compute platforms a production engine can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Platform {
    /// Host CPU.
    Cpu,
    /// NVIDIA CUDA device.
    Cuda,
    /// OpenCL device.
    OpenCl,
    /// The slow deterministic reference platform.
    Reference,
}

impl Platform {
    /// Returns the canonical platform name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Cuda => "CUDA",
            Self::OpenCl => "OpenCL",
            Self::Reference => "Reference",
        }
    }

    /// Parses a platform name, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns the offending string if it names no known platform.
    pub fn parse(name: &str) -> Result<Self, String> {
        match name.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda),
            "opencl" => Ok(Self::OpenCl),
            "reference" => Ok(Self::Reference),
            _ => Err(name.to_string()),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Arithmetic precision of a platform binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    /// Single precision, the production default.
    #[default]
    Single,
    /// Double precision, used by the reference platform.
    Double,
}

/// Device-binding properties honored at engine construction.
#[derive(Debug, Clone, Default)]
pub struct EngineProperties {
    /// Device index within the platform.
    pub device_index: Option<u32>,
    /// Platform index (OpenCL).
    pub platform_index: Option<u32>,
    /// Arithmetic precision.
    pub precision: Precision,
}

/// Which state components a snapshot must carry.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotMask {
    /// Include positions.
    pub positions: bool,
    /// Include velocities.
    pub velocities: bool,
    /// Include forces.
    pub forces: bool,
    /// Include the potential energy scalar.
    pub energy: bool,
}

impl SnapshotMask {
    /// Everything: positions, velocities, forces, energy.
    pub const FULL: Self = Self {
        positions: true,
        velocities: true,
        forces: true,
        energy: true,
    };

    /// Energy and forces only, as the verifier requests from the
    /// reference engine.
    pub const ENERGY_FORCES: Self = Self {
        positions: false,
        velocities: false,
        forces: true,
        energy: true,
    };
}

/// A snapshot of the simulation, also the checkpoint document format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationState {
    /// Simulation time in picoseconds.
    pub time_ps: f64,
    /// Periodic box vectors, rows are the three box edges (nm).
    pub box_vectors: [[f64; 3]; 3],
    /// Particle positions (nm).
    pub positions: Vec<[f64; 3]>,
    /// Particle velocities (nm/ps).
    pub velocities: Vec<[f64; 3]>,
    /// Per-particle forces (kJ/mol/nm), present when the mask asked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forces: Option<Vec<[f64; 3]>>,
    /// Potential energy (kJ/mol), present when the mask asked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub potential_energy: Option<f64>,
}

impl SimulationState {
    /// Serializes the state to the checkpoint text format.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidDocument`] if serialization fails.
    pub fn to_document(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec_pretty(self).map_err(|e| EngineError::InvalidDocument {
            name: "state.json".to_string(),
            reason: e.to_string(),
        })
    }
}

/// One particle of the simulated system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Particle {
    /// Mass in atomic mass units.
    pub mass: f64,
}

/// A harmonic bond between two particles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bond {
    /// First particle index.
    pub i: usize,
    /// Second particle index.
    pub j: usize,
    /// Equilibrium length (nm).
    pub length: f64,
    /// Spring constant (kJ/mol/nm^2).
    pub k: f64,
}

/// Stochastic thermostat parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thermostat {
    /// Bath temperature (K).
    pub temperature: f64,
    /// Collision rate (1/ps).
    pub collision_rate: f64,
}

/// The simulated system: force composition and masses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSpec {
    /// Particles in index order.
    pub particles: Vec<Particle>,
    /// Harmonic bonds.
    #[serde(default)]
    pub bonds: Vec<Bond>,
    /// Optional stochastic thermostat.
    #[serde(default)]
    pub thermostat: Option<Thermostat>,
}

/// Integrator parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratorSpec {
    /// Step size in picoseconds.
    pub step_size_ps: f64,
}

/// Parses one JSON document out of the stream's file map.
///
/// # Errors
///
/// [`EngineError::MissingFile`] if absent, [`EngineError::InvalidDocument`]
/// if it does not parse.
pub fn parse_document<T: DeserializeOwned>(files: &FileMap, name: &str) -> Result<T, EngineError> {
    let data = files
        .get(name)
        .ok_or_else(|| EngineError::MissingFile(name.to_string()))?;
    serde_json::from_slice(data).map_err(|e| EngineError::InvalidDocument {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// The capability set every engine variant satisfies.
pub trait SimulationEngine {
    /// The platform this engine is bound to.
    fn platform(&self) -> Platform;

    /// Advances the integrator by `n` steps.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on integration failure.
    fn step(&mut self, n: u64) -> Result<(), EngineError>;

    /// Captures the requested state components.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the state cannot be produced.
    fn snapshot(&self, mask: SnapshotMask) -> Result<SimulationState, EngineError>;

    /// Replaces the engine state with `state`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Inconsistent`] if the state does not fit
    /// the system.
    fn restore(&mut self, state: &SimulationState) -> Result<(), EngineError>;

    /// The integrator step size in picoseconds.
    fn step_size_ps(&self) -> f64;
}

/// One enumerable compute device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Owning platform.
    pub platform: Platform,
    /// Device index within the platform.
    pub index: u32,
    /// Human-readable description.
    pub description: String,
}

/// Enumerates the compute devices available to this build.
#[must_use]
pub fn enumerate_devices() -> Vec<DeviceInfo> {
    let threads = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    vec![DeviceInfo {
        platform: Platform::Cpu,
        index: 0,
        description: format!("host CPU ({threads} hardware threads)"),
    }]
}
