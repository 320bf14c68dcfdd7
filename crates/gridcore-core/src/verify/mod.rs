//! Cross-engine verification gate.
//!
//! Every state the driver intends to emit passes three checks:
//!
//! 1. every component of positions, velocities, forces, and the potential
//!    energy scalar is finite;
//! 2. engine-level sanity predicates hold (positive-definite box,
//!    non-negative time);
//! 3. the production state, restored into the reference engine, produces
//!    energies and per-atom forces that agree within relative tolerances.
//!
//! A failure is fatal for the current stream: the supervisor reports it
//! through the stop operation and attempts a fresh assignment.

use thiserror::Error;
use tracing::debug;

use crate::engine::{SimulationEngine, SimulationState, SnapshotMask};

/// Verification failures, fatal for the stream.
#[derive(Debug, Error)]
pub enum VerificationError {
    /// A non-finite value appeared in the emitted state.
    #[error("non-finite value in {what}")]
    NonFinite {
        /// Which component was non-finite.
        what: String,
    },

    /// An engine-level sanity predicate failed.
    #[error("state discrepancy: {0}")]
    Discrepancy(String),

    /// Production and reference potential energies disagree.
    #[error(
        "potential energy mismatch: production {production}, reference {reference} \
         (relative error {relative:.3e})"
    )]
    EnergyMismatch {
        /// Production-platform potential energy.
        production: f64,
        /// Reference-platform potential energy.
        reference: f64,
        /// Relative disagreement.
        relative: f64,
    },

    /// A per-atom force disagrees between platforms.
    #[error(
        "force mismatch on atom {atom}: production magnitude {production}, \
         reference magnitude {reference} (relative error {relative:.3e})"
    )]
    ForceMismatch {
        /// Atom index.
        atom: usize,
        /// Production-platform force magnitude.
        production: f64,
        /// Reference-platform force magnitude.
        reference: f64,
        /// Relative disagreement.
        relative: f64,
    },

    /// The snapshot is missing a component verification needs.
    #[error("snapshot is missing {0}")]
    MissingComponent(&'static str),
}

/// Agreement tolerances for the cross-platform check.
#[derive(Debug, Clone, Copy)]
pub struct Tolerances {
    /// Relative tolerance on potential energy.
    pub energy_relative: f64,
    /// Relative tolerance on per-atom force magnitudes.
    pub force_relative: f64,
    /// Magnitude floor below which forces are compared absolutely.
    pub force_floor: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            energy_relative: 1e-4,
            force_relative: 1e-3,
            force_floor: 1.0,
        }
    }
}

/// The verification gate. Owns the reference engine for the stream.
pub struct Verifier {
    reference: Box<dyn SimulationEngine>,
    tolerances: Tolerances,
}

impl Verifier {
    /// Wraps the reference engine with the given tolerances.
    #[must_use]
    pub fn new(reference: Box<dyn SimulationEngine>, tolerances: Tolerances) -> Self {
        Self {
            reference,
            tolerances,
        }
    }

    /// Runs all three checks on a candidate snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError`] on the first failed check.
    pub fn check(&mut self, candidate: &SimulationState) -> Result<(), VerificationError> {
        check_finite(candidate)?;
        check_discrepancies(candidate)?;
        self.check_against_reference(candidate)
    }

    fn check_against_reference(
        &mut self,
        candidate: &SimulationState,
    ) -> Result<(), VerificationError> {
        let candidate_energy = candidate
            .potential_energy
            .ok_or(VerificationError::MissingComponent("potential energy"))?;
        let candidate_forces = candidate
            .forces
            .as_ref()
            .ok_or(VerificationError::MissingComponent("forces"))?;

        self.reference
            .restore(candidate)
            .map_err(|e| VerificationError::Discrepancy(e.to_string()))?;
        let reference = self
            .reference
            .snapshot(SnapshotMask::ENERGY_FORCES)
            .map_err(|e| VerificationError::Discrepancy(e.to_string()))?;
        let reference_energy = reference
            .potential_energy
            .ok_or(VerificationError::MissingComponent("reference potential energy"))?;
        let reference_forces = reference
            .forces
            .as_ref()
            .ok_or(VerificationError::MissingComponent("reference forces"))?;

        let energy_scale = candidate_energy.abs().max(reference_energy.abs()).max(1.0);
        let energy_relative = (candidate_energy - reference_energy).abs() / energy_scale;
        if energy_relative > self.tolerances.energy_relative {
            return Err(VerificationError::EnergyMismatch {
                production: candidate_energy,
                reference: reference_energy,
                relative: energy_relative,
            });
        }

        if candidate_forces.len() != reference_forces.len() {
            return Err(VerificationError::Discrepancy(format!(
                "production carries {} forces, reference {}",
                candidate_forces.len(),
                reference_forces.len()
            )));
        }
        for (atom, (prod, refr)) in candidate_forces.iter().zip(reference_forces).enumerate() {
            let prod_mag = magnitude(prod);
            let ref_mag = magnitude(refr);
            let scale = prod_mag.max(ref_mag).max(self.tolerances.force_floor);
            let relative = (prod_mag - ref_mag).abs() / scale;
            if relative > self.tolerances.force_relative {
                return Err(VerificationError::ForceMismatch {
                    atom,
                    production: prod_mag,
                    reference: ref_mag,
                    relative,
                });
            }
        }
        debug!(
            energy_relative,
            atoms = candidate_forces.len(),
            "state verified against reference"
        );
        Ok(())
    }
}

fn magnitude(v: &[f64; 3]) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

fn check_finite(state: &SimulationState) -> Result<(), VerificationError> {
    let all_finite = |vectors: &[[f64; 3]]| vectors.iter().flatten().all(|c| c.is_finite());
    if !all_finite(&state.positions) {
        return Err(VerificationError::NonFinite {
            what: "positions".to_string(),
        });
    }
    if !all_finite(&state.velocities) {
        return Err(VerificationError::NonFinite {
            what: "velocities".to_string(),
        });
    }
    if let Some(forces) = &state.forces {
        if !all_finite(forces) {
            return Err(VerificationError::NonFinite {
                what: "forces".to_string(),
            });
        }
    }
    if let Some(energy) = state.potential_energy {
        if !energy.is_finite() {
            return Err(VerificationError::NonFinite {
                what: "potential energy".to_string(),
            });
        }
    }
    Ok(())
}

fn check_discrepancies(state: &SimulationState) -> Result<(), VerificationError> {
    for (axis, row) in state.box_vectors.iter().enumerate() {
        if !row.iter().all(|c| c.is_finite()) {
            return Err(VerificationError::Discrepancy(format!(
                "box vector {axis} is not finite"
            )));
        }
        if row[axis] <= 0.0 {
            return Err(VerificationError::Discrepancy(format!(
                "box vector {axis} has non-positive extent {}",
                row[axis]
            )));
        }
    }
    if state.time_ps < 0.0 {
        return Err(VerificationError::Discrepancy(format!(
            "negative simulation time {}",
            state.time_ps
        )));
    }
    Ok(())
}
