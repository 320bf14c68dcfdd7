//! The built-in harmonic-network engine.
//!
//! A velocity-Verlet integrator over particles coupled by harmonic bonds,
//! with an optional Andersen-style collision thermostat. The production
//! binding runs in single precision (forces and coordinates rounded
//! through `f32` every update, the way a single-precision device
//! accumulates); the reference binding keeps everything in `f64` and is
//! fully deterministic given its seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use super::{
    EngineError, EngineProperties, IntegratorSpec, Platform, Precision, SimulationEngine,
    SimulationState, SnapshotMask, SystemSpec,
};

/// Boltzmann constant in kJ/(mol K), matching the nm/ps/amu unit system.
const BOLTZMANN_KJ_PER_MOL_K: f64 = 0.008_314_462_618;

/// A harmonic-network simulation bound to one platform.
pub struct HarmonicEngine {
    system: SystemSpec,
    step_size_ps: f64,
    platform: Platform,
    precision: Precision,
    time_ps: f64,
    box_vectors: [[f64; 3]; 3],
    positions: Vec<[f64; 3]>,
    velocities: Vec<[f64; 3]>,
    rng: StdRng,
}

impl HarmonicEngine {
    /// Constructs the production engine on the selected platform.
    ///
    /// Device and platform indices are honored where the platform exposes
    /// them; this build compiles only the CPU platform, so CUDA and
    /// OpenCL selections fail here.
    ///
    /// # Errors
    ///
    /// [`EngineError::PlatformUnavailable`] for platforms not in this
    /// build; [`EngineError::Inconsistent`] if the state does not fit the
    /// system.
    pub fn production(
        system: SystemSpec,
        integrator: &IntegratorSpec,
        state: &SimulationState,
        platform: Platform,
        properties: &EngineProperties,
        seed: u64,
    ) -> Result<Self, EngineError> {
        match platform {
            Platform::Cpu => {},
            Platform::Cuda | Platform::OpenCl | Platform::Reference => {
                return Err(EngineError::PlatformUnavailable(platform));
            },
        }
        if let Some(device) = properties.device_index {
            info!(platform = %platform, device, "binding compute device");
        }
        Self::new(system, integrator, state, platform, properties.precision, seed)
    }

    /// Constructs the deterministic double-precision reference engine.
    ///
    /// # Errors
    ///
    /// [`EngineError::Inconsistent`] if the state does not fit the system.
    pub fn reference(
        system: SystemSpec,
        integrator: &IntegratorSpec,
        state: &SimulationState,
        seed: u64,
    ) -> Result<Self, EngineError> {
        Self::new(
            system,
            integrator,
            state,
            Platform::Reference,
            Precision::Double,
            seed,
        )
    }

    fn new(
        system: SystemSpec,
        integrator: &IntegratorSpec,
        state: &SimulationState,
        platform: Platform,
        precision: Precision,
        seed: u64,
    ) -> Result<Self, EngineError> {
        validate(&system, integrator, state)?;
        info!(
            particles = system.particles.len(),
            bonds = system.bonds.len(),
            thermostat = system.thermostat.is_some(),
            platform = %platform,
            "system composition"
        );
        Ok(Self {
            step_size_ps: integrator.step_size_ps,
            platform,
            precision,
            time_ps: state.time_ps,
            box_vectors: state.box_vectors,
            positions: state.positions.clone(),
            velocities: state.velocities.clone(),
            rng: StdRng::seed_from_u64(seed),
            system,
        })
    }

    /// Rounds through `f32` when the binding is single precision.
    #[allow(clippy::cast_possible_truncation)]
    fn clamp(&self, value: f64) -> f64 {
        match self.precision {
            Precision::Single => f64::from(value as f32),
            Precision::Double => value,
        }
    }

    fn compute_forces(&self) -> Vec<[f64; 3]> {
        let mut forces = vec![[0.0f64; 3]; self.positions.len()];
        for bond in &self.system.bonds {
            let a = self.positions[bond.i];
            let b = self.positions[bond.j];
            let delta = [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
            let distance = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();
            if distance == 0.0 {
                continue;
            }
            let magnitude = -bond.k * (distance - bond.length) / distance;
            for axis in 0..3 {
                let component = self.clamp(magnitude * delta[axis]);
                forces[bond.i][axis] = self.clamp(forces[bond.i][axis] + component);
                forces[bond.j][axis] = self.clamp(forces[bond.j][axis] - component);
            }
        }
        forces
    }

    fn potential_energy(&self) -> f64 {
        let mut energy = 0.0f64;
        for bond in &self.system.bonds {
            let a = self.positions[bond.i];
            let b = self.positions[bond.j];
            let delta = [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
            let distance = (delta[0] * delta[0] + delta[1] * delta[1] + delta[2] * delta[2]).sqrt();
            let stretch = distance - bond.length;
            energy = self.clamp(energy + 0.5 * bond.k * stretch * stretch);
        }
        energy
    }

    fn apply_thermostat(&mut self) {
        let Some(thermostat) = self.system.thermostat.clone() else {
            return;
        };
        let collision_probability = (thermostat.collision_rate * self.step_size_ps).min(1.0);
        for (index, particle) in self.system.particles.iter().enumerate() {
            if self.rng.gen::<f64>() >= collision_probability {
                continue;
            }
            let sigma = (BOLTZMANN_KJ_PER_MOL_K * thermostat.temperature / particle.mass).sqrt();
            for axis in 0..3 {
                let deviate = gaussian(&mut self.rng);
                self.velocities[index][axis] = self.clamp(sigma * deviate);
            }
        }
    }
}

/// Standard normal deviate via Box-Muller.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn validate(
    system: &SystemSpec,
    integrator: &IntegratorSpec,
    state: &SimulationState,
) -> Result<(), EngineError> {
    if system.particles.is_empty() {
        return Err(EngineError::Inconsistent("system has no particles".to_string()));
    }
    if state.positions.len() != system.particles.len()
        || state.velocities.len() != system.particles.len()
    {
        return Err(EngineError::Inconsistent(format!(
            "system has {} particles but state carries {} positions and {} velocities",
            system.particles.len(),
            state.positions.len(),
            state.velocities.len()
        )));
    }
    for (index, bond) in system.bonds.iter().enumerate() {
        if bond.i >= system.particles.len() || bond.j >= system.particles.len() {
            return Err(EngineError::Inconsistent(format!(
                "bond {index} references a particle outside the system"
            )));
        }
    }
    if !(integrator.step_size_ps.is_finite() && integrator.step_size_ps > 0.0) {
        return Err(EngineError::Inconsistent(format!(
            "step size {} ps is not positive",
            integrator.step_size_ps
        )));
    }
    for particle in &system.particles {
        if !(particle.mass.is_finite() && particle.mass > 0.0) {
            return Err(EngineError::Inconsistent("non-positive particle mass".to_string()));
        }
    }
    Ok(())
}

impl SimulationEngine for HarmonicEngine {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn step(&mut self, n: u64) -> Result<(), EngineError> {
        let dt = self.step_size_ps;
        for _ in 0..n {
            let forces = self.compute_forces();
            for (index, particle) in self.system.particles.iter().enumerate() {
                for axis in 0..3 {
                    let half_kick = 0.5 * dt * forces[index][axis] / particle.mass;
                    self.velocities[index][axis] =
                        self.clamp(self.velocities[index][axis] + half_kick);
                    self.positions[index][axis] =
                        self.clamp(self.positions[index][axis] + dt * self.velocities[index][axis]);
                }
            }
            let forces = self.compute_forces();
            for (index, particle) in self.system.particles.iter().enumerate() {
                for axis in 0..3 {
                    let half_kick = 0.5 * dt * forces[index][axis] / particle.mass;
                    self.velocities[index][axis] =
                        self.clamp(self.velocities[index][axis] + half_kick);
                }
            }
            self.apply_thermostat();
            self.time_ps += dt;
        }
        Ok(())
    }

    fn snapshot(&self, mask: SnapshotMask) -> Result<SimulationState, EngineError> {
        Ok(SimulationState {
            time_ps: self.time_ps,
            box_vectors: self.box_vectors,
            positions: if mask.positions {
                self.positions.clone()
            } else {
                Vec::new()
            },
            velocities: if mask.velocities {
                self.velocities.clone()
            } else {
                Vec::new()
            },
            forces: mask.forces.then(|| self.compute_forces()),
            potential_energy: mask.energy.then(|| self.potential_energy()),
        })
    }

    fn restore(&mut self, state: &SimulationState) -> Result<(), EngineError> {
        if state.positions.len() != self.system.particles.len() {
            return Err(EngineError::Inconsistent(format!(
                "restore carries {} positions for a {}-particle system",
                state.positions.len(),
                self.system.particles.len()
            )));
        }
        self.time_ps = state.time_ps;
        self.box_vectors = state.box_vectors;
        self.positions = state.positions.clone();
        if state.velocities.len() == self.system.particles.len() {
            self.velocities = state.velocities.clone();
        }
        Ok(())
    }

    fn step_size_ps(&self) -> f64 {
        self.step_size_ps
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::two_particle_system;
    use super::*;

    #[test]
    fn test_production_rejects_unavailable_platforms() {
        let (system, integrator, state) = two_particle_system();
        let result = HarmonicEngine::production(
            system,
            &integrator,
            &state,
            Platform::Cuda,
            &EngineProperties::default(),
            7,
        );
        assert!(matches!(result, Err(EngineError::PlatformUnavailable(Platform::Cuda))));
    }

    #[test]
    fn test_step_advances_time_and_moves_particles() {
        let (system, integrator, state) = two_particle_system();
        let mut engine = HarmonicEngine::reference(system, &integrator, &state, 7).unwrap();
        engine.step(10).unwrap();
        let snap = engine.snapshot(SnapshotMask::FULL).unwrap();
        assert!((snap.time_ps - 0.02).abs() < 1e-12);
        // The stretched bond pulls the particles toward each other.
        assert!(snap.positions[1][0] < 0.17);
        assert!(snap.positions[0][0] > 0.0);
    }

    #[test]
    fn test_reference_is_deterministic() {
        let (system, integrator, state) = two_particle_system();
        let mut a = HarmonicEngine::reference(system.clone(), &integrator, &state, 7).unwrap();
        let mut b = HarmonicEngine::reference(system, &integrator, &state, 7).unwrap();
        a.step(50).unwrap();
        b.step(50).unwrap();
        assert_eq!(
            a.snapshot(SnapshotMask::FULL).unwrap(),
            b.snapshot(SnapshotMask::FULL).unwrap()
        );
    }

    #[test]
    fn test_energy_conserved_without_thermostat() {
        let (system, integrator, state) = two_particle_system();
        let mut engine = HarmonicEngine::reference(system, &integrator, &state, 7).unwrap();
        let before = engine.potential_energy() + kinetic(&engine);
        engine.step(100).unwrap();
        let after = engine.potential_energy() + kinetic(&engine);
        assert!((before - after).abs() < before.abs() * 1e-3 + 1e-6);
    }

    fn kinetic(engine: &HarmonicEngine) -> f64 {
        engine
            .system
            .particles
            .iter()
            .zip(&engine.velocities)
            .map(|(p, v)| 0.5 * p.mass * (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]))
            .sum()
    }

    #[test]
    fn test_restore_round_trip() {
        let (system, integrator, state) = two_particle_system();
        let mut engine = HarmonicEngine::reference(system, &integrator, &state, 7).unwrap();
        engine.step(25).unwrap();
        let snap = engine.snapshot(SnapshotMask::FULL).unwrap();
        engine.step(25).unwrap();
        engine.restore(&snap).unwrap();
        let again = engine.snapshot(SnapshotMask::FULL).unwrap();
        assert_eq!(again.positions, snap.positions);
        assert_eq!(again.time_ps, snap.time_ps);
    }

    #[test]
    fn test_restore_rejects_wrong_particle_count() {
        let (system, integrator, state) = two_particle_system();
        let mut engine = HarmonicEngine::reference(system, &integrator, &state, 7).unwrap();
        let bad = SimulationState {
            positions: vec![[0.0; 3]; 5],
            ..state
        };
        assert!(matches!(
            engine.restore(&bad),
            Err(EngineError::Inconsistent(_))
        ));
    }

    #[test]
    fn test_single_precision_diverges_but_stays_close() {
        let (system, integrator, state) = two_particle_system();
        let mut production = HarmonicEngine::production(
            system.clone(),
            &integrator,
            &state,
            Platform::Cpu,
            &EngineProperties::default(),
            7,
        )
        .unwrap();
        let mut reference = HarmonicEngine::reference(system, &integrator, &state, 7).unwrap();
        production.step(100).unwrap();
        reference.step(100).unwrap();
        let p = production.snapshot(SnapshotMask::FULL).unwrap();
        let r = reference.snapshot(SnapshotMask::FULL).unwrap();
        for (a, b) in p.positions.iter().zip(&r.positions) {
            for axis in 0..3 {
                assert!((a[axis] - b[axis]).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_validate_rejects_bond_out_of_range() {
        let (mut system, integrator, state) = two_particle_system();
        system.bonds[0].j = 9;
        assert!(matches!(
            HarmonicEngine::reference(system, &integrator, &state, 7),
            Err(EngineError::Inconsistent(_))
        ));
    }
}
