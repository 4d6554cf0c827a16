//! Simulation driver.
//!
//! Owns every field of one region and advances them one step at a time:
//!
//! 1. recompute the coupling field `n` (and its derivatives when `E != 0`)
//! 2. build the competition drive from the committed branching densities
//! 3. RK4 on each `a_i`, staged so no population sees another's partial update
//! 4. measure the budgets, then apply the transfer
//! 5. RK4 on each `c_i`, clamped to `[0, 1]`; the applied increment becomes `dc_i`
//!
//! `a_i` is driven by `divJ_i - dc_i` where `dc_i` comes from step 5 of the
//! *previous* step. That one-step lag is part of the model.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};
use crate::flux::{Competition, CompetitionPlan, Coupling, Drive, FluxContext, FluxScratch};
use crate::guidance::{
    boundary_falloff, GuidanceChannel, GuidanceFields, GuidanceNoise, GuidanceOptions,
};
use crate::integrator::{rk4_increment, Rk4Scratch};
use crate::mesh::HexMesh;
use crate::operators::{self, Coefficients, ExecutionTier, ScalarField, VectorField};
use crate::prng::Prng;
use crate::transfer::{BudgetSums, Transfer};
use crate::Real;

/// Gaussian mask applied to the initial branching density.
///
/// `sigma == 0` gives a uniform mask of height `gain`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct InitialMask {
    pub gain: Real,
    pub sigma: Real,
    pub x: Real,
    pub y: Real,
}

impl Default for InitialMask {
    fn default() -> Self {
        Self {
            gain: 1.0,
            sigma: 0.0,
            x: 0.0,
            y: 0.0,
        }
    }
}

impl InitialMask {
    pub fn gaussian(gain: Real, sigma: Real, x: Real, y: Real) -> Self {
        Self { gain, sigma, x, y }
    }

    #[inline]
    pub fn value(&self, x: Real, y: Real) -> Real {
        if self.sigma > 0.0 {
            let r2 = (x - self.x).powi(2) + (y - self.y).powi(2);
            self.gain * (-r2 / (2.0 * self.sigma * self.sigma)).exp()
        } else {
            self.gain
        }
    }
}

/// Parameters of one population (one thalamocortical projection).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Population {
    pub name: String,
    /// Connection decay.
    pub alpha: Real,
    /// Connection growth.
    pub beta: Real,
    pub epsilon: Real,
    pub xi: Real,
    /// Named group for [`Competition::Grouped`].
    pub group: String,
    pub init: InitialMask,
}

impl Default for Population {
    fn default() -> Self {
        Self {
            name: String::new(),
            alpha: 0.0,
            beta: 0.0,
            epsilon: 0.0,
            xi: 0.0,
            group: String::new(),
            init: InitialMask::default(),
        }
    }
}

impl Population {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_growth(mut self, alpha: Real, beta: Real) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }

    pub fn with_epsilon(mut self, epsilon: Real) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_xi(mut self, xi: Real) -> Self {
        self.xi = xi;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_init(mut self, init: InitialMask) -> Self {
        self.init = init;
        self
    }

    fn validate(&self, i: usize) -> Result<()> {
        let values = [
            self.alpha,
            self.beta,
            self.epsilon,
            self.xi,
            self.init.gain,
            self.init.sigma,
            self.init.x,
            self.init.y,
        ];
        if !values.iter().all(|v| v.is_finite()) {
            return Err(SimError::config(format!(
                "population {i} ({}) has non-finite parameters",
                self.name
            )));
        }
        if self.init.sigma < 0.0 {
            return Err(SimError::config(format!(
                "population {i} ({}) has negative init sigma",
                self.name
            )));
        }
        Ok(())
    }
}

/// Model-wide parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ModelParams {
    pub dt: Real,
    /// Diffusion constant `D`.
    pub diffusion: Real,
    /// Exponent on `a` in the connection growth rate.
    pub k: Real,
    pub competition: Competition,
    pub transfer: Transfer,
    /// Strength `E` of the coupling-field gradient term. Zero disables it.
    pub coupling: Real,
    /// Initial `a = (noise_offset + noise_gain U[0,1)) * mask`.
    pub noise_gain: Real,
    pub noise_offset: Real,
    pub seed: Option<u64>,
    pub execution_tier: ExecutionTier,
    /// Fraction of clamped connection cells per step above which a warning is logged.
    pub clamp_warn_fraction: Real,
    /// Distance from the boundary over which guidance and the initial branching
    /// density fade out. `None` disables the fall-off.
    pub boundary_falloff: Option<Real>,
    /// Gain of the smoothed noise added to every guidance field. Zero disables it.
    pub guidance_noise_gain: Real,
    /// Width of the Gaussian kernel smoothing that noise.
    pub guidance_noise_sigma: Real,
    /// Assign [`Competition::Grouped`] groups from equal gamma values on this channel.
    pub group_gamma: Option<usize>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            dt: 1e-5,
            diffusion: 0.1,
            k: 3.0,
            competition: Competition::None,
            transfer: Transfer::Identity,
            coupling: 0.0,
            noise_gain: 0.1,
            noise_offset: 0.1,
            seed: None,
            execution_tier: ExecutionTier::Scalar,
            clamp_warn_fraction: 0.25,
            boundary_falloff: None,
            guidance_noise_gain: 0.0,
            guidance_noise_sigma: 0.09,
            group_gamma: None,
        }
    }
}

impl ModelParams {
    /// Competition through the transfer step only.
    pub fn divisive_only() -> Self {
        Self {
            competition: Competition::None,
            transfer: Transfer::DivisiveInitialSum,
            ..Default::default()
        }
    }

    pub fn with_dt(mut self, dt: Real) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_diffusion(mut self, diffusion: Real) -> Self {
        self.diffusion = diffusion;
        self
    }

    pub fn with_k(mut self, k: Real) -> Self {
        self.k = k;
        self
    }

    pub fn with_competition(mut self, competition: Competition) -> Self {
        self.competition = competition;
        self
    }

    pub fn with_transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_coupling(mut self, e: Real) -> Self {
        self.coupling = e;
        self
    }

    pub fn with_noise(mut self, gain: Real, offset: Real) -> Self {
        self.noise_gain = gain;
        self.noise_offset = offset;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_execution_tier(mut self, tier: ExecutionTier) -> Self {
        self.execution_tier = tier;
        self
    }

    pub fn with_boundary_falloff(mut self, distance: Real) -> Self {
        self.boundary_falloff = Some(distance);
        self
    }

    pub fn with_guidance_noise(mut self, gain: Real, sigma: Real) -> Self {
        self.guidance_noise_gain = gain;
        self.guidance_noise_sigma = sigma;
        self
    }

    pub fn with_group_gamma(mut self, channel: usize) -> Self {
        self.group_gamma = Some(channel);
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err("dt must be finite and > 0");
        }
        if !(self.diffusion.is_finite() && self.diffusion >= 0.0) {
            return Err("diffusion must be finite and >= 0");
        }
        if !self.k.is_finite() {
            return Err("k must be finite");
        }
        if !self.coupling.is_finite() {
            return Err("coupling must be finite");
        }
        if !(self.noise_gain.is_finite() && self.noise_offset.is_finite()) {
            return Err("initial noise parameters must be finite");
        }
        if !(0.0..=1.0).contains(&self.clamp_warn_fraction) {
            return Err("clamp_warn_fraction must be in [0, 1]");
        }
        if let Some(d) = self.boundary_falloff {
            if !(d.is_finite() && d >= 0.0) {
                return Err("boundary_falloff must be finite and >= 0");
            }
        }
        if !self.guidance_noise_gain.is_finite() {
            return Err("guidance_noise_gain must be finite");
        }
        if self.guidance_noise_gain != 0.0
            && !(self.guidance_noise_sigma.is_finite() && self.guidance_noise_sigma > 0.0)
        {
            return Err("guidance_noise_sigma must be finite and > 0");
        }
        Ok(())
    }
}

/// Per-step counters for the silent corrections applied during a step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Diagnostics {
    pub step: u64,
    pub cell_count: usize,
    pub population_count: usize,
    /// Cells where `1 - sum c` fell outside `[0, 1]`.
    pub clamped_coupling: usize,
    /// Cells (over all populations) set to zero by the transfer.
    pub clamped_branching: usize,
    /// Cells (over all populations) where `c` left `[0, 1]` before clamping.
    pub clamped_connections: usize,
    pub execution_tier: ExecutionTier,
}

/// A simulation between [`Simulation::allocate`] and [`Setup::init`].
#[derive(Debug, Clone)]
pub struct Setup {
    mesh: HexMesh,
    params: ModelParams,
    populations: Vec<Population>,
    channels: Vec<GuidanceChannel>,
    gamma: Vec<Vec<Real>>,
}

impl Setup {
    pub fn population_count(&self) -> usize {
        self.populations.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ModelParams {
        &mut self.params
    }

    pub fn population_mut(&mut self, i: usize) -> Result<&mut Population> {
        SimError::check_index("population", i, self.populations.len())?;
        Ok(&mut self.populations[i])
    }

    pub fn set_population(&mut self, i: usize, population: Population) -> Result<()> {
        *self.population_mut(i)? = population;
        Ok(())
    }

    pub fn set_guidance(&mut self, j: usize, channel: GuidanceChannel) -> Result<()> {
        SimError::check_index("guidance channel", j, self.channels.len())?;
        self.channels[j] = channel;
        Ok(())
    }

    /// Interaction of population `i` with guidance channel `j`.
    pub fn set_gamma(&mut self, i: usize, j: usize, value: Real) -> Result<()> {
        SimError::check_index("population", i, self.populations.len())?;
        SimError::check_index("guidance channel", j, self.channels.len())?;
        if !value.is_finite() {
            return Err(SimError::config(format!("gamma[{i}][{j}] must be finite")));
        }
        self.gamma[i][j] = value;
        Ok(())
    }

    /// Validate everything, lay down initial conditions and evaluate guidance.
    pub fn init(self) -> Result<Simulation> {
        let Setup {
            mesh,
            params,
            mut populations,
            channels,
            gamma,
        } = self;

        params.validate().map_err(SimError::config)?;
        params.competition.validate()?;
        for (i, p) in populations.iter().enumerate() {
            p.validate(i)?;
        }
        for ch in &channels {
            ch.validate()?;
        }
        if let Some(j) = params.group_gamma {
            SimError::check_index("guidance channel", j, channels.len())?;
            for (p, row) in populations.iter_mut().zip(&gamma) {
                p.group = format!("gamma{j}={}", row[j]);
            }
        }

        let len = mesh.len();
        let n_pop = populations.len();
        let tier = params.execution_tier;
        let falloff = params
            .boundary_falloff
            .map(|distance| boundary_falloff(&mesh, distance));

        let mut rng = Prng::new(params.seed.unwrap_or(1));
        let a: Vec<ScalarField> = populations
            .iter()
            .map(|p| {
                mesh.cells()
                    .iter()
                    .enumerate()
                    .map(|(h, cell)| {
                        let noise = params.noise_offset + params.noise_gain * rng.next_unit();
                        let edge = falloff.as_ref().map_or(1.0, |w| w[h]);
                        noise * p.init.value(cell.x, cell.y) * edge
                    })
                    .collect()
            })
            .collect();

        let options = GuidanceOptions {
            falloff: falloff.as_deref(),
            noise: (params.guidance_noise_gain != 0.0).then(|| GuidanceNoise {
                gain: params.guidance_noise_gain,
                sigma: params.guidance_noise_sigma,
                seed: rng.next_u64(),
            }),
        };
        let guidance = GuidanceFields::compute(&mesh, tier, &channels, &options)?;
        let plan = CompetitionPlan::new(params.competition, &populations);
        let drive = plan.allocate_drive(len);

        let mut budget = BudgetSums::new(n_pop, len);
        for (i, field) in a.iter().enumerate() {
            budget.sum_a[i] = operators::sum(tier, field);
        }
        budget.sum_a_init.clone_from(&budget.sum_a);

        tracing::debug!(
            cells = len,
            populations = n_pop,
            channels = channels.len(),
            competition = ?params.competition,
            transfer = ?params.transfer,
            tier = ?tier.effective(),
            "simulation initialised"
        );

        Ok(Simulation {
            coeffs: Coefficients::new(mesh.spacing(), params.diffusion),
            staging: vec![vec![0.0; len]; n_pop],
            c: vec![vec![0.0; len]; n_pop],
            dc: vec![vec![0.0; len]; n_pop],
            div_j: vec![vec![0.0; len]; n_pop],
            n: vec![1.0; len],
            div_n: vec![0.0; len],
            grad_n: VectorField::zeros(len),
            increment: vec![0.0; len],
            next: vec![0.0; len],
            rk: Rk4Scratch::new(len),
            flux: FluxScratch::new(len),
            diagnostics: Diagnostics {
                cell_count: len,
                population_count: n_pop,
                execution_tier: tier.effective(),
                ..Default::default()
            },
            step_count: 0,
            halted: false,
            a,
            budget,
            guidance,
            plan,
            drive,
            mesh,
            params,
            populations,
            channels,
            gamma,
        })
    }
}

/// One region of coupled branching and connection fields.
#[derive(Debug, Clone)]
pub struct Simulation {
    mesh: HexMesh,
    params: ModelParams,
    populations: Vec<Population>,
    channels: Vec<GuidanceChannel>,
    gamma: Vec<Vec<Real>>,
    coeffs: Coefficients,
    plan: CompetitionPlan,
    guidance: GuidanceFields,

    a: Vec<ScalarField>,
    c: Vec<ScalarField>,
    dc: Vec<ScalarField>,
    div_j: Vec<ScalarField>,
    n: ScalarField,
    div_n: ScalarField,
    grad_n: VectorField,

    drive: Drive,
    staging: Vec<ScalarField>,
    increment: ScalarField,
    next: ScalarField,
    rk: Rk4Scratch,
    flux: FluxScratch,

    budget: BudgetSums,
    diagnostics: Diagnostics,
    step_count: u64,
    halted: bool,
}

impl Simulation {
    /// Start configuring a simulation with `populations` populations and
    /// `channels` guidance channels over `mesh`.
    pub fn allocate(
        mesh: HexMesh,
        populations: usize,
        channels: usize,
        params: ModelParams,
    ) -> Result<Setup> {
        if populations == 0 {
            return Err(SimError::config("at least one population is required"));
        }
        params.validate().map_err(SimError::config)?;
        Ok(Setup {
            mesh,
            params,
            populations: (0..populations)
                .map(|i| Population::new(format!("pop{i}")))
                .collect(),
            channels: vec![GuidanceChannel::default(); channels],
            gamma: vec![vec![0.0; channels]; populations],
        })
    }

    /// Advance one step. After a numeric fault every later call returns [`SimError::Halted`].
    pub fn step(&mut self) -> Result<()> {
        self.advance_branching()?;
        self.measure_budget()?;
        let result = transfer_all(
            self.params.transfer,
            self.params.execution_tier,
            &mut self.a,
            &self.budget,
            self.step_count,
            &mut self.diagnostics,
        );
        self.guard(result)?;
        self.advance_connections()
    }

    pub fn run(&mut self, steps: u64) -> Result<()> {
        for _ in 0..steps {
            self.step()?;
        }
        Ok(())
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.halted {
            Err(SimError::Halted)
        } else {
            Ok(())
        }
    }

    /// Stop this region because a region coupled to it faulted.
    pub(crate) fn halt(&mut self) {
        self.halted = true;
    }

    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_numeric_fault() {
                self.halted = true;
                tracing::error!(step = self.step_count, error = %err, "simulation halted");
            }
        }
        result
    }

    /// Steps 1 to 3: coupling field, competition drive, staged RK4 on every `a_i`.
    pub(crate) fn advance_branching(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.step_count += 1;
        self.diagnostics.step = self.step_count;
        self.diagnostics.clamped_coupling = 0;
        self.diagnostics.clamped_branching = 0;
        self.diagnostics.clamped_connections = 0;

        self.compute_coupling();
        let result = self.integrate_branching();
        self.guard(result)
    }

    fn compute_coupling(&mut self) {
        let tier = self.params.execution_tier;
        let c = &self.c;
        operators::fill(tier, &mut self.n, |h| {
            let total: Real = c.iter().map(|ci| ci[h]).sum();
            1.0 - total
        });
        self.diagnostics.clamped_coupling = self
            .n
            .iter()
            .filter(|v| !(0.0..=1.0).contains(*v))
            .count();
        operators::map_in_place(tier, &mut self.n, |v| v.clamp(0.0, 1.0));

        if self.params.coupling != 0.0 {
            operators::laplacian(&self.mesh, tier, &self.n, self.coeffs.laplace, &mut self.div_n);
            operators::gradient(
                &self.mesh,
                tier,
                &self.n,
                self.coeffs.first_order,
                &mut self.grad_n,
            );
        }
    }

    fn integrate_branching(&mut self) -> Result<()> {
        let tier = self.params.execution_tier;
        let step = self.step_count;

        self.plan.update_drive(
            &self.mesh,
            tier,
            &self.coeffs,
            &self.a,
            step,
            &mut self.drive,
        )?;

        let ctx = FluxContext {
            mesh: &self.mesh,
            tier,
            coeffs: self.coeffs,
            step,
            coupling: (self.params.coupling != 0.0).then(|| Coupling {
                strength: self.params.coupling,
                div_n: &self.div_n,
                grad_n: &self.grad_n,
            }),
            guidance: &self.guidance,
            channels: &self.channels,
            plan: &self.plan,
            drive: &self.drive,
        };

        for i in 0..self.a.len() {
            let a_i = &self.a[i];
            let dc_i = &self.dc[i];
            let gamma_i = &self.gamma[i];
            let div_j_i = &mut self.div_j[i];
            let flux = &mut self.flux;
            let mut first_stage = true;

            rk4_increment(
                tier,
                a_i,
                self.params.dt,
                &mut self.rk,
                |q, dq| {
                    ctx.divergence(i, gamma_i, q, flux, dq)?;
                    if first_stage {
                        div_j_i.copy_from_slice(dq);
                        first_stage = false;
                    }
                    for (d, lag) in dq.iter_mut().zip(dc_i) {
                        *d -= lag;
                    }
                    Ok(())
                },
                &mut self.increment,
            )?;

            let inc = &self.increment;
            operators::try_fill(tier, &mut self.staging[i], |h| a_i[h] + inc[h]).map_err(
                |cell| SimError::NumericFault {
                    field: "branching",
                    population: Some(i),
                    cell,
                    step,
                },
            )?;
        }

        std::mem::swap(&mut self.a, &mut self.staging);
        Ok(())
    }

    /// Step 4a: reductions over the committed branching and connection fields.
    pub(crate) fn measure_budget(&mut self) -> Result<&BudgetSums> {
        self.ensure_running()?;
        let tier = self.params.execution_tier;
        for (i, (a, c)) in self.a.iter().zip(&self.c).enumerate() {
            self.budget.sum_a[i] = operators::sum(tier, a);
            self.budget.sum_c[i] = operators::sum(tier, c);
        }
        Ok(&self.budget)
    }

    /// Step 4b: apply the transfer against `sums`, which may span several regions.
    pub(crate) fn apply_transfer(&mut self, sums: &BudgetSums) -> Result<()> {
        self.ensure_running()?;
        let result = transfer_all(
            self.params.transfer,
            self.params.execution_tier,
            &mut self.a,
            sums,
            self.step_count,
            &mut self.diagnostics,
        );
        self.guard(result)
    }

    /// Step 5: RK4 on every `c_i`, clamp to `[0, 1]`, record `dc_i`.
    pub(crate) fn advance_connections(&mut self) -> Result<()> {
        self.ensure_running()?;
        let result = self.integrate_connections();
        let result = self.guard(result);
        if result.is_ok() {
            self.report_clamping();
        }
        result
    }

    fn integrate_connections(&mut self) -> Result<()> {
        let tier = self.params.execution_tier;
        let step = self.step_count;
        let k = self.params.k;
        let n = &self.n;

        for i in 0..self.c.len() {
            let (alpha, beta) = (self.populations[i].alpha, self.populations[i].beta);
            let a_i = &self.a[i];

            rk4_increment(
                tier,
                &self.c[i],
                self.params.dt,
                &mut self.rk,
                |q, dq| {
                    operators::try_fill(tier, dq, |h| beta * n[h] * a_i[h].powf(k) - alpha * q[h])
                        .map_err(|cell| SimError::NumericFault {
                            field: "connections",
                            population: Some(i),
                            cell,
                            step,
                        })
                },
                &mut self.increment,
            )?;

            let c_i = &self.c[i];
            let inc = &self.increment;
            self.diagnostics.clamped_connections += c_i
                .iter()
                .zip(inc)
                .filter(|(c, d)| !(0.0..=1.0).contains(&(*c + *d)))
                .count();
            operators::fill(tier, &mut self.next, |h| (c_i[h] + inc[h]).clamp(0.0, 1.0));

            let next = &self.next;
            operators::fill(tier, &mut self.dc[i], |h| next[h] - c_i[h]);
            self.c[i].copy_from_slice(next);
        }
        Ok(())
    }

    fn report_clamping(&self) {
        let d = &self.diagnostics;
        let cells = (d.cell_count * d.population_count).max(1) as Real;
        let fraction = d.clamped_connections as Real / cells;
        if fraction > self.params.clamp_warn_fraction {
            tracing::warn!(
                step = d.step,
                clamped = d.clamped_connections,
                fraction,
                "connection density clamped in many cells"
            );
        } else {
            tracing::trace!(
                step = d.step,
                coupling = d.clamped_coupling,
                branching = d.clamped_branching,
                connections = d.clamped_connections,
                "step complete"
            );
        }
    }

    // =========================================================================
    // Getters
    // =========================================================================

    pub fn mesh(&self) -> &HexMesh {
        &self.mesh
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn populations(&self) -> &[Population] {
        &self.populations
    }

    pub fn channels(&self) -> &[GuidanceChannel] {
        &self.channels
    }

    pub fn population_count(&self) -> usize {
        self.populations.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn gamma(&self, i: usize, j: usize) -> Result<Real> {
        SimError::check_index("population", i, self.populations.len())?;
        SimError::check_index("guidance channel", j, self.channels.len())?;
        Ok(self.gamma[i][j])
    }

    /// Branching density of population `i`.
    pub fn a(&self, i: usize) -> Result<&[Real]> {
        SimError::check_index("population", i, self.a.len())?;
        Ok(&self.a[i])
    }

    /// Connection density of population `i`.
    pub fn c(&self, i: usize) -> Result<&[Real]> {
        SimError::check_index("population", i, self.c.len())?;
        Ok(&self.c[i])
    }

    /// Increment applied to `c_i` in the last step.
    pub fn dc(&self, i: usize) -> Result<&[Real]> {
        SimError::check_index("population", i, self.dc.len())?;
        Ok(&self.dc[i])
    }

    /// Flux divergence of population `i` at the start of the last step.
    pub fn div_j(&self, i: usize) -> Result<&[Real]> {
        SimError::check_index("population", i, self.div_j.len())?;
        Ok(&self.div_j[i])
    }

    /// Coupling field `n = clamp(1 - sum c, 0, 1)` as used in the last step.
    pub fn n(&self) -> &[Real] {
        &self.n
    }

    pub fn rho(&self, j: usize) -> Result<&[Real]> {
        SimError::check_index("guidance channel", j, self.guidance.rho.len())?;
        Ok(&self.guidance.rho[j])
    }

    pub fn grad_rho(&self, j: usize) -> Result<&VectorField> {
        SimError::check_index("guidance channel", j, self.guidance.grad_rho.len())?;
        Ok(&self.guidance.grad_rho[j])
    }

    /// Whether channel `j` drove the flux in the last step.
    pub fn guidance_active(&self, j: usize) -> Result<bool> {
        SimError::check_index("guidance channel", j, self.channels.len())?;
        Ok(self.channels[j].is_active(self.step_count))
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn budget(&self) -> &BudgetSums {
        &self.budget
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn competition_plan(&self) -> &CompetitionPlan {
        &self.plan
    }
}

fn transfer_all(
    transfer: Transfer,
    tier: ExecutionTier,
    a: &mut [ScalarField],
    sums: &BudgetSums,
    step: u64,
    diagnostics: &mut Diagnostics,
) -> Result<()> {
    if sums.populations() != a.len() {
        return Err(SimError::config(format!(
            "budget has {} populations, region has {}",
            sums.populations(),
            a.len()
        )));
    }
    for (i, field) in a.iter_mut().enumerate() {
        diagnostics.clamped_branching += transfer.apply(tier, i, field, sums, step)?;
    }
    Ok(())
}
