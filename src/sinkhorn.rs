//! Sinkhorn solver on grid geometries.
//!
//! Solves the balanced entropic problem
//!
//! \[
//! \min_{P \ge 0,\ P\mathbf 1 = a,\ P^\top \mathbf 1 = b}
//! \langle P, C \rangle + \varepsilon\, \mathrm{KL}(P \,\|\, a b^\top)
//! \]
//!
//! by alternating projections on its dual, either on scalings `(u, v)`
//! (multiplicative mode) or on potentials `(f, g)` (log-domain mode). Every
//! kernel application goes through the grid's per-axis contractions.
//!
//! Multiplicative mode is faster but `exp(-C/ε)` underflows once `ε` is small
//! relative to the grid extent; the solve then reports a non-finite error and
//! stops unconverged. Switch to `lse_mode` in that regime.

use crate::grid::Grid;
use crate::output::SinkhornOutput;
use crate::{Error, Result};
use ndarray::{Array1, ArrayD, Zip};
use tracing::{debug, instrument, warn};

/// Allowed deviation of a measure's total mass from 1.
pub const MASS_TOLERANCE: f64 = 1e-6;

/// Solver configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkhornConfig {
    /// Stop once the marginal error drops below this value.
    pub threshold: f64,
    /// Log-domain updates on potentials instead of kernel updates on scalings.
    pub lse_mode: bool,
    /// Iteration budget. Exhausting it is not an error.
    pub max_iterations: usize,
    /// No convergence check before this many iterations.
    pub min_iterations: usize,
    /// The error is evaluated every `inner_iterations` iterations.
    pub inner_iterations: usize,
    /// `p` of the p-norm used for the marginal error.
    pub norm_error: f64,
    /// Overrides the grid's regularization when set.
    pub epsilon: Option<f64>,
    /// Shift reported potentials so that the finite entries of `f` have zero mean.
    pub recenter_potentials: bool,
    /// Relaxation weight `ω` in `(0, 2)`: each update returns
    /// `(1 − ω)·old + ω·new` on potentials, or `old^(1−ω)·new^ω` on scalings.
    /// `1` is the plain Sinkhorn update.
    pub momentum: f64,
    /// Update `f` from the previous `g` instead of the freshly updated one.
    /// Needs averaging (`momentum < 1`) to converge.
    pub parallel_dual_updates: bool,
}

impl Default for SinkhornConfig {
    fn default() -> Self {
        Self {
            threshold: 1e-3,
            lse_mode: true,
            max_iterations: 2000,
            min_iterations: 0,
            inner_iterations: 10,
            norm_error: 1.0,
            epsilon: None,
            recenter_potentials: false,
            momentum: 1.0,
            parallel_dual_updates: false,
        }
    }
}

impl SinkhornConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the convergence threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Choose log-domain (`true`) or multiplicative (`false`) updates.
    pub fn with_lse_mode(mut self, lse_mode: bool) -> Self {
        self.lse_mode = lse_mode;
        self
    }

    /// Set the iteration budget.
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    /// Set the minimum number of iterations before checking convergence.
    pub fn with_min_iterations(mut self, n: usize) -> Self {
        self.min_iterations = n;
        self
    }

    /// Set how often the marginal error is evaluated.
    pub fn with_inner_iterations(mut self, n: usize) -> Self {
        self.inner_iterations = n;
        self
    }

    /// Set the p-norm of the marginal error.
    pub fn with_norm_error(mut self, p: f64) -> Self {
        self.norm_error = p;
        self
    }

    /// Override the grid's regularization.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Zero-center reported potentials.
    pub fn with_recentering(mut self, recenter: bool) -> Self {
        self.recenter_potentials = recenter;
        self
    }

    /// Set the relaxation weight of every update.
    pub fn with_momentum(mut self, omega: f64) -> Self {
        self.momentum = omega;
        self
    }

    /// Update both potentials from the previous iterate.
    pub fn with_parallel_dual_updates(mut self, parallel: bool) -> Self {
        self.parallel_dual_updates = parallel;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.threshold <= 0.0 || !self.threshold.is_finite() {
            return Err(Error::InvalidThreshold(self.threshold));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig("max_iterations must be > 0"));
        }
        if self.inner_iterations == 0 {
            return Err(Error::InvalidConfig("inner_iterations must be > 0"));
        }
        if self.min_iterations > self.max_iterations {
            return Err(Error::InvalidConfig("min_iterations must not exceed max_iterations"));
        }
        if !self.norm_error.is_finite() || self.norm_error < 1.0 {
            return Err(Error::InvalidConfig("norm_error must be a finite p >= 1"));
        }
        if !(self.momentum > 0.0 && self.momentum < 2.0) {
            return Err(Error::InvalidConfig("momentum must lie in (0, 2)"));
        }
        if let Some(eps) = self.epsilon {
            if eps <= 0.0 || !eps.is_finite() {
                return Err(Error::InvalidRegularization(eps));
            }
        }
        Ok(())
    }
}

fn log_weights(w: &ArrayD<f64>) -> ArrayD<f64> {
    w.mapv(|x| if x <= 0.0 { f64::NEG_INFINITY } else { x.ln() })
}

fn check_measure(grid: &Grid, w: &Array1<f64>) -> Result<ArrayD<f64>> {
    let t = grid.to_grid_tensor(w)?;
    if t.iter().any(|&x| x < 0.0 || !x.is_finite()) {
        return Err(Error::Domain("measures must be finite and nonnegative"));
    }
    let mass = t.sum();
    if (mass - 1.0).abs() > MASS_TOLERANCE {
        return Err(Error::NotNormalized(mass));
    }
    Ok(t)
}

/// A validated transport problem: a grid and two measures in grid shape.
#[derive(Debug, Clone)]
pub struct GridProblem {
    geom: Grid,
    a: ArrayD<f64>,
    b: ArrayD<f64>,
    log_a: ArrayD<f64>,
    log_b: ArrayD<f64>,
}

impl GridProblem {
    /// Validate `a`, `b` against `geom`, applying an optional epsilon override.
    pub fn new(geom: &Grid, a: &Array1<f64>, b: &Array1<f64>, epsilon: Option<f64>) -> Result<Self> {
        let geom = match epsilon {
            Some(eps) => geom.clone().with_epsilon(eps)?,
            None => geom.clone(),
        };
        let a = check_measure(&geom, a)?;
        let b = check_measure(&geom, b)?;
        Ok(Self {
            log_a: log_weights(&a),
            log_b: log_weights(&b),
            geom,
            a,
            b,
        })
    }

    /// The geometry, with any epsilon override applied.
    pub fn geom(&self) -> &Grid {
        &self.geom
    }

    /// Source measure in grid shape.
    pub fn a(&self) -> &ArrayD<f64> {
        &self.a
    }

    /// Target measure in grid shape.
    pub fn b(&self) -> &ArrayD<f64> {
        &self.b
    }

    /// Regularization of this problem.
    pub fn epsilon(&self) -> f64 {
        self.geom.epsilon()
    }

    /// `P 1` for potentials `(f, g)`.
    pub fn source_marginal(&self, f: &ArrayD<f64>, g: &ArrayD<f64>) -> ArrayD<f64> {
        let eps = self.epsilon();
        let lse = self.geom.lse_kernel_all(&(g / eps), false);
        Zip::from(f).and(&lse).map_collect(|&fi, &l| (fi / eps + l).exp())
    }

    /// `Pᵀ 1` for potentials `(f, g)`.
    pub fn target_marginal(&self, f: &ArrayD<f64>, g: &ArrayD<f64>) -> ArrayD<f64> {
        let eps = self.epsilon();
        let lse = self.geom.lse_kernel_all(&(f / eps), true);
        Zip::from(g).and(&lse).map_collect(|&gj, &l| (gj / eps + l).exp())
    }

    /// Regularized cost of the dual pair `(f, g)`:
    /// `Σ a(f − ε log a) + Σ b(g − ε log b) + ε(Σa·Σb − Σ P)`.
    ///
    /// Entries with zero mass are excluded from the first two sums. `total`
    /// is the mass `Σ P` of the coupling built from `(f, g)`.
    pub(crate) fn reg_cost(&self, f: &ArrayD<f64>, g: &ArrayD<f64>, total: f64) -> f64 {
        let eps = self.epsilon();
        let div = |w: &ArrayD<f64>, log_w: &ArrayD<f64>, h: &ArrayD<f64>| -> f64 {
            Zip::from(w)
                .and(log_w)
                .and(h)
                .fold(0.0, |acc, &wi, &lw, &hi| if wi > 0.0 { acc + wi * (hi - eps * lw) } else { acc })
        };
        div(&self.a, &self.log_a, f) + div(&self.b, &self.log_b, g)
            + eps * (self.a.sum() * self.b.sum() - total)
    }

    pub(crate) fn log_a(&self) -> &ArrayD<f64> {
        &self.log_a
    }

    pub(crate) fn log_b(&self) -> &ArrayD<f64> {
        &self.log_b
    }
}

/// Iterates of one solve: `(f, g)` in log-domain mode, `(u, v)` otherwise.
#[derive(Debug, Clone)]
pub struct SolverState {
    /// Source-side potential or scaling.
    pub fu: ArrayD<f64>,
    /// Target-side potential or scaling.
    pub gv: ArrayD<f64>,
    /// Iterations done so far.
    pub iteration: usize,
    /// Marginal errors, one per convergence check.
    pub errors: Vec<f64>,
}

impl SolverState {
    /// Zero potentials (unit scalings), or the given potentials `(f, g)`.
    fn init(problem: &GridProblem, lse_mode: bool, warm: Option<(ArrayD<f64>, ArrayD<f64>)>) -> Self {
        let dim = problem.a.raw_dim();
        let (fu, gv) = match warm {
            Some((f, g)) if lse_mode => (f, g),
            Some((f, g)) => {
                let eps = problem.epsilon();
                (f.mapv(|x| (x / eps).exp()), g.mapv(|x| (x / eps).exp()))
            }
            None if lse_mode => (ArrayD::zeros(dim.clone()), ArrayD::zeros(dim)),
            None => (ArrayD::ones(dim.clone()), ArrayD::ones(dim)),
        };
        Self { fu, gv, iteration: 0, errors: Vec::new() }
    }

    /// Potentials `(f, g)` of this state.
    pub fn potentials(&self, lse_mode: bool, epsilon: f64) -> (ArrayD<f64>, ArrayD<f64>) {
        if lse_mode {
            (self.fu.clone(), self.gv.clone())
        } else {
            (self.fu.mapv(|u| epsilon * u.ln()), self.gv.mapv(|v| epsilon * v.ln()))
        }
    }
}

/// Every iterate of a solve, kept for reverse-mode replay.
///
/// Entry `t` holds the state after `t` iterations; entry `0` is the
/// initialization.
#[derive(Debug, Clone, Default)]
pub struct IterationTrace {
    pub(crate) states: Vec<(ArrayD<f64>, ArrayD<f64>)>,
}

impl IterationTrace {
    fn push(&mut self, state: &SolverState) {
        self.states.push((state.fu.clone(), state.gv.clone()));
    }

    /// Number of recorded iterations (excluding the initialization).
    pub fn iterations(&self) -> usize {
        self.states.len().saturating_sub(1)
    }
}

/// `ε log w − ε·lse`, where a non-finite `lse` contributes nothing.
pub(crate) fn update_potential(log_marginal: &ArrayD<f64>, lse: &ArrayD<f64>, eps: f64) -> ArrayD<f64> {
    Zip::from(log_marginal)
        .and(lse)
        .map_collect(|&lm, &l| eps * lm - if l.is_finite() { eps * l } else { 0.0 })
}

/// Whether a relaxed update mixes `old` into `new` at this entry.
///
/// Zero-mass entries (`-inf` potentials, zero scalings) take the new value as is.
pub(crate) fn relaxes(old: f64, new: f64, lse_mode: bool) -> bool {
    let finite = old.is_finite() && new.is_finite();
    if lse_mode {
        finite
    } else {
        finite && old > 0.0 && new > 0.0
    }
}

/// `(1 − ω)·old + ω·new` on potentials, `old^(1−ω)·new^ω` on scalings.
pub(crate) fn relax(old: &ArrayD<f64>, new: ArrayD<f64>, omega: f64, lse_mode: bool) -> ArrayD<f64> {
    if omega == 1.0 {
        return new;
    }
    Zip::from(old).and(&new).map_collect(|&o, &n| {
        if !relaxes(o, n, lse_mode) {
            n
        } else if lse_mode {
            (1.0 - omega) * o + omega * n
        } else {
            o.powf(1.0 - omega) * n.powf(omega)
        }
    })
}

/// Shift so the finite entries of `f` have zero mean; the coupling is unchanged.
fn recenter(f: &mut ArrayD<f64>, g: &mut ArrayD<f64>) {
    let (sum, count) = f
        .iter()
        .filter(|x| x.is_finite())
        .fold((0.0, 0usize), |(s, c), &x| (s + x, c + 1));
    if count == 0 {
        return;
    }
    let shift = sum / count as f64;
    f.mapv_inplace(|x| x - shift);
    g.mapv_inplace(|x| x + shift);
}

/// Sinkhorn fixed-point solver.
#[derive(Debug, Clone)]
pub struct Sinkhorn {
    config: SinkhornConfig,
}

impl Sinkhorn {
    /// Solver with a validated configuration.
    pub fn new(config: SinkhornConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The configuration.
    pub fn config(&self) -> &SinkhornConfig {
        &self.config
    }

    /// Validate inputs and run to convergence or budget exhaustion.
    #[instrument(level = "debug", skip_all, fields(points = geom.num_points(), lse_mode = self.config.lse_mode))]
    pub fn solve(&self, geom: &Grid, a: &Array1<f64>, b: &Array1<f64>) -> Result<SinkhornOutput> {
        let problem = GridProblem::new(geom, a, b, self.config.epsilon)?;
        Ok(self.run(problem, None, None).0)
    }

    /// Like [`Sinkhorn::solve`], starting from potentials `(f, g)` instead of zero.
    ///
    /// The potentials are given flattened like `a` and `b`, in either mode;
    /// multiplicative mode starts from `(exp(f/ε), exp(g/ε))`. `-inf` is
    /// accepted (zero scaling), `NaN` and `+inf` are not.
    #[instrument(level = "debug", skip_all, fields(points = geom.num_points(), lse_mode = self.config.lse_mode))]
    pub fn solve_with_init(
        &self,
        geom: &Grid,
        a: &Array1<f64>,
        b: &Array1<f64>,
        f: &Array1<f64>,
        g: &Array1<f64>,
    ) -> Result<SinkhornOutput> {
        let problem = GridProblem::new(geom, a, b, self.config.epsilon)?;
        let warm = (problem.geom.to_grid_tensor(f)?, problem.geom.to_grid_tensor(g)?);
        if warm.0.iter().chain(warm.1.iter()).any(|&x| x.is_nan() || x == f64::INFINITY) {
            return Err(Error::Domain("initial potentials must not be NaN or +inf"));
        }
        Ok(self.run(problem, Some(warm), None).0)
    }

    /// Run the iteration on a validated problem, optionally recording iterates.
    ///
    /// Returns the output together with the raw final state.
    pub(crate) fn run(
        &self,
        problem: GridProblem,
        warm: Option<(ArrayD<f64>, ArrayD<f64>)>,
        mut trace: Option<&mut IterationTrace>,
    ) -> (SinkhornOutput, SolverState) {
        let cfg = &self.config;
        if cfg.parallel_dual_updates && cfg.momentum >= 1.0 {
            warn!(momentum = cfg.momentum, "parallel dual updates without averaging may oscillate");
        }
        let mut state = SolverState::init(&problem, cfg.lse_mode, warm);
        if let Some(t) = trace.as_deref_mut() {
            t.push(&state);
        }

        let mut converged = false;
        while state.iteration < cfg.max_iterations {
            self.one_iteration(&problem, &mut state);
            if let Some(t) = trace.as_deref_mut() {
                t.push(&state);
            }

            let at_check = state.iteration % cfg.inner_iterations == 0
                || state.iteration == cfg.max_iterations;
            if !at_check || state.iteration < cfg.min_iterations {
                continue;
            }
            let err = self.solution_error(&problem, &state);
            state.errors.push(err);
            debug!(iteration = state.iteration, error = err, "marginal error");

            if !err.is_finite() {
                warn!(
                    iteration = state.iteration,
                    lse_mode = cfg.lse_mode,
                    "sinkhorn diverged (non-finite marginal error); log-domain mode avoids kernel underflow"
                );
                break;
            }
            if err < cfg.threshold {
                converged = true;
                break;
            }
        }

        if !converged && state.errors.last().map_or(true, |e| e.is_finite()) {
            warn!(
                iterations = state.iteration,
                threshold = cfg.threshold,
                "sinkhorn did not converge within the iteration budget"
            );
        }

        let output = self.output_from_state(problem, &state, converged);
        debug!(
            iterations = output.n_iters(),
            converged = output.converged(),
            reg_ot_cost = output.reg_ot_cost(),
            "sinkhorn finished"
        );
        (output, state)
    }

    fn one_iteration(&self, problem: &GridProblem, state: &mut SolverState) {
        let (omega, parallel) = (self.config.momentum, self.config.parallel_dual_updates);
        if self.config.lse_mode {
            lse_step(problem, state, omega, parallel);
        } else {
            kernel_step(problem, state, omega, parallel);
        }
        state.iteration += 1;
    }

    /// p-norm distance between the coupling's target marginal and `b`.
    ///
    /// After a full sequential iteration the source marginal matches `a`
    /// exactly, so only the target side is measured. Parallel updates leave
    /// both sides off, and the two distances are added.
    fn solution_error(&self, problem: &GridProblem, state: &SolverState) -> f64 {
        let p = self.config.norm_error;
        let distance = |marginal: ArrayD<f64>, target: &ArrayD<f64>| -> f64 {
            Zip::from(&marginal)
                .and(target)
                .fold(0.0, |acc, &m, &t| acc + (m - t).abs().powf(p))
                .powf(1.0 / p)
        };
        let (fu, gv) = (&state.fu, &state.gv);
        let lse = self.config.lse_mode;
        let target = if lse {
            problem.target_marginal(fu, gv)
        } else {
            gv * &problem.geom.kernel_all(fu, true)
        };
        let mut err = distance(target, &problem.b);
        if self.config.parallel_dual_updates {
            let source = if lse {
                problem.source_marginal(fu, gv)
            } else {
                fu * &problem.geom.kernel_all(gv, false)
            };
            err += distance(source, &problem.a);
        }
        err
    }

    fn output_from_state(
        &self,
        problem: GridProblem,
        state: &SolverState,
        converged: bool,
    ) -> SinkhornOutput {
        let eps = problem.epsilon();
        let (mut f, mut g) = state.potentials(self.config.lse_mode, eps);
        let total = total_mass(&problem, state, self.config.lse_mode);
        let reg_ot_cost = problem.reg_cost(&f, &g, total);
        if self.config.recenter_potentials {
            recenter(&mut f, &mut g);
        }
        SinkhornOutput::new(
            Grid::flatten(&f),
            Grid::flatten(&g),
            reg_ot_cost,
            state.errors.clone(),
            converged,
            state.iteration,
            self.config.lse_mode,
            problem,
        )
    }
}

/// `g ← ε log b − ε LSE_i((f_i − C_ij)/ε)`, then the same for `f` against
/// the new `g` (the old one under parallel updates). Both are relaxed by `ω`.
fn lse_step(problem: &GridProblem, state: &mut SolverState, omega: f64, parallel: bool) {
    let eps = problem.epsilon();
    let h = problem.geom.lse_kernel_all(&(&state.fu / eps), true);
    let gv = relax(&state.gv, update_potential(&problem.log_b, &h, eps), omega, true);
    let g_src = if parallel { &state.gv } else { &gv };
    let l = problem.geom.lse_kernel_all(&(g_src / eps), false);
    state.fu = relax(&state.fu, update_potential(&problem.log_a, &l, eps), omega, true);
    state.gv = gv;
}

/// `v ← b / Kᵀu`, then `u ← a / Kv`, relaxed by `ω`.
fn kernel_step(problem: &GridProblem, state: &mut SolverState, omega: f64, parallel: bool) {
    let ktu = problem.geom.kernel_all(&state.fu, true);
    let gv = relax(&state.gv, &problem.b / &ktu, omega, false);
    let v_src = if parallel { &state.gv } else { &gv };
    let kv = problem.geom.kernel_all(v_src, false);
    state.fu = relax(&state.fu, &problem.a / &kv, omega, false);
    state.gv = gv;
}

/// Total mass `Σ P` of the coupling held by `state`.
pub(crate) fn total_mass(problem: &GridProblem, state: &SolverState, lse_mode: bool) -> f64 {
    if lse_mode {
        problem.source_marginal(&state.fu, &state.gv).sum()
    } else {
        (&state.fu * &problem.geom.kernel_all(&state.gv, false)).sum()
    }
}

/// Solve the regularized transport problem between `a` and `b` on `geom`.
///
/// `a` and `b` are probability vectors over the grid's flattened points. All
/// precondition failures are reported before the first iteration; running out
/// of iterations is reported through [`SinkhornOutput::converged`].
///
/// ```rust
/// use ndarray::Array1;
/// use wass_grid::{solve, Grid, SinkhornConfig};
///
/// let grid = Grid::from_sizes(&[3, 4], 0.1).unwrap();
/// let a = Array1::from_elem(12, 1.0 / 12.0);
/// let b = Array1::from_shape_fn(12, |i| (i + 1) as f64 / 78.0);
/// let out = solve(&grid, &a, &b, &SinkhornConfig::default()).unwrap();
/// assert!(out.converged());
/// ```
pub fn solve(
    geom: &Grid,
    a: &Array1<f64>,
    b: &Array1<f64>,
    config: &SinkhornConfig,
) -> Result<SinkhornOutput> {
    Sinkhorn::new(config.clone())?.solve(geom, a, b)
}
