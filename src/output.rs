//! Solver results.

use crate::grid::Grid;
use crate::sinkhorn::GridProblem;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayD, Zip};

/// Result of a Sinkhorn solve.
///
/// Holds the final potentials together with the problem they solve, so the
/// coupling `P_ij = exp((f_i + g_j − C_ij)/ε)` can be queried without ever
/// being materialized.
#[derive(Debug, Clone)]
pub struct SinkhornOutput {
    f: Array1<f64>,
    g: Array1<f64>,
    reg_ot_cost: f64,
    errors: Vec<f64>,
    converged: bool,
    n_iters: usize,
    lse_mode: bool,
    problem: GridProblem,
}

impl SinkhornOutput {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        f: Array1<f64>,
        g: Array1<f64>,
        reg_ot_cost: f64,
        errors: Vec<f64>,
        converged: bool,
        n_iters: usize,
        lse_mode: bool,
        problem: GridProblem,
    ) -> Self {
        Self { f, g, reg_ot_cost, errors, converged, n_iters, lse_mode, problem }
    }

    /// Source potential, one entry per grid point. `-inf` where `a` is zero.
    pub fn f(&self) -> &Array1<f64> {
        &self.f
    }

    /// Target potential, one entry per grid point. `-inf` where `b` is zero.
    pub fn g(&self) -> &Array1<f64> {
        &self.g
    }

    /// Regularized transport cost.
    pub fn reg_ot_cost(&self) -> f64 {
        self.reg_ot_cost
    }

    /// Marginal error at each convergence check, in order.
    pub fn errors(&self) -> &[f64] {
        &self.errors
    }

    /// Whether the error dropped below the threshold within the budget.
    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Iterations performed.
    pub fn n_iters(&self) -> usize {
        self.n_iters
    }

    /// Whether the solve ran in log-domain mode.
    pub fn lse_mode(&self) -> bool {
        self.lse_mode
    }

    /// Regularization the problem was solved at.
    pub fn epsilon(&self) -> f64 {
        self.problem.epsilon()
    }

    /// Geometry the problem was solved on.
    pub fn geom(&self) -> &Grid {
        self.problem.geom()
    }

    /// Scalings `(u, v) = (exp(f/ε), exp(g/ε))`.
    pub fn scalings(&self) -> (Array1<f64>, Array1<f64>) {
        let eps = self.epsilon();
        (self.f.mapv(|x| (x / eps).exp()), self.g.mapv(|x| (x / eps).exp()))
    }

    fn grid_potentials(&self) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let geom = self.geom();
        Ok((geom.to_grid_tensor(&self.f)?, geom.to_grid_tensor(&self.g)?))
    }

    /// Marginal of the coupling: `axis = 0` sums over sources (compare with
    /// `b`), `axis = 1` sums over targets (compare with `a`).
    pub fn marginal(&self, axis: usize) -> Result<Array1<f64>> {
        let (f, g) = self.grid_potentials()?;
        let m = match axis {
            0 => self.problem.target_marginal(&f, &g),
            1 => self.problem.source_marginal(&f, &g),
            _ => return Err(Error::Domain("marginal axis must be 0 or 1")),
        };
        Ok(Grid::flatten(&m))
    }

    /// Total mass of the coupling.
    pub fn transport_mass(&self) -> Result<f64> {
        Ok(self.marginal(0)?.sum())
    }

    /// `⟨a, f⟩ + ⟨b, g⟩` over entries with positive mass.
    pub fn dual_cost(&self) -> f64 {
        let dot = |w: &ArrayD<f64>, h: &Array1<f64>| -> f64 {
            w.iter()
                .zip(h.iter())
                .filter(|(wi, _)| **wi > 0.0)
                .map(|(wi, hi)| wi * hi)
                .sum()
        };
        dot(self.problem.a(), &self.f) + dot(self.problem.b(), &self.g)
    }

    /// `⟨P, C⟩` computed axis by axis as `Σ_k ⟨M_k, C_k⟩`.
    pub fn primal_cost(&self) -> Result<f64> {
        let couplings = self.axis_couplings()?;
        Ok(couplings
            .iter()
            .zip(self.geom().axis_costs())
            .map(|(m, c)| (m * c).sum())
            .sum())
    }

    /// Per-axis marginals of the coupling:
    /// `M_k[p, q] = Σ_{i_k = p, j_k = q} P_ij`.
    pub fn axis_couplings(&self) -> Result<Vec<Array2<f64>>> {
        let (f, g) = self.grid_potentials()?;
        let eps = self.epsilon();
        let geom = self.geom();
        if self.lse_mode {
            let (lf, lg) = (&f / eps, &g / eps);
            let (sf, sg) = (ArrayD::ones(f.raw_dim()), ArrayD::ones(g.raw_dim()));
            Ok(geom.couplings_lse((&lf, &sf), (&lg, &sg)))
        } else {
            let (u, v) = ((&f / eps).mapv(f64::exp), (&g / eps).mapv(f64::exp));
            Ok(geom.couplings(&u, &v))
        }
    }

    /// Apply the coupling to a vector: `P x`, or `Pᵀ x` when `transpose`.
    ///
    /// Runs in the log domain with signed accumulation, so `x` may have
    /// entries of either sign.
    pub fn apply(&self, inputs: &Array1<f64>, transpose: bool) -> Result<Array1<f64>> {
        let geom = self.geom();
        let eps = self.epsilon();
        let x = geom.to_grid_tensor(inputs)?;
        let (f, g) = self.grid_potentials()?;
        // P x = e^{f/ε} ⊙ K (e^{g/ε} ⊙ x); the transpose swaps the roles of f and g.
        let (inner, outer) = if transpose { (&f, &g) } else { (&g, &f) };
        let log = Zip::from(&x).and(inner).map_collect(|&xi, &h| xi.abs().ln() + h / eps);
        let sign = x.mapv(|xi| if xi == 0.0 { 0.0 } else { xi.signum() });
        let (lo, so) = geom.signed_lse_kernel_all(&log, &sign, transpose);
        let out = Zip::from(&lo)
            .and(&so)
            .and(outer)
            .map_collect(|&l, &s, &h| s * (l + h / eps).exp());
        Ok(Grid::flatten(&out))
    }
}
