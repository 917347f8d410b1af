//! Gradients of the regularized cost.
//!
//! Two strategies differentiate `reg_ot_cost` with respect to the marginal
//! weights `a`, `b` and the grid coordinates:
//!
//! - [`Implicit`] treats the potentials as optimal (envelope theorem). The
//!   gradient is read off the solution with no extra solves. It is exact at
//!   the fixed point and degrades with the residual marginal error, so pair it
//!   with a tight threshold.
//! - [`Unrolled`] replays the recorded iterates backwards (reverse mode through
//!   every update). It is the exact derivative of the computed value, whatever
//!   the threshold, at the price of keeping every iterate in memory.
//!
//! Coordinate gradients pass through the per-axis cost matrices: every
//! contribution to `∂L/∂C` is a rank-structured term `x_i K_ij y_j`, which is
//! reduced to one `n_k × n_k` matrix per axis before the chain rule to the
//! coordinates. The dense cost matrix is never formed.

use crate::grid::Grid;
use crate::output::SinkhornOutput;
use crate::sinkhorn::{
    relaxes, update_potential, GridProblem, IterationTrace, Sinkhorn, SinkhornConfig, SolverState,
};
use crate::Result;
use ndarray::{Array1, Array2, ArrayD, Zip};
use tracing::trace;

/// Gradient of `reg_ot_cost`.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// `∂L/∂a`, flattened like `a`.
    pub a: Array1<f64>,
    /// `∂L/∂b`, flattened like `b`.
    pub b: Array1<f64>,
    /// `∂L/∂x_k`, one array per axis.
    pub coords: Vec<Array1<f64>>,
}

/// A way to differentiate a Sinkhorn solve.
pub trait Differentiation {
    /// Solve and differentiate `reg_ot_cost` with respect to `a`, `b` and the
    /// grid coordinates.
    fn value_and_grad(
        &self,
        geom: &Grid,
        a: &Array1<f64>,
        b: &Array1<f64>,
        config: &SinkhornConfig,
    ) -> Result<(SinkhornOutput, Gradients)>;
}

/// Envelope-theorem gradients at the returned potentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct Implicit;

/// Reverse-mode replay of every iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unrolled;

/// Solve and differentiate with the chosen strategy.
///
/// ```rust
/// use ndarray::Array1;
/// use wass_grid::{value_and_grad, Grid, SinkhornConfig, Unrolled};
///
/// let grid = Grid::from_sizes(&[2, 3], 0.5).unwrap();
/// let a = Array1::from_elem(6, 1.0 / 6.0);
/// let b = Array1::from_shape_fn(6, |i| (i + 1) as f64 / 21.0);
/// let (out, grads) = value_and_grad(&grid, &a, &b, &SinkhornConfig::default(), &Unrolled).unwrap();
/// assert!(out.reg_ot_cost().is_finite());
/// assert_eq!(grads.coords.len(), 2);
/// ```
pub fn value_and_grad(
    geom: &Grid,
    a: &Array1<f64>,
    b: &Array1<f64>,
    config: &SinkhornConfig,
    strategy: &dyn Differentiation,
) -> Result<(SinkhornOutput, Gradients)> {
    strategy.value_and_grad(geom, a, b, config)
}

/// Partial derivative of the cost expression with respect to a weight vector,
/// holding potentials fixed: `h − ε log w − ε + ε·Σw'`.
fn direct_weight_grad(
    h: &ArrayD<f64>,
    log_w: &ArrayD<f64>,
    other_mass: f64,
    eps: f64,
) -> ArrayD<f64> {
    Zip::from(h)
        .and(log_w)
        .map_collect(|&hi, &lw| hi - eps * lw - eps + eps * other_mass)
}

/// `(log |x|, sign x)`.
fn signed_log(x: &ArrayD<f64>) -> (ArrayD<f64>, ArrayD<f64>) {
    (
        x.mapv(|v| v.abs().ln()),
        x.mapv(|v| if v == 0.0 { 0.0 } else { v.signum() }),
    )
}

/// `w / x` where `w > 0`, zero elsewhere.
fn masked_ratio(w: &ArrayD<f64>, x: &ArrayD<f64>) -> ArrayD<f64> {
    Zip::from(w)
        .and(x)
        .map_collect(|&wi, &xi| if wi > 0.0 { wi / xi } else { 0.0 })
}

/// `x / w` where `w > 0`, zero elsewhere.
fn masked_quotient(x: &ArrayD<f64>, w: &ArrayD<f64>) -> ArrayD<f64> {
    Zip::from(x)
        .and(w)
        .map_collect(|&xi, &wi| if wi > 0.0 { xi / wi } else { 0.0 })
}

fn accumulate(total: &mut [Array2<f64>], terms: Vec<Array2<f64>>) {
    for (t, m) in total.iter_mut().zip(terms) {
        *t += &m;
    }
}

/// Plan couplings `Σ P_ij` per axis for the final iterate.
fn plan_couplings(problem: &GridProblem, state: &SolverState, lse_mode: bool) -> Vec<Array2<f64>> {
    let geom = problem.geom();
    if lse_mode {
        let eps = problem.epsilon();
        let (lf, lg) = (&state.fu / eps, &state.gv / eps);
        let ones = ArrayD::ones(lf.raw_dim());
        geom.couplings_lse((&lf, &ones), (&lg, &ones))
    } else {
        geom.couplings(&state.fu, &state.gv)
    }
}

fn assemble(
    geom: &Grid,
    a_bar: &ArrayD<f64>,
    b_bar: &ArrayD<f64>,
    cost_bar: &[Array2<f64>],
) -> Result<Gradients> {
    Ok(Gradients {
        a: Grid::flatten(a_bar),
        b: Grid::flatten(b_bar),
        coords: geom.coordinate_gradient(cost_bar)?,
    })
}

impl Differentiation for Implicit {
    fn value_and_grad(
        &self,
        geom: &Grid,
        a: &Array1<f64>,
        b: &Array1<f64>,
        config: &SinkhornConfig,
    ) -> Result<(SinkhornOutput, Gradients)> {
        let solver = Sinkhorn::new(config.clone())?;
        let problem = GridProblem::new(geom, a, b, config.epsilon)?;
        let (output, state) = solver.run(problem.clone(), None, None);

        let eps = problem.epsilon();
        let (f, g) = state.potentials(config.lse_mode, eps);
        let a_bar = direct_weight_grad(&f, problem.log_a(), problem.b().sum(), eps);
        let b_bar = direct_weight_grad(&g, problem.log_b(), problem.a().sum(), eps);
        let cost_bar = plan_couplings(&problem, &state, config.lse_mode);

        let grads = assemble(problem.geom(), &a_bar, &b_bar, &cost_bar)?;
        Ok((output, grads))
    }
}

impl Differentiation for Unrolled {
    fn value_and_grad(
        &self,
        geom: &Grid,
        a: &Array1<f64>,
        b: &Array1<f64>,
        config: &SinkhornConfig,
    ) -> Result<(SinkhornOutput, Gradients)> {
        let solver = Sinkhorn::new(config.clone())?;
        let problem = GridProblem::new(geom, a, b, config.epsilon)?;
        let mut history = IterationTrace::default();
        let (output, state) = solver.run(problem.clone(), None, Some(&mut history));

        let relaxation = Relaxation {
            omega: config.momentum,
            parallel: config.parallel_dual_updates,
        };
        let (a_bar, b_bar, cost_bar) = if config.lse_mode {
            backward_lse(&problem, &history, relaxation)
        } else {
            backward_kernel(&problem, &history, relaxation)
        };
        debug_assert_eq!(history.iterations(), state.iteration);

        let grads = assemble(problem.geom(), &a_bar, &b_bar, &cost_bar)?;
        Ok((output, grads))
    }
}

type Adjoints = (ArrayD<f64>, ArrayD<f64>, Vec<Array2<f64>>);

#[derive(Debug, Clone, Copy)]
struct Relaxation {
    omega: f64,
    parallel: bool,
}

impl Relaxation {
    /// Split the adjoint of a relaxed update `out = relax(old, new)` into the
    /// adjoints of `new` and `old`.
    fn split(
        &self,
        bar: &ArrayD<f64>,
        old: &ArrayD<f64>,
        new: &ArrayD<f64>,
        lse_mode: bool,
    ) -> (ArrayD<f64>, ArrayD<f64>) {
        let omega = self.omega;
        if omega == 1.0 {
            return (bar.clone(), ArrayD::zeros(bar.raw_dim()));
        }
        // potentials: ∂out/∂new = ω, ∂out/∂old = 1 − ω
        // scalings: out = old^(1−ω) new^ω, so ∂out/∂new = ω out/new, ∂out/∂old = (1 − ω) out/old
        let weights = |o: f64, n: f64| -> (f64, f64) {
            if !relaxes(o, n, lse_mode) {
                (1.0, 0.0)
            } else if lse_mode {
                (omega, 1.0 - omega)
            } else {
                let out = o.powf(1.0 - omega) * n.powf(omega);
                (omega * out / n, (1.0 - omega) * out / o)
            }
        };
        let new_bar = Zip::from(bar).and(old).and(new).map_collect(|&b, &o, &n| b * weights(o, n).0);
        let old_bar = Zip::from(bar).and(old).and(new).map_collect(|&b, &o, &n| b * weights(o, n).1);
        (new_bar, old_bar)
    }
}

/// Reverse pass through log-domain iterations.
///
/// Forward step `t → t+1`:
/// `g_new = ε log b − ε h`, `h_j = LSE_i((f_i − C_ij)/ε)`, `g' = relax(g, g_new)`,
/// then `f_new = ε log a − ε l`, `l_i = LSE_j((ĝ_j − C_ij)/ε)` with `ĝ = g'`
/// (or `ĝ = g` under parallel updates), and `f' = relax(f, f_new)`.
fn backward_lse(problem: &GridProblem, history: &IterationTrace, relaxation: Relaxation) -> Adjoints {
    let geom = problem.geom();
    let eps = problem.epsilon();
    let states = &history.states;
    let last = states.len() - 1;
    let (f_last, g_last) = &states[last];

    // ∂L/∂f = a − P1, ∂L/∂g = b − Pᵀ1 (ignoring zero-mass entries of a, b)
    let src = problem.source_marginal(f_last, g_last);
    let tgt = problem.target_marginal(f_last, g_last);
    let mut f_bar = Zip::from(problem.a()).and(&src).map_collect(|&w, &m| if w > 0.0 { w - m } else { 0.0 });
    let mut g_bar = Zip::from(problem.b()).and(&tgt).map_collect(|&w, &m| if w > 0.0 { w - m } else { 0.0 });
    let mut a_bar = direct_weight_grad(f_last, problem.log_a(), problem.b().sum(), eps);
    let mut b_bar = direct_weight_grad(g_last, problem.log_b(), problem.a().sum(), eps);
    let lf = f_last / eps;
    let lg = g_last / eps;
    let ones = ArrayD::ones(lf.raw_dim());
    let mut cost_bar = geom.couplings_lse((&lf, &ones), (&lg, &ones));

    for t in (0..last).rev() {
        let (f_prev, g_prev) = &states[t];
        let (_, g_next) = &states[t + 1];
        let g_src = if relaxation.parallel { g_prev } else { g_next };
        let lg_src = g_src / eps;

        // f' = relax(f, f_new), f_new = ε log a − ε l(ĝ, C)
        let l = geom.lse_kernel_all(&lg_src, false);
        let f_new = update_potential(problem.log_a(), &l, eps);
        let (f_new_bar, mut f_prev_bar) = relaxation.split(&f_bar, f_prev, &f_new, true);
        a_bar += &(eps * &masked_quotient(&f_new_bar, problem.a()));
        let (log_f_bar, sign_f_bar) = signed_log(&f_new_bar);
        let left = &log_f_bar - &l;
        let (lo, so) = geom.signed_lse_kernel_all(&left, &sign_f_bar, true);
        // ∂f_new_i/∂ĝ_j = −T_ij with T_ij = exp((ĝ_j − C_ij)/ε − l_i)
        let g_src_bar = Zip::from(&lo)
            .and(&so)
            .and(&lg_src)
            .map_collect(|&lv, &s, &lgj| -s * (lv + lgj).exp());
        accumulate(&mut cost_bar, geom.couplings_lse((&left, &sign_f_bar), (&lg_src, &ones)));

        let (g_total, mut g_prev_bar) = if relaxation.parallel {
            (g_bar, g_src_bar)
        } else {
            (&g_bar + &g_src_bar, ArrayD::zeros(g_bar.raw_dim()))
        };

        // g' = relax(g, g_new), g_new = ε log b − ε h(f, C)
        let lf_prev = f_prev / eps;
        let h = geom.lse_kernel_all(&lf_prev, true);
        let g_new = update_potential(problem.log_b(), &h, eps);
        let (g_new_bar, g_direct) = relaxation.split(&g_total, g_prev, &g_new, true);
        g_prev_bar += &g_direct;
        b_bar += &(eps * &masked_quotient(&g_new_bar, problem.b()));
        let (log_g_bar, sign_g_bar) = signed_log(&g_new_bar);
        let right = &log_g_bar - &h;
        let (lo, so) = geom.signed_lse_kernel_all(&right, &sign_g_bar, false);
        f_prev_bar += &Zip::from(&lo)
            .and(&so)
            .and(&lf_prev)
            .map_collect(|&lv, &s, &lfi| -s * (lv + lfi).exp());
        accumulate(&mut cost_bar, geom.couplings_lse((&lf_prev, &ones), (&right, &sign_g_bar)));

        f_bar = f_prev_bar;
        g_bar = g_prev_bar;
        if t % 100 == 0 {
            trace!(iteration = t, "log-domain reverse pass");
        }
    }
    (a_bar, b_bar, cost_bar)
}

/// Reverse pass through multiplicative iterations.
///
/// Forward step `t → t+1`: `v' = relax(v, b / Kᵀu)`, then
/// `u' = relax(u, a / K v̂)` with `v̂ = v'` (or `v̂ = v` under parallel updates).
fn backward_kernel(problem: &GridProblem, history: &IterationTrace, relaxation: Relaxation) -> Adjoints {
    let geom = problem.geom();
    let eps = problem.epsilon();
    let states = &history.states;
    let last = states.len() - 1;
    let (u_last, v_last) = &states[last];

    // L = Σ a ε log u + Σ b ε log v − ε Σ u ⊙ K v + const
    let mut u_bar = eps * &masked_ratio(problem.a(), u_last) - eps * &geom.kernel_all(v_last, false);
    let mut v_bar = eps * &masked_ratio(problem.b(), v_last) - eps * &geom.kernel_all(u_last, true);
    let (f_last, g_last) = (u_last.mapv(|u| eps * u.ln()), v_last.mapv(|v| eps * v.ln()));
    let mut a_bar = direct_weight_grad(&f_last, problem.log_a(), problem.b().sum(), eps);
    let mut b_bar = direct_weight_grad(&g_last, problem.log_b(), problem.a().sum(), eps);
    let mut cost_bar = geom.couplings(u_last, v_last);

    for t in (0..last).rev() {
        let (u_prev, v_prev) = &states[t];
        let (_, v_next) = &states[t + 1];
        let v_src = if relaxation.parallel { v_prev } else { v_next };

        // u_new = a / s, s = K v̂
        let s = geom.kernel_all(v_src, false);
        let u_new = problem.a() / &s;
        let (u_new_bar, mut u_prev_bar) = relaxation.split(&u_bar, u_prev, &u_new, false);
        a_bar += &(&u_new_bar / &s);
        let s_bar = -(&u_new_bar * &u_new) / &s;
        let v_src_bar = geom.kernel_all(&s_bar, true);
        accumulate(&mut cost_bar, geom.couplings(&(&s_bar / -eps), v_src));

        let (v_total, mut v_prev_bar) = if relaxation.parallel {
            (v_bar, v_src_bar)
        } else {
            (&v_bar + &v_src_bar, ArrayD::zeros(v_bar.raw_dim()))
        };

        // v_new = b / r, r = Kᵀ u
        let r = geom.kernel_all(u_prev, true);
        let v_new = problem.b() / &r;
        let (v_new_bar, v_direct) = relaxation.split(&v_total, v_prev, &v_new, false);
        v_prev_bar += &v_direct;
        b_bar += &(&v_new_bar / &r);
        let r_bar = -(&v_new_bar * &v_new) / &r;
        u_prev_bar += &geom.kernel_all(&r_bar, false);
        accumulate(&mut cost_bar, geom.couplings(u_prev, &(&r_bar / -eps)));

        u_bar = u_prev_bar;
        v_bar = v_prev_bar;
        if t % 100 == 0 {
            trace!(iteration = t, "kernel reverse pass");
        }
    }
    (a_bar, b_bar, cost_bar)
}
