//! # wass-grid
//!
//! Entropic optimal transport between histograms on regular grids, with
//! gradients.
//!
//! ## The Problem
//!
//! Two probability histograms `a` and `b` live on the same Cartesian grid of
//! shape `n_1 × … × n_d`. Moving mass from point `i` to point `j` costs
//! \(C_{ij} = \sum_k c(x_k[i_k], x_k[j_k])\), a sum of one scalar cost per axis.
//! The regularized problem
//!
//! \[
//! \mathrm{OT}_\varepsilon(a, b) = \min_{P \in U(a, b)}
//! \langle P, C \rangle + \varepsilon\, \mathrm{KL}(P \,\|\, a b^\top)
//! \]
//!
//! is solved by Sinkhorn iterations. The cost and kernel matrices have
//! `N² = (Π n_k)²` entries, but because the cost is separable the kernel
//! factorizes as \(K = K_1 \otimes \dots \otimes K_d\), and every product with
//! it is a sequence of `d` small per-axis contractions. Nothing of size `N²`
//! is ever allocated.
//!
//! ## Key Types
//!
//! | Item | Role |
//! |------|------|
//! | [`Grid`] | Per-axis coordinates, costs and kernels; factorized kernel application |
//! | [`solve`] / [`Sinkhorn`] | Sinkhorn solver, multiplicative or log-domain |
//! | [`SinkhornOutput`] | Potentials, cost, convergence record, coupling queries |
//! | [`value_and_grad`] | Cost plus gradients in `a`, `b` and grid coordinates |
//! | [`AxisCost`] | Scalar per-axis ground cost ([`SqEuclidean`] by default) |
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::Array1;
//! use wass_grid::{solve, value_and_grad, Grid, Implicit, SinkhornConfig};
//!
//! let grid = Grid::from_sizes(&[4, 5], 0.1)?;
//! let n = grid.num_points();
//! let a = Array1::from_elem(n, 1.0 / n as f64);
//! let b = Array1::from_shape_fn(n, |i| (i + 1) as f64 / (n * (n + 1) / 2) as f64);
//!
//! let out = solve(&grid, &a, &b, &SinkhornConfig::default())?;
//! assert!(out.converged());
//!
//! let config = SinkhornConfig::new().with_threshold(1e-6);
//! let (_, grads) = value_and_grad(&grid, &a, &b, &config, &Implicit)?;
//! assert_eq!(grads.coords[1].len(), 5);
//! # Ok::<(), wass_grid::Error>(())
//! ```
//!
//! ## Modes
//!
//! - **Log-domain** (`lse_mode = true`, default): iterates on potentials
//!   `(f, g)` with log-sum-exp reductions. Stable for any `ε`.
//! - **Multiplicative** (`lse_mode = false`): iterates on scalings
//!   `(u, v) = (e^{f/ε}, e^{g/ε})`. Cheaper per step, but the kernel underflows
//!   once costs reach a few hundred times `ε`.
//!
//! ## What Can Go Wrong
//!
//! 1. **Divergence in multiplicative mode**: small `ε` underflows the kernel
//!    and the marginal error becomes NaN. The solve stops with
//!    `converged() == false`; rerun with `lse_mode`.
//! 2. **Budget exhausted**: not an error. Check [`SinkhornOutput::converged`]
//!    and [`SinkhornOutput::errors`].
//! 3. **Implicit gradients at a loose threshold**: envelope gradients are only
//!    exact at the fixed point. Tighten the threshold or use [`Unrolled`].
//! 4. **Zero-mass entries**: potentials there are `-inf` and weight gradients
//!    there are not finite.
//! 5. **Parallel updates oscillate**: with `parallel_dual_updates` the two
//!    potentials drift apart unless the updates are averaged
//!    (`momentum < 1`, e.g. `0.5`).
//!
//! ## References
//!
//! - Cuturi (2013). "Sinkhorn Distances: Lightspeed Computation of Optimal Transport"
//! - Solomon et al. (2015). "Convolutional Wasserstein Distances"
//! - Peyré & Cuturi (2019). "Computational Optimal Transport"

use thiserror::Error;

pub mod autodiff;
pub mod cost;
pub mod grid;
pub mod kernel;
pub mod output;
pub mod sinkhorn;

pub use autodiff::{value_and_grad, Differentiation, Gradients, Implicit, Unrolled};
pub use cost::{AxisCost, PNorm, SqEuclidean};
pub use grid::Grid;
pub use output::SinkhornOutput;
pub use sinkhorn::{solve, GridProblem, Sinkhorn, SinkhornConfig};

/// Grid transport error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// A vector does not have the expected length.
    #[error("length mismatch: expected {0}, got {1}")]
    LengthMismatch(usize, usize),

    /// A tensor does not have the grid's shape.
    #[error("grid shape mismatch: expected {expected:?}, got {got:?}")]
    GridShapeMismatch {
        /// Grid shape.
        expected: Vec<usize>,
        /// Shape received.
        got: Vec<usize>,
    },

    /// Distribution does not sum to 1.0.
    #[error("distribution does not sum to 1.0 (sum = {0})")]
    NotNormalized(f64),

    /// Invalid regularization parameter.
    #[error("regularization parameter must be positive and finite, got {0}")]
    InvalidRegularization(f64),

    /// Invalid convergence threshold.
    #[error("convergence threshold must be positive and finite, got {0}")]
    InvalidThreshold(f64),

    /// Invalid solver configuration.
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(&'static str),

    /// A grid needs at least one axis and one point per axis.
    #[error("grid must have at least one axis and one point per axis")]
    EmptyGrid,

    /// Domain error (invalid inputs for the mathematical definition).
    #[error("{0}")]
    Domain(&'static str),

    /// Reshaping a vector into grid shape failed.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// Result type for grid transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Numerically stable \(\log \sum_i \exp(x_i)\) for an indexable family.
///
/// \[
/// \log \sum_i \exp(x_i) = m + \log \sum_i \exp(x_i - m), \quad m = \max_i x_i
/// \]
///
/// Returns `-∞` if `len == 0`.
#[inline]
pub(crate) fn logsumexp_by(len: usize, mut f: impl FnMut(usize) -> f64) -> f64 {
    if len == 0 {
        return f64::NEG_INFINITY;
    }

    let mut max_val = f64::NEG_INFINITY;
    for i in 0..len {
        max_val = max_val.max(f(i));
    }
    if !max_val.is_finite() {
        // all -inf, or +inf somewhere
        return max_val;
    }

    let mut sum_exp = 0.0;
    for i in 0..len {
        sum_exp += (f(i) - max_val).exp();
    }
    max_val + sum_exp.ln()
}

/// Signed log-sum-exp: for terms `s_i · exp(x_i)` returns `(log |Σ|, sign Σ)`.
///
/// Terms with `s_i == 0` are skipped. An empty or exactly cancelling sum is
/// `(-∞, 0)`. With infinite terms the sign is that of the infinite part, and
/// infinities of opposite sign give `(NaN, 0)`.
#[inline]
pub(crate) fn logsumexp_signed_by(len: usize, mut f: impl FnMut(usize) -> (f64, f64)) -> (f64, f64) {
    let mut max_val = f64::NEG_INFINITY;
    for i in 0..len {
        let (x, s) = f(i);
        if s != 0.0 {
            max_val = max_val.max(x);
        }
    }
    if max_val == f64::NEG_INFINITY {
        return (f64::NEG_INFINITY, 0.0);
    }
    if max_val == f64::INFINITY {
        // only the infinite terms matter; opposite infinities are indeterminate
        let mut weight = 0.0;
        for i in 0..len {
            let (x, s) = f(i);
            if x == f64::INFINITY {
                weight += s;
            }
        }
        if weight == 0.0 {
            return (f64::NAN, 0.0);
        }
        return (f64::INFINITY, weight.signum());
    }

    let mut sum = 0.0;
    for i in 0..len {
        let (x, s) = f(i);
        if s != 0.0 {
            sum += s * (x - max_val).exp();
        }
    }
    if sum == 0.0 {
        return (f64::NEG_INFINITY, 0.0);
    }
    (max_val + sum.abs().ln(), sum.signum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn logsumexp_empty_and_neg_infinity() {
        assert_eq!(logsumexp_by(0, |_| 0.0), f64::NEG_INFINITY);
        assert_eq!(logsumexp_by(3, |_| f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert_eq!(logsumexp_signed_by(0, |_| (0.0, 1.0)), (f64::NEG_INFINITY, 0.0));
    }

    #[test]
    fn signed_logsumexp_cancellation() {
        let xs = [(1.5_f64.ln(), 1.0), (1.5_f64.ln(), -1.0)];
        assert_eq!(logsumexp_signed_by(2, |i| xs[i]), (f64::NEG_INFINITY, 0.0));

        let xs = [(2.0_f64.ln(), 1.0), (3.0_f64.ln(), -1.0), (10.0, 0.0)];
        let (l, s) = logsumexp_signed_by(3, |i| xs[i]);
        assert_eq!(s, -1.0);
        assert!(l.abs() < 1e-12, "log|2 - 3| should be 0, got {l}");
    }

    #[test]
    fn signed_logsumexp_infinite_terms_keep_their_sign() {
        let xs = [(f64::INFINITY, -1.0), (3.0, 1.0)];
        assert_eq!(logsumexp_signed_by(2, |i| xs[i]), (f64::INFINITY, -1.0));
        let xs = [(1.0, -1.0), (f64::INFINITY, 2.0)];
        assert_eq!(logsumexp_signed_by(2, |i| xs[i]), (f64::INFINITY, 1.0));
        let xs = [(f64::INFINITY, 1.0), (f64::INFINITY, -1.0)];
        let (l, s) = logsumexp_signed_by(2, |i| xs[i]);
        assert!(l.is_nan());
        assert_eq!(s, 0.0);
    }

    #[test]
    fn error_messages_name_the_problem() {
        let e = Error::GridShapeMismatch { expected: vec![2, 3], got: vec![6] };
        assert_eq!(e.to_string(), "grid shape mismatch: expected [2, 3], got [6]");
        assert!(Error::InvalidThreshold(-1.0).to_string().contains("-1"));
    }

    proptest! {
        #[test]
        fn logsumexp_translation_invariant(
            xs in prop::collection::vec(-500.0f64..500.0, 1..64),
            shift in -100.0f64..100.0
        ) {
            let l1 = logsumexp_by(xs.len(), |i| xs[i]);
            let l2 = logsumexp_by(xs.len(), |i| xs[i] + shift);
            prop_assert!((l2 - (l1 + shift)).abs() < 1e-9);
        }

        #[test]
        fn logsumexp_matches_naive_on_safe_range(
            xs in prop::collection::vec(-50.0f64..50.0, 1..64),
        ) {
            // the naive form over/underflows outside a moderate range
            let naive = xs.iter().map(|&x| x.exp()).sum::<f64>().ln();
            let stable = logsumexp_by(xs.len(), |i| xs[i]);
            prop_assert!((stable - naive).abs() < 1e-9);
        }

        #[test]
        fn logsumexp_bounds_by_max(
            xs in prop::collection::vec(-500.0f64..500.0, 1..64),
        ) {
            let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let lse = logsumexp_by(xs.len(), |i| xs[i]);
            // max <= logsumexp <= max + ln(n)
            prop_assert!(lse >= max - 1e-9);
            prop_assert!(lse <= max + (xs.len() as f64).ln() + 1e-9);
        }

        #[test]
        fn signed_logsumexp_matches_linear_sum(
            terms in prop::collection::vec((-20.0f64..20.0, -1i8..=1), 1..32),
        ) {
            let linear: f64 = terms.iter().map(|&(x, s)| s as f64 * x.exp()).sum();
            let (l, s) = logsumexp_signed_by(terms.len(), |i| (terms[i].0, terms[i].1 as f64));
            let back = s * l.exp();
            let scale = terms.iter().map(|&(x, _)| x.exp()).fold(0.0, f64::max);
            prop_assert!((back - linear).abs() <= 1e-12 * scale.max(1.0));
        }

        #[test]
        fn signed_logsumexp_agrees_with_unsigned_for_positive_terms(
            xs in prop::collection::vec(-300.0f64..300.0, 1..32),
        ) {
            let (l, s) = logsumexp_signed_by(xs.len(), |i| (xs[i], 1.0));
            prop_assert_eq!(s, 1.0);
            prop_assert!((l - logsumexp_by(xs.len(), |i| xs[i])).abs() < 1e-9);
        }
    }
}
