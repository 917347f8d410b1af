//! Per-axis ground costs.
//!
//! A grid geometry is separable: the cost between two grid points is the sum
//! over axes of a scalar cost between their coordinates on that axis,
//!
//! \[
//! C(i, j) = \sum_k c(x_k[i_k], x_k[j_k]).
//! \]
//!
//! The default is [`SqEuclidean`], which makes \(C\) the squared Euclidean
//! distance between grid points.

use crate::{Error, Result};
use ndarray::{Array1, Array2};
use std::fmt;

/// A scalar cost between two coordinates on one axis.
///
/// Implementations must be differentiable in both arguments wherever the
/// gradient with respect to grid coordinates is requested.
pub trait AxisCost: fmt::Debug + Send + Sync {
    /// Cost `c(x, y)`.
    fn pairwise(&self, x: f64, y: f64) -> f64;

    /// Partial derivatives `(∂c/∂x, ∂c/∂y)` at `(x, y)`.
    fn grad(&self, x: f64, y: f64) -> (f64, f64);

    /// Square matrix `C[p, q] = c(xs[p], xs[q])`.
    fn cost_matrix(&self, xs: &Array1<f64>) -> Array2<f64> {
        let n = xs.len();
        Array2::from_shape_fn((n, n), |(p, q)| self.pairwise(xs[p], xs[q]))
    }
}

/// `c(x, y) = (x - y)²`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SqEuclidean;

impl AxisCost for SqEuclidean {
    #[inline]
    fn pairwise(&self, x: f64, y: f64) -> f64 {
        let d = x - y;
        d * d
    }

    #[inline]
    fn grad(&self, x: f64, y: f64) -> (f64, f64) {
        let d = 2.0 * (x - y);
        (d, -d)
    }
}

/// `c(x, y) = |x - y|^p` with `p >= 1`.
///
/// Summed over axes this is the p-th power of the \(\ell_p\) distance between
/// grid points. At `x == y` the derivative is taken to be zero, which is exact
/// for `p > 1` and a valid subgradient for `p == 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PNorm {
    p: f64,
}

impl PNorm {
    /// Create a `|x - y|^p` cost. Fails unless `p` is finite and `>= 1`.
    pub fn new(p: f64) -> Result<Self> {
        if !p.is_finite() || p < 1.0 {
            return Err(Error::Domain("p-norm cost requires a finite p >= 1"));
        }
        Ok(Self { p })
    }

    /// The exponent `p`.
    pub fn p(&self) -> f64 {
        self.p
    }
}

impl AxisCost for PNorm {
    #[inline]
    fn pairwise(&self, x: f64, y: f64) -> f64 {
        (x - y).abs().powf(self.p)
    }

    fn grad(&self, x: f64, y: f64) -> (f64, f64) {
        let d = x - y;
        if d == 0.0 {
            return (0.0, 0.0);
        }
        let dx = self.p * d.abs().powf(self.p - 1.0) * d.signum();
        (dx, -dx)
    }
}
