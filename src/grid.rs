//! Grid geometry: the Cartesian product of per-axis coordinate arrays.
//!
//! Points are indexed by their flattened row-major position: the last axis
//! varies fastest. Measures, potentials and scalings are vectors over that
//! index space and are reshaped to the grid shape for kernel application.
//!
//! The ground cost is separable, `C(i, j) = Σ_k c(x_k[i_k], x_k[j_k])`, so the
//! Gibbs kernel `exp(-C/ε)` is the Kronecker product of the per-axis kernels
//! `exp(-C_k/ε)` and never has to be materialized.
//!
//! ## Default metric
//!
//! [`Grid::from_sizes`] places `n` evenly spaced coordinates on `[0, 1]` along
//! each axis (`linspace(0, 1, n)`, or `[0]` for a single point) and uses the
//! squared Euclidean per-axis cost. The resulting ground cost is the squared
//! Euclidean distance between points of the unit cube.

use crate::cost::{AxisCost, SqEuclidean};
use crate::kernel;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayD, IxDyn};
use std::sync::Arc;

/// A separable grid geometry with its regularization `ε`.
#[derive(Debug, Clone)]
pub struct Grid {
    coords: Vec<Array1<f64>>,
    shape: Vec<usize>,
    cost_fn: Arc<dyn AxisCost>,
    epsilon: f64,
    costs: Vec<Array2<f64>>,
    kernels: Vec<Array2<f64>>,
    log_kernels: Vec<Array2<f64>>,
}

fn unit_coords(n: usize) -> Array1<f64> {
    match n {
        0 => Array1::zeros(0),
        1 => Array1::zeros(1),
        _ => Array1::linspace(0.0, 1.0, n),
    }
}

fn check_epsilon(epsilon: f64) -> Result<()> {
    if epsilon <= 0.0 || !epsilon.is_finite() {
        return Err(Error::InvalidRegularization(epsilon));
    }
    Ok(())
}

/// Kronecker product of two square matrices.
fn kron(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    let (m, n) = (a.nrows(), b.nrows());
    Array2::from_shape_fn((m * n, m * n), |(r, c)| a[[r / n, c / n]] * b[[r % n, c % n]])
}

impl Grid {
    /// Grid with `sizes[k]` evenly spaced points on `[0, 1]` along axis `k`.
    ///
    /// See the [module docs](self) for the default metric.
    pub fn from_sizes(sizes: &[usize], epsilon: f64) -> Result<Self> {
        Self::from_coords(sizes.iter().map(|&n| unit_coords(n)).collect(), epsilon)
    }

    /// Grid with explicit per-axis coordinates.
    pub fn from_coords(coords: Vec<Array1<f64>>, epsilon: f64) -> Result<Self> {
        if coords.is_empty() || coords.iter().any(|x| x.is_empty()) {
            return Err(Error::EmptyGrid);
        }
        if coords.iter().flat_map(|x| x.iter()).any(|v| !v.is_finite()) {
            return Err(Error::Domain("grid coordinates must be finite"));
        }
        check_epsilon(epsilon)?;

        let shape = coords.iter().map(|x| x.len()).collect();
        let mut grid = Self {
            coords,
            shape,
            cost_fn: Arc::new(SqEuclidean),
            epsilon,
            costs: Vec::new(),
            kernels: Vec::new(),
            log_kernels: Vec::new(),
        };
        grid.rebuild_costs();
        Ok(grid)
    }

    /// Use `cost` on every axis instead of the squared Euclidean default.
    pub fn with_cost_fn<C: AxisCost + 'static>(mut self, cost: C) -> Self {
        self.cost_fn = Arc::new(cost);
        self.rebuild_costs();
        self
    }

    /// Same grid with a different regularization.
    pub fn with_epsilon(mut self, epsilon: f64) -> Result<Self> {
        check_epsilon(epsilon)?;
        self.epsilon = epsilon;
        self.rebuild_kernels();
        Ok(self)
    }

    fn rebuild_costs(&mut self) {
        self.costs = self.coords.iter().map(|x| self.cost_fn.cost_matrix(x)).collect();
        self.rebuild_kernels();
    }

    fn rebuild_kernels(&mut self) {
        let eps = self.epsilon;
        self.log_kernels = self.costs.iter().map(|c| c.mapv(|v| -v / eps)).collect();
        self.kernels = self.log_kernels.iter().map(|l| l.mapv(f64::exp)).collect();
    }

    /// Regularization `ε`.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Number of points along each axis.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of grid points, `Π_k n_k`.
    pub fn num_points(&self) -> usize {
        self.shape.iter().product()
    }

    /// Per-axis coordinates.
    pub fn coords(&self) -> &[Array1<f64>] {
        &self.coords
    }

    /// The per-axis cost function.
    pub fn cost_fn(&self) -> &dyn AxisCost {
        self.cost_fn.as_ref()
    }

    /// Per-axis cost matrices `C_k[p, q] = c(x_k[p], x_k[q])`.
    pub fn axis_costs(&self) -> &[Array2<f64>] {
        &self.costs
    }

    /// Per-axis Gibbs kernels `exp(-C_k/ε)`.
    pub fn axis_kernels(&self) -> &[Array2<f64>] {
        &self.kernels
    }

    /// Per-axis log-kernels `-C_k/ε`.
    pub fn axis_log_kernels(&self) -> &[Array2<f64>] {
        &self.log_kernels
    }

    fn all_axes(&self) -> Vec<usize> {
        (0..self.ndim()).collect()
    }

    fn check_tensor(&self, tensor: &ArrayD<f64>, axes: &[usize]) -> Result<()> {
        if tensor.shape() != self.shape.as_slice() {
            return Err(Error::GridShapeMismatch {
                expected: self.shape.clone(),
                got: tensor.shape().to_vec(),
            });
        }
        if axes.iter().any(|&k| k >= self.ndim()) {
            return Err(Error::Domain("axis index out of range for grid"));
        }
        Ok(())
    }

    /// Reshape a flat vector over the grid's points to the grid shape.
    pub fn to_grid_tensor(&self, v: &Array1<f64>) -> Result<ArrayD<f64>> {
        if v.len() != self.num_points() {
            return Err(Error::LengthMismatch(self.num_points(), v.len()));
        }
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), v.to_vec())?)
    }

    /// Flatten a grid-shaped tensor in row-major order.
    pub fn flatten(tensor: &ArrayD<f64>) -> Array1<f64> {
        tensor.iter().copied().collect()
    }

    /// Contract `tensor` against `exp(-C_k/ε)` along each axis in `axes`.
    ///
    /// With all axes this is the kernel-vector product `K t` (or `Kᵀ t` with
    /// `transpose`), computed one axis at a time.
    pub fn apply_kernel(
        &self,
        tensor: &ArrayD<f64>,
        axes: &[usize],
        transpose: bool,
    ) -> Result<ArrayD<f64>> {
        self.check_tensor(tensor, axes)?;
        Ok(kernel::apply_axes(tensor, &self.kernels, axes, transpose))
    }

    /// Apply the separable cost restricted to `axes`.
    ///
    /// Each axis `k` in `axes` contributes its raw cost matrix `C_k` along `k`
    /// and a sum over every other requested axis; the contributions are added.
    /// With all axes this is the dense cost-vector product `C t`.
    pub fn apply_cost(
        &self,
        tensor: &ArrayD<f64>,
        axes: &[usize],
        transpose: bool,
    ) -> Result<ArrayD<f64>> {
        self.check_tensor(tensor, axes)?;
        let mut out = ArrayD::zeros(tensor.raw_dim());
        for &k in axes {
            let mut term = tensor.clone();
            for &l in axes {
                term = if l == k {
                    kernel::mode_product(&term, &self.costs[k], k, transpose)
                } else {
                    let ones = Array2::ones((self.shape[l], self.shape[l]));
                    kernel::mode_product(&term, &ones, l, false)
                };
            }
            out += &term;
        }
        Ok(out)
    }

    /// Log-domain kernel application on `sign ⊙ exp(log_tensor)`.
    ///
    /// Returns `(log |y|, sign(y))` for `y = K (sign ⊙ exp(log_tensor))`
    /// restricted to `axes`. Without `sign` the input is taken to be
    /// non-negative. Entries equal to zero have sign `0`.
    pub fn apply_lse_kernel(
        &self,
        log_tensor: &ArrayD<f64>,
        sign: Option<&ArrayD<f64>>,
        axes: &[usize],
        transpose: bool,
    ) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        self.check_tensor(log_tensor, axes)?;
        match sign {
            Some(s) => {
                self.check_tensor(s, axes)?;
                Ok(kernel::apply_signed_lse_axes(log_tensor, s, &self.log_kernels, axes, transpose))
            }
            None => {
                let log = kernel::apply_lse_axes(log_tensor, &self.log_kernels, axes, transpose);
                let sign = log.mapv(|v| if v == f64::NEG_INFINITY { 0.0 } else { 1.0 });
                Ok((log, sign))
            }
        }
    }

    pub(crate) fn kernel_all(&self, tensor: &ArrayD<f64>, transpose: bool) -> ArrayD<f64> {
        kernel::apply_axes(tensor, &self.kernels, &self.all_axes(), transpose)
    }

    pub(crate) fn lse_kernel_all(&self, log: &ArrayD<f64>, transpose: bool) -> ArrayD<f64> {
        kernel::apply_lse_axes(log, &self.log_kernels, &self.all_axes(), transpose)
    }

    pub(crate) fn signed_lse_kernel_all(
        &self,
        log: &ArrayD<f64>,
        sign: &ArrayD<f64>,
        transpose: bool,
    ) -> (ArrayD<f64>, ArrayD<f64>) {
        kernel::apply_signed_lse_axes(log, sign, &self.log_kernels, &self.all_axes(), transpose)
    }

    /// Per-axis marginals of `left_i K_ij right_j`, one matrix per axis.
    pub(crate) fn couplings(&self, left: &ArrayD<f64>, right: &ArrayD<f64>) -> Vec<Array2<f64>> {
        (0..self.ndim())
            .map(|k| kernel::axis_coupling(left, right, &self.kernels, k))
            .collect()
    }

    /// Log-domain [`Grid::couplings`] for `(log |·|, sign)` factors.
    pub(crate) fn couplings_lse(
        &self,
        left: (&ArrayD<f64>, &ArrayD<f64>),
        right: (&ArrayD<f64>, &ArrayD<f64>),
    ) -> Vec<Array2<f64>> {
        (0..self.ndim())
            .map(|k| kernel::axis_coupling_lse(left, right, &self.log_kernels, k))
            .collect()
    }

    /// Chain per-axis cost-matrix gradients `∂L/∂C_k` to the coordinates.
    ///
    /// `∂L/∂x_k[m] = Σ_{p,q} ∂L/∂C_k[p,q] · ∂c(x_k[p], x_k[q])/∂x_k[m]`.
    pub fn coordinate_gradient(&self, cost_grads: &[Array2<f64>]) -> Result<Vec<Array1<f64>>> {
        if cost_grads.len() != self.ndim() {
            return Err(Error::LengthMismatch(self.ndim(), cost_grads.len()));
        }
        let mut out = Vec::with_capacity(self.ndim());
        for (xs, g) in self.coords.iter().zip(cost_grads) {
            let n = xs.len();
            if g.dim() != (n, n) {
                return Err(Error::GridShapeMismatch {
                    expected: vec![n, n],
                    got: g.shape().to_vec(),
                });
            }
            let mut grad = Array1::zeros(n);
            for p in 0..n {
                for q in 0..n {
                    let (dx, dy) = self.cost_fn.grad(xs[p], xs[q]);
                    grad[p] += g[[p, q]] * dx;
                    grad[q] += g[[p, q]] * dy;
                }
            }
            out.push(grad);
        }
        Ok(out)
    }

    fn unravel(&self, mut flat: usize) -> Vec<usize> {
        let mut idx = vec![0; self.ndim()];
        for k in (0..self.ndim()).rev() {
            idx[k] = flat % self.shape[k];
            flat /= self.shape[k];
        }
        idx
    }

    /// Materialized `n × n` cost matrix. Only sensible for small grids.
    pub fn dense_cost_matrix(&self) -> Array2<f64> {
        let n = self.num_points();
        let idx: Vec<Vec<usize>> = (0..n).map(|i| self.unravel(i)).collect();
        Array2::from_shape_fn((n, n), |(i, j)| {
            self.costs
                .iter()
                .enumerate()
                .map(|(k, c)| c[[idx[i][k], idx[j][k]]])
                .sum()
        })
    }

    /// Materialized kernel `K_0 ⊗ K_1 ⊗ …`. Only sensible for small grids.
    pub fn dense_kernel_matrix(&self) -> Array2<f64> {
        let mut iter = self.kernels.iter();
        let first = iter.next().cloned().unwrap_or_else(|| Array2::ones((1, 1)));
        iter.fold(first, |acc, k| kron(&acc, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::PNorm;
    use ndarray::array;
    use proptest::prelude::*;

    fn vec_tensor(grid: &Grid, seed: u64) -> ArrayD<f64> {
        let n = grid.num_points();
        let v: Array1<f64> = (0..n)
            .map(|i| 0.1 + ((i as u64 * 31 + seed * 17) % 13) as f64 / 13.0)
            .collect();
        grid.to_grid_tensor(&v).unwrap()
    }

    #[test]
    fn from_sizes_uses_unit_interval() {
        let g = Grid::from_sizes(&[2, 3, 1], 0.5).unwrap();
        assert_eq!(g.shape(), &[2, 3, 1]);
        assert_eq!(g.num_points(), 6);
        assert_eq!(g.coords()[0], array![0.0, 1.0]);
        assert_eq!(g.coords()[1], array![0.0, 0.5, 1.0]);
        assert_eq!(g.coords()[2], array![0.0]);
        assert!((g.axis_costs()[1][[0, 2]] - 1.0).abs() < 1e-12);
        assert!((g.axis_kernels()[1][[0, 1]] - (-0.25f64 / 0.5).exp()).abs() < 1e-12);
    }

    #[test]
    fn rejects_bad_construction() {
        assert!(matches!(Grid::from_sizes(&[], 1.0), Err(Error::EmptyGrid)));
        assert!(matches!(Grid::from_sizes(&[2, 0], 1.0), Err(Error::EmptyGrid)));
        assert!(matches!(
            Grid::from_sizes(&[2], 0.0),
            Err(Error::InvalidRegularization(_))
        ));
        assert!(matches!(
            Grid::from_sizes(&[2], f64::NAN),
            Err(Error::InvalidRegularization(_))
        ));
        assert!(Grid::from_coords(vec![array![0.0, f64::INFINITY]], 1.0).is_err());
    }

    #[test]
    fn with_epsilon_rescales_kernels_only() {
        let g = Grid::from_sizes(&[3], 1.0).unwrap();
        let h = g.clone().with_epsilon(0.25).unwrap();
        assert_eq!(g.axis_costs()[0], h.axis_costs()[0]);
        assert!((h.axis_kernels()[0][[0, 2]] - (-4.0f64).exp()).abs() < 1e-12);
        assert!(g.clone().with_epsilon(-1.0).is_err());
    }

    #[test]
    fn apply_kernel_matches_dense_kronecker() {
        let g = Grid::from_coords(
            vec![array![0.0, 1.0], array![0.3, 0.4, 0.7], array![1.0, 1.3, 2.4, 3.7]],
            1.0,
        )
        .unwrap();
        let t = vec_tensor(&g, 3);
        let flat = Grid::flatten(&t);
        let k = g.dense_kernel_matrix();
        let c = g.dense_cost_matrix();
        // Kronecker kernel equals exp(-C/ε) of the dense separable cost.
        for (kv, cv) in k.iter().zip(c.iter()) {
            assert!((kv - (-cv).exp()).abs() < 1e-12);
        }

        for &transpose in &[false, true] {
            let fast = Grid::flatten(&g.apply_kernel(&t, &[0, 1, 2], transpose).unwrap());
            let dense = if transpose { k.t().dot(&flat) } else { k.dot(&flat) };
            for (a, b) in fast.iter().zip(dense.iter()) {
                assert!((a - b).abs() < 1e-12, "fast={a} dense={b}");
            }
        }
    }

    #[test]
    fn apply_cost_matches_dense_cost() {
        let g = Grid::from_sizes(&[2, 3, 4], 0.2).unwrap();
        let t = vec_tensor(&g, 5);
        let flat = Grid::flatten(&t);
        let dense = g.dense_cost_matrix().dot(&flat);
        let fast = Grid::flatten(&g.apply_cost(&t, &[0, 1, 2], false).unwrap());
        for (a, b) in fast.iter().zip(dense.iter()) {
            assert!((a - b).abs() < 1e-10, "fast={a} dense={b}");
        }
    }

    #[test]
    fn apply_kernel_on_subset_of_axes_leaves_others_untouched() {
        let g = Grid::from_sizes(&[2, 3], 0.5).unwrap();
        let t = vec_tensor(&g, 1);
        let out = g.apply_kernel(&t, &[1], false).unwrap();
        let k1 = &g.axis_kernels()[1];
        for i in 0..2 {
            for p in 0..3 {
                let expected: f64 = (0..3).map(|q| k1[[p, q]] * t[[i, q]]).sum();
                assert!((out[[i, p]] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn apply_lse_kernel_matches_log_of_kernel() {
        let g = Grid::from_sizes(&[3, 4], 0.1).unwrap();
        let t = vec_tensor(&g, 2);
        let linear = g.apply_kernel(&t, &[0, 1], true).unwrap();
        let (log, sign) = g.apply_lse_kernel(&t.mapv(f64::ln), None, &[0, 1], true).unwrap();
        for ((l, s), v) in log.iter().zip(sign.iter()).zip(linear.iter()) {
            assert_eq!(*s, 1.0);
            assert!((l.exp() - v).abs() < 1e-12 * v.max(1.0));
        }
    }

    #[test]
    fn apply_rejects_wrong_shapes_and_axes() {
        let g = Grid::from_sizes(&[2, 3], 0.5).unwrap();
        let bad = ArrayD::zeros(IxDyn(&[3, 2]));
        assert!(matches!(
            g.apply_kernel(&bad, &[0], false),
            Err(Error::GridShapeMismatch { .. })
        ));
        let ok = ArrayD::zeros(IxDyn(&[2, 3]));
        assert!(g.apply_kernel(&ok, &[2], false).is_err());
        assert!(matches!(
            g.to_grid_tensor(&Array1::zeros(5)),
            Err(Error::LengthMismatch(6, 5))
        ));
    }

    #[test]
    fn coordinate_gradient_matches_finite_difference() {
        let coords = vec![array![0.0, 0.8, 1.1], array![-0.5, 0.25]];
        let g = Grid::from_coords(coords.clone(), 1.0).unwrap().with_cost_fn(PNorm::new(3.0).unwrap());
        let weights = vec![
            array![[0.1, -0.4, 0.3], [0.2, 0.5, -0.1], [0.7, 0.0, 0.2]],
            array![[0.9, -0.3], [0.4, 0.6]],
        ];
        let objective = |coords: Vec<Array1<f64>>| -> f64 {
            let grid = Grid::from_coords(coords, 1.0).unwrap().with_cost_fn(PNorm::new(3.0).unwrap());
            grid.axis_costs()
                .iter()
                .zip(&weights)
                .map(|(c, w)| (c * w).sum())
                .sum()
        };
        let grads = g.coordinate_gradient(&weights).unwrap();
        let h = 1e-6;
        for k in 0..2 {
            for m in 0..coords[k].len() {
                let mut plus = coords.clone();
                let mut minus = coords.clone();
                plus[k][m] += h;
                minus[k][m] -= h;
                let fd = (objective(plus) - objective(minus)) / (2.0 * h);
                assert!((grads[k][m] - fd).abs() < 1e-5, "axis {k} idx {m}: {} vs {fd}", grads[k][m]);
            }
        }
    }

    proptest! {
        #[test]
        fn factored_kernel_equals_dense(
            sizes in prop::collection::vec(1usize..4, 1..4),
            eps in 0.2f64..2.0,
            transpose in any::<bool>(),
        ) {
            let g = Grid::from_sizes(&sizes, eps).unwrap();
            let t = vec_tensor(&g, 7);
            let flat = Grid::flatten(&t);
            let axes: Vec<usize> = (0..sizes.len()).collect();
            let fast = Grid::flatten(&g.apply_kernel(&t, &axes, transpose).unwrap());
            let k = g.dense_kernel_matrix();
            let dense = if transpose { k.t().dot(&flat) } else { k.dot(&flat) };
            for (a, b) in fast.iter().zip(dense.iter()) {
                prop_assert!((a - b).abs() < 1e-10);
            }
        }
    }
}
