//! Kernel application engine.
//!
//! A separable kernel \(K = K_0 \otimes K_1 \otimes \dots \otimes K_{d-1}\)
//! acting on a vector of length \(\prod_k n_k\) is applied as a sequence of
//! mode products: reshape the vector to the grid shape and contract axis `k`
//! against \(K_k\), one axis at a time. Each mode product stacks the lanes
//! of that axis into a matrix and multiplies it by \(K_k^\top\) once, so
//! applying the whole kernel costs \(O(\prod_k n_k \cdot \sum_k n_k)\) instead of
//! \(O((\prod_k n_k)^2)\).
//!
//! Orientation: entry `(p, q)` of an axis matrix pairs source index `p` with
//! target index `q`. Without `transpose` a mode product sums over the target
//! index (`(K v)_i`); with `transpose` it sums over the source index
//! (`(Kᵀ u)_j`).
//!
//! The log-domain variants compute `log |K (s ⊙ exp(l))|` and its sign with a
//! per-lane max subtracted before exponentiating, so nothing here overflows
//! for small regularization.

use crate::{logsumexp_by, logsumexp_signed_by};
use ndarray::{Array2, ArrayD, ArrayView2, Axis, IxDyn, Zip};

fn oriented(matrix: &Array2<f64>, transpose: bool) -> ArrayView2<'_, f64> {
    if transpose {
        matrix.t()
    } else {
        matrix.view()
    }
}

fn mode_shape(tensor: &ArrayD<f64>, axis: usize, len: usize) -> IxDyn {
    let mut shape = tensor.shape().to_vec();
    shape[axis] = len;
    IxDyn(&shape)
}

/// Mode-`axis` product: `out[.., p, ..] = Σ_q M[p, q] · t[.., q, ..]`.
///
/// With `transpose`, `M[q, p]` is used instead.
pub fn mode_product(
    tensor: &ArrayD<f64>,
    matrix: &Array2<f64>,
    axis: usize,
    transpose: bool,
) -> ArrayD<f64> {
    debug_assert!(axis < tensor.ndim());
    let op = oriented(matrix, transpose);
    debug_assert_eq!(op.ncols(), tensor.shape()[axis]);

    // one (rest, n) · (n, m) product over all lanes
    let product = lanes_matrix(tensor, axis).dot(&op.t());
    let mut out = ArrayD::zeros(mode_shape(tensor, axis, op.nrows()));
    for (mut lane, row) in out.lanes_mut(Axis(axis)).into_iter().zip(product.rows()) {
        lane.assign(&row);
    }
    out
}

/// Apply per-axis matrices along each axis in `axes`, in order.
pub fn apply_axes(
    tensor: &ArrayD<f64>,
    matrices: &[Array2<f64>],
    axes: &[usize],
    transpose: bool,
) -> ArrayD<f64> {
    let mut out = tensor.clone();
    for &axis in axes {
        out = mode_product(&out, &matrices[axis], axis, transpose);
    }
    out
}

/// Log-domain mode product: `out[.., p, ..] = LSE_q (L[p, q] + l[.., q, ..])`.
pub fn lse_mode_product(
    log: &ArrayD<f64>,
    log_matrix: &Array2<f64>,
    axis: usize,
    transpose: bool,
) -> ArrayD<f64> {
    let op = oriented(log_matrix, transpose);
    debug_assert_eq!(op.ncols(), log.shape()[axis]);

    let mut out = ArrayD::zeros(mode_shape(log, axis, op.nrows()));
    Zip::from(out.lanes_mut(Axis(axis)))
        .and(log.lanes(Axis(axis)))
        .for_each(|mut o, l| {
            for p in 0..op.nrows() {
                o[p] = logsumexp_by(op.ncols(), |q| op[[p, q]] + l[q]);
            }
        });
    out
}

/// Signed log-domain mode product.
///
/// Inputs represent `s ⊙ exp(l)`; the result represents
/// `Σ_q exp(L[p, q]) · s_q · exp(l_q)` as `(log |·|, sign)`. Zero entries
/// carry sign `0` and log `-∞`.
pub fn signed_lse_mode_product(
    log: &ArrayD<f64>,
    sign: &ArrayD<f64>,
    log_matrix: &Array2<f64>,
    axis: usize,
    transpose: bool,
) -> (ArrayD<f64>, ArrayD<f64>) {
    let op = oriented(log_matrix, transpose);
    let dim = mode_shape(log, axis, op.nrows());
    let mut out_log = ArrayD::zeros(dim.clone());
    let mut out_sign = ArrayD::zeros(dim);

    Zip::from(out_log.lanes_mut(Axis(axis)))
        .and(out_sign.lanes_mut(Axis(axis)))
        .and(log.lanes(Axis(axis)))
        .and(sign.lanes(Axis(axis)))
        .for_each(|mut ol, mut os, l, s| {
            for p in 0..op.nrows() {
                let (v, sg) = logsumexp_signed_by(op.ncols(), |q| (op[[p, q]] + l[q], s[q]));
                ol[p] = v;
                os[p] = sg;
            }
        });
    (out_log, out_sign)
}

/// Log-domain counterpart of [`apply_axes`] for non-negative inputs.
pub fn apply_lse_axes(
    log: &ArrayD<f64>,
    log_matrices: &[Array2<f64>],
    axes: &[usize],
    transpose: bool,
) -> ArrayD<f64> {
    let mut out = log.clone();
    for &axis in axes {
        out = lse_mode_product(&out, &log_matrices[axis], axis, transpose);
    }
    out
}

/// Log-domain counterpart of [`apply_axes`] for signed inputs.
pub fn apply_signed_lse_axes(
    log: &ArrayD<f64>,
    sign: &ArrayD<f64>,
    log_matrices: &[Array2<f64>],
    axes: &[usize],
    transpose: bool,
) -> (ArrayD<f64>, ArrayD<f64>) {
    let mut out = (log.clone(), sign.clone());
    for &axis in axes {
        out = signed_lse_mode_product(&out.0, &out.1, &log_matrices[axis], axis, transpose);
    }
    out
}

/// Stack the lanes of `tensor` along `axis` as rows of a `(rest, n_axis)` matrix.
///
/// Two tensors of the same shape produce rows in the same order.
pub(crate) fn lanes_matrix(tensor: &ArrayD<f64>, axis: usize) -> Array2<f64> {
    let n = tensor.shape()[axis];
    let rows = if n == 0 { 0 } else { tensor.len() / n };
    let mut m = Array2::zeros((rows, n));
    for (mut row, lane) in m.rows_mut().into_iter().zip(tensor.lanes(Axis(axis))) {
        row.assign(&lane);
    }
    m
}

fn other_axes(ndim: usize, axis: usize) -> Vec<usize> {
    (0..ndim).filter(|&k| k != axis).collect()
}

/// Per-axis marginal of the bilinear form `left_i K_ij right_j`.
///
/// Returns `M[p, q] = Σ_{i_axis = p, j_axis = q} left_i K_ij right_j` without
/// materializing `K`: the kernel is applied to `right` along every other axis,
/// then the remaining lanes are paired with the lanes of `left`.
pub fn axis_coupling(
    left: &ArrayD<f64>,
    right: &ArrayD<f64>,
    kernels: &[Array2<f64>],
    axis: usize,
) -> Array2<f64> {
    let w = apply_axes(right, kernels, &other_axes(right.ndim(), axis), false);
    let lm = lanes_matrix(left, axis);
    let wm = lanes_matrix(&w, axis);
    lm.t().dot(&wm) * &kernels[axis]
}

/// Log-domain [`axis_coupling`] for signed factors given as `(log |·|, sign)`.
///
/// The result is returned in the linear domain.
pub fn axis_coupling_lse(
    left: (&ArrayD<f64>, &ArrayD<f64>),
    right: (&ArrayD<f64>, &ArrayD<f64>),
    log_kernels: &[Array2<f64>],
    axis: usize,
) -> Array2<f64> {
    let (lw, sw) = apply_signed_lse_axes(
        right.0,
        right.1,
        log_kernels,
        &other_axes(right.0.ndim(), axis),
        false,
    );
    let ll = lanes_matrix(left.0, axis);
    let sl = lanes_matrix(left.1, axis);
    let lw = lanes_matrix(&lw, axis);
    let sw = lanes_matrix(&sw, axis);

    let rows = ll.nrows();
    let log_k = &log_kernels[axis];
    Array2::from_shape_fn(log_k.dim(), |(p, q)| {
        let (v, s) = logsumexp_signed_by(rows, |r| (ll[[r, p]] + lw[[r, q]], sl[[r, p]] * sw[[r, q]]));
        if s == 0.0 {
            0.0
        } else {
            s * (v + log_k[[p, q]]).exp()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn tensor(shape: &[usize]) -> ArrayD<f64> {
        let n: usize = shape.iter().product();
        let data: Vec<f64> = (0..n).map(|i| 0.5 + ((i * 7) % 5) as f64 * 0.25).collect();
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    #[test]
    fn mode_product_on_matrix_is_matmul() {
        let t = tensor(&[2, 3]);
        let m = array![[1.0, 2.0, 0.0], [0.0, 1.0, -1.0], [3.0, 0.0, 1.0]];
        let out = mode_product(&t, &m, 1, false);
        let t2 = t.clone().into_dimensionality::<ndarray::Ix2>().unwrap();
        let expected = t2.dot(&m.t());
        for ((i, j), &e) in expected.indexed_iter() {
            assert!((out[[i, j]] - e).abs() < 1e-12);
        }

        let out_t = mode_product(&t, &m, 1, true);
        let expected_t = t2.dot(&m);
        for ((i, j), &e) in expected_t.indexed_iter() {
            assert!((out_t[[i, j]] - e).abs() < 1e-12);
        }
    }

    #[test]
    fn mode_product_on_inner_axis_contracts_every_lane() {
        let t = tensor(&[2, 3, 2]);
        let m = array![[1.0, 0.5, 0.0], [0.0, 2.0, 1.0]];
        let out = mode_product(&t, &m, 1, false);
        assert_eq!(out.shape(), &[2, 2, 2]);
        for i in 0..2 {
            for p in 0..2 {
                for l in 0..2 {
                    let want: f64 = (0..3).map(|q| m[[p, q]] * t[[i, q, l]]).sum();
                    assert!((out[[i, p, l]] - want).abs() < 1e-12);
                }
            }
        }
    }

    #[test]
    fn lse_mode_product_matches_log_of_linear() {
        let t = tensor(&[3, 2, 2]);
        let m = array![[0.5, 0.1, 0.2], [0.3, 0.9, 0.4], [0.7, 0.2, 0.6]];
        let log_m = m.mapv(f64::ln);
        let linear = mode_product(&t, &m, 0, true);
        let log = lse_mode_product(&t.mapv(f64::ln), &log_m, 0, true);
        for (l, v) in log.iter().zip(linear.iter()) {
            assert!((l.exp() - v).abs() < 1e-12);
        }
    }

    #[test]
    fn signed_lse_matches_linear_with_mixed_signs() {
        let t = tensor(&[2, 3]);
        let signed = Array1::from(vec![1.0, -1.0, 0.5, -2.0, 0.0, 3.0])
            .into_shape_with_order(IxDyn(&[2, 3]))
            .unwrap();
        let values = &t * &signed;
        let m = array![[0.2, 0.4, 0.1], [0.6, 0.3, 0.5], [0.9, 0.8, 0.7]];
        let linear = mode_product(&values, &m, 1, false);

        let log = values.mapv(|x| x.abs().ln());
        let sign = values.mapv(|v| if v == 0.0 { 0.0 } else { v.signum() });
        let (out_log, out_sign) = signed_lse_mode_product(&log, &sign, &m.mapv(f64::ln), 1, false);
        for ((l, s), v) in out_log.iter().zip(out_sign.iter()).zip(linear.iter()) {
            let got = if *s == 0.0 { 0.0 } else { s * l.exp() };
            assert!((got - v).abs() < 1e-12, "got={got} want={v}");
        }
    }

    #[test]
    fn axis_coupling_sums_to_bilinear_form() {
        let left = tensor(&[2, 3]);
        let right = tensor(&[2, 3]).mapv(|x| 1.5 - x * 0.5);
        let kernels = vec![
            array![[1.0, 0.2], [0.3, 1.0]],
            array![[1.0, 0.5, 0.1], [0.5, 1.0, 0.5], [0.1, 0.5, 1.0]],
        ];
        let k_right = apply_axes(&right, &kernels, &[0, 1], false);
        let total: f64 = (&left * &k_right).sum();
        for axis in 0..2 {
            let m = axis_coupling(&left, &right, &kernels, axis);
            assert!((m.sum() - total).abs() < 1e-12, "axis {axis}");
        }
    }

    #[test]
    fn lanes_matrix_rows_follow_lane_order() {
        let t = tensor(&[2, 3]);
        let m = lanes_matrix(&t, 0);
        assert_eq!(m.dim(), (3, 2));
        for j in 0..3 {
            for i in 0..2 {
                assert_eq!(m[[j, i]], t[[i, j]]);
            }
        }
    }
}
