//! Gradient check on a 3-D grid
//!
//! Solves an entropic transport problem between two random histograms on a
//! `2 × 3 × 4` grid, then compares the directional derivative of
//! `reg_ot_cost` from both differentiation strategies against a central finite
//! difference, for the weights and for the grid coordinates.
//!
//! Run: cargo run --example grid_gradient_check
//! Solver progress: RUST_LOG=wass_grid=debug cargo run --example grid_gradient_check

use ndarray::Array1;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Uniform};
use tracing_subscriber::EnvFilter;
use wass_grid::{solve, value_and_grad, Differentiation, Grid, Implicit, SinkhornConfig, Unrolled};

fn histogram(rng: &mut ChaCha8Rng, n: usize) -> Array1<f64> {
    let u = Uniform::new(1.0, 2.0);
    let w = Array1::from_shape_fn(n, |_| u.sample(rng));
    let s = w.sum();
    w / s
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let coords = vec![
        Array1::from(vec![0.0, 1.0]),
        Array1::from(vec![0.3, 0.4, 0.7]),
        Array1::from(vec![1.0, 1.3, 2.4, 3.7]),
    ];
    let epsilon = 1.0;
    let grid = Grid::from_coords(coords.clone(), epsilon)?;
    let n = grid.num_points();
    let a = histogram(&mut rng, n);
    let b = histogram(&mut rng, n);

    let u = Uniform::new(-0.5, 0.5);
    let delta = Array1::from_shape_fn(n, |_| u.sample(&mut rng));
    let delta = &delta - delta.mean().unwrap_or(0.0);
    let coord_delta: Vec<Array1<f64>> = coords
        .iter()
        .map(|x| Array1::from_shape_fn(x.len(), |_| u.sample(&mut rng)))
        .collect();

    let h = 1e-4;
    let strategies: [(&str, &dyn Differentiation, SinkhornConfig); 2] = [
        ("implicit", &Implicit, SinkhornConfig::new().with_threshold(1e-8)),
        ("unrolled", &Unrolled, SinkhornConfig::new().with_threshold(0.1)),
    ];

    for (name, strategy, config) in strategies {
        for lse_mode in [true, false] {
            let config = config.clone().with_lse_mode(lse_mode);
            let (out, grads) = value_and_grad(&grid, &a, &b, &config, strategy)?;

            let cost_at = |aa: &Array1<f64>| -> Result<f64, wass_grid::Error> {
                Ok(solve(&grid, aa, &b, &config)?.reg_ot_cost())
            };
            let fd_a = (cost_at(&(&a + &(&delta * h)))? - cost_at(&(&a - &(&delta * h)))?) / (2.0 * h);

            let cost_on = |s: f64| -> Result<f64, wass_grid::Error> {
                let moved = coords
                    .iter()
                    .zip(&coord_delta)
                    .map(|(x, d)| x + &(d * s))
                    .collect();
                Ok(solve(&Grid::from_coords(moved, epsilon)?, &a, &b, &config)?.reg_ot_cost())
            };
            let fd_x = (cost_on(h)? - cost_on(-h)?) / (2.0 * h);
            let an_x: f64 = grads.coords.iter().zip(&coord_delta).map(|(g, d)| g.dot(d)).sum();

            println!(
                "{name:>8} lse={lse_mode:<5} iters={:>4} cost={:.6}",
                out.n_iters(),
                out.reg_ot_cost()
            );
            println!("           d/da     analytic={:+.6e}  fd={:+.6e}", grads.a.dot(&delta), fd_a);
            println!("           d/dx     analytic={:+.6e}  fd={:+.6e}", an_x, fd_x);
        }
    }
    Ok(())
}
