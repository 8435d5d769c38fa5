// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A small Levenberg-Marquardt non-linear least-squares solver (C8, spec
//! §4.8 item 2). No crate in this workspace's dependency stack offers a
//! general NLLS solver, so this is hand-rolled: finite-difference
//! Jacobian, Marquardt's diagonal damping, and Gaussian elimination with
//! partial pivoting for the normal-equations solve.

use ndarray::{Array1, Array2};

/// Outcome of a converged fit: the parameter vector, its covariance matrix
/// (from the final, undamped normal equations), the final chi-square, and
/// the iteration count.
#[derive(Debug, Clone)]
pub struct LmResult {
    pub params: Vec<f64>,
    pub covariance: Array2<f64>,
    pub chisq: f64,
    pub iterations: usize,
}

const FINITE_DIFF_STEP: f64 = 1e-6;
const LAMBDA_INITIAL: f64 = 1e-3;
const LAMBDA_UP: f64 = 10.0;
const LAMBDA_DOWN: f64 = 0.1;

/// Minimize `sum(residuals(params)^2)` over `params`, starting from
/// `initial`. `residuals` must return one weighted residual per data
/// point. Returns `None` on non-convergence within `max_iterations` or if
/// the normal equations become singular.
pub fn levenberg_marquardt<F>(initial: &[f64], residuals: F, max_iterations: usize, tolerance: f64) -> Option<LmResult>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let n_params = initial.len();
    let mut params = initial.to_vec();
    let mut lambda = LAMBDA_INITIAL;

    let mut r = residuals(&params);
    if r.is_empty() {
        return None;
    }
    let mut chisq = r.iter().map(|v| v * v).sum::<f64>();

    for iteration in 0..max_iterations {
        let jac = jacobian(&residuals, &params, &r);
        let jtj = jtj_matrix(&jac, n_params);
        let jtr = jtr_vector(&jac, &r, n_params);

        let mut damped = jtj.clone();
        for k in 0..n_params {
            damped[[k, k]] *= 1.0 + lambda;
        }

        let delta = match solve_linear(&damped, &jtr) {
            Some(d) => d,
            None => {
                lambda *= LAMBDA_UP;
                continue;
            }
        };

        let trial: Vec<f64> = params.iter().zip(delta.iter()).map(|(p, d)| p + d).collect();
        let trial_r = residuals(&trial);
        if trial_r.is_empty() {
            lambda *= LAMBDA_UP;
            continue;
        }
        let trial_chisq = trial_r.iter().map(|v| v * v).sum::<f64>();

        if trial_chisq < chisq {
            let rel_change = delta
                .iter()
                .zip(params.iter())
                .map(|(d, p)| (d / p.abs().max(1e-12)).abs())
                .fold(0.0_f64, f64::max);

            let converged = rel_change < tolerance;
            params = trial;
            r = trial_r;
            chisq = trial_chisq;
            lambda *= LAMBDA_DOWN;

            if converged {
                let jac = jacobian(&residuals, &params, &r);
                let jtj = jtj_matrix(&jac, n_params);
                let covariance = invert(&jtj).unwrap_or_else(|| Array2::from_elem((n_params, n_params), f64::INFINITY));
                return Some(LmResult {
                    params,
                    covariance,
                    chisq,
                    iterations: iteration + 1,
                });
            }
        } else {
            lambda *= LAMBDA_UP;
        }
    }

    None
}

fn jacobian<F>(residuals: &F, params: &[f64], r0: &[f64]) -> Array2<f64>
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let n_points = r0.len();
    let n_params = params.len();
    let mut jac = Array2::zeros((n_points, n_params));
    for k in 0..n_params {
        let mut p_plus = params.to_vec();
        let step = FINITE_DIFF_STEP * params[k].abs().max(1.0);
        p_plus[k] += step;
        let r_plus = residuals(&p_plus);
        for i in 0..n_points {
            jac[[i, k]] = (r_plus[i] - r0[i]) / step;
        }
    }
    jac
}

fn jtj_matrix(jac: &Array2<f64>, n_params: usize) -> Array2<f64> {
    let mut out = Array2::zeros((n_params, n_params));
    for a in 0..n_params {
        for b in 0..n_params {
            out[[a, b]] = jac.column(a).dot(&jac.column(b));
        }
    }
    out
}

fn jtr_vector(jac: &Array2<f64>, r: &[f64], n_params: usize) -> Array1<f64> {
    let r = Array1::from_vec(r.to_vec());
    let mut out = Array1::zeros(n_params);
    for a in 0..n_params {
        // Negative sign: we descend the gradient of sum(r^2), and r is
        // (model - data)-style so d(chisq)/dp = 2 J^T r; we want -J^T r.
        out[a] = -jac.column(a).dot(&r);
    }
    out
}

/// Solve `a x = b` via Gaussian elimination with partial pivoting. Returns
/// `None` if `a` is (numerically) singular.
fn solve_linear(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = b.len();
    let mut m = a.clone();
    let mut rhs = b.clone();

    for col in 0..n {
        let mut pivot_row = col;
        let mut pivot_val = m[[col, col]].abs();
        for row in (col + 1)..n {
            if m[[row, col]].abs() > pivot_val {
                pivot_val = m[[row, col]].abs();
                pivot_row = row;
            }
        }
        if pivot_val < 1e-14 {
            return None;
        }
        if pivot_row != col {
            for k in 0..n {
                m.swap([col, k], [pivot_row, k]);
            }
            rhs.swap(col, pivot_row);
        }

        for row in (col + 1)..n {
            let factor = m[[row, col]] / m[[col, col]];
            for k in col..n {
                let v = m[[col, k]];
                m[[row, k]] -= factor * v;
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = Array1::zeros(n);
    for row in (0..n).rev() {
        let mut sum = rhs[row];
        for k in (row + 1)..n {
            sum -= m[[row, k]] * x[k];
        }
        x[row] = sum / m[[row, row]];
    }
    Some(x)
}

/// Invert a small square matrix by solving `A X = I` column by column.
fn invert(a: &Array2<f64>) -> Option<Array2<f64>> {
    let n = a.nrows();
    let mut out = Array2::zeros((n, n));
    for col in 0..n {
        let mut e = Array1::zeros(n);
        e[col] = 1.0;
        let x = solve_linear(a, &e)?;
        for row in 0..n {
            out[[row, col]] = x[row];
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn fits_a_straight_line() {
        // y = 2x + 1, exactly, over a handful of points.
        let xs: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| 2.0 * x + 1.0).collect();
        let residuals = |p: &[f64]| -> Vec<f64> {
            xs.iter()
                .zip(ys.iter())
                .map(|(&x, &y)| (p[0] * x + p[1]) - y)
                .collect()
        };
        let result = levenberg_marquardt(&[1.0, 1.0], residuals, 100, 1e-10).unwrap();
        assert_relative_eq!(result.params[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(result.params[1], 1.0, epsilon = 1e-4);
        assert!(result.chisq < 1e-6);
    }

    #[test]
    fn singular_problem_fails_gracefully() {
        // Two parameters that are fully degenerate (only their sum matters)
        // make the Jacobian rank-deficient: the solver must return None
        // rather than panic.
        let residuals = |p: &[f64]| -> Vec<f64> { vec![p[0] + p[1] - 3.0] };
        let result = levenberg_marquardt(&[0.0, 0.0], residuals, 50, 1e-10);
        assert!(result.is_none());
    }
}
