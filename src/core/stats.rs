//! Small numeric helpers shared by the reductions: NaN-aware quantiles and
//! ordinary least squares with a two-sided significance test.

use crate::types::{EoError, EoResult};

/// Linear-interpolated quantile of `values` for `q` in [0, 1], ignoring NaN.
///
/// Returns `None` when no finite value is present.
pub fn quantile(values: &[f32], q: f64) -> Option<f32> {
    let mut finite: Vec<f32> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(|a, b| a.total_cmp(b));
    Some(quantile_sorted(&finite, q))
}

/// Quantile of an already sorted, NaN-free slice
pub(crate) fn quantile_sorted(sorted: &[f32], q: f64) -> f32 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = (pos - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Median ignoring NaN; `NaN` when nothing is present
pub fn nan_median(values: &[f32]) -> f32 {
    quantile(values, 0.5).unwrap_or(f32::NAN)
}

/// Result of an ordinary least squares fit `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Regression {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    /// Standard error of the slope
    pub std_error: f64,
    /// Two-sided p-value for the null hypothesis `slope == 0`
    pub p_value: f64,
    pub n: usize,
}

/// Fit `y ~ x` by ordinary least squares.
///
/// Needs at least three points and a non-constant `x`.
pub fn linear_regression(x: &[f64], y: &[f64]) -> EoResult<Regression> {
    if x.len() != y.len() {
        return Err(EoError::ShapeMismatch(format!(
            "regression inputs differ in length: {} vs {}",
            x.len(),
            y.len()
        )));
    }
    let n = x.len();
    if n < 3 {
        return Err(EoError::EmptyResult(format!(
            "regression needs at least 3 observations, got {}",
            n
        )));
    }

    let nf = n as f64;
    let mean_x = x.iter().sum::<f64>() / nf;
    let mean_y = y.iter().sum::<f64>() / nf;

    let sxx: f64 = x.iter().map(|xi| (xi - mean_x).powi(2)).sum();
    let syy: f64 = y.iter().map(|yi| (yi - mean_y).powi(2)).sum();
    let sxy: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| (xi - mean_x) * (yi - mean_y))
        .sum();

    if sxx <= 0.0 {
        return Err(EoError::InvalidInput(
            "regression predictor is constant".to_string(),
        ));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let sse: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| (yi - (slope * xi + intercept)).powi(2))
        .sum();
    let r_squared = if syy > 0.0 { 1.0 - sse / syy } else { 1.0 };

    let dof = nf - 2.0;
    let std_error = (sse / dof / sxx).sqrt();
    let p_value = if std_error == 0.0 {
        if slope == 0.0 {
            1.0
        } else {
            0.0
        }
    } else {
        student_t_two_sided(slope / std_error, dof)
    };

    Ok(Regression {
        slope,
        intercept,
        r_squared,
        std_error,
        p_value,
        n,
    })
}

/// Two-sided tail probability `P(|T| >= |t|)` for Student's t with `dof`
pub fn student_t_two_sided(t: f64, dof: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    let x = dof / (dof + t * t);
    incomplete_beta(0.5 * dof, 0.5, x).clamp(0.0, 1.0)
}

/// Regularised incomplete beta `I_x(a, b)`
pub fn incomplete_beta(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }
    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();
    // The continued fraction converges fastest below the mean of the distribution
    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(a, b, x) / a
    } else {
        1.0 - front * beta_continued_fraction(b, a, 1.0 - x) / b
    }
}

fn beta_continued_fraction(a: f64, b: f64, x: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-300;

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;
    let mut c = 1.0;
    let mut d = 1.0 - qab * x / qap;
    if d.abs() < TINY {
        d = TINY;
    }
    d = 1.0 / d;
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        h *= d * c;

        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 + aa * d;
        if d.abs() < TINY {
            d = TINY;
        }
        c = 1.0 + aa / c;
        if c.abs() < TINY {
            c = TINY;
        }
        d = 1.0 / d;
        let delta = d * c;
        h *= delta;
        if (delta - 1.0).abs() < EPS {
            break;
        }
    }
    h
}

/// Lanczos approximation of `ln Γ(x)` for `x > 0`
pub fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.180_091_729_471_46,
        -86.505_320_329_416_77,
        24.014_098_240_830_91,
        -1.231_739_572_450_155,
        0.120_865_097_386_617_9e-2,
        -0.539_523_938_495_3e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in COEFFS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}
