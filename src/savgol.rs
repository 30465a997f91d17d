//! Savitzky-Golay smoothing and window functions
//!
//! Used by the template extractor: a two-scale blend of short- and
//! long-window polynomial smoothers, weighted by a Hanning profile so the
//! sharp center of the waveform keeps the fast filter and the tails take the
//! slow one.

use std::f32::consts::PI;

/// Hanning window of length `n`.
pub fn hanning(n: usize) -> Vec<f32> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (n - 1) as f32).cos())
        .collect()
}

/// Savitzky-Golay filter coefficients for a centered window.
///
/// Least-squares polynomial fit expressed as a convolution kernel; solved
/// through the normal equations of the Vandermonde design matrix.
pub fn savgol_coeffs(window: usize, polyorder: usize) -> Vec<f32> {
    debug_assert!(window % 2 == 1 && polyorder < window);
    let half = (window / 2) as i64;
    let m = polyorder + 1;

    // Vandermonde matrix A[i][j] = x_i^j, x centered on the window.
    let mut a = vec![vec![0.0f64; m]; window];
    for (i, row) in a.iter_mut().enumerate() {
        let x = (i as i64 - half) as f64;
        let mut xi = 1.0;
        for v in row.iter_mut() {
            *v = xi;
            xi *= x;
        }
    }

    // Normal equations (A'A) c = e0.
    let mut ata = vec![vec![0.0f64; m]; m];
    for i in 0..m {
        for j in 0..m {
            ata[i][j] = a.iter().map(|row| row[i] * row[j]).sum();
        }
    }
    let mut rhs = vec![0.0f64; m];
    rhs[0] = 1.0;
    let solution = solve_dense(&mut ata, &mut rhs);

    a.iter()
        .map(|row| row.iter().zip(&solution).map(|(x, c)| x * c).sum::<f64>() as f32)
        .collect()
}

/// Gauss-Jordan solve of a small dense system, partial pivoting.
fn solve_dense(a: &mut [Vec<f64>], b: &mut [f64]) -> Vec<f64> {
    let n = b.len();
    for i in 0..n {
        let mut pivot = i;
        for k in i + 1..n {
            if a[k][i].abs() > a[pivot][i].abs() {
                pivot = k;
            }
        }
        a.swap(i, pivot);
        b.swap(i, pivot);
        let p = a[i][i];
        if p.abs() < 1e-30 {
            continue;
        }
        for j in i..n {
            a[i][j] /= p;
        }
        b[i] /= p;
        for k in 0..n {
            if k != i {
                let f = a[k][i];
                for j in i..n {
                    a[k][j] -= f * a[i][j];
                }
                b[k] -= f * b[i];
            }
        }
    }
    b.to_vec()
}

/// Apply a Savitzky-Golay filter along one trace, edge samples mirrored.
pub fn savgol_filter(trace: &[f32], window: usize, polyorder: usize) -> Vec<f32> {
    let n = trace.len();
    if n == 0 || window >= 2 * n {
        return trace.to_vec();
    }
    let coeffs = savgol_coeffs(window, polyorder);
    let half = (window / 2) as i64;
    let mut out = vec![0.0f32; n];
    for (t, o) in out.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (j, &c) in coeffs.iter().enumerate() {
            let mut idx = t as i64 + j as i64 - half;
            // Mirror the borders.
            if idx < 0 {
                idx = -idx;
            }
            if idx >= n as i64 {
                idx = 2 * (n as i64 - 1) - idx;
            }
            acc += c * trace[idx.clamp(0, n as i64 - 1) as usize];
        }
        *o = acc;
    }
    out
}

/// Two-scale smoothing blend: fast filter at the waveform center, slow
/// filter in the tails, mixed by a Hanning profile.
pub fn blend_smooth(trace: &[f32], window: usize) -> Vec<f32> {
    let slow_window = {
        let w = 3 * window;
        if w % 2 == 0 { w + 1 } else { w }
    };
    let fast = savgol_filter(trace, window, 3);
    let slow = savgol_filter(trace, slow_window, 3);
    let weights = hanning(trace.len());
    fast.iter()
        .zip(&slow)
        .zip(&weights)
        .map(|((f, s), w)| w * f + (1.0 - w) * s)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hanning_endpoints() {
        let w = hanning(11);
        assert!(w[0].abs() < 1e-6);
        assert!(w[10].abs() < 1e-6);
        assert!((w[5] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_savgol_coeffs_sum_to_one() {
        let coeffs = savgol_coeffs(7, 3);
        let sum: f32 = coeffs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_savgol_preserves_cubic() {
        // A cubic polynomial is in the fit space of a 3rd-order filter.
        let trace: Vec<f32> = (0..21)
            .map(|i| {
                let x = i as f32 - 10.0;
                0.1 * x * x * x - 0.5 * x * x + x
            })
            .collect();
        let filtered = savgol_filter(&trace, 5, 3);
        for (raw, f) in trace.iter().zip(&filtered).skip(2).take(17) {
            assert!((raw - f).abs() < 1e-3, "cubic distorted: {raw} vs {f}");
        }
    }

    #[test]
    fn test_blend_smooth_reduces_noise() {
        let trace: Vec<f32> = (0..31)
            .map(|i| if i % 2 == 0 { 0.3 } else { -0.3 })
            .collect();
        let smoothed = blend_smooth(&trace, 5);
        let raw_power: f32 = trace.iter().map(|v| v * v).sum();
        let out_power: f32 = smoothed.iter().map(|v| v * v).sum();
        assert!(out_power < raw_power);
    }
}
