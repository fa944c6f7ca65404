/// Gaussian smoothing of a NaN-marked plane.
///
/// The kernel is exp(-d²/size) normalized to unit sum, applied separably
/// with symmetric edge padding. Empty cells do not contribute and stay
/// empty in the output.
pub fn gaussian_blur(nx: usize, ny: usize, plane: &[f64], size: usize) -> Vec<f64> {
    let size = size.max(1);
    let kernel: Vec<f64> = (-(size as i64)..=size as i64)
        .map(|offset| (-((offset * offset) as f64) / size as f64).exp())
        .collect();
    let kernel_sum: f64 = kernel.iter().sum();
    let kernel: Vec<f64> = kernel.iter().map(|k| k / kernel_sum).collect();

    // zero-filled data and a 0/1 validity plane blur together, the ratio
    // renormalizes cells whose kernel footprint crossed empty cells
    let data: Vec<f64> = plane.iter().map(|&v| if v.is_nan() { 0.0 } else { v }).collect();
    let valid: Vec<f64> = plane.iter().map(|&v| if v.is_nan() { 0.0 } else { 1.0 }).collect();

    let data = convolve_rows(nx, ny, &data, &kernel);
    let data = convolve_cols(nx, ny, &data, &kernel);
    let valid_blur = convolve_rows(nx, ny, &valid, &kernel);
    let valid_blur = convolve_cols(nx, ny, &valid_blur, &kernel);

    (0..nx * ny)
        .map(|idx| {
            if valid[idx] == 0.0 || valid_blur[idx] <= 0.0 {
                f64::NAN
            } else {
                data[idx] / valid_blur[idx]
            }
        })
        .collect()
}

/// Symmetric reflection of an out-of-range index into [0, len).
fn reflect(index: i64, len: usize) -> usize {
    let len = len as i64;
    let mut index = index;
    loop {
        if index < 0 {
            index = -index - 1;
        } else if index >= len {
            index = 2 * len - index - 1;
        } else {
            return index as usize;
        }
    }
}

fn convolve_rows(nx: usize, ny: usize, data: &[f64], kernel: &[f64]) -> Vec<f64> {
    let half = (kernel.len() / 2) as i64;
    let mut out = vec![0.0; data.len()];
    for row in 0..ny {
        for col in 0..nx {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let src_col = reflect(col as i64 + k as i64 - half, nx);
                acc += weight * data[row * nx + src_col];
            }
            out[row * nx + col] = acc;
        }
    }
    out
}

fn convolve_cols(nx: usize, ny: usize, data: &[f64], kernel: &[f64]) -> Vec<f64> {
    let half = (kernel.len() / 2) as i64;
    let mut out = vec![0.0; data.len()];
    for row in 0..ny {
        for col in 0..nx {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let src_row = reflect(row as i64 + k as i64 - half, ny);
                acc += weight * data[src_row * nx + col];
            }
            out[row * nx + col] = acc;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_plane_is_unchanged() {
        let plane = vec![5.0; 36];
        let blurred = gaussian_blur(6, 6, &plane, 2);
        for value in blurred {
            assert!((value - 5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn smooths_a_spike() {
        let mut plane = vec![0.0; 49];
        plane[3 * 7 + 3] = 100.0;
        let blurred = gaussian_blur(7, 7, &plane, 1);
        assert!(blurred[3 * 7 + 3] < 100.0);
        assert!(blurred[3 * 7 + 4] > 0.0);
    }

    #[test]
    fn nodata_stays_nodata() {
        let mut plane = vec![1.0; 25];
        plane[12] = f64::NAN;
        let blurred = gaussian_blur(5, 5, &plane, 1);
        assert!(blurred[12].is_nan());
        // neighbors renormalize instead of bleeding the hole in
        assert!((blurred[11] - 1.0).abs() < 1e-9);
    }
}
