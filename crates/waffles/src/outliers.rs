use geo::raster::{algo, RasterMeta};
use geo::Srcwin;

use crate::triangulate::{fill_nan_cells, TriangulationKernel};
use crate::{Result, StackData};

/// Joint statistical outlier detection over elevation, curvature, TRI, TPI
/// and (optionally) uncertainty.
///
/// Per moving window, each variable's Tukey fences mark exceedances that
/// accumulate into a per-cell outlier mass (quadrature of normalized
/// exceedances) and a hit count. Cells beyond the mass and count thresholds
/// are cleared or replaced from their surviving neighbors.
#[derive(Clone, Debug)]
pub struct OutlierFilter {
    pub percentile: f64,
    pub chunk_size: Option<usize>,
    pub chunk_step: Option<usize>,
    pub max_chunk: Option<usize>,
    pub max_step: Option<usize>,
    /// Number of linearly spaced chunk sizes between (chunk_size, max_chunk).
    pub multipass: usize,
    /// Use the raw percentile instead of Tukey fences for the final mask.
    pub aggressive: bool,
    /// Replace masked cells by interpolation instead of clearing them.
    pub replace: bool,
    pub elevation_weight: f64,
    pub curvature_weight: f64,
    pub tri_weight: f64,
    pub tpi_weight: f64,
    pub unc_weight: f64,
    /// Slope scale for geographic grids (111120 for degrees with z meters).
    pub slope_scale: Option<f64>,
}

impl Default for OutlierFilter {
    fn default() -> Self {
        OutlierFilter {
            percentile: 75.0,
            chunk_size: None,
            chunk_step: None,
            max_chunk: None,
            max_step: None,
            multipass: 1,
            aggressive: false,
            replace: true,
            elevation_weight: 1.0,
            curvature_weight: 1.0,
            tri_weight: 1.0,
            tpi_weight: 1.0,
            unc_weight: 1.0,
            slope_scale: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct OutlierStats {
    pub masked: usize,
    pub mask: Vec<bool>,
}

/// Tukey fences for a plane at the given percentile.
fn fences(values: &[f64], percentile: f64) -> Option<(f64, f64)> {
    let percentile = percentile.clamp(51.0, 99.0);
    let upper = algo::percentile(values, percentile)?;
    let lower = algo::percentile(values, 100.0 - percentile)?;
    let iqr = (upper - lower) * 1.5;
    Some((upper + iqr, lower - iqr))
}

impl OutlierFilter {
    /// Scan a plane for outliers and clear or replace them in place.
    pub fn apply(&self, meta: &RasterMeta, z: &mut [f64], uncertainty: Option<&[f64]>) -> Result<OutlierStats> {
        let nx = meta.nx;
        let ny = meta.ny;
        let cells = nx * ny;

        let finite = z.iter().filter(|v| v.is_finite()).count();
        if finite == 0 {
            return Ok(OutlierStats {
                masked: 0,
                mask: vec![false; cells],
            });
        }

        // window ladder scales with sparseness
        let density = finite as f64 / cells as f64;
        let sparse = 1.0 - if density >= 1.0 { 0.945 } else { density };
        let n_chunk = self
            .chunk_size
            .unwrap_or_else(|| ((cells as f64 * 0.005 * sparse).sqrt().ceil() as usize).max(10));
        let n_step = self.chunk_step.unwrap_or_else(|| n_chunk.div_ceil(5));
        let max_chunk = self
            .max_chunk
            .unwrap_or_else(|| ((cells as f64 * 0.05 * sparse).sqrt().ceil() as usize).max(n_chunk));
        let max_step = self.max_step.unwrap_or_else(|| max_chunk.div_ceil(5)).min(max_chunk);

        let mut mass = vec![0.0f64; cells];
        let mut hits = vec![0.0f64; cells];

        let passes = self.multipass.max(1);
        for pass in 0..passes {
            let frac = if passes == 1 { 0.0 } else { pass as f64 / (passes - 1) as f64 };
            let chunk = (n_chunk as f64 + frac * (max_chunk as f64 - n_chunk as f64)).round() as usize;
            let step = ((n_step as f64 + frac * (max_step as f64 - n_step as f64)).round() as usize).max(1);

            for window in geo::chunk_windows(nx, ny, chunk.max(4), step) {
                self.scan_window(meta, z, uncertainty, &window, &mut mass, &mut hits)?;
            }
        }

        // final thresholds over the cells that accumulated anything
        let nonzero_mass: Vec<f64> = mass.iter().copied().filter(|&m| m > 0.0).collect();
        let nonzero_hits: Vec<f64> = hits.iter().copied().filter(|&h| h > 0.0).collect();
        if nonzero_mass.is_empty() {
            return Ok(OutlierStats {
                masked: 0,
                mask: vec![false; cells],
            });
        }

        let mass_limit = if self.aggressive {
            algo::percentile(&nonzero_mass, self.percentile).unwrap_or(f64::INFINITY)
        } else {
            fences(&nonzero_mass, self.percentile).map(|(upper, _)| upper).unwrap_or(f64::INFINITY)
        };
        let hits_limit = algo::percentile(&nonzero_hits, self.percentile).unwrap_or(f64::INFINITY);

        let mut mask = vec![false; cells];
        let mut masked = 0usize;
        for idx in 0..cells {
            if mass[idx] > mass_limit && hits[idx] >= hits_limit {
                mask[idx] = true;
                masked += 1;
                z[idx] = f64::NAN;
            }
        }

        if masked > 0 && self.replace {
            let filled = fill_nan_cells(nx, ny, z, TriangulationKernel::Cubic);
            for idx in 0..cells {
                if mask[idx] {
                    z[idx] = filled[idx];
                }
            }
        }

        log::debug!("masked {masked} outliers{}", if self.aggressive { " (aggressive)" } else { "" });
        Ok(OutlierStats { masked, mask })
    }

    fn scan_window(
        &self,
        meta: &RasterMeta,
        z: &[f64],
        uncertainty: Option<&[f64]>,
        window: &Srcwin,
        mass: &mut [f64],
        hits: &mut [f64],
    ) -> Result<()> {
        let nx = meta.nx;
        let cells = window.cell_count();

        let mut band = vec![f64::NAN; cells];
        for row in 0..window.ysize {
            for col in 0..window.xsize {
                let src = (window.yoff as usize + row) * nx + window.xoff as usize + col;
                band[row * window.xsize + col] = z[src];
            }
        }
        if band.iter().all(|v| v.is_nan()) {
            return Ok(());
        }

        let mut accumulate = |values: &[f64], weight: f64, upper_only: bool, mass: &mut [f64], hits: &mut [f64]| {
            let Some((upper, lower)) = fences(values, self.percentile) else {
                return;
            };
            let max = values.iter().copied().filter(|v| v.is_finite()).fold(f64::NEG_INFINITY, f64::max);
            let min = values.iter().copied().filter(|v| v.is_finite()).fold(f64::INFINITY, f64::min);

            for (local, &value) in values.iter().enumerate() {
                if !value.is_finite() {
                    continue;
                }
                let row = local / window.xsize;
                let col = local % window.xsize;
                let global = (window.yoff as usize + row) * nx + window.xoff as usize + col;

                if value > upper && max > upper && upper != 0.0 {
                    let exceed = weight * ((value - upper) / (max - upper)).abs();
                    mass[global] = (mass[global].powi(2) + exceed.powi(2)).sqrt();
                    hits[global] += 1.0;
                } else if !upper_only && value < lower && min < lower && lower != 0.0 {
                    let exceed = weight * ((value - lower) / (min - lower)).abs();
                    mass[global] = (mass[global].powi(2) + exceed.powi(2)).sqrt();
                    hits[global] += 1.0;
                }
            }
        };

        // elevation, both fences
        accumulate(&band, self.elevation_weight, false, mass, hits);

        // uncertainty, high side only
        if let Some(uncertainty) = uncertainty {
            let mut unc_band = vec![f64::NAN; cells];
            for row in 0..window.ysize {
                for col in 0..window.xsize {
                    let local = row * window.xsize + col;
                    let src = (window.yoff as usize + row) * nx + window.xoff as usize + col;
                    if band[local].is_finite() && uncertainty[src].is_finite() && uncertainty[src] != 0.0 {
                        unc_band[local] = uncertainty[src];
                    }
                }
            }
            accumulate(&unc_band, self.unc_weight, true, mass, hits);
        }

        // terrain derivatives on a gap-filled copy of the window
        let filled = fill_nan_cells(window.xsize, window.ysize, &band, TriangulationKernel::Nearest);
        let window_meta = RasterMeta::new(
            window.xsize,
            window.ysize,
            meta.gt.for_srcwin(window.xoff, window.yoff),
            meta.projection.clone(),
            Some(-9999.0),
        );

        let blank_unknown = |mut derived: Vec<f64>| {
            for (local, value) in derived.iter_mut().enumerate() {
                if band[local].is_nan() {
                    *value = f64::NAN;
                }
            }
            derived
        };

        let curvature = blank_unknown(algo::curvature(&window_meta, &filled, self.slope_scale)?);
        accumulate(&curvature, self.curvature_weight, true, mass, hits);

        let tri = blank_unknown(algo::tri(&window_meta, &filled)?);
        accumulate(&tri, self.tri_weight, true, mass, hits);

        let tpi = blank_unknown(algo::tpi(&window_meta, &filled)?);
        accumulate(&tpi, self.tpi_weight, false, mass, hits);

        Ok(())
    }

    /// Convenience entry point over stacker output: filters band 1 using
    /// band 4 as the uncertainty companion.
    pub fn apply_to_stack(&self, stack: &mut StackData) -> Result<OutlierStats> {
        let uncertainty = stack.uncertainty.clone();
        let meta = stack.meta.clone();
        self.apply(&meta, &mut stack.z, Some(&uncertainty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::GeoTransform;

    #[test]
    fn spike_on_plane_is_masked_and_replaced() {
        let n = 24usize;
        let meta = RasterMeta::new(
            n,
            n,
            GeoTransform::north_up(0.0, n as f64, 1.0, 1.0),
            String::new(),
            Some(-9999.0),
        );

        // z = 0.25x + 0.5y + 3 with one large spike in the middle
        let plane_at = |row: usize, col: usize| 0.25 * col as f64 + 0.5 * row as f64 + 3.0;
        let mut z: Vec<f64> = (0..n * n).map(|idx| plane_at(idx / n, idx % n)).collect();
        let spike_idx = (n / 2) * n + n / 2;
        z[spike_idx] += 500.0;

        let filter = OutlierFilter {
            chunk_size: Some(12),
            chunk_step: Some(6),
            ..Default::default()
        };
        let stats = filter.apply(&meta, &mut z, None).unwrap();

        assert!(stats.mask[spike_idx], "spike cell not masked");
        let expected = plane_at(n / 2, n / 2);
        let restored = z[spike_idx];
        assert!(
            (restored - expected).abs() / expected < 0.005,
            "replacement {restored} too far from {expected}"
        );
    }

    #[test]
    fn clean_plane_stays_untouched() {
        let n = 16usize;
        let meta = RasterMeta::new(
            n,
            n,
            GeoTransform::north_up(0.0, n as f64, 1.0, 1.0),
            String::new(),
            Some(-9999.0),
        );
        let mut z: Vec<f64> = (0..n * n).map(|idx| (idx % n) as f64).collect();
        let before = z.clone();

        let filter = OutlierFilter {
            chunk_size: Some(8),
            ..Default::default()
        };
        let stats = filter.apply(&meta, &mut z, None).unwrap();
        // a clean ramp has uniform derivatives; nothing passes both fences
        assert_eq!(stats.masked, 0);
        assert_eq!(z, before);
    }
}
