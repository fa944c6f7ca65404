use std::path::PathBuf;

use geo::raster::algo;
use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use rand::seq::SliceRandom;

use crate::{Error, Interpolator, Result, StackData};

/// Coefficients of the proximity-error model `err = a + b * distance^c`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProximityFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

pub const INITIAL_GUESS: ProximityFit = ProximityFit { a: 0.0, b: 0.1, c: 0.2 };

impl ProximityFit {
    pub fn as_array(&self) -> [f64; 3] {
        [self.a, self.b, self.c]
    }

    pub fn evaluate(&self, distance: f64) -> f64 {
        self.a + self.b * distance.powf(self.c)
    }
}

#[derive(Clone, Debug)]
pub struct UncertaintyOptions {
    /// Target percentile for proximity analysis and chunk sizing.
    pub percentile: f64,
    /// Simulation cap; derived from the zone count when unset.
    pub sims: Option<usize>,
    /// Minimum error-sample count before the fit may settle.
    pub max_sample: Option<usize>,
    /// Training chunks drawn per zone and simulation.
    pub chunks_per_zone: usize,
    /// Error-sample sidecar; only reused when the stack hash matches.
    pub sample_cache: Option<PathBuf>,
    pub stack_hash: Option<String>,
}

impl Default for UncertaintyOptions {
    fn default() -> Self {
        UncertaintyOptions {
            percentile: 95.0,
            sims: None,
            max_sample: None,
            chunks_per_zone: 12,
            sample_cache: None,
            stack_hash: None,
        }
    }
}

/// Interpolation-uncertainty estimation by split-sample simulation.
///
/// The region is chunked by the proximity percentile and each chunk binned
/// into one of nine proximity x slope zones. Training chunks (density at or
/// below their zone median) are repeatedly re-gridded with a random fraction
/// of their points held back; the held-back residuals against the re-grid,
/// paired with the distance to the nearest retained cell, feed the
/// least-squares fit of the proximity-error curve.
pub struct InterpolationUncertainty<'a> {
    stack: &'a StackData,
    dem: &'a [f64],
    interpolator: &'a dyn Interpolator,
    options: UncertaintyOptions,
}

struct ChunkInfo {
    window: geo::Srcwin,
    density: f64,
    zone: usize,
}

impl<'a> InterpolationUncertainty<'a> {
    pub fn new(stack: &'a StackData, dem: &'a [f64], interpolator: &'a dyn Interpolator, options: UncertaintyOptions) -> Self {
        InterpolationUncertainty {
            stack,
            dem,
            interpolator,
            options,
        }
    }

    /// Run the simulations and apply the fit.
    ///
    /// Returns the per-cell interpolation uncertainty
    /// (`source_uncertainty + b * proximity^c`) and the accepted fit.
    pub fn run(&self) -> Result<(Vec<f64>, ProximityFit)> {
        let meta = &self.stack.meta;
        let nx = meta.nx;
        let ny = meta.ny;

        let proximity = algo::proximity(meta, &self.stack.z)?;
        let slope = algo::slope(meta, self.dem, None)?;

        let known = self.stack.known_count();
        let total = nx * ny;
        if known == 0 {
            return Err(Error::InvalidArgument("uncertainty analysis needs a non-empty stack".to_string()));
        }
        let density_pct = 100.0 * known as f64 / total as f64;

        let prox_low = algo::percentile(&proximity, 25.0).unwrap_or(0.0);
        let prox_high = algo::percentile(&proximity, 75.0).unwrap_or(prox_low);
        let prox_target = algo::percentile(&proximity, self.options.percentile).unwrap_or(prox_high);
        let slope_low = algo::percentile(&slope, 25.0).unwrap_or(0.0);
        let slope_high = algo::percentile(&slope, 75.0).unwrap_or(slope_low);

        // chunk the grid at the proximity target percentile
        let chunk = (prox_target.round() as usize).max(10);
        let max_dist = (chunk as f64 / 2.0).max(2.0);
        log::info!(
            "{}: density {:.3}%, chunking at {} cells",
            self.interpolator.name(),
            density_pct,
            chunk
        );

        let chunks = self.analyze_chunks(&proximity, &slope, chunk, prox_low, prox_high, slope_low, slope_high);
        let trainers = select_trainers(&chunks);
        if trainers.iter().all(Vec::is_empty) {
            return Err(Error::FitDiverged("no usable training chunks".to_string()));
        }

        let sims = self.options.sims.unwrap_or_else(|| (chunks.len() / trainers.iter().map(Vec::len).sum::<usize>().max(1)).clamp(4, 24));
        let max_sample = self.options.max_sample.unwrap_or(((total - known) / 10).max(64));

        let mut samples = self.load_cached_samples();
        let mut rng = rand::rng();
        let mut accepted = INITIAL_GUESS;
        let mut have_accepted = false;
        let mut last_spread: Option<f64> = None;

        for sim in 1..=sims {
            for zone_trainers in &trainers {
                let mut order: Vec<&ChunkInfo> = zone_trainers.iter().collect();
                order.shuffle(&mut rng);

                for chunk_info in order.into_iter().take(self.options.chunks_per_zone) {
                    self.split_sample(chunk_info, density_pct, max_dist, &mut samples, &mut rng)?;
                }
            }

            if samples.len() < 8 {
                continue;
            }

            let fit = fit_error_coefficients(&samples, accepted.as_array());
            let spread = (fit.c - fit.b).abs();
            log::info!("simulation {sim}: {} samples, fit {:?}", samples.len(), fit);

            // a fit stuck at the initial guess carries no information, retry
            if fit == INITIAL_GUESS {
                continue;
            }

            accepted = fit;
            have_accepted = true;

            if samples.len() >= max_sample {
                if let Some(last) = last_spread {
                    if (last - spread).abs() < 0.01 {
                        break;
                    }
                }
                last_spread = Some(spread);
            }
        }

        if !have_accepted {
            // convergence failure falls back to the last accepted fit,
            // which is the initial model here; never NaN
            log::warn!("uncertainty fit did not stabilize within {sims} simulations, keeping {accepted:?}");
        }

        self.store_cached_samples(&samples);

        let uncertainty: Vec<f64> = (0..total)
            .map(|idx| {
                let src = self.stack.uncertainty[idx];
                let src = if src.is_finite() { src } else { 0.0 };
                let prox = proximity[idx].max(0.0);
                src + accepted.b * prox.powf(accepted.c)
            })
            .collect();

        Ok((uncertainty, accepted))
    }

    /// Bin the chunk windows into nine proximity x slope zones.
    fn analyze_chunks(
        &self,
        proximity: &[f64],
        slope: &[f64],
        chunk: usize,
        prox_low: f64,
        prox_high: f64,
        slope_low: f64,
        slope_high: f64,
    ) -> Vec<ChunkInfo> {
        let nx = self.stack.meta.nx;
        let ny = self.stack.meta.ny;

        let mut chunks = Vec::new();
        for window in geo::chunk_windows(nx, ny, chunk, chunk) {
            let mut window_known = 0usize;
            let mut prox_values = Vec::with_capacity(window.cell_count());
            let mut slope_values = Vec::with_capacity(window.cell_count());
            for row in window.yoff as usize..window.yoff as usize + window.ysize {
                for col in window.xoff as usize..window.xoff as usize + window.xsize {
                    let idx = row * nx + col;
                    if !self.stack.z[idx].is_nan() {
                        window_known += 1;
                    }
                    prox_values.push(proximity[idx]);
                    slope_values.push(slope[idx]);
                }
            }
            if window_known == 0 {
                continue;
            }

            let prox_p = algo::percentile(&prox_values, 95.0).unwrap_or(0.0);
            let slope_p = algo::percentile(&slope_values, 95.0).unwrap_or(0.0);

            let band = |value: f64, low: f64, high: f64| {
                if value < low || (value - low).abs() < 0.01 {
                    0
                } else if value < high || (value - high).abs() < 0.01 {
                    1
                } else {
                    2
                }
            };

            chunks.push(ChunkInfo {
                window,
                density: window_known as f64 / window.cell_count() as f64,
                zone: band(prox_p, prox_low, prox_high) * 3 + band(slope_p, slope_low, slope_high),
            });
        }
        chunks
    }

    /// One split-sample pass over a training chunk.
    fn split_sample(
        &self,
        chunk_info: &ChunkInfo,
        hold_pct: f64,
        max_dist: f64,
        samples: &mut Vec<(f64, f64)>,
        rng: &mut impl rand::Rng,
    ) -> Result<()> {
        let nx = self.stack.meta.nx;
        let ny = self.stack.meta.ny;

        // extraction region buffered by 20% of the chunk edge
        let buffer = (chunk_info.window.xsize.max(chunk_info.window.ysize) / 5).max(2);
        let buffered = chunk_info.window.buffered(buffer, nx, ny);
        let sub = self.stack.window(&buffered);

        // inner cells are the unbuffered core, in sub-window coordinates
        let core_x0 = (chunk_info.window.xoff - buffered.xoff) as usize;
        let core_y0 = (chunk_info.window.yoff - buffered.yoff) as usize;
        let mut inner: Vec<usize> = Vec::new();
        for row in core_y0..core_y0 + chunk_info.window.ysize {
            for col in core_x0..core_x0 + chunk_info.window.xsize {
                let idx = row * sub.meta.nx + col;
                if !sub.z[idx].is_nan() {
                    inner.push(idx);
                }
            }
        }
        if inner.len() < 4 {
            return Ok(());
        }

        let hold_pct = hold_pct.min(100.0 * chunk_info.density).max(1.0);
        let hold = ((inner.len() as f64 * hold_pct / 100.0) as usize).clamp(1, inner.len() - 1);
        inner.shuffle(rng);
        let (held, _retained) = inner.split_at(hold);

        let mut training = sub.clone();
        for &idx in held {
            training.z[idx] = f64::NAN;
        }
        if training.known_count() < 3 {
            return Ok(());
        }

        let estimate = self.interpolator.interpolate(&training)?;

        // residuals are measured on the held-out points against the re-grid,
        // distances against the retained view of the data
        let mut tree = KdTree::new(2);
        for (idx, z) in training.z.iter().enumerate() {
            if !z.is_nan() {
                let row = (idx / training.meta.nx) as f64;
                let col = (idx % training.meta.nx) as f64;
                tree.add([row, col], idx)
                    .map_err(|err| Error::Runtime(format!("kdtree insert failed: {err:?}")))?;
            }
        }

        for &idx in held {
            let est = estimate[idx];
            let truth = sub.z[idx];
            if est.is_nan() || truth.is_nan() {
                continue;
            }

            let row = (idx / training.meta.nx) as f64;
            let col = (idx % training.meta.nx) as f64;
            let nearest = tree
                .nearest(&[row, col], 1, &squared_euclidean)
                .map_err(|err| Error::Runtime(format!("kdtree query failed: {err:?}")))?;
            let Some((dist_sq, _)) = nearest.first() else {
                continue;
            };
            let dist = dist_sq.sqrt();
            if dist < 1.0 || dist > max_dist {
                continue;
            }

            samples.push((est - truth, dist));
        }
        Ok(())
    }

    fn load_cached_samples(&self) -> Vec<(f64, f64)> {
        let (Some(path), Some(hash)) = (&self.options.sample_cache, &self.options.stack_hash) else {
            return Vec::new();
        };
        let Ok(text) = std::fs::read_to_string(path) else {
            return Vec::new();
        };

        let mut lines = text.lines();
        // advisory only: samples from a different input set are ignored
        match lines.next() {
            Some(header) if header == format!("# stack {hash}") => {}
            _ => return Vec::new(),
        }

        lines
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let err = fields.next()?.parse::<f64>().ok()?;
                let dist = fields.next()?.parse::<f64>().ok()?;
                Some((err, dist))
            })
            .collect()
    }

    fn store_cached_samples(&self, samples: &[(f64, f64)]) {
        let (Some(path), Some(hash)) = (&self.options.sample_cache, &self.options.stack_hash) else {
            return;
        };

        let mut text = format!("# stack {hash}\n");
        for (err, dist) in samples {
            text.push_str(&format!("{err} {dist}\n"));
        }
        if let Err(err) = std::fs::write(path, text) {
            log::debug!("could not write error-sample cache: {err}");
        }
    }
}

/// Training chunks per zone: those whose density does not exceed the zone
/// median.
fn select_trainers(chunks: &[ChunkInfo]) -> Vec<Vec<&ChunkInfo>> {
    let mut trainers: Vec<Vec<&ChunkInfo>> = (0..9).map(|_| Vec::new()).collect();
    for zone in 0..9 {
        let members: Vec<&ChunkInfo> = chunks.iter().filter(|c| c.zone == zone).collect();
        if members.is_empty() {
            continue;
        }
        let densities: Vec<f64> = members.iter().map(|c| c.density).collect();
        let median = algo::percentile(&densities, 50.0).unwrap_or(1.0);
        trainers[zone] = members
            .into_iter()
            .filter(|c| c.density < median || (c.density - median).abs() < 0.01)
            .collect();
    }
    trainers
}

/// Fit `std(err) = a + b * dist^c` to the error samples.
///
/// Distances are histogrammed into up to ten equal-width bins (shrinking
/// until every bin is populated), the per-bin standard deviation forms the
/// curve that is fit with damped Gauss-Newton iterations from `guess`.
pub fn fit_error_coefficients(samples: &[(f64, f64)], guess: [f64; 3]) -> ProximityFit {
    let fallback = ProximityFit {
        a: guess[0],
        b: guess[1],
        c: guess[2],
    };
    if samples.len() < 3 {
        return fallback;
    }

    let max_dist = samples.iter().map(|&(_, d)| d).fold(f64::NEG_INFINITY, f64::max);
    let min_dist = samples.iter().map(|&(_, d)| d).fold(f64::INFINITY, f64::min);
    if !(max_dist > min_dist) {
        return fallback;
    }

    // shrink the bin count until no bin is empty
    let mut nbins = 10usize.min(samples.len());
    let (mut counts, mut err_sum, mut err_sq) = (Vec::new(), Vec::new(), Vec::new());
    while nbins > 1 {
        counts = vec![0usize; nbins];
        err_sum = vec![0.0f64; nbins];
        err_sq = vec![0.0f64; nbins];
        for &(err, dist) in samples {
            let mut bin = ((dist - min_dist) / (max_dist - min_dist) * nbins as f64) as usize;
            bin = bin.min(nbins - 1);
            counts[bin] += 1;
            err_sum[bin] += err;
            err_sq[bin] += err * err;
        }
        if counts.iter().all(|&count| count > 0) {
            break;
        }
        nbins -= 1;
    }
    if nbins <= 1 {
        return fallback;
    }

    let mut xdata = vec![1e-4];
    let mut ydata = vec![0.0];
    for bin in 0..nbins {
        let n = counts[bin] as f64;
        let mean = err_sum[bin] / n;
        let variance = (err_sq[bin] / n - mean * mean).max(0.0);
        let center = min_dist + (bin as f64 + 0.5) / nbins as f64 * (max_dist - min_dist);
        xdata.push(center.max(1e-4));
        ydata.push(variance.sqrt());
    }

    gauss_newton(&xdata, &ydata, guess).map_or(fallback, |p| ProximityFit {
        a: p[0],
        b: p[1],
        c: p[2],
    })
}

/// Damped Gauss-Newton least squares for the three-parameter power model.
fn gauss_newton(x: &[f64], y: &[f64], guess: [f64; 3]) -> Option<[f64; 3]> {
    let sse = |p: &[f64; 3]| -> f64 {
        x.iter()
            .zip(y)
            .map(|(&x, &y)| {
                let r = y - (p[0] + p[1] * x.powf(p[2]));
                r * r
            })
            .sum()
    };

    let mut p = guess;
    let mut lambda = 1e-3;
    let mut best = sse(&p);

    for _ in 0..100 {
        // normal equations J^T J and J^T r
        let mut jtj = [[0.0f64; 3]; 3];
        let mut jtr = [0.0f64; 3];
        for (&xi, &yi) in x.iter().zip(y) {
            let xc = xi.powf(p[2]);
            let r = yi - (p[0] + p[1] * xc);
            let j = [1.0, xc, p[1] * xc * xi.ln()];
            for a in 0..3 {
                jtr[a] += j[a] * r;
                for b in 0..3 {
                    jtj[a][b] += j[a] * j[b];
                }
            }
        }
        for a in 0..3 {
            jtj[a][a] += lambda * jtj[a][a].max(1e-12);
        }

        let Some(step) = solve3(&jtj, &jtr) else {
            return None;
        };
        let candidate = [p[0] + step[0], p[1] + step[1], p[2] + step[2]];
        if candidate.iter().any(|v| !v.is_finite()) {
            return None;
        }

        let candidate_sse = sse(&candidate);
        if candidate_sse < best {
            let delta = best - candidate_sse;
            p = candidate;
            best = candidate_sse;
            lambda = (lambda * 0.5).max(1e-12);
            if delta < 1e-12 {
                break;
            }
        } else {
            lambda *= 4.0;
            if lambda > 1e8 {
                break;
            }
        }
    }

    p.iter().all(|v| v.is_finite()).then_some(p)
}

/// Cramer's rule for the 3x3 normal equations.
fn solve3(m: &[[f64; 3]; 3], v: &[f64; 3]) -> Option<[f64; 3]> {
    let det = |m: &[[f64; 3]; 3]| -> f64 {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };

    let d = det(m);
    if d.abs() < 1e-15 {
        return None;
    }

    let mut out = [0.0f64; 3];
    for col in 0..3 {
        let mut replaced = *m;
        for row in 0..3 {
            replaced[row][col] = v[row];
        }
        out[col] = det(&replaced) / d;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idw::{Idw, IdwOptions};
    use geo::raster::RasterMeta;
    use geo::GeoTransform;

    #[test]
    fn fit_recovers_power_law() {
        // synthetic samples drawn from std(err) = 0.05 * d^0.8
        let mut samples = Vec::new();
        for dist in 1..=20 {
            let std = 0.05 * (dist as f64).powf(0.8);
            for k in 0..40 {
                let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                samples.push((sign * std, dist as f64));
            }
        }

        let fit = fit_error_coefficients(&samples, INITIAL_GUESS.as_array());
        assert!((fit.b - 0.05).abs() < 0.02, "b was {}", fit.b);
        assert!((fit.c - 0.8).abs() < 0.15, "c was {}", fit.c);
    }

    #[test]
    fn fit_falls_back_on_degenerate_input() {
        let fit = fit_error_coefficients(&[(0.1, 5.0)], INITIAL_GUESS.as_array());
        assert_eq!(fit, INITIAL_GUESS);
    }

    #[test]
    fn engine_produces_distance_increasing_uncertainty() {
        let n = 48usize;
        let meta = RasterMeta::new(
            n,
            n,
            GeoTransform::north_up(0.0, n as f64, 1.0, 1.0),
            String::new(),
            Some(-9999.0),
        );

        // a rolling surface sampled on a sparse lattice
        let surface = |row: usize, col: usize| (row as f64 * 0.37).sin() * 4.0 + (col as f64 * 0.23).cos() * 3.0 + 0.05 * row as f64;
        let mut stack = StackData {
            meta: meta.clone(),
            z: vec![f64::NAN; n * n],
            count: vec![f64::NAN; n * n],
            weight: vec![f64::NAN; n * n],
            uncertainty: vec![f64::NAN; n * n],
        };
        for row in (0..n).step_by(3) {
            for col in (0..n).step_by(3) {
                let idx = row * n + col;
                stack.z[idx] = surface(row, col);
                stack.count[idx] = 1.0;
                stack.weight[idx] = 1.0;
                stack.uncertainty[idx] = 0.0;
            }
        }

        let idw = Idw::new(IdwOptions {
            min_points: 4,
            ..Default::default()
        });
        let dem = idw.interpolate(&stack).unwrap();

        let options = UncertaintyOptions {
            sims: Some(2),
            max_sample: Some(32),
            ..Default::default()
        };
        let engine = InterpolationUncertainty::new(&stack, &dem, &idw, options);
        let (uncertainty, fit) = engine.run().unwrap();

        assert!(fit.b.is_finite() && fit.c.is_finite());
        assert_eq!(uncertainty.len(), n * n);
        assert!(uncertainty.iter().all(|u| u.is_finite()));

        // uncertainty grows with distance from data: a known cell reads
        // lower than the cell farthest from any sample
        let known_idx = 0;
        let far_idx = (n - 2) * n + (n - 2);
        assert!(uncertainty[far_idx] >= uncertainty[known_idx]);
    }
}
