use kdtree::distance::squared_euclidean;
use kdtree::KdTree;

use crate::{Error, Interpolator, Result, StackData};

/// Exact-hit threshold in pixels; closer queries return the known value.
const EXACT_HIT: f64 = 1e-10;

#[derive(Clone, Debug)]
pub struct IdwOptions {
    /// Inverse-distance power.
    pub power: f64,
    /// Neighbors per query cell.
    pub min_points: usize,
    /// Search radius in pixels; infinite by default.
    pub radius: f64,
    /// Weight neighbor contributions by the stack weight band.
    pub use_weights: bool,
    /// Query window edge in pixels.
    pub chunk_size: Option<usize>,
}

impl Default for IdwOptions {
    fn default() -> Self {
        IdwOptions {
            power: 1.0,
            min_points: 8,
            radius: f64::INFINITY,
            use_weights: true,
            chunk_size: None,
        }
    }
}

/// Inverse-distance-weighted interpolation over a KD-tree of the known
/// stack cells. Distances are measured in pixel units.
pub struct Idw {
    pub options: IdwOptions,
}

impl Idw {
    pub fn new(options: IdwOptions) -> Self {
        Idw { options }
    }
}

impl Default for Idw {
    fn default() -> Self {
        Idw::new(IdwOptions::default())
    }
}

impl Interpolator for Idw {
    fn name(&self) -> &'static str {
        "IDW"
    }

    fn interpolate(&self, stack: &StackData) -> Result<Vec<f64>> {
        let nx = stack.meta.nx;
        let ny = stack.meta.ny;

        let mut tree = KdTree::new(2);
        let mut values = Vec::new();
        let mut weights = Vec::new();
        for (idx, &z) in stack.z.iter().enumerate() {
            if z.is_nan() {
                continue;
            }
            let row = (idx / nx) as f64;
            let col = (idx % nx) as f64;
            tree.add([row, col], values.len())
                .map_err(|err| Error::Runtime(format!("kdtree insert failed: {err:?}")))?;
            values.push(z);
            let w = stack.weight[idx];
            weights.push(if w.is_nan() || w <= 0.0 { 1.0 } else { w });
        }

        let mut out = vec![f64::NAN; nx * ny];
        if values.is_empty() {
            return Ok(out);
        }

        let neighbors = self.options.min_points.max(1).min(values.len());
        let radius_sq = self.options.radius * self.options.radius;

        let chunk = self.options.chunk_size.unwrap_or((nx / 10).max(10));
        for window in geo::chunk_windows(nx, ny, chunk, chunk) {
            for row in window.yoff as usize..window.yoff as usize + window.ysize {
                for col in window.xoff as usize..window.xoff as usize + window.xsize {
                    let idx = row * nx + col;
                    let query = [row as f64, col as f64];

                    let found = tree
                        .nearest(&query, neighbors, &squared_euclidean)
                        .map_err(|err| Error::Runtime(format!("kdtree query failed: {err:?}")))?;

                    let mut weight_sum = 0.0;
                    let mut value_sum = 0.0;
                    let mut exact = None;
                    for (dist_sq, &value_idx) in found {
                        if dist_sq > radius_sq {
                            continue;
                        }
                        let dist = dist_sq.sqrt();
                        if dist <= EXACT_HIT {
                            exact = Some(values[value_idx]);
                            break;
                        }

                        let mut w = 1.0 / dist.powf(self.options.power);
                        if self.options.use_weights {
                            w *= weights[value_idx];
                        }
                        weight_sum += w;
                        value_sum += w * values[value_idx];
                    }

                    out[idx] = match exact {
                        Some(value) => value,
                        None if weight_sum > 0.0 => value_sum / weight_sum,
                        None => f64::NAN,
                    };
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::raster::RasterMeta;
    use geo::GeoTransform;

    fn stack_3x3(known: &[(usize, usize, f64, f64)]) -> StackData {
        let meta = RasterMeta::new(3, 3, GeoTransform::north_up(0.0, 3.0, 1.0, 1.0), String::new(), Some(-9999.0));
        let mut stack = StackData {
            meta,
            z: vec![f64::NAN; 9],
            count: vec![f64::NAN; 9],
            weight: vec![f64::NAN; 9],
            uncertainty: vec![f64::NAN; 9],
        };
        for &(row, col, z, w) in known {
            stack.z[row * 3 + col] = z;
            stack.weight[row * 3 + col] = w;
            stack.count[row * 3 + col] = 1.0;
        }
        stack
    }

    #[test]
    fn single_known_cell_floods_grid() {
        let stack = stack_3x3(&[(1, 1, 10.0, 1.0)]);
        let idw = Idw::new(IdwOptions {
            min_points: 1,
            ..Default::default()
        });
        let dem = idw.interpolate(&stack).unwrap();
        assert!(dem.iter().all(|&z| (z - 10.0).abs() < 1e-9));
    }

    #[test]
    fn exact_hit_returns_known_value() {
        let stack = stack_3x3(&[(0, 0, 4.0, 1.0), (2, 2, 8.0, 1.0)]);
        let idw = Idw::default();
        let dem = idw.interpolate(&stack).unwrap();
        assert!((dem[0] - 4.0).abs() < 1e-6);
        assert!((dem[8] - 8.0).abs() < 1e-6);
        // midpoint is equidistant: plain average
        assert!((dem[4] - 6.0).abs() < 1e-6);
    }

    #[test]
    fn radius_limits_influence() {
        let stack = stack_3x3(&[(0, 0, 5.0, 1.0)]);
        let idw = Idw::new(IdwOptions {
            min_points: 4,
            radius: 1.5,
            ..Default::default()
        });
        let dem = idw.interpolate(&stack).unwrap();
        assert!((dem[1] - 5.0).abs() < 1e-9);
        // opposite corner is ~2.83 pixels away, outside the radius
        assert!(dem[8].is_nan());
    }

    #[test]
    fn weighted_neighbors_pull_harder() {
        let stack = stack_3x3(&[(1, 0, 0.0, 1.0), (1, 2, 10.0, 9.0)]);
        let idw = Idw::default();
        let dem = idw.interpolate(&stack).unwrap();
        // center cell equidistant; the heavier right neighbor dominates
        assert!(dem[4] > 8.0, "got {}", dem[4]);
    }
}
