use spade::{DelaunayTriangulation, HasPosition, Point2, Triangulation as _};

use crate::{Interpolator, Result, StackData};

/// Interpolation kernel over the Delaunay triangulation of the known cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TriangulationKernel {
    /// Barycentric interpolation within each triangle.
    #[default]
    Linear,
    /// Natural-neighbor interpolation, smooth away from the data points.
    Cubic,
    /// Value of the nearest known cell.
    Nearest,
}

impl TriangulationKernel {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "linear" => Some(TriangulationKernel::Linear),
            "cubic" => Some(TriangulationKernel::Cubic),
            "nearest" => Some(TriangulationKernel::Nearest),
            _ => None,
        }
    }
}

/// Chunked scattered-data interpolation from the known stack cells.
///
/// The grid is processed in buffered windows; each window's known cells are
/// triangulated and the unknown cells of the unbuffered core filled from the
/// chosen kernel. Windows with no empty cells pass through unchanged.
pub struct Triangulated {
    pub kernel: TriangulationKernel,
    pub chunk_size: Option<usize>,
    pub chunk_buffer: usize,
}

impl Triangulated {
    pub fn new(kernel: TriangulationKernel) -> Self {
        Triangulated {
            kernel,
            chunk_size: None,
            chunk_buffer: 10,
        }
    }
}

struct KnownCell {
    position: Point2<f64>,
    z: f64,
}

impl HasPosition for KnownCell {
    type Scalar = f64;

    fn position(&self) -> Point2<f64> {
        self.position
    }
}

impl Interpolator for Triangulated {
    fn name(&self) -> &'static str {
        match self.kernel {
            TriangulationKernel::Linear => "linear",
            TriangulationKernel::Cubic => "cubic",
            TriangulationKernel::Nearest => "nearest",
        }
    }

    fn interpolate(&self, stack: &StackData) -> Result<Vec<f64>> {
        let nx = stack.meta.nx;
        let ny = stack.meta.ny;
        let mut out = stack.z.clone();

        let chunk = self.chunk_size.unwrap_or((nx / 10).max(10));
        for window in geo::chunk_windows(nx, ny, chunk, chunk) {
            let core_cells = (window.yoff as usize..window.yoff as usize + window.ysize)
                .flat_map(|row| (window.xoff as usize..window.xoff as usize + window.xsize).map(move |col| (row, col)));

            let needs_fill = core_cells.clone().any(|(row, col)| stack.z[row * nx + col].is_nan());
            if !needs_fill {
                continue;
            }

            let buffered = window.buffered(self.chunk_buffer, nx, ny);
            let mut triangulation: DelaunayTriangulation<KnownCell> = DelaunayTriangulation::new();
            let mut inserted = 0usize;
            for row in buffered.yoff as usize..buffered.yoff as usize + buffered.ysize {
                for col in buffered.xoff as usize..buffered.xoff as usize + buffered.xsize {
                    let z = stack.z[row * nx + col];
                    if z.is_nan() {
                        continue;
                    }
                    if triangulation
                        .insert(KnownCell {
                            position: Point2::new(col as f64, row as f64),
                            z,
                        })
                        .is_ok()
                    {
                        inserted += 1;
                    }
                }
            }

            if inserted == 0 {
                continue;
            }

            for (row, col) in core_cells {
                let idx = row * nx + col;
                if !out[idx].is_nan() {
                    continue;
                }

                let query = Point2::new(col as f64, row as f64);
                out[idx] = match self.kernel {
                    TriangulationKernel::Linear => triangulation
                        .barycentric()
                        .interpolate(|v| v.data().z, query)
                        .unwrap_or(f64::NAN),
                    TriangulationKernel::Cubic => triangulation
                        .natural_neighbor()
                        .interpolate(|v| v.data().z, query)
                        .unwrap_or(f64::NAN),
                    TriangulationKernel::Nearest => triangulation
                        .nearest_neighbor(query)
                        .map(|v| v.data().z)
                        .unwrap_or(f64::NAN),
                };
            }
        }

        Ok(out)
    }
}

/// Natural-neighbor fill of the NaN cells of a plane from its finite cells.
/// Shared by the outlier filter's replacement step.
pub fn fill_nan_cells(nx: usize, ny: usize, plane: &[f64], kernel: TriangulationKernel) -> Vec<f64> {
    let stack = StackData {
        meta: geo::raster::RasterMeta::new(
            nx,
            ny,
            geo::GeoTransform::north_up(0.0, ny as f64, 1.0, 1.0),
            String::new(),
            None,
        ),
        z: plane.to_vec(),
        count: vec![f64::NAN; plane.len()],
        weight: vec![f64::NAN; plane.len()],
        uncertainty: vec![f64::NAN; plane.len()],
    };

    let mut interpolator = Triangulated::new(kernel);
    interpolator.chunk_size = Some(nx.max(ny).max(1));
    interpolator.chunk_buffer = nx.max(ny);
    interpolator.interpolate(&stack).unwrap_or_else(|_| plane.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::raster::RasterMeta;
    use geo::GeoTransform;

    fn ramp_stack(n: usize, holes: &[(usize, usize)]) -> StackData {
        let meta = RasterMeta::new(n, n, GeoTransform::north_up(0.0, n as f64, 1.0, 1.0), String::new(), None);
        let mut z: Vec<f64> = (0..n * n).map(|idx| (idx % n) as f64 + (idx / n) as f64).collect();
        for &(row, col) in holes {
            z[row * n + col] = f64::NAN;
        }
        StackData {
            meta,
            count: vec![1.0; n * n],
            weight: vec![1.0; n * n],
            uncertainty: vec![0.0; n * n],
            z,
        }
    }

    #[test]
    fn linear_restores_planar_hole() {
        let stack = ramp_stack(5, &[(2, 2)]);
        let dem = Triangulated::new(TriangulationKernel::Linear).interpolate(&stack).unwrap();
        // z = row + col is linear, the triangulation restores it exactly
        assert!((dem[2 * 5 + 2] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn nearest_takes_neighbor_value() {
        let stack = ramp_stack(5, &[(0, 0)]);
        let dem = Triangulated::new(TriangulationKernel::Nearest).interpolate(&stack).unwrap();
        assert!(!dem[0].is_nan());
        assert!(dem[0] == 1.0 || dem[0] == 2.0);
    }

    #[test]
    fn known_cells_pass_through() {
        let stack = ramp_stack(5, &[(1, 1)]);
        let dem = Triangulated::new(TriangulationKernel::Cubic).interpolate(&stack).unwrap();
        for idx in 0..25 {
            if !stack.z[idx].is_nan() {
                assert_eq!(dem[idx], stack.z[idx]);
            }
        }
        assert!(!dem[6].is_nan());
    }
}
