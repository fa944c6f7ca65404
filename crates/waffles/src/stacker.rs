use std::path::Path;

use dlim::{Dataset, TargetGrid, Tile};
use geo::raster::{self, RasterIo, RasterMeta};
use geo::{Srcwin, XyzPoint};

use crate::{Error, Result};

pub const DEFAULT_NDV: f64 = -9999.0;

/// Conflict policy for overlapping observations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StackMode {
    /// Average all observations per cell, weighted by observation weight.
    #[default]
    WeightedMean,
    /// The highest-weight observation wins the cell outright.
    Supercede,
}

/// Five-plane accumulator on the target grid.
///
/// Band order matches the stack raster contract: z, count, weight,
/// uncertainty, source-uncertainty. All arithmetic runs on NaN-marked f64
/// planes; the nodata sentinel only appears when the stack is written out.
pub struct Stacker {
    grid: TargetGrid,
    mode: StackMode,
    projection: String,
    ndv: f64,
    z: Vec<f64>,
    count: Vec<f64>,
    weight: Vec<f64>,
    uncertainty: Vec<f64>,
    src_uncertainty: Vec<f64>,
    finalized: bool,
}

impl Stacker {
    pub fn new(grid: TargetGrid, mode: StackMode, projection: String) -> Self {
        let cells = grid.nx * grid.ny;
        Stacker {
            grid,
            mode,
            projection,
            ndv: DEFAULT_NDV,
            z: vec![0.0; cells],
            count: vec![0.0; cells],
            weight: vec![0.0; cells],
            uncertainty: vec![0.0; cells],
            src_uncertainty: vec![0.0; cells],
            finalized: false,
        }
    }

    pub fn with_nodata(mut self, ndv: f64) -> Self {
        self.ndv = ndv;
        self
    }

    pub fn grid(&self) -> &TargetGrid {
        &self.grid
    }

    pub fn meta(&self) -> RasterMeta {
        self.grid.meta(self.projection.clone(), Some(self.ndv))
    }

    /// Apply one tile to the accumulator.
    pub fn add_tile(&mut self, tile: &Tile) -> Result<()> {
        if self.finalized {
            return Err(Error::Runtime("stacker already finalized".to_string()));
        }

        let win = &tile.srcwin;
        if tile.arrays.z.len() != win.cell_count() {
            return Err(Error::InvalidArgument(format!(
                "tile shape mismatch: {} values for a {}x{} window",
                tile.arrays.z.len(),
                win.xsize,
                win.ysize
            )));
        }

        for tile_row in 0..win.ysize {
            let grid_row = win.yoff + tile_row as i64;
            if grid_row < 0 || grid_row >= self.grid.ny as i64 {
                continue;
            }
            for tile_col in 0..win.xsize {
                let grid_col = win.xoff + tile_col as i64;
                if grid_col < 0 || grid_col >= self.grid.nx as i64 {
                    continue;
                }

                let tile_idx = tile_row * win.xsize + tile_col;
                let grid_idx = grid_row as usize * self.grid.nx + grid_col as usize;

                let z_in = tile.arrays.z[tile_idx];
                let count_in = tile.arrays.count[tile_idx];
                if count_in <= 0.0 {
                    continue;
                }

                // incoming NaN z contributes count only
                let (z_in, w_in, u_in) = if z_in.is_nan() {
                    (0.0, 0.0, 0.0)
                } else {
                    (z_in, tile.arrays.weight[tile_idx].max(0.0), tile.arrays.uncertainty[tile_idx])
                };

                self.count[grid_idx] += count_in;
                match self.mode {
                    StackMode::Supercede => {
                        if w_in > self.weight[grid_idx] {
                            self.z[grid_idx] = z_in;
                            self.src_uncertainty[grid_idx] = u_in;
                            self.weight[grid_idx] = w_in;
                        }
                        self.uncertainty[grid_idx] = self.src_uncertainty[grid_idx];
                    }
                    StackMode::WeightedMean => {
                        self.z[grid_idx] += z_in * w_in;
                        self.src_uncertainty[grid_idx] += u_in * w_in;
                        self.weight[grid_idx] += w_in;
                        if self.weight[grid_idx] > 0.0 {
                            let running_mean = self.z[grid_idx] / self.weight[grid_idx];
                            self.uncertainty[grid_idx] += w_in * (z_in - running_mean).powi(2);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Stack every tile of a dataset. Failing tiles are logged and skipped,
    /// the accumulator stays consistent.
    pub fn add_dataset(&mut self, dataset: &mut dyn Dataset, mut mask: Option<&mut StackMask>) -> Result<()> {
        let name = dataset.core().name();
        let metadata = dataset.core().metadata.clone();
        let weight = dataset.core().weight;
        let uncertainty = dataset.core().uncertainty;

        let band = mask
            .as_mut()
            .map(|mask| mask.band_for(&name, metadata.as_items(), weight, uncertainty));

        let grid = self.grid.clone();
        for tile in dataset.yield_tiles(&grid)? {
            match tile {
                Ok(tile) => {
                    if let (Some(mask), Some(band)) = (mask.as_mut(), band) {
                        // the mask marks every cell the dataset touched
                        mask.mark(band, &tile);
                    }
                    if let Err(err) = self.add_tile(&tile) {
                        log::warn!("{name}: skipping tile: {err}");
                    }
                }
                Err(err) => log::warn!("{name}: skipping unreadable tile: {err}"),
            }
        }
        Ok(())
    }

    /// Resolve the weighted-mean accumulators into final values.
    ///
    /// z and source-uncertainty become plain weighted means, the running
    /// weighted variance becomes a standard deviation and is folded with the
    /// source uncertainty in quadrature. The weight band keeps the raw
    /// weight sum. Cells that never saw an observation become NaN in every
    /// band. Supercede stacks only need the empty-cell sweep.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }

        for idx in 0..self.z.len() {
            if self.count[idx] <= 0.0 || self.weight[idx] <= 0.0 {
                self.z[idx] = f64::NAN;
                self.count[idx] = if self.count[idx] <= 0.0 { f64::NAN } else { self.count[idx] };
                self.weight[idx] = f64::NAN;
                self.uncertainty[idx] = f64::NAN;
                self.src_uncertainty[idx] = f64::NAN;
                continue;
            }

            if self.mode == StackMode::WeightedMean {
                let w = self.weight[idx];
                self.z[idx] /= w;
                self.src_uncertainty[idx] /= w;
                let spread = (self.uncertainty[idx] / w).sqrt();
                self.uncertainty[idx] = (self.src_uncertainty[idx].powi(2) + spread.powi(2)).sqrt();
            }
        }
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn z(&self) -> &[f64] {
        &self.z
    }

    pub fn count(&self) -> &[f64] {
        &self.count
    }

    pub fn weight(&self) -> &[f64] {
        &self.weight
    }

    pub fn uncertainty(&self) -> &[f64] {
        &self.uncertainty
    }

    pub fn src_uncertainty(&self) -> &[f64] {
        &self.src_uncertainty
    }

    /// Write the 5-band stack raster (GTiff, LZW, tiled).
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.finalized {
            return Err(Error::Runtime("finalize the stack before writing it".to_string()));
        }

        let meta = self.meta();
        raster::write_bands(
            &path,
            &meta,
            &[&self.z, &self.count, &self.weight, &self.uncertainty, &self.src_uncertainty],
            &[],
        )?;

        let mut out = RasterIo::open_for_update(&path)?;
        for (band, description) in ["z", "count", "weights", "uncertainty", "src_uncertainty"].into_iter().enumerate() {
            out.set_band_description(band + 1, description)?;
        }
        Ok(())
    }

    pub fn into_stack_data(mut self) -> StackData {
        self.finalize();
        StackData {
            meta: self.meta(),
            z: self.z,
            count: self.count,
            weight: self.weight,
            uncertainty: self.uncertainty,
        }
    }

    /// The finalized stack as a point stream (cell centers of occupied cells).
    pub fn points(&self) -> impl Iterator<Item = XyzPoint> + '_ {
        let nx = self.grid.nx;
        let gt = self.grid.gt;
        self.z.iter().enumerate().filter_map(move |(idx, &z)| {
            if z.is_nan() {
                return None;
            }
            let (row, col) = (idx / nx, idx % nx);
            let (x, y) = gt.pixel_center(col as i64, row as i64);
            let w = self.weight[idx];
            let u = self.uncertainty[idx];
            Some(XyzPoint::with_wu(x, y, z, if w.is_nan() { 1.0 } else { w }, if u.is_nan() { 0.0 } else { u }))
        })
    }
}

/// The stacker output as in-memory planes; what the interpolators and the
/// uncertainty engine consume.
#[derive(Clone, Debug)]
pub struct StackData {
    pub meta: RasterMeta,
    pub z: Vec<f64>,
    pub count: Vec<f64>,
    pub weight: Vec<f64>,
    pub uncertainty: Vec<f64>,
}

impl StackData {
    /// Read bands 1-4 of a stack raster.
    pub fn from_raster(path: impl AsRef<Path>) -> Result<Self> {
        let raster = RasterIo::open_read_only(&path)?;
        let meta = raster.meta(1)?;
        Ok(StackData {
            z: raster.read_band(1)?,
            count: raster.read_band(2)?,
            weight: raster.read_band(3)?,
            uncertainty: raster.read_band(4)?,
            meta,
        })
    }

    pub fn window(&self, win: &Srcwin) -> StackData {
        let mut out = StackData {
            meta: RasterMeta::new(
                win.xsize,
                win.ysize,
                self.meta.gt.for_srcwin(win.xoff, win.yoff),
                self.meta.projection.clone(),
                self.meta.nodata,
            ),
            z: Vec::with_capacity(win.cell_count()),
            count: Vec::with_capacity(win.cell_count()),
            weight: Vec::with_capacity(win.cell_count()),
            uncertainty: Vec::with_capacity(win.cell_count()),
        };

        for row in 0..win.ysize {
            let src_row = (win.yoff as usize) + row;
            let start = src_row * self.meta.nx + win.xoff as usize;
            out.z.extend_from_slice(&self.z[start..start + win.xsize]);
            out.count.extend_from_slice(&self.count[start..start + win.xsize]);
            out.weight.extend_from_slice(&self.weight[start..start + win.xsize]);
            out.uncertainty.extend_from_slice(&self.uncertainty[start..start + win.xsize]);
        }
        out
    }

    pub fn known_count(&self) -> usize {
        self.z.iter().filter(|z| !z.is_nan()).count()
    }
}

struct MaskBand {
    name: String,
    metadata: Vec<(String, String)>,
    cells: Vec<f64>,
}

/// Multi-band 0/1 source mask: one band per top-level dataset, band
/// description and metadata from the datalist entry.
pub struct StackMask {
    meta: RasterMeta,
    bands: Vec<MaskBand>,
}

impl StackMask {
    pub fn new(grid: &TargetGrid, projection: String) -> Self {
        StackMask {
            meta: grid.meta(projection, Some(0.0)),
            bands: Vec::new(),
        }
    }

    /// Band index for a dataset, created on first use.
    fn band_for(&mut self, name: &str, metadata: Vec<(String, String)>, weight: f64, uncertainty: f64) -> usize {
        if let Some(index) = self.bands.iter().position(|band| band.name == name) {
            return index;
        }

        let mut metadata = metadata;
        metadata.push(("weight".to_string(), weight.to_string()));
        metadata.push(("uncertainty".to_string(), uncertainty.to_string()));
        self.bands.push(MaskBand {
            name: name.to_string(),
            metadata,
            cells: vec![0.0; self.meta.cell_count()],
        });
        self.bands.len() - 1
    }

    fn mark(&mut self, band: usize, tile: &Tile) {
        let nx = self.meta.nx;
        let ny = self.meta.ny;
        let Some(mask_band) = self.bands.get_mut(band) else {
            return;
        };

        let win = &tile.srcwin;
        for tile_row in 0..win.ysize {
            let grid_row = win.yoff + tile_row as i64;
            if grid_row < 0 || grid_row >= ny as i64 {
                continue;
            }
            for tile_col in 0..win.xsize {
                let grid_col = win.xoff + tile_col as i64;
                if grid_col < 0 || grid_col >= nx as i64 {
                    continue;
                }
                let tile_idx = tile_row * win.xsize + tile_col;
                if tile.arrays.count[tile_idx] > 0.0 {
                    mask_band.cells[grid_row as usize * nx + grid_col as usize] = 1.0;
                }
            }
        }
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Write the mask raster with per-band descriptions and metadata.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.bands.is_empty() {
            return Err(Error::Runtime("no datasets were masked".to_string()));
        }

        let bands: Vec<&[f64]> = self.bands.iter().map(|band| band.cells.as_slice()).collect();
        raster::write_bands(&path, &self.meta, &bands, &[])?;

        let mut out = RasterIo::open_for_update(&path)?;
        for (index, band) in self.bands.iter().enumerate() {
            out.set_band_description(index + 1, &band.name)?;
            out.set_band_metadata(index + 1, &band.metadata)?;
        }
        Ok(())
    }

    /// One multipolygon set per band, carrying the band metadata; the
    /// spatial-metadata footprint of each source.
    pub fn polygonize(&self) -> Result<Vec<(String, Vec<(String, String)>, Vec<geo::raster::algo::MaskPolygon>)>> {
        let mut out = Vec::new();
        for band in &self.bands {
            let polygons = geo::raster::algo::polygonize(&self.meta, &band.cells)?;
            out.push((band.name.clone(), band.metadata.clone(), polygons));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlim::TileArrays;
    use geo::Region;

    fn tiny_grid() -> TargetGrid {
        // grid-node over a degenerate region: single cell
        TargetGrid::new(&Region::new(0.0, 0.5, 0.0, 0.5), 1.0, 1.0).unwrap()
    }

    fn tile_for(grid: &TargetGrid, z: f64, w: f64, count: f64, u: f64) -> Tile {
        let mut arrays = TileArrays::filled(1);
        arrays.z[0] = z;
        arrays.weight[0] = w;
        arrays.count[0] = count;
        arrays.uncertainty[0] = u;
        Tile {
            arrays,
            srcwin: Srcwin::new(0, 0, 1, 1),
            gt: grid.gt,
        }
    }

    #[test]
    fn weighted_mean_two_sources() {
        let grid = tiny_grid();
        let mut stacker = Stacker::new(grid.clone(), StackMode::WeightedMean, String::new());
        stacker.add_tile(&tile_for(&grid, 10.0, 1.0, 1.0, 0.0)).unwrap();
        stacker.add_tile(&tile_for(&grid, 20.0, 3.0, 1.0, 0.0)).unwrap();
        stacker.finalize();

        assert!((stacker.z()[0] - 17.5).abs() < 1e-12);
        assert_eq!(stacker.weight()[0], 4.0);
        assert_eq!(stacker.count()[0], 2.0);
    }

    #[test]
    fn supercede_two_sources() {
        let grid = tiny_grid();
        let mut stacker = Stacker::new(grid.clone(), StackMode::Supercede, String::new());
        stacker.add_tile(&tile_for(&grid, 10.0, 1.0, 1.0, 0.5)).unwrap();
        stacker.add_tile(&tile_for(&grid, 20.0, 3.0, 1.0, 0.25)).unwrap();
        stacker.finalize();

        assert_eq!(stacker.z()[0], 20.0);
        assert_eq!(stacker.weight()[0], 3.0);
        assert_eq!(stacker.count()[0], 2.0);
        assert_eq!(stacker.uncertainty()[0], 0.25);
    }

    #[test]
    fn supercede_is_idempotent() {
        let grid = tiny_grid();
        let tile = tile_for(&grid, 12.0, 2.0, 1.0, 0.1);

        let mut once = Stacker::new(grid.clone(), StackMode::Supercede, String::new());
        once.add_tile(&tile).unwrap();
        once.finalize();

        let mut twice = Stacker::new(grid.clone(), StackMode::Supercede, String::new());
        twice.add_tile(&tile).unwrap();
        twice.add_tile(&tile).unwrap();
        twice.finalize();

        assert_eq!(once.z()[0], twice.z()[0]);
        assert_eq!(once.weight()[0], twice.weight()[0]);
        assert_eq!(once.uncertainty()[0], twice.uncertainty()[0]);
    }

    #[test]
    fn supercede_disjoint_tiles_commute() {
        let grid = TargetGrid::new(&Region::new(0.0, 1.0, 0.0, 1.0), 1.0, 1.0).unwrap();
        let mut a = TileArrays::filled(1);
        a.z[0] = 5.0;
        a.weight[0] = 1.0;
        a.count[0] = 1.0;
        let tile_a = Tile {
            arrays: a,
            srcwin: Srcwin::new(0, 0, 1, 1),
            gt: grid.gt,
        };
        let mut b = TileArrays::filled(1);
        b.z[0] = 9.0;
        b.weight[0] = 2.0;
        b.count[0] = 1.0;
        let tile_b = Tile {
            arrays: b,
            srcwin: Srcwin::new(1, 1, 1, 1),
            gt: grid.gt.for_srcwin(1, 1),
        };

        let mut forward = Stacker::new(grid.clone(), StackMode::Supercede, String::new());
        forward.add_tile(&tile_a).unwrap();
        forward.add_tile(&tile_b).unwrap();
        forward.finalize();

        let mut reverse = Stacker::new(grid.clone(), StackMode::Supercede, String::new());
        reverse.add_tile(&tile_b).unwrap();
        reverse.add_tile(&tile_a).unwrap();
        reverse.finalize();

        assert_eq!(forward.z(), reverse.z());
        assert_eq!(forward.weight(), reverse.weight());
    }

    #[test]
    fn unit_weight_mean_is_arithmetic_mean() {
        let grid = tiny_grid();
        let mut stacker = Stacker::new(grid.clone(), StackMode::WeightedMean, String::new());
        for z in [2.0, 4.0, 9.0] {
            stacker.add_tile(&tile_for(&grid, z, 1.0, 1.0, 0.0)).unwrap();
        }
        stacker.finalize();
        assert!((stacker.z()[0] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn empty_cells_are_nodata_in_every_band() {
        let grid = TargetGrid::new(&Region::new(0.0, 1.0, 0.0, 1.0), 1.0, 1.0).unwrap();
        let mut stacker = Stacker::new(grid.clone(), StackMode::WeightedMean, String::new());
        let mut arrays = TileArrays::filled(1);
        arrays.z[0] = 3.0;
        arrays.weight[0] = 1.0;
        arrays.count[0] = 1.0;
        stacker
            .add_tile(&Tile {
                arrays,
                srcwin: Srcwin::new(0, 0, 1, 1),
                gt: grid.gt,
            })
            .unwrap();
        stacker.finalize();

        // cell (0,0) is set, the other three are nodata across all bands
        assert!(!stacker.z()[0].is_nan());
        for idx in 1..4 {
            assert!(stacker.z()[idx].is_nan());
            assert!(stacker.count()[idx].is_nan());
            assert!(stacker.weight()[idx].is_nan());
            assert!(stacker.uncertainty()[idx].is_nan());
            assert!(stacker.src_uncertainty()[idx].is_nan());
        }
    }
}
