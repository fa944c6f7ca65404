use std::path::Path;

use dlim::{Dataset, TargetGrid};
use gdal::vector::LayerAccess;
use geo::raster::algo::MaskPolygon;
use geo::raster::{self, algo, sample_warp, RasterIo, ResampleAlg};

use crate::{Result, StackMode, Stacker};

#[derive(Clone, Debug, Default)]
pub struct CoastlineOptions {
    /// Swap land and water in the final mask.
    pub invert: bool,
    /// Resampler used when warping background rasters onto the grid.
    pub sample_alg: ResampleAlg,
}

/// Land/water mask synthesis.
///
/// Signed layers accumulate on the target grid: background DEMs contribute
/// the sign of their elevation, hydrography/lake/building/built-up masks
/// subtract, user data contributes the sign of its z. The summed plane is
/// thresholded (> 0 is land) into a 0/1 mask.
pub struct CoastlineBuilder {
    grid: TargetGrid,
    projection: String,
    options: CoastlineOptions,
    accumulator: Vec<f64>,
}

impl CoastlineBuilder {
    pub fn new(grid: TargetGrid, projection: String, options: CoastlineOptions) -> Self {
        let cells = grid.nx * grid.ny;
        CoastlineBuilder {
            grid,
            projection,
            options,
            accumulator: vec![0.0; cells],
        }
    }

    fn meta(&self) -> raster::RasterMeta {
        self.grid.meta(self.projection.clone(), Some(-9999.0))
    }

    /// Warp a raster onto the grid and return its plane.
    fn warped_plane(&self, path: &Path) -> Result<Vec<f64>> {
        let source = RasterIo::open_read_only(path)?;
        let mut target = self.meta();
        target.nodata = source.nodata(1)?.or(Some(-9999.0));
        let warped = sample_warp(source.dataset(), &target, None, self.options.sample_alg)?;
        Ok(RasterIo::from_dataset(warped).read_band(1)?)
    }

    /// Background elevation: positive cells count as land, everything else
    /// as water (GMRT/Copernicus style backgrounds).
    pub fn add_background_dem(&mut self, path: &Path) -> Result<()> {
        let plane = self.warped_plane(path)?;
        for (cell, value) in self.accumulator.iter_mut().zip(plane) {
            if value.is_finite() && value > 0.0 {
                *cell += 1.0;
            }
        }
        Ok(())
    }

    /// Burn vector water/built geometries and subtract them (NHD
    /// hydrography, HydroLakes, OSM buildings).
    pub fn subtract_vector(&mut self, path: &Path) -> Result<()> {
        let options = gdal::DatasetOptions {
            open_flags: gdal::GdalOpenFlags::GDAL_OF_READONLY | gdal::GdalOpenFlags::GDAL_OF_VECTOR,
            ..Default::default()
        };
        let ds = gdal::Dataset::open_ex(path, options)?;

        let mut geometries = Vec::new();
        for index in 0..ds.layer_count() {
            let mut layer = ds.layer(index)?;
            for feature in layer.features() {
                if let Some(geometry) = feature.geometry() {
                    geometries.push(geometry.clone());
                }
            }
        }

        let meta = self.meta();
        let mut burn = vec![0.0f64; meta.cell_count()];
        algo::rasterize_burn(&meta, &mut burn, &geometries, 1.0)?;
        for (cell, burned) in self.accumulator.iter_mut().zip(burn) {
            if burned > 0.0 {
                *cell -= 1.0;
            }
        }
        Ok(())
    }

    /// Subtract a built-up raster mask (WSF): any non-zero cell removes land.
    pub fn subtract_raster_mask(&mut self, path: &Path) -> Result<()> {
        let plane = self.warped_plane(path)?;
        for (cell, value) in self.accumulator.iter_mut().zip(plane) {
            if value.is_finite() && value != 0.0 {
                *cell -= 1.0;
            }
        }
        Ok(())
    }

    /// User data contributes strict signs: sign(z) in {-1, 0, +1} per
    /// occupied cell of the stacked inputs.
    pub fn add_datasets(&mut self, datasets: &mut [Box<dyn Dataset>]) -> Result<()> {
        let mut stacker = Stacker::new(self.grid.clone(), StackMode::WeightedMean, self.projection.clone());
        for dataset in datasets {
            stacker.add_dataset(dataset.as_mut(), None)?;
        }
        stacker.finalize();

        for (cell, &z) in self.accumulator.iter_mut().zip(stacker.z()) {
            if z.is_finite() {
                *cell += z.signum();
            }
        }
        Ok(())
    }

    /// Threshold the accumulated layers into the 0/1 land mask.
    pub fn finalize(&self) -> Vec<f64> {
        self.accumulator
            .iter()
            .map(|&sum| {
                let land = sum > 0.0;
                if land != self.options.invert { 1.0 } else { 0.0 }
            })
            .collect()
    }

    /// Write the mask raster.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let mask = self.finalize();
        let mut meta = self.meta();
        meta.nodata = None;
        raster::write_bands(path, &meta, &[&mask], &[])?;
        Ok(())
    }

    /// Polygonize the land cells; `keep` limits the output to the N largest
    /// polygons by area.
    pub fn polygons(&self, keep: Option<usize>) -> Result<Vec<MaskPolygon>> {
        let mask = self.finalize();
        let mut polygons: Vec<MaskPolygon> = algo::polygonize(&self.meta(), &mask)?
            .into_iter()
            .filter(|polygon| polygon.value != 0)
            .collect();
        polygons.sort_by(|a, b| b.area.partial_cmp(&a.area).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(keep) = keep {
            polygons.truncate(keep);
        }
        Ok(polygons)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlim::{DatasetOptions, Inheritance, MemDataset};
    use geo::{Region, XyzPoint};

    fn grid() -> TargetGrid {
        TargetGrid::new(&Region::new(0.0, 4.0, 0.0, 4.0), 1.0, 1.0).unwrap()
    }

    #[test]
    fn user_data_signs_decide_land() {
        let grid = grid();
        let mut builder = CoastlineBuilder::new(grid.clone(), String::new(), CoastlineOptions::default());

        let points = vec![
            XyzPoint::new(1.0, 1.0, 25.0),  // land
            XyzPoint::new(3.0, 3.0, -10.0), // water
        ];
        let mut datasets: Vec<Box<dyn Dataset>> = vec![Box::new(MemDataset::new(
            points,
            &Inheritance::default(),
            &DatasetOptions::default(),
        ))];
        builder.add_datasets(&mut datasets).unwrap();

        let mask = builder.finalize();
        let land_idx = grid.cell_of(1.0, 1.0).map(|(row, col)| row * grid.nx + col).unwrap();
        let water_idx = grid.cell_of(3.0, 3.0).map(|(row, col)| row * grid.nx + col).unwrap();
        assert_eq!(mask[land_idx], 1.0);
        assert_eq!(mask[water_idx], 0.0);
    }

    #[test]
    fn inversion_swaps_land_and_water() {
        let grid = grid();
        let options = CoastlineOptions {
            invert: true,
            ..Default::default()
        };
        let mut builder = CoastlineBuilder::new(grid.clone(), String::new(), options);

        let mut datasets: Vec<Box<dyn Dataset>> = vec![Box::new(MemDataset::new(
            vec![XyzPoint::new(1.0, 1.0, 5.0)],
            &Inheritance::default(),
            &DatasetOptions::default(),
        ))];
        builder.add_datasets(&mut datasets).unwrap();

        let mask = builder.finalize();
        let idx = grid.cell_of(1.0, 1.0).map(|(row, col)| row * grid.nx + col).unwrap();
        assert_eq!(mask[idx], 0.0);
        // an untouched cell reads as land under inversion
        assert_eq!(mask[0], 1.0);
    }

    #[test]
    fn largest_polygons_are_kept() {
        let grid = grid();
        let mut builder = CoastlineBuilder::new(grid.clone(), String::new(), CoastlineOptions::default());

        // one large block, one single-cell island
        let mut points = vec![XyzPoint::new(3.9, 0.1, 10.0)];
        for row in 0..3 {
            for col in 0..3 {
                points.push(XyzPoint::new(col as f64 + 0.1, row as f64 + 1.1, 10.0));
            }
        }
        let mut datasets: Vec<Box<dyn Dataset>> = vec![Box::new(MemDataset::new(
            points,
            &Inheritance::default(),
            &DatasetOptions::default(),
        ))];
        builder.add_datasets(&mut datasets).unwrap();

        let all = builder.polygons(None).unwrap();
        assert!(all.len() >= 2);
        let top = builder.polygons(Some(1)).unwrap();
        assert_eq!(top.len(), 1);
        assert!(top[0].area >= all.iter().map(|p| p.area).fold(0.0, f64::max));
    }
}
