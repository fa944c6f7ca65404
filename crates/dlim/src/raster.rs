use std::path::PathBuf;

use geo::raster::{sample_warp, RasterIo, RasterMeta};
use geo::{GeoTransform, Region, Srcwin, XyzPoint};

use crate::dataset::{DatasetCore, PointIter, TargetGrid, Tile, TileArrays, TileIter};
use crate::options::BandSource;
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, Error, GdalOptions, Inf, Inheritance, Result};

/// Rows per emitted tile when sweeping a raster.
const ROW_GROUP: usize = 512;

/// GDAL-readable raster dataset.
pub struct GdalDataset {
    core: DatasetCore,
    opts: GdalOptions,
}

impl GdalDataset {
    pub fn new(path: impl Into<PathBuf>, opts: GdalOptions, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        GdalDataset {
            core: DatasetCore::new(path, formats::GDAL, inherited, options),
            opts,
        }
    }

    pub fn from_entry(path: PathBuf, entry: &DatalistEntry, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        let mut opts = GdalOptions::default();
        for (key, value) in &entry.format_options {
            match key.as_str() {
                "band_no" => {
                    opts.band = value
                        .parse::<usize>()
                        .map_err(|_| Error::Parse(format!("invalid band number: {value}")))?
                }
                "mask" => opts.mask = parse_band_source(value),
                "weight_mask" => opts.weight = parse_band_source(value),
                "uncertainty_mask" => opts.uncertainty = parse_band_source(value),
                "open_options" => opts.open_options = value.split('/').map(str::to_string).collect(),
                "sample" => opts.sample = Some(geo::raster::ResampleAlg::from_name(value)?),
                "resample" => opts.no_resample = value == "false" || value == "no",
                other => log::warn!("ignoring unknown gdal option {other}"),
            }
        }

        Ok(GdalDataset::new(path, opts, inherited, options))
    }

    pub fn with_core_format(mut self, format: i32) -> Self {
        self.core.format = format;
        self
    }

    fn open_source(&self) -> Result<RasterIo> {
        if self.opts.open_options.is_empty() {
            RasterIo::open_read_only(&self.core.path)
        } else {
            RasterIo::open_read_only_with_options(&self.core.path, &self.opts.open_options)
        }
    }

    /// Source aligned to the requested grid: warped/resampled when increments
    /// are configured, the native grid otherwise.
    fn open_aligned(&self, grid: Option<&TargetGrid>) -> Result<AlignedSource> {
        let source = self.open_source()?;
        let elevation_band = self.opts.elevation_band();

        let (raster, meta) = match grid {
            Some(grid) => {
                let nodata = source.nodata(elevation_band)?.unwrap_or(-9999.0);
                let projection = match &self.core.options.dst_srs {
                    Some(dst) => geo::SpatialRef::from_user_input(dst)?.to_wkt()?,
                    None => source.projection(),
                };
                let target = grid.meta(projection, Some(nodata));
                let warped = sample_warp(source.dataset(), &target, None, self.opts.sample.unwrap_or(self.core.options.sample_alg))?;
                (RasterIo::from_dataset(warped), target)
            }
            None => {
                let meta = source.meta(elevation_band)?;
                (source, meta)
            }
        };

        // z plane
        let z = raster.read_window(elevation_band, &Srcwin::full(meta.nx, meta.ny))?;

        // optional aux planes
        let weight = self.read_aux(&raster, &meta, &self.opts.weight, grid)?;
        let uncertainty = self.read_aux(&raster, &meta, &self.opts.uncertainty, grid)?;
        let mask = self.read_aux(&raster, &meta, &self.opts.mask, grid)?;

        Ok(AlignedSource {
            meta,
            z,
            weight,
            uncertainty,
            mask,
        })
    }

    /// Resolve an auxiliary band source into a plane on the aligned grid.
    fn read_aux(&self, raster: &RasterIo, meta: &RasterMeta, source: &BandSource, grid: Option<&TargetGrid>) -> Result<Option<Vec<f64>>> {
        match source {
            BandSource::None => Ok(None),
            BandSource::Scalar(value) => Ok(Some(vec![*value; meta.cell_count()])),
            BandSource::Band(band) => Ok(Some(raster.read_window(*band, &Srcwin::full(meta.nx, meta.ny))?)),
            BandSource::File(path) => {
                let side = RasterIo::open_read_only(path)?;
                match grid {
                    Some(_) => {
                        let warped = sample_warp(side.dataset(), meta, None, self.opts.sample.unwrap_or(self.core.options.sample_alg))?;
                        RasterIo::from_dataset(warped)
                            .read_window(1, &Srcwin::full(meta.nx, meta.ny))
                            .map(Some)
                            .map_err(Into::into)
                    }
                    None => {
                        let side_meta = side.meta(1)?;
                        if (side_meta.nx, side_meta.ny) != (meta.nx, meta.ny) {
                            return Err(Error::InvalidArgument(format!(
                                "auxiliary raster {} does not match the source grid",
                                path.to_string_lossy()
                            )));
                        }
                        side.read_window(1, &Srcwin::full(meta.nx, meta.ny)).map(Some).map_err(Into::into)
                    }
                }
            }
        }
    }

    /// Apply mask and z/w/u region constraints in place.
    fn filter_planes(&self, source: &mut AlignedSource) {
        if let Some(mask) = &source.mask {
            for (idx, mask_value) in mask.iter().enumerate() {
                if mask_value.is_nan() || *mask_value == 0.0 {
                    source.z[idx] = f64::NAN;
                }
            }
        }

        let Some(region) = &self.core.options.region else {
            return;
        };

        let invert = self.core.options.invert_region;
        for idx in 0..source.z.len() {
            let z = source.z[idx];
            if z.is_nan() {
                continue;
            }

            let in_z = region.zmin.is_none_or(|zmin| z >= zmin) && region.zmax.is_none_or(|zmax| z <= zmax);
            let w = source.weight.as_ref().map(|plane| plane[idx]);
            let in_w = w.is_none_or(|w| region.wmin.is_none_or(|wmin| w >= wmin) && region.wmax.is_none_or(|wmax| w <= wmax));
            let u = source.uncertainty.as_ref().map(|plane| plane[idx]);
            let in_u = u.is_none_or(|u| region.umin.is_none_or(|umin| u >= umin) && region.umax.is_none_or(|umax| u <= umax));

            if (in_z && in_w && in_u) == invert {
                source.z[idx] = f64::NAN;
            }
        }
    }
}

struct AlignedSource {
    meta: RasterMeta,
    z: Vec<f64>,
    weight: Option<Vec<f64>>,
    uncertainty: Option<Vec<f64>>,
    mask: Option<Vec<f64>>,
}

impl Dataset for GdalDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn generate_inf(&mut self) -> Result<Inf> {
        let source = self.open_source()?;
        let (nx, ny) = source.raster_size();
        let gt = source.geo_transform()?;
        let mut region = Region::from_geo_transform(&gt, nx, ny);

        // min/max scan is optional and may fail on some drivers
        if let Ok(band) = source.dataset().rasterband(self.opts.elevation_band()) {
            if let Ok(minmax) = band.compute_raster_min_max(true) {
                region.zmin = Some(minmax.min);
                region.zmax = Some(minmax.max);
            }
        }

        if self.core.src_srs.is_none() {
            let projection = source.projection();
            if !projection.is_empty() {
                self.core.src_srs = Some(projection);
            }
        }

        let mut inf = Inf {
            name: self.core.path.to_string_lossy().to_string(),
            hash: crate::inf::hash_file(&self.core.path).ok(),
            numpts: (nx * ny) as u64,
            format: self.core.format,
            src_srs: self.core.src_srs.clone(),
            ..Default::default()
        };
        inf.set_region(&region);
        Ok(inf)
    }

    fn yield_points(&mut self) -> Result<PointIter> {
        let grid = match (self.core.options.x_inc, self.core.options.y_inc, &self.core.options.region) {
            (Some(x_inc), Some(y_inc), Some(region)) if !self.opts.no_resample => Some(TargetGrid::new(region, x_inc, y_inc)?),
            _ => None,
        };

        let mut source = self.open_aligned(grid.as_ref())?;
        self.filter_planes(&mut source);

        // when the source was not warped the points still need the transform
        let transformer = if grid.is_none() { self.core.transformer()? } else { None };
        let region = self.core.options.region.clone();
        let invert = self.core.options.invert_region;
        let weight = self.core.weight;
        let uncertainty = self.core.uncertainty;

        let AlignedSource {
            meta,
            z,
            weight: weight_plane,
            uncertainty: uncertainty_plane,
            ..
        } = source;
        let nx = meta.nx;
        let ny = meta.ny;
        let gt = meta.gt;

        let iter = (0..ny).flat_map(move |row| (0..nx).map(move |col| (row, col))).filter_map(move |(row, col)| {
            let idx = row * nx + col;
            let z_value = z[idx];
            if z_value.is_nan() {
                return None;
            }

            let (x, y) = gt.pixel_center(col as i64, row as i64);
            let w = weight_plane.as_ref().map_or(weight, |plane| plane[idx] * weight);
            let u = uncertainty_plane.as_ref().map_or(uncertainty, |plane| plane[idx]);
            let mut point = XyzPoint::with_wu(x, y, z_value, w, u);

            if let Some(transformer) = &transformer {
                if point.transform(transformer).is_err() {
                    return None;
                }
            }
            if let Some(region) = &region {
                if region.contains_xyz(&point) == invert {
                    return None;
                }
            }
            Some(point)
        });

        Ok(Box::new(iter))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        if self.opts.no_resample {
            // native-grid cells become center points, blocked onto the target
            let tile = crate::dataset::block_points(self.yield_points()?, grid);
            return Ok(Box::new(tile.into_iter().map(Ok)));
        }

        let mut source = self.open_aligned(Some(grid))?;
        self.filter_planes(&mut source);

        let weight = self.core.weight;
        let uncertainty = self.core.uncertainty;
        let AlignedSource {
            meta,
            z,
            weight: weight_plane,
            uncertainty: uncertainty_plane,
            ..
        } = source;

        let row_groups: Vec<usize> = (0..meta.ny).step_by(ROW_GROUP).collect();
        let gt: GeoTransform = meta.gt;
        let nx = meta.nx;
        let ny = meta.ny;

        let iter = row_groups.into_iter().filter_map(move |row0| {
            let rows = ROW_GROUP.min(ny - row0);
            let cells = rows * nx;
            let mut arrays = TileArrays::filled(cells);
            let mut any = false;

            for idx in 0..cells {
                let src_idx = row0 * nx + idx;
                let z_value = z[src_idx];
                if z_value.is_nan() {
                    continue;
                }
                any = true;
                arrays.z[idx] = z_value;
                arrays.count[idx] = 1.0;
                arrays.weight[idx] = weight_plane.as_ref().map_or(weight, |plane| plane[src_idx].max(0.0) * weight);
                arrays.uncertainty[idx] = uncertainty_plane.as_ref().map_or(uncertainty, |plane| plane[src_idx]);
            }

            if !any {
                return None;
            }

            let srcwin = Srcwin::new(0, row0 as i64, nx, rows);
            Some(Ok(Tile {
                arrays,
                srcwin,
                gt: gt.for_srcwin(0, row0 as i64),
            }))
        });

        Ok(Box::new(iter))
    }
}

fn parse_band_source(value: &str) -> BandSource {
    if let Ok(band) = value.parse::<usize>() {
        return BandSource::Band(band);
    }
    if let Ok(scalar) = value.parse::<f64>() {
        return BandSource::Scalar(scalar);
    }
    BandSource::File(PathBuf::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::raster::write_bands;
    use geo::GridNode;

    fn write_test_raster(path: &std::path::Path, region: &Region, inc: f64, values: &[f64]) -> RasterMeta {
        let (nx, ny, gt) = region.geo_transform(inc, inc, GridNode::Pixel).unwrap();
        let meta = RasterMeta::new(nx, ny, gt, String::new(), Some(-9999.0));
        write_bands(path, &meta, &[values], &[]).unwrap();
        meta
    }

    #[test]
    fn inf_covers_raster_extent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        let region = Region::new(0.0, 4.0, 0.0, 4.0);
        let values: Vec<f64> = (0..16).map(|v| v as f64).collect();
        write_test_raster(&path, &region, 1.0, &values);

        let mut ds = GdalDataset::new(path, GdalOptions::default(), &Inheritance::default(), &DatasetOptions::default());
        let inf = ds.generate_inf().unwrap();
        assert_eq!(inf.numpts, 16);
        let inf_region = inf.region().unwrap();
        assert_eq!((inf_region.xmin, inf_region.xmax), (0.0, 4.0));
        assert_eq!(inf_region.zmax, Some(15.0));
    }

    #[test]
    fn points_carry_dataset_weight() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        let region = Region::new(0.0, 2.0, 0.0, 2.0);
        write_test_raster(&path, &region, 1.0, &[1.0, 2.0, 3.0, 4.0]);

        let inherited = Inheritance {
            weight: 2.5,
            ..Default::default()
        };
        let mut ds = GdalDataset::new(path, GdalOptions::default(), &inherited, &DatasetOptions::default());
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points.len(), 4);
        assert!(points.iter().all(|p| p.w == 2.5));
        // pixel centers
        assert_eq!((points[0].x, points[0].y), (0.5, 1.5));
    }

    #[test]
    fn z_range_filter_drops_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        let region = Region::new(0.0, 2.0, 0.0, 2.0);
        write_test_raster(&path, &region, 1.0, &[1.0, 2.0, 30.0, 4.0]);

        let mut filter_region = region.clone();
        filter_region.zmax = Some(10.0);
        let options = DatasetOptions {
            region: Some(filter_region),
            ..Default::default()
        };
        let mut ds = GdalDataset::new(path, GdalOptions::default(), &Inheritance::default(), &options);
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points.len(), 3);
        assert!(points.iter().all(|p| p.z <= 10.0));
    }

    #[test]
    fn no_resample_blocks_native_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        let region = Region::new(0.0, 2.0, 0.0, 2.0);
        write_test_raster(&path, &region, 1.0, &[1.0, 2.0, 3.0, 4.0]);

        let options = DatasetOptions {
            region: Some(region.clone()),
            x_inc: Some(1.0),
            y_inc: Some(1.0),
            ..Default::default()
        };
        let opts = GdalOptions {
            no_resample: true,
            ..Default::default()
        };
        let mut ds = GdalDataset::new(path, opts, &Inheritance::default(), &options);
        let grid = TargetGrid::new(&region, 1.0, 1.0).unwrap();
        let tiles: Vec<Tile> = ds.yield_tiles(&grid).unwrap().map(|t| t.unwrap()).collect();
        assert_eq!(tiles.len(), 1);

        let arrays = &tiles[0].arrays;
        let known: Vec<f64> = arrays.z.iter().copied().filter(|z| !z.is_nan()).collect();
        assert_eq!(known.len(), 4);
        assert_eq!(arrays.count.iter().sum::<f64>(), 4.0);
    }

    #[test]
    fn tiles_align_to_target_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dem.tif");
        let region = Region::new(0.0, 4.0, 0.0, 4.0);
        let values = vec![7.0; 16];
        write_test_raster(&path, &region, 1.0, &values);

        let options = DatasetOptions {
            region: Some(region.clone()),
            x_inc: Some(1.0),
            y_inc: Some(1.0),
            ..Default::default()
        };
        let mut ds = GdalDataset::new(path, GdalOptions::default(), &Inheritance::default(), &options);
        let grid = TargetGrid::new(&region, 1.0, 1.0).unwrap();
        let tiles: Vec<Tile> = ds.yield_tiles(&grid).unwrap().map(|t| t.unwrap()).collect();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].srcwin.xsize, grid.nx);
        let known: Vec<f64> = tiles[0].arrays.z.iter().copied().filter(|z| !z.is_nan()).collect();
        assert!(!known.is_empty());
        assert!(known.iter().all(|&z| (z - 7.0).abs() < 1e-6));
    }
}
