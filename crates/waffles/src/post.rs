use std::path::{Path, PathBuf};
use std::process::Command;

use gdal::vector::LayerAccess;
use geo::raster::{self, algo, sample_warp, RasterIo, ResampleAlg};
use geo::{GridNode, Region, SpatialRef, Srcwin};

use crate::{gaussian_blur, Error, OutlierFilter, Result};

/// One step of the filter chain. `split` restricts a filter to cells below
/// the given elevation; cells at or above it keep their input value.
#[derive(Clone, Debug)]
pub enum FilterSpec {
    Blur { factor: usize, split: Option<f64> },
    Outliers { filter: OutlierFilter, split: Option<f64> },
    GrdFilter { args: String, split: Option<f64> },
}

#[derive(Clone, Debug)]
pub struct ClipSpec {
    pub path: PathBuf,
    pub invert: bool,
}

/// The ordered finalization pipeline. Every step is optional and leaves the
/// raster unchanged when its input is unset.
#[derive(Clone, Debug)]
pub struct FinalizeOptions {
    pub ndv: f64,
    pub filters: Vec<FilterSpec>,
    pub xsample: Option<f64>,
    pub ysample: Option<f64>,
    pub clip: Option<ClipSpec>,
    pub cut_region: Option<Region>,
    pub upper_limit: Option<f64>,
    pub lower_limit: Option<f64>,
    pub dst_srs: Option<String>,
    pub node: GridNode,
    /// Stamp NOAA/NCEI branding metadata (copyright, topo/bathy class).
    pub branded: bool,
    /// Output driver name; the file is converted when it differs.
    pub dst_format: Option<String>,
}

impl Default for FinalizeOptions {
    fn default() -> Self {
        FinalizeOptions {
            ndv: -9999.0,
            filters: Vec::new(),
            xsample: None,
            ysample: None,
            clip: None,
            cut_region: None,
            upper_limit: None,
            lower_limit: None,
            dst_srs: None,
            node: GridNode::Pixel,
            branded: false,
            dst_format: None,
        }
    }
}

/// Post-processor for a produced DEM file.
pub struct DemFinalizer {
    path: PathBuf,
}

impl DemFinalizer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DemFinalizer { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run the pipeline; returns the final path (which changes on format
    /// conversion).
    pub fn process(&mut self, options: &FinalizeOptions) -> Result<PathBuf> {
        log::info!("post-processing DEM {}", self.path.to_string_lossy());

        self.normalize_nodata(options.ndv)?;

        for filter in &options.filters {
            self.filter(filter)?;
        }

        if options.xsample.is_some() || options.ysample.is_some() {
            self.resample(options.xsample, options.ysample)?;
        }

        if let Some(clip) = &options.clip {
            self.clip(clip)?;
        }

        if let Some(region) = &options.cut_region {
            self.cut(region)?;
        }

        if options.upper_limit.is_some() || options.lower_limit.is_some() {
            self.set_limits(options.lower_limit, options.upper_limit)?;
        }

        if let Some(srs) = &options.dst_srs {
            self.set_srs(srs)?;
        }

        self.set_metadata(options.node, options.branded)?;

        if let Some(format) = &options.dst_format {
            self.reformat(format)?;
        }

        Ok(self.path.clone())
    }

    /// Rewrite the band nodata so every empty token becomes the sentinel.
    fn normalize_nodata(&mut self, ndv: f64) -> Result<()> {
        let mut raster = RasterIo::open_for_update(&self.path)?;
        let (nx, ny) = raster.raster_size();
        for band in 1..=raster.band_count() {
            let data = raster.read_band(band)?;
            raster.set_nodata(band, Some(ndv))?;
            raster.write_window(band, &Srcwin::full(nx, ny), &data)?;
        }
        raster.flush()?;
        Ok(())
    }

    fn read_plane(&self) -> Result<(geo::raster::RasterMeta, Vec<f64>)> {
        let raster = RasterIo::open_read_only(&self.path)?;
        let meta = raster.meta(1)?;
        let plane = raster.read_band(1)?;
        Ok((meta, plane))
    }

    fn write_plane(&mut self, plane: &[f64]) -> Result<()> {
        let mut raster = RasterIo::open_for_update(&self.path)?;
        let (nx, ny) = raster.raster_size();
        raster.write_window(1, &Srcwin::full(nx, ny), plane)?;
        raster.flush()?;
        Ok(())
    }

    fn filter(&mut self, spec: &FilterSpec) -> Result<()> {
        let (meta, original) = self.read_plane()?;
        let mut filtered = original.clone();

        let split = match spec {
            FilterSpec::Blur { factor, split } => {
                filtered = gaussian_blur(meta.nx, meta.ny, &filtered, *factor);
                *split
            }
            FilterSpec::Outliers { filter, split } => {
                filter.apply(&meta, &mut filtered, None)?;
                *split
            }
            FilterSpec::GrdFilter { args, split } => {
                filtered = self.grdfilter(args)?;
                *split
            }
        };

        // a split value keeps everything at or above it untouched
        if let Some(split) = split {
            for (idx, value) in original.iter().enumerate() {
                if !value.is_nan() && *value >= split {
                    filtered[idx] = *value;
                }
            }
        }

        self.write_plane(&filtered)
    }

    /// Pass the DEM through GMT grdfilter and read the filtered band back.
    fn grdfilter(&self, args: &str) -> Result<Vec<f64>> {
        let tmp_dir = tempfile::tempdir()?;
        let tmp_out = tmp_dir.path().join("grdfilter.tif");

        let output = Command::new("gmt")
            .arg("grdfilter")
            .arg(&self.path)
            .arg(format!("-G{}=gd:GTiff", tmp_out.to_string_lossy()))
            .arg(format!("-F{args}"))
            .arg("-D1")
            .output()
            .map_err(|err| Error::ExternalTool(format!("gmt grdfilter: {err}")))?;
        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "gmt grdfilter exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(RasterIo::open_read_only(&tmp_out)?.read_band(1)?)
    }

    fn resample(&mut self, xsample: Option<f64>, ysample: Option<f64>) -> Result<()> {
        let source = RasterIo::open_read_only(&self.path)?;
        let meta = source.meta(1)?;
        let x_inc = xsample.unwrap_or(meta.gt.cell_size_x());
        let y_inc = ysample.unwrap_or(meta.gt.cell_size_y().abs());

        let region = meta.region();
        let (nx, ny, gt) = region.geo_transform(x_inc, y_inc, GridNode::Pixel)?;
        let target = geo::raster::RasterMeta::new(nx, ny, gt, meta.projection.clone(), meta.nodata);

        let mut warped = sample_warp(source.dataset(), &target, None, ResampleAlg::CubicSpline)?;
        drop(source);

        let tmp = self.path.with_extension("resample.tif");
        raster::write_to_disk(&mut warped, &tmp, &[])?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Clip to the polygons of a vector file; cells outside become nodata.
    fn clip(&mut self, clip: &ClipSpec) -> Result<()> {
        let vector_options = gdal::DatasetOptions {
            open_flags: gdal::GdalOpenFlags::GDAL_OF_READONLY | gdal::GdalOpenFlags::GDAL_OF_VECTOR,
            ..Default::default()
        };
        let vector = gdal::Dataset::open_ex(&clip.path, vector_options)
            .map_err(|_| Error::InvalidArgument(format!("could not read clip source {}", clip.path.to_string_lossy())))?;

        let mut geometries = Vec::new();
        for index in 0..vector.layer_count() {
            let mut layer = vector.layer(index)?;
            for feature in layer.features() {
                if let Some(geometry) = feature.geometry() {
                    geometries.push(geometry.clone());
                }
            }
        }

        let (meta, mut plane) = self.read_plane()?;
        let mut mask = vec![0.0f64; meta.cell_count()];
        algo::rasterize_burn(&meta, &mut mask, &geometries, 1.0)?;

        for (idx, value) in plane.iter_mut().enumerate() {
            let inside = mask[idx] > 0.0;
            if inside == clip.invert {
                *value = f64::NAN;
            }
        }
        self.write_plane(&plane)
    }

    /// Cut all bands to the pixel window of the region.
    fn cut(&mut self, region: &Region) -> Result<()> {
        let source = RasterIo::open_read_only(&self.path)?;
        let meta = source.meta(1)?;
        let win = region.srcwin(&meta.gt, meta.nx, meta.ny, GridNode::Pixel);
        if win.is_empty() {
            return Err(Error::InvalidArgument(format!("cut region {region} misses the DEM")));
        }

        let cut_meta = geo::raster::RasterMeta::new(
            win.xsize,
            win.ysize,
            meta.gt.for_srcwin(win.xoff, win.yoff),
            meta.projection.clone(),
            meta.nodata,
        );

        let mut bands = Vec::new();
        for band in 1..=source.band_count() {
            bands.push(source.read_window(band, &win)?);
        }
        drop(source);

        let band_refs: Vec<&[f64]> = bands.iter().map(Vec::as_slice).collect();
        let tmp = self.path.with_extension("cut.tif");
        raster::write_bands(&tmp, &cut_meta, &band_refs, &[])?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn set_limits(&mut self, lower: Option<f64>, upper: Option<f64>) -> Result<()> {
        let (_, mut plane) = self.read_plane()?;
        for value in plane.iter_mut() {
            if value.is_nan() {
                continue;
            }
            if let Some(upper) = upper {
                if *value > upper {
                    *value = upper;
                }
            }
            if let Some(lower) = lower {
                if *value < lower {
                    *value = lower;
                }
            }
        }
        self.write_plane(&plane)
    }

    fn set_srs(&mut self, srs: &str) -> Result<()> {
        let wkt = SpatialRef::from_user_input(srs)?.to_wkt()?;
        let mut raster = RasterIo::open_for_update(&self.path)?;
        raster.set_projection(&wkt)?;
        raster.flush()?;
        Ok(())
    }

    fn set_metadata(&mut self, node: GridNode, branded: bool) -> Result<()> {
        let mut raster = RasterIo::open_for_update(&self.path)?;
        let z_range = {
            let plane = raster.read_band(1)?;
            let finite: Vec<f64> = plane.into_iter().filter(|v| v.is_finite()).collect();
            let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
            let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (min, max)
        };

        let node_offset = match node {
            GridNode::Pixel => ("Area", "1"),
            GridNode::Grid => ("Point", "0"),
        };
        raster.set_metadata_item("AREA_OR_POINT", node_offset.0, "")?;
        raster.set_metadata_item("NC_GLOBAL#node_offset", node_offset.1, "")?;
        let stamp = chrono::Utc::now().format("%Y:%m:%d %H:%M:%S").to_string();
        raster.set_metadata_item("TIFFTAG_DATETIME", &stamp, "")?;

        if branded {
            raster.set_metadata_item(
                "TIFFTAG_COPYRIGHT",
                "DOC/NOAA/NESDIS/NCEI > National Centers for Environmental Information, NESDIS, NOAA, U.S. Department of Commerce",
                "",
            )?;

            let class = if z_range.1 < 0.0 {
                "Bathymetry"
            } else if z_range.0 > 0.0 {
                "Topography"
            } else {
                "Topography-Bathymetry"
            };
            let projection = raster.projection();
            let vdatum = projection
                .find("VERT_CS[\"")
                .map(|start| {
                    let rest = &projection[start + 9..];
                    rest.split('"').next().unwrap_or_default().to_string()
                })
                .unwrap_or_default();
            raster.set_metadata_item("TIFFTAG_IMAGEDESCRIPTION", &format!("{class}; {vdatum}"), "")?;
        }

        raster.flush()?;
        Ok(())
    }

    fn reformat(&mut self, format: &str) -> Result<()> {
        let extension = raster::extension_for_driver(format);
        let current = self.path.extension().map(|e| e.to_string_lossy().to_lowercase());
        if current.as_deref() == Some(extension) {
            return Ok(());
        }

        let out = self.path.with_extension(extension);
        raster::convert(&self.path, &out, &[])?;
        std::fs::remove_file(&self.path)?;
        self.path = out;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::raster::{write_bands, RasterMeta};

    fn write_dem(dir: &Path, values: &[f64], n: usize) -> PathBuf {
        let region = Region::new(0.0, n as f64, 0.0, n as f64);
        let (nx, ny, gt) = region.geo_transform(1.0, 1.0, GridNode::Pixel).unwrap();
        let meta = RasterMeta::new(nx, ny, gt, String::new(), Some(-9999.0));
        let path = dir.join("dem.tif");
        write_bands(&path, &meta, &[values], &[]).unwrap();
        path
    }

    #[test]
    fn limits_clamp_band_values() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<f64> = (0..16).map(|v| v as f64).collect();
        let path = write_dem(dir.path(), &values, 4);

        let mut finalizer = DemFinalizer::new(&path);
        let options = FinalizeOptions {
            lower_limit: Some(2.0),
            upper_limit: Some(10.0),
            ..Default::default()
        };
        finalizer.process(&options).unwrap();

        let data = RasterIo::open_read_only(&path).unwrap().read_band(1).unwrap();
        assert!(data.iter().all(|&v| (2.0..=10.0).contains(&v)));
    }

    #[test]
    fn cut_shrinks_to_region() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<f64> = vec![1.0; 64];
        let path = write_dem(dir.path(), &values, 8);

        let mut finalizer = DemFinalizer::new(&path);
        let options = FinalizeOptions {
            cut_region: Some(Region::new(2.0, 6.0, 2.0, 6.0)),
            ..Default::default()
        };
        finalizer.process(&options).unwrap();

        let raster = RasterIo::open_read_only(&path).unwrap();
        assert_eq!(raster.raster_size(), (4, 4));
        let region = raster.meta(1).unwrap().region();
        assert_eq!((region.xmin, region.xmax), (2.0, 6.0));
    }

    #[test]
    fn metadata_stamping() {
        let dir = tempfile::tempdir().unwrap();
        let values: Vec<f64> = vec![-5.0; 16];
        let path = write_dem(dir.path(), &values, 4);

        let mut finalizer = DemFinalizer::new(&path);
        let options = FinalizeOptions {
            branded: true,
            ..Default::default()
        };
        finalizer.process(&options).unwrap();

        let ds = gdal::Dataset::open(&path).unwrap();
        use gdal::Metadata as _;
        assert_eq!(ds.metadata_item("AREA_OR_POINT", "").as_deref(), Some("Area"));
        assert!(ds.metadata_item("TIFFTAG_DATETIME", "").is_some());
        let description = ds.metadata_item("TIFFTAG_IMAGEDESCRIPTION", "").unwrap();
        assert!(description.starts_with("Bathymetry"));
    }

    #[test]
    fn split_filter_preserves_high_ground() {
        let dir = tempfile::tempdir().unwrap();
        let n = 8usize;
        let mut values: Vec<f64> = vec![0.0; n * n];
        values[27] = -50.0; // below split, gets smoothed
        values[36] = 50.0; // above split, untouched
        let path = write_dem(dir.path(), &values, n);

        let mut finalizer = DemFinalizer::new(&path);
        let options = FinalizeOptions {
            filters: vec![FilterSpec::Blur {
                factor: 2,
                split: Some(0.0),
            }],
            ..Default::default()
        };
        finalizer.process(&options).unwrap();

        let data = RasterIo::open_read_only(&path).unwrap().read_band(1).unwrap();
        assert_eq!(data[36], 50.0);
        assert!(data[27] > -50.0);
    }
}
