use std::ffi::CString;
use std::path::{Path, PathBuf};

use gdal::cpl::CslStringList;
use gdal::errors::GdalError;
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager, Metadata};

use crate::gdalinterop::cpl_pointer;
use crate::{Error, GeoTransform, Result, Srcwin};

/// Grid description of a raster: size, placement, projection, nodata.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterMeta {
    pub nx: usize,
    pub ny: usize,
    pub gt: GeoTransform,
    pub projection: String,
    pub nodata: Option<f64>,
}

impl RasterMeta {
    pub fn new(nx: usize, ny: usize, gt: GeoTransform, projection: String, nodata: Option<f64>) -> Self {
        RasterMeta {
            nx,
            ny,
            gt,
            projection,
            nodata,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.nx * self.ny
    }

    pub fn region(&self) -> crate::Region {
        crate::Region::from_geo_transform(&self.gt, self.nx, self.ny)
    }
}

/// Raster dataset adapter. Wraps a GDAL dataset handle and keeps all band
/// traffic in f64 with NaN as the in-memory nodata marker; the sentinel only
/// exists on disk.
pub struct RasterIo {
    ds: Dataset,
    path: PathBuf,
}

impl RasterIo {
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let flags = gdal::GdalOpenFlags::GDAL_OF_READONLY | gdal::GdalOpenFlags::GDAL_OF_RASTER;
        Self::open_with_options(path, flags, &[])
    }

    /// Open with GDAL driver open options (e.g. BAG MODE=... settings).
    pub fn open_read_only_with_options(path: impl AsRef<Path>, open_options: &[String]) -> Result<Self> {
        let flags = gdal::GdalOpenFlags::GDAL_OF_READONLY | gdal::GdalOpenFlags::GDAL_OF_RASTER;
        Self::open_with_options(path, flags, open_options)
    }

    pub fn open_for_update(path: impl AsRef<Path>) -> Result<Self> {
        let flags = gdal::GdalOpenFlags::GDAL_OF_UPDATE | gdal::GdalOpenFlags::GDAL_OF_RASTER;
        Self::open_with_options(path, flags, &[])
    }

    fn open_with_options(path: impl AsRef<Path>, open_flags: gdal::GdalOpenFlags, open_options: &[String]) -> Result<Self> {
        let path = path.as_ref();
        let str_options: Vec<&str> = open_options.iter().map(String::as_str).collect();
        let options = gdal::DatasetOptions {
            open_flags,
            open_options: if str_options.is_empty() { None } else { Some(&str_options) },
            ..Default::default()
        };

        let ds = Dataset::open_ex(path, options).map_err(|err| match err {
            // give a cleaner message when the file simply is not there
            GdalError::NullPointer { .. } if !path.exists() => Error::InvalidPath(PathBuf::from(path)),
            _ => Error::Runtime(format!("Failed to open raster dataset: {} ({})", path.to_string_lossy(), err)),
        })?;

        Ok(RasterIo {
            ds,
            path: PathBuf::from(path),
        })
    }

    pub fn from_dataset(ds: Dataset) -> Self {
        RasterIo {
            ds,
            path: PathBuf::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dataset(&self) -> &Dataset {
        &self.ds
    }

    pub fn band_count(&self) -> usize {
        self.ds.raster_count()
    }

    pub fn raster_size(&self) -> (usize, usize) {
        self.ds.raster_size()
    }

    pub fn geo_transform(&self) -> Result<GeoTransform> {
        Ok(GeoTransform::new(self.ds.geo_transform()?))
    }

    pub fn projection(&self) -> String {
        self.ds.projection()
    }

    pub fn nodata(&self, band: usize) -> Result<Option<f64>> {
        Ok(self.ds.rasterband(band)?.no_data_value())
    }

    pub fn meta(&self, band: usize) -> Result<RasterMeta> {
        let (nx, ny) = self.raster_size();
        Ok(RasterMeta {
            nx,
            ny,
            gt: self.geo_transform()?,
            projection: self.projection(),
            nodata: self.nodata(band)?,
        })
    }

    /// Read a full band, translating the nodata sentinel to NaN.
    pub fn read_band(&self, band: usize) -> Result<Vec<f64>> {
        let (nx, ny) = self.raster_size();
        self.read_window(band, &Srcwin::full(nx, ny))
    }

    /// Read a window of a band, translating the nodata sentinel to NaN.
    pub fn read_window(&self, band: usize, win: &Srcwin) -> Result<Vec<f64>> {
        let rasterband = self.ds.rasterband(band)?;
        let buffer = rasterband.read_as::<f64>(
            (win.xoff as isize, win.yoff as isize),
            (win.xsize, win.ysize),
            (win.xsize, win.ysize),
            None,
        )?;

        let mut data = buffer.data().to_vec();
        if let Some(ndv) = rasterband.no_data_value() {
            if !ndv.is_nan() {
                for value in &mut data {
                    if *value == ndv {
                        *value = f64::NAN;
                    }
                }
            }
        }
        Ok(data)
    }

    /// Write a window of a band, translating NaN to the band nodata value.
    pub fn write_window(&mut self, band: usize, win: &Srcwin, data: &[f64]) -> Result {
        if data.len() != win.cell_count() {
            return Err(Error::InvalidArgument(format!(
                "window data size mismatch: {} cells for a {}x{} window",
                data.len(),
                win.xsize,
                win.ysize
            )));
        }

        let mut rasterband = self.ds.rasterband(band)?;
        let ndv = rasterband.no_data_value();
        let mut out = data.to_vec();
        if let Some(ndv) = ndv {
            for value in &mut out {
                if value.is_nan() {
                    *value = ndv;
                }
            }
        }

        let mut buffer = Buffer::new((win.xsize, win.ysize), out);
        rasterband.write((win.xoff as isize, win.yoff as isize), (win.xsize, win.ysize), &mut buffer)?;
        Ok(())
    }

    pub fn set_nodata(&mut self, band: usize, nodata: Option<f64>) -> Result {
        self.ds.rasterband(band)?.set_no_data_value(nodata)?;
        Ok(())
    }

    pub fn set_band_description(&mut self, band: usize, description: &str) -> Result {
        self.ds.rasterband(band)?.set_description(description)?;
        Ok(())
    }

    pub fn set_band_metadata(&mut self, band: usize, items: &[(String, String)]) -> Result {
        let mut rasterband = self.ds.rasterband(band)?;
        for (key, value) in items {
            rasterband.set_metadata_item(key, value, "")?;
        }
        Ok(())
    }

    pub fn set_metadata_item(&mut self, key: &str, value: &str, domain: &str) -> Result {
        self.ds.set_metadata_item(key, value, domain)?;
        Ok(())
    }

    pub fn set_projection(&mut self, projection: &str) -> Result {
        self.ds.set_projection(projection)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result {
        self.ds.flush_cache()?;
        Ok(())
    }
}

/// Creates an in-memory dataset of float32 bands on the given grid.
pub fn create_in_memory(meta: &RasterMeta, bands: usize) -> Result<Dataset> {
    let driver = DriverManager::get_driver_by_name("MEM")?;
    let mut ds = driver.create_with_band_type::<f32, _>("in_mem", meta.nx, meta.ny, bands)?;
    apply_meta(&mut ds, meta)?;
    Ok(ds)
}

fn apply_meta(ds: &mut Dataset, meta: &RasterMeta) -> Result {
    ds.set_geo_transform(&meta.gt.coefficients())?;
    if !meta.projection.is_empty() {
        ds.set_projection(&meta.projection)?;
    }
    for band in 1..=ds.raster_count() {
        ds.rasterband(band)?.set_no_data_value(meta.nodata)?;
    }
    Ok(())
}

/// Write float64 planes as the bands of a new raster file.
///
/// NaN cells become the nodata sentinel from `meta`. The GeoTIFF defaults
/// (LZW, tiled) are applied when no driver options are provided.
pub fn write_bands(path: impl AsRef<Path>, meta: &RasterMeta, bands: &[&[f64]], driver_options: &[String]) -> Result<()> {
    let path = path.as_ref();
    create_output_directory_if_needed(path)?;

    let mut ds = create_in_memory(meta, bands.len())?;
    let ndv = meta.nodata.unwrap_or(f64::NAN);
    for (index, plane) in bands.iter().enumerate() {
        if plane.len() != meta.cell_count() {
            return Err(Error::InvalidArgument(format!(
                "band {} size mismatch: {} cells for a {}x{} raster",
                index + 1,
                plane.len(),
                meta.nx,
                meta.ny
            )));
        }

        let data: Vec<f32> = plane.iter().map(|&v| if v.is_nan() { ndv as f32 } else { v as f32 }).collect();
        let mut buffer = Buffer::new((meta.nx, meta.ny), data);
        ds.rasterband(index + 1)?.write((0, 0), (meta.nx, meta.ny), &mut buffer)?;
    }

    write_to_disk(&mut ds, path, driver_options)
}

/// Write dataset to disk using the driver's CreateCopy method.
pub fn write_to_disk(ds: &mut Dataset, path: impl AsRef<Path>, driver_options: &[String]) -> Result<()> {
    let path = path.as_ref();
    let driver = driver_for_path(path)?;

    let mut c_opts = CslStringList::new();
    for opt in driver_options {
        c_opts.add_string(opt)?;
    }

    if driver_options.is_empty() && driver.short_name() == "GTiff" {
        // sane defaults for GeoTIFF files
        c_opts.add_string("COMPRESS=LZW")?;
        c_opts.add_string("TILED=YES")?;
    }

    let path_str = CString::new(path.to_string_lossy().to_string())?;
    let ds_handle = cpl_pointer("GDALCreateCopy", unsafe {
        gdal_sys::GDALCreateCopy(
            driver.c_driver(),
            path_str.as_ptr(),
            ds.c_dataset(),
            0, // bStrict
            c_opts.as_ptr(),
            Some(gdal_sys::GDALDummyProgress),
            std::ptr::null_mut(),
        )
    })?;

    unsafe { gdal_sys::GDALClose(ds_handle) };
    Ok(())
}

/// Copy a raster to a different format.
pub fn convert(src: impl AsRef<Path>, dst: impl AsRef<Path>, driver_options: &[String]) -> Result<()> {
    let src = RasterIo::open_read_only(src)?;
    let mut ds_handle = src.ds;
    write_to_disk(&mut ds_handle, dst, driver_options)
}

pub fn driver_for_path(path: impl AsRef<Path>) -> Result<gdal::Driver> {
    let path = path.as_ref();
    let driver_name = guess_driver_name(path).ok_or_else(|| {
        Error::Runtime(format!(
            "Could not detect raster type from filename: {}",
            path.to_string_lossy()
        ))
    })?;

    Ok(DriverManager::get_driver_by_name(driver_name)?)
}

/// Given a file path, guess the gdal raster driver based on the file extension
pub fn guess_driver_name(path: impl AsRef<Path>) -> Option<&'static str> {
    let ext = path.as_ref().extension().map(|ext| ext.to_string_lossy().to_lowercase())?;
    match ext.as_ref() {
        "tif" | "tiff" => Some("GTiff"),
        "nc" => Some("netCDF"),
        "asc" => Some("AAIGrid"),
        "img" => Some("HFA"),
        "vrt" => Some("VRT"),
        "grd" => Some("GMT"),
        "bag" => Some("BAG"),
        _ => None,
    }
}

/// The customary file extension for a gdal raster driver.
pub fn extension_for_driver(driver: &str) -> &'static str {
    match driver {
        "netCDF" => "nc",
        "AAIGrid" => "asc",
        "HFA" => "img",
        "VRT" => "vrt",
        "GMT" => "grd",
        "BAG" => "bag",
        _ => "tif",
    }
}

fn create_output_directory_if_needed(path: &Path) -> Result {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GridNode;
    use crate::Region;

    fn small_meta() -> RasterMeta {
        let region = Region::new(0.0, 4.0, 0.0, 4.0);
        let (nx, ny, gt) = region.geo_transform(1.0, 1.0, GridNode::Pixel).unwrap();
        RasterMeta::new(nx, ny, gt, String::new(), Some(-9999.0))
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roundtrip.tif");
        let meta = small_meta();

        let mut plane = vec![1.5f64; meta.cell_count()];
        plane[5] = f64::NAN;
        write_bands(&path, &meta, &[&plane], &[]).unwrap();

        let raster = RasterIo::open_read_only(&path).unwrap();
        assert_eq!(raster.band_count(), 1);
        assert_eq!(raster.raster_size(), (4, 4));
        let data = raster.read_band(1).unwrap();
        assert!(data[5].is_nan());
        assert_eq!(data[0], 1.5);
    }

    #[test]
    fn open_missing_file_is_invalid_path() {
        let result = RasterIo::open_read_only("/no/such/raster.tif");
        assert!(matches!(result.err().unwrap(), Error::InvalidPath(_)));
    }

    #[test]
    fn window_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window.tif");
        let meta = small_meta();
        write_bands(&path, &meta, &[&vec![0.0f64; meta.cell_count()]], &[]).unwrap();

        let mut raster = RasterIo::open_for_update(&path).unwrap();
        let win = Srcwin::new(1, 1, 2, 2);
        raster.write_window(1, &win, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let read_back = raster.read_window(1, &win).unwrap();
        assert_eq!(read_back, vec![1.0, 2.0, 3.0, 4.0]);
    }
}
