//! Grid algorithms: proximity, terrain derivatives, polygonize, rasterize,
//! percentiles. Inputs and outputs are f64 planes with NaN as nodata.

use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};

use gdal::raster::processing::dem::{DemCommonOptions, DemProcessing, SlopeOptions, TriOptions};
use gdal::raster::Buffer;
use gdal::vector::LayerAccess;
use gdal::Dataset;

use crate::gdalinterop::cpl_result;
use crate::raster::io::{create_in_memory, RasterIo, RasterMeta};
use crate::{Error, Result};

static VSIMEM_COUNTER: AtomicU64 = AtomicU64::new(0);

fn vsimem_path(tag: &str) -> String {
    let id = VSIMEM_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("/vsimem/cudem_{tag}_{id}.tif")
}

fn unlink_vsimem(path: &str) {
    if let Ok(c_path) = CString::new(path) {
        unsafe {
            gdal_sys::VSIUnlink(c_path.as_ptr());
        }
    }
}

/// Build an in-memory single-band dataset from a plane, NaN converted to the
/// meta nodata value.
pub fn dataset_from_plane(meta: &RasterMeta, plane: &[f64]) -> Result<Dataset> {
    if plane.len() != meta.cell_count() {
        return Err(Error::InvalidArgument(format!(
            "plane size mismatch: {} cells for a {}x{} raster",
            plane.len(),
            meta.nx,
            meta.ny
        )));
    }

    let ds = create_in_memory(meta, 1)?;
    let ndv = meta.nodata.unwrap_or(f64::NAN);
    let data: Vec<f32> = plane.iter().map(|&v| if v.is_nan() { ndv as f32 } else { v as f32 }).collect();
    let mut buffer = Buffer::new((meta.nx, meta.ny), data);
    ds.rasterband(1)?.write((0, 0), (meta.nx, meta.ny), &mut buffer)?;
    Ok(ds)
}

/// Per-cell distance in pixels to the nearest finite cell of the plane.
pub fn proximity(meta: &RasterMeta, plane: &[f64]) -> Result<Vec<f64>> {
    let mask: Vec<f64> = plane.iter().map(|v| if v.is_nan() { 0.0 } else { 1.0 }).collect();
    let mut mask_meta = meta.clone();
    mask_meta.nodata = None;
    let src = dataset_from_plane(&mask_meta, &mask)?;
    let dst = create_in_memory(&mask_meta, 1)?;

    let mut options = gdal::cpl::CslStringList::new();
    options.add_string("VALUES=1")?;
    options.add_string("DISTUNITS=PIXEL")?;

    unsafe {
        cpl_result(
            "GDALComputeProximity",
            gdal_sys::GDALComputeProximity(
                src.rasterband(1)?.c_rasterband(),
                dst.rasterband(1)?.c_rasterband(),
                options.as_ptr(),
                None,
                std::ptr::null_mut(),
            ),
        )?;
    }

    RasterIo::from_dataset(dst).read_band(1)
}

fn read_derivative(ds: Dataset, path: &str) -> Result<Vec<f64>> {
    let result = RasterIo::from_dataset(ds).read_band(1);
    unlink_vsimem(path);
    result
}

/// Slope in degrees. `scale` is the ratio of vertical to horizontal units
/// (111120 for geographic coordinates with z in meters).
pub fn slope(meta: &RasterMeta, plane: &[f64], scale: Option<f64>) -> Result<Vec<f64>> {
    let src = dataset_from_plane(meta, plane)?;
    let mut options = SlopeOptions::new();
    if let Some(scale) = scale {
        options.with_scale(scale);
    }
    let path = vsimem_path("slope");
    read_derivative(src.slope(&path, &options)?, &path)
}

/// Terrain ruggedness index.
pub fn tri(meta: &RasterMeta, plane: &[f64]) -> Result<Vec<f64>> {
    let src = dataset_from_plane(meta, plane)?;
    let path = vsimem_path("tri");
    read_derivative(src.terrain_ruggedness_index(&path, &TriOptions::new())?, &path)
}

/// Topographic position index.
pub fn tpi(meta: &RasterMeta, plane: &[f64]) -> Result<Vec<f64>> {
    let src = dataset_from_plane(meta, plane)?;
    let path = vsimem_path("tpi");
    read_derivative(src.topographic_position_index(&path, &DemCommonOptions::default())?, &path)
}

/// Roughness (largest inter-cell difference to the neighbors).
pub fn roughness(meta: &RasterMeta, plane: &[f64]) -> Result<Vec<f64>> {
    let src = dataset_from_plane(meta, plane)?;
    let path = vsimem_path("roughness");
    read_derivative(src.roughness(&path, &DemCommonOptions::default())?, &path)
}

/// Curvature as the slope of the slope surface.
pub fn curvature(meta: &RasterMeta, plane: &[f64], scale: Option<f64>) -> Result<Vec<f64>> {
    let slope_plane = slope(meta, plane, scale)?;
    slope(meta, &slope_plane, None)
}

/// Nan-aware percentile (0..=100) over a plane, linear interpolation between
/// ranks. Returns None when no finite values are present.
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }

    finite.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (finite.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        Some(finite[lo])
    } else {
        let frac = rank - lo as f64;
        Some(finite[lo] * (1.0 - frac) + finite[hi] * frac)
    }
}

/// A polygon produced by [`polygonize`].
pub struct MaskPolygon {
    pub wkt: String,
    pub value: i32,
    pub area: f64,
}

/// Polygonize the non-zero cells of a 0/1 plane into multipolygons.
pub fn polygonize(meta: &RasterMeta, plane: &[f64]) -> Result<Vec<MaskPolygon>> {
    let mut mask_meta = meta.clone();
    mask_meta.nodata = Some(0.0);
    let src = dataset_from_plane(&mask_meta, plane)?;
    let raster_band = src.rasterband(1)?;

    let driver = gdal::DriverManager::get_driver_by_name("Memory")?;
    let mut vector_ds = driver.create_vector_only("polygonized")?;
    let mut layer = vector_ds.create_layer(gdal::vector::LayerOptions {
        name: "mask",
        ty: gdal_sys::OGRwkbGeometryType::wkbMultiPolygon,
        ..Default::default()
    })?;
    layer.create_defn_fields(&[("DN", gdal::vector::OGRFieldType::OFTInteger)])?;

    unsafe {
        cpl_result(
            "GDALPolygonize",
            gdal_sys::GDALPolygonize(
                raster_band.c_rasterband(),
                raster_band.c_rasterband(),
                layer.c_layer(),
                0,
                std::ptr::null_mut(),
                None,
                std::ptr::null_mut(),
            ),
        )?;
    }

    let mut polygons = Vec::new();
    for feature in layer.features() {
        let Some(geometry) = feature.geometry() else {
            continue;
        };
        let value = match feature.field("DN")? {
            Some(gdal::vector::FieldValue::IntegerValue(v)) => v,
            _ => 0,
        };
        polygons.push(MaskPolygon {
            wkt: geometry.wkt()?,
            value,
            area: geometry.area(),
        });
    }

    Ok(polygons)
}

/// Burn vector geometries into a plane with the given value. Cells covered by
/// any geometry receive `burn_value`, the rest keep their input value.
pub fn rasterize_burn(meta: &RasterMeta, plane: &mut [f64], geometries: &[gdal::vector::Geometry], burn_value: f64) -> Result {
    if geometries.is_empty() {
        return Ok(());
    }

    let mut ds = dataset_from_plane(meta, plane)?;
    let burn_values = vec![burn_value; geometries.len()];
    gdal::raster::rasterize(&mut ds, &[1], geometries, &burn_values, None)?;

    let updated = RasterIo::from_dataset(ds).read_band(1)?;
    plane.copy_from_slice(&updated);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GeoTransform, GridNode, Region};

    fn meta(n: usize) -> RasterMeta {
        let region = Region::new(0.0, n as f64, 0.0, n as f64);
        let (nx, ny, gt) = region.geo_transform(1.0, 1.0, GridNode::Pixel).unwrap();
        RasterMeta::new(nx, ny, gt, String::new(), Some(-9999.0))
    }

    #[test]
    fn percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0, f64::NAN];
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 100.0), Some(4.0));
        assert_eq!(percentile(&values, 50.0), Some(2.5));
        assert_eq!(percentile(&[f64::NAN], 50.0), None);
    }

    #[test]
    fn proximity_measures_pixel_distance() {
        let meta = meta(5);
        let mut plane = vec![f64::NAN; meta.cell_count()];
        plane[2 * 5 + 2] = 1.0; // center cell known
        let prox = proximity(&meta, &plane).unwrap();
        assert_eq!(prox[2 * 5 + 2], 0.0);
        assert!((prox[2 * 5 + 3] - 1.0).abs() < 1e-6);
        assert!((prox[0] - (8.0f64).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn slope_of_plane_is_constant() {
        let meta = RasterMeta::new(10, 10, GeoTransform::north_up(0.0, 10.0, 1.0, 1.0), String::new(), Some(-9999.0));
        let plane: Vec<f64> = (0..100).map(|i| (i % 10) as f64).collect(); // z = x
        let slopes = slope(&meta, &plane, None).unwrap();
        // interior cells all rise 1 unit per cell -> 45 degrees
        let interior = slopes[5 * 10 + 5];
        assert!((interior - 45.0).abs() < 1.0, "slope was {interior}");
    }

    #[test]
    fn polygonize_extracts_mask() {
        let meta = meta(4);
        let mut plane = vec![0.0; meta.cell_count()];
        for row in 0..2 {
            for col in 0..2 {
                plane[row * 4 + col] = 1.0;
            }
        }
        let polygons = polygonize(&meta, &plane).unwrap();
        assert_eq!(polygons.len(), 1);
        assert_eq!(polygons[0].value, 1);
        assert!((polygons[0].area - 4.0).abs() < 1e-9);
    }
}
