use std::ffi::CString;
use std::path::Path;

use gdal::Dataset;

use crate::gdalinterop::cpl_result;
use crate::raster::io::{create_in_memory, write_to_disk, RasterMeta};
use crate::{Error, Result};

/// Resampling kernels supported when aligning a source raster to a target
/// grid. `Auto` picks `Average` when downsampling and `Bilinear` when
/// upsampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ResampleAlg {
    Near,
    #[default]
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
    Mode,
    Min,
    Max,
    Med,
    Q1,
    Q3,
    Sum,
    Auto,
}

impl ResampleAlg {
    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name.to_lowercase().as_str() {
            "near" | "nearest" => ResampleAlg::Near,
            "bilinear" => ResampleAlg::Bilinear,
            "cubic" => ResampleAlg::Cubic,
            "cubicspline" => ResampleAlg::CubicSpline,
            "lanczos" => ResampleAlg::Lanczos,
            "average" => ResampleAlg::Average,
            "mode" => ResampleAlg::Mode,
            "min" => ResampleAlg::Min,
            "max" => ResampleAlg::Max,
            "med" | "median" => ResampleAlg::Med,
            "q1" => ResampleAlg::Q1,
            "q3" => ResampleAlg::Q3,
            "sum" => ResampleAlg::Sum,
            "auto" => ResampleAlg::Auto,
            other => return Err(Error::InvalidArgument(format!("unknown resample algorithm: {other}"))),
        })
    }

    /// Resolve `Auto` based on the sampling direction.
    pub fn resolve(self, downsampling: bool) -> ResampleAlg {
        match self {
            ResampleAlg::Auto => {
                if downsampling {
                    ResampleAlg::Average
                } else {
                    ResampleAlg::Bilinear
                }
            }
            other => other,
        }
    }

    fn gdal_alg(self) -> gdal_sys::GDALResampleAlg::Type {
        use gdal_sys::GDALResampleAlg;
        match self {
            ResampleAlg::Near => GDALResampleAlg::GRA_NearestNeighbour,
            ResampleAlg::Bilinear | ResampleAlg::Auto => GDALResampleAlg::GRA_Bilinear,
            ResampleAlg::Cubic => GDALResampleAlg::GRA_Cubic,
            ResampleAlg::CubicSpline => GDALResampleAlg::GRA_CubicSpline,
            ResampleAlg::Lanczos => GDALResampleAlg::GRA_Lanczos,
            ResampleAlg::Average => GDALResampleAlg::GRA_Average,
            ResampleAlg::Mode => GDALResampleAlg::GRA_Mode,
            ResampleAlg::Min => GDALResampleAlg::GRA_Min,
            ResampleAlg::Max => GDALResampleAlg::GRA_Max,
            ResampleAlg::Med => GDALResampleAlg::GRA_Med,
            ResampleAlg::Q1 => GDALResampleAlg::GRA_Q1,
            ResampleAlg::Q3 => GDALResampleAlg::GRA_Q3,
            ResampleAlg::Sum => GDALResampleAlg::GRA_Sum,
        }
    }
}

/// Warp/resample a source dataset onto the target grid, optionally changing
/// the projection. All source bands are carried over; cells not covered by
/// the source keep the target nodata value.
pub fn sample_warp(src: &Dataset, target: &RasterMeta, dst_projection: Option<&str>, alg: ResampleAlg) -> Result<Dataset> {
    let src_gt = src.geo_transform()?;
    let downsampling = target.gt.cell_size_x().abs() > src_gt[1].abs();
    let alg = alg.resolve(downsampling);

    let bands = src.raster_count().max(1);
    let mut target = target.clone();
    if let Some(projection) = dst_projection {
        target.projection = projection.to_string();
    }
    if target.projection.is_empty() {
        target.projection = src.projection();
    }

    let mut dst = create_in_memory(&target, bands)?;

    // initialize the full target with nodata, the warp only touches covered cells
    if let Some(ndv) = target.nodata {
        let fill = vec![ndv; target.cell_count()];
        for band in 1..=bands {
            let data: Vec<f32> = fill.iter().map(|&v| v as f32).collect();
            let mut buffer = gdal::raster::Buffer::new((target.nx, target.ny), data);
            dst.rasterband(band)?.write((0, 0), (target.nx, target.ny), &mut buffer)?;
        }
    }

    let src_wkt = CString::new(src.projection())?;
    let dst_wkt = CString::new(target.projection.clone())?;

    unsafe {
        cpl_result(
            "GDALReprojectImage",
            gdal_sys::GDALReprojectImage(
                src.c_dataset(),
                if src.projection().is_empty() {
                    std::ptr::null()
                } else {
                    src_wkt.as_ptr()
                },
                dst.c_dataset(),
                if target.projection.is_empty() {
                    std::ptr::null()
                } else {
                    dst_wkt.as_ptr()
                },
                alg.gdal_alg(),
                0.0,
                0.125,
                None,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            ),
        )?;
    }

    Ok(dst)
}

/// `sample_warp` straight to a file.
pub fn sample_warp_to_file(
    src: &Dataset,
    target: &RasterMeta,
    dst_projection: Option<&str>,
    alg: ResampleAlg,
    path: impl AsRef<Path>,
) -> Result<()> {
    let mut warped = sample_warp(src, target, dst_projection, alg)?;
    write_to_disk(&mut warped, path, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::io::write_bands;
    use crate::raster::RasterIo;
    use crate::{GridNode, Region, SpatialRef};

    #[test]
    fn auto_resolution() {
        assert_eq!(ResampleAlg::Auto.resolve(true), ResampleAlg::Average);
        assert_eq!(ResampleAlg::Auto.resolve(false), ResampleAlg::Bilinear);
        assert_eq!(ResampleAlg::Cubic.resolve(true), ResampleAlg::Cubic);
    }

    #[test]
    fn name_parsing() {
        assert_eq!(ResampleAlg::from_name("cubicspline").unwrap(), ResampleAlg::CubicSpline);
        assert_eq!(ResampleAlg::from_name("med").unwrap(), ResampleAlg::Med);
        assert!(ResampleAlg::from_name("sinc").is_err());
    }

    #[test]
    fn downsample_average_preserves_mean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.tif");

        let region = Region::new(0.0, 4.0, 0.0, 4.0);
        let (nx, ny, gt) = region.geo_transform(1.0, 1.0, GridNode::Pixel).unwrap();
        let projection = SpatialRef::from_epsg(4326).unwrap().to_wkt().unwrap();
        let meta = RasterMeta::new(nx, ny, gt, projection.clone(), Some(-9999.0));
        let plane = vec![2.0f64; meta.cell_count()];
        write_bands(&path, &meta, &[&plane], &[]).unwrap();

        let src = RasterIo::open_read_only(&path).unwrap();
        let (tnx, tny, tgt) = region.geo_transform(2.0, 2.0, GridNode::Pixel).unwrap();
        let target = RasterMeta::new(tnx, tny, tgt, projection, Some(-9999.0));
        let warped = sample_warp(src.dataset(), &target, None, ResampleAlg::Auto).unwrap();
        let warped = RasterIo::from_dataset(warped);

        let data = warped.read_band(1).unwrap();
        assert_eq!(data.len(), 4);
        for value in data {
            assert!((value - 2.0).abs() < 1e-6);
        }
    }
}
