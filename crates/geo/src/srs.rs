//! Spatial reference handling and coordinate transformations.
//!
//! A CRS spec is either a plain definition understood by GDAL (`epsg:4326`,
//! WKT, proj4) or a compound `epsg:HHHH+VVVV` string carrying a horizontal
//! and a vertical authority code. Vertical shift grids are not generated
//! here, a caller that has one can attach it with
//! [`CoordinateTransformer::with_geoid_grid`].

use std::path::Path;

use gdal::spatial_ref::AxisMappingStrategy;

use crate::{Error, Result};

pub struct SpatialRef {
    srs: gdal::spatial_ref::SpatialRef,
    vertical_epsg: Option<u32>,
    definition: String,
}

impl SpatialRef {
    /// Parses a CRS spec, splitting off a `+VVVV` vertical authority code when present.
    pub fn from_user_input(definition: &str) -> Result<Self> {
        let definition = definition.trim();
        if definition.is_empty() {
            return Err(Error::InvalidArgument("empty srs definition".to_string()));
        }

        let (horizontal, vertical_epsg) = match definition.to_lowercase().strip_prefix("epsg:") {
            Some(codes) => match codes.split_once('+') {
                Some((horz, vert)) => {
                    let vert = vert
                        .parse::<u32>()
                        .map_err(|_| Error::Parse(format!("invalid vertical epsg code: {vert}")))?;
                    (format!("epsg:{horz}"), Some(vert))
                }
                None => (format!("epsg:{codes}"), None),
            },
            None => (definition.to_string(), None),
        };

        let mut srs = gdal::spatial_ref::SpatialRef::from_definition(&horizontal)?;
        srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        Ok(SpatialRef {
            srs,
            vertical_epsg,
            definition: definition.to_string(),
        })
    }

    pub fn from_epsg(epsg: u32) -> Result<Self> {
        let mut srs = gdal::spatial_ref::SpatialRef::from_epsg(epsg)?;
        srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        Ok(SpatialRef {
            srs,
            vertical_epsg: None,
            definition: format!("epsg:{epsg}"),
        })
    }

    pub fn from_wkt(wkt: &str) -> Result<Self> {
        let mut srs = gdal::spatial_ref::SpatialRef::from_wkt(wkt)?;
        srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        Ok(SpatialRef {
            srs,
            vertical_epsg: None,
            definition: wkt.to_string(),
        })
    }

    pub fn definition(&self) -> &str {
        &self.definition
    }

    pub fn vertical_epsg(&self) -> Option<u32> {
        self.vertical_epsg
    }

    pub fn horizontal_epsg(&mut self) -> Option<u32> {
        if self.srs.auto_identify_epsg().is_ok() {
            self.srs.auth_code().ok().map(|code| code as u32)
        } else {
            None
        }
    }

    pub fn to_wkt(&self) -> Result<String> {
        Ok(self.srs.to_wkt()?)
    }

    pub fn to_proj4(&self) -> Result<String> {
        Ok(self.srs.to_proj4()?)
    }

    pub fn is_geographic(&self) -> bool {
        self.srs.is_geographic()
    }

    pub fn gdal(&self) -> &gdal::spatial_ref::SpatialRef {
        &self.srs
    }

    /// Two specs describe the same transform target when their definitions match.
    pub fn same_as(&self, other: &SpatialRef) -> bool {
        self.definition == other.definition
    }
}

/// Coordinate transform between two spatial references.
///
/// The transform is horizontal unless a geoid shift grid was attached, in
/// which case z values are shifted through the grid as well.
pub struct CoordinateTransformer {
    transform: gdal::spatial_ref::CoordTransform,
}

impl CoordinateTransformer {
    pub fn new(src: &SpatialRef, dst: &SpatialRef) -> Result<Self> {
        let transform = gdal::spatial_ref::CoordTransform::new(src.gdal(), dst.gdal())
            .map_err(|err| Error::Transform(format!("could not create transform: {err}")))?;
        Ok(CoordinateTransformer { transform })
    }

    pub fn from_definitions(src: &str, dst: &str) -> Result<Self> {
        CoordinateTransformer::new(&SpatialRef::from_user_input(src)?, &SpatialRef::from_user_input(dst)?)
    }

    /// Builds a transform whose source side shifts z through the provided
    /// geoid grid. The grid itself is produced by an external collaborator.
    pub fn with_geoid_grid(src: &SpatialRef, dst: &SpatialRef, grid: &Path) -> Result<Self> {
        let src_proj = format!("{} +geoidgrids={}", src.to_proj4()?, grid.to_string_lossy());
        let mut src_srs = gdal::spatial_ref::SpatialRef::from_proj4(&src_proj)?;
        src_srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
        let transform = gdal::spatial_ref::CoordTransform::new(&src_srs, dst.gdal())
            .map_err(|err| Error::Transform(format!("could not create transform: {err}")))?;
        Ok(CoordinateTransformer { transform })
    }

    pub fn transform_coordinate(&self, x: f64, y: f64, z: f64) -> Result<(f64, f64, f64)> {
        let mut xs = [x];
        let mut ys = [y];
        let mut zs = [z];
        self.transform
            .transform_coords(&mut xs, &mut ys, &mut zs)
            .map_err(|err| Error::Transform(format!("transform failed: {err}")))?;
        Ok((xs[0], ys[0], zs[0]))
    }

    pub fn transform_coordinates(&self, xs: &mut [f64], ys: &mut [f64], zs: &mut [f64]) -> Result {
        self.transform
            .transform_coords(xs, ys, zs)
            .map_err(|err| Error::Transform(format!("transform failed: {err}")))?;
        Ok(())
    }
}

/// Splits a compound CRS spec into its horizontal and vertical parts.
pub fn split_srs(definition: &str) -> (String, Option<u32>) {
    if let Some(codes) = definition.trim().to_lowercase().strip_prefix("epsg:") {
        if let Some((horz, vert)) = codes.split_once('+') {
            if let Ok(vert) = vert.parse::<u32>() {
                return (format!("epsg:{horz}"), Some(vert));
            }
        }
    }
    (definition.trim().to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_compound_spec() {
        assert_eq!(split_srs("epsg:4326+5703"), ("epsg:4326".to_string(), Some(5703)));
        assert_eq!(split_srs("epsg:32617"), ("epsg:32617".to_string(), None));
        assert_eq!(split_srs("+proj=longlat"), ("+proj=longlat".to_string(), None));
    }

    #[test]
    fn geographic_transform() {
        let src = SpatialRef::from_epsg(4326).unwrap();
        let dst = SpatialRef::from_epsg(3857).unwrap();
        let transformer = CoordinateTransformer::new(&src, &dst).unwrap();
        let (x, y, _) = transformer.transform_coordinate(0.0, 0.0, 0.0).unwrap();
        assert!(x.abs() < 1e-6 && y.abs() < 1e-6);
    }
}
