use std::path::PathBuf;

use gdal::vector::{FieldValue, Geometry, LayerAccess};
use geo::{Region, XyzPoint};

use crate::dataset::{block_points, DatasetCore, PointIter, TargetGrid, TileIter};
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, Inf, Inheritance, OgrOptions, Result};

/// Layer names probed for elevation data when none is configured.
const KNOWN_LAYER_NAMES: [&str; 7] = ["SOUNDG", "Elevation", "elev", "z", "height", "depth", "topography"];

/// OGR vector dataset: features decomposed into their coordinate lists.
pub struct OgrDataset {
    core: DatasetCore,
    opts: OgrOptions,
}

impl OgrDataset {
    pub fn new(path: impl Into<PathBuf>, opts: OgrOptions, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        OgrDataset {
            core: DatasetCore::new(path, formats::OGR, inherited, options),
            opts,
        }
    }

    pub fn from_entry(path: PathBuf, entry: &DatalistEntry, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        let mut opts = OgrOptions::default();
        for (key, value) in &entry.format_options {
            match key.as_str() {
                "ogr_layer" | "layer" => opts.layer = Some(value.clone()),
                "elev_field" => opts.elev_field = Some(value.clone()),
                "weight_field" => opts.weight_field = Some(value.clone()),
                "uncertainty_field" => opts.uncertainty_field = Some(value.clone()),
                other => log::warn!("ignoring unknown ogr option {other}"),
            }
        }

        Ok(OgrDataset::new(path, opts, inherited, options))
    }

    fn open_vector(&self) -> Result<gdal::Dataset> {
        let options = gdal::DatasetOptions {
            open_flags: gdal::GdalOpenFlags::GDAL_OF_READONLY | gdal::GdalOpenFlags::GDAL_OF_VECTOR,
            ..Default::default()
        };
        Ok(gdal::Dataset::open_ex(&self.core.path, options)?)
    }

    /// Collect the points of the configured (or probed) elevation layer.
    /// Vector features are few compared to their coordinates, the decomposed
    /// list is gathered eagerly.
    fn collect_points(&self, filtered: bool) -> Result<Vec<XyzPoint>> {
        let ds = self.open_vector()?;

        let (layer_name, mut layer) = match &self.opts.layer {
            Some(name) => match name.parse::<usize>() {
                Ok(index) => (
                    None,
                    ds.layers()
                        .nth(index)
                        .ok_or_else(|| crate::Error::InvalidArgument(format!("no layer {index} in {}", self.core.path.to_string_lossy())))?,
                ),
                Err(_) => (Some(name.clone()), ds.layer_by_name(name)?),
            },
            None => {
                let mut found = None;
                for name in KNOWN_LAYER_NAMES {
                    if let Ok(layer) = ds.layer_by_name(name) {
                        found = Some((Some(name.to_string()), layer));
                        break;
                    }
                }
                match found {
                    Some(found) => found,
                    None => (
                        None,
                        ds.layers()
                            .next()
                            .ok_or_else(|| crate::Error::InvalidArgument(format!("no layers in {}", self.core.path.to_string_lossy())))?,
                    ),
                }
            }
        };

        // soundings and depth layers store positive-down values
        let negate = layer_name
            .as_deref()
            .is_some_and(|name| matches!(name.to_lowercase().as_str(), "soundg" | "depth"));

        if filtered {
            if let Some(region) = &self.core.options.region {
                if !self.core.options.invert_region {
                    let filter_region = self.core.source_region()?.unwrap_or_else(|| region.clone());
                    let geometry = Geometry::from_wkt(&filter_region.export_as_wkt())?;
                    layer.set_spatial_filter(&geometry);
                }
            }
        }

        let transformer = if filtered { self.core.transformer()? } else { None };
        let mut points = Vec::new();

        for feature in layer.features() {
            let weight = field_value(&feature, self.opts.weight_field.as_deref()).unwrap_or(1.0);
            let uncertainty = field_value(&feature, self.opts.uncertainty_field.as_deref()).unwrap_or(0.0);
            let explicit_z = field_value(&feature, self.opts.elev_field.as_deref());

            let Some(geometry) = feature.geometry() else {
                continue;
            };

            let mut coords = Vec::new();
            flatten_geometry(geometry, &mut coords);
            for (x, y, z) in coords {
                let z = explicit_z.unwrap_or(z);
                let z = if negate { -z } else { z };
                let mut point = XyzPoint::with_wu(
                    x,
                    y,
                    z,
                    self.core.weight * weight,
                    (self.core.uncertainty.powi(2) + uncertainty.powi(2)).sqrt(),
                );
                if !point.is_valid() {
                    continue;
                }

                if let Some(transformer) = &transformer {
                    if point.transform(transformer).is_err() {
                        continue;
                    }
                }
                if filtered && !self.core.point_in_region(&point) {
                    continue;
                }
                points.push(point);
            }
        }

        Ok(points)
    }
}

impl Dataset for OgrDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn generate_inf(&mut self) -> Result<Inf> {
        let points = self.collect_points(false)?;

        let mut inf = Inf {
            name: self.core.path.to_string_lossy().to_string(),
            hash: crate::inf::hash_file(&self.core.path).ok(),
            numpts: points.len() as u64,
            format: formats::OGR,
            src_srs: self.core.src_srs.clone(),
            ..Default::default()
        };

        let mut region: Option<Region> = None;
        for point in &points {
            let point_region = Region {
                xmin: point.x,
                xmax: point.x,
                ymin: point.y,
                ymax: point.y,
                zmin: Some(point.z),
                zmax: Some(point.z),
                ..Default::default()
            };
            region = Some(match region {
                Some(current) => current.merge(&point_region),
                None => point_region,
            });
        }
        if let Some(region) = region {
            inf.set_region(&region);
        }
        Ok(inf)
    }

    fn yield_points(&mut self) -> Result<PointIter> {
        Ok(Box::new(self.collect_points(true)?.into_iter()))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        let tile = block_points(self.collect_points(true)?.into_iter(), grid);
        Ok(Box::new(tile.into_iter().map(Ok)))
    }
}

/// Recursively decompose a geometry into its coordinates.
fn flatten_geometry(geometry: &Geometry, out: &mut Vec<(f64, f64, f64)>) {
    let sub_count = geometry.geometry_count();
    if sub_count > 0 {
        for index in 0..sub_count {
            let sub = geometry.get_geometry(index);
            flatten_geometry(&sub, out);
        }
    } else {
        out.extend(geometry.get_point_vec());
    }
}

fn field_value(feature: &gdal::vector::Feature, field: Option<&str>) -> Option<f64> {
    let field = field?;
    match feature.field(field).ok().flatten()? {
        FieldValue::RealValue(v) => Some(v),
        FieldValue::IntegerValue(v) => Some(v as f64),
        FieldValue::Integer64Value(v) => Some(v as f64),
        FieldValue::StringValue(v) => v.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_geojson(path: &std::path::Path, body: &str) {
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn reads_point_features_and_negates_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depth.geojson");
        write_geojson(
            &path,
            r#"{"type":"FeatureCollection","name":"depth","features":[
                {"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[1.0,2.0,10.0]}},
                {"type":"Feature","properties":{},"geometry":{"type":"MultiPoint","coordinates":[[3.0,4.0,20.0],[5.0,6.0,30.0]]}}
            ]}"#,
        );

        let opts = OgrOptions {
            layer: Some("depth".to_string()),
            ..Default::default()
        };
        let mut ds = OgrDataset::new(path, opts, &Inheritance::default(), &DatasetOptions::default());
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].z, -10.0);
        assert_eq!(points[2].z, -30.0);
    }

    #[test]
    fn inf_counts_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("elev.geojson");
        write_geojson(
            &path,
            r#"{"type":"FeatureCollection","name":"elev","features":[
                {"type":"Feature","properties":{},"geometry":{"type":"Point","coordinates":[-10.0,5.0,100.0]}}
            ]}"#,
        );

        let opts = OgrOptions {
            layer: Some("elev".to_string()),
            ..Default::default()
        };
        let mut ds = OgrDataset::new(path, opts, &Inheritance::default(), &DatasetOptions::default());
        let inf = ds.generate_inf().unwrap();
        assert_eq!(inf.numpts, 1);
        let region = inf.region().unwrap();
        assert_eq!((region.xmin, region.ymin), (-10.0, 5.0));
    }
}
