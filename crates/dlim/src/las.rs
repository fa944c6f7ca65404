use std::path::PathBuf;

use geo::{Region, SpatialRef, XyzPoint};
use las::Reader;

use crate::dataset::{block_points, DatasetCore, PointIter, TargetGrid, Tile, TileIter};
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, Error, Inf, Inheritance, LasOptions, Result};

/// Points per tile-blocking chunk.
const CHUNK_SIZE: usize = 2_000_000;

/// The WKT coordinate system VLR record id from the LAS 1.4 spec.
const WKT_RECORD_ID: u16 = 2112;

/// LAS/LAZ lidar dataset.
pub struct LasDataset {
    core: DatasetCore,
    opts: LasOptions,
}

impl LasDataset {
    pub fn new(path: impl Into<PathBuf>, opts: LasOptions, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        LasDataset {
            core: DatasetCore::new(path, formats::LAS, inherited, options),
            opts,
        }
    }

    pub fn from_entry(path: PathBuf, entry: &DatalistEntry, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        let mut opts = LasOptions::default();
        for (key, value) in &entry.format_options {
            match key.as_str() {
                "classes" => {
                    opts.classes = value
                        .split('/')
                        .map(|c| {
                            c.parse::<u8>()
                                .map_err(|_| Error::Parse(format!("invalid classification: {c}")))
                        })
                        .collect::<Result<_>>()?;
                }
                other => log::warn!("ignoring unknown las option {other}"),
            }
        }

        Ok(LasDataset::new(path, opts, inherited, options))
    }

    /// CRS from the header VLRs: WKT record 2112, resolved to an EPSG code
    /// when the authority is identifiable, proj4 otherwise.
    fn header_srs(&self) -> Result<Option<String>> {
        let reader = Reader::from_path(&self.core.path)?;
        for vlr in reader.header().vlrs() {
            if vlr.record_id != WKT_RECORD_ID {
                continue;
            }

            let wkt = String::from_utf8_lossy(&vlr.data);
            let wkt = wkt.trim_end_matches('\0').trim();
            if wkt.is_empty() {
                continue;
            }

            let Ok(mut srs) = SpatialRef::from_wkt(wkt) else {
                continue;
            };
            if let Some(epsg) = srs.horizontal_epsg() {
                return Ok(Some(format!("epsg:{epsg}")));
            }
            if let Ok(proj4) = srs.to_proj4() {
                return Ok(Some(proj4));
            }
        }
        Ok(None)
    }

    fn resolve_src_srs(&mut self) -> Result<()> {
        if self.core.src_srs.is_none() {
            self.core.src_srs = self.header_srs()?;
        }
        Ok(())
    }

    fn open_stream(&self) -> Result<LasPointStream> {
        let reader = Reader::from_path(&self.core.path)?;
        Ok(LasPointStream {
            reader,
            classes: self.opts.classes.clone(),
            source_region: self.core.source_region()?,
            invert_region: self.core.options.invert_region,
            weight: self.core.weight,
            uncertainty: self.core.uncertainty,
        })
    }
}

impl Dataset for LasDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    /// Header-only scan: bounding box and point count come straight from the
    /// LAS header, no point iteration.
    fn generate_inf(&mut self) -> Result<Inf> {
        self.resolve_src_srs()?;
        let reader = Reader::from_path(&self.core.path)?;
        let header = reader.header();
        let bounds = header.bounds();

        let mut region = Region::new(bounds.min.x, bounds.max.x, bounds.min.y, bounds.max.y);
        region.zmin = Some(bounds.min.z);
        region.zmax = Some(bounds.max.z);

        let mut inf = Inf {
            name: self.core.path.to_string_lossy().to_string(),
            hash: crate::inf::hash_file(&self.core.path).ok(),
            numpts: header.number_of_points(),
            format: formats::LAS,
            src_srs: self.core.src_srs.clone(),
            ..Default::default()
        };
        inf.set_region(&region);
        Ok(inf)
    }

    fn yield_points(&mut self) -> Result<PointIter> {
        self.resolve_src_srs()?;
        let stream = self.open_stream()?;
        let transformer = self.core.transformer()?;

        Ok(Box::new(stream.filter_map(move |mut point| {
            if let Some(transformer) = &transformer {
                if point.transform(transformer).is_err() {
                    return None;
                }
            }
            Some(point)
        })))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        self.resolve_src_srs()?;
        let stream = self.open_stream()?;
        let transformer = self.core.transformer()?;

        Ok(Box::new(LasTileStream {
            stream,
            transformer,
            grid: grid.clone(),
        }))
    }
}

/// Streaming filtered point reader: classification filter plus the request
/// region pre-filter in source coordinates.
struct LasPointStream {
    reader: Reader,
    classes: Vec<u8>,
    source_region: Option<Region>,
    invert_region: bool,
    weight: f64,
    uncertainty: f64,
}

impl Iterator for LasPointStream {
    type Item = XyzPoint;

    fn next(&mut self) -> Option<XyzPoint> {
        loop {
            let point = match self.reader.read_point() {
                Ok(Some(point)) => point,
                Ok(None) => return None,
                Err(_) => return None,
            };

            if !self.classes.is_empty() && !self.classes.contains(&u8::from(point.classification)) {
                continue;
            }

            let out = XyzPoint::with_wu(point.x, point.y, point.z, self.weight, self.uncertainty);
            if let Some(region) = &self.source_region {
                if region.contains_xyz(&out) == self.invert_region {
                    continue;
                }
            }

            return Some(out);
        }
    }
}

/// Chunked tile producer: blocks of up to [`CHUNK_SIZE`] filtered points are
/// gridded onto the target, one tile per chunk.
struct LasTileStream {
    stream: LasPointStream,
    transformer: Option<geo::CoordinateTransformer>,
    grid: TargetGrid,
}

impl Iterator for LasTileStream {
    type Item = Result<Tile>;

    fn next(&mut self) -> Option<Result<Tile>> {
        loop {
            let mut chunk: Vec<XyzPoint> = Vec::new();
            for point in self.stream.by_ref() {
                let mut point = point;
                if let Some(transformer) = &self.transformer {
                    if point.transform(transformer).is_err() {
                        continue;
                    }
                }
                chunk.push(point);
                if chunk.len() >= CHUNK_SIZE {
                    break;
                }
            }

            if chunk.is_empty() {
                return None;
            }

            match block_points(chunk.into_iter(), &self.grid) {
                Some(tile) => return Some(Ok(tile)),
                None => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_las(path: &std::path::Path, points: &[(f64, f64, f64, u8)]) {
        let mut builder = las::Builder::from((1, 2));
        builder.point_format = las::point::Format::new(0).unwrap();
        let header = builder.into_header().unwrap();
        let mut writer = las::Writer::from_path(path, header).unwrap();
        for &(x, y, z, class) in points {
            let point = las::Point {
                x,
                y,
                z,
                classification: las::point::Classification::new(class).unwrap(),
                ..Default::default()
            };
            writer.write_point(point).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn classification_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.las");
        write_las(
            &path,
            &[(0.0, 0.0, 1.0, 0), (1.0, 1.0, 2.0, 1), (2.0, 2.0, 3.0, 2), (3.0, 3.0, 4.0, 3)],
        );

        let opts = LasOptions { classes: vec![2] };
        let mut ds = LasDataset::new(path, opts, &Inheritance::default(), &DatasetOptions::default());
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].z, 3.0);
    }

    #[test]
    fn header_inf_without_point_scan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.las");
        write_las(&path, &[(0.0, 0.0, -5.0, 2), (10.0, 20.0, 5.0, 2)]);

        let mut ds = LasDataset::new(path, LasOptions::default(), &Inheritance::default(), &DatasetOptions::default());
        let inf = ds.generate_inf().unwrap();
        assert_eq!(inf.numpts, 2);
        let region = inf.region().unwrap();
        assert_eq!((region.xmax, region.ymax), (10.0, 20.0));
        assert_eq!(region.zmin, Some(-5.0));
    }

    #[test]
    fn tiles_average_cohabiting_returns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.las");
        write_las(&path, &[(0.25, 0.25, 10.0, 2), (0.3, 0.3, 20.0, 2)]);

        let mut ds = LasDataset::new(path, LasOptions::default(), &Inheritance::default(), &DatasetOptions::default());
        let grid = TargetGrid::new(&Region::new(0.0, 1.0, 0.0, 1.0), 1.0, 1.0).unwrap();
        let tiles: Vec<Tile> = ds.yield_tiles(&grid).unwrap().map(|t| t.unwrap()).collect();
        assert_eq!(tiles.len(), 1);
        let tile = &tiles[0];
        let idx = tile.arrays.z.iter().position(|z| !z.is_nan()).unwrap();
        assert!((tile.arrays.z[idx] - 15.0).abs() < 1e-9);
        assert_eq!(tile.arrays.count[idx], 2.0);
        // std of {10, 20} folded into the uncertainty plane
        assert!((tile.arrays.uncertainty[idx] - 5.0).abs() < 1e-9);
    }
}
