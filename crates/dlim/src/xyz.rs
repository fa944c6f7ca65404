use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;

use geo::{CoordinateTransformer, Region, XyzPoint};

use crate::dataset::{block_points, DatasetCore, PointIter, TargetGrid, TileIter};
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, Error, Inf, Inheritance, Result, XyzOptions};

/// Delimiters tried, in order, when none is configured. Whitespace first.
const KNOWN_DELIMS: [char; 3] = [',', '/', ':'];

/// ASCII XYZ stream dataset.
pub struct XyzDataset {
    core: DatasetCore,
    opts: XyzOptions,
}

impl XyzDataset {
    pub fn new(path: impl Into<PathBuf>, opts: XyzOptions, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        XyzDataset {
            core: DatasetCore::new(path, formats::XYZ, inherited, options),
            opts,
        }
    }

    pub fn from_entry(path: PathBuf, entry: &DatalistEntry, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        let mut opts = XyzOptions::default();
        for (key, value) in &entry.format_options {
            match key.as_str() {
                "delim" => opts.delimiter = value.chars().next(),
                "xpos" => opts.xpos = parse_usize(key, value)?,
                "ypos" => opts.ypos = parse_usize(key, value)?,
                "zpos" => opts.zpos = parse_usize(key, value)?,
                "wpos" => opts.wpos = Some(parse_usize(key, value)?),
                "upos" => opts.upos = Some(parse_usize(key, value)?),
                "skip" => opts.skip = parse_usize(key, value)?,
                "x_scale" => opts.x_scale = parse_f64(key, value)?,
                "y_scale" => opts.y_scale = parse_f64(key, value)?,
                "z_scale" => opts.z_scale = parse_f64(key, value)?,
                "x_offset" if value == "REM" => opts.wrap_longitude = true,
                "x_offset" => opts.x_offset = parse_f64(key, value)?,
                "y_offset" => opts.y_offset = parse_f64(key, value)?,
                other => log::warn!("ignoring unknown xyz option {other}"),
            }
        }

        Ok(XyzDataset::new(path, opts, inherited, options))
    }

    fn open_stream(&self, filtered: bool) -> Result<XyzPointStream> {
        let file = File::open(&self.core.path).map_err(|_| Error::InvalidPath(self.core.path.clone()))?;
        let transformer = if filtered { self.core.transformer()? } else { None };

        Ok(XyzPointStream {
            lines: BufReader::new(file).lines(),
            opts: self.opts.clone(),
            weight: self.core.weight,
            uncertainty: self.core.uncertainty,
            region: if filtered { self.core.options.region.clone() } else { None },
            invert_region: self.core.options.invert_region,
            transformer,
            to_skip: self.opts.skip,
            delimiter: self.opts.delimiter,
            source: self.core.path.to_string_lossy().to_string(),
            parsed: 0,
            malformed: 0,
        })
    }
}

impl Dataset for XyzDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn generate_inf(&mut self) -> Result<Inf> {
        let mut inf = Inf {
            name: self.core.path.to_string_lossy().to_string(),
            hash: crate::inf::hash_file(&self.core.path).ok(),
            format: formats::XYZ,
            src_srs: self.core.src_srs.clone(),
            ..Default::default()
        };

        let mut region: Option<Region> = None;
        for point in self.open_stream(false)? {
            inf.numpts += 1;
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
        Ok(Box::new(self.open_stream(true)?))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        let tile = block_points(self.yield_points()?, grid);
        Ok(Box::new(tile.into_iter().map(Ok)))
    }
}

/// Streaming parser over an XYZ text source. Malformed records are counted
/// and skipped, a single bad line never aborts the stream.
struct XyzPointStream {
    lines: Lines<BufReader<File>>,
    opts: XyzOptions,
    weight: f64,
    uncertainty: f64,
    region: Option<Region>,
    invert_region: bool,
    transformer: Option<CoordinateTransformer>,
    to_skip: usize,
    delimiter: Option<char>,
    source: String,
    parsed: u64,
    malformed: u64,
}

impl XyzPointStream {
    fn parse_line(&mut self, line: &str) -> Option<XyzPoint> {
        let fields = split_fields(line, &mut self.delimiter)?;
        let field = |pos: usize| fields.get(pos).and_then(|f| f.parse::<f64>().ok());

        let x = field(self.opts.xpos)?;
        let y = field(self.opts.ypos)?;
        let z = field(self.opts.zpos)?;
        let w = self.opts.wpos.and_then(field).unwrap_or(1.0);
        let u = self.opts.upos.and_then(field).unwrap_or(0.0);

        let mut point = XyzPoint::with_wu(
            (x + self.opts.x_offset) * self.opts.x_scale,
            (y + self.opts.y_offset) * self.opts.y_scale,
            z * self.opts.z_scale,
            self.weight * w,
            (self.uncertainty.powi(2) + u.powi(2)).sqrt(),
        );

        if self.opts.wrap_longitude {
            point.x = (point.x + 180.0).rem_euclid(360.0) - 180.0;
        }

        point.is_valid().then_some(point)
    }
}

impl Iterator for XyzPointStream {
    type Item = XyzPoint;

    fn next(&mut self) -> Option<XyzPoint> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(_) => return None,
            };
            if self.to_skip > 0 {
                self.to_skip -= 1;
                continue;
            }
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(mut point) = self.parse_line(&line) else {
                self.malformed += 1;
                continue;
            };

            if let Some(transformer) = &self.transformer {
                if point.transform(transformer).is_err() {
                    self.malformed += 1;
                    continue;
                }
            }

            if let Some(region) = &self.region {
                if region.contains_xyz(&point) == self.invert_region {
                    continue;
                }
            }

            self.parsed += 1;
            return Some(point);
        }
    }
}

impl Drop for XyzPointStream {
    fn drop(&mut self) {
        if self.malformed > 0 {
            log::warn!("{}: skipped {} malformed records", self.source, self.malformed);
        }
        log::debug!("{}: parsed {} records", self.source, self.parsed);
    }
}

/// Split a line on the configured delimiter, detecting one on first use:
/// the first candidate yielding at least two columns wins.
fn split_fields(line: &str, delimiter: &mut Option<char>) -> Option<Vec<String>> {
    if let Some(delim) = delimiter {
        let fields: Vec<String> = line.split(*delim).map(|f| f.trim().to_string()).collect();
        return (fields.len() >= 2).then_some(fields);
    }

    let whitespace: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if whitespace.len() >= 2 {
        return Some(whitespace);
    }

    for candidate in KNOWN_DELIMS {
        let fields: Vec<String> = line.split(candidate).map(|f| f.trim().to_string()).collect();
        if fields.len() >= 2 {
            *delimiter = Some(candidate);
            return Some(fields);
        }
    }
    None
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| Error::Parse(format!("invalid value for {key}: {value}")))
}

fn parse_f64(key: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| Error::Parse(format!("invalid value for {key}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metadata;

    fn write_dataset(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.xyz");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn plain_options(region: Option<Region>) -> DatasetOptions {
        DatasetOptions {
            region,
            ..Default::default()
        }
    }

    #[test]
    fn parses_whitespace_delimited() {
        let (_dir, path) = write_dataset("0 0 1\n1 0 2\n0 1 3\n1 1 4\n");
        let mut ds = XyzDataset::new(path, XyzOptions::default(), &Inheritance::default(), &plain_options(None));
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points.len(), 4);
        assert_eq!(points[3].z, 4.0);
    }

    #[test]
    fn detects_comma_delimiter_and_skips_header() {
        let (_dir, path) = write_dataset("lon,lat,depth\n1.0,2.0,-10.5\nbad line\n3.0,4.0,-20.0\n");
        let opts = XyzOptions {
            skip: 1,
            ..Default::default()
        };
        let mut ds = XyzDataset::new(path, opts, &Inheritance::default(), &plain_options(None));
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].z, -10.5);
    }

    #[test]
    fn composes_weight_and_uncertainty() {
        let (_dir, path) = write_dataset("0 0 5 2 3\n");
        let opts = XyzOptions {
            wpos: Some(3),
            upos: Some(4),
            ..Default::default()
        };
        let inherited = Inheritance {
            weight: 0.5,
            uncertainty: 4.0,
            metadata: Metadata::default(),
        };
        let mut ds = XyzDataset::new(path, opts, &inherited, &plain_options(None));
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points[0].w, 1.0);
        assert_eq!(points[0].u, 5.0);
    }

    #[test]
    fn region_filter_and_inf() {
        let (_dir, path) = write_dataset("0.5 0.5 1\n5 5 2\n");
        let region = Region::new(0.0, 1.0, 0.0, 1.0);
        let mut ds = XyzDataset::new(
            path.clone(),
            XyzOptions::default(),
            &Inheritance::default(),
            &plain_options(Some(region)),
        );
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points.len(), 1);

        // inf scans everything regardless of the region
        let inf = ds.generate_inf().unwrap();
        assert_eq!(inf.numpts, 2);
        let inf_region = inf.region().unwrap();
        assert_eq!((inf_region.xmax, inf_region.ymax), (5.0, 5.0));
        assert!(inf.hash.is_some());
    }

    #[test]
    fn longitude_wrap() {
        let (_dir, path) = write_dataset("270 10 1\n");
        let opts = XyzOptions {
            wrap_longitude: true,
            ..Default::default()
        };
        let mut ds = XyzDataset::new(path, opts, &Inheritance::default(), &plain_options(None));
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points[0].x, -90.0);
    }
}
