use std::collections::HashMap;
use std::path::{Path, PathBuf};

use geo::raster::RasterMeta;
use geo::{CoordinateTransformer, GeoTransform, GridNode, Region, SpatialRef, Srcwin, XyzPoint};

use crate::entry::basename;
use crate::{formats, DatalistEntry, DatasetOptions, Error, Inf, Inheritance, Metadata, Result};

/// The grid every dataset aligns its output to: region + increments,
/// gridded in the stacker's grid-node registration.
#[derive(Clone, Debug)]
pub struct TargetGrid {
    pub region: Region,
    pub x_inc: f64,
    pub y_inc: f64,
    pub nx: usize,
    pub ny: usize,
    pub gt: GeoTransform,
}

impl TargetGrid {
    pub fn new(region: &Region, x_inc: f64, y_inc: f64) -> Result<Self> {
        let (nx, ny, gt) = region.geo_transform(x_inc, y_inc, GridNode::Grid)?;
        Ok(TargetGrid {
            region: region.clone(),
            x_inc,
            y_inc,
            nx,
            ny,
            gt,
        })
    }

    pub fn meta(&self, projection: String, nodata: Option<f64>) -> RasterMeta {
        RasterMeta::new(self.nx, self.ny, self.gt, projection, nodata)
    }

    /// Cell holding a coordinate, None when outside the grid.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.gt.geo_to_pixel(x, y);
        if col < 0 || row < 0 || col >= self.nx as i64 || row >= self.ny as i64 {
            None
        } else {
            Some((row as usize, col as usize))
        }
    }
}

/// Per-cell planes of one tile. Equal shapes, NaN marks empty cells of `z`.
#[derive(Clone, Debug, Default)]
pub struct TileArrays {
    pub z: Vec<f64>,
    pub count: Vec<f64>,
    pub weight: Vec<f64>,
    pub uncertainty: Vec<f64>,
}

impl TileArrays {
    pub fn filled(cells: usize) -> Self {
        TileArrays {
            z: vec![f64::NAN; cells],
            count: vec![0.0; cells],
            weight: vec![0.0; cells],
            uncertainty: vec![0.0; cells],
        }
    }
}

/// One unit of stacker input: arrays + the window they cover + their grid.
#[derive(Clone, Debug)]
pub struct Tile {
    pub arrays: TileArrays,
    pub srcwin: Srcwin,
    pub gt: GeoTransform,
}

pub type PointIter = Box<dyn Iterator<Item = XyzPoint>>;
pub type TileIter = Box<dyn Iterator<Item = Result<Tile>>>;

/// State shared by every dataset variant: source path, composed
/// weight/uncertainty, metadata, SRS handling and the common options.
#[derive(Clone, Debug)]
pub struct DatasetCore {
    pub path: PathBuf,
    pub format: i32,
    pub weight: f64,
    pub uncertainty: f64,
    pub metadata: Metadata,
    pub src_srs: Option<String>,
    pub options: DatasetOptions,
}

impl DatasetCore {
    pub fn new(path: impl Into<PathBuf>, format: i32, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        let path = path.into();
        let mut metadata = inherited.metadata.clone();
        if metadata.name.is_none() {
            metadata.name = Some(basename(&path.to_string_lossy()));
        }

        DatasetCore {
            path,
            format,
            weight: inherited.weight,
            uncertainty: inherited.uncertainty,
            metadata,
            src_srs: options.src_srs.clone(),
            options: options.clone(),
        }
    }

    pub fn name(&self) -> String {
        self.metadata
            .name
            .clone()
            .unwrap_or_else(|| basename(&self.path.to_string_lossy()))
    }

    /// Non-empty file on disk.
    pub fn is_valid_file(&self) -> bool {
        std::fs::metadata(&self.path).map(|m| m.len() > 0).unwrap_or(false)
    }

    /// Transform from the source SRS into the target SRS, when both are known
    /// and differ.
    pub fn transformer(&self) -> Result<Option<CoordinateTransformer>> {
        let (Some(src), Some(dst)) = (&self.src_srs, &self.options.dst_srs) else {
            return Ok(None);
        };
        if src == dst {
            return Ok(None);
        }

        let src = SpatialRef::from_user_input(src)?;
        let dst = SpatialRef::from_user_input(dst)?;
        Ok(Some(CoordinateTransformer::new(&src, &dst)?))
    }

    /// The request region expressed in the source SRS, for source-side
    /// pre-filtering. Identical to the request region without a transform.
    pub fn source_region(&self) -> Result<Option<Region>> {
        let Some(region) = &self.options.region else {
            return Ok(None);
        };
        let (Some(src), Some(dst)) = (&self.src_srs, &self.options.dst_srs) else {
            return Ok(Some(region.clone()));
        };
        if src == dst {
            return Ok(Some(region.clone()));
        }

        let back = CoordinateTransformer::new(&SpatialRef::from_user_input(dst)?, &SpatialRef::from_user_input(src)?)?;
        Ok(Some(region.warp(&back, Some(src))?))
    }

    /// Region test in target space, honoring invert_region.
    pub fn point_in_region(&self, point: &XyzPoint) -> bool {
        match &self.options.region {
            Some(region) => region.contains_xyz(point) != self.options.invert_region,
            None => true,
        }
    }
}

/// A source of elevation observations. Produces either a point stream or
/// grid-aligned tiles; both are finite and consume the underlying source.
pub trait Dataset {
    fn core(&self) -> &DatasetCore;

    /// Scan the source once and summarize extent/count/hash/SRS.
    fn generate_inf(&mut self) -> Result<Inf>;

    fn yield_points(&mut self) -> Result<PointIter>;

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter>;

    fn is_valid(&self) -> bool {
        self.core().is_valid_file()
    }

    /// Cached inf: read the sidecar, falling back to [`Dataset::generate_inf`].
    fn inf(&mut self, check_hash: bool) -> Result<Inf> {
        let path = self.core().path.clone();
        if !path.exists() {
            // in-memory and remote sources always generate
            return self.generate_inf();
        }
        crate::inf::load_or_generate(&path, check_hash, || self.generate_inf())
    }

    /// Child datasets for recursive containers, leaf-first flattening.
    /// Leaf datasets return themselves only through the stacker paths.
    fn is_container(&self) -> bool {
        formats::is_container(self.core().format)
    }
}

/// Block a point stream onto the target grid.
///
/// Accumulates per-cell count, weighted z, weight sum and uncertainty, then
/// emits one tile over the occupied window: z is the weighted mean, weight
/// the per-cell weight sum, uncertainty the weighted rms uncertainty folded
/// with the sub-cell spread in quadrature.
pub fn block_points(points: impl Iterator<Item = XyzPoint>, grid: &TargetGrid) -> Option<Tile> {
    #[derive(Default)]
    struct Acc {
        n: f64,
        w: f64,
        wz: f64,
        wzz: f64,
        wu: f64,
    }

    let mut cells: HashMap<(usize, usize), Acc> = HashMap::new();
    for point in points {
        let Some((row, col)) = grid.cell_of(point.x, point.y) else {
            continue;
        };
        let acc = cells.entry((row, col)).or_default();
        let w = if point.w > 0.0 { point.w } else { 1.0 };
        acc.n += 1.0;
        acc.w += w;
        acc.wz += w * point.z;
        acc.wzz += w * point.z * point.z;
        acc.wu += w * point.u;
    }

    if cells.is_empty() {
        return None;
    }

    let min_row = cells.keys().map(|(row, _)| *row).min().unwrap();
    let max_row = cells.keys().map(|(row, _)| *row).max().unwrap();
    let min_col = cells.keys().map(|(_, col)| *col).min().unwrap();
    let max_col = cells.keys().map(|(_, col)| *col).max().unwrap();

    let srcwin = Srcwin::new(
        min_col as i64,
        min_row as i64,
        max_col - min_col + 1,
        max_row - min_row + 1,
    );
    let mut arrays = TileArrays::filled(srcwin.cell_count());

    for ((row, col), acc) in cells {
        let idx = (row - min_row) * srcwin.xsize + (col - min_col);
        let z_mean = acc.wz / acc.w;
        let variance = (acc.wzz / acc.w - z_mean * z_mean).max(0.0);
        let u_mean = acc.wu / acc.w;

        arrays.z[idx] = z_mean;
        arrays.count[idx] = acc.n;
        arrays.weight[idx] = acc.w;
        arrays.uncertainty[idx] = (u_mean * u_mean + variance).sqrt();
    }

    Some(Tile {
        arrays,
        srcwin,
        gt: grid.gt.for_srcwin(srcwin.xoff, srcwin.yoff),
    })
}

/// Map a datalist entry to its dataset implementation.
///
/// `base_dir` anchors relative paths (the directory of the parent datalist).
pub fn open_dataset(
    entry: &DatalistEntry,
    inherited: &Inheritance,
    options: &DatasetOptions,
    base_dir: Option<&Path>,
) -> Result<Box<dyn Dataset>> {
    let format = entry
        .format
        .ok_or_else(|| Error::Parse(format!("could not determine the format of entry: {}", entry.path)))?;

    let context = inherited.child_context(entry);
    let path = resolve_path(&entry.path, base_dir);

    Ok(match format {
        formats::XYZ => Box::new(crate::XyzDataset::from_entry(path, entry, &context, options)?),
        formats::GDAL => Box::new(crate::GdalDataset::from_entry(path, entry, &context, options)?),
        formats::BAG => Box::new(crate::BagDataset::from_entry(path, entry, &context, options)?),
        formats::LAS => Box::new(crate::LasDataset::from_entry(path, entry, &context, options)?),
        formats::MBS => Box::new(crate::MbsDataset::from_entry(path, entry, &context, options)?),
        formats::OGR => Box::new(crate::OgrDataset::from_entry(path, entry, &context, options)?),
        formats::DATALIST => Box::new(crate::Datalist::from_entry(path, entry, &context, options)?),
        formats::ZIP => Box::new(crate::ZipDataset::from_entry(path, entry, &context, options)?),
        formats::MEMORY => Box::new(crate::MemDataset::empty(&context, options)),
        id if formats::is_fetch(id) => Box::new(crate::FetchDataset::from_entry(entry, id, &context, options)?),
        id => return Err(Error::Parse(format!("unknown dataset format id: {id}"))),
    })
}

fn resolve_path(path: &str, base_dir: Option<&Path>) -> PathBuf {
    let path_buf = PathBuf::from(path);
    match base_dir {
        Some(base) if path_buf.is_relative() => base.join(path_buf),
        _ => path_buf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_grid() -> TargetGrid {
        TargetGrid::new(&Region::new(0.0, 1.0, 0.0, 1.0), 1.0, 1.0).unwrap()
    }

    #[test]
    fn blocking_positions_each_lattice_point() {
        let grid = unit_grid();
        assert_eq!((grid.nx, grid.ny), (2, 2));

        let points = vec![
            XyzPoint::new(0.0, 0.0, 1.0),
            XyzPoint::new(1.0, 0.0, 2.0),
            XyzPoint::new(0.0, 1.0, 3.0),
            XyzPoint::new(1.0, 1.0, 4.0),
        ];
        let tile = block_points(points.into_iter(), &grid).unwrap();
        assert_eq!(tile.srcwin, Srcwin::new(0, 0, 2, 2));

        // row 0 is the ymax row
        assert_eq!(tile.arrays.z, vec![3.0, 4.0, 1.0, 2.0]);
        assert_eq!(tile.arrays.count, vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(tile.arrays.weight, vec![1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn blocking_merges_cohabiting_points() {
        let grid = unit_grid();
        let points = vec![
            XyzPoint::with_wu(0.0, 0.0, 10.0, 1.0, 0.0),
            XyzPoint::with_wu(0.0, 0.0, 20.0, 3.0, 0.0),
        ];
        let tile = block_points(points.into_iter(), &grid).unwrap();
        assert_eq!(tile.srcwin.cell_count(), 1);
        assert_eq!(tile.arrays.count[0], 2.0);
        assert_eq!(tile.arrays.weight[0], 4.0);
        assert!((tile.arrays.z[0] - 17.5).abs() < 1e-12);
        // sub-cell spread carried as uncertainty
        assert!(tile.arrays.uncertainty[0] > 0.0);
    }

    #[test]
    fn out_of_grid_points_are_dropped() {
        let grid = unit_grid();
        let points = vec![XyzPoint::new(50.0, 50.0, 1.0)];
        assert!(block_points(points.into_iter(), &grid).is_none());
    }
}
