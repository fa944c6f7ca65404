use std::path::PathBuf;
use std::process::Command;

use geo::raster::{algo, RasterMeta};
use geo::{GeoTransform, Region, XyzPoint};

use crate::dataset::{DatasetCore, PointIter, TargetGrid, TileIter};
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, Error, GdalDataset, GdalOptions, Inf, Inheritance, Result};

/// MB-System multibeam dataset.
///
/// Extent summaries come from the native `.inf` files; gridding is delegated
/// to `mbgrid` and the result re-parsed as a raster dataset, point dumps go
/// through `mblist`.
pub struct MbsDataset {
    core: DatasetCore,
    mb_exclude: String,
}

impl MbsDataset {
    pub fn new(path: impl Into<PathBuf>, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        MbsDataset {
            core: DatasetCore::new(path, formats::MBS, inherited, options),
            mb_exclude: "A".to_string(),
        }
    }

    pub fn from_entry(path: PathBuf, entry: &DatalistEntry, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        let mut ds = MbsDataset::new(path, inherited, options);
        for (key, value) in &entry.format_options {
            match key.as_str() {
                "mb_exclude" => ds.mb_exclude = value.clone(),
                other => log::warn!("ignoring unknown mbs option {other}"),
            }
        }
        Ok(ds)
    }

    /// Grid the multibeam file onto the request grid with mbgrid and wrap the
    /// result as a raster dataset.
    fn grid_to_raster(&self, grid: &TargetGrid) -> Result<GdalDataset> {
        let cache = &self.core.options.cache_dir;
        std::fs::create_dir_all(cache)?;

        let datalist = cache.join("_mb_grid_tmp.datalist");
        std::fs::write(&datalist, format!("{}\n", self.core.path.to_string_lossy()))?;

        let out_base = cache.join(crate::entry::basename(&self.core.path.to_string_lossy()));
        let gridded_region = grid
            .region
            .buffer(Some(2.0), None, None, Some(grid.x_inc), Some(grid.y_inc));

        let status = Command::new("mbgrid")
            .arg(format!("-I{}", datalist.to_string_lossy()))
            .arg(format!(
                "-R{}/{}/{}/{}",
                gridded_region.xmin, gridded_region.xmax, gridded_region.ymin, gridded_region.ymax
            ))
            .arg(format!("-E{}/{}/degrees!", grid.x_inc, grid.y_inc))
            .arg(format!("-O{}", out_base.to_string_lossy()))
            .args(["-A2", "-F1", "-C10/1", "-S0", "-T35"])
            .output()
            .map_err(|err| Error::ExternalTool(format!("mbgrid: {err}")))?;

        if !status.status.success() {
            return Err(Error::ExternalTool(format!(
                "mbgrid on {} exited with {}",
                self.core.path.to_string_lossy(),
                status.status
            )));
        }

        let grd = PathBuf::from(format!("{}.grd", out_base.to_string_lossy()));
        let inherited = Inheritance {
            weight: self.core.weight,
            uncertainty: self.core.uncertainty,
            metadata: self.core.metadata.clone(),
        };
        Ok(GdalDataset::new(grd, GdalOptions::default(), &inherited, &self.core.options))
    }
}

impl Dataset for MbsDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn generate_inf(&mut self) -> Result<Inf> {
        let sidecar = crate::inf::sidecar_path(&self.core.path);
        if !sidecar.exists() {
            // ask MB-System to produce the native inf
            let _ = Command::new("mbdatalist")
                .args(["-O", "-V"])
                .arg(format!("-I{}", self.core.path.to_string_lossy()))
                .output();
        }

        let text = std::fs::read_to_string(&sidecar).map_err(|_| Error::InvalidPath(sidecar.clone()))?;
        let mut inf = parse_mbsystem_inf_text(&text)?;
        inf.format = formats::MBS;
        inf.src_srs = self.core.src_srs.clone();
        Ok(inf)
    }

    fn yield_points(&mut self) -> Result<PointIter> {
        let output = Command::new("mblist")
            .arg(format!("-M{}", self.mb_exclude))
            .arg("-OXYZ")
            .arg(format!("-I{}", self.core.path.to_string_lossy()))
            .output()
            .map_err(|err| Error::ExternalTool(format!("mblist: {err}")))?;

        if !output.status.success() {
            return Err(Error::ExternalTool(format!(
                "mblist on {} exited with {}",
                self.core.path.to_string_lossy(),
                output.status
            )));
        }

        let weight = self.core.weight;
        let uncertainty = self.core.uncertainty;
        let region = self.core.options.region.clone();
        let invert = self.core.options.invert_region;

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        let points: Vec<XyzPoint> = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split('\t');
                let x = fields.next()?.trim().parse::<f64>().ok()?;
                let y = fields.next()?.trim().parse::<f64>().ok()?;
                let z = fields.next()?.trim().parse::<f64>().ok()?;
                let point = XyzPoint::with_wu(x, y, z, weight, uncertainty);
                match &region {
                    Some(region) if region.contains_xyz(&point) == invert => None,
                    _ => Some(point),
                }
            })
            .collect();

        Ok(Box::new(points.into_iter()))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        let mut raster = self.grid_to_raster(grid)?;
        raster.yield_tiles(grid)
    }
}

/// Parse the MB-System text `.inf` format into an [`Inf`] summary.
///
/// Longitude/latitude/depth extents and the record count come from the
/// labeled lines; the CM coverage mask, when present, is polygonized into a
/// WKT multipolygon describing the actual data footprint.
pub fn parse_mbsystem_inf_text(text: &str) -> Result<Inf> {
    let mut inf = Inf::default();
    let mut minmax = [0.0f64; 6];
    let mut dims: Option<(usize, usize)> = None;
    let mut cm_rows: Vec<Vec<f64>> = Vec::new();
    let mut saw_extent = false;

    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }

        match (fields[0], fields[1]) {
            ("Swath", "Data") if fields.len() > 3 && fields[2] == "File:" => {
                inf.name = fields[3].to_string();
            }
            ("Number", "of") if fields.len() > 3 && fields[2] == "Records:" => {
                inf.numpts = fields[3].parse().unwrap_or(0);
            }
            ("Minimum", "Longitude:") if fields.len() > 5 => {
                minmax[0] = parse_field(fields[2])?;
                minmax[1] = parse_field(fields[5])?;
                saw_extent = true;
            }
            ("Minimum", "Latitude:") if fields.len() > 5 => {
                minmax[2] = parse_field(fields[2])?;
                minmax[3] = parse_field(fields[5])?;
            }
            ("Minimum", "Depth:") if fields.len() > 5 => {
                // depths are positive down
                minmax[4] = -parse_field(fields[5])?;
                minmax[5] = -parse_field(fields[2])?;
            }
            ("CM", "dimensions:") if fields.len() > 3 => {
                dims = Some((parse_field(fields[2])? as usize, parse_field(fields[3])? as usize));
            }
            ("CM:", _) => {
                let row: Vec<f64> = fields[1..].iter().filter_map(|f| f.parse::<f64>().ok()).collect();
                cm_rows.push(row);
            }
            _ => {}
        }
    }

    if !saw_extent {
        return Err(Error::Parse("not an MB-System inf file".to_string()));
    }

    let region = Region::from_list(&minmax)?;
    inf.minmax = minmax.to_vec();
    inf.wkt = Some(region.export_as_wkt());

    // coverage mask -> data footprint multipolygon
    if let Some((ncols, nrows)) = dims {
        if ncols > 0 && nrows > 0 && cm_rows.len() == nrows {
            let x_inc = region.width() / ncols as f64;
            let y_inc = region.height() / nrows as f64;
            let gt = GeoTransform::north_up(region.xmin, region.ymax, x_inc, y_inc);
            let meta = RasterMeta::new(ncols, nrows, gt, String::new(), Some(0.0));

            let mut plane = vec![0.0f64; ncols * nrows];
            for (row, values) in cm_rows.iter().enumerate() {
                for (col, value) in values.iter().take(ncols).enumerate() {
                    plane[row * ncols + col] = if *value > 0.0 { 1.0 } else { 0.0 };
                }
            }

            if let Ok(polygons) = algo::polygonize(&meta, &plane) {
                let shells: Vec<String> = polygons
                    .iter()
                    .filter(|p| p.value != 0)
                    .filter_map(|p| p.wkt.strip_prefix("POLYGON ").map(|body| body.trim().to_string()))
                    .collect();
                if !shells.is_empty() {
                    inf.wkt = Some(format!("MULTIPOLYGON ({})", shells.join(",")));
                }
            }
        }
    }

    Ok(inf)
}

fn parse_field(field: &str) -> Result<f64> {
    field
        .parse::<f64>()
        .map_err(|_| Error::Parse(format!("invalid numeric field in mbs inf: {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_INF: &str = "\
Swath Data File:      survey_0042.fbt
Number of Records:          10234

Minimum Longitude:     -70.2500   Maximum Longitude:     -70.1250
Minimum Latitude:       41.5000   Maximum Latitude:       41.6250
Minimum Depth:          12.5000   Maximum Depth:         145.0000

CM dimensions: 4 4
CM:  0 1 1 0
CM:  1 1 1 1
CM:  1 1 1 1
CM:  0 1 1 0
";

    #[test]
    fn parses_extents_and_count() {
        let inf = parse_mbsystem_inf_text(SAMPLE_INF).unwrap();
        assert_eq!(inf.numpts, 10234);
        assert_eq!(inf.name, "survey_0042.fbt");
        let region = inf.region().unwrap();
        assert_eq!((region.xmin, region.xmax), (-70.25, -70.125));
        // depths flip sign into elevations
        assert_eq!(region.zmin, Some(-145.0));
        assert_eq!(region.zmax, Some(-12.5));
    }

    #[test]
    fn coverage_mask_becomes_multipolygon() {
        let inf = parse_mbsystem_inf_text(SAMPLE_INF).unwrap();
        let wkt = inf.wkt.unwrap();
        assert!(wkt.starts_with("MULTIPOLYGON"), "got {wkt}");
    }
}
