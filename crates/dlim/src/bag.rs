use std::path::PathBuf;

use gdal::Metadata as _;

use crate::dataset::{DatasetCore, PointIter, TargetGrid, TileIter};
use crate::options::{BagOptions, BandSource, VrStrategy};
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, GdalDataset, GdalOptions, Inf, Inheritance, Result};

/// BAG bathymetry dataset. Plain BAGs behave like rasters with the
/// uncertainty in band 2; variable-resolution BAGs are either opened through
/// GDAL's resampled-grid view or exploded into their supergrids.
pub struct BagDataset {
    core: DatasetCore,
    opts: BagOptions,
}

impl BagDataset {
    pub fn new(path: impl Into<PathBuf>, opts: BagOptions, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        BagDataset {
            core: DatasetCore::new(path, formats::BAG, inherited, options),
            opts,
        }
    }

    pub fn from_entry(path: PathBuf, entry: &DatalistEntry, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        let mut opts = BagOptions::default();
        for (key, value) in &entry.format_options {
            match key.as_str() {
                "explode" => opts.explode = value == "true" || value == "yes",
                "force_vr" => opts.force_vr = value == "true" || value == "yes",
                "vr_strategy" => {
                    opts.vr_strategy = match value.to_uppercase().as_str() {
                        "MIN" => VrStrategy::Min,
                        "MAX" => VrStrategy::Max,
                        _ => VrStrategy::Auto,
                    }
                }
                other => log::warn!("ignoring unknown bag option {other}"),
            }
        }

        Ok(BagDataset::new(path, opts, inherited, options))
    }

    /// Variable-resolution detection from the BAG driver metadata keys.
    fn is_variable_resolution(&self) -> Result<bool> {
        if self.opts.force_vr {
            return Ok(true);
        }

        let ds = gdal::Dataset::open(&self.core.path)?;
        let has_supergrids = ds.metadata_item("HAS_SUPERGRIDS", "").is_some_and(|v| v == "TRUE");
        let has_max_res =
            ds.metadata_item("MAX_RESOLUTION_X", "").is_some() || ds.metadata_item("MAX_RESOLUTION_Y", "").is_some();
        Ok(has_supergrids || has_max_res)
    }

    /// Supergrid subdataset names from the LIST_SUPERGRIDS view.
    fn supergrid_names(&self) -> Result<Vec<String>> {
        let options = gdal::DatasetOptions {
            open_flags: gdal::GdalOpenFlags::GDAL_OF_READONLY | gdal::GdalOpenFlags::GDAL_OF_RASTER,
            open_options: Some(&["MODE=LIST_SUPERGRIDS"]),
            ..Default::default()
        };
        let ds = gdal::Dataset::open_ex(&self.core.path, options)?;

        let mut names = Vec::new();
        if let Some(items) = ds.metadata_domain("SUBDATASETS") {
            for item in items {
                if let Some((key, value)) = item.split_once('=') {
                    if key.ends_with("_NAME") {
                        names.push(value.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    /// The raster views this BAG decomposes into.
    fn views(&self) -> Result<Vec<GdalDataset>> {
        let inherited = Inheritance {
            weight: self.core.weight,
            uncertainty: self.core.uncertainty,
            metadata: self.core.metadata.clone(),
        };

        let make = |path: PathBuf, open_options: Vec<String>| {
            let opts = GdalOptions {
                uncertainty: BandSource::Band(2),
                open_options,
                ..Default::default()
            };
            GdalDataset::new(path, opts, &inherited, &self.core.options).with_core_format(formats::BAG)
        };

        if self.is_variable_resolution()? {
            if self.opts.explode {
                return Ok(self
                    .supergrid_names()?
                    .into_iter()
                    .map(|name| make(PathBuf::from(name), Vec::new()))
                    .collect());
            }

            return Ok(vec![make(
                self.core.path.clone(),
                vec![
                    "MODE=RESAMPLED_GRID".to_string(),
                    format!("RES_STRATEGY={}", self.opts.vr_strategy.as_str()),
                ],
            )]);
        }

        Ok(vec![make(self.core.path.clone(), Vec::new())])
    }
}

impl Dataset for BagDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn generate_inf(&mut self) -> Result<Inf> {
        let mut views = self.views()?;
        let mut inf = Inf {
            name: self.core.path.to_string_lossy().to_string(),
            hash: crate::inf::hash_file(&self.core.path).ok(),
            format: formats::BAG,
            ..Default::default()
        };

        for view in &mut views {
            inf.merge(&view.generate_inf()?);
        }
        if self.core.src_srs.is_none() {
            self.core.src_srs.clone_from(&inf.src_srs);
        }
        Ok(inf)
    }

    fn yield_points(&mut self) -> Result<PointIter> {
        let mut streams: Vec<PointIter> = Vec::new();
        for mut view in self.views()? {
            streams.push(view.yield_points()?);
        }
        Ok(Box::new(streams.into_iter().flatten()))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        let mut streams: Vec<TileIter> = Vec::new();
        for mut view in self.views()? {
            streams.push(view.yield_tiles(grid)?);
        }
        Ok(Box::new(streams.into_iter().flatten()))
    }
}
