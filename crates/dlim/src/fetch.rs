//! Remote sources as datasets. The network side is an external collaborator:
//! a [`FetchModule`] is only required to turn a region into local files,
//! which are then parsed like any other source.

use std::path::{Path, PathBuf};

use geo::Region;

use crate::dataset::{open_dataset, DatasetCore, PointIter, TargetGrid, TileIter};
use crate::entry::guess_format;
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, Error, Inf, Inheritance, Result};

/// The fetch hook: given a region, deliver local files into `outdir`.
/// Retry/timeout policy belongs to the implementation.
pub trait FetchModule: Send {
    fn name(&self) -> &str;

    fn fetch(&self, region: &Region, outdir: &Path) -> Result<Vec<PathBuf>>;
}

/// Fetch module ids from the datalist format table.
pub fn module_name(format: i32) -> Option<&'static str> {
    Some(match format {
        -100 => "gmrt",
        -101 => "gebco",
        -102 => "copernicus",
        -103 => "fabdem",
        -104 => "nasadem",
        -105 => "mar_grav",
        -106 => "srtm_plus",
        -200 => "charts",
        -201 => "multibeam",
        -202 => "nos",
        -203 => "ehydro",
        -204 => "bluetopo",
        -205 => "ngs",
        -206 => "tides",
        -207 => "digital_coast",
        -208 => "ncei_thredds",
        -209 => "tnm",
        -300 => "emodnet",
        -301 => "chs",
        -302 => "hrdem",
        -303 => "arcticdem",
        -304 => "vdatum",
        _ => return None,
    })
}

/// A fetch module backed by a directory of already-downloaded files.
/// The stand-in used in tests and offline runs.
pub struct DirectoryFetch {
    name: String,
    dir: PathBuf,
}

impl DirectoryFetch {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        DirectoryFetch {
            name: name.into(),
            dir: dir.into(),
        }
    }
}

impl FetchModule for DirectoryFetch {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, _region: &Region, _outdir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for dir_entry in std::fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.is_file() && guess_format(&path.to_string_lossy()).is_some() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

/// Remote dataset (format ids -100..-304). Without an installed module the
/// dataset is inert; hosts plug their fetchers in with
/// [`FetchDataset::with_module`].
pub struct FetchDataset {
    core: DatasetCore,
    module: Option<Box<dyn FetchModule>>,
}

impl FetchDataset {
    pub fn from_entry(entry: &DatalistEntry, format: i32, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        if module_name(format).is_none() {
            return Err(Error::Parse(format!("unknown fetch module id: {format}")));
        }

        let mut core = DatasetCore::new(&entry.path, format, inherited, options);
        if core.metadata.name.is_none() {
            core.metadata.name = module_name(format).map(str::to_string);
        }
        Ok(FetchDataset { core, module: None })
    }

    pub fn with_module(mut self, module: Box<dyn FetchModule>) -> Self {
        self.module = Some(module);
        self
    }

    /// Fetch into the cache dir and open each delivered file by extension.
    pub fn expand(&mut self) -> Result<Vec<Box<dyn Dataset>>> {
        let module = self
            .module
            .as_ref()
            .ok_or_else(|| Error::Runtime(format!("no fetch module installed for {}", self.core.name())))?;

        let region = self
            .core
            .options
            .region
            .clone()
            .ok_or_else(|| Error::InvalidArgument("fetch datasets require a region".to_string()))?;

        let outdir = self.core.options.cache_dir.join(module.name());
        std::fs::create_dir_all(&outdir)?;
        let files = module.fetch(&region, &outdir)?;

        let context = Inheritance {
            weight: self.core.weight,
            uncertainty: self.core.uncertainty,
            metadata: self.core.metadata.clone(),
        };

        let mut datasets: Vec<Box<dyn Dataset>> = Vec::new();
        for file in files {
            let name = file.to_string_lossy().to_string();
            let Some(format) = guess_format(&name) else {
                log::warn!("fetched file with unrecognized format: {name}");
                continue;
            };
            let entry = DatalistEntry {
                path: name,
                format: Some(format),
                ..Default::default()
            };
            datasets.push(open_dataset(&entry, &context, &self.core.options, None)?);
        }
        Ok(datasets)
    }
}

impl Dataset for FetchDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn is_valid(&self) -> bool {
        // remote sources have no local file to probe
        true
    }

    fn generate_inf(&mut self) -> Result<Inf> {
        let mut inf = Inf {
            name: self.core.name(),
            format: self.core.format,
            ..Default::default()
        };
        if let Some(region) = &self.core.options.region {
            inf.set_region(region);
        }
        Ok(inf)
    }

    fn yield_points(&mut self) -> Result<PointIter> {
        let mut streams: Vec<PointIter> = Vec::new();
        for mut dataset in self.expand()? {
            streams.push(dataset.yield_points()?);
        }
        Ok(Box::new(streams.into_iter().flatten()))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        let mut streams: Vec<TileIter> = Vec::new();
        for mut dataset in self.expand()? {
            streams.push(dataset.yield_tiles(grid)?);
        }
        Ok(Box::new(streams.into_iter().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::XyzPoint;

    #[test]
    fn directory_module_feeds_fetch_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("store");
        std::fs::create_dir_all(&store).unwrap();
        std::fs::write(store.join("tile.xyz"), "0.5 0.5 7\n").unwrap();

        let options = DatasetOptions {
            region: Some(Region::new(0.0, 1.0, 0.0, 1.0)),
            cache_dir: dir.path().join("cache"),
            ..Default::default()
        };
        let entry = DatalistEntry {
            path: "gmrt".to_string(),
            format: Some(-100),
            ..Default::default()
        };

        let mut ds = FetchDataset::from_entry(&entry, -100, &Inheritance::default(), &options)
            .unwrap()
            .with_module(Box::new(DirectoryFetch::new("gmrt", store)));

        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].z, 7.0);
    }

    #[test]
    fn missing_module_is_an_error() {
        let options = DatasetOptions {
            region: Some(Region::new(0.0, 1.0, 0.0, 1.0)),
            ..Default::default()
        };
        let entry = DatalistEntry {
            path: "gebco".to_string(),
            format: Some(-101),
            ..Default::default()
        };
        let mut ds = FetchDataset::from_entry(&entry, -101, &Inheritance::default(), &options).unwrap();
        assert!(ds.yield_points().is_err());
    }
}
