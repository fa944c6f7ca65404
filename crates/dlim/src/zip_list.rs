use std::io::Read;
use std::path::PathBuf;

use crate::dataset::{open_dataset, DatasetCore, PointIter, TargetGrid, TileIter};
use crate::entry::{basename, guess_format};
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, Inf, Inheritance, Result};

/// Zip container dataset (format -2): members with a recognized extension
/// are extracted into the cache directory and parsed by extension.
pub struct ZipDataset {
    core: DatasetCore,
}

impl ZipDataset {
    pub fn new(path: impl Into<PathBuf>, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        ZipDataset {
            core: DatasetCore::new(path, formats::ZIP, inherited, options),
        }
    }

    pub fn from_entry(path: PathBuf, _entry: &DatalistEntry, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        Ok(ZipDataset::new(path, inherited, options))
    }

    /// Extract supported members and open them as datasets.
    pub fn expand(&mut self) -> Result<Vec<Box<dyn Dataset>>> {
        let file = std::fs::File::open(&self.core.path)?;
        let mut archive = zip::ZipArchive::new(file)?;

        let extract_dir = self
            .core
            .options
            .cache_dir
            .join(basename(&self.core.path.to_string_lossy()));
        std::fs::create_dir_all(&extract_dir)?;

        let context = Inheritance {
            weight: self.core.weight,
            uncertainty: self.core.uncertainty,
            metadata: self.core.metadata.clone(),
        };

        let mut datasets: Vec<Box<dyn Dataset>> = Vec::new();
        for index in 0..archive.len() {
            let mut member = archive.by_index(index)?;
            if !member.is_file() {
                continue;
            }

            let Some(member_path) = member.enclosed_name() else {
                continue;
            };
            let member_name = member_path.to_string_lossy().to_string();
            if guess_format(&member_name).is_none() {
                continue;
            }

            let file_name = member_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| member_name.clone());
            let out_path = extract_dir.join(&file_name);
            if !out_path.exists() {
                let mut contents = Vec::new();
                member.read_to_end(&mut contents)?;
                std::fs::write(&out_path, contents)?;
            }

            let entry = DatalistEntry {
                path: out_path.to_string_lossy().to_string(),
                format: guess_format(&member_name),
                ..Default::default()
            };
            match open_dataset(&entry, &context, &self.core.options, None) {
                Ok(dataset) => datasets.push(dataset),
                Err(err) => log::warn!("skipping zip member {member_name}: {err}"),
            }
        }

        Ok(datasets)
    }
}

impl Dataset for ZipDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn generate_inf(&mut self) -> Result<Inf> {
        let mut inf = Inf {
            name: self.core.path.to_string_lossy().to_string(),
            hash: crate::inf::hash_file(&self.core.path).ok(),
            format: formats::ZIP,
            ..Default::default()
        };
        for mut dataset in self.expand()? {
            if let Ok(child) = dataset.inf(false) {
                inf.merge(&child);
            }
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
    use std::io::Write;

    #[test]
    fn expands_xyz_members() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bundle.zip");

        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("points.xyz", options).unwrap();
        writer.write_all(b"0 0 1\n1 1 2\n").unwrap();
        writer.start_file("README.md", options).unwrap();
        writer.write_all(b"not data\n").unwrap();
        writer.finish().unwrap();

        let dataset_options = DatasetOptions {
            cache_dir: dir.path().join("cache"),
            ..Default::default()
        };
        let mut ds = ZipDataset::new(zip_path, &Inheritance::default(), &dataset_options);
        let datasets = ds.expand().unwrap();
        assert_eq!(datasets.len(), 1);

        let inf = ds.generate_inf().unwrap();
        assert_eq!(inf.numpts, 2);
    }
}
