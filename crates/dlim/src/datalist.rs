use std::io::BufRead;
use std::path::{Path, PathBuf};

use geo::{CoordinateTransformer, Region, SpatialRef};
use serde_json::json;

use crate::dataset::{open_dataset, DatasetCore, PointIter, TargetGrid, TileIter};
use crate::{formats, DatalistEntry, Dataset, DatasetOptions, Error, Inf, Inheritance, Metadata, Result};

/// Recursive datalist: a text file of dataset entries, possibly referencing
/// further datalists. Traversal is depth-first, parents before children.
///
/// The first full parse writes a GeoJSON sidecar with one polygon feature
/// per leaf entry; later parses use it to skip entries outside the query
/// region. The sidecar is only trusted while the stored datalist hash
/// matches the file.
pub struct Datalist {
    core: DatasetCore,
}

/// A flattened leaf entry with weights/uncertainty composed relative to the
/// owning datalist and, once known, its extent.
#[derive(Clone, Debug)]
struct LeafEntry {
    entry: DatalistEntry,
    minmax: Option<Vec<f64>>,
    src_srs: Option<String>,
}

impl Datalist {
    pub fn new(path: impl Into<PathBuf>, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        Datalist {
            core: DatasetCore::new(path, formats::DATALIST, inherited, options),
        }
    }

    pub fn from_entry(path: PathBuf, _entry: &DatalistEntry, inherited: &Inheritance, options: &DatasetOptions) -> Result<Self> {
        Ok(Datalist::new(path, inherited, options))
    }

    fn sidecar_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.json", self.core.path.to_string_lossy()))
    }

    /// The inheritance context this datalist passes to its children.
    fn context(&self) -> Inheritance {
        Inheritance {
            weight: self.core.weight,
            uncertainty: self.core.uncertainty,
            metadata: self.core.metadata.clone(),
        }
    }

    /// Parse into leaf datasets, filtered to the request region.
    pub fn parse(&mut self) -> Result<Vec<Box<dyn Dataset>>> {
        let leaves = self.leaf_entries()?;
        let context = self.context();

        let mut datasets = Vec::new();
        for leaf in leaves {
            if !self.leaf_intersects(&leaf)? {
                continue;
            }
            if !self.leaf_passes_wu(&leaf) {
                continue;
            }

            match open_dataset(&leaf.entry, &context, &self.core.options, None) {
                Ok(dataset) => {
                    if dataset.is_valid() || formats::is_fetch(leaf.entry.format.unwrap_or(0)) {
                        datasets.push(dataset);
                    } else {
                        log::warn!("skipping invalid dataset entry {}", leaf.entry.path);
                    }
                }
                Err(err) => log::warn!("skipping unreadable dataset entry {}: {err}", leaf.entry.path),
            }
        }
        Ok(datasets)
    }

    /// Spatial pre-filter against the leaf extent recorded in the sidecar.
    fn leaf_intersects(&self, leaf: &LeafEntry) -> Result<bool> {
        let Some(region) = &self.core.options.region else {
            return Ok(true);
        };
        let Some(minmax) = &leaf.minmax else {
            return Ok(true);
        };
        let Ok(mut leaf_region) = Region::from_list(minmax) else {
            return Ok(true);
        };

        // compare in the target SRS when the leaf SRS is known to differ
        if let (Some(src), Some(dst)) = (&leaf.src_srs, &self.core.options.dst_srs) {
            if src != dst {
                if let (Ok(src), Ok(dst)) = (SpatialRef::from_user_input(src), SpatialRef::from_user_input(dst)) {
                    if let Ok(transformer) = CoordinateTransformer::new(&src, &dst) {
                        if let Ok(warped) = leaf_region.warp(&transformer, None) {
                            leaf_region = warped;
                        }
                    }
                }
            }
        }

        Ok(region.intersects(&leaf_region) != self.core.options.invert_region)
    }

    /// Weight/uncertainty constraints from the request region apply to whole
    /// entries, not per cell.
    fn leaf_passes_wu(&self, leaf: &LeafEntry) -> bool {
        let Some(region) = &self.core.options.region else {
            return true;
        };

        let weight = self.core.weight * leaf.entry.weight.unwrap_or(1.0);
        let uncertainty = (self.core.uncertainty.powi(2) + leaf.entry.uncertainty.unwrap_or(0.0).powi(2)).sqrt();

        region.wmin.is_none_or(|wmin| weight >= wmin)
            && region.wmax.is_none_or(|wmax| weight <= wmax)
            && region.umin.is_none_or(|umin| uncertainty >= umin)
            && region.umax.is_none_or(|umax| uncertainty <= umax)
    }

    /// Leaf entries from the sidecar when valid, otherwise from a full text
    /// parse (which refreshes the sidecar).
    fn leaf_entries(&self) -> Result<Vec<LeafEntry>> {
        if let Some(leaves) = self.read_sidecar()? {
            return Ok(leaves);
        }

        let mut leaves = Vec::new();
        collect_leaf_entries(&self.core.path, &Inheritance::default(), &mut leaves)?;

        // gather extents for the sidecar; failures leave the extent unset
        for leaf in &mut leaves {
            let context = Inheritance::default();
            if let Ok(mut dataset) = open_dataset(&leaf.entry, &context, &unfiltered_options(&self.core.options), None) {
                if dataset.is_valid() {
                    if let Ok(inf) = dataset.inf(false) {
                        leaf.minmax = (!inf.minmax.is_empty()).then(|| inf.minmax.clone());
                        leaf.src_srs = inf.src_srs;
                    }
                }
            }
        }

        if let Err(err) = self.write_sidecar(&leaves) {
            log::debug!("could not write datalist sidecar: {err}");
        }
        Ok(leaves)
    }

    fn read_sidecar(&self) -> Result<Option<Vec<LeafEntry>>> {
        let sidecar = self.sidecar_path();
        if !sidecar.exists() {
            return Ok(None);
        }

        let text = match std::fs::read_to_string(&sidecar) {
            Ok(text) => text,
            Err(_) => return Ok(None),
        };
        let Ok(doc) = serde_json::from_str::<serde_json::Value>(&text) else {
            return Ok(None);
        };

        // the sidecar is consistent with the datalist iff the hashes match
        let current_hash = crate::inf::hash_file(&self.core.path)?;
        if doc.get("hash").and_then(|h| h.as_str()) != Some(current_hash.as_str()) {
            return Ok(None);
        }

        let Some(features) = doc.get("features").and_then(|f| f.as_array()) else {
            return Ok(None);
        };

        let mut leaves = Vec::new();
        for feature in features {
            let Some(properties) = feature.get("properties") else {
                continue;
            };
            let text_field = |key: &str| properties.get(key).and_then(|v| v.as_str()).map(str::to_string);
            let num_field = |key: &str| properties.get(key).and_then(|v| v.as_f64());

            let Some(path) = text_field("path") else {
                continue;
            };

            let mut entry = DatalistEntry {
                path,
                format: properties.get("format").and_then(|v| v.as_i64()).map(|v| v as i32),
                weight: num_field("weight"),
                uncertainty: num_field("uncertainty"),
                ..Default::default()
            };
            if let Some(mod_args) = text_field("mod_args") {
                for option in mod_args.split(':').filter(|o| !o.is_empty()) {
                    if let Some((key, value)) = option.split_once('=') {
                        entry.format_options.push((key.to_string(), value.to_string()));
                    }
                }
            }
            entry.metadata = Metadata {
                name: text_field("name"),
                title: text_field("title"),
                source: text_field("source"),
                date: text_field("date"),
                data_type: text_field("data_type"),
                resolution: text_field("resolution"),
                hdatum: text_field("hdatum"),
                vdatum: text_field("vdatum"),
                url: text_field("url"),
            };

            let minmax = properties
                .get("minmax")
                .and_then(|v| v.as_array())
                .map(|values| values.iter().filter_map(|v| v.as_f64()).collect::<Vec<f64>>());

            leaves.push(LeafEntry {
                entry,
                minmax,
                src_srs: text_field("src_srs"),
            });
        }

        Ok(Some(leaves))
    }

    fn write_sidecar(&self, leaves: &[LeafEntry]) -> Result<()> {
        let features: Vec<serde_json::Value> = leaves
            .iter()
            .map(|leaf| {
                let geometry = leaf
                    .minmax
                    .as_ref()
                    .and_then(|minmax| Region::from_list(minmax).ok())
                    .map(|region| {
                        json!({
                            "type": "Polygon",
                            "coordinates": [[
                                [region.xmin, region.ymin],
                                [region.xmin, region.ymax],
                                [region.xmax, region.ymax],
                                [region.xmax, region.ymin],
                                [region.xmin, region.ymin],
                            ]],
                        })
                    })
                    .unwrap_or(serde_json::Value::Null);

                let mod_args = leaf
                    .entry
                    .format_options
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(":");

                json!({
                    "type": "Feature",
                    "properties": {
                        "path": leaf.entry.path,
                        "format": leaf.entry.format,
                        "mod_args": mod_args,
                        "weight": leaf.entry.weight,
                        "uncertainty": leaf.entry.uncertainty,
                        "name": leaf.entry.metadata.name,
                        "title": leaf.entry.metadata.title,
                        "source": leaf.entry.metadata.source,
                        "date": leaf.entry.metadata.date,
                        "data_type": leaf.entry.metadata.data_type,
                        "resolution": leaf.entry.metadata.resolution,
                        "hdatum": leaf.entry.metadata.hdatum,
                        "vdatum": leaf.entry.metadata.vdatum,
                        "url": leaf.entry.metadata.url,
                        "minmax": leaf.minmax,
                        "src_srs": leaf.src_srs,
                    },
                    "geometry": geometry,
                })
            })
            .collect();

        let doc = json!({
            "type": "FeatureCollection",
            "name": self.core.name(),
            "hash": crate::inf::hash_file(&self.core.path)?,
            "features": features,
        });

        std::fs::write(self.sidecar_path(), serde_json::to_string(&doc)?)?;
        Ok(())
    }
}

impl Dataset for Datalist {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    /// Union of the child infs; the datalist recursion law.
    fn generate_inf(&mut self) -> Result<Inf> {
        let mut inf = Inf {
            name: self.core.path.to_string_lossy().to_string(),
            hash: crate::inf::hash_file(&self.core.path).ok(),
            format: formats::DATALIST,
            ..Default::default()
        };

        let leaves = self.leaf_entries()?;
        let context = Inheritance::default();
        let options = unfiltered_options(&self.core.options);
        for leaf in leaves {
            let Ok(mut dataset) = open_dataset(&leaf.entry, &context, &options, None) else {
                continue;
            };
            if !dataset.is_valid() {
                continue;
            }
            if let Ok(child_inf) = dataset.inf(false) {
                inf.merge(&child_inf);
            }
        }

        if self.core.src_srs.is_none() {
            self.core.src_srs.clone_from(&inf.src_srs);
        }
        Ok(inf)
    }

    fn yield_points(&mut self) -> Result<PointIter> {
        let mut streams: Vec<PointIter> = Vec::new();
        for mut dataset in self.parse()? {
            streams.push(dataset.yield_points()?);
        }
        Ok(Box::new(streams.into_iter().flatten()))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        let mut streams: Vec<TileIter> = Vec::new();
        for mut dataset in self.parse()? {
            streams.push(dataset.yield_tiles(grid)?);
        }
        Ok(Box::new(streams.into_iter().flatten()))
    }
}

/// Options stripped of the spatial request, for inf generation.
fn unfiltered_options(options: &DatasetOptions) -> DatasetOptions {
    DatasetOptions {
        region: None,
        invert_region: false,
        ..options.clone()
    }
}

/// Depth-first recursion over datalist text, composing entry contexts.
/// Nested datalists are flattened; other entries become leaves.
fn collect_leaf_entries(path: &Path, context: &Inheritance, out: &mut Vec<LeafEntry>) -> Result<()> {
    let file = std::fs::File::open(path).map_err(|_| Error::InvalidPath(path.to_path_buf()))?;
    let base_dir = path.parent().map(Path::to_path_buf);

    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let entry = match DatalistEntry::parse(trimmed) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("{}: skipping malformed datalist line: {err}", path.to_string_lossy());
                continue;
            }
        };

        let resolved = match &base_dir {
            Some(base) if PathBuf::from(&entry.path).is_relative() => base.join(&entry.path),
            _ => PathBuf::from(&entry.path),
        };

        let child_context = context.child_context(&entry);
        if entry.format == Some(formats::DATALIST) {
            if let Err(err) = collect_leaf_entries(&resolved, &child_context, out) {
                log::warn!("skipping unreadable datalist {}: {err}", resolved.to_string_lossy());
            }
            continue;
        }

        let mut flattened = entry;
        flattened.path = resolved.to_string_lossy().to_string();
        flattened.weight = Some(child_context.weight);
        flattened.uncertainty = Some(child_context.uncertainty);
        flattened.metadata = child_context.metadata.clone();
        out.push(LeafEntry {
            entry: flattened,
            minmax: None,
            src_srs: None,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::XyzPoint;

    fn write(path: &Path, contents: &str) {
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn recursion_composes_weights() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.xyz"), "0 0 1\n");
        write(&dir.path().join("inner.datalist"), "a.xyz 168 0.5 0\n");
        write(&dir.path().join("outer.datalist"), "inner.datalist -1 2 0\n");

        let mut datalist = Datalist::new(dir.path().join("outer.datalist"), &Inheritance::default(), &DatasetOptions::default());
        let datasets = datalist.parse().unwrap();
        assert_eq!(datasets.len(), 1);
        // scenario: parent weight 2 x entry weight 0.5 -> 1.0
        assert_eq!(datasets[0].core().weight, 1.0);
    }

    #[test]
    fn datalist_inf_is_union_of_children() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.xyz"), "0 0 1\n1 1 2\n");
        write(&dir.path().join("b.xyz"), "10 10 3\n");
        write(&dir.path().join("both.datalist"), "a.xyz 168 1 0\nb.xyz 168 1 0\n");

        let mut datalist = Datalist::new(dir.path().join("both.datalist"), &Inheritance::default(), &DatasetOptions::default());
        let inf = datalist.generate_inf().unwrap();
        assert_eq!(inf.numpts, 3);
        let region = inf.region().unwrap();
        assert_eq!((region.xmin, region.xmax, region.ymin, region.ymax), (0.0, 10.0, 0.0, 10.0));
    }

    #[test]
    fn sidecar_accelerates_and_tracks_hash() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.xyz"), "0 0 1\n");
        write(&dir.path().join("far.xyz"), "100 100 5\n");
        let dl_path = dir.path().join("data.datalist");
        write(&dl_path, "a.xyz 168 1 0\nfar.xyz 168 1 0\n");

        let options = DatasetOptions {
            region: Some(Region::new(-1.0, 1.0, -1.0, 1.0)),
            ..Default::default()
        };

        let mut datalist = Datalist::new(dl_path.clone(), &Inheritance::default(), &options);
        let datasets = datalist.parse().unwrap();
        assert_eq!(datasets.len(), 1, "far.xyz should be filtered out");
        assert!(dl_path.with_file_name("data.datalist.json").exists());

        // appending an entry invalidates the sidecar (hash mismatch) and the
        // next parse sees the new dataset
        write(&dir.path().join("c.xyz"), "0.5 0.5 2\n");
        let mut text = std::fs::read_to_string(&dl_path).unwrap();
        text.push_str("c.xyz 168 1 0\n");
        write(&dl_path, &text);

        let mut datalist = Datalist::new(dl_path, &Inheritance::default(), &options);
        let datasets = datalist.parse().unwrap();
        assert_eq!(datasets.len(), 2);
    }

    #[test]
    fn points_flow_through_recursion() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a.xyz"), "0.25 0.25 1\n");
        write(&dir.path().join("b.xyz"), "0.75 0.75 2\n");
        write(&dir.path().join("all.datalist"), "a.xyz 168 1 0\nb.xyz 168 1 0\n");

        let mut datalist = Datalist::new(dir.path().join("all.datalist"), &Inheritance::default(), &DatasetOptions::default());
        let points: Vec<XyzPoint> = datalist.yield_points().unwrap().collect();
        assert_eq!(points.len(), 2);
    }
}
