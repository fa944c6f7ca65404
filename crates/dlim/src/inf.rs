use std::io::Read;
use std::path::{Path, PathBuf};

use geo::Region;
use serde::{Deserialize, Serialize};

use crate::{mbs, Result};

/// Per-source summary sidecar: extent, point count, content hash, SRS.
/// Stored as JSON beside the source file.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Inf {
    pub name: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub numpts: u64,
    #[serde(default)]
    pub format: i32,
    /// [xmin, xmax, ymin, ymax, zmin, zmax]; z entries may be NaN when unknown.
    #[serde(default)]
    pub minmax: Vec<f64>,
    #[serde(default)]
    pub wkt: Option<String>,
    #[serde(default)]
    pub src_srs: Option<String>,
}

impl Inf {
    pub fn region(&self) -> Option<Region> {
        if self.minmax.len() >= 4 {
            Region::from_list(&self.minmax).ok()
        } else {
            None
        }
    }

    /// Union this summary with a child's (recursive containers).
    pub fn merge(&mut self, other: &Inf) {
        self.numpts += other.numpts;
        match (self.region(), other.region()) {
            (Some(mine), Some(theirs)) => {
                let merged = mine.merge(&theirs);
                self.minmax = merged.export_as_list(true);
                self.wkt = Some(merged.export_as_wkt());
            }
            (None, Some(theirs)) => {
                self.minmax = theirs.export_as_list(true);
                self.wkt = Some(theirs.export_as_wkt());
            }
            _ => {}
        }
        if self.src_srs.is_none() {
            self.src_srs.clone_from(&other.src_srs);
        }
    }

    pub fn set_region(&mut self, region: &Region) {
        self.minmax = region.export_as_list(true);
        self.wkt = Some(region.export_as_wkt());
    }
}

/// md5 of a file's contents, streamed.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 65536];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

pub fn sidecar_path(source: &Path) -> PathBuf {
    PathBuf::from(format!("{}.inf", source.to_string_lossy()))
}

/// Parse an existing sidecar: JSON first, then the MB-System text format.
fn parse_sidecar(sidecar: &Path) -> Option<Inf> {
    let text = std::fs::read_to_string(sidecar).ok()?;
    if let Ok(inf) = serde_json::from_str::<Inf>(&text) {
        return Some(inf);
    }
    match mbs::parse_mbsystem_inf_text(&text) {
        Ok(inf) => Some(inf),
        Err(err) => {
            log::warn!("failed to parse inf {}: {err}", sidecar.to_string_lossy());
            None
        }
    }
}

/// Load the inf for a source, regenerating when the sidecar is missing,
/// incomplete, or (with `check_hash`) stale. Writes are best-effort.
pub fn load_or_generate(source: &Path, check_hash: bool, generate: impl FnOnce() -> Result<Inf>) -> Result<Inf> {
    let sidecar = sidecar_path(source);
    let existing = if sidecar.exists() { parse_sidecar(&sidecar) } else { None };

    let regenerate = match &existing {
        None => true,
        Some(inf) => {
            if check_hash {
                match hash_file(source) {
                    Ok(current) => inf.hash.as_deref() != Some(current.as_str()),
                    Err(_) => true,
                }
            } else {
                // an mbs-parsed inf has no hash and is accepted as-is
                inf.hash.is_none() && inf.wkt.is_none()
            }
        }
    };

    if !regenerate {
        return Ok(existing.unwrap());
    }

    let inf = generate()?;
    if let Ok(json) = serde_json::to_string(&inf) {
        if let Err(err) = std::fs::write(&sidecar, json) {
            log::debug!("could not write inf sidecar {}: {err}", sidecar.to_string_lossy());
        }
    }
    Ok(inf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regeneration_is_noop_when_hash_matches() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("pts.xyz");
        std::fs::write(&source, "0 0 1\n1 1 2\n").unwrap();

        let hash = hash_file(&source).unwrap();
        let make_inf = |numpts| Inf {
            name: "pts.xyz".to_string(),
            hash: Some(hash.clone()),
            numpts,
            format: 168,
            minmax: vec![0.0, 1.0, 0.0, 1.0, 1.0, 2.0],
            wkt: Some(Region::new(0.0, 1.0, 0.0, 1.0).export_as_wkt()),
            src_srs: None,
        };

        let first = load_or_generate(&source, true, || Ok(make_inf(2))).unwrap();
        // generator returning different numbers must not run when the hash matches
        let second = load_or_generate(&source, true, || Ok(make_inf(99))).unwrap();
        assert_eq!(first.numpts, second.numpts);
        assert_eq!(first.minmax, second.minmax);
    }

    #[test]
    fn hash_mismatch_triggers_regeneration() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("pts.xyz");
        std::fs::write(&source, "0 0 1\n").unwrap();

        let stale = Inf {
            name: "pts.xyz".to_string(),
            hash: Some("0".repeat(32)),
            numpts: 1,
            format: 168,
            minmax: vec![0.0, 0.0, 0.0, 0.0],
            wkt: Some("POLYGON EMPTY".to_string()),
            src_srs: None,
        };
        std::fs::write(sidecar_path(&source), serde_json::to_string(&stale).unwrap()).unwrap();

        let fresh = load_or_generate(&source, true, || {
            Ok(Inf {
                numpts: 42,
                ..stale.clone()
            })
        })
        .unwrap();
        assert_eq!(fresh.numpts, 42);
    }

    #[test]
    fn merge_unions_extents() {
        let mut a = Inf {
            numpts: 10,
            minmax: vec![0.0, 1.0, 0.0, 1.0, -5.0, 5.0],
            ..Default::default()
        };
        let b = Inf {
            numpts: 5,
            minmax: vec![2.0, 3.0, -1.0, 0.5, -2.0, 9.0],
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.numpts, 15);
        let region = a.region().unwrap();
        assert_eq!((region.xmin, region.xmax, region.ymin, region.ymax), (0.0, 3.0, -1.0, 1.0));
    }
}
