use std::path::Path;

use crate::{formats, Error, Result};

/// The free-text metadata fields a datalist entry may carry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub name: Option<String>,
    pub title: Option<String>,
    pub source: Option<String>,
    pub date: Option<String>,
    pub data_type: Option<String>,
    pub resolution: Option<String>,
    pub hdatum: Option<String>,
    pub vdatum: Option<String>,
    pub url: Option<String>,
}

impl Metadata {
    /// Fill unset fields from a parent record; set fields win.
    pub fn inherit_from(&mut self, parent: &Metadata) {
        fn fill(field: &mut Option<String>, parent: &Option<String>) {
            if field.is_none() {
                field.clone_from(parent);
            }
        }

        fill(&mut self.title, &parent.title);
        fill(&mut self.source, &parent.source);
        fill(&mut self.date, &parent.date);
        fill(&mut self.data_type, &parent.data_type);
        fill(&mut self.resolution, &parent.resolution);
        fill(&mut self.hdatum, &parent.hdatum);
        fill(&mut self.vdatum, &parent.vdatum);
        fill(&mut self.url, &parent.url);
    }

    /// The metadata as (key, value) pairs, for band metadata emission.
    pub fn as_items(&self) -> Vec<(String, String)> {
        [
            ("name", &self.name),
            ("title", &self.title),
            ("source", &self.source),
            ("date", &self.date),
            ("data_type", &self.data_type),
            ("resolution", &self.resolution),
            ("hdatum", &self.hdatum),
            ("vdatum", &self.vdatum),
            ("url", &self.url),
        ]
        .iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }
}

/// One parsed datalist line:
/// `path format[:key=val...] weight uncertainty title source date data_type resolution hdatum vdatum url`
#[derive(Clone, Debug, Default)]
pub struct DatalistEntry {
    pub path: String,
    pub format: Option<i32>,
    pub format_options: Vec<(String, String)>,
    pub weight: Option<f64>,
    pub uncertainty: Option<f64>,
    pub metadata: Metadata,
}

impl DatalistEntry {
    pub fn parse(line: &str) -> Result<Self> {
        let tokens = tokenize(line);
        if tokens.is_empty() {
            return Err(Error::Parse(format!("empty datalist entry: {line:?}")));
        }

        let mut entry = DatalistEntry {
            path: tokens[0].clone(),
            ..Default::default()
        };

        if let Some(format_token) = tokens.get(1) {
            let mut parts = format_token.split(':');
            let id = parts.next().unwrap_or_default();
            entry.format = Some(
                id.parse::<i32>()
                    .map_err(|_| Error::Parse(format!("invalid format id {id:?} in entry: {line:?}")))?,
            );
            for option in parts {
                match option.split_once('=') {
                    Some((key, value)) => entry.format_options.push((key.to_string(), value.to_string())),
                    None => return Err(Error::Parse(format!("malformed module option {option:?} in entry: {line:?}"))),
                }
            }
        } else {
            entry.format = guess_format(&entry.path);
        }

        let parse_num = |token: &String| -> Result<Option<f64>> {
            if token == "-" {
                return Ok(None);
            }
            token
                .parse::<f64>()
                .map(Some)
                .map_err(|_| Error::Parse(format!("invalid numeric field {token:?} in entry: {line:?}")))
        };

        entry.weight = tokens.get(2).map(parse_num).transpose()?.flatten();
        entry.uncertainty = tokens.get(3).map(parse_num).transpose()?.flatten();

        let text = |idx: usize| tokens.get(idx).filter(|t| !t.is_empty() && *t != "-").cloned();
        entry.metadata.title = text(4);
        entry.metadata.source = text(5);
        entry.metadata.date = text(6);
        entry.metadata.data_type = text(7);
        entry.metadata.resolution = text(8);
        entry.metadata.hdatum = text(9);
        entry.metadata.vdatum = text(10);
        entry.metadata.url = text(11);
        entry.metadata.name = Some(basename(&entry.path));

        Ok(entry)
    }

    /// Render the entry back into datalist text form.
    pub fn format_line(&self) -> String {
        let mut format_field = self.format.unwrap_or(formats::XYZ).to_string();
        for (key, value) in &self.format_options {
            format_field.push_str(&format!(":{key}={value}"));
        }

        let mut out = vec![
            self.path.clone(),
            format_field,
            self.weight.map_or_else(|| "1".to_string(), |w| w.to_string()),
            self.uncertainty.map_or_else(|| "0".to_string(), |u| u.to_string()),
        ];
        for field in [
            &self.metadata.title,
            &self.metadata.source,
            &self.metadata.date,
            &self.metadata.data_type,
            &self.metadata.resolution,
            &self.metadata.hdatum,
            &self.metadata.vdatum,
            &self.metadata.url,
        ] {
            if let Some(value) = field {
                if value.contains(char::is_whitespace) {
                    out.push(format!("\"{value}\""));
                } else {
                    out.push(value.clone());
                }
            }
        }
        out.join(" ")
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.format_options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Weight/uncertainty/metadata context flowing down a datalist recursion.
/// Children compose against it, they never reach back into the parent.
#[derive(Clone, Debug)]
pub struct Inheritance {
    pub weight: f64,
    pub uncertainty: f64,
    pub metadata: Metadata,
}

impl Default for Inheritance {
    fn default() -> Self {
        Inheritance {
            weight: 1.0,
            uncertainty: 0.0,
            metadata: Metadata::default(),
        }
    }
}

impl Inheritance {
    /// Context for the children of `entry`: weights multiply, uncertainties
    /// compose in quadrature, metadata fields fill down.
    pub fn child_context(&self, entry: &DatalistEntry) -> Inheritance {
        let entry_weight = entry.weight.unwrap_or(1.0);
        let entry_uncertainty = entry.uncertainty.unwrap_or(0.0);
        let mut metadata = entry.metadata.clone();
        metadata.inherit_from(&self.metadata);

        Inheritance {
            weight: self.weight * entry_weight,
            uncertainty: (self.uncertainty.powi(2) + entry_uncertainty.powi(2)).sqrt(),
            metadata,
        }
    }
}

/// Split a datalist line into tokens, honoring double quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in line.trim().chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Guess a format id from a file extension.
pub fn guess_format(path: &str) -> Option<i32> {
    let ext = Path::new(path).extension()?.to_string_lossy().to_lowercase();
    match ext.as_str() {
        "xyz" | "csv" | "dat" | "ascii" | "txt" => Some(formats::XYZ),
        "tif" | "tiff" | "img" | "grd" | "nc" | "vrt" => Some(formats::GDAL),
        "bag" => Some(formats::BAG),
        "las" | "laz" => Some(formats::LAS),
        "fbt" | "mb" => Some(formats::MBS),
        "000" | "shp" | "geojson" | "gpkg" => Some(formats::OGR),
        "datalist" | "dl" | "mb-1" => Some(formats::DATALIST),
        "zip" => Some(formats::ZIP),
        _ => None,
    }
}

pub fn basename(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_entry() {
        let entry = DatalistEntry::parse("soundings.xyz 168 1 0").unwrap();
        assert_eq!(entry.path, "soundings.xyz");
        assert_eq!(entry.format, Some(168));
        assert_eq!(entry.weight, Some(1.0));
        assert_eq!(entry.uncertainty, Some(0.0));
        assert_eq!(entry.metadata.name.as_deref(), Some("soundings"));
    }

    #[test]
    fn parses_module_options_and_quotes() {
        let entry = DatalistEntry::parse("pts.csv 168:skip=1:delim=, 0.5 0.1 \"NOS Hydro Survey\" NOAA").unwrap();
        assert_eq!(entry.option("skip"), Some("1"));
        assert_eq!(entry.option("delim"), Some(","));
        assert_eq!(entry.metadata.title.as_deref(), Some("NOS Hydro Survey"));
        assert_eq!(entry.metadata.source.as_deref(), Some("NOAA"));
    }

    #[test]
    fn guesses_format_from_extension() {
        assert_eq!(DatalistEntry::parse("dem.tif").unwrap().format, Some(formats::GDAL));
        assert_eq!(DatalistEntry::parse("cloud.laz").unwrap().format, Some(formats::LAS));
        assert_eq!(DatalistEntry::parse("coastal.datalist").unwrap().format, Some(formats::DATALIST));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(DatalistEntry::parse("file.xyz abc").is_err());
        assert!(DatalistEntry::parse("file.xyz 168:skip").is_err());
        assert!(DatalistEntry::parse("file.xyz 168 heavy").is_err());
    }

    #[test]
    fn inheritance_composition() {
        let entry = DatalistEntry::parse("child.xyz 168 0.5 3").unwrap();
        let parent = Inheritance {
            weight: 2.0,
            uncertainty: 4.0,
            metadata: Metadata {
                source: Some("parent-source".to_string()),
                ..Default::default()
            },
        };

        let child = parent.child_context(&entry);
        assert_eq!(child.weight, 1.0);
        assert_eq!(child.uncertainty, 5.0);
        assert_eq!(child.metadata.source.as_deref(), Some("parent-source"));
    }
}
