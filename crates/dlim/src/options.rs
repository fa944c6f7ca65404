use std::path::PathBuf;

use geo::raster::ResampleAlg;
use geo::Region;

/// Options threaded through dataset construction. One struct instead of the
/// original's free-form keyword soup; variant-specific knobs live in their
/// own substructs below.
#[derive(Clone, Debug)]
pub struct DatasetOptions {
    /// Restrict output to this region (in the target SRS).
    pub region: Option<Region>,
    /// Keep points outside the region instead of inside.
    pub invert_region: bool,
    pub x_inc: Option<f64>,
    pub y_inc: Option<f64>,
    /// Target SRS every dataset transforms into.
    pub dst_srs: Option<String>,
    /// Source SRS override; normally taken from the source itself.
    pub src_srs: Option<String>,
    pub sample_alg: ResampleAlg,
    pub cache_dir: PathBuf,
    pub want_weight: bool,
    pub want_uncertainty: bool,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        DatasetOptions {
            region: None,
            invert_region: false,
            x_inc: None,
            y_inc: None,
            dst_srs: None,
            src_srs: None,
            sample_alg: ResampleAlg::Auto,
            cache_dir: std::env::temp_dir().join("cudem"),
            want_weight: true,
            want_uncertainty: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct XyzOptions {
    /// Explicit delimiter; auto-detected from {whitespace, ',', '/', ':'} when unset.
    pub delimiter: Option<char>,
    pub xpos: usize,
    pub ypos: usize,
    pub zpos: usize,
    pub wpos: Option<usize>,
    pub upos: Option<usize>,
    /// Header lines to skip.
    pub skip: usize,
    pub x_scale: f64,
    pub y_scale: f64,
    pub z_scale: f64,
    pub x_offset: f64,
    pub y_offset: f64,
    /// Normalize longitudes into [-180, 180).
    pub wrap_longitude: bool,
}

impl Default for XyzOptions {
    fn default() -> Self {
        XyzOptions {
            delimiter: None,
            xpos: 0,
            ypos: 1,
            zpos: 2,
            wpos: None,
            upos: None,
            skip: 0,
            x_scale: 1.0,
            y_scale: 1.0,
            z_scale: 1.0,
            x_offset: 0.0,
            y_offset: 0.0,
            wrap_longitude: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LasOptions {
    /// Point classifications to keep.
    pub classes: Vec<u8>,
}

impl Default for LasOptions {
    fn default() -> Self {
        LasOptions {
            classes: vec![0, 2, 29, 40],
        }
    }
}

/// Where an auxiliary per-cell value comes from for a raster source.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum BandSource {
    #[default]
    None,
    /// A band of the source raster itself.
    Band(usize),
    /// A separate raster aligned (or warped) to the source.
    File(PathBuf),
    /// A constant for every cell.
    Scalar(f64),
}

#[derive(Clone, Debug, Default)]
pub struct GdalOptions {
    pub band: usize,
    pub mask: BandSource,
    pub weight: BandSource,
    pub uncertainty: BandSource,
    pub open_options: Vec<String>,
    /// Per-entry resampler override; the shared option applies when unset.
    pub sample: Option<ResampleAlg>,
    /// Skip the warp-to-target-grid step and emit tiles on the source grid.
    pub no_resample: bool,
}

impl GdalOptions {
    pub fn elevation_band(&self) -> usize {
        if self.band == 0 { 1 } else { self.band }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BagOptions {
    /// Enumerate supergrids individually instead of opening a resampled view.
    pub explode: bool,
    /// Treat as variable-resolution even without VR metadata.
    pub force_vr: bool,
    /// RES_STRATEGY for the resampled-grid mode.
    pub vr_strategy: VrStrategy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VrStrategy {
    #[default]
    Min,
    Max,
    Auto,
}

impl VrStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VrStrategy::Min => "MIN",
            VrStrategy::Max => "MAX",
            VrStrategy::Auto => "AUTO",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct OgrOptions {
    /// Explicit layer name or index; probed from the known names when unset.
    pub layer: Option<String>,
    pub elev_field: Option<String>,
    pub weight_field: Option<String>,
    pub uncertainty_field: Option<String>,
}
