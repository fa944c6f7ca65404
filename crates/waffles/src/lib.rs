//! DEM generation from stacked elevation data: the stacker, the in-process
//! interpolators, outlier/blur filtering, coastline synthesis, the
//! interpolation-uncertainty engine and DEM finalization.

pub type Result<T = ()> = std::result::Result<T, Error>;

mod blur;
mod coastline;
mod external;
mod idw;
mod outliers;
mod post;
mod stacker;
mod triangulate;
mod uncertainty;
mod waffle;

use thiserror::Error;

#[doc(inline)]
pub use {
    blur::gaussian_blur,
    coastline::{CoastlineBuilder, CoastlineOptions},
    external::{blockmedian, dump_stack_xyz, ExternalGridder, GmtNearNeighbor, GmtSurface, GmtTriangulate, MbGrid},
    idw::{Idw, IdwOptions},
    outliers::{OutlierFilter, OutlierStats},
    post::{ClipSpec, DemFinalizer, FilterSpec, FinalizeOptions},
    stacker::{StackData, StackMask, StackMode, Stacker},
    triangulate::{Triangulated, TriangulationKernel},
    uncertainty::{fit_error_coefficients, InterpolationUncertainty, ProximityFit, UncertaintyOptions},
    waffle::{Waffle, WaffleModule},
};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Geo(#[from] geo::Error),
    #[error(transparent)]
    Dlim(#[from] dlim::Error),
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("External tool failed: {0}")]
    ExternalTool(String),
    #[error("Uncertainty fit did not stabilize: {0}")]
    FitDiverged(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Interpolators fill the unknown cells of a stack, producing a DEM of the
/// stack's shape. Band 1 supplies the known values, band 3 the weights,
/// band 4 the uncertainty.
pub trait Interpolator {
    fn name(&self) -> &'static str;

    fn interpolate(&self, stack: &StackData) -> Result<Vec<f64>>;
}
