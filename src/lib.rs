//! CUDEM: Digital Elevation Model generation from heterogeneous elevation
//! sources.
//!
//! The workspace splits into three crates, re-exported here:
//!
//! - [`geo`]: regions, geotransforms, points, spatial references and
//!   GDAL-backed raster I/O.
//! - [`dlim`]: the datalist format and the polymorphic dataset variants
//!   that yield points or grid-aligned tiles.
//! - [`waffles`]: the stacker, interpolators, filters, coastline synthesis,
//!   interpolation-uncertainty estimation and DEM finalization.

pub use dlim;
pub use geo;
pub use waffles;

pub use dlim::{Datalist, Dataset, DatasetOptions, Inheritance, TargetGrid};
pub use geo::{Region, XyzPoint};
pub use waffles::{StackMode, Stacker, Waffle, WaffleModule};
