//! Dataset handling for DEM generation: the datalist format, the polymorphic
//! dataset variants that feed the stacker, and the inf sidecar cache.

pub type Result<T = ()> = std::result::Result<T, Error>;

mod bag;
mod datalist;
mod dataset;
mod entry;
pub mod fetch;
mod inf;
mod las;
mod mbs;
mod memory;
mod ogr;
mod options;
mod raster;
mod xyz;
mod zip_list;

use thiserror::Error;

#[doc(inline)]
pub use {
    bag::BagDataset,
    datalist::Datalist,
    dataset::{block_points, open_dataset, Dataset, DatasetCore, PointIter, TargetGrid, Tile, TileArrays, TileIter},
    entry::{guess_format, DatalistEntry, Inheritance, Metadata},
    fetch::{FetchDataset, FetchModule},
    inf::{hash_file, Inf},
    las::LasDataset,
    mbs::MbsDataset,
    memory::MemDataset,
    ogr::OgrDataset,
    options::{BagOptions, BandSource, DatasetOptions, GdalOptions, LasOptions, OgrOptions, VrStrategy, XyzOptions},
    raster::GdalDataset,
    xyz::XyzDataset,
    zip_list::ZipDataset,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Geo(#[from] geo::Error),
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
    #[error("LAS error: {0}")]
    Las(#[from] las::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid path: {}", .0.to_string_lossy())]
    InvalidPath(std::path::PathBuf),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("External tool failed: {0}")]
    ExternalTool(String),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Datalist format keys, matching the datalist text format.
pub mod formats {
    pub const DATALIST: i32 = -1;
    pub const ZIP: i32 = -2;
    pub const MEMORY: i32 = -3;
    pub const XYZ: i32 = 168;
    pub const GDAL: i32 = 200;
    pub const BAG: i32 = 201;
    pub const LAS: i32 = 300;
    pub const MBS: i32 = 301;
    pub const OGR: i32 = 302;

    /// Fetch module ids occupy -100..=-304.
    pub fn is_fetch(format: i32) -> bool {
        (-304..=-100).contains(&format)
    }

    /// Recursive container formats expand into child datasets.
    pub fn is_container(format: i32) -> bool {
        format < 0
    }
}
