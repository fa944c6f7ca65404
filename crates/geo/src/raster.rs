//! Raster access on top of GDAL: open/create/read/write plus the grid
//! algorithms the DEM pipeline needs (warping, proximity, terrain
//! derivatives, polygonize).

pub mod algo;
mod io;
mod warp;

pub use io::{
    convert, create_in_memory, driver_for_path, extension_for_driver, guess_driver_name, write_bands, write_to_disk, RasterIo,
    RasterMeta,
};
pub use warp::{sample_warp, sample_warp_to_file, ResampleAlg};
