use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid path: {}", .0.to_string_lossy())]
    InvalidPath(PathBuf),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Transform error: {0}")]
    Transform(String),
    #[error("Invalid string: {0}")]
    InvalidString(#[from] std::ffi::NulError),
    #[error("Runtime error: {0}")]
    Runtime(String),
}
