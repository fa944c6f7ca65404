pub type Result<T = ()> = std::result::Result<T, Error>;

mod error;
pub mod gdalinterop;
mod geotransform;
mod point;
pub mod raster;
mod region;
mod session;
pub mod srs;

#[doc(inline)]
pub use {
    error::Error, geotransform::GeoTransform, point::XyzPoint, region::chunk_windows, region::parse_regions,
    region::GridNode, region::Region, region::Srcwin, session::Session, srs::CoordinateTransformer, srs::SpatialRef,
};
