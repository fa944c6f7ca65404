use std::fmt::Debug;

use approx::{AbsDiffEq, RelativeEq};

use crate::{Error, Result};

/// Affine transform between pixel space and georeferenced space.
///
/// The coefficients are in GDAL order: [origin x, pixel width, row rotation,
/// origin y, column rotation, pixel height]. Pixel height is negative for
/// north-up rasters.
#[derive(Clone, Copy, PartialEq, Default)]
pub struct GeoTransform([f64; 6]);

impl GeoTransform {
    pub const fn new(coefficients: [f64; 6]) -> Self {
        GeoTransform(coefficients)
    }

    pub const fn north_up(origin_x: f64, origin_y: f64, x_inc: f64, y_inc: f64) -> Self {
        GeoTransform([origin_x, x_inc, 0.0, origin_y, 0.0, -y_inc])
    }

    /// Translates a pixel to the georeferenced coordinate of its top-left corner.
    /// Pixel (0, 0) is the top left corner of the raster.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.0[0] + self.0[1] * col + self.0[2] * row;
        let y = self.0[3] + self.0[4] * col + self.0[5] * row;
        (x, y)
    }

    /// The georeferenced coordinate of the center of the given pixel.
    pub fn pixel_center(&self, col: i64, row: i64) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Translates a georeferenced coordinate to the pixel containing it.
    /// The result may lie outside the raster, callers clip against the size.
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (i64, i64) {
        let col = (x - self.0[0]) / self.0[1];
        let row = (y - self.0[3]) / self.0[5];
        (col.floor() as i64, row.floor() as i64)
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    /// The horizontal cell size
    pub fn cell_size_x(&self) -> f64 {
        self.0[1]
    }

    /// The vertical cell size, negative when north is up
    pub fn cell_size_y(&self) -> f64 {
        self.0[5]
    }

    pub fn coefficients(&self) -> [f64; 6] {
        self.0
    }

    pub fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0 && self.0[5] < 0.0
    }

    /// Geotransform of a sub-window of this raster.
    pub fn for_srcwin(&self, xoff: i64, yoff: i64) -> GeoTransform {
        let (ox, oy) = self.apply(xoff as f64, yoff as f64);
        GeoTransform([ox, self.0[1], self.0[2], oy, self.0[4], self.0[5]])
    }

    pub fn invert(&self) -> Result<Self> {
        let gt_in = &self.0;
        let mut gt_out = [0.0; 6];

        if gt_in[2] == 0.0 && gt_in[4] == 0.0 && gt_in[1] != 0.0 && gt_in[5] != 0.0 {
            // Special case: no rotation, to avoid computing determinate and potential precision issues.
            gt_out[0] = -gt_in[0] / gt_in[1];
            gt_out[1] = 1.0 / gt_in[1];
            gt_out[3] = -gt_in[3] / gt_in[5];
            gt_out[5] = 1.0 / gt_in[5];
            return Ok(gt_out.into());
        }

        // Assume a 3rd row that is [1 0 0] and compute the determinate.
        let det = gt_in[1] * gt_in[5] - gt_in[2] * gt_in[4];
        let magnitude = f64::max(f64::max(gt_in[1].abs(), gt_in[2].abs()), f64::max(gt_in[4].abs(), gt_in[5].abs()));

        if det.abs() <= 1e-10 * magnitude * magnitude {
            return Err(Error::Runtime(
                "GeoTransform::invert: Determinate is too small, cannot compute inverse.".to_string(),
            ));
        }

        let inv_det = 1.0 / det;

        gt_out[1] = gt_in[5] * inv_det;
        gt_out[4] = -gt_in[4] * inv_det;

        gt_out[2] = -gt_in[2] * inv_det;
        gt_out[5] = gt_in[1] * inv_det;

        gt_out[0] = (gt_in[2] * gt_in[3] - gt_in[0] * gt_in[5]) * inv_det;
        gt_out[3] = (-gt_in[1] * gt_in[3] + gt_in[0] * gt_in[4]) * inv_det;

        Ok(gt_out.into())
    }
}

impl From<[f64; 6]> for GeoTransform {
    fn from(coefficients: [f64; 6]) -> Self {
        GeoTransform(coefficients)
    }
}

impl From<GeoTransform> for [f64; 6] {
    fn from(geo_trans: GeoTransform) -> [f64; 6] {
        geo_trans.0
    }
}

impl Debug for GeoTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GeoTransform(origin: ({}, {}), pixel_width: {}, pixel_height: {})",
            self.0[0],
            self.0[3],
            self.cell_size_x(),
            self.cell_size_y()
        )
    }
}

impl AbsDiffEq for GeoTransform {
    type Epsilon = f64;

    fn default_epsilon() -> Self::Epsilon {
        f64::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: Self::Epsilon) -> bool {
        self.0.abs_diff_eq(&other.0, epsilon)
    }
}

impl RelativeEq for GeoTransform {
    fn default_max_relative() -> Self::Epsilon {
        f64::default_max_relative()
    }

    fn relative_eq(&self, other: &Self, epsilon: Self::Epsilon, max_relative: Self::Epsilon) -> bool {
        self.0.relative_eq(&other.0, epsilon, max_relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pixel_geo_round_trip() {
        let gt = GeoTransform::north_up(-120.0, 48.0, 1.0 / 3600.0, 1.0 / 3600.0);
        for (col, row) in [(0, 0), (17, 3), (511, 1023)] {
            let (x, y) = gt.pixel_center(col, row);
            assert_eq!(gt.geo_to_pixel(x, y), (col, row));
        }
    }

    #[test]
    fn invert_round_trip() {
        let gt = GeoTransform::north_up(25000.0, 180000.0, 50.0, 50.0);
        let inv = gt.invert().unwrap();
        let (x, y) = gt.apply(12.0, 34.0);
        let (col, row) = inv.apply(x, y);
        assert_relative_eq!(col, 12.0, epsilon = 1e-9);
        assert_relative_eq!(row, 34.0, epsilon = 1e-9);
    }
}
