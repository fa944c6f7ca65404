use std::fmt;

use crate::{CoordinateTransformer, Error, GeoTransform, Result, XyzPoint};

/// Grid registration for deriving a raster grid from a region.
///
/// `Pixel` treats the region bounds as the outer cell edges, `Grid` registers
/// the cells on the increment lattice itself (one extra row/column, origin
/// shifted outward by half a cell).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GridNode {
    #[default]
    Pixel,
    Grid,
}

/// A pixel window into a raster: offset + size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Srcwin {
    pub xoff: i64,
    pub yoff: i64,
    pub xsize: usize,
    pub ysize: usize,
}

impl Srcwin {
    pub fn new(xoff: i64, yoff: i64, xsize: usize, ysize: usize) -> Self {
        Srcwin { xoff, yoff, xsize, ysize }
    }

    pub fn full(xsize: usize, ysize: usize) -> Self {
        Srcwin {
            xoff: 0,
            yoff: 0,
            xsize,
            ysize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.xsize == 0 || self.ysize == 0
    }

    pub fn cell_count(&self) -> usize {
        self.xsize * self.ysize
    }

    /// Grow the window by `buffer` pixels on each side, clipped to the raster.
    pub fn buffered(&self, buffer: usize, nx: usize, ny: usize) -> Srcwin {
        let xoff = (self.xoff - buffer as i64).max(0);
        let yoff = (self.yoff - buffer as i64).max(0);
        let xend = ((self.xoff + self.xsize as i64) + buffer as i64).min(nx as i64);
        let yend = ((self.yoff + self.ysize as i64) + buffer as i64).min(ny as i64);
        Srcwin {
            xoff,
            yoff,
            xsize: (xend - xoff).max(0) as usize,
            ysize: (yend - yoff).max(0) as usize,
        }
    }
}

/// Moving-window iteration over a raster of `nx` x `ny` pixels.
/// Windows are `chunk` pixels square and advance by `step` pixels, clipped at
/// the raster edge.
pub fn chunk_windows(nx: usize, ny: usize, chunk: usize, step: usize) -> Vec<Srcwin> {
    let chunk = chunk.max(1);
    let step = step.clamp(1, chunk);
    let mut windows = Vec::new();
    let mut yoff = 0usize;
    while yoff < ny {
        let mut xoff = 0usize;
        while xoff < nx {
            windows.push(Srcwin {
                xoff: xoff as i64,
                yoff: yoff as i64,
                xsize: chunk.min(nx - xoff),
                ysize: chunk.min(ny - yoff),
            });
            if xoff + chunk >= nx {
                break;
            }
            xoff += step;
        }
        if yoff + chunk >= ny {
            break;
        }
        yoff += step;
    }
    windows
}

/// A geographic bounding box with optional z/weight/uncertainty constraints
/// and an optional source CRS tag. Value object, copy before mutating.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Region {
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
    pub zmin: Option<f64>,
    pub zmax: Option<f64>,
    pub wmin: Option<f64>,
    pub wmax: Option<f64>,
    pub umin: Option<f64>,
    pub umax: Option<f64>,
    pub src_srs: Option<String>,
}

impl Region {
    pub fn new(xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Self {
        Region {
            xmin,
            xmax,
            ymin,
            ymax,
            ..Default::default()
        }
    }

    /// Region from `[xmin, xmax, ymin, ymax]` or `[xmin, xmax, ymin, ymax, zmin, zmax]`.
    pub fn from_list(values: &[f64]) -> Result<Self> {
        if values.len() < 4 {
            return Err(Error::InvalidArgument(format!(
                "region list needs at least 4 values, got {}",
                values.len()
            )));
        }

        let mut region = Region::new(values[0], values[1], values[2], values[3]);
        if values.len() >= 6 && values[4].is_finite() && values[5].is_finite() {
            region.zmin = Some(values[4]);
            region.zmax = Some(values[5]);
        }
        Ok(region)
    }

    /// The region covered by a raster grid.
    pub fn from_geo_transform(gt: &GeoTransform, nx: usize, ny: usize) -> Self {
        let (xmin, ymax) = gt.apply(0.0, 0.0);
        let (xmax, ymin) = gt.apply(nx as f64, ny as f64);
        Region::new(xmin, xmax, ymin.min(ymax), ymin.max(ymax))
    }

    /// Parse the `xmin/xmax/ymin/ymax[/zmin/zmax[/wmin/wmax/umin/umax]]`
    /// grammar, `-` meaning unset.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens: Vec<Option<f64>> = text
            .split('/')
            .map(|tok| {
                let tok = tok.trim();
                if tok.is_empty() || tok == "-" {
                    Ok(None)
                } else {
                    tok.parse::<f64>()
                        .map(Some)
                        .map_err(|_| Error::Parse(format!("invalid region value: {tok}")))
                }
            })
            .collect::<Result<_>>()?;

        if tokens.len() < 4 {
            return Err(Error::Parse(format!("invalid region string: {text}")));
        }

        let need = |idx: usize| -> Result<f64> {
            tokens[idx].ok_or_else(|| Error::Parse(format!("region xy bounds may not be unset: {text}")))
        };

        let mut region = Region::new(need(0)?, need(1)?, need(2)?, need(3)?);
        let opt = |idx: usize| tokens.get(idx).copied().flatten();
        region.zmin = opt(4);
        region.zmax = opt(5);
        region.wmin = opt(6);
        region.wmax = opt(7);
        region.umin = opt(8);
        region.umax = opt(9);

        if !region.is_valid() {
            return Err(Error::Parse(format!("invalid region: {text}")));
        }
        Ok(region)
    }

    pub fn is_valid(&self) -> bool {
        self.xmin.is_finite() && self.xmax.is_finite() && self.ymin.is_finite() && self.ymax.is_finite() && self.xmin <= self.xmax && self.ymin <= self.ymax
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }

    fn in_range(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
        min.is_none_or(|min| value >= min) && max.is_none_or(|max| value <= max)
    }

    /// Full containment test: position plus the z/w/u constraints.
    pub fn contains_xyz(&self, point: &XyzPoint) -> bool {
        self.contains_point(point.x, point.y)
            && Self::in_range(point.z, self.zmin, self.zmax)
            && Self::in_range(point.w, self.wmin, self.wmax)
            && Self::in_range(point.u, self.umin, self.umax)
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.xmin <= other.xmax && self.xmax >= other.xmin && self.ymin <= other.ymax && self.ymax >= other.ymin
    }

    /// Common area of two regions, `None` when disjoint.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        if !self.intersects(other) {
            return None;
        }

        let mut out = self.clone();
        out.xmin = self.xmin.max(other.xmin);
        out.xmax = self.xmax.min(other.xmax);
        out.ymin = self.ymin.max(other.ymin);
        out.ymax = self.ymax.min(other.ymax);
        Some(out)
    }

    /// Bounding region of two regions.
    pub fn merge(&self, other: &Region) -> Region {
        let mut out = self.clone();
        out.xmin = self.xmin.min(other.xmin);
        out.xmax = self.xmax.max(other.xmax);
        out.ymin = self.ymin.min(other.ymin);
        out.ymax = self.ymax.max(other.ymax);
        out.zmin = match (self.zmin, other.zmin) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        out.zmax = match (self.zmax, other.zmax) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        out
    }

    /// Grow the box by a percentage of its largest dimension, or by absolute
    /// values. When increments are given the result is snapped outward to
    /// increment multiples.
    pub fn buffer(&self, pct: Option<f64>, x_bv: Option<f64>, y_bv: Option<f64>, x_inc: Option<f64>, y_inc: Option<f64>) -> Region {
        let mut x_buffer = x_bv.unwrap_or(0.0);
        let mut y_buffer = y_bv.unwrap_or(0.0);
        if let Some(pct) = pct {
            let extent = self.width().max(self.height());
            x_buffer += extent * (pct / 100.0);
            y_buffer += extent * (pct / 100.0);
        }

        let mut out = self.clone();
        out.xmin -= x_buffer;
        out.xmax += x_buffer;
        out.ymin -= y_buffer;
        out.ymax += y_buffer;

        if let (Some(x_inc), Some(y_inc)) = (x_inc, y_inc) {
            out.xmin = (out.xmin / x_inc).floor() * x_inc;
            out.xmax = (out.xmax / x_inc).ceil() * x_inc;
            out.ymin = (out.ymin / y_inc).floor() * y_inc;
            out.ymax = (out.ymax / y_inc).ceil() * y_inc;
        }
        out
    }

    /// Derive the raster grid tiling this region at the given increments.
    /// Returns (columns, rows, geotransform).
    pub fn geo_transform(&self, x_inc: f64, y_inc: f64, node: GridNode) -> Result<(usize, usize, GeoTransform)> {
        if x_inc <= 0.0 || y_inc <= 0.0 {
            return Err(Error::InvalidArgument(format!("invalid increments: {x_inc}/{y_inc}")));
        }
        if !self.is_valid() {
            return Err(Error::InvalidArgument(format!("invalid region: {self}")));
        }

        let nx = ((self.width() / x_inc) - 1e-9).ceil().max(1.0) as usize;
        let ny = ((self.height() / y_inc) - 1e-9).ceil().max(1.0) as usize;

        match node {
            GridNode::Pixel => {
                let gt = GeoTransform::north_up(self.xmin, self.ymax, x_inc, y_inc);
                Ok((nx, ny, gt))
            }
            GridNode::Grid => {
                let gt = GeoTransform::north_up(self.xmin - x_inc / 2.0, self.ymax + y_inc / 2.0, x_inc, y_inc);
                Ok((nx + 1, ny + 1, gt))
            }
        }
    }

    /// The pixel window of this region within a raster, clipped to the raster
    /// extent. Disjoint regions produce an empty window.
    pub fn srcwin(&self, gt: &GeoTransform, nx: usize, ny: usize, node: GridNode) -> Srcwin {
        let dx = gt.cell_size_x();
        let dy = gt.cell_size_y();
        let (ox, oy) = gt.origin();

        let x0 = (self.xmin - ox) / dx;
        let x1 = (self.xmax - ox) / dx;
        // dy < 0: ymax maps to the smaller row index
        let y0 = (self.ymax - oy) / dy;
        let y1 = (self.ymin - oy) / dy;

        let (x0, x1, y0, y1) = match node {
            GridNode::Grid => (x0.round(), x1.round(), y0.round(), y1.round()),
            GridNode::Pixel => (x0.floor(), x1.ceil(), y0.floor(), y1.ceil()),
        };

        let xoff = (x0 as i64).clamp(0, nx as i64);
        let yoff = (y0 as i64).clamp(0, ny as i64);
        let xend = (x1 as i64).clamp(0, nx as i64);
        let yend = (y1 as i64).clamp(0, ny as i64);

        Srcwin {
            xoff,
            yoff,
            xsize: (xend - xoff).max(0) as usize,
            ysize: (yend - yoff).max(0) as usize,
        }
    }

    /// Split the region into square sub-regions of `chunk_cells` cells at the
    /// given increment, clipped to the region bounds.
    pub fn chunk(&self, inc: f64, chunk_cells: usize) -> Vec<Region> {
        let step = inc * chunk_cells.max(1) as f64;
        let mut out = Vec::new();
        let mut ymin = self.ymin;
        while ymin < self.ymax {
            let ymax = (ymin + step).min(self.ymax);
            let mut xmin = self.xmin;
            while xmin < self.xmax {
                let xmax = (xmin + step).min(self.xmax);
                let mut sub = self.clone();
                sub.xmin = xmin;
                sub.xmax = xmax;
                sub.ymin = ymin;
                sub.ymax = ymax;
                out.push(sub);
                xmin += step;
            }
            ymin += step;
        }
        out
    }

    /// Reproject the region by transforming its corners and edge midpoints
    /// and taking the axis-aligned hull. Guards against projections that
    /// bulge between corners.
    pub fn warp(&self, transformer: &CoordinateTransformer, dst_srs: Option<&str>) -> Result<Region> {
        let xmid = (self.xmin + self.xmax) / 2.0;
        let ymid = (self.ymin + self.ymax) / 2.0;
        let mut xs = [self.xmin, self.xmax, self.xmin, self.xmax, xmid, xmid, self.xmin, self.xmax];
        let mut ys = [self.ymin, self.ymin, self.ymax, self.ymax, self.ymin, self.ymax, ymid, ymid];
        let mut zs = [0.0; 8];
        transformer.transform_coordinates(&mut xs, &mut ys, &mut zs)?;

        let mut out = self.clone();
        out.xmin = xs.iter().copied().fold(f64::INFINITY, f64::min);
        out.xmax = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        out.ymin = ys.iter().copied().fold(f64::INFINITY, f64::min);
        out.ymax = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        out.src_srs = dst_srs.map(str::to_string);

        if !out.is_valid() {
            return Err(Error::Transform(format!("region warp produced an invalid region from {self}")));
        }
        Ok(out)
    }

    pub fn export_as_list(&self, include_z: bool) -> Vec<f64> {
        let mut out = vec![self.xmin, self.xmax, self.ymin, self.ymax];
        if include_z {
            out.push(self.zmin.unwrap_or(f64::NAN));
            out.push(self.zmax.unwrap_or(f64::NAN));
        }
        out
    }

    /// The region boundary as a WKT polygon.
    pub fn export_as_wkt(&self) -> String {
        format!(
            "POLYGON (({xmin} {ymin},{xmin} {ymax},{xmax} {ymax},{xmax} {ymin},{xmin} {ymin}))",
            xmin = self.xmin,
            xmax = self.xmax,
            ymin = self.ymin,
            ymax = self.ymax,
        )
    }

    /// Bounding region of the coordinates in a WKT geometry.
    pub fn from_wkt(wkt: &str) -> Result<Region> {
        let mut xmin = f64::INFINITY;
        let mut xmax = f64::NEG_INFINITY;
        let mut ymin = f64::INFINITY;
        let mut ymax = f64::NEG_INFINITY;

        for pair in wkt
            .split(|c: char| c == '(' || c == ')' || c == ',')
            .map(str::trim)
            .filter(|tok| !tok.is_empty() && tok.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '-' || c == '.'))
        {
            let mut coords = pair.split_whitespace();
            let (Some(x), Some(y)) = (coords.next(), coords.next()) else {
                continue;
            };
            let (Ok(x), Ok(y)) = (x.parse::<f64>(), y.parse::<f64>()) else {
                return Err(Error::Parse(format!("invalid wkt coordinate: {pair}")));
            };
            xmin = xmin.min(x);
            xmax = xmax.max(x);
            ymin = ymin.min(y);
            ymax = ymax.max(y);
        }

        let region = Region::new(xmin, xmax, ymin, ymax);
        if !region.is_valid() {
            return Err(Error::Parse(format!("no coordinates found in wkt: {wkt}")));
        }
        Ok(region)
    }
}

/// Parse a region request: either the `xmin/xmax/...` grammar or a path to
/// an OGR vector, one region per polygon. A vector path may carry a
/// `:zmin/zmax[/wmin/wmax/umin/umax]` suffix applied to every region.
pub fn parse_regions(spec: &str) -> Result<Vec<Region>> {
    if let Ok(region) = Region::parse(spec) {
        return Ok(vec![region]);
    }

    let (path, ranges) = if std::path::Path::new(spec).exists() {
        (spec, None)
    } else {
        match spec.split_once(':') {
            Some((path, ranges)) if std::path::Path::new(path).exists() => (path, Some(ranges)),
            _ => return Err(Error::Parse(format!("invalid region spec: {spec}"))),
        }
    };

    let constraints = ranges.map(parse_range_suffix).transpose()?;

    use gdal::vector::LayerAccess;
    let options = gdal::DatasetOptions {
        open_flags: gdal::GdalOpenFlags::GDAL_OF_READONLY | gdal::GdalOpenFlags::GDAL_OF_VECTOR,
        ..Default::default()
    };
    let ds = gdal::Dataset::open_ex(path, options)?;

    let mut regions = Vec::new();
    let mut push = |geometry: &gdal::vector::Geometry| {
        let envelope = geometry.envelope();
        let mut region = Region::new(envelope.MinX, envelope.MaxX, envelope.MinY, envelope.MaxY);
        if let Some([zmin, zmax, wmin, wmax, umin, umax]) = constraints {
            region.zmin = zmin;
            region.zmax = zmax;
            region.wmin = wmin;
            region.wmax = wmax;
            region.umin = umin;
            region.umax = umax;
        }
        if region.is_valid() {
            regions.push(region);
        }
    };

    for index in 0..ds.layer_count() {
        let mut layer = ds.layer(index)?;
        for feature in layer.features() {
            let Some(geometry) = feature.geometry() else {
                continue;
            };
            if geometry.geometry_type() == gdal_sys::OGRwkbGeometryType::wkbMultiPolygon {
                for sub in 0..geometry.geometry_count() {
                    push(&geometry.get_geometry(sub));
                }
            } else {
                push(geometry);
            }
        }
    }

    if regions.is_empty() {
        return Err(Error::Parse(format!("no usable polygons in region vector: {path}")));
    }
    Ok(regions)
}

/// The `zmin/zmax[/wmin/wmax/umin/umax]` suffix of a vector region spec.
fn parse_range_suffix(text: &str) -> Result<[Option<f64>; 6]> {
    let mut out = [None; 6];
    for (slot, token) in text.split('/').take(6).enumerate() {
        let token = token.trim();
        if token.is_empty() || token == "-" {
            continue;
        }
        out[slot] = Some(
            token
                .parse::<f64>()
                .map_err(|_| Error::Parse(format!("invalid region range value: {token}")))?,
        );
    }
    Ok(out)
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt(value: Option<f64>) -> String {
            value.map_or_else(|| "-".to_string(), |v| v.to_string())
        }

        write!(f, "{}/{}/{}/{}", self.xmin, self.xmax, self.ymin, self.ymax)?;
        if [self.zmin, self.zmax, self.wmin, self.wmax, self.umin, self.umax]
            .iter()
            .any(Option::is_some)
        {
            write!(f, "/{}/{}", opt(self.zmin), opt(self.zmax))?;
        }
        if [self.wmin, self.wmax, self.umin, self.umax].iter().any(Option::is_some) {
            write!(
                f,
                "/{}/{}/{}/{}",
                opt(self.wmin),
                opt(self.wmax),
                opt(self.umin),
                opt(self.umax)
            )?;
        }
        Ok(())
    }
}
