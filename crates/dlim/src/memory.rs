use geo::{Region, XyzPoint};

use crate::dataset::{block_points, DatasetCore, PointIter, TargetGrid, TileIter};
use crate::{formats, Dataset, DatasetOptions, Inf, Inheritance, Result};

/// In-memory point list (datalist format -3). Useful for user-supplied data
/// and as the leaf the uncertainty engine feeds its held-back samples into.
pub struct MemDataset {
    core: DatasetCore,
    points: Vec<XyzPoint>,
}

impl MemDataset {
    pub fn new(points: Vec<XyzPoint>, inherited: &Inheritance, options: &DatasetOptions) -> Self {
        MemDataset {
            core: DatasetCore::new("scratch", formats::MEMORY, inherited, options),
            points,
        }
    }

    pub fn empty(inherited: &Inheritance, options: &DatasetOptions) -> Self {
        MemDataset::new(Vec::new(), inherited, options)
    }

    pub fn push(&mut self, point: XyzPoint) {
        self.points.push(point);
    }

    fn filtered(&self) -> Vec<XyzPoint> {
        self.points
            .iter()
            .filter(|point| point.is_valid() && self.core.point_in_region(point))
            .map(|point| {
                let mut out = *point;
                out.w *= self.core.weight;
                out.u = (self.core.uncertainty.powi(2) + out.u.powi(2)).sqrt();
                out
            })
            .collect()
    }
}

impl Dataset for MemDataset {
    fn core(&self) -> &DatasetCore {
        &self.core
    }

    fn is_valid(&self) -> bool {
        !self.points.is_empty()
    }

    fn generate_inf(&mut self) -> Result<Inf> {
        let mut inf = Inf {
            name: self.core.name(),
            numpts: self.points.len() as u64,
            format: formats::MEMORY,
            src_srs: self.core.src_srs.clone(),
            ..Default::default()
        };

        let mut region: Option<Region> = None;
        for point in &self.points {
            let point_region = Region {
                xmin: point.x,
                xmax: point.x,
                ymin: point.y,
                ymax: point.y,
                zmin: Some(point.z),
                zmax: Some(point.z),
                ..Default::default()
            };
            region = Some(match region {
                Some(current) => current.merge(&point_region),
                None => point_region,
            });
        }
        if let Some(region) = region {
            inf.set_region(&region);
        }
        Ok(inf)
    }

    fn yield_points(&mut self) -> Result<PointIter> {
        Ok(Box::new(self.filtered().into_iter()))
    }

    fn yield_tiles(&mut self, grid: &TargetGrid) -> Result<TileIter> {
        let tile = block_points(self.filtered().into_iter(), grid);
        Ok(Box::new(tile.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_compose_on_yield() {
        let inherited = Inheritance {
            weight: 3.0,
            ..Default::default()
        };
        let mut ds = MemDataset::new(
            vec![XyzPoint::with_wu(0.0, 0.0, 1.0, 2.0, 0.0)],
            &inherited,
            &DatasetOptions::default(),
        );
        let points: Vec<XyzPoint> = ds.yield_points().unwrap().collect();
        assert_eq!(points[0].w, 6.0);
    }
}
