use std::path::{Path, PathBuf};

use dlim::{Dataset, TargetGrid};
use geo::raster::{self, sample_warp, RasterIo, ResampleAlg};
use geo::{Region, SpatialRef};

use crate::{
    dump_stack_xyz, DemFinalizer, ExternalGridder, FinalizeOptions, Idw, IdwOptions, Interpolator, InterpolationUncertainty,
    Result, StackMask, StackMode, Stacker, Triangulated, TriangulationKernel, UncertaintyOptions,
};

/// The gridding module producing the DEM from the stack.
pub enum WaffleModule {
    /// The stack's z band itself.
    Stacks,
    Idw(IdwOptions),
    Triangulated(TriangulationKernel),
    External(Box<dyn ExternalGridder>),
}

/// One DEM production run: stack the inputs, grid, estimate uncertainty,
/// finalize.
pub struct Waffle {
    pub name: String,
    pub region: Region,
    pub x_inc: f64,
    pub y_inc: f64,
    pub dst_srs: Option<String>,
    pub mode: StackMode,
    pub module: WaffleModule,
    pub want_mask: bool,
    pub want_uncertainty: bool,
    pub uncertainty: UncertaintyOptions,
    pub finalize: FinalizeOptions,
}

impl Waffle {
    pub fn new(name: impl Into<String>, region: Region, x_inc: f64, y_inc: f64) -> Self {
        Waffle {
            name: name.into(),
            region,
            x_inc,
            y_inc,
            dst_srs: None,
            mode: StackMode::WeightedMean,
            module: WaffleModule::Idw(IdwOptions::default()),
            want_mask: false,
            want_uncertainty: false,
            uncertainty: UncertaintyOptions::default(),
            finalize: FinalizeOptions::default(),
        }
    }

    /// Produced artifacts land in `outdir` as `<name>.tif`,
    /// `<name>_stack.tif` and friends.
    pub fn generate(&self, datasets: &mut [Box<dyn Dataset>], outdir: &Path) -> Result<WaffleOutput> {
        std::fs::create_dir_all(outdir)?;

        let grid = TargetGrid::new(&self.region, self.x_inc, self.y_inc)?;
        let projection = match &self.dst_srs {
            Some(srs) => SpatialRef::from_user_input(srs)?.to_wkt()?,
            None => String::new(),
        };

        // stack all inputs
        let mut stacker = Stacker::new(grid.clone(), self.mode, projection.clone());
        let mut mask = self.want_mask.then(|| StackMask::new(&grid, projection.clone()));
        for dataset in datasets.iter_mut() {
            stacker.add_dataset(dataset.as_mut(), mask.as_mut())?;
        }
        stacker.finalize();

        let stack_path = outdir.join(format!("{}_stack.tif", self.name));
        stacker.write(&stack_path)?;

        let mask_path = match &mask {
            Some(mask) if mask.band_count() > 0 => {
                let path = outdir.join(format!("{}_stack_m.tif", self.name));
                mask.write(&path)?;
                Some(path)
            }
            _ => None,
        };

        let stack = stacker.into_stack_data();

        // grid the stack into the DEM
        let dem = match &self.module {
            WaffleModule::Stacks => stack.z.clone(),
            WaffleModule::Idw(options) => Idw::new(options.clone()).interpolate(&stack)?,
            WaffleModule::Triangulated(kernel) => Triangulated::new(*kernel).interpolate(&stack)?,
            WaffleModule::External(gridder) => {
                let xyz_path = outdir.join(format!("{}_stack.xyz", self.name));
                dump_stack_xyz(&stack, &xyz_path)?;
                let gridded = gridder.grid(&xyz_path, &self.region, self.x_inc, self.y_inc, outdir)?;

                // align the tool output to the target grid and take band 1
                let source = RasterIo::open_read_only(&gridded)?;
                let warped = sample_warp(source.dataset(), &stack.meta, None, ResampleAlg::Bilinear)?;
                RasterIo::from_dataset(warped).read_band(1)?
            }
        };

        let dem_path = outdir.join(format!("{}.tif", self.name));
        raster::write_bands(&dem_path, &stack.meta, &[&dem], &[])?;

        // interpolation uncertainty from split-sample simulation
        let uncertainty_path = if self.want_uncertainty {
            let interpolator: Box<dyn Interpolator> = match &self.module {
                WaffleModule::Triangulated(kernel) => Box::new(Triangulated::new(*kernel)),
                _ => Box::new(Idw::new(IdwOptions::default())),
            };

            let mut options = self.uncertainty.clone();
            if options.sample_cache.is_some() && options.stack_hash.is_none() {
                options.stack_hash = dlim::hash_file(&stack_path).ok();
            }

            let engine = InterpolationUncertainty::new(&stack, &dem, interpolator.as_ref(), options);
            match engine.run() {
                Ok((uncertainty, fit)) => {
                    log::info!("proximity-error fit: {fit:?}");
                    let path = outdir.join(format!("{}_u.tif", self.name));
                    raster::write_bands(&path, &stack.meta, &[&uncertainty], &[])?;
                    Some(path)
                }
                Err(err) => {
                    log::warn!("uncertainty estimation failed: {err}");
                    None
                }
            }
        } else {
            None
        };

        let mut finalizer = DemFinalizer::new(&dem_path);
        let dem_path = finalizer.process(&self.finalize)?;

        Ok(WaffleOutput {
            dem: dem_path,
            stack: stack_path,
            mask: mask_path,
            uncertainty: uncertainty_path,
        })
    }
}

pub struct WaffleOutput {
    pub dem: PathBuf,
    pub stack: PathBuf,
    pub mask: Option<PathBuf>,
    pub uncertainty: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlim::{DatasetOptions, Inheritance, XyzDataset, XyzOptions};

    #[test]
    fn end_to_end_idw_dem() {
        let dir = tempfile::tempdir().unwrap();
        let xyz = dir.path().join("input.xyz");
        std::fs::write(&xyz, "0 0 1\n1 0 2\n0 1 3\n1 1 4\n").unwrap();

        let region = Region::new(0.0, 1.0, 0.0, 1.0);
        let options = DatasetOptions {
            region: Some(region.clone()),
            x_inc: Some(1.0),
            y_inc: Some(1.0),
            cache_dir: dir.path().join("cache"),
            ..Default::default()
        };
        let mut datasets: Vec<Box<dyn Dataset>> = vec![Box::new(XyzDataset::new(
            xyz,
            XyzOptions::default(),
            &Inheritance::default(),
            &options,
        ))];

        let mut waffle = Waffle::new("test_dem", region, 1.0, 1.0);
        waffle.want_mask = true;
        let output = waffle.generate(&mut datasets, dir.path()).unwrap();

        assert!(output.dem.exists());
        assert!(output.stack.exists());
        assert!(output.mask.is_some());

        // scenario: each input point lands in its own cell of the 2x2 grid
        let stack = RasterIo::open_read_only(&output.stack).unwrap();
        assert_eq!(stack.raster_size(), (2, 2));
        let z = stack.read_band(1).unwrap();
        let count = stack.read_band(2).unwrap();
        assert_eq!(z, vec![3.0, 4.0, 1.0, 2.0]);
        assert_eq!(count, vec![1.0, 1.0, 1.0, 1.0]);

        // the IDW DEM is fully populated
        let dem = RasterIo::open_read_only(&output.dem).unwrap().read_band(1).unwrap();
        assert!(dem.iter().all(|z| z.is_finite()));
    }

    #[test]
    fn stack_points_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let xyz = dir.path().join("input.xyz");
        std::fs::write(&xyz, "0.5 0.5 7\n").unwrap();

        let region = Region::new(0.0, 2.0, 0.0, 2.0);
        let options = DatasetOptions {
            region: Some(region.clone()),
            x_inc: Some(1.0),
            y_inc: Some(1.0),
            ..Default::default()
        };
        let mut dataset = XyzDataset::new(xyz, XyzOptions::default(), &Inheritance::default(), &options);

        let grid = TargetGrid::new(&region, 1.0, 1.0).unwrap();
        let mut stacker = Stacker::new(grid, StackMode::WeightedMean, String::new());
        stacker.add_dataset(&mut dataset, None).unwrap();
        stacker.finalize();

        let points: Vec<geo::XyzPoint> = stacker.points().collect();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].z, 7.0);
    }
}
