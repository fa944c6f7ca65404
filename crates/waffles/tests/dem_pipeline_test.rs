//! End-to-end runs over the public API: datalist in, finished DEM out.

use std::path::Path;

use dlim::{Datalist, Dataset, DatasetOptions, Inheritance, TargetGrid};
use geo::raster::RasterIo;
use geo::Region;
use waffles::{StackMode, Stacker, Waffle, WaffleModule};

fn write(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
}

#[test]
fn datalist_to_finished_dem() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir.path().join("grid.xyz"), "0 0 1\n1 0 2\n0 1 3\n1 1 4\n");
    write(&dir.path().join("all.datalist"), "grid.xyz 168 1 0\n");

    let region = Region::new(0.0, 1.0, 0.0, 1.0);
    let options = DatasetOptions {
        region: Some(region.clone()),
        x_inc: Some(1.0),
        y_inc: Some(1.0),
        cache_dir: dir.path().join("cache"),
        ..Default::default()
    };
    let mut datasets: Vec<Box<dyn Dataset>> = vec![Box::new(Datalist::new(
        dir.path().join("all.datalist"),
        &Inheritance::default(),
        &options,
    ))];

    let mut waffle = Waffle::new("pipeline", region, 1.0, 1.0);
    waffle.module = WaffleModule::Stacks;
    waffle.want_mask = true;
    let output = waffle.generate(&mut datasets, dir.path()).unwrap();

    // each input point lands in its own cell; row 0 is the north row
    let stack = RasterIo::open_read_only(&output.stack).unwrap();
    assert_eq!(stack.raster_size(), (2, 2));
    assert_eq!(stack.read_band(1).unwrap(), vec![3.0, 4.0, 1.0, 2.0]);
    assert_eq!(stack.read_band(2).unwrap(), vec![1.0, 1.0, 1.0, 1.0]);

    let dem = RasterIo::open_read_only(&output.dem).unwrap();
    assert_eq!(dem.read_band(1).unwrap(), vec![3.0, 4.0, 1.0, 2.0]);

    // one mask band for the one datalist entry, fully covered
    let mask_path = output.mask.unwrap();
    let mask = RasterIo::open_read_only(&mask_path).unwrap();
    assert_eq!(mask.band_count(), 1);
    assert_eq!(mask.read_band(1).unwrap(), vec![1.0; 4]);
}

#[test]
fn conflict_policies_on_overlapping_sources() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir.path().join("light.xyz"), "0 0 10\n");
    write(&dir.path().join("heavy.xyz"), "0 0 20\n");
    write(&dir.path().join("pair.datalist"), "light.xyz 168 1 0\nheavy.xyz 168 3 0\n");

    let region = Region::new(0.0, 0.5, 0.0, 0.5);
    let options = DatasetOptions {
        region: Some(region.clone()),
        x_inc: Some(1.0),
        y_inc: Some(1.0),
        cache_dir: dir.path().join("cache"),
        ..Default::default()
    };

    let stack = |mode: StackMode| {
        let mut datalist = Datalist::new(dir.path().join("pair.datalist"), &Inheritance::default(), &options);
        let grid = TargetGrid::new(&region, 1.0, 1.0).unwrap();
        let mut stacker = Stacker::new(grid, mode, String::new());
        for mut dataset in datalist.parse().unwrap() {
            stacker.add_dataset(dataset.as_mut(), None).unwrap();
        }
        stacker.finalize();
        stacker
    };

    let mean = stack(StackMode::WeightedMean);
    let idx = mean.count().iter().position(|&c| !c.is_nan()).unwrap();
    assert!((mean.z()[idx] - 17.5).abs() < 1e-9);
    assert_eq!(mean.weight()[idx], 4.0);
    assert_eq!(mean.count()[idx], 2.0);

    let supercede = stack(StackMode::Supercede);
    assert_eq!(supercede.z()[idx], 20.0);
    assert_eq!(supercede.weight()[idx], 3.0);
    assert_eq!(supercede.count()[idx], 2.0);
}

#[test]
fn nested_datalist_weights_reach_the_stack() {
    let dir = tempfile::tempdir().unwrap();
    write(&dir.path().join("pts.xyz"), "0 0 5\n");
    write(&dir.path().join("inner.datalist"), "pts.xyz 168 0.5 0\n");
    write(&dir.path().join("outer.datalist"), "inner.datalist -1 2 0\n");

    let region = Region::new(0.0, 0.5, 0.0, 0.5);
    let options = DatasetOptions {
        region: Some(region.clone()),
        x_inc: Some(1.0),
        y_inc: Some(1.0),
        cache_dir: dir.path().join("cache"),
        ..Default::default()
    };

    let mut datalist = Datalist::new(dir.path().join("outer.datalist"), &Inheritance::default(), &options);
    let grid = TargetGrid::new(&region, 1.0, 1.0).unwrap();
    let mut stacker = Stacker::new(grid, StackMode::WeightedMean, String::new());
    for mut dataset in datalist.parse().unwrap() {
        stacker.add_dataset(dataset.as_mut(), None).unwrap();
    }
    stacker.finalize();

    // parent weight 2 x entry weight 0.5 -> effective weight 1.0
    let idx = stacker.count().iter().position(|&c| !c.is_nan()).unwrap();
    assert_eq!(stacker.weight()[idx], 1.0);
    assert_eq!(stacker.z()[idx], 5.0);
}
