//! Geoid reads and ellipsoidal height conversion.
//!
//! Most tests use a global geoid whose undulation is linear in longitude and
//! latitude, so bilinear resampling reproduces it exactly away from the edges.

use approx::assert_relative_eq;
use dem_stitcher::{
    insufficient_buffer, read_geoid, read_window, remove_geoid, reproject, shift_for_registration, Affine,
    BoundingBox, Crs, MemoryRaster, PixelRegistration, RasterBuffer, RasterGrid, Resampling, Rounding, DEFAULT_READ_BUFFER,
    DEFAULT_REMOVAL_BUFFER,
};

const GEOID_RES: f64 = 0.25;

fn undulation(lon: f64, lat: f64) -> f64 {
    lon + 2.0 * lat
}

/// Geoid sampled at pixel centres of a grid with origin `(west, north)`.
fn sampled_geoid(west: f64, north: f64, width: usize, height: usize, res: f64, f: fn(f64, f64) -> f64) -> MemoryRaster {
    let transform = Affine::from_origin(west, north, res, res);
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            let (lon, lat) = transform.xy(row, col);
            data.push(f(lon, lat) as f32);
        }
    }
    let grid = RasterGrid::new(width, height, transform, Crs::Wgs84)
        .unwrap()
        .with_nodata(Some(-9999.0));
    MemoryRaster::new(RasterBuffer::new(1, height, width, data).unwrap(), grid).unwrap()
}

fn global_geoid() -> MemoryRaster {
    let width = (360.0 / GEOID_RES) as usize;
    let height = (180.0 / GEOID_RES) as usize;
    sampled_geoid(-180.0, 90.0, width, height, GEOID_RES, undulation)
}

/// Zero DEM over lon 10..12, lat 3..5.
fn zero_dem(res: f64) -> (RasterBuffer, RasterGrid) {
    let size = (2.0 / res).round() as usize;
    let grid = RasterGrid::new(size, size, Affine::from_origin(10.0, 5.0, res, res), Crs::Wgs84).unwrap();
    (RasterBuffer::filled(1, size, size, 0.0), grid)
}

/// The whole geoid resampled onto `grid`, the reference every windowed read must match.
fn full_geoid_on(grid: &RasterGrid, registration: PixelRegistration) -> RasterBuffer {
    let (buffer, geoid_grid) = global_geoid().into_parts();
    let geoid_grid = shift_for_registration(&geoid_grid, PixelRegistration::Area, registration);
    reproject(&buffer, &geoid_grid, grid, Resampling::Bilinear, Some(f64::NAN)).unwrap()
}

fn assert_buffers_close(actual: &RasterBuffer, expected: &RasterBuffer) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.data().iter().zip(expected.data()) {
        assert_relative_eq!(*a, *e, epsilon = 1e-4);
    }
}

#[test]
fn test_zero_dem_becomes_geoid() {
    let (dem, grid) = zero_dem(0.1);
    let mut geoid = global_geoid();
    let out = remove_geoid(&dem, &grid, &mut geoid, PixelRegistration::Area, DEFAULT_REMOVAL_BUFFER).unwrap();

    assert_buffers_close(&out, &full_geoid_on(&grid, PixelRegistration::Area));
    for row in 0..grid.height() {
        for col in 0..grid.width() {
            let (lon, lat) = grid.transform().xy(row, col);
            assert_relative_eq!(out.get(0, row, col) as f64, undulation(lon, lat), epsilon = 1e-3);
        }
    }
}

#[test]
fn test_point_registration_shifts_geoid_half_pixel() {
    let (dem, grid) = zero_dem(0.1);
    let mut geoid = global_geoid();
    let out = remove_geoid(&dem, &grid, &mut geoid, PixelRegistration::Point, DEFAULT_REMOVAL_BUFFER).unwrap();

    assert_buffers_close(&out, &full_geoid_on(&grid, PixelRegistration::Point));
    // Moving the geoid half a pixel west and north lowers lon + 2 lat by half a pixel.
    let (lon, lat) = grid.transform().xy(5, 5);
    assert_relative_eq!(
        out.get(0, 5, 5) as f64,
        undulation(lon, lat) - GEOID_RES / 2.0,
        epsilon = 1e-3
    );
}

#[test]
fn test_dem_heights_are_offset() {
    let (_, grid) = zero_dem(0.1);
    let dem = RasterBuffer::filled(1, grid.height(), grid.width(), 250.0);
    let mut geoid = global_geoid();
    let out = remove_geoid(&dem, &grid, &mut geoid, PixelRegistration::Area, DEFAULT_REMOVAL_BUFFER).unwrap();
    let (lon, lat) = grid.transform().xy(0, 0);
    assert_relative_eq!(out.get(0, 0, 0) as f64, 250.0 + undulation(lon, lat), epsilon = 1e-3);
}

#[test]
fn test_subset_read_matches_full_read() {
    let mut geoid = global_geoid();
    let full = read_geoid(&mut geoid, None, DEFAULT_READ_BUFFER).unwrap();
    assert!(full.spans_dateline);

    let extent = BoundingBox::new(10.0, 3.0, 12.0, 5.0);
    let subset = read_geoid(&mut geoid, Some(&extent), DEFAULT_READ_BUFFER).unwrap();
    let bounds = subset.grid.bounds();
    assert!(bounds.contains(&extent));
    assert_relative_eq!(bounds.xmin, 10.0 - GEOID_RES);
    assert_relative_eq!(bounds.ymax, 5.0 + GEOID_RES);

    let (row, col) = full
        .grid
        .transform()
        .rowcol(bounds.xmin, bounds.ymax, Rounding::Floor)
        .unwrap();
    let expected = full.buffer.slice(
        row as usize,
        col as usize,
        subset.grid.height(),
        subset.grid.width(),
    );
    assert_eq!(subset.buffer, expected);
}

#[test]
fn test_coarse_dem_needs_larger_buffer() {
    let (dem, grid) = zero_dem(1.0);
    let recommended = insufficient_buffer(1.0, GEOID_RES, DEFAULT_REMOVAL_BUFFER).unwrap();
    assert_eq!(recommended, 5);
    assert_eq!(insufficient_buffer(1.0, GEOID_RES, recommended), None);

    let mut geoid = global_geoid();
    let out = remove_geoid(&dem, &grid, &mut geoid, PixelRegistration::Area, recommended).unwrap();
    assert_buffers_close(&out, &full_geoid_on(&grid, PixelRegistration::Area));
}

fn periodic(lon: f64, lat: f64) -> f64 {
    10.0 * lon.to_radians().cos() + lat
}

#[test]
fn test_dateline_read_matches_wide_geoid() {
    // Same periodic field on -180..180 and on a grid padded to -190..190.
    let mut narrow = sampled_geoid(-180.0, 90.0, 360, 180, 1.0, periodic);
    let mut wide = sampled_geoid(-190.0, 90.0, 380, 180, 1.0, periodic);

    let extent = BoundingBox::new(179.0, 0.0, 181.0, 1.0);
    let joined = read_geoid(&mut narrow, Some(&extent), 1).unwrap();
    let (expected, expected_grid) = read_window(&mut wide, &extent, Crs::Wgs84, 1).unwrap();

    assert_eq!(joined.grid.shape(), expected_grid.shape());
    let (a, b) = (joined.grid.bounds(), expected_grid.bounds());
    assert_relative_eq!(a.xmin, b.xmin, epsilon = 1e-9);
    assert_relative_eq!(a.xmax, b.xmax, epsilon = 1e-9);
    assert_relative_eq!(a.ymax, b.ymax, epsilon = 1e-9);
    for (x, y) in joined.buffer.data().iter().zip(expected.data()) {
        assert_relative_eq!(*x, *y, epsilon = 1e-4);
    }
}

#[test]
fn test_partial_geoid_still_reads() {
    let mut regional = sampled_geoid(0.0, 10.0, 40, 40, GEOID_RES, undulation);
    let read = read_geoid(&mut regional, Some(&BoundingBox::new(2.0, 2.0, 4.0, 4.0)), 1).unwrap();
    assert!(!read.spans_dateline);
    assert_eq!((read.grid.width(), read.grid.height()), (10, 10));
}
