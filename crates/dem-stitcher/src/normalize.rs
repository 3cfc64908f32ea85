//! Registration, datum, and resolution normalization of merged rasters.

use crate::raster::{Crs, PixelRegistration, Raster, RasterBuffer, RasterGrid, Resolution};
use crate::transform::aligned_target;
use crate::warp::{calculate_default_transform, reproject_to_grid, Resampling};
use crate::Result;
use tracing::debug;

/// Move `grid` between registration conventions.
///
/// Area to Point moves the origin half a pixel up-left; Point to Area moves it
/// back. Pixel values are untouched.
pub fn shift_for_registration(
    grid: &RasterGrid,
    src: PixelRegistration,
    dst: PixelRegistration,
) -> RasterGrid {
    let shift = match (src, dst) {
        (PixelRegistration::Area, PixelRegistration::Point) => -0.5,
        (PixelRegistration::Point, PixelRegistration::Area) => 0.5,
        _ => return grid.clone(),
    };
    grid.with_transform(grid.transform().translate_pixels(shift, shift))
}

/// Grid covering `grid` at `resolution`, with edges on multiples of the pixel size.
pub fn update_grid_resolution(grid: &RasterGrid, resolution: Resolution) -> Result<RasterGrid> {
    resolution.validate()?;
    let (transform, width, height) =
        aligned_target(grid.transform(), grid.width(), grid.height(), resolution.as_tuple());
    Ok(grid.with_transform(transform).with_shape(width, height))
}

/// Reproject a raster to `dst_crs`, optionally at an aligned `dst_resolution`.
///
/// The destination nodata follows the source's.
pub fn reproject_to_crs(
    buffer: &RasterBuffer,
    grid: &RasterGrid,
    dst_crs: Crs,
    resampling: Resampling,
    dst_resolution: Option<Resolution>,
) -> Result<Raster> {
    let (transform, width, height) = calculate_default_transform(grid, dst_crs)?;
    let mut dst_grid = grid
        .with_crs(dst_crs)
        .with_transform(transform)
        .with_shape(width, height);
    if let Some(resolution) = dst_resolution {
        dst_grid = update_grid_resolution(&dst_grid, resolution)?;
    }
    debug!(
        src = %grid.crs(),
        dst = %dst_crs,
        width = dst_grid.width(),
        height = dst_grid.height(),
        "Reprojecting raster"
    );
    reproject_to_grid(buffer, grid, &dst_grid, resampling, grid.nodata())
}

/// Resample a raster to `resolution` in its own CRS.
///
/// Always bilinear: elevation aliases badly under nearest neighbour.
pub fn retarget_resolution(buffer: &RasterBuffer, grid: &RasterGrid, resolution: Resolution) -> Result<Raster> {
    let dst_grid = update_grid_resolution(grid, resolution)?;
    debug!(
        from = ?grid.resolution(),
        to = ?resolution.as_tuple(),
        "Retargeting resolution"
    );
    reproject_to_grid(buffer, grid, &dst_grid, Resampling::Bilinear, grid.nodata())
}
