//! Mosaicking overlapping rasters into one grid.
//!
//! The first input is the reference: it fixes the resolution, CRS, and band
//! count of the output. Inputs are painted in order and a pixel, once filled
//! with valid data, is never overwritten ("first wins"), so callers control
//! overlap priority through input order.

use crate::bounds::BoundingBox;
use crate::raster::{DataType, Raster, RasterBuffer, RasterGrid};
use crate::transform::Affine;
use crate::warp::{reproject, Resampling};
use crate::window::{get_indices_from_extent, PixelWindow};
use crate::{Result, StitchError};
use tracing::debug;

/// Inputs whose origin lies within this many pixels of the output lattice are copied directly.
const ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// Value written where no input has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeNodata {
    /// Leave gaps as NaN.
    #[default]
    Nan,
    /// Fill gaps with zero (sea level), so geoid removal still yields heights there.
    Zero,
}

impl MergeNodata {
    /// Fill value.
    pub fn value(&self) -> f32 {
        match self {
            MergeNodata::Nan => f32::NAN,
            MergeNodata::Zero => 0.0,
        }
    }
}

impl TryFrom<f64> for MergeNodata {
    type Error = StitchError;

    fn try_from(value: f64) -> Result<Self> {
        if value.is_nan() {
            Ok(MergeNodata::Nan)
        } else if value == 0.0 {
            Ok(MergeNodata::Zero)
        } else {
            Err(StitchError::InvalidConfiguration(format!(
                "merge nodata value must be NaN or 0, got {}",
                value
            )))
        }
    }
}

/// Merge rasters into one, optionally cropped to `bounds`.
///
/// The output grid is the union of the inputs' footprints on the first
/// input's pixel lattice. With `bounds`, only the window covering them
/// (floor/ceil rounded outward) is allocated. Inputs aligned with the lattice
/// are copied; others are resampled with `resampling`. The result is Float32
/// with a NaN nodata value; gaps hold `nodata.value()`.
pub fn merge_rasters(
    inputs: &[Raster],
    bounds: Option<&BoundingBox>,
    nodata: MergeNodata,
    resampling: Resampling,
) -> Result<Raster> {
    let (_, reference) = inputs.first().ok_or(StitchError::EmptyMerge)?;
    for (buffer, grid) in inputs {
        buffer.check_matches(grid)?;
        if grid.crs() != reference.crs() {
            return Err(StitchError::CrsMismatch {
                expected: reference.crs().epsg(),
                found: grid.crs().epsg(),
            });
        }
        if grid.band_count() != reference.band_count() {
            return Err(StitchError::ShapeMismatch {
                buffer: grid.shape(),
                grid: reference.shape(),
            });
        }
    }

    let union_grid = union_grid(inputs, reference)?;
    let out_grid = match bounds {
        Some(bounds) => crop_grid(&union_grid, bounds)?,
        None => union_grid,
    };

    let fill = nodata.value();
    let bands = reference.band_count();
    let mut out = RasterBuffer::filled(bands, out_grid.height(), out_grid.width(), fill);
    let mut filled = vec![false; out.data().len()];

    for (buffer, grid) in inputs {
        match aligned_offset(grid, &out_grid) {
            Some((row_off, col_off)) => paint_aligned(&mut out, &mut filled, buffer, grid, row_off, col_off),
            None => paint_resampled(&mut out, &mut filled, buffer, grid, &out_grid, resampling)?,
        }
    }

    debug!(
        inputs = inputs.len(),
        width = out_grid.width(),
        height = out_grid.height(),
        "Merged rasters"
    );
    let out_grid = out_grid
        .with_dtype(DataType::Float32)
        .with_nodata(Some(f64::NAN));
    Ok((out, out_grid))
}

/// Grid covering every input on the reference lattice.
fn union_grid(inputs: &[Raster], reference: &RasterGrid) -> Result<RasterGrid> {
    let extent = inputs
        .iter()
        .map(|(_, grid)| grid.bounds())
        .reduce(|acc, b| acc.union(&b))
        .ok_or(StitchError::EmptyMerge)?;

    let (xres, yres) = reference.resolution();
    let transform = Affine::from_origin(extent.xmin, extent.ymax, xres, yres);
    let width = ((extent.width() / xres).round() as usize).max(1);
    let height = ((extent.height() / yres).round() as usize).max(1);
    RasterGrid::new(width, height, transform, reference.crs())
        .map(|g| g.with_band_count(reference.band_count()))
}

/// Window of `grid` covering `bounds`, with an exactly derived transform.
pub fn crop_grid(grid: &RasterGrid, bounds: &BoundingBox) -> Result<RasterGrid> {
    let (upper_left, lower_right) = get_indices_from_extent(
        grid.transform(),
        bounds,
        Some((grid.height(), grid.width())),
        0,
    )?;
    let window = PixelWindow::from_corners(upper_left, lower_right);
    if window.is_empty() {
        return Err(StitchError::NoOverlap(format!(
            "bounds {} do not overlap merged extent {}",
            bounds,
            grid.bounds()
        )));
    }
    Ok(window.grid(grid))
}

/// Integer `(row, col)` offset of `grid` in `out`, if it sits on `out`'s lattice.
fn aligned_offset(grid: &RasterGrid, out: &RasterGrid) -> Option<(i64, i64)> {
    let (g, o) = (grid.transform(), out.transform());
    if !g.is_rectilinear() || !o.is_rectilinear() {
        return None;
    }
    let same_res = ((g.a - o.a) / o.a).abs() < ALIGNMENT_TOLERANCE && ((g.e - o.e) / o.e).abs() < ALIGNMENT_TOLERANCE;
    if !same_res {
        return None;
    }
    let col = (g.c - o.c) / o.a;
    let row = (g.f - o.f) / o.e;
    let (col_r, row_r) = (col.round(), row.round());
    if (col - col_r).abs() < ALIGNMENT_TOLERANCE && (row - row_r).abs() < ALIGNMENT_TOLERANCE {
        Some((row_r as i64, col_r as i64))
    } else {
        None
    }
}

fn paint_aligned(
    out: &mut RasterBuffer,
    filled: &mut [bool],
    buffer: &RasterBuffer,
    grid: &RasterGrid,
    row_off: i64,
    col_off: i64,
) {
    let (out_h, out_w) = (out.height() as i64, out.width() as i64);
    let plane = out.height() * out.width();
    for band in 0..buffer.bands() {
        let src = buffer.band(band);
        let dst = out.band_mut(band);
        let mask = &mut filled[band * plane..(band + 1) * plane];
        for row in 0..grid.height() {
            let out_row = row as i64 + row_off;
            if out_row < 0 || out_row >= out_h {
                continue;
            }
            for col in 0..grid.width() {
                let out_col = col as i64 + col_off;
                if out_col < 0 || out_col >= out_w {
                    continue;
                }
                let idx = (out_row * out_w + out_col) as usize;
                let value = src[row * grid.width() + col];
                if !mask[idx] && grid.is_valid(value) {
                    dst[idx] = value;
                    mask[idx] = true;
                }
            }
        }
    }
}

fn paint_resampled(
    out: &mut RasterBuffer,
    filled: &mut [bool],
    buffer: &RasterBuffer,
    grid: &RasterGrid,
    out_grid: &RasterGrid,
    resampling: Resampling,
) -> Result<()> {
    let target = out_grid.with_band_count(buffer.bands());
    let warped = reproject(buffer, grid, &target, resampling, Some(f64::NAN))?;
    for (idx, value) in warped.data().iter().enumerate() {
        if !filled[idx] && !value.is_nan() {
            out.data_mut()[idx] = *value;
            filled[idx] = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Crs;

    fn constant(value: f32, west: f64, north: f64, size: usize, res: f64) -> Raster {
        let grid = RasterGrid::new(size, size, Affine::from_origin(west, north, res, res), Crs::Wgs84).unwrap();
        (RasterBuffer::filled(1, size, size, value), grid)
    }

    #[test]
    fn test_nodata_values() {
        assert_eq!(MergeNodata::try_from(f64::NAN).unwrap(), MergeNodata::Nan);
        assert_eq!(MergeNodata::try_from(0.0).unwrap(), MergeNodata::Zero);
        assert!(matches!(
            MergeNodata::try_from(3.0),
            Err(StitchError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(matches!(
            merge_rasters(&[], None, MergeNodata::Nan, Resampling::Nearest),
            Err(StitchError::EmptyMerge)
        ));
    }

    #[test]
    fn test_first_wins_on_overlap() {
        let a = constant(1.0, 0.0, 2.0, 2, 1.0);
        let b = constant(2.0, 1.0, 2.0, 2, 1.0);
        let (out, grid) = merge_rasters(&[a, b], None, MergeNodata::Nan, Resampling::Nearest).unwrap();
        assert_eq!((grid.width(), grid.height()), (3, 2));
        assert_eq!(out.data(), &[1.0, 1.0, 2.0, 1.0, 1.0, 2.0]);
        assert!(grid.nodata().unwrap().is_nan());
        assert_eq!(grid.dtype(), DataType::Float32);
    }

    #[test]
    fn test_gaps_take_fill_value() {
        let a = constant(1.0, 0.0, 1.0, 1, 1.0);
        let b = constant(2.0, 2.0, 1.0, 1, 1.0);
        let (nan_out, _) =
            merge_rasters(&[a.clone(), b.clone()], None, MergeNodata::Nan, Resampling::Nearest).unwrap();
        assert!(nan_out.get(0, 0, 1).is_nan());
        let (zero_out, grid) = merge_rasters(&[a, b], None, MergeNodata::Zero, Resampling::Nearest).unwrap();
        assert_eq!(zero_out.data(), &[1.0, 0.0, 2.0]);
        assert!(grid.nodata().unwrap().is_nan());
    }

    #[test]
    fn test_source_nodata_is_not_painted() {
        let (mut buf, grid) = constant(5.0, 0.0, 1.0, 1, 1.0);
        buf.set(0, 0, 0, -32768.0);
        let masked = (buf, grid.with_nodata(Some(-32768.0)));
        let backup = constant(7.0, 0.0, 1.0, 1, 1.0);
        let (out, _) = merge_rasters(&[masked, backup], None, MergeNodata::Nan, Resampling::Nearest).unwrap();
        assert_eq!(out.data(), &[7.0]);
    }

    #[test]
    fn test_misaligned_input_is_resampled() {
        let a = constant(1.0, 0.0, 2.0, 2, 1.0);
        // Half a pixel off the output lattice.
        let b = constant(3.0, 1.5, 2.0, 2, 1.0);
        let (out, grid) = merge_rasters(&[a, b], None, MergeNodata::Nan, Resampling::Nearest).unwrap();
        assert_eq!(grid.width(), 4);
        assert_eq!(out.get(0, 0, 1), 1.0);
        assert_eq!(out.get(0, 0, 2), 3.0);
    }

    #[test]
    fn test_crop_outside_union_fails() {
        let a = constant(1.0, 0.0, 2.0, 2, 1.0);
        let err = merge_rasters(
            &[a],
            Some(&BoundingBox::new(10.0, 0.0, 11.0, 1.0)),
            MergeNodata::Nan,
            Resampling::Nearest,
        )
        .unwrap_err();
        assert!(matches!(err, StitchError::NoOverlap(_)));
    }

    #[test]
    fn test_crs_mismatch() {
        let a = constant(1.0, 0.0, 2.0, 2, 1.0);
        let (buf, grid) = constant(1.0, 2.0, 2.0, 2, 1.0);
        let b = (buf, grid.with_crs(Crs::Nad83));
        assert!(matches!(
            merge_rasters(&[a, b], None, MergeNodata::Nan, Resampling::Nearest),
            Err(StitchError::CrsMismatch { .. })
        ));
    }
}
