//! Reprojection and resampling between raster grids.
//!
//! Only the two geographic datums the source datasets use are supported.
//! At the resolutions involved here they are treated as interchangeable, so
//! coordinates pass between them unchanged; any other CRS is rejected.
//!
//! Resampling works per destination pixel: its centre is mapped into the
//! source grid and sampled with the chosen kernel. Rows are processed in
//! parallel on the current rayon pool.

use crate::bounds::BoundingBox;
use crate::raster::{Crs, DataType, RasterBuffer, RasterGrid};
use crate::transform::Affine;
use crate::{Result, StitchError};
use rayon::prelude::*;

/// Fractional offsets closer than this to a pixel centre are snapped to it.
const CENTRE_SNAP_EPSILON: f64 = 1e-9;

/// Resampling kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
    /// Value of the source pixel containing the sample point.
    #[default]
    Nearest,
    /// Distance-weighted mean of the four nearest valid source pixels.
    Bilinear,
}

fn check_supported(src: Crs, dst: Crs) -> Result<()> {
    src.ensure_supported()?;
    dst.ensure_supported()
}

/// Transform a point between supported CRSs.
pub fn transform_point(x: f64, y: f64, src: Crs, dst: Crs) -> Result<(f64, f64)> {
    check_supported(src, dst)?;
    Ok((x, y))
}

/// Transform a box between supported CRSs.
pub fn transform_bounds(bounds: &BoundingBox, src: Crs, dst: Crs) -> Result<BoundingBox> {
    if src == dst {
        return Ok(*bounds);
    }
    check_supported(src, dst)?;
    let (xmin, ymin) = transform_point(bounds.xmin, bounds.ymin, src, dst)?;
    let (xmax, ymax) = transform_point(bounds.xmax, bounds.ymax, src, dst)?;
    Ok(BoundingBox::new(xmin, ymin, xmax, ymax))
}

/// Default output transform and `(width, height)` for reprojecting `grid` to `dst_crs`.
///
/// The output covers the transformed bounds with square pixels whose size
/// preserves the source's pixel count along the diagonal.
pub fn calculate_default_transform(grid: &RasterGrid, dst_crs: Crs) -> Result<(Affine, usize, usize)> {
    let bounds = transform_bounds(&grid.bounds(), grid.crs(), dst_crs)?;
    let diagonal_pixels = ((grid.width() as f64).powi(2) + (grid.height() as f64).powi(2)).sqrt();
    let diagonal_extent = (bounds.width().powi(2) + bounds.height().powi(2)).sqrt();
    let res = diagonal_extent / diagonal_pixels;

    let width = ((bounds.width() / res + 0.5) as usize).max(1);
    let height = ((bounds.height() / res + 0.5) as usize).max(1);
    Ok((Affine::from_origin(bounds.xmin, bounds.ymax, res, res), width, height))
}

/// Resample `src` onto `dst_grid`.
///
/// Destination pixels with no valid source data get `dst_nodata`, or the
/// source nodata, or NaN, in that order of preference. The returned buffer
/// has the source's band count.
pub fn reproject(
    src: &RasterBuffer,
    src_grid: &RasterGrid,
    dst_grid: &RasterGrid,
    resampling: Resampling,
    dst_nodata: Option<f64>,
) -> Result<RasterBuffer> {
    src.check_matches(src_grid)?;
    check_supported(src_grid.crs(), dst_grid.crs())?;

    let inverse = src_grid.transform().inverse().ok_or_else(|| {
        StitchError::InvalidGrid(format!("source transform is not invertible: {:?}", src_grid.transform()))
    })?;
    let fill = dst_nodata.or(src_grid.nodata()).unwrap_or(f64::NAN) as f32;

    let (dst_w, dst_h) = (dst_grid.width(), dst_grid.height());
    let sampler = Sampler {
        src_grid,
        inverse,
        dst_transform: *dst_grid.transform(),
        resampling,
        fill,
    };

    let mut out = RasterBuffer::filled(src.bands(), dst_h, dst_w, fill);
    for band in 0..src.bands() {
        let src_band = src.band(band);
        out.band_mut(band)
            .par_chunks_mut(dst_w)
            .enumerate()
            .for_each(|(row, line)| {
                for (col, value) in line.iter_mut().enumerate() {
                    *value = sampler.sample(src_band, row, col);
                }
            });
    }
    Ok(out)
}

/// Reproject and return the destination grid with Float32 dtype and the fill nodata.
pub fn reproject_to_grid(
    src: &RasterBuffer,
    src_grid: &RasterGrid,
    dst_grid: &RasterGrid,
    resampling: Resampling,
    dst_nodata: Option<f64>,
) -> Result<(RasterBuffer, RasterGrid)> {
    let buffer = reproject(src, src_grid, dst_grid, resampling, dst_nodata)?;
    let nodata = dst_nodata.or(src_grid.nodata()).or(Some(f64::NAN));
    let grid = dst_grid
        .with_band_count(src.bands())
        .with_dtype(DataType::Float32)
        .with_nodata(nodata);
    Ok((buffer, grid))
}

struct Sampler<'a> {
    src_grid: &'a RasterGrid,
    inverse: Affine,
    dst_transform: Affine,
    resampling: Resampling,
    fill: f32,
}

impl Sampler<'_> {
    fn sample(&self, band: &[f32], row: usize, col: usize) -> f32 {
        let (x, y) = self.dst_transform.xy(row, col);
        let (sc, sr) = self.inverse.apply(x, y);
        let (w, h) = (self.src_grid.width() as f64, self.src_grid.height() as f64);
        if !(sc >= 0.0 && sr >= 0.0 && sc < w && sr < h) {
            return self.fill;
        }
        match self.resampling {
            Resampling::Nearest => self.nearest(band, sc, sr),
            Resampling::Bilinear => self.bilinear(band, sc, sr),
        }
    }

    fn value(&self, band: &[f32], row: usize, col: usize) -> Option<f32> {
        let v = band[row * self.src_grid.width() + col];
        self.src_grid.is_valid(v).then_some(v)
    }

    fn nearest(&self, band: &[f32], sc: f64, sr: f64) -> f32 {
        self.value(band, sr as usize, sc as usize).unwrap_or(self.fill)
    }

    fn bilinear(&self, band: &[f32], sc: f64, sr: f64) -> f32 {
        // Pixel centres sit at integer + 0.5.
        let (x0, fx) = split_fraction(sc - 0.5);
        let (y0, fy) = split_fraction(sr - 0.5);
        let (w, h) = (self.src_grid.width() as i64, self.src_grid.height() as i64);

        let mut total = 0.0f64;
        let mut weight_sum = 0.0f64;
        for (dy, wy) in [(0i64, 1.0 - fy), (1, fy)] {
            for (dx, wx) in [(0i64, 1.0 - fx), (1, fx)] {
                let weight = wx * wy;
                if weight <= 0.0 {
                    continue;
                }
                let (r, c) = (y0 + dy, x0 + dx);
                if r < 0 || c < 0 || r >= h || c >= w {
                    continue;
                }
                if let Some(v) = self.value(band, r as usize, c as usize) {
                    total += weight * v as f64;
                    weight_sum += weight;
                }
            }
        }

        if weight_sum > 0.0 {
            (total / weight_sum) as f32
        } else {
            self.fill
        }
    }
}

/// Integer part and fraction of `v`, snapping fractions within epsilon of 0 or 1.
fn split_fraction(v: f64) -> (i64, f64) {
    let base = v.floor();
    let frac = v - base;
    if frac < CENTRE_SNAP_EPSILON {
        (base as i64, 0.0)
    } else if frac > 1.0 - CENTRE_SNAP_EPSILON {
        (base as i64 + 1, 0.0)
    } else {
        (base as i64, frac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp_grid() -> (RasterBuffer, RasterGrid) {
        let rows: Vec<Vec<f32>> = (0..4)
            .map(|r| (0..4).map(|c| (r * 4 + c) as f32).collect())
            .collect();
        let grid = RasterGrid::new(4, 4, Affine::from_origin(0.0, 4.0, 1.0, 1.0), Crs::Wgs84).unwrap();
        (RasterBuffer::from_rows(&rows).unwrap(), grid)
    }

    #[test]
    fn test_identity_reprojection_is_exact() {
        let (buf, grid) = ramp_grid();
        for kernel in [Resampling::Nearest, Resampling::Bilinear] {
            let out = reproject(&buf, &grid, &grid, kernel, None).unwrap();
            assert_eq!(out, buf, "{:?}", kernel);
        }
    }

    #[test]
    fn test_bilinear_half_pixel_shift() {
        let (buf, grid) = ramp_grid();
        // Destination centres fall halfway between source centres.
        let dst = RasterGrid::new(3, 3, Affine::from_origin(0.5, 3.5, 1.0, 1.0), Crs::Wgs84).unwrap();
        let out = reproject(&buf, &grid, &dst, Resampling::Bilinear, None).unwrap();
        // Mean of source (0,0),(0,1),(1,0),(1,1) = (0 + 1 + 4 + 5) / 4.
        assert_relative_eq!(out.get(0, 0, 0), 2.5);
        assert_relative_eq!(out.get(0, 2, 2), 12.5);
    }

    #[test]
    fn test_bilinear_skips_invalid_neighbours() {
        let (mut buf, grid) = ramp_grid();
        buf.set(0, 0, 0, f32::NAN);
        let dst = RasterGrid::new(1, 1, Affine::from_origin(0.5, 3.5, 1.0, 1.0), Crs::Wgs84).unwrap();
        let out = reproject(&buf, &grid, &dst, Resampling::Bilinear, None).unwrap();
        assert_relative_eq!(out.get(0, 0, 0), (1.0 + 4.0 + 5.0) / 3.0);
    }

    #[test]
    fn test_outside_source_is_fill() {
        let (buf, grid) = ramp_grid();
        let dst = RasterGrid::new(2, 1, Affine::from_origin(3.0, 4.0, 1.0, 1.0), Crs::Wgs84).unwrap();
        let out = reproject(&buf, &grid, &dst, Resampling::Nearest, None).unwrap();
        assert_eq!(out.get(0, 0, 0), 3.0);
        assert!(out.get(0, 0, 1).is_nan());
    }

    #[test]
    fn test_upsample_nearest() {
        let (buf, grid) = ramp_grid();
        let dst = RasterGrid::new(8, 8, Affine::from_origin(0.0, 4.0, 0.5, 0.5), Crs::Wgs84).unwrap();
        let out = reproject(&buf, &grid, &dst, Resampling::Nearest, None).unwrap();
        assert_eq!(out.get(0, 0, 0), 0.0);
        assert_eq!(out.get(0, 0, 1), 0.0);
        assert_eq!(out.get(0, 7, 7), 15.0);
    }

    #[test]
    fn test_default_transform_between_datums() {
        let grid = RasterGrid::new(3600, 3600, Affine::from_origin(-118.0, 35.0, 1.0 / 3600.0, 1.0 / 3600.0), Crs::Nad83)
            .unwrap();
        let (t, w, h) = calculate_default_transform(&grid, Crs::Wgs84).unwrap();
        assert_eq!((w, h), (3600, 3600));
        assert_relative_eq!(t.c, -118.0);
        assert_relative_eq!(t.a, 1.0 / 3600.0, max_relative = 1e-12);
    }

    #[test]
    fn test_unsupported_crs() {
        let (buf, grid) = ramp_grid();
        let utm = grid.with_crs(Crs::Epsg(32611));
        assert!(matches!(
            reproject(&buf, &utm, &grid, Resampling::Nearest, None),
            Err(StitchError::UnsupportedCrs(32611))
        ));
    }
}
