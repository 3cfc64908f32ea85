//! Pixel windows covering geographic extents.

use crate::bounds::BoundingBox;
use crate::geotiff::GeoTiffReader;
use crate::raster::{Crs, PixelRegistration, Raster, RasterBuffer, RasterGrid};
use crate::transform::{Affine, Rounding};
use crate::warp::transform_bounds;
use crate::{Result, StitchError};
use std::io::{Read, Seek};
use tracing::warn;

/// A rectangular block of pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    /// First row.
    pub row_off: usize,
    /// First column.
    pub col_off: usize,
    /// Number of rows.
    pub height: usize,
    /// Number of columns.
    pub width: usize,
}

impl PixelWindow {
    /// Create a window.
    pub fn new(row_off: usize, col_off: usize, height: usize, width: usize) -> Self {
        Self {
            row_off,
            col_off,
            height,
            width,
        }
    }

    /// Window covering a whole `height x width` raster.
    pub fn full(height: usize, width: usize) -> Self {
        Self::new(0, 0, height, width)
    }

    /// Window spanning `(row, col)` corners, upper-left inclusive and lower-right exclusive.
    pub fn from_corners(upper_left: (usize, usize), lower_right: (usize, usize)) -> Self {
        let (row_start, col_start) = upper_left;
        let (row_stop, col_stop) = lower_right;
        Self::new(
            row_start,
            col_start,
            row_stop.saturating_sub(row_start),
            col_stop.saturating_sub(col_start),
        )
    }

    /// True when the window has no pixels.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Transform of the window given the transform of its parent raster.
    ///
    /// Derived by pixel arithmetic so repeated crops stay exact.
    pub fn transform(&self, parent: &Affine) -> Affine {
        parent.translate_pixels(self.col_off as f64, self.row_off as f64)
    }

    /// Grid of the window given its parent's grid.
    pub fn grid(&self, parent: &RasterGrid) -> RasterGrid {
        parent
            .with_transform(self.transform(parent.transform()))
            .with_shape(self.width, self.height)
    }
}

/// Pixel indices `((row_start, col_start), (row_stop, col_stop))` covering `extent`.
///
/// The upper-left corner is floored and the lower-right corner ceiled so the
/// window never shrinks below the extent, then each side grows by
/// `res_buffer` pixels. Indices are clamped at zero and, when `shape` is
/// given as `(rows, cols)`, at the raster size.
pub fn get_indices_from_extent(
    transform: &Affine,
    extent: &BoundingBox,
    shape: Option<(usize, usize)>,
    res_buffer: usize,
) -> Result<((usize, usize), (usize, usize))> {
    let degenerate = || StitchError::InvalidGrid(format!("transform is not invertible: {:?}", transform));
    let (row_ul, col_ul) = transform
        .rowcol(extent.xmin, extent.ymax, Rounding::Floor)
        .ok_or_else(degenerate)?;
    let (row_br, col_br) = transform
        .rowcol(extent.xmax, extent.ymin, Rounding::Ceil)
        .ok_or_else(degenerate)?;

    let buffer = res_buffer as i64;
    let row_start = (row_ul - buffer).max(0) as usize;
    let col_start = (col_ul - buffer).max(0) as usize;
    let mut row_stop = (row_br + buffer).max(0) as usize;
    let mut col_stop = (col_br + buffer).max(0) as usize;
    if let Some((rows, cols)) = shape {
        row_stop = row_stop.min(rows);
        col_stop = col_stop.min(cols);
    }
    Ok(((row_start, col_start), (row_stop, col_stop)))
}

/// Window chosen for an extent, and whether the extent had to be clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentWindow {
    /// Pixels to read.
    pub window: PixelWindow,
    /// True when the requested extent reached past the raster and was clamped.
    pub clamped: bool,
}

/// Pixel window of `grid` covering `extent` (given in `extent_crs`).
pub fn window_from_extent(
    grid: &RasterGrid,
    extent: &BoundingBox,
    extent_crs: Crs,
    res_buffer: usize,
) -> Result<ExtentWindow> {
    if !extent.is_well_ordered() {
        return Err(StitchError::InvalidExtent {
            xmin: extent.xmin,
            ymin: extent.ymin,
            xmax: extent.xmax,
            ymax: extent.ymax,
        });
    }

    let native = transform_bounds(extent, extent_crs, grid.crs())?;
    let raster_bounds = grid.bounds();
    let overlap = native
        .intersection(&raster_bounds)
        .filter(BoundingBox::has_area)
        .ok_or_else(|| {
            StitchError::NoOverlap(format!("extent {} vs raster {}", native, raster_bounds))
        })?;

    let clamped = !raster_bounds.contains(&native);
    if clamped {
        warn!(
            extent = %native,
            raster = %raster_bounds,
            "Requested extent is not contained in the raster; shrinking to the raster bounds"
        );
    }

    let (upper_left, lower_right) = get_indices_from_extent(
        grid.transform(),
        &overlap,
        Some((grid.height(), grid.width())),
        res_buffer,
    )?;
    let window = PixelWindow::from_corners(upper_left, lower_right);
    if window.is_empty() {
        return Err(StitchError::NoOverlap(format!(
            "extent {} selects no pixels of raster {}",
            overlap, raster_bounds
        )));
    }
    Ok(ExtentWindow { window, clamped })
}

/// A raster that can be read one window at a time.
pub trait WindowedRaster {
    /// Georeferencing of the full raster.
    fn grid(&self) -> &RasterGrid;

    /// Registration convention of the stored values.
    fn registration(&self) -> PixelRegistration {
        PixelRegistration::Area
    }

    /// Read `window` from every band.
    fn read_pixels(&mut self, window: PixelWindow) -> Result<RasterBuffer>;
}

impl<R: Read + Seek> WindowedRaster for GeoTiffReader<R> {
    fn grid(&self) -> &RasterGrid {
        GeoTiffReader::grid(self)
    }

    fn registration(&self) -> PixelRegistration {
        GeoTiffReader::registration(self)
    }

    fn read_pixels(&mut self, window: PixelWindow) -> Result<RasterBuffer> {
        self.read_window(window)
    }
}

/// A raster already in memory.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    buffer: RasterBuffer,
    grid: RasterGrid,
    registration: PixelRegistration,
}

impl MemoryRaster {
    /// Wrap a buffer and its grid. Fails if their shapes disagree.
    pub fn new(buffer: RasterBuffer, grid: RasterGrid) -> Result<Self> {
        buffer.check_matches(&grid)?;
        Ok(Self {
            buffer,
            grid,
            registration: PixelRegistration::Area,
        })
    }

    /// Copy with a different registration convention.
    pub fn with_registration(mut self, registration: PixelRegistration) -> Self {
        self.registration = registration;
        self
    }

    /// Unwrap into buffer and grid.
    pub fn into_parts(self) -> Raster {
        (self.buffer, self.grid)
    }
}

impl WindowedRaster for MemoryRaster {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn registration(&self) -> PixelRegistration {
        self.registration
    }

    fn read_pixels(&mut self, window: PixelWindow) -> Result<RasterBuffer> {
        if window.row_off + window.height > self.grid.height()
            || window.col_off + window.width > self.grid.width()
        {
            return Err(StitchError::InvalidGrid(format!(
                "window {:?} outside {}x{} raster",
                window,
                self.grid.width(),
                self.grid.height()
            )));
        }
        Ok(self
            .buffer
            .slice(window.row_off, window.col_off, window.height, window.width))
    }
}

/// Read the part of `raster` covering `extent`, plus `res_buffer` pixels on each side.
///
/// Extents reaching past the raster are clamped with a warning; extents that
/// share no area with it fail with [`StitchError::NoOverlap`].
pub fn read_window<W: WindowedRaster + ?Sized>(
    raster: &mut W,
    extent: &BoundingBox,
    extent_crs: Crs,
    res_buffer: usize,
) -> Result<Raster> {
    let selected = window_from_extent(raster.grid(), extent, extent_crs, res_buffer)?;
    let grid = selected.window.grid(raster.grid());
    let buffer = raster.read_pixels(selected.window)?;
    Ok((buffer, grid))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t() -> Affine {
        Affine::new(1.0, 0.0, 10.0, 0.0, -1.0, 0.0)
    }

    #[test]
    fn test_indices_with_buffer_and_shape() {
        let extent = BoundingBox::new(9.5, -10.5, 20.5, 0.5);
        assert_eq!(
            get_indices_from_extent(&t(), &extent, None, 0).unwrap(),
            ((0, 0), (11, 11))
        );
        assert_eq!(
            get_indices_from_extent(&t(), &extent, None, 1).unwrap(),
            ((0, 0), (12, 12))
        );
        assert_eq!(
            get_indices_from_extent(&t(), &extent, Some((12, 10)), 1).unwrap(),
            ((0, 0), (12, 10))
        );
    }

    #[test]
    fn test_indices_round_outward() {
        let extent = BoundingBox::new(11.5, -8.5, 18.5, -1.5);
        assert_eq!(
            get_indices_from_extent(&t(), &extent, None, 0).unwrap(),
            ((1, 1), (9, 9))
        );
    }

    #[test]
    fn test_window_grid_is_exact() {
        let grid = RasterGrid::new(10, 10, t(), Crs::Wgs84).unwrap();
        let window = PixelWindow::new(1, 2, 7, 6);
        let sub = window.grid(&grid);
        assert_eq!(*sub.transform(), Affine::new(1.0, 0.0, 12.0, 0.0, -1.0, -1.0));
        assert_eq!((sub.width(), sub.height()), (6, 7));
    }

    #[test]
    fn test_unordered_extent_rejected() {
        let grid = RasterGrid::new(10, 10, t(), Crs::Wgs84).unwrap();
        let err = window_from_extent(&grid, &BoundingBox::new(15.0, -5.0, 15.0, -1.0), Crs::Wgs84, 0)
            .unwrap_err();
        assert!(matches!(err, StitchError::InvalidExtent { .. }));
    }

    #[test]
    fn test_disjoint_and_touching_extents() {
        let grid = RasterGrid::new(10, 10, t(), Crs::Wgs84).unwrap();
        let disjoint = window_from_extent(&grid, &BoundingBox::new(40.0, -5.0, 41.0, -1.0), Crs::Wgs84, 0);
        assert!(matches!(disjoint, Err(StitchError::NoOverlap(_))));
        // Shares only the x = 20 edge.
        let touching = window_from_extent(&grid, &BoundingBox::new(20.0, -5.0, 21.0, -1.0), Crs::Wgs84, 0);
        assert!(matches!(touching, Err(StitchError::NoOverlap(_))));
    }

    #[test]
    fn test_clamp_flag() {
        let grid = RasterGrid::new(10, 10, t(), Crs::Wgs84).unwrap();
        let inside = window_from_extent(&grid, &BoundingBox::new(10.5, -9.5, 19.5, -0.5), Crs::Wgs84, 0).unwrap();
        assert!(!inside.clamped);
        let outside = window_from_extent(&grid, &BoundingBox::new(9.5, -10.5, 20.5, 0.5), Crs::Wgs84, 0).unwrap();
        assert!(outside.clamped);
        assert_eq!(outside.window, PixelWindow::full(10, 10));
    }

    #[test]
    fn test_unsupported_extent_crs() {
        let grid = RasterGrid::new(10, 10, t(), Crs::Wgs84).unwrap();
        let err = window_from_extent(&grid, &BoundingBox::new(11.0, -5.0, 12.0, -1.0), Crs::Epsg(3857), 0)
            .unwrap_err();
        assert!(matches!(err, StitchError::UnsupportedCrs(3857)));
    }
}
