//! Affine geotransforms mapping pixel (col, row) to geographic (x, y).
//!
//! Coefficients follow the usual raster convention:
//!
//! ```text
//! x = a * col + b * row + c
//! y = d * col + e * row + f
//! ```
//!
//! For north-up rasters `b == d == 0`, `a` is the pixel width and `e` is the
//! (negative) pixel height, so `(c, f)` is the upper-left corner of the raster.

use crate::bounds::BoundingBox;
use std::ops::Mul;

/// Pixel offsets closer than this to an integer are snapped before floor/ceil.
pub const ROWCOL_SNAP_EPSILON: f64 = 1e-9;

/// Rounding used when converting coordinates to pixel indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Round towards negative infinity.
    Floor,
    /// Round towards positive infinity.
    Ceil,
}

impl Rounding {
    fn apply(self, value: f64) -> i64 {
        let nearest = value.round();
        if (value - nearest).abs() < ROWCOL_SNAP_EPSILON {
            return nearest as i64;
        }
        match self {
            Rounding::Floor => value.floor() as i64,
            Rounding::Ceil => value.ceil() as i64,
        }
    }
}

/// Six-coefficient affine transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    /// Pixel width (x change per column).
    pub a: f64,
    /// Row rotation term.
    pub b: f64,
    /// X of the upper-left corner.
    pub c: f64,
    /// Column rotation term.
    pub d: f64,
    /// Pixel height (y change per row, negative for north-up).
    pub e: f64,
    /// Y of the upper-left corner.
    pub f: f64,
}

impl Affine {
    /// Create a transform from its six coefficients.
    pub const fn new(a: f64, b: f64, c: f64, d: f64, e: f64, f: f64) -> Self {
        Self { a, b, c, d, e, f }
    }

    /// The identity transform.
    pub const fn identity() -> Self {
        Self::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0)
    }

    /// Pure translation by `(x, y)`.
    pub const fn translation(x: f64, y: f64) -> Self {
        Self::new(1.0, 0.0, x, 0.0, 1.0, y)
    }

    /// Pure scaling by `(sx, sy)`.
    pub const fn scale(sx: f64, sy: f64) -> Self {
        Self::new(sx, 0.0, 0.0, 0.0, sy, 0.0)
    }

    /// North-up transform with the upper-left corner at `(west, north)`.
    pub const fn from_origin(west: f64, north: f64, xres: f64, yres: f64) -> Self {
        Self::new(xres, 0.0, west, 0.0, -yres, north)
    }

    /// Map pixel coordinates `(col, row)` to world coordinates.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.a * col + self.b * row + self.c,
            self.d * col + self.e * row + self.f,
        )
    }

    /// Determinant of the linear part.
    pub fn determinant(&self) -> f64 {
        self.a * self.e - self.b * self.d
    }

    /// True when the transform has no rotation or shear terms.
    pub fn is_rectilinear(&self) -> bool {
        self.b == 0.0 && self.d == 0.0
    }

    /// Inverse transform, or `None` when the transform is degenerate.
    pub fn inverse(&self) -> Option<Affine> {
        let det = self.determinant();
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let ra = self.e / det;
        let rb = -self.b / det;
        let rd = -self.d / det;
        let re = self.a / det;
        Some(Affine::new(
            ra,
            rb,
            -self.c * ra - self.f * rb,
            rd,
            re,
            -self.c * rd - self.f * re,
        ))
    }

    /// Pixel sizes `(|a|, |e|)`.
    pub fn resolution(&self) -> (f64, f64) {
        (self.a.abs(), self.e.abs())
    }

    /// Compose with another transform (`self` applied after `other`).
    pub fn compose(&self, other: &Affine) -> Affine {
        Affine::new(
            self.a * other.a + self.b * other.d,
            self.a * other.b + self.b * other.e,
            self.a * other.c + self.b * other.f + self.c,
            self.d * other.a + self.e * other.d,
            self.d * other.b + self.e * other.e,
            self.d * other.c + self.e * other.f + self.f,
        )
    }

    /// Move the origin by a number of pixels, keeping the pixel scale.
    ///
    /// The new origin is `self * (col_shift, row_shift)`; the result is
    /// `translation(origin) * scale(a, e)`.
    pub fn translate_pixels(&self, col_shift: f64, row_shift: f64) -> Affine {
        let (x, y) = self.apply(col_shift, row_shift);
        Affine::translation(x, y).compose(&Affine::scale(self.a, self.e))
    }

    /// Pixel indices `(row, col)` containing world point `(x, y)`.
    ///
    /// Fractional indices are rounded with `op`; values within
    /// [`ROWCOL_SNAP_EPSILON`] of an integer snap to it first.
    pub fn rowcol(&self, x: f64, y: f64, op: Rounding) -> Option<(i64, i64)> {
        let inv = self.inverse()?;
        let (col, row) = inv.apply(x, y);
        Some((op.apply(row), op.apply(col)))
    }

    /// World coordinates of the centre of pixel `(row, col)`.
    pub fn xy(&self, row: usize, col: usize) -> (f64, f64) {
        self.apply(col as f64 + 0.5, row as f64 + 0.5)
    }

    /// Bounds of a `height x width` raster under this transform.
    pub fn array_bounds(&self, height: usize, width: usize) -> BoundingBox {
        let corners = [
            self.apply(0.0, 0.0),
            self.apply(width as f64, 0.0),
            self.apply(0.0, height as f64),
            self.apply(width as f64, height as f64),
        ];
        let mut xmin = f64::INFINITY;
        let mut ymin = f64::INFINITY;
        let mut xmax = f64::NEG_INFINITY;
        let mut ymax = f64::NEG_INFINITY;
        for (x, y) in corners {
            xmin = xmin.min(x);
            ymin = ymin.min(y);
            xmax = xmax.max(x);
            ymax = ymax.max(y);
        }
        BoundingBox::new(xmin, ymin, xmax, ymax)
    }
}

impl Default for Affine {
    fn default() -> Self {
        Self::identity()
    }
}

impl Mul for Affine {
    type Output = Affine;

    fn mul(self, rhs: Affine) -> Affine {
        self.compose(&rhs)
    }
}

/// Grid aligned to multiples of `resolution` that covers the given raster.
///
/// Edges are snapped outward so that `xmin`, `xmax`, `ymin`, `ymax` all land
/// on integer multiples of the target pixel size. Returns the new transform
/// and `(width, height)`.
pub fn aligned_target(
    transform: &Affine,
    width: usize,
    height: usize,
    resolution: (f64, f64),
) -> (Affine, usize, usize) {
    let (xres, yres) = resolution;
    let bounds = transform.array_bounds(height, width);

    let xmin = (bounds.xmin / xres).floor() * xres;
    let xmax = (bounds.xmax / xres).ceil() * xres;
    let ymin = (bounds.ymin / yres).floor() * yres;
    let ymax = (bounds.ymax / yres).ceil() * yres;

    let dst_transform = Affine::new(xres, 0.0, xmin, 0.0, -yres, ymax);
    let dst_width = (((xmax - xmin) / xres).round() as usize).max(1);
    let dst_height = (((ymax - ymin) / yres).round() as usize).max(1);
    (dst_transform, dst_width, dst_height)
}
