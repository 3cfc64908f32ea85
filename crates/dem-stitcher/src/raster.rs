//! In-memory rasters: pixel buffers and their georeferencing.

use crate::bounds::BoundingBox;
use crate::transform::Affine;
use crate::{Result, StitchError};
use std::fmt;
use std::str::FromStr;

/// A pixel buffer paired with its grid.
pub type Raster = (RasterBuffer, RasterGrid);

/// Whether pixel coordinates refer to the cell corner or the cell centre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelRegistration {
    /// Values cover the cell; the transform origin is the cell's upper-left corner.
    #[default]
    Area,
    /// Values are sampled at the cell centre.
    Point,
}

impl FromStr for PixelRegistration {
    type Err = StitchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Area" | "area" => Ok(PixelRegistration::Area),
            "Point" | "point" => Ok(PixelRegistration::Point),
            other => Err(StitchError::InvalidConfiguration(format!(
                "pixel registration must be 'Area' or 'Point', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for PixelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelRegistration::Area => write!(f, "Area"),
            PixelRegistration::Point => write!(f, "Point"),
        }
    }
}

/// Coordinate reference system, identified by EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crs {
    /// WGS 84 geographic (EPSG:4326).
    Wgs84,
    /// NAD83 geographic (EPSG:4269).
    Nad83,
    /// Any other EPSG code. Carried through I/O but rejected by reprojection.
    Epsg(u32),
}

impl Crs {
    /// Map an EPSG code to a CRS.
    pub fn from_epsg(code: u32) -> Self {
        match code {
            4326 => Crs::Wgs84,
            4269 => Crs::Nad83,
            other => Crs::Epsg(other),
        }
    }

    /// EPSG code.
    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::Nad83 => 4269,
            Crs::Epsg(code) => *code,
        }
    }

    /// True for the two geographic datums the pipeline can transform between.
    pub fn is_supported(&self) -> bool {
        matches!(self, Crs::Wgs84 | Crs::Nad83)
    }

    /// Fail with [`StitchError::UnsupportedCrs`] unless supported.
    pub fn ensure_supported(&self) -> Result<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(StitchError::UnsupportedCrs(self.epsg()))
        }
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// Element type of the source raster.
///
/// Buffers are always held as `f32`; this records what the data was read from
/// (or will be written as).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Unsigned 8-bit integer.
    UInt8,
    /// Signed 8-bit integer.
    Int8,
    /// Unsigned 16-bit integer.
    UInt16,
    /// Signed 16-bit integer, as in SRTM/NASADEM HGT tiles.
    Int16,
    /// Unsigned 32-bit integer.
    UInt32,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// Signed 64-bit integer.
    Int64,
    /// 32-bit float, the type of every stitched output.
    Float32,
    /// 64-bit float.
    Float64,
}

impl DataType {
    /// True for floating point types.
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }
}

/// Target pixel size in CRS units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    /// Pixel width.
    pub x: f64,
    /// Pixel height (positive).
    pub y: f64,
}

impl Resolution {
    /// Resolution with independent x and y sizes.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Square pixels.
    pub fn square(size: f64) -> Self {
        Self { x: size, y: size }
    }

    /// As an `(x, y)` tuple.
    pub fn as_tuple(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    /// Larger of the two sizes.
    pub fn max(&self) -> f64 {
        self.x.max(self.y)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.x > 0.0 && self.y > 0.0 && self.x.is_finite() && self.y.is_finite() {
            Ok(())
        } else {
            Err(StitchError::InvalidConfiguration(format!(
                "resolution must be positive, got ({}, {})",
                self.x, self.y
            )))
        }
    }
}

impl From<f64> for Resolution {
    fn from(size: f64) -> Self {
        Resolution::square(size)
    }
}

impl From<(f64, f64)> for Resolution {
    fn from((x, y): (f64, f64)) -> Self {
        Resolution::new(x, y)
    }
}

/// Georeferencing for a raster buffer (the "profile").
///
/// Grids are values: every operation that changes one returns a new grid.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterGrid {
    width: usize,
    height: usize,
    transform: Affine,
    crs: Crs,
    dtype: DataType,
    nodata: Option<f64>,
    band_count: usize,
}

impl RasterGrid {
    /// Single-band `Float32` grid with no nodata value.
    pub fn new(width: usize, height: usize, transform: Affine, crs: Crs) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(StitchError::InvalidGrid(format!(
                "dimensions must be positive, got {}x{}",
                width, height
            )));
        }
        if transform.a == 0.0 || transform.e == 0.0 || transform.inverse().is_none() {
            return Err(StitchError::InvalidGrid(format!(
                "transform has a zero pixel size: {:?}",
                transform
            )));
        }
        Ok(Self {
            width,
            height,
            transform,
            crs,
            dtype: DataType::Float32,
            nodata: None,
            band_count: 1,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Pixel-to-world transform.
    pub fn transform(&self) -> &Affine {
        &self.transform
    }

    /// Coordinate reference system.
    pub fn crs(&self) -> Crs {
        self.crs
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Nodata sentinel, if any.
    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// Number of bands.
    pub fn band_count(&self) -> usize {
        self.band_count
    }

    /// Shape as `(bands, rows, cols)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.band_count, self.height, self.width)
    }

    /// Pixel size `(x, y)`, both positive.
    pub fn resolution(&self) -> (f64, f64) {
        self.transform.resolution()
    }

    /// Footprint of the grid.
    pub fn bounds(&self) -> BoundingBox {
        self.transform.array_bounds(self.height, self.width)
    }

    /// Copy with a different transform.
    pub fn with_transform(&self, transform: Affine) -> Self {
        Self {
            transform,
            ..self.clone()
        }
    }

    /// Copy with different dimensions.
    pub fn with_shape(&self, width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            ..self.clone()
        }
    }

    /// Copy with a different CRS.
    pub fn with_crs(&self, crs: Crs) -> Self {
        Self { crs, ..self.clone() }
    }

    /// Copy with a different element type.
    pub fn with_dtype(&self, dtype: DataType) -> Self {
        Self {
            dtype,
            ..self.clone()
        }
    }

    /// Copy with a different nodata sentinel.
    pub fn with_nodata(&self, nodata: Option<f64>) -> Self {
        Self {
            nodata,
            ..self.clone()
        }
    }

    /// Copy with a different band count.
    pub fn with_band_count(&self, band_count: usize) -> Self {
        Self {
            band_count,
            ..self.clone()
        }
    }

    /// True when `value` holds data under this grid's nodata rule.
    ///
    /// NaN is never valid. A NaN sentinel therefore only masks NaN.
    pub fn is_valid(&self, value: f32) -> bool {
        if value.is_nan() {
            return false;
        }
        match self.nodata {
            Some(nodata) if !nodata.is_nan() => value != nodata as f32,
            _ => true,
        }
    }
}

/// A `bands x rows x cols` array of `f32`, band-major then row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBuffer {
    data: Vec<f32>,
    bands: usize,
    height: usize,
    width: usize,
}

impl RasterBuffer {
    /// Wrap existing data. Fails if the length does not match the shape.
    pub fn new(bands: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != bands * height * width {
            return Err(StitchError::ShapeMismatch {
                buffer: (data.len(), 1, 1),
                grid: (bands, height, width),
            });
        }
        Ok(Self {
            data,
            bands,
            height,
            width,
        })
    }

    /// Buffer with every element set to `value`.
    pub fn filled(bands: usize, height: usize, width: usize, value: f32) -> Self {
        Self {
            data: vec![value; bands * height * width],
            bands,
            height,
            width,
        }
    }

    /// Single-band buffer built from rows.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let height = rows.len();
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|r| r.len() != width) {
            return Err(StitchError::InvalidGrid("rows have unequal lengths".to_string()));
        }
        Self::new(1, height, width, rows.concat())
    }

    /// Shape as `(bands, rows, cols)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.bands, self.height, self.width)
    }

    /// Number of bands.
    pub fn bands(&self) -> usize {
        self.bands
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Value at `(band, row, col)`.
    pub fn get(&self, band: usize, row: usize, col: usize) -> f32 {
        self.data[self.index(band, row, col)]
    }

    /// Set the value at `(band, row, col)`.
    pub fn set(&mut self, band: usize, row: usize, col: usize, value: f32) {
        let idx = self.index(band, row, col);
        self.data[idx] = value;
    }

    /// One band as a row-major slice.
    pub fn band(&self, band: usize) -> &[f32] {
        let len = self.height * self.width;
        &self.data[band * len..(band + 1) * len]
    }

    /// One band as a mutable row-major slice.
    pub fn band_mut(&mut self, band: usize) -> &mut [f32] {
        let len = self.height * self.width;
        &mut self.data[band * len..(band + 1) * len]
    }

    /// All data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// All data, mutable.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consume the buffer, returning its data.
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Rows `row_off..row_off + height` and columns `col_off..col_off + width` of every band.
    pub fn slice(&self, row_off: usize, col_off: usize, height: usize, width: usize) -> RasterBuffer {
        let mut data = Vec::with_capacity(self.bands * height * width);
        for band in 0..self.bands {
            let src = self.band(band);
            for row in row_off..row_off + height {
                let start = row * self.width + col_off;
                data.extend_from_slice(&src[start..start + width]);
            }
        }
        RasterBuffer {
            data,
            bands: self.bands,
            height,
            width,
        }
    }

    /// Fail unless this buffer has the shape `grid` describes.
    pub fn check_matches(&self, grid: &RasterGrid) -> Result<()> {
        if self.shape() != grid.shape() {
            return Err(StitchError::ShapeMismatch {
                buffer: self.shape(),
                grid: grid.shape(),
            });
        }
        Ok(())
    }

    fn index(&self, band: usize, row: usize, col: usize) -> usize {
        (band * self.height + row) * self.width + col
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> RasterGrid {
        RasterGrid::new(4, 3, Affine::from_origin(10.0, 0.0, 1.0, 1.0), Crs::Wgs84).unwrap()
    }

    #[test]
    fn test_grid_rejects_degenerate() {
        assert!(RasterGrid::new(0, 3, Affine::identity(), Crs::Wgs84).is_err());
        assert!(RasterGrid::new(3, 3, Affine::scale(1.0, 0.0), Crs::Wgs84).is_err());
    }

    #[test]
    fn test_with_methods_leave_original_untouched() {
        let g = grid();
        let shifted = g.with_transform(Affine::from_origin(11.0, 0.0, 1.0, 1.0));
        assert_eq!(g.transform().c, 10.0);
        assert_eq!(shifted.transform().c, 11.0);
        assert_eq!(shifted.width(), g.width());
    }

    #[test]
    fn test_bounds_and_resolution() {
        let g = grid();
        assert_eq!(g.bounds(), BoundingBox::new(10.0, -3.0, 14.0, 0.0));
        assert_eq!(g.resolution(), (1.0, 1.0));
        assert_eq!(g.shape(), (1, 3, 4));
    }

    #[test]
    fn test_validity_rules() {
        let g = grid();
        assert!(g.is_valid(1.0));
        assert!(!g.is_valid(f32::NAN));

        let g = g.with_nodata(Some(-32768.0));
        assert!(!g.is_valid(-32768.0));
        assert!(g.is_valid(0.0));

        let g = g.with_nodata(Some(f64::NAN));
        assert!(g.is_valid(-32768.0));
        assert!(!g.is_valid(f32::NAN));
    }

    #[test]
    fn test_buffer_shape_checks() {
        assert!(RasterBuffer::new(1, 2, 2, vec![0.0; 3]).is_err());
        let buf = RasterBuffer::filled(1, 3, 4, 0.0);
        assert!(buf.check_matches(&grid()).is_ok());
        assert!(buf.check_matches(&grid().with_shape(3, 3)).is_err());
    }

    #[test]
    fn test_slice() {
        let buf = RasterBuffer::from_rows(&[
            vec![0.0, 1.0, 2.0],
            vec![3.0, 4.0, 5.0],
            vec![6.0, 7.0, 8.0],
        ])
        .unwrap();
        let sub = buf.slice(1, 1, 2, 2);
        assert_eq!(sub.data(), &[4.0, 5.0, 7.0, 8.0]);
    }

    #[test]
    fn test_registration_parse() {
        assert_eq!("Point".parse::<PixelRegistration>().unwrap(), PixelRegistration::Point);
        assert_eq!("area".parse::<PixelRegistration>().unwrap(), PixelRegistration::Area);
        assert!("corner".parse::<PixelRegistration>().is_err());
    }

    #[test]
    fn test_data_type_float_flags() {
        assert!(DataType::Float32.is_float());
        assert!(DataType::Float64.is_float());
        assert!(!DataType::Int16.is_float());
        assert!(!DataType::UInt64.is_float());
        // Stitched output is always Float32.
        assert_eq!(grid().with_dtype(DataType::Float32).dtype(), DataType::Float32);
    }

    #[test]
    fn test_crs_codes() {
        assert_eq!(Crs::from_epsg(4326), Crs::Wgs84);
        assert_eq!(Crs::from_epsg(4269), Crs::Nad83);
        assert!(Crs::from_epsg(32611).ensure_supported().is_err());
    }
}
