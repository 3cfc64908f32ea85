//! GeoTIFF reading and writing.
//!
//! Reading decodes only the strips or tiles that intersect the requested
//! window, so large rasters (global geoids are ~1 GB) can be sampled without
//! loading them whole. Georeferencing comes from the standard GeoTIFF tags:
//!
//! - ModelPixelScale (33550) + ModelTiepoint (33922), or ModelTransformation (34264)
//! - GeoKeyDirectory (34735) for the EPSG code and raster type (area/point)
//! - GDAL_NODATA (42113) for the nodata sentinel
//!
//! Point-registered files are reported the way GDAL does: the transform is
//! shifted half a pixel so that it always describes cell corners, and the
//! registration is returned alongside.

use crate::raster::{Crs, DataType, PixelRegistration, RasterBuffer, RasterGrid};
use crate::transform::Affine;
use crate::window::PixelWindow;
use crate::{Result, StitchError};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::Gray32Float;
use tiff::encoder::TiffEncoder;
use tiff::tags::Tag;
use tracing::debug;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const KEY_PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const RASTER_PIXEL_IS_POINT: u16 = 2;

/// Decoder limits large enough for 1 arc-second tiles and global geoids.
fn decoder_limits() -> Limits {
    let mut limits = Limits::default();
    limits.decoding_buffer_size = 1024 * 1024 * 1024; // 1 GB
    limits.intermediate_buffer_size = 1024 * 1024 * 1024; // 1 GB
    limits.ifd_value_size = 1024 * 1024 * 1024;
    limits
}

/// Parsed GeoKeyDirectory entries this crate cares about.
#[derive(Debug, Default)]
struct GeoKeys {
    model_type: Option<u16>,
    raster_type: Option<u16>,
    geographic_type: Option<u16>,
    projected_type: Option<u16>,
}

impl GeoKeys {
    fn parse(directory: &[u16]) -> Self {
        let mut keys = GeoKeys::default();
        if directory.len() < 4 {
            return keys;
        }
        let count = directory[3] as usize;
        for entry in directory[4..].chunks_exact(4).take(count) {
            let (key, location, value) = (entry[0], entry[1], entry[3]);
            // Only inline SHORT values are needed.
            if location != 0 {
                continue;
            }
            match key {
                KEY_MODEL_TYPE => keys.model_type = Some(value),
                KEY_RASTER_TYPE => keys.raster_type = Some(value),
                KEY_GEOGRAPHIC_TYPE => keys.geographic_type = Some(value),
                KEY_PROJECTED_CS_TYPE => keys.projected_type = Some(value),
                _ => {}
            }
        }
        keys
    }

    fn crs(&self) -> Option<Crs> {
        match self.model_type {
            Some(MODEL_TYPE_PROJECTED) => self.projected_type.map(|c| Crs::from_epsg(c as u32)),
            _ => self
                .geographic_type
                .or(self.projected_type)
                .map(|c| Crs::from_epsg(c as u32)),
        }
    }

    fn registration(&self) -> PixelRegistration {
        match self.raster_type {
            Some(RASTER_PIXEL_IS_POINT) => PixelRegistration::Point,
            _ => PixelRegistration::Area,
        }
    }
}

/// A GeoTIFF opened for windowed reads.
pub struct GeoTiffReader<R: Read + Seek> {
    decoder: Decoder<R>,
    grid: RasterGrid,
    registration: PixelRegistration,
    samples: usize,
    label: String,
}

impl<R: Read + Seek> std::fmt::Debug for GeoTiffReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoTiffReader")
            .field("label", &self.label)
            .field("grid", &self.grid)
            .field("registration", &self.registration)
            .finish()
    }
}

impl GeoTiffReader<BufReader<File>> {
    /// Open a GeoTIFF file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Self::new(BufReader::new(file), path.display().to_string())
    }
}

impl<R: Read + Seek> GeoTiffReader<R> {
    /// Read GeoTIFF metadata from `reader`. `label` names the source in errors.
    pub fn new(reader: R, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let mut decoder = Decoder::new(reader)?.with_limits(decoder_limits());

        let (width, height) = decoder.dimensions()?;
        let samples = decoder
            .get_tag_u32(Tag::SamplesPerPixel)
            .map(|s| s as usize)
            .unwrap_or(1);
        if let Ok(2) = decoder.get_tag_u32(Tag::PlanarConfiguration) {
            return Err(StitchError::InvalidGeoTiff(format!(
                "{}: planar (band-separate) layout is not supported",
                label
            )));
        }

        let keys = decoder
            .get_tag_u16_vec(Tag::GeoKeyDirectoryTag)
            .map(|dir| GeoKeys::parse(&dir))
            .unwrap_or_default();
        let registration = keys.registration();
        let crs = keys.crs().unwrap_or_else(|| {
            debug!(source = %label, "No CRS geokey, assuming EPSG:4326");
            Crs::Wgs84
        });

        let mut transform = Self::read_transform(&mut decoder, &label)?;
        if registration == PixelRegistration::Point {
            transform = transform.translate_pixels(-0.5, -0.5);
        }

        let dtype = Self::read_dtype(&mut decoder);
        let nodata = Self::read_nodata_value(&mut decoder);

        let grid = RasterGrid::new(width as usize, height as usize, transform, crs)?
            .with_dtype(dtype)
            .with_nodata(nodata)
            .with_band_count(samples);

        Ok(Self {
            decoder,
            grid,
            registration,
            samples,
            label,
        })
    }

    /// Read the geotransform from ModelTransformation or tiepoint + pixel scale.
    fn read_transform(decoder: &mut Decoder<R>, label: &str) -> Result<Affine> {
        if let Ok(m) = decoder.get_tag_f64_vec(Tag::ModelTransformationTag) {
            if m.len() >= 8 {
                return Ok(Affine::new(m[0], m[1], m[3], m[4], m[5], m[7]));
            }
        }

        let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag);
        let pixel_scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag);
        if let (Ok(tiepoint), Ok(scale)) = (tiepoint, pixel_scale) {
            if tiepoint.len() >= 6 && scale.len() >= 2 {
                // Tiepoint format: [i, j, k, x, y, z] ties pixel (i, j) to world (x, y).
                let (i, j, x, y) = (tiepoint[0], tiepoint[1], tiepoint[3], tiepoint[4]);
                let (sx, sy) = (scale[0], scale[1]);
                return Ok(Affine::new(sx, 0.0, x - i * sx, 0.0, -sy, y + j * sy));
            }
        }

        Err(StitchError::InvalidGeoTiff(format!(
            "{}: missing ModelTransformation or ModelTiepoint/ModelPixelScale tags",
            label
        )))
    }

    fn read_dtype(decoder: &mut Decoder<R>) -> DataType {
        let bits = decoder
            .get_tag_u32_vec(Tag::BitsPerSample)
            .ok()
            .and_then(|v| v.first().copied())
            .unwrap_or(8);
        let format = decoder
            .get_tag_u32_vec(Tag::SampleFormat)
            .ok()
            .and_then(|v| v.first().copied())
            .unwrap_or(1);
        match (format, bits) {
            (3, 64) => DataType::Float64,
            (3, _) => DataType::Float32,
            (2, 8) => DataType::Int8,
            (2, 16) => DataType::Int16,
            (2, 64) => DataType::Int64,
            (2, _) => DataType::Int32,
            (_, 8) => DataType::UInt8,
            (_, 16) => DataType::UInt16,
            (_, 64) => DataType::UInt64,
            _ => DataType::UInt32,
        }
    }

    /// Try to read the no-data value from the GDAL_NODATA tag.
    fn read_nodata_value(decoder: &mut Decoder<R>) -> Option<f64> {
        let text = decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()?;
        text.trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .parse()
            .ok()
    }

    /// Georeferencing of the full raster.
    pub fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    /// Pixel registration declared by the file.
    pub fn registration(&self) -> PixelRegistration {
        self.registration
    }

    /// Read a pixel window from every band.
    pub fn read_window(&mut self, window: PixelWindow) -> Result<RasterBuffer> {
        let (width, height) = (self.grid.width(), self.grid.height());
        if window.width == 0
            || window.height == 0
            || window.col_off + window.width > width
            || window.row_off + window.height > height
        {
            return Err(StitchError::InvalidGeoTiff(format!(
                "{}: window {:?} outside {}x{} raster",
                self.label, window, width, height
            )));
        }

        let samples = self.samples;
        let mut out = RasterBuffer::filled(samples, window.height, window.width, f32::NAN);

        let (chunk_w, chunk_h) = self.decoder.chunk_dimensions();
        let (chunk_w, chunk_h) = (chunk_w as usize, chunk_h as usize);
        let chunks_across = width.div_ceil(chunk_w);

        let first_chunk_row = window.row_off / chunk_h;
        let last_chunk_row = (window.row_off + window.height - 1) / chunk_h;
        let first_chunk_col = window.col_off / chunk_w;
        let last_chunk_col = (window.col_off + window.width - 1) / chunk_w;

        for chunk_row in first_chunk_row..=last_chunk_row {
            for chunk_col in first_chunk_col..=last_chunk_col {
                let index = (chunk_row * chunks_across + chunk_col) as u32;
                let (data_w, data_h) = self.decoder.chunk_data_dimensions(index);
                let (data_w, data_h) = (data_w as usize, data_h as usize);
                let values = decode_to_f32(self.decoder.read_chunk(index)?);

                let chunk_x0 = chunk_col * chunk_w;
                let chunk_y0 = chunk_row * chunk_h;
                let row_start = window.row_off.max(chunk_y0);
                let row_end = (window.row_off + window.height).min(chunk_y0 + data_h);
                let col_start = window.col_off.max(chunk_x0);
                let col_end = (window.col_off + window.width).min(chunk_x0 + data_w);

                for row in row_start..row_end {
                    let src_row = (row - chunk_y0) * data_w * samples;
                    for col in col_start..col_end {
                        let src = src_row + (col - chunk_x0) * samples;
                        for band in 0..samples {
                            out.set(
                                band,
                                row - window.row_off,
                                col - window.col_off,
                                values[src + band],
                            );
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    /// Read the whole raster.
    pub fn read_all(&mut self) -> Result<(RasterBuffer, RasterGrid)> {
        let window = PixelWindow::full(self.grid.height(), self.grid.width());
        let buffer = self.read_window(window)?;
        Ok((buffer, self.grid.clone()))
    }
}

/// Convert any decoded sample type to `f32`.
fn decode_to_f32(result: DecodingResult) -> Vec<f32> {
    match result {
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U16(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
    }
}

/// Write a single-band raster as a float32 GeoTIFF.
///
/// A Point-registered raster is tied at its first pixel centre and flagged
/// PixelIsPoint, mirroring how [`GeoTiffReader`] interprets such files.
pub fn write_geotiff<P: AsRef<Path>>(
    path: P,
    buffer: &RasterBuffer,
    grid: &RasterGrid,
    registration: PixelRegistration,
) -> Result<()> {
    let file = BufWriter::new(File::create(path.as_ref())?);
    write_geotiff_to(file, buffer, grid, registration)
}

/// Write a single-band raster as a float32 GeoTIFF to any seekable writer.
pub fn write_geotiff_to<W: Write + Seek>(
    writer: W,
    buffer: &RasterBuffer,
    grid: &RasterGrid,
    registration: PixelRegistration,
) -> Result<()> {
    buffer.check_matches(grid)?;
    if buffer.bands() != 1 {
        return Err(StitchError::InvalidGeoTiff(format!(
            "cannot write {} bands; only single-band output is supported",
            buffer.bands()
        )));
    }
    let transform = grid.transform();
    if !transform.is_rectilinear() {
        return Err(StitchError::InvalidGeoTiff(
            "rotated transforms cannot be written as tiepoint + pixel scale".to_string(),
        ));
    }

    let (tie_x, tie_y, raster_type) = match registration {
        PixelRegistration::Area => (transform.c, transform.f, RASTER_PIXEL_IS_AREA),
        PixelRegistration::Point => {
            let (x, y) = transform.apply(0.5, 0.5);
            (x, y, RASTER_PIXEL_IS_POINT)
        }
    };

    let epsg = grid.crs().epsg();
    let geographic = matches!(grid.crs(), Crs::Wgs84 | Crs::Nad83);
    let (model_type, crs_key) = if geographic {
        (MODEL_TYPE_GEOGRAPHIC, KEY_GEOGRAPHIC_TYPE)
    } else {
        (MODEL_TYPE_PROJECTED, KEY_PROJECTED_CS_TYPE)
    };
    let epsg_code = u16::try_from(epsg)
        .map_err(|_| StitchError::InvalidGeoTiff(format!("EPSG:{} does not fit a geokey", epsg)))?;
    let geokeys: [u16; 16] = [
        1, 1, 0, 3, // version, revision, minor, key count
        KEY_MODEL_TYPE, 0, 1, model_type,
        KEY_RASTER_TYPE, 0, 1, raster_type,
        crs_key, 0, 1, epsg_code,
    ];

    let pixel_scale = [transform.a, -transform.e, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, tie_x, tie_y, 0.0];
    let nodata = match grid.nodata() {
        Some(v) if v.is_nan() => Some("nan".to_string()),
        Some(v) => Some(v.to_string()),
        None => None,
    };

    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image::<Gray32Float>(grid.width() as u32, grid.height() as u32)?;
    {
        let dir = image.encoder();
        dir.write_tag(Tag::ModelPixelScaleTag, pixel_scale.as_slice())?;
        dir.write_tag(Tag::ModelTiepointTag, tiepoint.as_slice())?;
        dir.write_tag(Tag::GeoKeyDirectoryTag, geokeys.as_slice())?;
        if let Some(nodata) = &nodata {
            dir.write_tag(Tag::GdalNodata, nodata.as_str())?;
        }
    }
    image.write_data(buffer.band(0))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn sample() -> (RasterBuffer, RasterGrid) {
        let rows: Vec<Vec<f32>> = (0..6)
            .map(|r| (0..5).map(|c| (r * 10 + c) as f32).collect())
            .collect();
        let buffer = RasterBuffer::from_rows(&rows).unwrap();
        let grid = RasterGrid::new(5, 6, Affine::from_origin(-120.0, 35.0, 0.25, 0.25), Crs::Wgs84)
            .unwrap()
            .with_nodata(Some(f64::NAN));
        (buffer, grid)
    }

    fn encode(buffer: &RasterBuffer, grid: &RasterGrid, registration: PixelRegistration) -> Vec<u8> {
        let mut bytes = Cursor::new(Vec::new());
        write_geotiff_to(&mut bytes, buffer, grid, registration).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn test_area_file_metadata() {
        let (buffer, grid) = sample();
        let bytes = encode(&buffer, &grid, PixelRegistration::Area);
        let reader = GeoTiffReader::new(Cursor::new(bytes), "memory").unwrap();

        assert_eq!(reader.registration(), PixelRegistration::Area);
        assert_eq!(reader.grid().transform(), grid.transform());
        assert_eq!(reader.grid().crs(), Crs::Wgs84);
        assert_eq!(reader.grid().dtype(), DataType::Float32);
        assert!(reader.grid().nodata().unwrap().is_nan());
    }

    #[test]
    fn test_point_file_reports_corner_transform() {
        let (buffer, grid) = sample();
        let bytes = encode(&buffer, &grid, PixelRegistration::Point);
        let reader = GeoTiffReader::new(Cursor::new(bytes), "memory").unwrap();

        assert_eq!(reader.registration(), PixelRegistration::Point);
        let t = reader.grid().transform();
        assert_relative_eq!(t.c, -120.0);
        assert_relative_eq!(t.f, 35.0);
    }

    #[test]
    fn test_window_read() {
        let (buffer, grid) = sample();
        let bytes = encode(&buffer, &grid, PixelRegistration::Area);
        let mut reader = GeoTiffReader::new(Cursor::new(bytes), "memory").unwrap();

        let window = PixelWindow::new(2, 1, 3, 2);
        let sub = reader.read_window(window).unwrap();
        assert_eq!(sub.shape(), (1, 3, 2));
        assert_eq!(sub.data(), &[21.0, 22.0, 31.0, 32.0, 41.0, 42.0]);

        let (all, all_grid) = reader.read_all().unwrap();
        assert_eq!(all, buffer);
        assert_eq!(all_grid.shape(), (1, 6, 5));
    }

    #[test]
    fn test_window_outside_raster_rejected() {
        let (buffer, grid) = sample();
        let bytes = encode(&buffer, &grid, PixelRegistration::Area);
        let mut reader = GeoTiffReader::new(Cursor::new(bytes), "memory").unwrap();
        assert!(reader.read_window(PixelWindow::new(4, 0, 3, 1)).is_err());
    }

    #[test]
    fn test_transformation_tag_and_numeric_nodata() {
        // Georeferenced only through ModelTransformation, as some tools write it.
        let mut bytes = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut bytes).unwrap();
            let mut image = encoder.new_image::<Gray32Float>(3, 2).unwrap();
            let matrix: [f64; 16] = [
                0.5, 0.0, 0.0, 20.0, //
                0.0, -0.5, 0.0, 10.0, //
                0.0, 0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, 1.0,
            ];
            let geokeys: [u16; 8] = [1, 1, 0, 1, KEY_GEOGRAPHIC_TYPE, 0, 1, 4269];
            let dir = image.encoder();
            dir.write_tag(Tag::ModelTransformationTag, matrix.as_slice()).unwrap();
            dir.write_tag(Tag::GeoKeyDirectoryTag, geokeys.as_slice()).unwrap();
            dir.write_tag(Tag::GdalNodata, "-9999").unwrap();
            image.write_data(&[1.0f32, 2.0, 3.0, 4.0, -9999.0, 6.0]).unwrap();
        }
        let mut reader = GeoTiffReader::new(Cursor::new(bytes.into_inner()), "memory").unwrap();
        assert_eq!(*reader.grid().transform(), Affine::new(0.5, 0.0, 20.0, 0.0, -0.5, 10.0));
        assert_eq!(reader.grid().crs(), Crs::Nad83);
        assert_eq!(reader.grid().nodata(), Some(-9999.0));
        let (buffer, grid) = reader.read_all().unwrap();
        assert!(!grid.is_valid(buffer.get(0, 1, 1)));
    }

    #[test]
    fn test_reopened_file_keeps_georeferencing() {
        let (buffer, grid) = sample();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.tif");
        write_geotiff(&path, &buffer, &grid, PixelRegistration::Area).unwrap();
        let mut reader = GeoTiffReader::open(&path).unwrap();
        assert_eq!(reader.grid().transform(), grid.transform());
        assert_eq!(reader.read_all().unwrap().0, buffer);
    }

    #[test]
    fn test_geokey_parsing() {
        let keys = GeoKeys::parse(&[1, 1, 0, 3, 1024, 0, 1, 2, 1025, 0, 1, 2, 2048, 0, 1, 4269]);
        assert_eq!(keys.crs(), Some(Crs::Nad83));
        assert_eq!(keys.registration(), PixelRegistration::Point);
        assert_eq!(GeoKeys::parse(&[]).crs(), None);
    }
}
