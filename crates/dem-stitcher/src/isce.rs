//! ISCE2 DEM output.
//!
//! ISCE2 reads a DEM as a headerless binary file of little-endian float32
//! samples (band interleaved by line) next to a `<file>.xml` image
//! descriptor. The descriptor carries the raster size, sample layout and the
//! two image coordinates (longitude along the width, latitude along the
//! length). A `reference` property naming the geodetic datum marks heights as
//! ellipsoidal.

use crate::raster::{Crs, RasterBuffer, RasterGrid};
use crate::transform::Affine;
use crate::{Result, StitchError};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Datum written into the `reference` property.
pub const ISCE_REFERENCE_DATUM: &str = "WGS84";

const ISCE_DATA_TYPE: &str = "FLOAT";
const ISCE_SCHEME: &str = "BIL";
const ISCE_BYTE_ORDER: &str = "l";

/// Descriptor path for an ISCE image: the image path with `.xml` appended.
pub fn isce_xml_path(dem_path: &Path) -> PathBuf {
    let mut name = dem_path.as_os_str().to_owned();
    name.push(".xml");
    PathBuf::from(name)
}

/// Properties of an ISCE image descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct IsceMetadata {
    /// Samples per line.
    pub width: usize,
    /// Number of lines.
    pub length: usize,
    /// Band count.
    pub bands: usize,
    /// Sample type, e.g. `FLOAT`.
    pub data_type: String,
    /// Interleaving scheme, e.g. `BIL`.
    pub scheme: String,
    /// `l` for little-endian, `b` for big-endian.
    pub byte_order: String,
    /// Longitude of the western edge.
    pub x_start: f64,
    /// Pixel width in degrees.
    pub x_delta: f64,
    /// Latitude of the northern edge.
    pub y_start: f64,
    /// Pixel height in degrees; negative for north-up images.
    pub y_delta: f64,
    /// Geodetic datum, present once the image is tagged as ellipsoidal.
    pub reference: Option<String>,
}

impl IsceMetadata {
    /// Grid described by this metadata.
    pub fn grid(&self) -> Result<RasterGrid> {
        let transform = Affine::new(self.x_delta, 0.0, self.x_start, 0.0, self.y_delta, self.y_start);
        RasterGrid::new(self.width, self.length, transform, Crs::Wgs84)
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> StitchError {
    StitchError::InvalidIsceMetadata {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

fn text_element<W: Write>(writer: &mut Writer<W>, tag: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn property<W: Write>(writer: &mut Writer<W>, name: &str, value: &str, doc: Option<&str>) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("property").with_attributes([("name", name)])))?;
    text_element(writer, "value", value)?;
    if let Some(doc) = doc {
        text_element(writer, "doc", doc)?;
    }
    writer.write_event(Event::End(BytesEnd::new("property")))?;
    Ok(())
}

fn coordinate<W: Write>(writer: &mut Writer<W>, name: &str, doc: &str, start: f64, delta: f64, size: usize) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new("component").with_attributes([("name", name)])))?;
    text_element(writer, "factorymodule", "isceobj.Image")?;
    text_element(writer, "factoryname", "createCoordinate")?;
    text_element(writer, "doc", doc)?;
    property(writer, "startingValue", &start.to_string(), Some("Starting value of the coordinate."))?;
    property(writer, "delta", &delta.to_string(), Some("Coordinate quantization."))?;
    property(writer, "size", &size.to_string(), Some("Coordinate size."))?;
    property(writer, "endingValue", &(start + delta * size as f64).to_string(), None)?;
    writer.write_event(Event::End(BytesEnd::new("component")))?;
    Ok(())
}

fn write_reference<W: Write>(writer: &mut Writer<W>) -> Result<()> {
    property(writer, "reference", ISCE_REFERENCE_DATUM, Some("Geodetic datum"))
}

/// Write a single-band raster as an ISCE2 DEM with its `.xml` descriptor.
///
/// Pixels the grid marks invalid (including NaN) are written as `nodata`.
/// Returns the descriptor path.
pub fn write_isce_dem<P: AsRef<Path>>(path: P, buffer: &RasterBuffer, grid: &RasterGrid, nodata: f64) -> Result<PathBuf> {
    let path = path.as_ref();
    buffer.check_matches(grid)?;
    if buffer.bands() != 1 {
        return Err(invalid(path, format!("cannot write {} bands; ISCE DEMs are single band", buffer.bands())));
    }
    let transform = grid.transform();
    if !transform.is_rectilinear() {
        return Err(invalid(path, "rotated transforms have no ISCE coordinate form"));
    }

    let fill = nodata as f32;
    let mut out = BufWriter::new(File::create(path)?);
    for &value in buffer.band(0) {
        let value = if grid.is_valid(value) { value } else { fill };
        out.write_all(&value.to_le_bytes())?;
    }
    out.flush()?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    writer.write_event(Event::Start(BytesStart::new("imageFile")))?;
    property(&mut writer, "WIDTH", &grid.width().to_string(), None)?;
    property(&mut writer, "LENGTH", &grid.height().to_string(), None)?;
    property(&mut writer, "NUMBER_BANDS", "1", None)?;
    property(&mut writer, "DATA_TYPE", ISCE_DATA_TYPE, None)?;
    property(&mut writer, "SCHEME", ISCE_SCHEME, None)?;
    property(&mut writer, "BYTE_ORDER", ISCE_BYTE_ORDER, None)?;
    property(&mut writer, "ACCESS_MODE", "read", None)?;
    property(&mut writer, "FILE_NAME", &file_name, None)?;
    coordinate(
        &mut writer,
        "Coordinate1",
        "First coordinate of a 2D image (width).",
        transform.c,
        transform.a,
        grid.width(),
    )?;
    coordinate(
        &mut writer,
        "Coordinate2",
        "Second coordinate of a 2D image (length).",
        transform.f,
        transform.e,
        grid.height(),
    )?;
    writer.write_event(Event::End(BytesEnd::new("imageFile")))?;

    let xml_path = isce_xml_path(path);
    fs::write(&xml_path, writer.into_inner())?;
    debug!(path = %path.display(), width = grid.width(), height = grid.height(), "Wrote ISCE DEM");
    Ok(xml_path)
}

fn is_reference_property(element: &BytesStart<'_>) -> bool {
    element.name().as_ref() == b"property" && name_attribute(element).as_deref() == Some("reference")
}

fn name_attribute(element: &BytesStart<'_>) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == b"name")
        .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
}

/// Mark an ISCE DEM's heights as ellipsoidal.
///
/// Inserts a `reference` property naming [`ISCE_REFERENCE_DATUM`] as the
/// first child of the descriptor's root, replacing any existing one. The
/// descriptor must already exist. Returns its path.
pub fn tag_dem_xml_as_ellipsoidal<P: AsRef<Path>>(dem_path: P) -> Result<PathBuf> {
    let xml_path = isce_xml_path(dem_path.as_ref());
    if !xml_path.exists() {
        return Err(invalid(&xml_path, "descriptor not found"));
    }
    let text = fs::read_to_string(&xml_path)?;

    let mut reader = Reader::from_str(&text);
    let mut writer = Writer::new(Vec::new());
    let mut depth = 0usize;
    let mut skip_until: Option<usize> = None;
    let mut tagged = false;

    loop {
        let event = reader.read_event()?;
        if let Some(level) = skip_until {
            match event {
                Event::Start(_) => depth += 1,
                Event::End(_) => {
                    depth = depth.saturating_sub(1);
                    if depth == level {
                        skip_until = None;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            continue;
        }

        match event {
            Event::Eof => break,
            Event::Start(element) => {
                if depth == 1 && is_reference_property(&element) {
                    skip_until = Some(depth);
                    depth += 1;
                    continue;
                }
                depth += 1;
                writer.write_event(Event::Start(element))?;
                if depth == 1 && !tagged {
                    write_reference(&mut writer)?;
                    tagged = true;
                }
            }
            Event::Empty(element) => {
                if depth == 1 && is_reference_property(&element) {
                    continue;
                }
                writer.write_event(Event::Empty(element))?;
            }
            Event::End(element) => {
                depth = depth.saturating_sub(1);
                writer.write_event(Event::End(element))?;
            }
            other => writer.write_event(other)?,
        }
    }

    if !tagged {
        return Err(invalid(&xml_path, "no root element"));
    }
    fs::write(&xml_path, writer.into_inner())?;
    debug!(path = %xml_path.display(), "Tagged ISCE DEM as ellipsoidal");
    Ok(xml_path)
}

/// Read the descriptor of an ISCE image.
pub fn read_isce_metadata<P: AsRef<Path>>(dem_path: P) -> Result<IsceMetadata> {
    let xml_path = isce_xml_path(dem_path.as_ref());
    let text = fs::read_to_string(&xml_path)?;

    // (component, property) -> value; top-level properties have no component.
    let mut values: HashMap<(Option<String>, String), String> = HashMap::new();
    let mut stack: Vec<(String, Option<String>)> = Vec::new();
    let mut reader = Reader::from_str(&text);
    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(element) => {
                let tag = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                stack.push((tag, name_attribute(&element)));
            }
            Event::End(_) => {
                stack.pop();
            }
            Event::Text(text) => {
                let n = stack.len();
                if n < 2 || stack[n - 1].0 != "value" || stack[n - 2].0 != "property" {
                    continue;
                }
                let Some(property) = stack[n - 2].1.clone() else {
                    continue;
                };
                let component = stack[..n - 2]
                    .iter()
                    .rev()
                    .find(|(tag, _)| tag == "component")
                    .and_then(|(_, name)| name.clone());
                values.insert((component, property), text.unescape()?.trim().to_string());
            }
            _ => {}
        }
    }

    let get = |component: Option<&str>, property: &str| -> Result<String> {
        values
            .get(&(component.map(str::to_string), property.to_string()))
            .cloned()
            .ok_or_else(|| {
                let place = component.map(|c| format!("{}.", c)).unwrap_or_default();
                invalid(&xml_path, format!("missing property {}{}", place, property))
            })
    };
    let number = |component: Option<&str>, property: &str| -> Result<f64> {
        let raw = get(component, property)?;
        raw.parse()
            .map_err(|_| invalid(&xml_path, format!("{} is not a number: '{}'", property, raw)))
    };
    let count = |property: &str| -> Result<usize> {
        let raw = get(None, property)?;
        raw.parse()
            .map_err(|_| invalid(&xml_path, format!("{} is not a count: '{}'", property, raw)))
    };

    Ok(IsceMetadata {
        width: count("WIDTH")?,
        length: count("LENGTH")?,
        bands: count("NUMBER_BANDS")?,
        data_type: get(None, "DATA_TYPE")?,
        scheme: get(None, "SCHEME")?,
        byte_order: get(None, "BYTE_ORDER")?,
        x_start: number(Some("Coordinate1"), "startingValue")?,
        x_delta: number(Some("Coordinate1"), "delta")?,
        y_start: number(Some("Coordinate2"), "startingValue")?,
        y_delta: number(Some("Coordinate2"), "delta")?,
        reference: values.get(&(None, "reference".to_string())).cloned(),
    })
}

/// Read an ISCE DEM written by [`write_isce_dem`].
///
/// Only single-band little-endian float32 images are supported.
pub fn read_isce_dem<P: AsRef<Path>>(dem_path: P) -> Result<(RasterBuffer, RasterGrid, IsceMetadata)> {
    let path = dem_path.as_ref();
    let metadata = read_isce_metadata(path)?;
    if metadata.bands != 1 || metadata.data_type != ISCE_DATA_TYPE || metadata.byte_order != ISCE_BYTE_ORDER {
        return Err(invalid(
            &isce_xml_path(path),
            format!(
                "unsupported layout: {} band(s) of {} with byte order '{}'",
                metadata.bands, metadata.data_type, metadata.byte_order
            ),
        ));
    }

    let bytes = fs::read(path)?;
    let expected = metadata.width * metadata.length * 4;
    if bytes.len() != expected {
        return Err(invalid(
            &isce_xml_path(path),
            format!("image holds {} bytes, descriptor implies {}", bytes.len(), expected),
        ));
    }
    let data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let grid = metadata.grid()?;
    let buffer = RasterBuffer::new(1, metadata.length, metadata.width, data)?;
    Ok((buffer, grid, metadata))
}
