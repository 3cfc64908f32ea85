//! Geographic bounding boxes and antimeridian handling.
//!
//! All functions here are pure geometry over `(xmin, ymin, xmax, ymax)` boxes in
//! degrees. A box may extend past ±180° in longitude; such a box "crosses the
//! dateline" and the tile lookup, geoid reader, and stitcher use
//! [`classify_dateline_crossing`] and [`split_across_dateline`] to bring the
//! pieces on either side into one contiguous frame.

use crate::{Result, StitchError};
use std::fmt;

/// A box in geographic degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// West edge.
    pub xmin: f64,
    /// South edge.
    pub ymin: f64,
    /// East edge.
    pub xmax: f64,
    /// North edge.
    pub ymax: f64,
}

/// The canonical `[-180, 180] x [-90, 90]` envelope.
pub const WORLD: BoundingBox = BoundingBox::new(-180.0, -90.0, 180.0, 90.0);

/// The western hemisphere `[-180, 0] x [-90, 90]`.
pub const WESTERN_HEMISPHERE: BoundingBox = BoundingBox::new(-180.0, -90.0, 0.0, 90.0);

/// The eastern hemisphere `[0, 180] x [-90, 90]`.
pub const EASTERN_HEMISPHERE: BoundingBox = BoundingBox::new(0.0, -90.0, 180.0, 90.0);

impl BoundingBox {
    /// Create a box from its edges. No validation is performed.
    pub const fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
        }
    }

    /// Width in degrees.
    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    /// Height in degrees.
    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    /// True when `xmin < xmax` and `ymin < ymax`.
    pub fn is_well_ordered(&self) -> bool {
        self.xmin < self.xmax && self.ymin < self.ymax
    }

    /// True when the box has positive area.
    pub fn has_area(&self) -> bool {
        self.width() > 0.0 && self.height() > 0.0
    }

    /// Closed-set intersection test (shared edges count).
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    /// Intersection of two boxes, or `None` if they are disjoint.
    ///
    /// Boxes that only touch yield a degenerate (zero-area) result.
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        if !self.intersects(other) {
            return None;
        }
        Some(BoundingBox::new(
            self.xmin.max(other.xmin),
            self.ymin.max(other.ymin),
            self.xmax.min(other.xmax),
            self.ymax.min(other.ymax),
        ))
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.xmin.min(other.xmin),
            self.ymin.min(other.ymin),
            self.xmax.max(other.xmax),
            self.ymax.max(other.ymax),
        )
    }

    /// True when `other` lies entirely inside `self`.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.xmin <= other.xmin
            && self.ymin <= other.ymin
            && self.xmax >= other.xmax
            && self.ymax >= other.ymax
    }

    /// Shift the box east by `dx` degrees.
    pub fn translate(&self, dx: f64) -> BoundingBox {
        BoundingBox::new(self.xmin + dx, self.ymin, self.xmax + dx, self.ymax)
    }

    /// Edges as `[xmin, ymin, xmax, ymax]`.
    pub fn to_array(&self) -> [f64; 4] {
        [self.xmin, self.ymin, self.xmax, self.ymax]
    }

    /// The box as a `geo` rectangle.
    pub fn to_rect(&self) -> geo::Rect<f64> {
        geo::Rect::new(
            geo::coord! { x: self.xmin, y: self.ymin },
            geo::coord! { x: self.xmax, y: self.ymax },
        )
    }

    fn invalid(&self, reason: impl Into<String>) -> StitchError {
        StitchError::InvalidBounds {
            xmin: self.xmin,
            ymin: self.ymin,
            xmax: self.xmax,
            ymax: self.ymax,
            reason: reason.into(),
        }
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(b: [f64; 4]) -> Self {
        BoundingBox::new(b[0], b[1], b[2], b[3])
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.xmin, self.ymin, self.xmax, self.ymax
        )
    }
}

/// How a box relates to the ±180° meridian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatelineCrossing {
    /// Entirely inside `(-180, 180)`.
    None,
    /// Reaches `-180` or beyond.
    West,
    /// Reaches `+180` or beyond.
    East,
}

impl DatelineCrossing {
    /// The meridian crossed: `-180`, `180`, or `0` when there is no crossing.
    pub fn meridian(&self) -> f64 {
        match self {
            DatelineCrossing::None => 0.0,
            DatelineCrossing::West => -180.0,
            DatelineCrossing::East => 180.0,
        }
    }

    /// True for [`DatelineCrossing::West`] and [`DatelineCrossing::East`].
    pub fn crosses(&self) -> bool {
        !matches!(self, DatelineCrossing::None)
    }
}

/// Check that bounds are ordered, touch the globe, and stay off the poles.
pub fn validate_bounds(bounds: &BoundingBox) -> Result<()> {
    if bounds.xmin > bounds.xmax || bounds.ymin > bounds.ymax {
        return Err(bounds.invalid("expected xmin <= xmax and ymin <= ymax"));
    }
    if !bounds.intersects(&WORLD) {
        return Err(bounds.invalid("does not intersect [-180, -90, 180, 90]"));
    }
    if bounds.ymin < -90.0 || bounds.ymax > 90.0 {
        return Err(bounds.invalid("latitudes beyond the poles are not supported"));
    }
    Ok(())
}

/// Classify how `bounds` relates to the dateline.
pub fn classify_dateline_crossing(bounds: &BoundingBox) -> Result<DatelineCrossing> {
    validate_bounds(bounds)?;
    let west = bounds.xmin <= -180.0;
    let east = bounds.xmax >= 180.0;
    match (west, east) {
        (false, false) => Ok(DatelineCrossing::None),
        (true, false) => Ok(DatelineCrossing::West),
        (false, true) => Ok(DatelineCrossing::East),
        (true, true) => Err(StitchError::DoubleCrossing {
            xmin: bounds.xmin,
            xmax: bounds.xmax,
        }),
    }
}

/// Split a dateline-crossing box into its western and eastern pieces.
///
/// Returns `(bounds, None)` when there is no crossing. Otherwise the box and
/// its copy shifted by 360° towards the globe are intersected with each
/// hemisphere and the positive-area pieces returned as `(western, Some(eastern))`.
/// If only one hemisphere receives a piece with area, that piece is returned
/// alone.
pub fn split_across_dateline(bounds: &BoundingBox) -> Result<(BoundingBox, Option<BoundingBox>)> {
    let crossing = classify_dateline_crossing(bounds)?;
    if !crossing.crosses() {
        return Ok((*bounds, None));
    }

    let shifted = bounds.translate(-2.0 * crossing.meridian());
    let half = |hemisphere: &BoundingBox| -> Option<BoundingBox> {
        [bounds, &shifted]
            .into_iter()
            .filter_map(|b| b.intersection(hemisphere))
            .filter(BoundingBox::has_area)
            .reduce(|acc, piece| acc.union(&piece))
    };

    match (half(&WESTERN_HEMISPHERE), half(&EASTERN_HEMISPHERE)) {
        (Some(west), Some(east)) => Ok((west, Some(east))),
        (Some(only), None) | (None, Some(only)) => Ok((only, None)),
        (None, None) => Err(bounds.invalid("no part of the box lies on the globe")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(b: [f64; 4]) -> BoundingBox {
        BoundingBox::from(b)
    }

    #[test]
    fn test_classify_crossings() {
        let cases = [
            ([179.0, 52.0, 181.0, 53.0], DatelineCrossing::East),
            ([179.1, -13.0, 180.001, -12.1], DatelineCrossing::East),
            ([-181.0, 33.0, -179.0, 34.5], DatelineCrossing::West),
            ([-180.1, -89.0, -178.8, -88.0], DatelineCrossing::West),
            ([100.0, 0.0, 101.0, 1.0], DatelineCrossing::None),
            ([-33.0, 10.0, -32.0, 12.0], DatelineCrossing::None),
        ];
        for (b, expected) in cases {
            assert_eq!(classify_dateline_crossing(&bb(b)).unwrap(), expected, "{:?}", b);
        }
        assert_eq!(DatelineCrossing::East.meridian(), 180.0);
        assert_eq!(DatelineCrossing::West.meridian(), -180.0);
        assert_eq!(DatelineCrossing::None.meridian(), 0.0);
    }

    #[test]
    fn test_double_crossing_rejected() {
        let err = classify_dateline_crossing(&bb([-181.0, 0.0, 181.0, 1.0])).unwrap_err();
        assert!(matches!(err, StitchError::DoubleCrossing { .. }));
    }

    #[test]
    fn test_bounds_off_the_globe_rejected() {
        for b in [[-200.0, 0.0, -181.0, 1.0], [180.01, 0.0, 200.0, 1.0]] {
            let err = classify_dateline_crossing(&bb(b)).unwrap_err();
            assert!(matches!(err, StitchError::InvalidBounds { .. }), "{:?}", b);
        }
    }

    #[test]
    fn test_poles_rejected() {
        for b in [[52.0, 89.0, 53.0, 91.0], [52.0, -91.0, 53.0, -89.0]] {
            let err = validate_bounds(&bb(b)).unwrap_err();
            assert!(matches!(err, StitchError::InvalidBounds { .. }), "{:?}", b);
        }
    }

    #[test]
    fn test_unordered_rejected() {
        assert!(validate_bounds(&bb([1.0, 0.0, 0.0, 1.0])).is_err());
        assert!(validate_bounds(&bb([0.0, 1.0, 1.0, 0.0])).is_err());
        // A zero-width box is still ordered.
        assert!(validate_bounds(&bb([0.0, 0.0, 0.0, 1.0])).is_ok());
    }

    #[test]
    fn test_split_without_crossing() {
        let b = bb([10.0, 0.0, 11.0, 1.0]);
        assert_eq!(split_across_dateline(&b).unwrap(), (b, None));
    }

    #[test]
    fn test_split_east_crossing() {
        let (west, east) = split_across_dateline(&bb([179.0, 52.0, 181.0, 53.0])).unwrap();
        assert_eq!(west, bb([-180.0, 52.0, -179.0, 53.0]));
        assert_eq!(east, Some(bb([179.0, 52.0, 180.0, 53.0])));
    }

    #[test]
    fn test_split_west_crossing() {
        let (west, east) = split_across_dateline(&bb([-181.0, 51.25, -179.0, 51.75])).unwrap();
        assert_eq!(west, bb([-180.0, 51.25, -179.0, 51.75]));
        assert_eq!(east, Some(bb([179.0, 51.25, 180.0, 51.75])));
    }

    #[test]
    fn test_split_touching_meridian_keeps_single_piece() {
        let (only, other) = split_across_dateline(&bb([179.0, 0.0, 180.0, 1.0])).unwrap();
        assert_eq!(only, bb([179.0, 0.0, 180.0, 1.0]));
        assert!(other.is_none());
    }
}
