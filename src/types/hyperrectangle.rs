//! N-dimensional bounding boxes
//!
//! A `Hyperrectangle` is a list of `DoubleInterval`s, one per dimension. The
//! zero-dimensional rectangle is the "full space" and intersects everything.
//! Interval ends can be open or closed so that the two halves of a split
//! region never share a boundary point.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded size of one dimension: begin (f64) + end (f64) + flags (u8)
const ENCODED_INTERVAL_SIZE: usize = 17;

const FLAG_BEGIN_INCLUDED: u8 = 0b01;
const FLAG_END_INCLUDED: u8 = 0b10;

/// One dimension of a bounding box
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DoubleInterval {
    pub begin: f64,
    pub end: f64,
    pub begin_included: bool,
    pub end_included: bool,
}

impl DoubleInterval {
    /// Closed interval [begin, end]
    pub fn closed(begin: f64, end: f64) -> Result<Self> {
        Self::with_bounds(begin, end, true, true)
    }

    /// Interval with explicit ends; NaN or inverted bounds are rejected
    pub fn with_bounds(begin: f64, end: f64, begin_included: bool, end_included: bool) -> Result<Self> {
        let interval = Self::bounded(begin, end, begin_included, end_included);
        interval.validate()?;
        Ok(interval)
    }

    /// Caller guarantees `begin <= end`
    fn bounded(begin: f64, end: f64, begin_included: bool, end_included: bool) -> Self {
        Self {
            begin,
            end,
            begin_included,
            end_included,
        }
    }

    /// Reject NaN bounds and `begin > end`
    ///
    /// The fields are public and decoded from requests, so intervals that
    /// did not go through a constructor are checked here.
    pub fn validate(&self) -> Result<()> {
        if self.begin.is_nan() || self.end.is_nan() {
            return Err(StorageError::InvalidArgument(format!("interval {} has a NaN bound", self)));
        }
        if self.begin > self.end {
            return Err(StorageError::InvalidArgument(format!(
                "interval begin {} is after its end {}",
                self.begin, self.end
            )));
        }
        Ok(())
    }

    pub fn intersects(&self, other: &DoubleInterval) -> bool {
        if self.end < other.begin || other.end < self.begin {
            return false;
        }
        if self.end == other.begin && !(self.end_included && other.begin_included) {
            return false;
        }
        if other.end == self.begin && !(other.end_included && self.begin_included) {
            return false;
        }
        true
    }

    pub fn contains_point(&self, value: f64) -> bool {
        let after_begin = value > self.begin || (value == self.begin && self.begin_included);
        let before_end = value < self.end || (value == self.end && self.end_included);
        after_begin && before_end
    }

    /// True if every point of `other` lies in `self`
    pub fn covers(&self, other: &DoubleInterval) -> bool {
        let begin_ok = self.begin < other.begin
            || (self.begin == other.begin && (self.begin_included || !other.begin_included));
        let end_ok = self.end > other.end
            || (self.end == other.end && (self.end_included || !other.end_included));
        begin_ok && end_ok
    }

    /// Smallest interval that covers both
    pub fn cover(&self, other: &DoubleInterval) -> DoubleInterval {
        let (begin, begin_included) = if self.begin < other.begin {
            (self.begin, self.begin_included)
        } else if other.begin < self.begin {
            (other.begin, other.begin_included)
        } else {
            (self.begin, self.begin_included || other.begin_included)
        };

        let (end, end_included) = if self.end > other.end {
            (self.end, self.end_included)
        } else if other.end > self.end {
            (other.end, other.end_included)
        } else {
            (self.end, self.end_included || other.end_included)
        };

        DoubleInterval::bounded(begin, end, begin_included, end_included)
    }

    pub fn midpoint(&self) -> f64 {
        self.begin + (self.end - self.begin) / 2.0
    }

    pub fn length(&self) -> f64 {
        self.end - self.begin
    }

    /// Split at `position`: left keeps the split point, right excludes it
    pub fn split_at(&self, position: f64) -> Result<(DoubleInterval, DoubleInterval)> {
        if !self.contains_point(position) || position == self.end {
            return Err(StorageError::InvalidArgument(format!(
                "split position {} is not inside {}",
                position, self
            )));
        }

        let left = DoubleInterval::bounded(self.begin, position, self.begin_included, true);
        let right = DoubleInterval::bounded(position, self.end, false, self.end_included);
        Ok((left, right))
    }
}

impl fmt::Display for DoubleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{},{}{}",
            if self.begin_included { '[' } else { '(' },
            self.begin,
            self.end,
            if self.end_included { ']' } else { ')' }
        )
    }
}

/// Bounding box in n dimensions
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Hyperrectangle {
    intervals: Vec<DoubleInterval>,
}

impl Hyperrectangle {
    pub fn new(intervals: Vec<DoubleInterval>) -> Self {
        Self { intervals }
    }

    /// The unbounded rectangle
    pub fn full_space() -> Self {
        Self { intervals: Vec::new() }
    }

    /// Closed box from `[begin0, end0, begin1, end1, ...]`
    pub fn from_bounds(bounds: &[f64]) -> Result<Self> {
        if bounds.len() % 2 != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "{} bounds do not form begin/end pairs",
                bounds.len()
            )));
        }
        let intervals = bounds
            .chunks(2)
            .map(|pair| DoubleInterval::closed(pair[0], pair[1]))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { intervals })
    }

    /// Degenerate box of a single point
    pub fn from_point(coordinates: &[f64]) -> Result<Self> {
        let intervals = coordinates
            .iter()
            .map(|c| DoubleInterval::closed(*c, *c))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { intervals })
    }

    /// Check every dimension of a box that was built field by field
    pub fn validate(&self) -> Result<()> {
        for (dimension, interval) in self.intervals.iter().enumerate() {
            interval
                .validate()
                .map_err(|e| StorageError::InvalidArgument(format!("dimension {}: {}", dimension, e)))?;
        }
        Ok(())
    }

    pub fn is_full_space(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.intervals.len()
    }

    pub fn interval(&self, dimension: usize) -> Option<&DoubleInterval> {
        self.intervals.get(dimension)
    }

    pub fn intervals(&self) -> &[DoubleInterval] {
        &self.intervals
    }

    pub fn intersects(&self, other: &Hyperrectangle) -> bool {
        if self.is_full_space() || other.is_full_space() {
            return true;
        }
        if self.dimension() != other.dimension() {
            return false;
        }
        self.intervals
            .iter()
            .zip(other.intervals.iter())
            .all(|(a, b)| a.intersects(b))
    }

    /// True if `other` lies completely inside `self`
    pub fn covers(&self, other: &Hyperrectangle) -> bool {
        if self.is_full_space() {
            return true;
        }
        if other.is_full_space() || self.dimension() != other.dimension() {
            return false;
        }
        self.intervals
            .iter()
            .zip(other.intervals.iter())
            .all(|(a, b)| a.covers(b))
    }

    /// Smallest box covering both rectangles
    pub fn cover(&self, other: &Hyperrectangle) -> Hyperrectangle {
        if self.is_full_space() || other.is_full_space() || self.dimension() != other.dimension() {
            return Hyperrectangle::full_space();
        }
        let intervals = self
            .intervals
            .iter()
            .zip(other.intervals.iter())
            .map(|(a, b)| a.cover(b))
            .collect();
        Hyperrectangle { intervals }
    }

    /// Split along `dimension` at `position`
    pub fn split(&self, dimension: usize, position: f64) -> Result<(Hyperrectangle, Hyperrectangle)> {
        let interval = self.interval(dimension).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "cannot split dimension {} of a {}-dimensional box",
                dimension,
                self.dimension()
            ))
        })?;

        let (left_interval, right_interval) = interval.split_at(position)?;

        let mut left = self.intervals.clone();
        let mut right = self.intervals.clone();
        left[dimension] = left_interval;
        right[dimension] = right_interval;

        Ok((Hyperrectangle::new(left), Hyperrectangle::new(right)))
    }

    /// Volume (0 for the full space)
    pub fn volume(&self) -> f64 {
        if self.is_full_space() {
            return 0.0;
        }
        self.intervals.iter().map(|i| i.length()).product()
    }

    pub fn encoded_len(&self) -> usize {
        self.intervals.len() * ENCODED_INTERVAL_SIZE
    }

    /// Big-endian encoding used inside SSTable records
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        for interval in &self.intervals {
            buf.extend_from_slice(&interval.begin.to_be_bytes());
            buf.extend_from_slice(&interval.end.to_be_bytes());
            let mut flags = 0u8;
            if interval.begin_included {
                flags |= FLAG_BEGIN_INCLUDED;
            }
            if interval.end_included {
                flags |= FLAG_END_INCLUDED;
            }
            buf.push(flags);
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % ENCODED_INTERVAL_SIZE != 0 {
            return Err(StorageError::Corruption(format!(
                "bounding box length {} is not a multiple of {}",
                bytes.len(),
                ENCODED_INTERVAL_SIZE
            )));
        }

        let mut intervals = Vec::with_capacity(bytes.len() / ENCODED_INTERVAL_SIZE);
        for chunk in bytes.chunks(ENCODED_INTERVAL_SIZE) {
            let mut begin = [0u8; 8];
            let mut end = [0u8; 8];
            begin.copy_from_slice(&chunk[0..8]);
            end.copy_from_slice(&chunk[8..16]);
            let begin = f64::from_be_bytes(begin);
            let end = f64::from_be_bytes(end);
            if !(begin <= end) {
                return Err(StorageError::Corruption(format!(
                    "invalid interval bounds {} > {}",
                    begin, end
                )));
            }
            let flags = chunk[16];
            intervals.push(DoubleInterval::bounded(
                begin,
                end,
                flags & FLAG_BEGIN_INCLUDED != 0,
                flags & FLAG_END_INCLUDED != 0,
            ));
        }

        Ok(Self { intervals })
    }
}

impl fmt::Display for Hyperrectangle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full_space() {
            return write!(f, "[full space]");
        }
        let parts: Vec<String> = self.intervals.iter().map(|i| i.to_string()).collect();
        write!(f, "[{}]", parts.join(":"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersects() {
        let a = Hyperrectangle::from_bounds(&[0.0, 10.0, 0.0, 10.0]).unwrap();
        let b = Hyperrectangle::from_bounds(&[5.0, 15.0, 5.0, 15.0]).unwrap();
        let c = Hyperrectangle::from_bounds(&[20.0, 30.0, 20.0, 30.0]).unwrap();

        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(a.intersects(&Hyperrectangle::full_space()));
    }

    #[test]
    fn test_open_boundaries() {
        let left = DoubleInterval::with_bounds(0.0, 5.0, true, true).unwrap();
        let right = DoubleInterval::with_bounds(5.0, 10.0, false, true).unwrap();
        assert!(!left.intersects(&right));
        assert!(left.contains_point(5.0));
        assert!(!right.contains_point(5.0));

        let touching = DoubleInterval::closed(5.0, 7.0).unwrap();
        assert!(left.intersects(&touching));
        assert!(!right.intersects(&DoubleInterval::closed(1.0, 5.0).unwrap()));
    }

    #[test]
    fn test_split_is_disjoint_and_covers_parent() {
        let parent = Hyperrectangle::from_bounds(&[0.0, 10.0, -5.0, 5.0]).unwrap();
        let (left, right) = parent.split(0, 4.0).unwrap();

        assert!(!left.intersects(&right));
        assert_eq!(left.cover(&right), parent);
        assert!(parent.covers(&left));
        assert!(parent.covers(&right));

        let boundary = Hyperrectangle::from_bounds(&[3.0, 6.0, 0.0, 1.0]).unwrap();
        assert!(left.intersects(&boundary));
        assert!(right.intersects(&boundary));
    }

    #[test]
    fn test_split_rejects_outside_position() {
        let parent = Hyperrectangle::from_bounds(&[0.0, 10.0]).unwrap();
        assert!(parent.split(0, 11.0).is_err());
        assert!(parent.split(0, 10.0).is_err());
        assert!(parent.split(1, 5.0).is_err());
    }

    #[test]
    fn test_byte_encoding() {
        let (_, right) = Hyperrectangle::from_bounds(&[1.5, 2.5, -3.0, 4.0]).unwrap().split(0, 2.0).unwrap();
        let bytes = right.to_bytes();
        assert_eq!(bytes.len(), 34);
        assert_eq!(Hyperrectangle::from_bytes(&bytes).unwrap(), right);

        assert!(Hyperrectangle::from_bytes(&[]).unwrap().is_full_space());
        assert!(Hyperrectangle::from_bytes(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_invalid_bounds_are_rejected() {
        assert!(matches!(DoubleInterval::closed(2.0, 1.0), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(DoubleInterval::closed(f64::NAN, 1.0), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(Hyperrectangle::from_bounds(&[0.0, 1.0, 2.0]), Err(StorageError::InvalidArgument(_))));
        assert!(matches!(Hyperrectangle::from_bounds(&[0.0, f64::NAN]), Err(StorageError::InvalidArgument(_))));
        assert!(Hyperrectangle::from_point(&[f64::NAN]).is_err());

        // boxes assembled from decoded fields skip the constructors
        let decoded = Hyperrectangle::new(vec![
            DoubleInterval::closed(0.0, 1.0).unwrap(),
            DoubleInterval {
                begin: 5.0,
                end: -5.0,
                begin_included: true,
                end_included: true,
            },
        ]);
        assert!(matches!(decoded.validate(), Err(StorageError::InvalidArgument(m)) if m.contains("dimension 1")));
        assert!(Hyperrectangle::full_space().validate().is_ok());

        let mut nan = Hyperrectangle::from_bounds(&[1.0, 2.0]).unwrap().to_bytes();
        nan[0..8].copy_from_slice(&f64::NAN.to_be_bytes());
        assert!(matches!(Hyperrectangle::from_bytes(&nan), Err(StorageError::Corruption(_))));
    }
}
