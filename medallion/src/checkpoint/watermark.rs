//! Incremental extraction watermarks.

use crate::errors::MedallionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// The highest incremental key seen for a source.
///
/// Watermarks of the same kind are totally ordered. Comparing different kinds
/// is an error, since it means a source changed its checkpoint column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Watermark {
    /// A monotonically increasing integer key (sequence id, version).
    Integer(i64),
    /// A modification timestamp.
    Timestamp(DateTime<Utc>),
    /// Any other lexicographically ordered key.
    Text(String),
}

impl Watermark {
    /// Compares two watermarks of the same kind.
    ///
    /// Returns `None` when the kinds differ.
    #[must_use]
    pub fn try_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Compares two watermarks, failing on mismatched kinds.
    pub fn checked_cmp(&self, other: &Self) -> Result<Ordering, MedallionError> {
        self.try_cmp(other).ok_or_else(|| {
            MedallionError::InvalidWatermark(format!(
                "cannot compare {} watermark '{self}' with {} watermark '{other}'",
                self.kind(),
                other.kind()
            ))
        })
    }

    /// Returns the larger of a stored baseline and a batch maximum.
    pub fn advance(current: Option<&Self>, observed: &Self) -> Result<Self, MedallionError> {
        match current {
            None => Ok(observed.clone()),
            Some(current) => match current.checked_cmp(observed)? {
                Ordering::Less => Ok(observed.clone()),
                Ordering::Equal | Ordering::Greater => Ok(current.clone()),
            },
        }
    }

    /// Returns the largest watermark in an iterator.
    pub fn max_of<'a>(
        values: impl IntoIterator<Item = &'a Self>,
    ) -> Result<Option<Self>, MedallionError> {
        let mut max: Option<Self> = None;
        for value in values {
            max = Some(Self::advance(max.as_ref(), value)?);
        }
        Ok(max)
    }

    /// Kind name, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Timestamp(_) => "timestamp",
            Self::Text(_) => "text",
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for Watermark {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<DateTime<Utc>> for Watermark {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_advance_takes_larger() {
        let current = Watermark::Integer(100);
        assert_eq!(
            Watermark::advance(Some(&current), &Watermark::Integer(105)).unwrap(),
            Watermark::Integer(105)
        );
        assert_eq!(
            Watermark::advance(Some(&current), &Watermark::Integer(90)).unwrap(),
            Watermark::Integer(100)
        );
        assert_eq!(
            Watermark::advance(None, &Watermark::Integer(7)).unwrap(),
            Watermark::Integer(7)
        );
    }

    #[test]
    fn test_mismatched_kinds_error() {
        let err = Watermark::Integer(1)
            .checked_cmp(&Watermark::Text("a".into()))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_watermark");
    }

    #[test]
    fn test_untagged_deserialize() {
        let int: Watermark = serde_json::from_str("105").unwrap();
        assert_eq!(int, Watermark::Integer(105));

        let ts: Watermark = serde_json::from_str(r#""2024-03-01T10:00:00Z""#).unwrap();
        assert_eq!(ts.kind(), "timestamp");

        let text: Watermark = serde_json::from_str(r#""0000A1""#).unwrap();
        assert_eq!(text, Watermark::Text("0000A1".into()));
    }

    #[test]
    fn test_max_of_batch() {
        let batch = [101, 105, 103].map(Watermark::Integer);
        assert_eq!(Watermark::max_of(&batch).unwrap(), Some(Watermark::Integer(105)));
        assert_eq!(Watermark::max_of(&[]).unwrap(), None);
    }

    proptest! {
        #[test]
        fn advance_never_decreases(old in any::<i64>(), batch in proptest::collection::vec(any::<i64>(), 1..20)) {
            let old_mark = Watermark::Integer(old);
            let batch_marks: Vec<Watermark> = batch.iter().copied().map(Watermark::Integer).collect();
            let batch_max = Watermark::max_of(&batch_marks).unwrap().unwrap();
            let advanced = Watermark::advance(Some(&old_mark), &batch_max).unwrap();

            let expected = old.max(*batch.iter().max().unwrap());
            prop_assert_eq!(advanced, Watermark::Integer(expected));
        }
    }
}
