//! Key ranges and the bounds of range views.
//!
//! A range is always stored in ascending terms (`low` <= `high` under the
//! map's ordering). A descending view keeps the same range and flips how
//! user-facing operations map onto it: its "head" is the high end, its
//! FIRST is the engine's LAST, and so on.

use std::cmp::Ordering;

use crate::error::{MapError, MapResult};
use crate::search::SearchKind;

/// Key comparison under the map's or index's ordering
pub(crate) type Compare<'a> = &'a dyn Fn(&[u8], &[u8]) -> Ordering;

/// One end of a range
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Bound {
    pub(crate) key: Vec<u8>,
    pub(crate) inclusive: bool,
}

impl Bound {
    pub(crate) fn new(key: Vec<u8>, inclusive: bool) -> Self {
        Self { key, inclusive }
    }
}

/// Ascending key interval; a missing end is unbounded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct KeyRange {
    low: Option<Bound>,
    high: Option<Bound>,
}

impl KeyRange {
    /// Build a range. Equal ends are accepted even when exclusive; the
    /// range is then empty.
    pub(crate) fn new(low: Option<Bound>, high: Option<Bound>, cmp: Compare<'_>) -> MapResult<Self> {
        if let (Some(low), Some(high)) = (&low, &high) {
            if cmp(&low.key, &high.key) == Ordering::Greater {
                return Err(MapError::InvalidRange { reason: "lower bound is above upper bound".into() });
            }
        }
        Ok(Self { low, high })
    }

    /// True if `key` lies before the low end
    pub(crate) fn below(&self, key: &[u8], cmp: Compare<'_>) -> bool {
        match &self.low {
            Some(low) => match cmp(key, &low.key) {
                Ordering::Less => true,
                Ordering::Equal => !low.inclusive,
                Ordering::Greater => false,
            },
            None => false,
        }
    }

    /// True if `key` lies past the high end
    pub(crate) fn above(&self, key: &[u8], cmp: Compare<'_>) -> bool {
        match &self.high {
            Some(high) => match cmp(key, &high.key) {
                Ordering::Greater => true,
                Ordering::Equal => !high.inclusive,
                Ordering::Less => false,
            },
            None => false,
        }
    }

    pub(crate) fn contains(&self, key: &[u8], cmp: Compare<'_>) -> bool {
        !self.below(key, cmp) && !self.above(key, cmp)
    }

    /// An inclusive bound must lie inside this range; an exclusive one
    /// may sit on a closed end.
    fn admits(&self, bound: &Bound, cmp: Compare<'_>) -> bool {
        if bound.inclusive {
            return self.contains(&bound.key, cmp);
        }
        let under = self.low.as_ref().is_some_and(|low| cmp(&bound.key, &low.key) == Ordering::Less);
        let over = self.high.as_ref().is_some_and(|high| cmp(&bound.key, &high.key) == Ordering::Greater);
        !under && !over
    }

    /// A sub-range. Each given bound must lie within this range; a missing
    /// one is inherited.
    pub(crate) fn narrow(&self, low: Option<Bound>, high: Option<Bound>, cmp: Compare<'_>) -> MapResult<Self> {
        for bound in low.iter().chain(high.iter()) {
            if !self.admits(bound, cmp) {
                return Err(MapError::InvalidRange { reason: "bound lies outside the parent view".into() });
            }
        }
        Self::new(low.or_else(|| self.low.clone()), high.or_else(|| self.high.clone()), cmp)
    }

    fn low_end(&self) -> (SearchKind, Vec<u8>) {
        match &self.low {
            Some(Bound { key, inclusive: true }) => (SearchKind::Ceiling, key.clone()),
            Some(Bound { key, inclusive: false }) => (SearchKind::Higher, key.clone()),
            None => (SearchKind::First, Vec::new()),
        }
    }

    fn high_end(&self) -> (SearchKind, Vec<u8>) {
        match &self.high {
            Some(Bound { key, inclusive: true }) => (SearchKind::Floor, key.clone()),
            Some(Bound { key, inclusive: false }) => (SearchKind::Lower, key.clone()),
            None => (SearchKind::Last, Vec::new()),
        }
    }
}

/// Range plus direction: the shape of a view
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ViewBounds {
    pub(crate) range: KeyRange,
    pub(crate) descending: bool,
}

impl ViewBounds {
    pub(crate) fn reversed(&self) -> Self {
        Self { range: self.range.clone(), descending: !self.descending }
    }

    pub(crate) fn contains(&self, key: &[u8], cmp: Compare<'_>) -> bool {
        self.range.contains(key, cmp)
    }

    /// True if neither end is bounded
    pub(crate) fn is_unbounded(&self) -> bool {
        self.range.low.is_none() && self.range.high.is_none()
    }

    /// Engine search for a search kind in view order.
    ///
    /// Targets outside the range are clamped: a CEILING or HIGHER below the
    /// range starts at its low end, a FLOOR or LOWER above it at its high end.
    pub(crate) fn plan(&self, kind: SearchKind, target: &[u8], cmp: Compare<'_>) -> (SearchKind, Vec<u8>) {
        let kind = if self.descending { kind.descending() } else { kind };
        match kind {
            SearchKind::First => self.range.low_end(),
            SearchKind::Last => self.range.high_end(),
            SearchKind::Ceiling | SearchKind::Higher if self.range.below(target, cmp) => self.range.low_end(),
            SearchKind::Floor | SearchKind::Lower if self.range.above(target, cmp) => self.range.high_end(),
            kind => (kind, target.to_vec()),
        }
    }

    /// Entries before `to` in view order
    pub(crate) fn head(&self, to: Vec<u8>, inclusive: bool, cmp: Compare<'_>) -> MapResult<Self> {
        let bound = Some(Bound::new(to, inclusive));
        let range = if self.descending {
            self.range.narrow(bound, None, cmp)?
        } else {
            self.range.narrow(None, bound, cmp)?
        };
        Ok(Self { range, descending: self.descending })
    }

    /// Entries from `from` on in view order
    pub(crate) fn tail(&self, from: Vec<u8>, inclusive: bool, cmp: Compare<'_>) -> MapResult<Self> {
        let bound = Some(Bound::new(from, inclusive));
        let range = if self.descending {
            self.range.narrow(None, bound, cmp)?
        } else {
            self.range.narrow(bound, None, cmp)?
        };
        Ok(Self { range, descending: self.descending })
    }

    /// Entries between `from` and `to` in view order
    pub(crate) fn sub(&self, from: Bound, to: Bound, cmp: Compare<'_>) -> MapResult<Self> {
        let range = if self.descending {
            self.range.narrow(Some(to), Some(from), cmp)?
        } else {
            self.range.narrow(Some(from), Some(to), cmp)?
        };
        Ok(Self { range, descending: self.descending })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    const CMP: Compare<'static> = &bytewise;

    fn range(low: Option<(u8, bool)>, high: Option<(u8, bool)>) -> KeyRange {
        let bound = |(key, inclusive): (u8, bool)| Bound::new(vec![key], inclusive);
        KeyRange::new(low.map(bound), high.map(bound), CMP).unwrap()
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let err = KeyRange::new(Some(Bound::new(vec![5], true)), Some(Bound::new(vec![3], true)), CMP);
        assert!(matches!(err, Err(MapError::InvalidRange { .. })));
        // Equal exclusive ends: valid and empty
        let empty = range(Some((4, false)), Some((4, false)));
        assert!(!empty.contains(&[4], CMP));
    }

    #[test]
    fn test_contains_respects_inclusivity() {
        let r = range(Some((2, true)), Some((6, false)));
        assert!(r.contains(&[2], CMP));
        assert!(r.contains(&[5], CMP));
        assert!(!r.contains(&[6], CMP));
        assert!(r.below(&[1], CMP));
        assert!(r.above(&[6], CMP));
    }

    #[test]
    fn test_narrow_must_stay_inside() {
        let parent = range(Some((2, false)), Some((8, true)));
        assert!(parent.narrow(Some(Bound::new(vec![2], true)), None, CMP).is_err());
        assert!(parent.narrow(Some(Bound::new(vec![2], false)), None, CMP).is_ok());
        assert!(parent.narrow(None, Some(Bound::new(vec![9], false)), CMP).is_err());

        let child = parent.narrow(None, Some(Bound::new(vec![5], true)), CMP).unwrap();
        assert_eq!(child, range(Some((2, false)), Some((5, true))));
    }

    #[test]
    fn test_plan_clamps_out_of_range_targets() {
        let view = ViewBounds { range: range(Some((10, true)), Some((20, false))), descending: false };
        assert_eq!(view.plan(SearchKind::Ceiling, &[3], CMP), (SearchKind::Ceiling, vec![10]));
        assert_eq!(view.plan(SearchKind::Floor, &[30], CMP), (SearchKind::Lower, vec![20]));
        assert_eq!(view.plan(SearchKind::Floor, &[15], CMP), (SearchKind::Floor, vec![15]));
        assert_eq!(view.plan(SearchKind::First, &[], CMP), (SearchKind::Ceiling, vec![10]));
    }

    #[test]
    fn test_descending_view_maps_head_to_high_end() {
        let desc = ViewBounds::default().reversed();
        let head = desc.head(vec![5], false, CMP).unwrap();
        assert!(head.contains(&[6], CMP));
        assert!(!head.contains(&[5], CMP));
        assert_eq!(head.plan(SearchKind::First, &[], CMP), (SearchKind::Last, vec![]));
        assert_eq!(head.plan(SearchKind::Last, &[], CMP), (SearchKind::Higher, vec![5]));

        // from=8 down to 3 in view order
        let sub = desc.sub(Bound::new(vec![8], true), Bound::new(vec![3], true), CMP).unwrap();
        assert!(sub.contains(&[3], CMP) && sub.contains(&[8], CMP) && !sub.contains(&[9], CMP));
        assert!(desc.sub(Bound::new(vec![3], true), Bound::new(vec![8], true), CMP).is_err());
        assert_eq!(sub.reversed().reversed(), sub);
    }
}
