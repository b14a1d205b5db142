//! Field masks: growable bitsets over a field space.
//!
//! Dependence records and view conditions are all qualified by the set of
//! fields they touch. Masks of different lengths compare and combine by their
//! set bits, so callers never need to agree on a field-space width up front.

use std::fmt;
use vob::Vob;

/// A set of field indices.
#[derive(Clone, Debug)]
pub struct FieldMask {
    bits: Vob,
}

impl Default for FieldMask {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldMask {
    pub fn new() -> Self {
        Self { bits: Vob::new() }
    }

    /// A mask with exactly one field set.
    pub fn from_field(field: usize) -> Self {
        let mut m = Self::new();
        m.set(field);
        m
    }

    pub fn from_fields(fields: &[usize]) -> Self {
        let mut m = Self::new();
        for &f in fields {
            m.set(f);
        }
        m
    }

    fn ensure_len(&mut self, len: usize) {
        if self.bits.len() < len {
            self.bits.resize(len, false);
        }
    }

    pub fn set(&mut self, field: usize) {
        self.ensure_len(field + 1);
        self.bits.set(field, true);
    }

    pub fn contains_field(&self, field: usize) -> bool {
        self.bits.get(field).unwrap_or(false)
    }

    /// OR `other` into `self`. Returns `true` if `self` changed.
    pub fn or_assign(&mut self, other: &FieldMask) -> bool {
        let mut changed = false;
        self.ensure_len(other.bits.len());
        for f in other.bits.iter_set_bits(..) {
            if !self.bits.get(f).unwrap_or(false) {
                self.bits.set(f, true);
                changed = true;
            }
        }
        changed
    }

    /// Remove every field in `other` from `self`.
    pub fn subtract_assign(&mut self, other: &FieldMask) {
        for f in other.bits.iter_set_bits(..) {
            if f >= self.bits.len() {
                break;
            }
            self.bits.set(f, false);
        }
    }

    pub fn union(&self, other: &FieldMask) -> FieldMask {
        let mut m = self.clone();
        m.or_assign(other);
        m
    }

    pub fn subtract(&self, other: &FieldMask) -> FieldMask {
        let mut m = self.clone();
        m.subtract_assign(other);
        m
    }

    pub fn intersect(&self, other: &FieldMask) -> FieldMask {
        let mut m = FieldMask::new();
        for f in self.bits.iter_set_bits(..) {
            if other.contains_field(f) {
                m.set(f);
            }
        }
        m
    }

    /// Is every field of `other` also in `self`?
    pub fn contains(&self, other: &FieldMask) -> bool {
        other.bits.iter_set_bits(..).all(|f| self.contains_field(f))
    }

    pub fn overlaps(&self, other: &FieldMask) -> bool {
        self.bits.iter_set_bits(..).any(|f| other.contains_field(f))
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter_set_bits(..).next().is_none()
    }

    pub fn iter_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_set_bits(..)
    }
}

impl PartialEq for FieldMask {
    fn eq(&self, other: &Self) -> bool {
        self.bits.iter_set_bits(..).eq(other.bits.iter_set_bits(..))
    }
}

impl Eq for FieldMask {}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, b) in self.bits.iter_set_bits(..).enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{b}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_idempotent() {
        let mut a = FieldMask::from_fields(&[0, 3]);
        let b = FieldMask::from_fields(&[3, 7]);
        assert!(a.or_assign(&b));
        assert!(!a.or_assign(&b));
        assert_eq!(a, FieldMask::from_fields(&[0, 3, 7]));
    }

    #[test]
    fn lengths_do_not_matter() {
        let a = FieldMask::from_field(1);
        let mut b = FieldMask::from_fields(&[1, 200]);
        b.subtract_assign(&FieldMask::from_field(200));
        assert_eq!(a, b);
        assert!(a.contains(&b) && b.contains(&a));
    }

    #[test]
    fn subtract_and_overlap() {
        let a = FieldMask::from_fields(&[0, 1, 2]);
        let b = FieldMask::from_fields(&[1, 5]);
        assert!(a.overlaps(&b));
        let c = a.subtract(&b);
        assert_eq!(c, FieldMask::from_fields(&[0, 2]));
        assert!(!c.overlaps(&b));
        assert!(c.subtract(&a).is_empty());
    }
}
