use serde::{Deserialize, Serialize};

use super::{JoinError, Lattice, PointText};
use crate::keys::{KeyError, PrivateKey, PublicKey, Signature, order_signatures};

/// A leaf value: some text and the signatures over it.
///
/// Points are identified by their text. Two points with the same text join by
/// unioning their signatures.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Point {
    text: PointText,
    signatures: Vec<Signature>,
}

impl Point {
    pub fn new(text: impl Into<PointText>, signatures: impl IntoIterator<Item = Signature>) -> Self {
        Self {
            text: text.into(),
            signatures: order_signatures(signatures.into_iter().collect()),
        }
    }

    pub fn unsigned(text: impl Into<PointText>) -> Self {
        Self::new(text, Vec::<Signature>::new())
    }

    /// Create a point signed by each of `keys`.
    pub fn signed(text: impl Into<PointText>, keys: &[PrivateKey]) -> Result<Self, KeyError> {
        let text = text.into();
        let signatures = keys
            .iter()
            .map(|key| key.sign(text.as_str().as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(text, signatures))
    }

    pub fn text(&self) -> &PointText {
        &self.text
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn join(&self, other: &Point) -> Result<Point, JoinError> {
        if self.text != other.text {
            return Err(JoinError::TextMismatch(
                self.text.clone(),
                other.text.clone(),
            ));
        }
        Ok(self.join_signatures(&other.signatures))
    }

    fn join_signatures(&self, signatures: &[Signature]) -> Point {
        let mut all = self.signatures.clone();
        all.extend_from_slice(signatures);
        Point {
            text: self.text.clone(),
            signatures: order_signatures(all),
        }
    }

    /// True iff any signature verifies under any of `keys`.
    pub fn is_verified_by_any(&self, keys: &[PublicKey]) -> bool {
        let msg = self.text.as_str().as_bytes();
        self.signatures
            .iter()
            .any(|sig| keys.iter().any(|key| key.verify(msg, sig)))
    }

    /// Restore signature order after deserializing from an untrusted source.
    pub(crate) fn normalize(&mut self) {
        self.signatures = order_signatures(std::mem::take(&mut self.signatures));
    }
}

/// A set of points, sorted and unique by text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Entry {
    set: Vec<Point>,
}

impl Entry {
    pub fn new(points: impl IntoIterator<Item = Point>) -> Self {
        Self {
            set: coalesce(points.into_iter().collect()),
        }
    }

    pub fn single(point: Point) -> Self {
        Self { set: vec![point] }
    }

    pub fn points(&self) -> &[Point] {
        &self.set
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn get(&self, text: &str) -> Option<&Point> {
        self.set
            .binary_search_by(|point| point.text.as_str().cmp(text))
            .ok()
            .map(|i| &self.set[i])
    }

    pub fn contains_text(&self, text: &str) -> bool {
        self.get(text).is_some()
    }

    /// Keep only points verified by at least one of `keys`.
    pub fn filter_verified(&self, keys: &[PublicKey]) -> Entry {
        Self {
            set: self
                .set
                .iter()
                .filter(|point| point.is_verified_by_any(keys))
                .cloned()
                .collect(),
        }
    }
}

impl Lattice for Entry {
    fn join(&self, other: &Self) -> Self {
        if other.set.is_empty() {
            return self.clone();
        }
        let mut points = Vec::with_capacity(self.set.len() + other.set.len());
        points.extend_from_slice(&self.set);
        points.extend_from_slice(&other.set);
        Self {
            set: coalesce(points),
        }
    }

    fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Sort by text and merge points that share a text.
fn coalesce(mut points: Vec<Point>) -> Vec<Point> {
    points.sort_by(|a, b| a.text.cmp(&b.text));
    let mut out: Vec<Point> = Vec::with_capacity(points.len());
    for mut point in points {
        match out.last_mut() {
            Some(last) if last.text == point.text => {
                *last = last.join_signatures(&point.signatures);
            }
            _ => {
                point.normalize();
                out.push(point);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_rejects_different_text() {
        let a = Point::unsigned("a");
        let b = Point::unsigned("b");
        assert!(matches!(a.join(&b), Err(JoinError::TextMismatch(..))));
    }

    #[test]
    fn entry_merges_signatures_per_text() {
        let k1 = PrivateKey::generate();
        let k2 = PrivateKey::generate();
        let a = Entry::single(Point::signed("v", &[k1.clone()]).unwrap());
        let b = Entry::new([
            Point::signed("v", &[k2.clone()]).unwrap(),
            Point::unsigned("w"),
        ]);
        let joined = a.join(&b);
        assert_eq!(joined.len(), 2);
        let v = joined.get("v").unwrap();
        assert_eq!(v.signatures().len(), 2);
        assert!(v.is_verified_by_any(&[k1.public_key()]));
        assert!(v.is_verified_by_any(&[k2.public_key()]));
        assert!(joined.contains_text("w"));
        assert!(!joined.contains_text("x"));
    }

    #[test]
    fn signature_fidelity() {
        let signer = PrivateKey::generate();
        let stranger = PrivateKey::generate();
        let point = Point::signed("hello", &[signer.clone()]).unwrap();
        assert!(point.is_verified_by_any(&[stranger.public_key(), signer.public_key()]));
        assert!(!point.is_verified_by_any(&[stranger.public_key()]));
        assert!(!point.is_verified_by_any(&[]));
        assert!(!Point::unsigned("hello").is_verified_by_any(&[signer.public_key()]));

        // a signature over different text does not carry over
        let moved = Point::new("other", point.signatures().to_vec());
        assert!(!moved.is_verified_by_any(&[signer.public_key()]));
    }

    #[test]
    fn filter_verified_drops_unsigned() {
        let key = PrivateKey::generate();
        let entry = Entry::new([
            Point::signed("a", &[key.clone()]).unwrap(),
            Point::unsigned("b"),
        ]);
        let filtered = entry.filter_verified(&[key.public_key()]);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_text("a"));
        assert!(entry.filter_verified(&[]).is_empty());
    }
}
