//! Ordered sets of non-negative integers
//!
//! [`IdSet`] is a growable bitset used for every rank set in the monitor.
//! Its canonical string form compresses consecutive runs into ranges, e.g.
//! `{0,1,2,3,7}` encodes as `"0-3,7"`. Decoding also accepts the bracketed
//! form `"[0-3,7]"`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const WORD_BITS: u32 = 64;

/// Errors produced while decoding an idset string
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdSetError {
    /// An element of the encoding is not a number or range
    #[error("error parsing '{token}': {reason}")]
    Parse {
        /// Offending token
        token: String,
        /// What was wrong with it
        reason: String,
    },

    /// A range whose upper bound is below its lower bound
    #[error("range '{lo}-{hi}' is reversed")]
    ReversedRange {
        /// Lower bound as written
        lo: u32,
        /// Upper bound as written
        hi: u32,
    },

    /// Opening or closing bracket without its partner
    #[error("unbalanced brackets in '{0}'")]
    UnbalancedBrackets(String),
}

/// A set of rank ids backed by a bitmap
#[derive(Clone, Default)]
pub struct IdSet {
    words: Vec<u64>,
}

impl IdSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Create an empty set with room for ids `[0, capacity)` preallocated
    pub fn with_capacity(capacity: u32) -> Self {
        let nwords = capacity.div_ceil(WORD_BITS) as usize;
        Self {
            words: vec![0; nwords],
        }
    }

    /// Create a set containing every id in `[0, size)`
    pub fn full(size: u32) -> Self {
        let mut set = Self::with_capacity(size);
        if size > 0 {
            set.range_set(0, size - 1);
        }
        set
    }

    fn locate(id: u32) -> (usize, u64) {
        ((id / WORD_BITS) as usize, 1u64 << (id % WORD_BITS))
    }

    /// Add `id` to the set
    pub fn set(&mut self, id: u32) {
        let (word, mask) = Self::locate(id);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= mask;
    }

    /// Remove `id` from the set
    pub fn clear(&mut self, id: u32) {
        let (word, mask) = Self::locate(id);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !mask;
        }
    }

    /// Test membership of `id`
    pub fn test(&self, id: u32) -> bool {
        let (word, mask) = Self::locate(id);
        self.words.get(word).is_some_and(|w| w & mask != 0)
    }

    /// Add every id in the inclusive range `[lo, hi]`
    pub fn range_set(&mut self, lo: u32, hi: u32) {
        if lo > hi {
            return;
        }
        let last = (hi / WORD_BITS) as usize;
        if last >= self.words.len() {
            self.words.resize(last + 1, 0);
        }
        self.apply_range(lo, hi, |w, mask| *w |= mask);
    }

    /// Remove every id in the inclusive range `[lo, hi]`.
    ///
    /// Only words already allocated are touched, so the cost is bounded by
    /// the size of `self` rather than by `hi`.
    pub fn range_clear(&mut self, lo: u32, hi: u32) {
        let Some(max) = self.max_id() else {
            return;
        };
        if lo > hi || lo > max {
            return;
        }
        self.apply_range(lo, hi.min(max), |w, mask| *w &= !mask);
    }

    /// Largest id the allocated words can hold
    fn max_id(&self) -> Option<u32> {
        let bits = self.words.len() as u64 * u64::from(WORD_BITS);
        bits.checked_sub(1)
            .map(|max| max.min(u64::from(u32::MAX)) as u32)
    }

    /// Apply `op` to each word overlapping `[lo, hi]` with the mask of
    /// bits inside the range. The words must already exist.
    fn apply_range(&mut self, lo: u32, hi: u32, op: impl Fn(&mut u64, u64)) {
        let first = (lo / WORD_BITS) as usize;
        let last = (hi / WORD_BITS) as usize;
        for i in first..=last {
            let lo_bit = if i == first { lo % WORD_BITS } else { 0 };
            let hi_bit = if i == last { hi % WORD_BITS } else { WORD_BITS - 1 };
            let mask = (u64::MAX >> (WORD_BITS - 1 - hi_bit)) & (u64::MAX << lo_bit);
            op(&mut self.words[i], mask);
        }
    }

    /// Number of members
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True if the set has no members
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// Iterate members in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let base = i as u32 * WORD_BITS;
            let mut bits = word;
            std::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let tz = bits.trailing_zeros();
                bits &= bits - 1;
                Some(base + tz)
            })
        })
    }

    /// Smallest member, if any
    pub fn first(&self) -> Option<u32> {
        self.iter().next()
    }

    /// Largest member, if any
    pub fn last(&self) -> Option<u32> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i as u32 * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros()))
    }

    /// Members of `self` that are not in `other` (`self - other`)
    pub fn difference(&self, other: &IdSet) -> IdSet {
        let words = self
            .words
            .iter()
            .enumerate()
            .map(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0))
            .collect();
        IdSet { words }
    }

    /// Add every member of `other` to `self`
    pub fn add(&mut self, other: &IdSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    /// Remove every member of `other` from `self`
    pub fn subtract(&mut self, other: &IdSet) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w &= !o;
        }
    }

    /// Decode `s` and remove the ids it names from `self`.
    ///
    /// Ranges are clamped to the ids `self` can hold, so a large range
    /// costs no more than the set itself. On a parse error `self` is
    /// unchanged.
    pub fn decode_subtract(&mut self, s: &str) -> Result<(), IdSetError> {
        for (lo, hi) in parse_ranges(s)? {
            self.range_clear(lo, hi);
        }
        Ok(())
    }

    /// Encode as a comma separated list of ids and ranges, e.g. `"0-3,7"`
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut run: Option<(u32, u32)> = None;
        let flush = |out: &mut String, lo: u32, hi: u32| {
            if !out.is_empty() {
                out.push(',');
            }
            if lo == hi {
                out.push_str(&lo.to_string());
            } else {
                out.push_str(&format!("{}-{}", lo, hi));
            }
        };
        for id in self.iter() {
            run = match run {
                Some((lo, hi)) if hi + 1 == id => Some((lo, id)),
                Some((lo, hi)) => {
                    flush(&mut out, lo, hi);
                    Some((id, id))
                }
                None => Some((id, id)),
            };
        }
        if let Some((lo, hi)) = run {
            flush(&mut out, lo, hi);
        }
        out
    }

    /// Decode a string produced by [`IdSet::encode`], optionally bracketed
    pub fn decode(s: &str) -> Result<IdSet, IdSetError> {
        let mut set = IdSet::new();
        for (lo, hi) in parse_ranges(s)? {
            set.range_set(lo, hi);
        }
        Ok(set)
    }
}

/// Parse an encoded idset into inclusive ranges, in input order
fn parse_ranges(s: &str) -> Result<Vec<(u32, u32)>, IdSetError> {
    let trimmed = s.trim();
    let body = match (trimmed.starts_with('['), trimmed.ends_with(']')) {
        (true, true) => &trimmed[1..trimmed.len() - 1],
        (false, false) => trimmed,
        _ => return Err(IdSetError::UnbalancedBrackets(s.to_string())),
    };
    let mut ranges = Vec::new();
    if body.is_empty() {
        return Ok(ranges);
    }
    for token in body.split(',') {
        let range = match token.split_once('-') {
            Some((lo, hi)) => {
                let lo = parse_id(token, lo)?;
                let hi = parse_id(token, hi)?;
                if hi < lo {
                    return Err(IdSetError::ReversedRange { lo, hi });
                }
                (lo, hi)
            }
            None => {
                let id = parse_id(token, token)?;
                (id, id)
            }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

fn parse_id(token: &str, digits: &str) -> Result<u32, IdSetError> {
    let digits = digits.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IdSetError::Parse {
            token: token.to_string(),
            reason: "expected a non-negative integer or range".to_string(),
        });
    }
    digits.parse::<u32>().map_err(|e| IdSetError::Parse {
        token: token.to_string(),
        reason: e.to_string(),
    })
}

impl PartialEq for IdSet {
    fn eq(&self, other: &Self) -> bool {
        let n = self.words.len().max(other.words.len());
        (0..n).all(|i| {
            self.words.get(i).copied().unwrap_or(0) == other.words.get(i).copied().unwrap_or(0)
        })
    }
}

impl Eq for IdSet {}

impl fmt::Display for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdSet[{}]", self.encode())
    }
}

impl FromStr for IdSet {
    type Err = IdSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IdSet::decode(s)
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = IdSet::new();
        for id in iter {
            set.set(id);
        }
        set
    }
}

impl Serialize for IdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for IdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        IdSet::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_test() {
        let mut set = IdSet::with_capacity(4);
        set.set(1);
        set.set(130);
        assert!(set.test(1));
        assert!(set.test(130));
        assert!(!set.test(2));
        set.clear(130);
        assert!(!set.test(130));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_encode_ranges() {
        let set: IdSet = [0, 1, 2, 3, 7, 9, 10].into_iter().collect();
        assert_eq!(set.encode(), "0-3,7,9-10");
        assert_eq!(IdSet::new().encode(), "");
        assert_eq!(IdSet::full(1).encode(), "0");
    }

    #[test]
    fn test_decode() {
        let set = IdSet::decode("0-3,7").unwrap();
        assert_eq!(set.count(), 5);
        assert!(set.test(7));
        assert_eq!(IdSet::decode("[1,3-4]").unwrap().encode(), "1,3-4");
        assert!(IdSet::decode("").unwrap().is_empty());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            IdSet::decode("1,x"),
            Err(IdSetError::Parse { .. })
        ));
        assert_eq!(
            IdSet::decode("5-2"),
            Err(IdSetError::ReversedRange { lo: 5, hi: 2 })
        );
        assert!(matches!(
            IdSet::decode("[0-3"),
            Err(IdSetError::UnbalancedBrackets(_))
        ));
        assert!(IdSet::decode("-1").is_err());
    }

    #[test]
    fn test_set_algebra() {
        let a = IdSet::decode("0-5").unwrap();
        let b = IdSet::decode("4-8").unwrap();
        assert_eq!(a.difference(&b).encode(), "0-3");
        assert_eq!(b.difference(&a).encode(), "6-8");

        let mut u = a.clone();
        u.add(&b);
        assert_eq!(u.encode(), "0-8");

        u.subtract(&IdSet::decode("2,7").unwrap());
        assert_eq!(u.encode(), "0-1,3-6,8");
    }

    #[test]
    fn test_decode_subtract_leaves_set_on_error() {
        let mut set = IdSet::full(4);
        assert!(set.decode_subtract("1-").is_err());
        assert_eq!(set.encode(), "0-3");
        set.decode_subtract("1,3").unwrap();
        assert_eq!(set.encode(), "0,2");
    }

    #[test]
    fn test_decode_subtract_huge_range_keeps_capacity() {
        let mut set = IdSet::full(4);
        let words = set.words.len();
        set.decode_subtract("3-400000000").unwrap();
        assert_eq!(set.encode(), "0-2");
        set.decode_subtract("4294967295,0").unwrap();
        assert_eq!(set.encode(), "1-2");
        assert_eq!(set.words.len(), words);

        let mut empty = IdSet::new();
        empty.decode_subtract("0-4294967295").unwrap();
        assert!(empty.words.is_empty());
    }

    #[test]
    fn test_word_ranges() {
        let mut set = IdSet::new();
        set.range_set(60, 130);
        assert_eq!(set.count(), 71);
        assert_eq!(set.encode(), "60-130");
        set.range_clear(63, 128);
        assert_eq!(set.encode(), "60-62,129-130");
        set.range_set(0, 0);
        set.range_clear(130, u32::MAX);
        assert_eq!(set.encode(), "0,60-62,129");
    }

    #[test]
    fn test_equality_ignores_capacity() {
        let mut a = IdSet::with_capacity(1024);
        a.set(3);
        let b: IdSet = [3].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_first_last() {
        let set = IdSet::decode("5,64-70").unwrap();
        assert_eq!(set.first(), Some(5));
        assert_eq!(set.last(), Some(70));
        assert_eq!(IdSet::new().last(), None);
    }
}
