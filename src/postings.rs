//! Posting list normalization and merging.
//!
//! Everything here is pure: no I/O, and inputs are never mutated in place.
//! Id lists are kept sorted and unique. Term-frequency lists are kept sorted by
//! `(doc_id, count)`.
//!
//! Decoding from raw JSON is permissive. Non-numeric, non-finite and negative
//! entries are dropped and fractional values are truncated, so a bad entry never
//! fails a build.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Document identifier.
pub type DocId = u64;

/// A `(doc_id, count)` pair.
pub type TfPosting = (DocId, u32);

/// Producer-side accumulation of postings keyed by token.
pub type PostingsMap = ahash::AHashMap<String, Postings>;

/// Input accepted by [`normalize_id_list`].
pub enum IdInput<'a> {
    Scalar(DocId),
    Array(&'a [DocId]),
    Iter(Box<dyn Iterator<Item = DocId> + 'a>),
}

impl From<DocId> for IdInput<'_> {
    fn from(id: DocId) -> Self {
        IdInput::Scalar(id)
    }
}

impl<'a> From<&'a [DocId]> for IdInput<'a> {
    fn from(ids: &'a [DocId]) -> Self {
        IdInput::Array(ids)
    }
}

impl<'a> From<&'a Vec<DocId>> for IdInput<'a> {
    fn from(ids: &'a Vec<DocId>) -> Self {
        IdInput::Array(ids.as_slice())
    }
}

fn is_strictly_sorted(ids: &[DocId]) -> bool {
    ids.windows(2).all(|w| w[0] < w[1])
}

fn sort_unique(mut ids: Vec<DocId>) -> Vec<DocId> {
    if !is_strictly_sorted(&ids) {
        ids.sort_unstable();
        ids.dedup();
    }
    ids
}

/// Normalize an id list into sorted, unique order.
///
/// Already sorted, unique arrays are copied after a single scan.
pub fn normalize_id_list<'a>(input: impl Into<IdInput<'a>>) -> Vec<DocId> {
    match input.into() {
        IdInput::Scalar(id) => vec![id],
        IdInput::Array(ids) => {
            if is_strictly_sorted(ids) {
                ids.to_vec()
            } else {
                sort_unique(ids.to_vec())
            }
        }
        IdInput::Iter(iter) => sort_unique(iter.collect()),
    }
}

/// Merge a normalized `left` list with an arbitrary `right` input.
///
/// When the two ranges do not overlap the lists are concatenated without a merge
/// scan. Otherwise a two-pointer merge drops ids present on both sides.
pub fn merge_id_lists<'a>(left: Vec<DocId>, right: impl Into<IdInput<'a>>) -> Vec<DocId> {
    let right = normalize_id_list(right);
    let (Some(&left_first), Some(&left_last)) = (left.first(), left.last()) else {
        return right;
    };
    let (Some(&right_first), Some(&right_last)) = (right.first(), right.last()) else {
        return left;
    };

    if left_last < right_first {
        let mut out = left;
        out.extend_from_slice(&right);
        return out;
    }
    if right_last < left_first {
        let mut out = right;
        out.extend_from_slice(&left);
        return out;
    }

    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        let (a, b) = (left[i], right[j]);
        if a < b {
            out.push(a);
            i += 1;
        } else if b < a {
            out.push(b);
            j += 1;
        } else {
            out.push(a);
            i += 1;
            j += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
    out
}

/// Sort a term-frequency list by `(doc_id, count)` if a single pass finds it
/// out of order.
pub fn normalize_tf_posting_list(list: &[TfPosting]) -> Vec<TfPosting> {
    let mut out = list.to_vec();
    if !out.windows(2).all(|w| w[0] <= w[1]) {
        out.sort_unstable();
    }
    out
}

fn value_to_id(value: &Value) -> Option<DocId> {
    if let Some(id) = value.as_u64() {
        return Some(id);
    }
    let n = value.as_f64()?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some(n.trunc() as DocId)
}

/// Decode and normalize a raw JSON id list (scalar or array).
pub fn normalize_id_value(value: &Value) -> Vec<DocId> {
    match value {
        Value::Array(items) => sort_unique(items.iter().filter_map(value_to_id).collect()),
        other => value_to_id(other).into_iter().collect(),
    }
}

fn value_to_tf(value: &Value) -> Option<TfPosting> {
    let pair = value.as_array()?;
    if pair.len() < 2 {
        return None;
    }
    let doc = value_to_id(&pair[0])?;
    let count = value_to_id(&pair[1])?;
    Some((doc, u32::try_from(count).unwrap_or(u32::MAX)))
}

/// Decode and normalize a raw JSON term-frequency list.
pub fn normalize_tf_value(value: &Value) -> Vec<TfPosting> {
    let list: Vec<TfPosting> = match value {
        Value::Array(items) => items.iter().filter_map(value_to_tf).collect(),
        _ => Vec::new(),
    };
    normalize_tf_posting_list(&list)
}

/// A normalized posting list.
///
/// Serializes as a bare JSON array: `[1, 5, 9]` for ids, `[[1, 2], [5, 1]]` for
/// term frequencies.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "Value")]
pub enum Postings {
    Ids(Vec<DocId>),
    Tf(Vec<TfPosting>),
}

impl Postings {
    pub fn len(&self) -> usize {
        match self {
            Postings::Ids(ids) => ids.len(),
            Postings::Tf(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same postings in normalized order.
    pub fn normalized(self) -> Self {
        match self {
            Postings::Ids(ids) => Postings::Ids(sort_unique(ids)),
            Postings::Tf(list) => Postings::Tf(normalize_tf_posting_list(&list)),
        }
    }

    /// Document ids, dropping counts for term-frequency lists.
    pub fn into_ids(self) -> Vec<DocId> {
        match self {
            Postings::Ids(ids) => ids,
            Postings::Tf(list) => sort_unique(list.into_iter().map(|(doc, _)| doc).collect()),
        }
    }
}

impl From<Vec<DocId>> for Postings {
    fn from(ids: Vec<DocId>) -> Self {
        Postings::Ids(normalize_id_list(&ids))
    }
}

impl From<Value> for Postings {
    /// Any `[doc, count]` element makes the whole list a term-frequency list.
    /// Bare ids inside such a list count once.
    fn from(value: Value) -> Self {
        let Some(items) = value.as_array() else {
            return Postings::Ids(normalize_id_value(&value));
        };
        if !items.iter().any(Value::is_array) {
            return Postings::Ids(normalize_id_value(&value));
        }
        let list: Vec<TfPosting> = items
            .iter()
            .filter_map(|item| match item {
                Value::Array(_) => value_to_tf(item),
                _ => value_to_id(item).map(|doc| (doc, 1)),
            })
            .collect();
        Postings::Tf(normalize_tf_posting_list(&list))
    }
}

impl Serialize for Postings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Postings::Ids(ids) => ids.serialize(serializer),
            Postings::Tf(list) => list.serialize(serializer),
        }
    }
}

/// One row of a run file: a key and its postings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingRow {
    pub key: String,
    pub postings: Postings,
}

impl PostingRow {
    pub fn new<K: Into<String>>(key: K, postings: Postings) -> Self {
        Self {
            key: key.into(),
            postings,
        }
    }
}
