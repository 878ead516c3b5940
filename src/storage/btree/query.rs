use crate::primitives::bytes::ord::prefix_successor;

/// Key selection for scans and range removal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IndexQuery {
    /// Every key.
    All,
    /// Exactly this key.
    Eq(Vec<u8>),
    /// Keys strictly below.
    Lt(Vec<u8>),
    /// Keys at or below.
    Leq(Vec<u8>),
    /// Keys strictly above.
    Gt(Vec<u8>),
    /// Keys at or above.
    Geq(Vec<u8>),
    /// Keys in `[lo, hi)`.
    Range(Vec<u8>, Vec<u8>),
    /// Keys starting with the prefix.
    TruncRight(Vec<u8>),
}

impl IndexQuery {
    /// Whether `key` is selected.
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            IndexQuery::All => true,
            IndexQuery::Eq(k) => key == k.as_slice(),
            IndexQuery::Lt(k) => key < k.as_slice(),
            IndexQuery::Leq(k) => key <= k.as_slice(),
            IndexQuery::Gt(k) => key > k.as_slice(),
            IndexQuery::Geq(k) => key >= k.as_slice(),
            IndexQuery::Range(lo, hi) => key >= lo.as_slice() && key < hi.as_slice(),
            IndexQuery::TruncRight(prefix) => key.starts_with(prefix),
        }
    }

    /// Key an ascending scan seeks to, `None` for the first leaf.
    pub(crate) fn start_key(&self) -> Option<&[u8]> {
        match self {
            IndexQuery::All | IndexQuery::Lt(_) | IndexQuery::Leq(_) => None,
            IndexQuery::Eq(k)
            | IndexQuery::Gt(k)
            | IndexQuery::Geq(k)
            | IndexQuery::Range(k, _)
            | IndexQuery::TruncRight(k) => Some(k),
        }
    }

    /// Key a descending scan seeks to, `None` for the last leaf.
    pub(crate) fn end_key(&self) -> Option<Vec<u8>> {
        match self {
            IndexQuery::All | IndexQuery::Gt(_) | IndexQuery::Geq(_) => None,
            IndexQuery::Eq(k) | IndexQuery::Lt(k) | IndexQuery::Leq(k) => Some(k.clone()),
            IndexQuery::Range(_, hi) => Some(hi.clone()),
            IndexQuery::TruncRight(prefix) => prefix_successor(prefix),
        }
    }

    /// Whether an ascending scan at `key` has passed every match.
    pub(crate) fn past_end(&self, key: &[u8]) -> bool {
        match self {
            IndexQuery::All | IndexQuery::Gt(_) | IndexQuery::Geq(_) => false,
            IndexQuery::Eq(k) | IndexQuery::Leq(k) => key > k.as_slice(),
            IndexQuery::Lt(k) => key >= k.as_slice(),
            IndexQuery::Range(_, hi) => key >= hi.as_slice(),
            IndexQuery::TruncRight(prefix) => key > prefix.as_slice() && !key.starts_with(prefix),
        }
    }

    /// Whether a descending scan at `key` has passed every match.
    pub(crate) fn before_start(&self, key: &[u8]) -> bool {
        match self {
            IndexQuery::All | IndexQuery::Lt(_) | IndexQuery::Leq(_) => false,
            IndexQuery::Eq(k) | IndexQuery::Geq(k) | IndexQuery::Range(k, _) => key < k.as_slice(),
            IndexQuery::Gt(k) => key <= k.as_slice(),
            IndexQuery::TruncRight(prefix) => key < prefix.as_slice(),
        }
    }
}
