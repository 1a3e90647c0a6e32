use std::collections::BTreeSet;
use std::fmt;
use std::ops::Add;
use std::sync::Arc;

use faststr::FastStr;

use crate::error::{Error, Result};

/// An immutable set of opaque ASCII tokens naming causal points in the
/// transaction log. Sending a session's bookmarks on its next transaction
/// guarantees read-your-writes ordering across the cluster.
///
/// Bookmarks of several sessions combine with `+` (set union):
///
/// ```
/// use graphbolt::Bookmarks;
///
/// let b1 = Bookmarks::from_raw_values(["bm:1"]).unwrap();
/// let b2 = Bookmarks::from_raw_values(["bm:2"]).unwrap();
/// let combined = b1 + b2;
/// assert_eq!(combined.len(), 2);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bookmarks {
    values: Arc<BTreeSet<FastStr>>,
}

impl Bookmarks {
    /// Build a bookmark set from raw server-issued tokens.
    ///
    /// Tokens must be ASCII; anything else was not issued by a server and is
    /// rejected as client misuse.
    pub fn from_raw_values<I, T>(values: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<FastStr>,
    {
        let mut set = BTreeSet::new();
        for value in values {
            let value = value.into();
            if !value.is_ascii() {
                return Err(Error::client(format!(
                    "bookmarks must be ASCII strings, got {value:?}"
                )));
            }
            set.insert(value);
        }
        Ok(Bookmarks {
            values: Arc::new(set),
        })
    }

    pub(crate) fn from_bookmark(bookmark: FastStr) -> Self {
        let mut set = BTreeSet::new();
        set.insert(bookmark);
        Bookmarks {
            values: Arc::new(set),
        }
    }

    pub fn raw_values(&self) -> impl Iterator<Item = &FastStr> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Add for Bookmarks {
    type Output = Bookmarks;

    fn add(self, rhs: Bookmarks) -> Bookmarks {
        if rhs.is_empty() {
            return self;
        }
        if self.is_empty() {
            return rhs;
        }
        let values = self
            .values
            .iter()
            .chain(rhs.values.iter())
            .cloned()
            .collect();
        Bookmarks {
            values: Arc::new(values),
        }
    }
}

impl fmt::Display for Bookmarks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for value in self.values.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            f.write_str(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_commutative() {
        let b1 = Bookmarks::from_raw_values(["bm:1", "bm:2"]).unwrap();
        let b2 = Bookmarks::from_raw_values(["bm:2", "bm:3"]).unwrap();
        assert_eq!(b1.clone() + b2.clone(), b2 + b1);
    }

    #[test]
    fn empty_is_the_identity() {
        let b = Bookmarks::from_raw_values(["bm:1"]).unwrap();
        assert_eq!(b.clone() + Bookmarks::default(), b);
        assert_eq!(Bookmarks::default() + b.clone(), b);
    }

    #[test]
    fn rejects_non_ascii_tokens() {
        assert!(Bookmarks::from_raw_values(["bm:ö"]).is_err());
    }

    #[test]
    fn union_deduplicates() {
        let b1 = Bookmarks::from_raw_values(["bm:1"]).unwrap();
        let b2 = Bookmarks::from_raw_values(["bm:1"]).unwrap();
        assert_eq!((b1 + b2).len(), 1);
    }
}
