//! Tree-position identifiers.
//!
//! A cluster is named by the sequence of child-slot indices leading from the
//! root cluster to it. The root is the empty path; depth equals path length.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId(Vec<u16>);

impl ClusterId {
    #[inline]
    #[must_use]
    pub const fn root() -> Self {
        Self(Vec::new())
    }

    #[inline]
    #[must_use]
    pub fn from_path(path: Vec<u16>) -> Self {
        Self(path)
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &[u16] {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    #[inline]
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn child(&self, slot: u16) -> Self {
        let mut path = Vec::with_capacity(self.0.len() + 1);
        path.extend_from_slice(&self.0);
        path.push(slot);
        Self(path)
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, prefix) = self.0.split_last()?;
        Some(Self(prefix.to_vec()))
    }

    /// Slot this cluster occupies under its parent.
    #[inline]
    #[must_use]
    pub fn slot(&self) -> Option<u16> {
        self.0.last().copied()
    }

    #[must_use]
    pub fn is_parent_of(&self, other: &Self) -> bool {
        other.0.len() == self.0.len() + 1 && other.0.starts_with(&self.0)
    }

    #[inline]
    #[must_use]
    pub fn is_child_of(&self, other: &Self) -> bool {
        other.is_parent_of(self)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for slot in &self.0 {
            write!(f, "/{slot}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root() {
        let root = ClusterId::root();
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
        assert_eq!(root.parent(), None);
        assert_eq!(root.slot(), None);
        assert_eq!(root.to_string(), "/");
    }

    #[test]
    fn test_parent_child_relation() {
        let root = ClusterId::root();
        let c1 = root.child(1);
        let c10 = c1.child(0);

        assert!(root.is_parent_of(&c1));
        assert!(c1.is_child_of(&root));
        assert!(c1.is_parent_of(&c10));
        assert_eq!(c10.parent(), Some(c1.clone()));
        assert_eq!(c10.slot(), Some(0));
        assert_eq!(c10.depth(), 2);
        assert_eq!(c10.to_string(), "/1/0");

        // Grandparent and siblings are not parent/child.
        assert!(!root.is_parent_of(&c10));
        assert!(!root.child(0).is_parent_of(&c10));
        assert!(!c1.is_parent_of(&c1));
    }
}
