//! Attribute tree.
//!
//! Maps hierarchical paths such as `Processes/1000/42/CallStack` to small
//! integer handles, the quarks. Quarks are assigned in creation order, starting
//! from 0, and are never removed nor reused during the lifetime of a state
//! system.

use std::collections::HashMap;
use std::fmt::Display;

use serde::Serialize;

use super::StateSystemError;

/// Raw value used on the wire and by the CLI for "no such attribute".
pub const INVALID_ATTRIBUTE: i32 = -1;

/// Handle of an attribute of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Quark(u32);

impl Quark {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Maps a lookup result to its raw representation.
    ///
    /// ```
    /// use statehist::state::attribute::{AttributeTree, Quark, INVALID_ATTRIBUTE};
    ///
    /// let mut tree = AttributeTree::new();
    /// let q = tree.get_or_create_quark(None, "cpus").unwrap();
    ///
    /// assert_eq!(Quark::to_raw(Some(q)), 0);
    /// assert_eq!(Quark::to_raw(tree.opt_quark(None, "threads")), INVALID_ATTRIBUTE);
    /// ```
    pub fn to_raw(quark: Option<Quark>) -> i32 {
        quark.map_or(INVALID_ATTRIBUTE, |q| q.0 as i32)
    }
}

impl Display for Quark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default, Clone)]
struct Children {
    order: Vec<Quark>,
    by_name: HashMap<String, Quark>,
}

impl Children {
    fn get(&self, name: &str) -> Option<Quark> {
        self.by_name.get(name).copied()
    }

    fn insert(&mut self, name: &str, quark: Quark) {
        self.order.push(quark);
        self.by_name.insert(name.to_string(), quark);
    }
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    parent: Option<Quark>,
    children: Children,
}

/// The attribute tree of a state system.
#[derive(Debug, Default, Clone)]
pub struct AttributeTree {
    nodes: Vec<Node>,
    roots: Children,
}

impl AttributeTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn children(&self, parent: Option<Quark>) -> Option<&Children> {
        match parent {
            None => Some(&self.roots),
            Some(q) => self.nodes.get(q.index()).map(|n| &n.children),
        }
    }

    /// Returns the child `name` of `parent`, creating it if needed. A `None`
    /// parent designates the (unnamed) root of the tree. Fails only if
    /// `parent` does not belong to this tree.
    pub fn get_or_create_quark(
        &mut self,
        parent: Option<Quark>,
        name: &str,
    ) -> Result<Quark, StateSystemError> {
        if let Some(q) = self.opt_quark(parent, name) {
            return Ok(q);
        }

        let quark = Quark::new(self.nodes.len());

        let children = match parent {
            None => &mut self.roots,
            Some(p) => {
                &mut self
                    .nodes
                    .get_mut(p.index())
                    .ok_or(StateSystemError::InvalidAttribute(p))?
                    .children
            }
        };
        children.insert(name, quark);

        self.nodes.push(Node {
            name: name.to_string(),
            parent,
            children: Children::default(),
        });

        Ok(quark)
    }

    /// Returns the child `name` of `parent` without creating it.
    pub fn opt_quark(&self, parent: Option<Quark>, name: &str) -> Option<Quark> {
        self.children(parent)?.get(name)
    }

    /// Returns the quark of `path` starting from the root, creating every
    /// missing segment. The root itself has no quark, so `path` must not be
    /// empty.
    pub fn quark_absolute_and_add<S: AsRef<str>>(
        &mut self,
        path: &[S],
    ) -> Result<Quark, StateSystemError> {
        let (first, rest) = path.split_first().ok_or(StateSystemError::EmptyPath)?;
        let top = self.get_or_create_quark(None, first.as_ref())?;

        self.quark_relative_and_add(top, rest)
    }

    /// Returns the quark of `path` starting from `parent`, creating every
    /// missing segment.
    pub fn quark_relative_and_add<S: AsRef<str>>(
        &mut self,
        parent: Quark,
        path: &[S],
    ) -> Result<Quark, StateSystemError> {
        if !self.contains(parent) {
            return Err(StateSystemError::InvalidAttribute(parent));
        }

        path.iter().try_fold(parent, |current, segment| {
            self.get_or_create_quark(Some(current), segment.as_ref())
        })
    }

    /// Looks `path` up from the root.
    pub fn opt_quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        self.opt_quark_from(None, path)
    }

    /// Looks `path` up from `parent`.
    pub fn opt_quark_relative<S: AsRef<str>>(&self, parent: Quark, path: &[S]) -> Option<Quark> {
        self.opt_quark_from(Some(parent), path)
    }

    fn opt_quark_from<S: AsRef<str>>(&self, parent: Option<Quark>, path: &[S]) -> Option<Quark> {
        if path.is_empty() {
            return parent;
        }

        let mut current = parent;

        for segment in path {
            current = Some(self.opt_quark(current, segment.as_ref())?);
        }

        current
    }

    /// Children of `quark` (or of the root when `None`), in insertion order.
    /// A recursive enumeration walks the subtree depth-first, each node
    /// before its children.
    pub fn sub_attributes(&self, quark: Option<Quark>, recursive: bool) -> Vec<Quark> {
        let mut ret = Vec::new();

        if let Some(children) = self.children(quark) {
            for child in children.order.iter() {
                ret.push(*child);

                if recursive {
                    ret.extend(self.sub_attributes(Some(*child), true));
                }
            }
        }

        ret
    }

    pub fn parent(&self, quark: Quark) -> Option<Quark> {
        self.nodes.get(quark.index()).and_then(|n| n.parent)
    }

    pub fn name(&self, quark: Quark) -> Option<&str> {
        self.nodes.get(quark.index()).map(|n| n.name.as_str())
    }

    /// Path segments of `quark`, from the root down.
    pub fn full_path(&self, quark: Quark) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = Some(quark);

        while let Some(q) = current {
            match self.nodes.get(q.index()) {
                Some(node) => {
                    path.push(node.name.clone());
                    current = node.parent;
                }
                None => break,
            }
        }

        path.reverse();
        path
    }

    pub fn full_path_string(&self, quark: Quark) -> String {
        self.full_path(quark).join("/")
    }

    pub fn contains(&self, quark: Quark) -> bool {
        quark.index() < self.nodes.len()
    }

    /// Number of attributes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over `(name, parent)` in quark order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, Option<Quark>)> {
        self.nodes.iter().map(|n| (n.name.as_str(), n.parent))
    }

    /// Rebuilds a tree from `(name, parent)` entries in quark order. Returns
    /// `None` if a parent does not precede its child or if two siblings
    /// share a name.
    pub(crate) fn from_entries<I>(entries: I) -> Option<Self>
    where
        I: IntoIterator<Item = (String, Option<Quark>)>,
    {
        let mut tree = AttributeTree::new();

        for (name, parent) in entries {
            if let Some(p) = parent {
                if !tree.contains(p) {
                    return None;
                }
            }

            if tree.opt_quark(parent, &name).is_some() {
                return None;
            }

            tree.get_or_create_quark(parent, &name).ok()?;
        }

        Some(tree)
    }
}
