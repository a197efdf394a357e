//! Tree-indexed program counter for flow programs
//!
//! A [`FlowPosition`] is the durable program counter of a flow: an ordered
//! path of non-negative integers into the program tree. Length 1 means the
//! flow is at the top level; deeper paths address steps inside nested
//! constructs (branches of an `If`/`Switch`). Because the executor has no
//! language-level call stack across suspensions, the position *is* the
//! resumable continuation - it must be injective and stable across
//! restarts so a resumed flow lands exactly where it left off.
//!
//! # Path shape
//!
//! ```text
//! [2]        step 2 at the top level
//! [2, 1, 0]  step 2 is a branching step; branch slot 1 was taken;
//!            cursor is at step 0 inside that branch
//! ```
//!
//! Entering a branch appends the branch slot, then a fresh cursor.
//! Exiting pops back up. All operations return a new value; positions are
//! cheap to clone and compare.
//!
//! # Example
//!
//! ```rust
//! use sagaflow_store::FlowPosition;
//!
//! let p = FlowPosition::initial();          // [0]
//! let p = p.advance();                      // [1]
//! let p = p.enter_branch(2).enter_branch(0); // [1, 2, 0]
//! assert_eq!(p.current_index(), 0);
//! assert_eq!(p.depth(), 2);
//! assert!(p.is_in_branch());
//!
//! let p = p.exit_branch().exit_branch().advance(); // [2]
//! assert_eq!(p.to_string(), "2");
//! ```

use serde::{Deserialize, Serialize};

/// Program counter for a flow, expressed as a path into the program tree
///
/// Two positions are equal iff their paths are elementwise equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowPosition(Vec<u32>);

impl FlowPosition {
    /// The initial position of every flow: `[0]`
    pub fn initial() -> Self {
        Self(vec![0])
    }

    /// Build a position from an explicit path
    ///
    /// An empty path is normalized to the initial position.
    pub fn from_path(path: Vec<u32>) -> Self {
        if path.is_empty() {
            Self::initial()
        } else {
            Self(path)
        }
    }

    /// The raw path elements
    pub fn path(&self) -> &[u32] {
        &self.0
    }

    /// Index of the current step within its branch (the last path element)
    pub fn current_index(&self) -> u32 {
        self.0.last().copied().unwrap_or(0)
    }

    /// Nesting depth; 0 at the top level
    pub fn depth(&self) -> usize {
        self.0.len().saturating_sub(1)
    }

    /// Whether this position is inside a nested branch
    pub fn is_in_branch(&self) -> bool {
        self.depth() > 0
    }

    /// Move to the next step within the current branch
    pub fn advance(&self) -> Self {
        let mut path = self.0.clone();
        match path.last_mut() {
            Some(last) => *last += 1,
            None => path.push(1),
        }
        Self(path)
    }

    /// Descend into a nested construct, appending one path element
    pub fn enter_branch(&self, index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    /// Pop one path element; no-op when already at the top level
    pub fn exit_branch(&self) -> Self {
        if self.0.len() <= 1 {
            return self.clone();
        }
        let mut path = self.0.clone();
        path.pop();
        Self(path)
    }

    /// The enclosing position (drop-last); the top level is its own parent
    pub fn parent(&self) -> Self {
        self.exit_branch()
    }
}

impl Default for FlowPosition {
    fn default() -> Self {
        Self::initial()
    }
}

impl std::str::FromStr for FlowPosition {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let path = s
            .split('.')
            .map(str::parse)
            .collect::<std::result::Result<Vec<u32>, _>>()?;
        Ok(Self::from_path(path))
    }
}

impl std::fmt::Display for FlowPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for element in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{}", element)?;
            first = false;
        }
        Ok(())
    }
}
