//! Context Bag
//!
//! Immutable, chainable key/value carrier threaded through every
//! transaction call and handed to error handlers.
//!
//! ## Structure
//! Each derived bag is one node holding a single binding and a pointer to
//! its parent. Deriving never touches the parent, so a bag can be shared
//! freely between threads and across retry iterations.
//!
//! ```text
//!   background ◄── (EnvKey → env) ◄── (ResizeCount → 1) ◄── (ResizeCount → 2)
//! ```
//!
//! Lookups walk towards the root; the newest binding of a key wins.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A key type for values stored in a [`Bag`].
///
/// Keys are identified by their type, so two components can only collide by
/// naming the same type. Keep key types private to scope access.
pub trait BagKey: 'static {
    /// Type of the value bound to this key
    type Value: Any + Send + Sync;
}

struct Node {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Node>>,
}

/// Persistent association from [`BagKey`] types to values
#[derive(Clone, Default)]
pub struct Bag {
    head: Option<Arc<Node>>,
}

impl Bag {
    /// The empty root bag
    pub fn background() -> Self {
        Bag { head: None }
    }

    /// Derive a bag binding `K` to `value`; `self` is left unchanged
    pub fn with<K: BagKey>(&self, value: K::Value) -> Bag {
        Bag {
            head: Some(Arc::new(Node {
                key: TypeId::of::<K>(),
                value: Arc::new(value),
                parent: self.head.clone(),
            })),
        }
    }

    /// Look up the value bound to `K` here or in any parent
    pub fn value<K: BagKey>(&self) -> Option<&K::Value> {
        let key = TypeId::of::<K>();
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            if n.key == key {
                return n.value.downcast_ref::<K::Value>();
            }
            node = n.parent.as_deref();
        }
        None
    }

    pub fn contains<K: BagKey>(&self) -> bool {
        self.value::<K>().is_some()
    }

    /// Number of bindings on the path to the root, shadowed ones included
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut node = self.head.as_deref();
        while let Some(n) = node {
            depth += 1;
            node = n.parent.as_deref();
        }
        depth
    }
}

impl fmt::Debug for Bag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bag").field("depth", &self.depth()).finish()
    }
}
