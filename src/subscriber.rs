//! Event streams to drive [`run`](crate::run) with.

pub use crate::object::QualifiedName;

/// A change to the object `key`.
///
/// `entry` is the object as last observed. `exists` is false when the
/// change was a deletion.
pub struct Event<Key, Entry> {
    pub key: Key,
    pub entry: Entry,
    pub exists: bool,
}

pub mod objects;
pub use objects::{objects, with};
