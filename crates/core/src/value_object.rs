//! Value object trait: equality by value, not identity.

/// Marker trait for immutable values compared by their attributes.
///
/// A `Dimension` (variant + location) or a sequence scope is a value object:
/// two of them with the same fields address the same quantity or counter.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
