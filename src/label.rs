//! Labels: dense integer identifiers for positions in a listing's
//! instruction stream.
//!
//! Label `0` is reserved for function-level metadata and is never marked by
//! ordinary IR construction. See `spec.md` §3/§4.D.

use cranelift_entity::entity_impl;

/// A symbolic position in a [`crate::listing::Listing`]'s instruction
/// stream, allocated densely by [`crate::listing::Listing::create_label`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);
entity_impl!(Label, "label");

impl Label {
    /// The reserved label identifying function-level metadata (frame
    /// descriptors, catch-table anchors). Never marked directly.
    pub const META: Label = Label(0);
}
