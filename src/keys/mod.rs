mod canonical;
mod matcher;
mod scheme;

pub use canonical::{canonical_key, is_template_key, template_type_of};
pub use matcher::{BookScope, KeyMatcher, SegmentKeyMatcher};
pub use scheme::*;
