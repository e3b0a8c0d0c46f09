//! Two-tier object caching: a positive cache of resident objects and a
//! negative cache of hashes recently proven absent.

mod key;
mod tagged;

pub use key::KeyCache;
pub use tagged::TaggedCache;
