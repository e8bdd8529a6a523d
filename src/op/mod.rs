//! Operation framework: the authenticated-operation driver and the
//! concrete operations built on it.

mod base;
pub(crate) mod entity;
pub(crate) mod feature;
pub(crate) mod grid;
pub(crate) mod his;

pub use base::RetryPolicy;
pub use entity::{Entity, EntityMap};
pub use feature::FeatureMap;
pub use grid::GridPayload;
pub use his::HisRange;
