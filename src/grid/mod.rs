//! Grid data model and codec seam.

mod codec;
#[allow(clippy::module_inception)]
mod grid;
mod scalar;

pub use codec::{GridCodec, GridFormat, JsonCodec};
pub use grid::{Grid, Meta, Row};
pub use scalar::Scalar;
