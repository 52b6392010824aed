//! GeoPackage reader/writer surface backed by rusqlite.
//!
//! Source layers are read from GeoPackage files into the store, and result
//! tables are written back out as new layers.

mod feature;
#[allow(clippy::module_inception)]
mod gpkg;
mod layer;

pub use feature::GpkgFeature;
pub use gpkg::Gpkg;
pub use layer::GpkgLayer;
