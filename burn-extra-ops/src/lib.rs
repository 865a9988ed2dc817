//! Tensor operations used by the vision backbones that Burn does not ship.
//!
//! - [`DropPath`]: stochastic depth, active only on autodiff backends.
//! - [`erfinv`] and [`trunc_normal`]: truncated-normal weight initialization.
//! - [`roll`]: cyclic shift along one or more dimensions.

mod drop_path;
mod erfinv;
mod roll;
mod trunc_normal;

pub use drop_path::{DropPath, DropPathConfig};
pub use erfinv::{erfinv, Erfinv};
pub use roll::roll;
pub use trunc_normal::trunc_normal;
