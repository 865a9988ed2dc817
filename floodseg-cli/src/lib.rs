//! Support code for the `train` binary: backend selection and platform detection.

pub mod backend;
pub mod platform;

pub use backend::{
    create_device, get_backend_name, supports_reduced_precision, HalfBackend, SelectedBackend,
    SelectedDevice,
};
