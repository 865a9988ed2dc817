//! Compile-time backend selection.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        use burn::backend::cuda::{Cuda, CudaDevice};

        pub type SelectedBackend = Cuda;
        /// Same device, half-precision floats.
        pub type HalfBackend = Cuda<burn::tensor::f16>;
        pub type SelectedDevice = CudaDevice;

        pub fn create_device() -> SelectedDevice {
            CudaDevice::default()
        }

        pub const fn get_backend_name() -> &'static str {
            "CUDA (NVIDIA GPU)"
        }

        pub const fn supports_reduced_precision() -> bool {
            true
        }
    } else if #[cfg(feature = "wgpu")] {
        use burn::backend::wgpu::{Wgpu, WgpuDevice};

        pub type SelectedBackend = Wgpu;
        /// Same device, half-precision floats.
        pub type HalfBackend = Wgpu<burn::tensor::f16>;
        pub type SelectedDevice = WgpuDevice;

        pub fn create_device() -> SelectedDevice {
            WgpuDevice::default()
        }

        pub const fn get_backend_name() -> &'static str {
            "WGPU (GPU)"
        }

        pub const fn supports_reduced_precision() -> bool {
            true
        }
    } else {
        use burn::backend::ndarray::{NdArray, NdArrayDevice};

        pub type SelectedBackend = NdArray;
        /// The CPU backend trains in full precision only.
        pub type HalfBackend = NdArray;
        pub type SelectedDevice = NdArrayDevice;

        pub fn create_device() -> SelectedDevice {
            NdArrayDevice::default()
        }

        pub const fn get_backend_name() -> &'static str {
            "NdArray (CPU)"
        }

        pub const fn supports_reduced_precision() -> bool {
            false
        }
    }
}
