use std::sync::OnceLock;

use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};
use tracing::{debug, info};

const CUDA_LIBRARIES: [&str; 3] = [
    "libtorch_cuda.so",
    "libtorch_cuda_cu.so",
    "libtorch_cuda_cpp.so",
];

/// Preload libtorch's CUDA libraries so `tch` can see the GPU backend.
///
/// Some libtorch builds only register CUDA when these are loaded with
/// `RTLD_GLOBAL` before the first tensor op. The handles live for the rest of
/// the process. Returns how many libraries were loaded.
pub(crate) fn load_torch_cuda_runtime() -> usize {
    static LOADED: OnceLock<Vec<Library>> = OnceLock::new();
    LOADED
        .get_or_init(|| {
            let mut handles = Vec::new();
            for lib in CUDA_LIBRARIES {
                // SAFETY: loading libtorch's own shared objects runs only their
                // static initialisers, which have no preconditions.
                match unsafe { Library::open(Some(lib), RTLD_NOW | RTLD_GLOBAL) } {
                    Ok(handle) => {
                        debug!("Loaded {lib}");
                        handles.push(handle);
                    }
                    Err(err) => debug!("Could not load {lib}: {err}"),
                }
            }
            info!(
                loaded = handles.len(),
                "libtorch CUDA runtime preload finished"
            );
            handles
        })
        .len()
}
