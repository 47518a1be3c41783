//! llama.cpp binding for mobile hosts
//!
//! Exposes three calls (load a GGUF model, generate text, unload) to Android
//! through JNI and to iOS through a C ABI. Inference itself is llama.cpp's
//! job; this crate marshals strings, owns the single global model handle and
//! turns failures into the bool / `"Error: ..."` results the hosts expect.

pub mod android;
pub mod binding;
pub mod ffi;
pub mod inference;
pub mod logging;
pub mod module;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

pub use binding::{generate_text, load_model, unload_model};
