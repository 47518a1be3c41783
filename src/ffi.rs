//! C ABI for iOS
//!
//! The Objective-C `LlamaInference` class in `bindings/ios` forwards its three
//! methods here. Declarations live in `include/llama_inference.h`.

use std::ffi::{c_char, c_int, CStr, CString};

use crate::binding;
use crate::logging;

/// Reads a borrowed C string, `None` for NULL or invalid UTF-8
///
/// # Safety
/// `ptr` must be NULL or point to a NUL-terminated string.
unsafe fn read_c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    match CStr::from_ptr(ptr).to_str() {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("String from host is not UTF-8: {}", e);
            None
        }
    }
}

/// Moves a string to the caller; interior NULs cannot cross a C string
fn into_c_string(text: String) -> *mut c_char {
    let bytes: Vec<u8> = text.into_bytes().into_iter().filter(|b| *b != 0).collect();
    // No NULs are left, so this cannot fail
    CString::new(bytes).unwrap_or_default().into_raw()
}

/// Loads the GGUF model at `model_path`. Returns false on failure.
///
/// # Safety
/// `model_path` must be NULL or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llama_inference_load_model(model_path: *const c_char) -> bool {
    logging::init();

    match read_c_str(model_path) {
        Some(path) => binding::load_model(path),
        None => false,
    }
}

/// Generates text for `prompt`. Never returns NULL; failures come back as
/// `"Error: ..."`. Release the result with `llama_inference_free_string`.
///
/// # Safety
/// `prompt` must be NULL or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn llama_inference_generate_text(
    prompt: *const c_char,
    max_tokens: c_int,
) -> *mut c_char {
    logging::init();

    let shared = binding::global();
    let text = binding::generate_from_host(
        &shared,
        || read_c_str(prompt).map(str::to_owned),
        max_tokens,
    );
    into_c_string(text)
}

/// Releases the loaded model, if any.
#[no_mangle]
pub extern "C" fn llama_inference_unload_model() {
    logging::init();
    binding::unload_model();
}

/// Frees a string returned by `llama_inference_generate_text`.
///
/// # Safety
/// `s` must be NULL or a pointer obtained from this library, freed once.
#[no_mangle]
pub unsafe extern "C" fn llama_inference_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Library version, statically allocated.
#[no_mangle]
pub extern "C" fn llama_inference_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}
