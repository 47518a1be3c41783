//! JNI entry points
//!
//! Native methods of `com.localchatbot.llamamodule.LlamaInference`:
//!
//! ```java
//! public native boolean loadModel(String modelPath);
//! public native String generateText(String prompt, int maxTokens);
//! public native void unloadModel();
//! ```
//!
//! The Java class loads this library with
//! `System.loadLibrary("llama_inference_jni")`.

use jni::objects::{JObject, JString};
use jni::sys::{jboolean, jint, jstring, JNI_FALSE, JNI_TRUE};
use jni::JNIEnv;

use crate::binding;
use crate::logging;

/// Copies a Java string into Rust, `None` for null or a JNI failure
fn read_string(env: &mut JNIEnv, value: &JString) -> Option<String> {
    if value.is_null() {
        return None;
    }
    match env.get_string(value) {
        Ok(s) => Some(s.into()),
        Err(e) => {
            tracing::error!("Failed to read Java string: {}", e);
            None
        }
    }
}

/// Hands a Rust string to Java; null only if the JVM is out of memory
fn new_string(env: &mut JNIEnv, value: &str) -> jstring {
    match env.new_string(value) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            tracing::error!("Failed to create Java string: {}", e);
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_com_localchatbot_llamamodule_LlamaInference_loadModel<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    model_path: JString<'local>,
) -> jboolean {
    logging::init();

    let Some(path) = read_string(&mut env, &model_path) else {
        return JNI_FALSE;
    };

    if binding::load_model(&path) {
        JNI_TRUE
    } else {
        JNI_FALSE
    }
}

#[no_mangle]
pub extern "system" fn Java_com_localchatbot_llamamodule_LlamaInference_generateText<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    prompt: JString<'local>,
    max_tokens: jint,
) -> jstring {
    logging::init();

    let shared = binding::global();
    let text = binding::generate_from_host(
        &shared,
        || read_string(&mut env, &prompt),
        max_tokens,
    );
    new_string(&mut env, &text)
}

#[no_mangle]
pub extern "system" fn Java_com_localchatbot_llamamodule_LlamaInference_unloadModel<'local>(
    _env: JNIEnv<'local>,
    _this: JObject<'local>,
) {
    logging::init();
    binding::unload_model();
}
