//! Web worker entry point for crackdiff comparisons.
//!
//! This crate compiles to a standalone WASM module that runs inside a
//! `Worker`. It receives two decoded RGBA buffers and a `CompareConfig`
//! via `postMessage`, runs `crackdiff_pipeline::worker::handle_request`,
//! and posts progress and the result back.
//!
//! Pixel data travels as raw `Uint8Array` buffers whose underlying
//! `ArrayBuffer`s are transferred, never JSON-encoded. The report is sent
//! as a small JSON string.

use crackdiff_pipeline::worker::{WorkerReply, WorkerRequest, handle_request, image_from_raw};
use crackdiff_pipeline::{CancelFlag, CompareConfig, PipelineError, RgbaImage};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;

/// Message protocol: the main thread sends a JS object with:
/// - `id`: `f64` request id (echoed in every response)
/// - `baselineWidth`, `baselineHeight`: `f64`
/// - `baselinePixels`: `Uint8Array` of RGBA bytes
/// - `currentWidth`, `currentHeight`, `currentPixels`: likewise
/// - `configJson`: `String` containing a JSON-serialized `CompareConfig`
///
/// While running, the worker posts `{ id, kind: "progress", phase }` with
/// `phase` one of `"Matching"`, `"Aligning"`, `"Diffing"`.
///
/// On success it posts `{ id, kind: "done", ok: true, width, height,
/// pixels, reportJson }` where `pixels` is a `Uint8Array` whose buffer is
/// transferred and `reportJson` is the serialized `CompareReport`.
///
/// On error it posts `{ id, kind: "done", ok: false, errorJson }` with a
/// JSON-serialized `PipelineError`.
///
/// # Worker entry point
///
/// Called automatically when the WASM module is instantiated in the
/// worker context.
#[wasm_bindgen(start)]
pub fn worker_main() {
    console_error_panic_hook::set_once();

    let global: web_sys::DedicatedWorkerGlobalScope = js_sys::global()
        .dyn_into()
        .expect_throw("not running in a DedicatedWorkerGlobalScope");

    let onmessage =
        Closure::<dyn FnMut(web_sys::MessageEvent)>::new(move |event: web_sys::MessageEvent| {
            handle_message(&event);
        });
    global.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
    onmessage.forget(); // leak — lives for the worker lifetime
}

/// Handle an incoming message from the main thread.
fn handle_message(event: &web_sys::MessageEvent) {
    let data = event.data();
    let id = get(&data, "id").and_then(|v| v.as_f64()).unwrap_or(-1.0);

    let request = match parse_request(&data, id) {
        Ok(request) => request,
        Err(e) => {
            post_error(id, &e);
            return;
        }
    };

    // Synchronous: blocks this worker thread only.
    handle_request(request, |reply| match reply {
        WorkerReply::Progress { phase, .. } => post_progress(id, &phase.to_string()),
        WorkerReply::Done { outcome, .. } => {
            let report_json = match serde_json::to_string(&outcome.report) {
                Ok(json) => json,
                Err(e) => {
                    post_error(
                        id,
                        &PipelineError::InvalidRequest(format!("failed to serialize report: {e}")),
                    );
                    return;
                }
            };
            post_success(id, &outcome.image, &report_json);
        }
        WorkerReply::Failed { error, .. } => post_error(id, &error),
    });
}

fn parse_request(data: &JsValue, id: f64) -> Result<WorkerRequest, PipelineError> {
    let config_json = get(data, "configJson")
        .and_then(|v| v.as_string())
        .ok_or_else(|| PipelineError::InvalidRequest("missing configJson field".into()))?;
    let config: CompareConfig = serde_json::from_str(&config_json)
        .map_err(|e| PipelineError::InvalidConfig(format!("failed to parse config: {e}")))?;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let id = id.max(0.0) as u64;
    Ok(WorkerRequest {
        id,
        baseline: read_image(data, "baseline")?,
        current: read_image(data, "current")?,
        config,
        // The main thread stops a web worker by terminating it.
        cancel: CancelFlag::new(),
    })
}

/// Read `{prefix}Width`, `{prefix}Height` and `{prefix}Pixels`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn read_image(data: &JsValue, prefix: &str) -> Result<RgbaImage, PipelineError> {
    let dimension = |suffix: &str| {
        get(data, &format!("{prefix}{suffix}"))
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite() && *v >= 0.0 && *v <= f64::from(u32::MAX))
            .map(|v| v as u32)
            .ok_or_else(|| PipelineError::InvalidRequest(format!("missing {prefix}{suffix} field")))
    };
    let width = dimension("Width")?;
    let height = dimension("Height")?;
    let pixels: js_sys::Uint8Array = get(data, &format!("{prefix}Pixels"))
        .and_then(|v| v.dyn_into().ok())
        .ok_or_else(|| PipelineError::InvalidRequest(format!("{prefix}Pixels is not a Uint8Array")))?;
    image_from_raw(width, height, pixels.to_vec())
}

fn get(data: &JsValue, key: &str) -> Option<JsValue> {
    js_sys::Reflect::get(data, &JsValue::from_str(key))
        .ok()
        .filter(|v| !v.is_undefined())
}

fn post_progress(id: f64, phase: &str) {
    let response = js_sys::Object::new();
    set(&response, "id", &JsValue::from_f64(id));
    set(&response, "kind", &JsValue::from_str("progress"));
    set(&response, "phase", &JsValue::from_str(phase));
    post(&response, None);
}

/// Post the highlighted image back, transferring its pixel buffer.
fn post_success(id: f64, image: &RgbaImage, report_json: &str) {
    let pixels = js_sys::Uint8Array::from(image.as_raw().as_slice());
    let response = js_sys::Object::new();
    set(&response, "id", &JsValue::from_f64(id));
    set(&response, "kind", &JsValue::from_str("done"));
    set(&response, "ok", &JsValue::from_bool(true));
    set(&response, "width", &JsValue::from_f64(f64::from(image.width())));
    set(&response, "height", &JsValue::from_f64(f64::from(image.height())));
    set(&response, "pixels", &pixels);
    set(&response, "reportJson", &JsValue::from_str(report_json));

    let transfer = js_sys::Array::new();
    transfer.push(&pixels.buffer());
    post(&response, Some(&transfer));
}

/// Post an error response back to the main thread.
fn post_error(id: f64, error: &PipelineError) {
    let error_json = serde_json::to_string(error).unwrap_or_else(|_| "\"unknown error\"".into());
    let response = js_sys::Object::new();
    set(&response, "id", &JsValue::from_f64(id));
    set(&response, "kind", &JsValue::from_str("done"));
    set(&response, "ok", &JsValue::from_bool(false));
    set(&response, "errorJson", &JsValue::from_str(&error_json));
    post(&response, None);
}

fn set(target: &js_sys::Object, key: &str, value: &JsValue) {
    let _ = js_sys::Reflect::set(target, &JsValue::from_str(key), value);
}

fn post(message: &JsValue, transfer: Option<&js_sys::Array>) {
    let Ok(global) = js_sys::global().dyn_into::<web_sys::DedicatedWorkerGlobalScope>() else {
        return;
    };
    let _ = match transfer {
        Some(transfer) => global.post_message_with_transfer(message, transfer),
        None => global.post_message(message),
    };
}
