//! Scripted transport shared by the client and orchestrator tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use banana_contracts::image::Image;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, Rgb, RgbImage};
use serde_json::json;
use tokio::time::Instant;

use crate::credentials::Credentials;
use crate::transport::{GenerationTransport, TransportError, WireResponse};
use crate::wire::WirePayload;

pub(crate) enum Step {
    Respond(WireResponse),
    Fail(TransportError),
    /// Responds after a delay, unless the call is dropped first.
    Delayed(Duration, WireResponse),
    Hang,
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    payloads: Mutex<Vec<WirePayload>>,
}

impl ScriptedTransport {
    pub(crate) fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().expect("call times").clone()
    }

    pub(crate) fn payloads(&self) -> Vec<WirePayload> {
        self.payloads.lock().expect("payloads").clone()
    }
}

#[async_trait]
impl GenerationTransport for ScriptedTransport {
    async fn send(
        &self,
        payload: &WirePayload,
        _credentials: &Credentials,
        _timeout: Duration,
    ) -> Result<WireResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().expect("call times").push(Instant::now());
        self.payloads.lock().expect("payloads").push(payload.clone());
        let step = self.script.lock().expect("script").pop_front();
        match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Delayed(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Some(Step::Hang) | None => std::future::pending().await,
        }
    }
}

pub(crate) fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Image {
    Image::from_dynamic(DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb(rgb),
    )))
}

pub(crate) fn status(code: u16) -> WireResponse {
    WireResponse {
        status: code,
        body: format!("{{\"error\":{{\"code\":{code}}}}}").into_bytes(),
        retry_after: None,
    }
}

/// A 200 carrying `image` as Gemini inline data.
pub(crate) fn image_response(image: &Image) -> WireResponse {
    let png = image.encode_png().expect("png");
    let body = json!({
        "candidates": [{ "content": { "parts": [
            { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(png) } }
        ]}}]
    });
    WireResponse {
        status: 200,
        body: body.to_string().into_bytes(),
        retry_after: None,
    }
}
