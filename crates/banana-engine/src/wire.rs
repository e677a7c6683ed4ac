use anyhow::{bail, Context, Result};
use banana_contracts::request::{GenerationMode, GenerationRequest};
use banana_contracts::resolution::{closest_aspect_ratio, size_hint, ResolutionTier};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};

use crate::prompt::{framed_prompt, image_order, ImageRole};

const PNG_MIME: &str = "image/png";

#[derive(Debug, Clone)]
pub struct WireImage {
    pub role: ImageRole,
    pub mime_type: &'static str,
    /// Base64 of the lossless PNG encoding.
    pub data: String,
}

impl WireImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Dialect-neutral form of one generation call.
#[derive(Debug, Clone)]
pub struct WirePayload {
    pub mode: GenerationMode,
    pub text: String,
    pub images: Vec<WireImage>,
    pub image_size: ResolutionTier,
    pub aspect_ratio: &'static str,
    pub target: (u32, u32),
}

impl WirePayload {
    pub fn from_request(request: &GenerationRequest, frame_prompts: bool) -> Result<Self> {
        let mut images = Vec::new();
        for role in image_order(request) {
            let png = match role {
                ImageRole::Base => request.base_image().encode_png()?,
                ImageRole::Mask => match request.mask() {
                    Some(mask) => mask.encode_png()?,
                    None => continue,
                },
                ImageRole::Reference => match request.reference_image() {
                    Some(reference) => reference.encode_png()?,
                    None => continue,
                },
            };
            images.push(WireImage {
                role,
                mime_type: PNG_MIME,
                data: BASE64.encode(png),
            });
        }

        let (width, height) = request.target();
        Ok(Self {
            mode: request.mode(),
            text: framed_prompt(request, frame_prompts),
            images,
            image_size: size_hint(width, height),
            aspect_ratio: closest_aspect_ratio(width, height),
            target: (width, height),
        })
    }

    pub fn image(&self, role: ImageRole) -> Option<&WireImage> {
        self.images.iter().find(|image| image.role == role)
    }
}

pub fn gemini_endpoint(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{trimmed}")
    };
    format!("{}/{}:generateContent", api_base.trim_end_matches('/'), model_path)
}

pub fn openrouter_endpoint(api_base: &str) -> String {
    format!("{}/chat/completions", api_base.trim_end_matches('/'))
}

pub fn gemini_body(payload: &WirePayload) -> Value {
    let mut parts = vec![json!({ "text": payload.text })];
    for image in &payload.images {
        parts.push(json!({
            "inlineData": {
                "mimeType": image.mime_type,
                "data": image.data,
            }
        }));
    }
    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "candidateCount": 1,
            "responseModalities": ["TEXT", "IMAGE"],
            "imageConfig": {
                "aspectRatio": payload.aspect_ratio,
                "imageSize": payload.image_size.as_str(),
            },
        },
    })
}

pub fn openrouter_body(payload: &WirePayload, model: &str) -> Value {
    let mut content = vec![json!({ "type": "text", "text": payload.text })];
    for image in &payload.images {
        content.push(json!({
            "type": "image_url",
            "image_url": { "url": image.data_url() },
        }));
    }
    json!({
        "model": model,
        "messages": [{ "role": "user", "content": content }],
        "modalities": ["image", "text"],
        "image_config": {
            "aspect_ratio": payload.aspect_ratio,
            "image_size": payload.image_size.as_str(),
        },
    })
}

/// Pulls the first image out of a response body in either dialect. When no
/// image is present the error carries whatever text the model sent back.
pub fn extract_image(body: &[u8]) -> Result<Vec<u8>> {
    let parsed: Value =
        serde_json::from_slice(body).context("response is not valid JSON")?;
    let mut texts = Vec::new();

    if let Some(bytes) = gemini_image(&parsed, &mut texts)? {
        return Ok(bytes);
    }
    if let Some(bytes) = openrouter_image(&parsed, &mut texts)? {
        return Ok(bytes);
    }

    let said = texts.join(" ");
    if said.trim().is_empty() {
        bail!("response contained no image");
    }
    bail!("response contained no image; model said: {}", truncate_text(said.trim(), 512))
}

fn gemini_image(parsed: &Value, texts: &mut Vec<String>) -> Result<Option<Vec<u8>>> {
    let candidates = parsed
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                texts.push(text.to_string());
            }
            let Some(inline) = part
                .get("inlineData")
                .or_else(|| part.get("inline_data"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            let data = inline_data(inline);
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64
                .decode(data.trim().as_bytes())
                .context("image base64 decode failed")?;
            return Ok(Some(bytes));
        }
    }
    Ok(None)
}

fn inline_data(inline: &Map<String, Value>) -> &str {
    inline
        .get("data")
        .or_else(|| inline.get("bytes"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn openrouter_image(parsed: &Value, texts: &mut Vec<String>) -> Result<Option<Vec<u8>>> {
    let Some(message) = parsed
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
    else {
        return Ok(None);
    };

    let mut urls = Vec::new();
    if let Some(images) = message.get("images").and_then(Value::as_array) {
        urls.extend(images.iter().filter_map(image_url));
    }
    match message.get("content") {
        Some(Value::String(text)) => texts.push(text.clone()),
        Some(Value::Array(parts)) => {
            for part in parts {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    texts.push(text.to_string());
                }
                if let Some(url) = image_url(part) {
                    urls.push(url);
                }
            }
        }
        _ => {}
    }

    for url in urls {
        if url.starts_with("data:image/") {
            return decode_data_url(url).map(Some);
        }
    }
    Ok(None)
}

fn image_url(value: &Value) -> Option<&str> {
    value
        .get("image_url")
        .and_then(|image| image.get("url").or(Some(image)))
        .and_then(Value::as_str)
        .map(str::trim)
}

fn decode_data_url(value: &str) -> Result<Vec<u8>> {
    let (_, payload) = value
        .split_once(',')
        .ok_or_else(|| anyhow::anyhow!("invalid data URL image payload"))?;
    BASE64
        .decode(payload.trim().as_bytes())
        .context("data URL base64 decode failed")
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
