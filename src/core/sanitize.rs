//! Shrinks tool output before it is sent back to the model.
//!
//! Tools can return screenshots or large datasets meant for the user. Those
//! are shown in full locally, while the model only sees a short placeholder.

use serde_json::Value;
use std::borrow::Cow;

pub const IMAGE_FIELDS: [&str; 5] = ["base64", "image", "image_data", "data", "screenshot"];

pub const TRUNCATED_PLACEHOLDER: &str = "[Content truncated - data displayed to user]";
pub const RAW_IMAGE_PLACEHOLDER: &str = "[Image data - displayed to user]";
pub const SCREENSHOT_PLACEHOLDER: &str =
    "[Screenshot image captured successfully. The image is displayed to the user.]";

const METADATA_PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SanitizeLimits {
    /// Longest content sent to the model unchanged
    pub max_content_chars: usize,
    /// Minimum length of an image field before it is considered image data
    pub min_image_field_chars: usize,
    /// Minimum length of bare content before it is checked for base64
    pub min_raw_image_chars: usize,
    pub base64_min_chars: usize,
    pub base64_sample_chars: usize,
    pub base64_min_ratio: f64,
    /// Budget for the whole history sent to the model
    pub max_history_chars: usize,
}

impl Default for SanitizeLimits {
    fn default() -> Self {
        Self {
            max_content_chars: 5_000,
            min_image_field_chars: 1_000,
            min_raw_image_chars: 5_000,
            base64_min_chars: 100,
            base64_sample_chars: 200,
            base64_min_ratio: 0.95,
            max_history_chars: 50_000,
        }
    }
}

/// An image payload found inside tool output.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    pub field: Option<String>,
    pub data: String,
    /// The remaining non-image fields, abbreviated
    pub metadata: Vec<(String, String)>,
}

impl ImagePayload {
    pub fn placeholder(&self) -> String {
        match self.field.as_deref() {
            Some("screenshot") => SCREENSHOT_PLACEHOLDER.to_string(),
            Some(_) => {
                let others = self
                    .metadata
                    .iter()
                    .map(|(key, value)| format!("{key}: {value}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                if others.is_empty() {
                    "[Image data received. The image is displayed to the user.]".to_string()
                } else {
                    format!("[Image data received. Other fields: {others}]")
                }
            }
            None => RAW_IMAGE_PLACEHOLDER.to_string(),
        }
    }
}

/// Heuristic base64 check on a leading sample of the string.
pub fn looks_like_base64(text: &str, limits: &SanitizeLimits) -> bool {
    let text = strip_data_url(text);
    if text.len() < limits.base64_min_chars {
        return false;
    }
    let sample: Vec<char> = text.chars().take(limits.base64_sample_chars).collect();
    let valid = sample
        .iter()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .count();
    valid as f64 / sample.len() as f64 > limits.base64_min_ratio
}

fn strip_data_url(text: &str) -> &str {
    match text.strip_prefix("data:") {
        Some(rest) => rest.split_once(";base64,").map_or(text, |(_, data)| data),
        None => text,
    }
}

/// Looks for image data: first in the known fields of a JSON object (or its
/// nested `result` object), then in the content itself.
pub fn find_image(content: &str, limits: &SanitizeLimits) -> Option<ImagePayload> {
    if content.len() < limits.min_image_field_chars {
        return None;
    }
    if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(content) {
        if let Some(payload) = image_in_object(&object, limits) {
            return Some(payload);
        }
        if let Some(Value::Object(nested)) = object.get("result") {
            if let Some(payload) = image_in_object(nested, limits) {
                return Some(payload);
            }
        }
        if let Some(Value::String(nested)) = object.get("result") {
            if let Some(payload) = find_image(nested, limits) {
                return Some(payload);
            }
        }
    }
    if content.len() > limits.min_raw_image_chars && looks_like_base64(content.trim(), limits) {
        return Some(ImagePayload {
            field: None,
            data: content.trim().to_string(),
            metadata: Vec::new(),
        });
    }
    None
}

fn image_in_object(
    object: &serde_json::Map<String, Value>,
    limits: &SanitizeLimits,
) -> Option<ImagePayload> {
    let (field, data) = IMAGE_FIELDS.iter().find_map(|field| {
        let value = object.get(*field)?.as_str()?;
        (value.len() > limits.min_image_field_chars && looks_like_base64(value, limits))
            .then(|| ((*field).to_string(), value.to_string()))
    })?;
    let metadata = object
        .iter()
        .filter(|(key, _)| key.as_str() != field)
        .map(|(key, value)| {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (key.clone(), abbreviate(&rendered, METADATA_PREVIEW_CHARS))
        })
        .collect();
    Some(ImagePayload {
        field: Some(field),
        data,
        metadata,
    })
}

fn abbreviate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut short: String = text.chars().take(max_chars).collect();
    short.push_str("...");
    short
}

/// The text the model sees for `content`.
pub fn sanitize_for_model<'a>(content: &'a str, limits: &SanitizeLimits) -> Cow<'a, str> {
    if let Some(image) = find_image(content, limits) {
        return Cow::Owned(image.placeholder());
    }
    if content.chars().count() > limits.max_content_chars {
        return Cow::Borrowed(TRUNCATED_PLACEHOLDER);
    }
    Cow::Borrowed(content)
}

/// Index of the first entry to keep so the kept suffix fits `max_chars`.
/// The newest entry is always kept.
pub fn history_window(lengths: &[usize], max_chars: usize) -> usize {
    let mut total = 0usize;
    for (index, length) in lengths.iter().enumerate().rev() {
        total = total.saturating_add(*length);
        if total > max_chars && index + 1 < lengths.len() {
            return index + 1;
        }
    }
    0
}
