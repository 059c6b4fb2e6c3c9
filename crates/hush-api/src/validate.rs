use hush_db::escalation::Content;

use crate::error::ApiError;

pub const MAX_IMAGE_URL_LEN: usize = 2048;

/// Text and image URL that passed validation, ready for storage.
#[derive(Debug)]
pub struct ValidContent {
    pub text: String,
    pub image_url: Option<String>,
}

impl ValidContent {
    pub fn as_content(&self) -> Content<'_> {
        Content {
            text: &self.text,
            image_url: self.image_url.as_deref(),
        }
    }
}

/// Trim `text` and check it against `max_len` characters. A blank
/// `image_url` counts as absent.
pub fn content(text: &str, image_url: Option<&str>, max_len: usize) -> Result<ValidContent, ApiError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ApiError::validation("content must not be empty"));
    }
    let length = text.chars().count();
    if length > max_len {
        return Err(ApiError::validation(format!(
            "content is {} characters, the limit is {}",
            length, max_len
        )));
    }

    let image_url = match image_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => Some(image(url)?),
        None => None,
    };

    Ok(ValidContent {
        text: text.to_string(),
        image_url,
    })
}

fn image(url: &str) -> Result<String, ApiError> {
    if url.len() > MAX_IMAGE_URL_LEN {
        return Err(ApiError::validation("image_url is too long"));
    }
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| ApiError::validation("image_url must be an http or https URL"))?;
    if rest.is_empty() || rest.starts_with('/') || rest.chars().any(char::is_whitespace) {
        return Err(ApiError::validation("image_url is not a valid URL"));
    }
    Ok(url.to_string())
}
