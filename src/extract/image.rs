//! Inline image screening and `cid:` resolution.

use std::io::Cursor;
use std::sync::LazyLock;

use ::image::{ImageFormat, ImageReader};
use base64::Engine as _;
use base64::engine::general_purpose;
use regex::{Captures, Regex};

use crate::config::ProcessingSettings;
use crate::error::ExtractError;
use crate::extract::ExtractedImage;

static CID_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)src="cid:([^"]+)""#).expect("cid pattern compiles"));

/// Formats the model accepts, with the media type sent for each.
fn supported_media_type(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

/// Size, format and dimension gate for inline images.
///
/// The dimension floor screens out signatures, logos and tracking pixels.
#[derive(Debug, Clone)]
pub struct ImageFilter {
    max_bytes: usize,
    min_width: u32,
    min_height: u32,
}

impl ImageFilter {
    pub fn new(max_bytes: usize, min_width: u32, min_height: u32) -> Self {
        Self {
            max_bytes,
            min_width,
            min_height,
        }
    }

    pub fn from_settings(settings: &ProcessingSettings) -> Self {
        Self::new(
            settings.max_image_bytes(),
            settings.min_image_width,
            settings.min_image_height,
        )
    }

    /// Accept or reject one image. Rejection is never fatal to the message.
    ///
    /// The format is sniffed from the bytes; the declared type is only used
    /// in log messages. Dimensions come from the image header.
    pub fn accept(
        &self,
        filename: &str,
        mime_type: &str,
        content_id: Option<String>,
        bytes: Vec<u8>,
    ) -> Result<ExtractedImage, ExtractError> {
        if bytes.len() > self.max_bytes {
            return Err(ExtractError::ImageRejected(format!(
                "{filename}: {} bytes exceeds {} byte limit",
                bytes.len(),
                self.max_bytes
            )));
        }

        let format = ::image::guess_format(&bytes).map_err(|e| {
            ExtractError::ImageRejected(format!("{filename}: not a decodable image ({e})"))
        })?;
        let Some(media_type) = supported_media_type(format) else {
            return Err(ExtractError::ImageRejected(format!(
                "{filename}: unsupported format {format:?} (declared {mime_type})"
            )));
        };
        let (width, height) = ImageReader::with_format(Cursor::new(&bytes), format)
            .into_dimensions()
            .map_err(|e| {
                ExtractError::ImageRejected(format!("{filename}: not a decodable image ({e})"))
            })?;

        if width < self.min_width || height < self.min_height {
            return Err(ExtractError::ImageRejected(format!(
                "{filename}: {width}x{height} below {}x{} minimum",
                self.min_width, self.min_height
            )));
        }

        Ok(ExtractedImage {
            filename: filename.to_string(),
            mime_type: media_type.to_string(),
            content_id,
            size: bytes.len(),
            bytes,
            width: Some(width),
            height: Some(height),
        })
    }
}

/// Replace `src="cid:X"` with a `data:` URI for every accepted image whose
/// content id is `X`. Unmatched references are left untouched.
pub fn resolve_cid_references(html: &str, images: &[ExtractedImage]) -> String {
    if images.is_empty() {
        return html.to_string();
    }
    CID_SRC
        .replace_all(html, |caps: &Captures<'_>| {
            let cid = &caps[1];
            match images
                .iter()
                .find(|img| img.content_id.as_deref() == Some(cid))
            {
                Some(img) => format!(
                    r#"src="data:{};base64,{}""#,
                    img.mime_type,
                    general_purpose::STANDARD.encode(&img.bytes)
                ),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
