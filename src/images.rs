use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::try_join_all;
use thiserror::Error;

pub const MAX_IMAGES: usize = 10;
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("only image uploads are accepted")]
    NotAnImage,
    #[error("images are limited to {} MB each", MAX_IMAGE_BYTES / (1024 * 1024))]
    TooLarge,
    #[error("image processing was interrupted")]
    TaskFailed,
}

/// An uploaded image held in memory for the duration of one send.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub mime: String,
    pub bytes: Vec<u8>,
}

impl ImageAttachment {
    /// Accepts a part that either declares an `image/*` content type or
    /// sniffs as a known image format. The declared type wins when present.
    pub fn new(declared_mime: Option<&str>, bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(ImageError::TooLarge);
        }
        let mime = match declared_mime {
            Some(mime) if mime.starts_with("image/") => mime.to_string(),
            _ => image::guess_format(&bytes)
                .map_err(|_| ImageError::NotAnImage)?
                .to_mime_type()
                .to_string(),
        };
        Ok(ImageAttachment { mime, bytes })
    }

    /// Self-describing reference the upstream provider accepts inline.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.bytes))
    }
}

/// Validate and convert uploads off the async thread, one task per image.
/// Tasks run concurrently with no ordering guarantee among themselves; the
/// returned attachments keep the original selection order.
pub async fn prepare_all(
    parts: Vec<(Option<String>, Vec<u8>)>,
) -> Result<Vec<ImageAttachment>, ImageError> {
    let tasks = parts.into_iter().map(|(mime, bytes)| {
        tokio::task::spawn_blocking(move || ImageAttachment::new(mime.as_deref(), bytes))
    });
    let joined = try_join_all(tasks)
        .await
        .map_err(|_| ImageError::TaskFailed)?;
    joined.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn declared_image_mime_is_kept() {
        let attachment = ImageAttachment::new(Some("image/jpeg"), vec![1, 2, 3]).unwrap();
        assert_eq!(attachment.mime, "image/jpeg");
    }

    #[test]
    fn missing_mime_is_sniffed_from_magic_bytes() {
        let attachment = ImageAttachment::new(None, PNG_MAGIC.to_vec()).unwrap();
        assert_eq!(attachment.mime, "image/png");
    }

    #[test]
    fn non_image_parts_are_rejected() {
        let err = ImageAttachment::new(Some("text/plain"), b"hello".to_vec()).unwrap_err();
        assert!(matches!(err, ImageError::NotAnImage));
    }

    #[test]
    fn oversized_parts_are_rejected() {
        let err = ImageAttachment::new(Some("image/png"), vec![0; MAX_IMAGE_BYTES + 1]).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge));
    }

    #[test]
    fn data_url_embeds_mime_and_base64_payload() {
        let attachment = ImageAttachment::new(Some("image/png"), vec![0, 1, 2]).unwrap();
        assert_eq!(attachment.data_url(), "data:image/png;base64,AAEC");
    }

    #[tokio::test]
    async fn prepare_all_keeps_selection_order() {
        let parts = vec![
            (Some("image/png".to_string()), vec![0]),
            (Some("image/jpeg".to_string()), vec![1]),
            (Some("image/webp".to_string()), vec![2]),
        ];

        let prepared = prepare_all(parts).await.unwrap();
        assert_eq!(prepared.len(), 3);
        assert_eq!(prepared[0].mime, "image/png");
        assert_eq!(prepared[1].mime, "image/jpeg");
        assert_eq!(prepared[2].mime, "image/webp");
        assert_eq!(prepared[2].bytes, vec![2]);
    }

    #[tokio::test]
    async fn prepare_all_surfaces_the_first_bad_part() {
        let parts = vec![
            (Some("image/png".to_string()), vec![0]),
            (Some("application/pdf".to_string()), b"%PDF".to_vec()),
        ];

        let err = prepare_all(parts).await.unwrap_err();
        assert!(matches!(err, ImageError::NotAnImage));
    }
}
