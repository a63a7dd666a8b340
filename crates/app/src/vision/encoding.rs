//! JPEG encoding shared by the stream publisher and the snapshot writer.

use actix_web::web::Bytes;
use anyhow::{Result, anyhow};
use image::{RgbImage, codecs::jpeg::JpegEncoder};

/// Encode an RGB image at `quality` (clamped to 1..=100).
pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes> {
    let mut buffer = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn output_is_a_jpeg_stream() {
        let image = RgbImage::from_pixel(32, 24, Rgb([200, 40, 40]));
        let jpeg = encode_jpeg(&image, 50).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn higher_quality_does_not_shrink_output() {
        let image = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 90]));
        let low = encode_jpeg(&image, 10).unwrap();
        let high = encode_jpeg(&image, 95).unwrap();
        assert!(high.len() >= low.len());
    }
}
