use anyhow::anyhow;
use bytes::Bytes;
use image::DynamicImage;

/// A mild 3x3 sharpening kernel, normalised to a sum of 1.
const SHARPEN_KERNEL: [f32; 9] = [
    -1.0 / 24.0, -1.0 / 24.0, -1.0 / 24.0,
    -1.0 / 24.0, 32.0 / 24.0, -1.0 / 24.0,
    -1.0 / 24.0, -1.0 / 24.0, -1.0 / 24.0,
];

/// Decodes the image, applies a mild sharpen and re-encodes it as lossy WebP.
///
/// The quality must be between 0.0 and 100.0 inclusive for minimal and
/// maximal quality respectively.
pub fn sharpen_and_encode(data: &[u8], quality: f32) -> anyhow::Result<Bytes> {
    let img = image::load_from_memory(data)?;
    let sharpened = into_encodable(img).filter3x3(&SHARPEN_KERNEL);
    encode_webp(&sharpened, quality)
}

#[inline]
pub fn encode_webp(img: &DynamicImage, quality: f32) -> anyhow::Result<Bytes> {
    let encoder = webp::Encoder::from_image(img).map_err(|e| anyhow!("unsupported pixel layout: {}", e))?;
    let encoded = encoder.encode(quality.clamp(0.0, 100.0));
    Ok(Bytes::from(encoded.to_vec()))
}

/// The WebP encoder only accepts 8-bit RGB or RGBA pixel data.
fn into_encodable(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img,
        other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.to_rgba8()),
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}
