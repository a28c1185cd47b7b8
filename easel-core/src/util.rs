use std::io::Cursor;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;

/// Converts a tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an image into a (1, 3, height, width) tensor scaled to [-1, 1],
/// resizing to the requested dimensions first.
pub fn image_to_tensor(img: &DynamicImage, width: usize, height: usize) -> Result<Tensor> {
    let resized = img.resize_to_fill(width as u32, height as u32, FilterType::CatmullRom);
    let data = resized.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// Encodes an image as PNG bytes.
pub fn image_to_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_round_trips_to_image() {
        let tensor = Tensor::zeros((3, 4, 4), DType::U8, &Device::Cpu).unwrap();
        let img = tensor_to_image(&tensor).unwrap();
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 4);
    }

    #[test]
    fn non_rgb_tensor_is_rejected() {
        let tensor = Tensor::zeros((4, 4, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }

    #[test]
    fn image_tensor_is_batched_and_normalized() {
        let img = DynamicImage::new_rgb8(16, 16);
        let tensor = image_to_tensor(&img, 8, 8).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 8, 8]);
    }

    #[test]
    fn png_bytes_have_magic_header() {
        let img = DynamicImage::new_rgb8(2, 2);
        let bytes = image_to_png(&img).unwrap();
        assert_eq!(&bytes[..4], &[0x89, b'P', b'N', b'G']);
    }
}
