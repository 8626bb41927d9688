// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame};

use image::{ImageReader, RgbImage, imageops::FilterType};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像加载错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 读取单张图片，缩放到 W×H 后作为唯一一帧产出
pub struct ImageFileInput<const W: u32, const H: u32> {
  image: Option<RgbImage>,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for ImageFileInput<W, H> {
  const SCHEME: &'static str = "image";
}

impl<const W: u32, const H: u32> FromUrl for ImageFileInput<W, H> {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemeMismatch);
    }

    let image = ImageReader::open(url.path())?.decode()?;
    debug!("读取图像 {}: {}x{}", url.path(), image.width(), image.height());

    Ok(ImageFileInput {
      image: Some(image.into_rgb8()),
    })
  }
}

impl<const W: u32, const H: u32> From<RgbImage> for ImageFileInput<W, H> {
  fn from(image: RgbImage) -> Self {
    ImageFileInput { image: Some(image) }
  }
}

impl<const W: u32, const H: u32> Iterator for ImageFileInput<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take().and_then(|image| {
      to_frame(image)
        .map_err(|e| error!("图像转换失败: {}", e))
        .ok()
    })
  }
}

fn to_frame<const W: u32, const H: u32>(
  image: RgbImage,
) -> Result<RgbNhwcFrame<W, H>, crate::frame::FrameError> {
  let image = if image.dimensions() == (W, H) {
    image
  } else {
    image::imageops::resize(&image, W, H, FilterType::Triangle)
  };
  RgbNhwcFrame::try_from(image.into_raw())
}

#[cfg(test)]
mod tests {
  use image::Rgb;

  use super::*;

  #[test]
  fn yields_one_resized_frame() {
    let image = RgbImage::from_pixel(8, 4, Rgb([10, 20, 30]));
    let mut input = ImageFileInput::<4, 4>::from(image);

    let frame = input.next().unwrap();
    assert_eq!(frame.pixel(3, 3), Some([10, 20, 30]));
    assert!(input.next().is_none());
  }

  #[test]
  fn reads_from_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.png");
    RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])).save(&path).unwrap();

    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let frames: Vec<_> = ImageFileInput::<2, 2>::from_url(&url).unwrap().collect();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].pixel(0, 0), Some([1, 2, 3]));
  }
}
