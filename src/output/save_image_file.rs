// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/save_image_file.rs - 保存图像文件
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame, output::Render, pool::FrameId};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("帧数据无法转换为图像")]
  InvalidFrame,
}

/// 把已绘制的帧保存为图片
///
/// `image:///out/result.jpg` 每帧覆盖同一个文件；
/// `image:///out/result.jpg?per_frame` 按帧号保存为 `result-000042.jpg`。
pub struct SaveImageFileOutput<const W: u32, const H: u32> {
  path: PathBuf,
  per_frame: bool,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for SaveImageFileOutput<W, H> {
  const SCHEME: &'static str = "image";
}

impl<const W: u32, const H: u32> FromUrl for SaveImageFileOutput<W, H> {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: PathBuf::from(uri.path()),
      per_frame: uri.query_pairs().any(|(k, _)| k == "per_frame"),
    })
  }
}

impl<const W: u32, const H: u32> SaveImageFileOutput<W, H> {
  fn frame_path(&self, id: FrameId) -> PathBuf {
    if !self.per_frame {
      return self.path.clone();
    }
    let stem = self
      .path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "frame".to_string());
    let ext = self
      .path
      .extension()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "png".to_string());
    self.path.with_file_name(format!("{}-{:06}.{}", stem, id, ext))
  }

  fn save_image(&self, path: &Path, image: RgbImage) -> Result<(), SaveImageFileError> {
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save(path)?;
    info!("保存图像到文件: {}", path.display());

    Ok(())
  }
}

impl<const W: u32, const H: u32, D> Render<RgbNhwcFrame<W, H>, D> for SaveImageFileOutput<W, H> {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    id: FrameId,
    frame: &RgbNhwcFrame<W, H>,
    _result: &D,
  ) -> Result<(), Self::Error> {
    let image = RgbImage::from_raw(W, H, frame.clone().into_vec())
      .ok_or(SaveImageFileError::InvalidFrame)?;
    self.save_image(&self.frame_path(id), image)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn saves_per_frame_files() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("image://{}/out/result.png?per_frame", dir.path().display()))
      .unwrap();
    let output = SaveImageFileOutput::<4, 4>::from_url(&url).unwrap();

    let mut frame = RgbNhwcFrame::<4, 4>::default();
    frame.fill([200, 100, 50]);
    output.render_result(3, &frame, &()).unwrap();

    let saved = image::open(dir.path().join("out/result-000003.png"))
      .unwrap()
      .into_rgb8();
    assert_eq!(saved.get_pixel(2, 2).0, [200, 100, 50]);
  }

  #[test]
  fn rejects_other_scheme() {
    let url = Url::parse("gstvideo:///out.mp4").unwrap();
    assert!(matches!(
      SaveImageFileOutput::<4, 4>::from_url(&url),
      Err(SaveImageFileError::SchemeMismatch(_))
    ));
  }
}
