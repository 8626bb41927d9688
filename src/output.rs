// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 输出定义
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

use crate::frame::RgbNhwcFrame;
use crate::model::{DetectResult, WithLabel};
use crate::pool::FrameId;
use crate::{FromUrl, FromUrlWithScheme};
use thiserror::Error;
use url::Url;

/// 处理一帧的输出
///
/// `frame` 是线程池绘制后的图像，`result` 是同一帧的检测结果。
pub trait Render<Frame, Output>: Sized {
  type Error;
  fn render_result(&self, id: FrameId, frame: &Frame, result: &Output) -> Result<(), Self::Error>;
}

#[cfg(feature = "save_image_file")]
pub mod draw;

#[cfg(feature = "save_image_file")]
mod save_image_file;
#[cfg(feature = "save_image_file")]
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[cfg(feature = "gstreamer_output")]
mod gstreamer_video_output;
#[cfg(feature = "gstreamer_output")]
pub use self::gstreamer_video_output::{GStreamerVideoOutput, GStreamerVideoOutputError};

mod detection_log;
pub use self::detection_log::{DetectionLog, DetectionLogError};

#[derive(Error, Debug)]
pub enum OutputError {
  #[cfg(feature = "save_image_file")]
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[cfg(feature = "gstreamer_output")]
  #[error("GStreamer 视频输出错误: {0}")]
  GStreamerVideoOutputError(#[from] GStreamerVideoOutputError),
  #[error("检测记录错误: {0}")]
  DetectionLogError(#[from] DetectionLogError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 按 URL 方案选择的输出
pub enum OutputWrapper<const W: u32, const H: u32> {
  #[cfg(feature = "save_image_file")]
  SaveImageFileOutput(SaveImageFileOutput<W, H>),
  #[cfg(feature = "gstreamer_output")]
  GStreamerVideoOutput(GStreamerVideoOutput<W, H>),
  DetectionLog(DetectionLog),
}

impl<const W: u32, const H: u32> FromUrl for OutputWrapper<W, H> {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "save_image_file")]
    if url.scheme() == SaveImageFileOutput::<W, H>::SCHEME {
      let output = SaveImageFileOutput::from_url(url)?;
      return Ok(OutputWrapper::SaveImageFileOutput(output));
    }
    #[cfg(feature = "gstreamer_output")]
    if url.scheme() == GStreamerVideoOutput::<W, H>::SCHEME {
      let output = GStreamerVideoOutput::from_url(url)?;
      return Ok(OutputWrapper::GStreamerVideoOutput(output));
    }
    if url.scheme() == DetectionLog::SCHEME {
      let output = DetectionLog::from_url(url)?;
      return Ok(OutputWrapper::DetectionLog(output));
    }
    Err(OutputError::SchemeMismatch(url.scheme().to_string()))
  }
}

impl<const W: u32, const H: u32, T: WithLabel> Render<RgbNhwcFrame<W, H>, DetectResult<T>>
  for OutputWrapper<W, H>
{
  type Error = OutputError;

  fn render_result(
    &self,
    id: FrameId,
    frame: &RgbNhwcFrame<W, H>,
    result: &DetectResult<T>,
  ) -> Result<(), Self::Error> {
    match self {
      #[cfg(feature = "save_image_file")]
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(id, frame, result)
        .map_err(OutputError::from),
      #[cfg(feature = "gstreamer_output")]
      OutputWrapper::GStreamerVideoOutput(output) => output
        .render_result(id, frame, result)
        .map_err(OutputError::from),
      OutputWrapper::DetectionLog(output) => output
        .render_result(id, frame, result)
        .map_err(OutputError::from),
    }
  }
}

/// 同时写入两个输出，例如保存视频的同时记录检测结果
pub struct Tee<A, B>(pub A, pub Option<B>);

impl<F, D, A, B> Render<F, D> for Tee<A, B>
where
  A: Render<F, D>,
  B: Render<F, D>,
  A::Error: Into<OutputError>,
  B::Error: Into<OutputError>,
{
  type Error = OutputError;

  fn render_result(&self, id: FrameId, frame: &F, result: &D) -> Result<(), Self::Error> {
    self.0.render_result(id, frame, result).map_err(Into::into)?;
    if let Some(second) = &self.1 {
      second.render_result(id, frame, result).map_err(Into::into)?;
    }
    Ok(())
  }
}
