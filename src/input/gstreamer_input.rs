// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频输入模块
//!
//! 把视频文件或摄像头解码为固定尺寸的 RGB 帧，供线程池逐帧提交。
//!
//! ## URL Scheme
//!
//! - `gst://file/path/to/video.mp4` 视频文件，读到结尾即结束
//! - `gst://camera/dev/video0?width=1280&height=720&fps=30` 摄像头，持续产出
//!
//! 可选参数 `rotate=90|180|270` 旋转画面。
//!
//! 使用前需要安装 GStreamer 开发库：
//!
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```

use std::collections::HashMap;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsink 元素")]
  AppSinkNotFound,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式")]
  UnsupportedFormat,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
}

fn source_pipeline(
  host: Option<&str>,
  path: &str,
  query: &HashMap<String, String>,
) -> Result<String, GStreamerInputError> {
  let parse = |key: &str, default: u32| {
    query
      .get(key)
      .and_then(|v| v.parse::<u32>().ok())
      .unwrap_or(default)
  };

  let source = match host {
    Some("file") => format!("filesrc location={} ! decodebin", path),
    Some("camera") => format!(
      "v4l2src device={} ! video/x-raw,width={},height={},framerate={}/1",
      path,
      parse("width", 1280),
      parse("height", 720),
      parse("fps", 30)
    ),
    _ => return Err(GStreamerInputError::SchemeMismatch),
  };

  let flip = match query.get("rotate").map(String::as_str) {
    Some("90") => " ! videoflip method=clockwise",
    Some("180") => " ! videoflip method=rotate-180",
    Some("270") => " ! videoflip method=counterclockwise",
    _ => "",
  };

  Ok(format!("{}{}", source, flip))
}

/// GStreamer 视频输入
///
/// 视频文件结束或管道出错时迭代结束。
pub struct GStreamerInput<const W: u32, const H: u32> {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for GStreamerInput<W, H> {
  const SCHEME: &'static str = "gst";
}

impl<const W: u32, const H: u32> FromUrl for GStreamerInput<W, H> {
  type Error = GStreamerInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerInputError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let source = source_pipeline(url.host_str(), url.path(), &query)?;
    // 文件源不丢帧，摄像头只保留最新的两帧
    let sink = if url.host_str() == Some("camera") {
      "appsink max-buffers=2 drop=true name=sink"
    } else {
      "appsink max-buffers=4 drop=false name=sink"
    };
    let description = format!(
      "{} ! videoconvert ! videoscale ! video/x-raw,format=RGB,width={},height={} ! {}",
      source, W, H, sink
    );

    gst::init()?;
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkNotFound)?;

    pipeline.set_state(gst::State::Playing)?;

    Ok(GStreamerInput { pipeline, appsink })
  }
}

impl<const W: u32, const H: u32> Drop for GStreamerInput<W, H> {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

impl<const W: u32, const H: u32> Iterator for GStreamerInput<W, H> {
  type Item = RgbNhwcFrame<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    let sample = match self.appsink.pull_sample() {
      Ok(sample) => sample,
      Err(_) => {
        info!("GStreamer 输入结束");
        return None;
      }
    };
    convert_sample(sample)
      .map_err(|e| error!("帧转换失败: {}", e))
      .ok()
  }
}

fn convert_sample<const W: u32, const H: u32>(
  sample: gst::Sample,
) -> Result<RgbNhwcFrame<W, H>, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;

  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;
  if video_info.format() != gst_video::VideoFormat::Rgb {
    return Err(GStreamerInputError::UnsupportedFormat);
  }

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerInputError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;
  let row = width * 3;
  let expected = RgbNhwcFrame::<W, H>::LEN;
  if width != W as usize || height != H as usize || data.len() < stride * (height - 1) + row {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  // 每行可能带有对齐填充
  let mut frame = RgbNhwcFrame::<W, H>::default();
  let frame_slice = frame.as_mut();
  for y in 0..height {
    frame_slice[y * row..(y + 1) * row].copy_from_slice(&data[y * stride..y * stride + row]);
  }

  Ok(frame)
}
