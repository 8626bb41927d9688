// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/gstreamer_video_output.rs - GStreamer 视频文件输出
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

//! # GStreamer 视频文件输出模块
//!
//! 把线程池绘制后的帧按取回顺序编码为视频文件。
//!
//! ## URL Scheme
//!
//! `gstvideo:///output.mp4?fps=25`
//!
//! 按扩展名选择封装：`.mp4`（默认）、`.mkv`、`.avi`、`.webm`。

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame, output::Render, pool::FrameId};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

#[derive(Error, Debug)]
pub enum GStreamerVideoOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 布尔操作错误: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("找不到 appsrc 元素")]
  AppSrcNotFound,
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("状态改变错误: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("帧率无效: {0}")]
  InvalidFps(i32),
}

const DEFAULT_FPS: i32 = 30;

fn encoder_pipeline(path: &str) -> String {
  let (encoder, muxer) = match path.rsplit('.').next() {
    Some("mkv") => ("x264enc speed-preset=fast ! h264parse", "matroskamux"),
    Some("avi") => ("x264enc ! h264parse", "avimux"),
    Some("webm") => ("vp8enc", "webmmux"),
    _ => (
      "x264enc speed-preset=fast tune=zerolatency ! h264parse",
      "mp4mux",
    ),
  };
  format!(
    "appsrc name=src ! videoconvert ! video/x-raw,format=I420 ! {} ! {} ! filesink location={}",
    encoder, muxer, path
  )
}

pub struct GStreamerVideoOutput<const W: u32, const H: u32> {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  fps: i32,
  frame_count: AtomicU64,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for GStreamerVideoOutput<W, H> {
  const SCHEME: &'static str = "gstvideo";
}

impl<const W: u32, const H: u32> FromUrl for GStreamerVideoOutput<W, H> {
  type Error = GStreamerVideoOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!("URI 方案不匹配: 期望 '{}', 实际 '{}'", Self::SCHEME, url.scheme());
      return Err(GStreamerVideoOutputError::SchemeMismatch);
    }

    let fps = url
      .query_pairs()
      .find(|(k, _)| k == "fps")
      .and_then(|(_, v)| v.parse::<i32>().ok())
      .unwrap_or(DEFAULT_FPS);
    if fps <= 0 {
      return Err(GStreamerVideoOutputError::InvalidFps(fps));
    }

    gst::init()?;
    let description = encoder_pipeline(url.path());
    info!("创建视频输出管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerVideoOutputError::PipelineError("无法创建管道".to_string()))?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerVideoOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerVideoOutputError::AppSrcNotFound)?;

    let caps = gst::Caps::builder("video/x-raw")
      .field("format", "RGB")
      .field("width", W as i32)
      .field("height", H as i32)
      .field("framerate", gst::Fraction::new(fps, 1))
      .build();
    appsrc.set_caps(Some(&caps));
    appsrc.set_format(gst::Format::Time);

    pipeline.set_state(gst::State::Playing)?;
    info!("视频输出: {}x{} @ {} fps -> {}", W, H, fps, url.path());

    Ok(GStreamerVideoOutput {
      pipeline,
      appsrc,
      fps,
      frame_count: AtomicU64::new(0),
    })
  }
}

impl<const W: u32, const H: u32> GStreamerVideoOutput<W, H> {
  fn push_frame(&self, data: &[u8]) -> Result<(), GStreamerVideoOutputError> {
    let index = self.frame_count.fetch_add(1, Ordering::Relaxed);
    let frame_ns = 1_000_000_000 / self.fps as u64;

    let mut buffer = gst::Buffer::from_slice(data.to_vec());
    {
      let buffer_ref = buffer
        .get_mut()
        .ok_or_else(|| GStreamerVideoOutputError::PipelineError("缓冲区不可写".to_string()))?;
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(index * frame_ns));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(frame_ns));
    }

    self
      .appsrc
      .push_buffer(buffer)
      .map_err(|e| GStreamerVideoOutputError::PipelineError(format!("推送缓冲区失败: {:?}", e)))?;
    Ok(())
  }
}

impl<const W: u32, const H: u32> Drop for GStreamerVideoOutput<W, H> {
  fn drop(&mut self) {
    if let Err(e) = self.appsrc.end_of_stream() {
      warn!("发送 EOS 失败: {:?}", e);
    }

    // 等待 EOS 到达 filesink，保证文件尾部写完
    if let Some(bus) = self.pipeline.bus() {
      let _ = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(5),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      );
    }

    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止视频输出管道失败: {}", e);
    }
    info!(
      "视频输出关闭，共写入 {} 帧",
      self.frame_count.load(Ordering::Relaxed)
    );
  }
}

impl<const W: u32, const H: u32, D> Render<RgbNhwcFrame<W, H>, D> for GStreamerVideoOutput<W, H> {
  type Error = GStreamerVideoOutputError;

  fn render_result(
    &self,
    _id: FrameId,
    frame: &RgbNhwcFrame<W, H>,
    _result: &D,
  ) -> Result<(), Self::Error> {
    self.push_frame(crate::input::AsNhwcFrame::as_nhwc(frame))
  }
}
