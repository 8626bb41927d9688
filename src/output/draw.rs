// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use image::{ImageBuffer, Rgb};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::info;

use crate::{
  frame::RgbNhwcFrame,
  model::{DetectItem, DetectResult, WithLabel},
  pool::Annotate,
};

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 20.0;
const LABEL_TEXT_HEIGHT: i32 = 24;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_TEXT_VERTICAL_PADDING: i32 = 2;
const LABEL_COLOR: [u8; 3] = [0, 0, 255]; // 蓝色
const BOX_THICKNESS: i32 = 2;

#[derive(Error, Debug)]
pub enum DrawError {
  #[error("字体文件读取失败: {0}")]
  IoError(#[from] std::io::Error),
  #[error("字体文件无效: {0}")]
  InvalidFont(String),
}

type Canvas<'f> = ImageBuffer<Rgb<u8>, &'f mut [u8]>;

/// 在帧上绘制检测框与标签
///
/// 没有加载字体时只画框。
pub struct Draw {
  font: Option<FontVec>,
  font_size: f32,
  label_text_height: i32,
  label_char_width: f32,
  label_text_vertical_padding: i32,
  label_color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      font: None,
      font_size: LABEL_FONT_SIZE,
      label_text_height: LABEL_TEXT_HEIGHT,
      label_char_width: LABEL_CHAR_WIDTH,
      label_text_vertical_padding: LABEL_TEXT_VERTICAL_PADDING,
      label_color: LABEL_COLOR,
    }
  }
}

impl Draw {
  pub fn with_font_file(mut self, path: impl AsRef<Path>) -> Result<Self, DrawError> {
    let data = std::fs::read(path.as_ref())?;
    let font = FontVec::try_from_vec(data).map_err(|e| DrawError::InvalidFont(e.to_string()))?;
    info!("加载标签字体: {}", path.as_ref().display());
    self.font = Some(font);
    Ok(self)
  }

  pub fn with_color(mut self, color: [u8; 3]) -> Self {
    self.label_color = color;
    self
  }

  /// bbox 为归一化坐标 [x_min, y_min, x_max, y_max]
  fn draw_item<T: WithLabel>(&self, canvas: &mut Canvas<'_>, item: &DetectItem<T>) {
    let (w, h) = (canvas.width() as f32, canvas.height() as f32);
    let (max_x, max_y) = (canvas.width() as i32 - 1, canvas.height() as i32 - 1);

    let x_min = ((item.bbox[0] * w).floor() as i32).clamp(0, max_x);
    let y_min = ((item.bbox[1] * h).floor() as i32).clamp(0, max_y);
    let x_max = ((item.bbox[2] * w).ceil() as i32).clamp(0, max_x);
    let y_max = ((item.bbox[3] * h).ceil() as i32).clamp(0, max_y);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = Rgb(self.label_color);
    for t in 0..BOX_THICKNESS {
      let (width, height) = (x_max - x_min - 2 * t, y_max - y_min - 2 * t);
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32 + 1, height as u32 + 1);
      draw_hollow_rect_mut(canvas, rect, color);
    }

    let Some(font) = &self.font else {
      return;
    };

    let label = format!("{} {:.2}", item.kind.to_label_str(), item.score);
    let text_width = (label.len() as f32 * self.label_char_width) as i32;
    let label_y = (y_min - self.label_text_height).max(0);
    let label_width = text_width.min(max_x + 1 - x_min);
    if label_width <= 0 {
      return;
    }

    let rect = Rect::at(x_min, label_y).of_size(label_width as u32, self.label_text_height as u32);
    draw_filled_rect_mut(canvas, rect, color);
    draw_text_mut(
      canvas,
      Rgb([255u8, 255u8, 255u8]),
      x_min,
      label_y + self.label_text_vertical_padding,
      PxScale::from(self.font_size),
      font,
      &label,
    );
  }
}

impl<const W: u32, const H: u32, T: WithLabel> Annotate<RgbNhwcFrame<W, H>, DetectResult<T>>
  for Draw
{
  fn annotate(&self, frame: &mut RgbNhwcFrame<W, H>, result: &DetectResult<T>) {
    let Some(mut canvas) = Canvas::from_raw(W, H, frame.as_mut()) else {
      return;
    };
    for item in result.items.iter() {
      self.draw_item(&mut canvas, item);
    }
  }
}
