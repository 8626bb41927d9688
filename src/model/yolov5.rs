// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/yolov5.rs - YOLOv5 模型与后处理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use tracing::debug;

use crate::model::{DetectItem, DetectResult, WithLabel};

pub const YOLOV5_NUM_OUTPUTS: usize = 3;
pub const YOLOV5_CLASS_NUM: usize = 80;
pub const YOLOV5_INPUT_W: f32 = 640.0;
pub const YOLOV5_INPUT_H: f32 = 640.0;
pub const YOLOV5_HEAD_SIZES: [(usize, usize); 3] = [(80, 80), (40, 40), (20, 20)];
pub const YOLOV5_STRIDES: [f32; 3] = [8.0, 16.0, 32.0];
pub const YOLOV5_ANCHORS: [[f32; 6]; 3] = [
  [10.0, 13.0, 16.0, 30.0, 33.0, 23.0],
  [30.0, 61.0, 62.0, 45.0, 59.0, 119.0],
  [116.0, 90.0, 156.0, 198.0, 373.0, 326.0],
];
pub const YOLOV5_CONF_THRESH: f32 = 0.25;
pub const YOLOV5_NMS_THRESH: f32 = 0.45;

const ANCHORS_PER_HEAD: usize = 3;
const PROP_SIZE: usize = 5 + YOLOV5_CLASS_NUM;

/// 检测头参数
#[derive(Debug, Clone, Copy)]
pub struct Head {
  pub grid_h: usize,
  pub grid_w: usize,
  pub stride: f32,
  pub anchors: [f32; 6],
}

impl Head {
  pub fn standard() -> [Head; 3] {
    std::array::from_fn(|i| Head {
      grid_h: YOLOV5_HEAD_SIZES[i].0,
      grid_w: YOLOV5_HEAD_SIZES[i].1,
      stride: YOLOV5_STRIDES[i],
      anchors: YOLOV5_ANCHORS[i],
    })
  }

  fn expected_len(&self) -> usize {
    ANCHORS_PER_HEAD * PROP_SIZE * self.grid_h * self.grid_w
  }
}

/// 解码一个检测头的输出
///
/// 输出按 NCHW 排列，形状为 `[1, 3 * 85, grid_h, grid_w]`，模型已包含 sigmoid。
/// 返回的边框已按输入尺寸归一化。
pub fn decode_head<T: WithLabel>(
  tensor: &[f32],
  head: &Head,
  conf_threshold: f32,
  items: &mut Vec<DetectItem<T>>,
) {
  let spatial = head.grid_h * head.grid_w;
  if tensor.len() < head.expected_len() {
    debug!(
      "检测头输出大小不足: 实际 {}, 期望 {}",
      tensor.len(),
      head.expected_len()
    );
    return;
  }

  for a in 0..ANCHORS_PER_HEAD {
    let base = a * PROP_SIZE * spatial;
    for i in 0..head.grid_h {
      for j in 0..head.grid_w {
        let idx = i * head.grid_w + j;
        let at = |k: usize| tensor[base + k * spatial + idx];

        let box_confidence = at(4);
        if box_confidence < conf_threshold {
          continue;
        }

        let (class_score, class_id) = (0..YOLOV5_CLASS_NUM)
          .map(|c| (at(5 + c), c))
          .fold((f32::MIN, 0usize), |best, cur| if cur.0 > best.0 { cur } else { best });

        let score = box_confidence * class_score;
        if score < conf_threshold {
          continue;
        }

        let cx = (at(0) * 2.0 - 0.5 + j as f32) * head.stride;
        let cy = (at(1) * 2.0 - 0.5 + i as f32) * head.stride;
        let w = (at(2) * 2.0).powi(2) * head.anchors[a * 2];
        let h = (at(3) * 2.0).powi(2) * head.anchors[a * 2 + 1];

        let x_min = (cx - w / 2.0).clamp(0.0, YOLOV5_INPUT_W);
        let y_min = (cy - h / 2.0).clamp(0.0, YOLOV5_INPUT_H);
        let x_max = (cx + w / 2.0).clamp(0.0, YOLOV5_INPUT_W);
        let y_max = (cy + h / 2.0).clamp(0.0, YOLOV5_INPUT_H);

        items.push(DetectItem {
          kind: T::from_label_id(class_id as u32),
          score,
          bbox: [
            x_min / YOLOV5_INPUT_W,
            y_min / YOLOV5_INPUT_H,
            x_max / YOLOV5_INPUT_W,
            y_max / YOLOV5_INPUT_H,
          ],
        });
      }
    }
  }
}

/// 按类别做非极大值抑制，结果按置信度降序排列
pub fn nms<T: WithLabel>(mut items: Vec<DetectItem<T>>, iou_threshold: f32) -> Vec<DetectItem<T>> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut keep: Vec<DetectItem<T>> = Vec::with_capacity(items.len());
  for item in items {
    let suppressed = keep.iter().any(|k| {
      k.kind.to_label_id() == item.kind.to_label_id() && iou(&k.bbox, &item.bbox) > iou_threshold
    });
    if !suppressed {
      keep.push(item);
    }
  }
  keep
}

/// 计算两个边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

/// 三个检测头的完整后处理
pub fn postprocess<T: WithLabel>(
  outputs: &[&[f32]],
  conf_threshold: f32,
  nms_threshold: f32,
) -> DetectResult<T> {
  let mut items = Vec::new();
  for (tensor, head) in outputs.iter().zip(Head::standard().iter()) {
    decode_head(tensor, head, conf_threshold, &mut items);
  }
  debug!("NMS 前候选框数量: {}", items.len());
  let items = nms(items, nms_threshold);
  debug!("检测到 {} 个物体", items.len());
  DetectResult::from(items)
}

#[cfg(feature = "model_yolov5")]
pub use self::rknn::{Yolov5, Yolov5Builder, Yolov5Error};

#[cfg(feature = "model_yolov5")]
mod rknn {
  use std::marker::PhantomData;

  use rknpu::{Context, InitFlags, TensorType};
  use thiserror::Error;
  use tracing::{debug, error, info};
  use url::Url;

  use super::{YOLOV5_CONF_THRESH, YOLOV5_NMS_THRESH, YOLOV5_NUM_OUTPUTS, postprocess};
  use crate::{
    FromUrl, FromUrlWithScheme,
    input::AsNhwcFrame,
    model::{CocoLabel, DetectResult, Model, ModelBuilder},
  };

  #[derive(Error, Debug)]
  pub enum Yolov5Error {
    #[error("模型加载错误: {0}")]
    ModelLoadError(#[from] std::io::Error),
    #[error("模型无效: {0}")]
    ModelInvalid(String),
    #[error("RKNN 错误: {0}")]
    RknnError(#[from] rknpu::Error),
    #[error("模型路径错误: {0}")]
    ModelPathError(String),
  }

  /// 从 `yolov5:///path/to/model.rknn?conf=0.25&nms=0.45` 构建
  #[derive(Debug, Clone)]
  pub struct Yolov5Builder {
    model_path: String,
    conf_threshold: f32,
    nms_threshold: f32,
  }

  impl FromUrlWithScheme for Yolov5Builder {
    const SCHEME: &'static str = "yolov5";
  }

  impl FromUrl for Yolov5Builder {
    type Error = Yolov5Error;

    fn from_url(url: &Url) -> Result<Self, Self::Error> {
      if url.scheme() != Self::SCHEME {
        return Err(Yolov5Error::ModelPathError(format!(
          "模型路径必须使用 {} 方案",
          Self::SCHEME
        )));
      }

      let query = |key: &str| {
        url
          .query_pairs()
          .find(|(k, _)| k == key)
          .and_then(|(_, v)| v.parse::<f32>().ok())
      };

      Ok(Yolov5Builder {
        model_path: url.path().to_string(),
        conf_threshold: query("conf").unwrap_or(YOLOV5_CONF_THRESH),
        nms_threshold: query("nms").unwrap_or(YOLOV5_NMS_THRESH),
      })
    }
  }

  impl ModelBuilder for Yolov5Builder {
    type Model = Yolov5<crate::frame::RgbNhwcFrame<640, 640>>;
    type Error = Yolov5Error;

    fn build(&self) -> Result<Self::Model, Self::Error> {
      self.build_for()
    }
  }

  impl Yolov5Builder {
    pub fn build_for<Frame>(&self) -> Result<Yolov5<Frame>, Yolov5Error> {
      info!("加载模型文件: {}", self.model_path);
      let model_data = std::fs::read(&self.model_path)?;
      debug!(
        "模型文件大小: {:.2} MB",
        model_data.len() as f64 / (1024.0 * 1024.0)
      );

      let context = Context::new(&model_data, InitFlags::default())?;

      let num_inputs = context.num_inputs()?;
      let num_outputs = context.num_outputs()?;
      if num_inputs != 1 || num_outputs as usize != YOLOV5_NUM_OUTPUTS {
        error!(
          "模型输入/输出数量不符: 输入 {}, 输出 {}, 期望 1/{}",
          num_inputs, num_outputs, YOLOV5_NUM_OUTPUTS
        );
        return Err(Yolov5Error::ModelInvalid(format!(
          "输入 {}, 输出 {}",
          num_inputs, num_outputs
        )));
      }

      info!("模型加载完成");
      Ok(Yolov5 {
        context,
        conf_threshold: self.conf_threshold,
        nms_threshold: self.nms_threshold,
        _phantom: PhantomData,
      })
    }
  }

  pub struct Yolov5<Frame> {
    context: Context,
    conf_threshold: f32,
    nms_threshold: f32,
    _phantom: PhantomData<Frame>,
  }

  impl<Frame: AsNhwcFrame> Model for Yolov5<Frame> {
    type Input = Frame;
    type Output = DetectResult<CocoLabel>;
    type Error = Yolov5Error;

    fn infer(&mut self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
      debug!("设置模型输入");
      self.context.set_input(
        0,
        input.as_nhwc(),
        rknpu::TensorFormat::NHWC,
        TensorType::UInt8,
      )?;

      debug!("执行模型推理");
      self.context.run()?;

      let output = self.context.get_outputs()?;
      let mut heads = Vec::with_capacity(YOLOV5_NUM_OUTPUTS);
      for idx in 0..YOLOV5_NUM_OUTPUTS {
        heads.push(output.get_f32(idx)?);
      }

      Ok(postprocess(&heads, self.conf_threshold, self.nms_threshold))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::CocoLabel;

  fn item(class: u32, score: f32, bbox: [f32; 4]) -> DetectItem<CocoLabel> {
    DetectItem {
      kind: CocoLabel::from_label_id(class),
      score,
      bbox,
    }
  }

  #[test]
  fn iou_of_identical_and_disjoint_boxes() {
    let a = [0.0, 0.0, 0.5, 0.5];
    assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    assert_eq!(iou(&a, &[0.6, 0.6, 0.9, 0.9]), 0.0);
  }

  #[test]
  fn nms_suppresses_only_same_class() {
    let items = vec![
      item(0, 0.6, [0.0, 0.0, 0.5, 0.5]),
      item(0, 0.9, [0.01, 0.01, 0.5, 0.5]),
      item(1, 0.7, [0.0, 0.0, 0.5, 0.5]),
    ];
    let kept = nms(items, 0.45);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].score, 0.9);
    assert_eq!(kept[1].kind.to_label_id(), 1);
  }

  #[test]
  fn decode_single_cell() {
    let head = Head {
      grid_h: 2,
      grid_w: 2,
      stride: 320.0,
      anchors: [160.0, 160.0, 0.0, 0.0, 0.0, 0.0],
    };
    let spatial = 4;
    let mut tensor = vec![0.0f32; 3 * PROP_SIZE * spatial];
    // anchor 0, cell (0, 0): centre 0.5 -> (0.5 * 2 - 0.5) * 320 = 160
    let cell = 0;
    tensor[cell] = 0.5;
    tensor[spatial + cell] = 0.5;
    tensor[2 * spatial + cell] = 0.5;
    tensor[3 * spatial + cell] = 0.5;
    tensor[4 * spatial + cell] = 0.9;
    tensor[(5 + 2) * spatial + cell] = 0.8;

    let mut items: Vec<DetectItem<CocoLabel>> = Vec::new();
    decode_head(&tensor, &head, 0.25, &mut items);

    assert_eq!(items.len(), 1);
    let det = &items[0];
    assert_eq!(det.kind.to_label_id(), 2);
    assert!((det.score - 0.72).abs() < 1e-5);
    // w = h = 1.0^2 * 160 -> box [80, 80, 240, 240] / 640
    let expected = [0.125, 0.125, 0.375, 0.375];
    for (got, want) in det.bbox.iter().zip(expected) {
      assert!((got - want).abs() < 1e-5, "{got} != {want}");
    }
  }

  #[test]
  fn decode_skips_short_tensor() {
    let head = Head::standard()[2];
    let mut items: Vec<DetectItem<CocoLabel>> = Vec::new();
    decode_head(&[1.0; 16], &head, 0.25, &mut items);
    assert!(items.is_empty());
  }
}
