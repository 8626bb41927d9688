// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/detection_log.rs - 检测结果记录
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

use std::fs::File;
use std::io::{BufWriter, Write};

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{DetectResult, WithLabel},
  output::Render,
  pool::FrameId,
};

#[derive(Error, Debug)]
pub enum DetectionLogError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 以 JSON Lines 格式记录每帧的检测结果
///
/// `jsonl:///path/to/result.jsonl`，每行形如
/// `{"id":3,"items":[{"label":"person","score":0.91,"bbox":[0.1,0.2,0.3,0.4]}]}`。
pub struct DetectionLog {
  writer: Mutex<BufWriter<File>>,
}

impl FromUrlWithScheme for DetectionLog {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for DetectionLog {
  type Error = DetectionLogError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(DetectionLogError::SchemeMismatch(url.scheme().to_string()));
    }

    let path = std::path::Path::new(url.path());
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)?;
    info!("检测结果记录到: {}", path.display());

    Ok(DetectionLog {
      writer: Mutex::new(BufWriter::new(file)),
    })
  }
}

impl<F, T: WithLabel> Render<F, DetectResult<T>> for DetectionLog {
  type Error = DetectionLogError;

  fn render_result(
    &self,
    id: FrameId,
    _frame: &F,
    result: &DetectResult<T>,
  ) -> Result<(), Self::Error> {
    let items: Vec<_> = result
      .items
      .iter()
      .map(|item| {
        json!({
          "label": item.kind.to_label_str(),
          "score": item.score,
          "bbox": item.bbox,
        })
      })
      .collect();
    let line = json!({ "id": id, "items": items });

    let mut writer = self.writer.lock();
    serde_json::to_writer(&mut *writer, &line)?;
    writer.write_all(b"\n")?;
    Ok(())
  }
}

impl Drop for DetectionLog {
  fn drop(&mut self) {
    if let Err(e) = self.writer.get_mut().flush() {
      warn!("检测结果记录刷新失败: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{CocoLabel, DetectItem};

  #[test]
  fn writes_one_line_per_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("log/result.jsonl");
    let url = Url::parse(&format!("jsonl://{}", path.display())).unwrap();

    {
      let log = DetectionLog::from_url(&url).unwrap();
      let result = DetectResult::from(vec![DetectItem {
        kind: CocoLabel::from_label_id(0),
        score: 0.5,
        bbox: [0.0, 0.25, 0.5, 1.0],
      }]);
      log.render_result(0, &(), &result).unwrap();
      log.render_result(1, &(), &DetectResult::<CocoLabel>::empty()).unwrap();
    }

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = content
      .lines()
      .map(|l| serde_json::from_str(l).unwrap())
      .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["id"], 0);
    assert_eq!(lines[0]["items"][0]["label"], "person");
    assert_eq!(lines[0]["items"][0]["bbox"][1], 0.25);
    assert_eq!(lines[1]["id"], 1);
    assert_eq!(lines[1]["items"].as_array().unwrap().len(), 0);
  }
}
