// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool/worker.rs - 工作线程
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

use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc::Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use super::{
  Annotate, Shared,
  queue::Task,
  store::{InferenceFailure, Outcome},
};
use crate::model::{Model, ModelBuilder};

/// 工作线程启动报告：成功为线程序号，失败附带错误信息
pub(crate) type Ready = Result<usize, (usize, String)>;

/// 启动一个工作线程
///
/// 模型在工作线程内部构建并由该线程独占，构建结果通过 `ready` 汇报给 `set_up`。
pub(crate) fn spawn<B, A, F, D>(
  index: usize,
  shared: Arc<Shared<F, D>>,
  builder: Arc<B>,
  annotator: Arc<A>,
  ready: Sender<Ready>,
) -> std::io::Result<JoinHandle<()>>
where
  B: ModelBuilder + Send + Sync + 'static,
  B::Error: Display,
  B::Model: Model<Input = F, Output = D>,
  <B::Model as Model>::Error: Display,
  A: Annotate<F, D> + Send + Sync + 'static,
  F: Send + 'static,
  D: Send + 'static,
{
  thread::Builder::new()
    .name(format!("shanan-worker-{}", index))
    .spawn(move || {
      let mut model = match builder.build() {
        Ok(model) => {
          let _ = ready.send(Ok(index));
          model
        }
        Err(e) => {
          error!("工作线程 {} 加载模型失败: {}", index, e);
          let _ = ready.send(Err((index, e.to_string())));
          return;
        }
      };
      drop(ready);

      run(index, &mut model, &shared, annotator.as_ref());
    })
}

fn run<M, A, F, D>(index: usize, model: &mut M, shared: &Shared<F, D>, annotator: &A)
where
  M: Model<Input = F, Output = D>,
  M::Error: Display,
  A: Annotate<F, D>,
{
  info!("工作线程 {} 启动", index);
  let mut processed = 0u64;

  while let Some(Task { id, mut frame }) = shared.queue.pop(&shared.stop) {
    debug!("工作线程 {} 开始处理帧 {}", index, id);
    let now = std::time::Instant::now();

    let outcome = process(model, annotator, &mut frame);
    if let Err(failure) = &outcome {
      error!("工作线程 {} 处理帧 {} 失败: {}", index, id, failure.message);
    }

    shared.store.publish(id, outcome, frame);
    shared.queue.finish();
    shared.store.notify_room();
    processed += 1;
    debug!("工作线程 {} 完成帧 {}，耗时: {:.2?}", index, id, now.elapsed());
  }

  info!("工作线程 {} 退出，共处理 {} 帧", index, processed);
}

/// 推理并绘制；推理出错或 panic 都记为该帧失败，不影响工作线程继续运行。
fn process<M, A, F, D>(model: &mut M, annotator: &A, frame: &mut F) -> Outcome<D>
where
  M: Model<Input = F, Output = D>,
  M::Error: Display,
  A: Annotate<F, D>,
{
  let result = catch_unwind(AssertUnwindSafe(|| match model.infer(frame) {
    Ok(output) => {
      annotator.annotate(frame, &output);
      Ok(output)
    }
    Err(e) => Err(InferenceFailure {
      message: e.to_string(),
    }),
  }));

  result.unwrap_or_else(|panic| {
    let message = panic
      .downcast_ref::<&str>()
      .map(|s| s.to_string())
      .or_else(|| panic.downcast_ref::<String>().cloned())
      .unwrap_or_else(|| "未知 panic".to_string());
    Err(InferenceFailure {
      message: format!("推理过程中发生 panic: {}", message),
    })
  })
}
