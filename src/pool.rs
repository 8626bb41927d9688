// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool.rs - 推理线程池
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

//! # 推理线程池
//!
//! 生产者调用 [`ThreadPool::submit`] 按帧号提交图像，工作线程各自持有一个模型实例，
//! 从 FIFO 队列中取任务、推理、绘制，并把结果按帧号放入结果表；消费者调用
//! [`ThreadPool::get_result`] / [`ThreadPool::get_annotated_result`] 按帧号取回。
//!
//! - 提交：队列深度达到 `high_water` 时阻塞（背压）
//! - 完成顺序不保证与提交顺序一致，因此结果只能按帧号取
//! - 取回是破坏性的，同一帧号只能成功取一次
//! - 两个取回接口使用同一超时策略 `result_timeout`，超时返回 [`PoolError::Timeout`]
//! - 推理失败记为 [`PoolError::Inference`]，与“没有检测到目标”区分
//! - [`ThreadPool::stop_all`] 之后所有阻塞中的调用都会返回 [`PoolError::Stopped`]
//!
//! ## 基本用法
//!
//! ```no_run
//! use shanan_pool::pool::{NoAnnotate, PoolConfig, ThreadPool};
//! # use shanan_pool::model::{Model, ModelBuilder};
//! # struct Echo;
//! # impl Model for Echo {
//! #   type Input = u32; type Output = u32; type Error = std::io::Error;
//! #   fn infer(&mut self, input: &u32) -> Result<u32, Self::Error> { Ok(*input) }
//! # }
//! # struct EchoBuilder;
//! # impl ModelBuilder for EchoBuilder {
//! #   type Model = Echo; type Error = std::io::Error;
//! #   fn build(&self) -> Result<Echo, Self::Error> { Ok(Echo) }
//! # }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ThreadPool::set_up(EchoBuilder, NoAnnotate, PoolConfig::default().with_workers(2))?;
//! for id in 0..3u64 {
//!   pool.submit(&(id as u32), id)?;
//! }
//! for id in 0..3u64 {
//!   let result = pool.get_result(id)?;
//!   let frame = pool.get_annotated_result(id)?;
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::model::{Model, ModelBuilder};

mod queue;
mod store;
mod worker;

use self::queue::{TaskQueue, Task};
use self::store::{ResultStore, WaitError};

pub use self::store::InferenceFailure;

/// 帧号，提交与取回之间唯一的关联键
pub type FrameId = u64;

pub const DEFAULT_WORKERS: usize = 12;
pub const DEFAULT_HIGH_WATER: usize = 10;
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("工作线程 {worker} 模型加载失败: {message}")]
  ModelLoad { worker: usize, message: String },
  #[error("帧 {id} 推理失败: {message}")]
  Inference { id: FrameId, message: String },
  #[error("等待帧 {id} 的结果超时")]
  Timeout { id: FrameId },
  #[error("线程池已停止")]
  Stopped,
  #[error("无法创建工作线程: {0}")]
  Spawn(String),
  #[error("线程池配置无效: {0}")]
  InvalidConfig(String),
}

/// 线程池配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// 工作线程数量，每个线程持有一个模型实例
  pub workers: usize,
  /// 队列深度上限，达到后 `submit` 阻塞
  pub high_water: usize,
  /// 取回结果的等待上限，`None` 表示一直等待（仍会响应停止）
  pub result_timeout: Option<Duration>,
  /// 未完成帧数上限：队列中、处理中与结果未取走的帧一并计数，达到后 `submit` 阻塞。
  /// 单个生产者时这是严格上限；多个生产者并发提交时，每个生产者最多再多放入一帧。
  /// `None` 表示不限制，此时消费者需要取走每个已提交帧号的结果
  pub result_capacity: Option<usize>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      workers: DEFAULT_WORKERS,
      high_water: DEFAULT_HIGH_WATER,
      result_timeout: Some(DEFAULT_RESULT_TIMEOUT),
      result_capacity: None,
    }
  }
}

impl PoolConfig {
  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }

  pub fn with_high_water(mut self, high_water: usize) -> Self {
    self.high_water = high_water;
    self
  }

  pub fn with_result_timeout(mut self, result_timeout: Option<Duration>) -> Self {
    self.result_timeout = result_timeout;
    self
  }

  pub fn with_result_capacity(mut self, result_capacity: Option<usize>) -> Self {
    self.result_capacity = result_capacity;
    self
  }

  fn validate(&self) -> Result<(), PoolError> {
    if self.workers == 0 {
      return Err(PoolError::InvalidConfig("工作线程数量必须大于 0".to_string()));
    }
    if self.high_water == 0 {
      return Err(PoolError::InvalidConfig("队列深度上限必须大于 0".to_string()));
    }
    if self.result_capacity == Some(0) {
      return Err(PoolError::InvalidConfig("结果容量必须大于 0".to_string()));
    }
    Ok(())
  }
}

/// 绘制检测结果
///
/// 所有工作线程共享同一个实例，不应持有可变状态。
pub trait Annotate<F, D> {
  fn annotate(&self, frame: &mut F, result: &D);
}

/// 不做任何绘制
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAnnotate;

impl<F, D> Annotate<F, D> for NoAnnotate {
  fn annotate(&self, _frame: &mut F, _result: &D) {}
}

impl<F, D, Func: Fn(&mut F, &D)> Annotate<F, D> for Func {
  fn annotate(&self, frame: &mut F, result: &D) {
    self(frame, result)
  }
}

pub(crate) struct Shared<F, D> {
  queue: TaskQueue<F>,
  store: ResultStore<F, D>,
  stop: AtomicBool,
}

impl<F, D> Shared<F, D> {
  fn stop(&self) {
    self.stop.store(true, Ordering::Release);
    self.queue.wake_all();
    self.store.wake_all();
  }

  fn is_stopped(&self) -> bool {
    self.stop.load(Ordering::Acquire)
  }
}

/// 可在其他线程（例如 Ctrl-C 回调）中停止线程池的句柄
pub struct StopHandle<F, D> {
  shared: Arc<Shared<F, D>>,
}

impl<F, D> Clone for StopHandle<F, D> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<F, D> StopHandle<F, D> {
  pub fn stop(&self) {
    self.shared.stop();
  }

  pub fn is_stopped(&self) -> bool {
    self.shared.is_stopped()
  }
}

/// 推理线程池
pub struct ThreadPool<F, D> {
  shared: Arc<Shared<F, D>>,
  workers: Vec<JoinHandle<()>>,
  config: PoolConfig,
}

impl<F, D> ThreadPool<F, D>
where
  F: Send + 'static,
  D: Send + 'static,
{
  /// 创建线程池
  ///
  /// 每个工作线程用 `builder` 构建自己的模型实例。任一实例加载失败时，
  /// 已启动的线程会被停止并回收，然后返回 [`PoolError::ModelLoad`]。
  pub fn set_up<B, A>(builder: B, annotator: A, config: PoolConfig) -> Result<Self, PoolError>
  where
    B: ModelBuilder + Send + Sync + 'static,
    B::Error: Display,
    B::Model: Model<Input = F, Output = D>,
    <B::Model as Model>::Error: Display,
    A: Annotate<F, D> + Send + Sync + 'static,
  {
    config.validate()?;
    info!(
      "创建线程池: 工作线程 {} 个, 队列上限 {}, 结果超时 {:?}",
      config.workers, config.high_water, config.result_timeout
    );

    let shared = Arc::new(Shared {
      queue: TaskQueue::new(config.high_water),
      store: ResultStore::new(),
      stop: AtomicBool::new(false),
    });
    let builder = Arc::new(builder);
    let annotator = Arc::new(annotator);

    let mut pool = ThreadPool {
      shared,
      workers: Vec::with_capacity(config.workers),
      config,
    };

    let (ready_tx, ready_rx) = mpsc::channel();
    for index in 0..pool.config.workers {
      let handle = worker::spawn(
        index,
        Arc::clone(&pool.shared),
        Arc::clone(&builder),
        Arc::clone(&annotator),
        ready_tx.clone(),
      );
      match handle {
        Ok(handle) => pool.workers.push(handle),
        Err(e) => {
          error!("无法创建工作线程 {}: {}", index, e);
          pool.shutdown();
          return Err(PoolError::Spawn(e.to_string()));
        }
      }
    }
    drop(ready_tx);

    for _ in 0..pool.config.workers {
      let failure = match ready_rx.recv() {
        Ok(Ok(_)) => continue,
        Ok(Err((worker, message))) => PoolError::ModelLoad { worker, message },
        Err(_) => PoolError::ModelLoad {
          worker: usize::MAX,
          message: "工作线程在加载模型时意外退出".to_string(),
        },
      };
      pool.shutdown();
      return Err(failure);
    }

    info!("线程池就绪");
    Ok(pool)
  }
}

impl<F, D> ThreadPool<F, D> {
  /// 提交一帧
  ///
  /// 帧在入队前被复制，调用方可立即复用自己的缓冲区。
  /// 队列已满时阻塞，线程池停止时返回 [`PoolError::Stopped`]。
  pub fn submit(&self, frame: &F, id: FrameId) -> Result<(), PoolError>
  where
    F: Clone,
  {
    self.wait_for_admission()?;
    self.enqueue(frame.clone(), id)
  }

  /// 提交一帧，直接接管调用方已拥有的帧
  pub fn submit_owned(&self, frame: F, id: FrameId) -> Result<(), PoolError> {
    self.wait_for_admission()?;
    self.enqueue(frame, id)
  }

  fn wait_for_admission(&self) -> Result<(), PoolError> {
    if self.shared.is_stopped() {
      return Err(PoolError::Stopped);
    }
    if let Some(capacity) = self.config.result_capacity {
      self
        .shared
        .store
        .wait_for_room(capacity, || self.shared.queue.outstanding(), &self.shared.stop)
        .map_err(|_| PoolError::Stopped)?;
    }
    Ok(())
  }

  fn enqueue(&self, frame: F, id: FrameId) -> Result<(), PoolError> {
    self
      .shared
      .queue
      .push(Task { id, frame }, &self.shared.stop)
      .map_err(|_| PoolError::Stopped)
  }

  /// 取回并移除帧 `id` 的检测结果，等待上限为 `result_timeout`
  pub fn get_result(&self, id: FrameId) -> Result<D, PoolError> {
    self.take_result(id, self.config.result_timeout)
  }

  pub fn get_result_timeout(&self, id: FrameId, timeout: Duration) -> Result<D, PoolError> {
    self.take_result(id, Some(timeout))
  }

  fn take_result(&self, id: FrameId, timeout: Option<Duration>) -> Result<D, PoolError> {
    let outcome = self
      .shared
      .store
      .take_detection(id, timeout, &self.shared.stop)
      .map_err(|e| wait_error(id, e))?;
    outcome.map_err(|failure| PoolError::Inference {
      id,
      message: failure.message,
    })
  }

  /// 不等待地取回帧 `id` 的检测结果，尚未发布时返回 `Ok(None)`
  pub fn try_get_result(&self, id: FrameId) -> Result<Option<D>, PoolError> {
    match self.shared.store.try_take_detection(id) {
      Some(Ok(result)) => Ok(Some(result)),
      Some(Err(failure)) => Err(PoolError::Inference {
        id,
        message: failure.message,
      }),
      None => Ok(None),
    }
  }

  /// 不等待地取回帧 `id` 绘制后的图像
  pub fn try_get_annotated_result(&self, id: FrameId) -> Option<F> {
    self.shared.store.try_take_image(id)
  }

  /// 取回并移除帧 `id` 绘制后的图像，等待上限为 `result_timeout`
  ///
  /// 推理失败的帧返回未绘制的原图。
  pub fn get_annotated_result(&self, id: FrameId) -> Result<F, PoolError> {
    self.take_image(id, self.config.result_timeout)
  }

  pub fn get_annotated_result_timeout(&self, id: FrameId, timeout: Duration) -> Result<F, PoolError> {
    self.take_image(id, Some(timeout))
  }

  fn take_image(&self, id: FrameId, timeout: Option<Duration>) -> Result<F, PoolError> {
    self
      .shared
      .store
      .take_image(id, timeout, &self.shared.stop)
      .map_err(|e| wait_error(id, e))
  }

  /// 设置停止标志并唤醒所有等待方，不清空队列，也不等待工作线程退出
  pub fn stop_all(&self) {
    info!("停止线程池");
    self.shared.stop();
  }

  pub fn stop_handle(&self) -> StopHandle<F, D> {
    StopHandle {
      shared: Arc::clone(&self.shared),
    }
  }

  pub fn is_stopped(&self) -> bool {
    self.shared.is_stopped()
  }

  /// 停止并回收所有工作线程，可重复调用
  pub fn shutdown(&mut self) {
    self.shared.stop();
    if self.workers.is_empty() {
      return;
    }

    let abandoned = self.shared.queue.depth();
    if abandoned > 0 {
      warn!("线程池停止时仍有 {} 个任务未处理", abandoned);
    }
    for handle in self.workers.drain(..) {
      if handle.join().is_err() {
        error!("工作线程异常退出");
      }
    }
    info!("所有工作线程已退出");
  }

  pub fn config(&self) -> &PoolConfig {
    &self.config
  }

  pub fn workers(&self) -> usize {
    self.workers.len()
  }

  /// 队列中等待处理的任务数
  pub fn pending(&self) -> usize {
    self.shared.queue.depth()
  }

  pub fn in_flight(&self) -> usize {
    self.shared.queue.in_flight()
  }

  /// 运行以来队列达到过的最大深度
  pub fn peak_pending(&self) -> usize {
    self.shared.queue.peak_depth()
  }

  /// 尚未取走的 (检测结果数, 图像结果数)
  pub fn unclaimed(&self) -> (usize, usize) {
    self.shared.store.len()
  }
}

impl<F, D> Drop for ThreadPool<F, D> {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn wait_error(id: FrameId, e: WaitError) -> PoolError {
  match e {
    WaitError::Timeout => {
      warn!("等待帧 {} 的结果超时", id);
      PoolError::Timeout { id }
    }
    WaitError::Stopped => PoolError::Stopped,
  }
}
