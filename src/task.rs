// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 任务驱动
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

use std::collections::BTreeSet;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::{
  output::Render,
  pool::{DEFAULT_RESULT_TIMEOUT, FrameId, PoolError, ThreadPool},
};

pub trait Task<I, P, O>: Sized {
  type Error;
  fn run_task(self, input: I, pool: P, output: O) -> Result<(), Self::Error>;
}

/// 单帧：提交帧 0，取回结果后输出
pub struct OneShotTask;

impl<'p, F, D, RE, I, O> Task<I, &'p ThreadPool<F, D>, O> for OneShotTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  O: Render<F, D, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, pool: &'p ThreadPool<F, D>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow::anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，提交推理...");

    let now = Instant::now();
    pool.submit_owned(frame, 0)?;
    let result = pool.get_result(0);
    // 无论推理是否成功都取走图像，不在结果表里留下残留
    let image = pool.get_annotated_result(0)?;
    let result = result?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    output.render_result(0, &image, &result)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 生产者线程通知消费者的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
  Submitted(FrameId),
  /// 输入结束，`total` 为成功提交的帧数
  EndOfStream { total: u64 },
}

/// 按秒统计吞吐
#[derive(Debug)]
pub struct ThroughputMeter {
  window_start: Instant,
  window_frames: u64,
  total: u64,
}

impl ThroughputMeter {
  const WINDOW: Duration = Duration::from_secs(1);

  pub fn new(now: Instant) -> Self {
    Self {
      window_start: now,
      window_frames: 0,
      total: 0,
    }
  }

  /// 记录一帧；统计窗口满一秒时返回该窗口的帧率
  pub fn tick(&mut self, now: Instant) -> Option<f64> {
    self.window_frames += 1;
    self.total += 1;

    let elapsed = now.saturating_duration_since(self.window_start);
    if elapsed < Self::WINDOW {
      return None;
    }
    let fps = self.window_frames as f64 / elapsed.as_secs_f64();
    self.window_start = now;
    self.window_frames = 0;
    Some(fps)
  }

  pub fn total(&self) -> u64 {
    self.total
  }
}

/// 连续帧：生产者线程按递增帧号提交，当前线程按同样顺序取回并输出
#[derive(Default, Debug)]
pub struct PooledStreamTask {
  frame_number: Option<usize>,
  handle_ctrlc: bool,
}

impl PooledStreamTask {
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 收到 Ctrl-C 时停止线程池
  pub fn with_ctrlc(mut self, handle_ctrlc: bool) -> Self {
    self.handle_ctrlc = handle_ctrlc;
    self
  }
}

impl<'p, F, D, RE, I, O> Task<I, &'p ThreadPool<F, D>, O> for PooledStreamTask
where
  F: Send + 'static,
  D: Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F> + Send,
  O: Render<F, D, Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pool: &'p ThreadPool<F, D>, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");

    if self.handle_ctrlc {
      let stop = pool.stop_handle();
      ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        stop.stop();
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })?;
    }

    let frame_number = self.frame_number;
    let (tx, rx) = mpsc::channel();

    thread::scope(|s| {
      s.spawn(move || produce(input, pool, frame_number, tx));

      let result = consume(rx, pool, &output);
      if result.is_err() {
        // 让阻塞在提交上的生产者退出
        pool.stop_all();
      }
      result
    })
  }
}

fn produce<F, D, I>(
  input: I,
  pool: &ThreadPool<F, D>,
  frame_number: Option<usize>,
  tx: mpsc::Sender<FrameEvent>,
) where
  I: Iterator<Item = F>,
{
  let mut next_id: FrameId = 0;
  for frame in input {
    if frame_number.is_some_and(|n| next_id >= n as u64) {
      info!("达到指定帧数 {}, 停止提交", next_id);
      break;
    }
    if let Err(e) = pool.submit_owned(frame, next_id) {
      warn!("提交帧 {} 失败: {}", next_id, e);
      break;
    }
    if tx.send(FrameEvent::Submitted(next_id)).is_err() {
      break;
    }
    next_id += 1;
  }

  info!("输入结束，共提交 {} 帧", next_id);
  let _ = tx.send(FrameEvent::EndOfStream { total: next_id });
}

/// 超时后才发布的结果，之后陆续取走丢弃，避免在结果表中残留
#[derive(Debug, Default)]
struct Leftovers {
  detections: BTreeSet<FrameId>,
  images: BTreeSet<FrameId>,
}

impl Leftovers {
  fn record<D, F>(&mut self, id: FrameId, result: &Result<D, PoolError>, image: &Result<F, PoolError>) {
    if matches!(result, Err(PoolError::Timeout { .. })) {
      self.detections.insert(id);
    }
    if matches!(image, Err(PoolError::Timeout { .. })) {
      self.images.insert(id);
    }
  }

  /// 不等待，只取走已经发布的条目
  fn sweep<F, D>(&mut self, pool: &ThreadPool<F, D>) {
    self
      .detections
      .retain(|&id| matches!(pool.try_get_result(id), Ok(None)));
    self
      .images
      .retain(|&id| pool.try_get_annotated_result(id).is_none());
  }

  /// 任务结束前在 `wait` 内等待剩余条目
  fn drain<F, D>(&mut self, pool: &ThreadPool<F, D>, wait: Duration) {
    let deadline = Instant::now() + wait;
    for id in std::mem::take(&mut self.detections) {
      let left = deadline.saturating_duration_since(Instant::now());
      if let Err(PoolError::Timeout { .. }) = pool.get_result_timeout(id, left) {
        self.detections.insert(id);
      }
    }
    for id in std::mem::take(&mut self.images) {
      let left = deadline.saturating_duration_since(Instant::now());
      if let Err(PoolError::Timeout { .. }) = pool.get_annotated_result_timeout(id, left) {
        self.images.insert(id);
      }
    }
  }

  fn is_empty(&self) -> bool {
    self.detections.is_empty() && self.images.is_empty()
  }
}

fn consume<F, D, O, RE>(
  rx: mpsc::Receiver<FrameEvent>,
  pool: &ThreadPool<F, D>,
  output: &O,
) -> anyhow::Result<()>
where
  O: Render<F, D, Error = RE>,
  RE: std::error::Error + Sync + Send + 'static,
{
  let mut meter = ThroughputMeter::new(Instant::now());
  let mut leftovers = Leftovers::default();

  for event in rx {
    let id = match event {
      FrameEvent::Submitted(id) => id,
      FrameEvent::EndOfStream { total } => {
        info!("处理完成，共 {} 帧，已输出 {} 帧", total, meter.total());
        break;
      }
    };

    let result = pool.get_result(id);
    let image = pool.get_annotated_result(id);
    leftovers.record(id, &result, &image);
    leftovers.sweep(pool);

    match (result, image) {
      (Ok(result), Ok(image)) => {
        output.render_result(id, &image, &result)?;
        debug!("输出帧 {}", id);
      }
      (Err(PoolError::Stopped), _) | (_, Err(PoolError::Stopped)) => {
        warn!("线程池已停止，退出任务循环");
        break;
      }
      (Err(e), _) | (_, Err(e)) => {
        warn!("跳过帧 {}: {}", id, e);
        continue;
      }
    }

    if let Some(fps) = meter.tick(Instant::now()) {
      info!("吞吐: {:.1} FPS, 队列 {} 帧", fps, pool.pending());
    }
  }

  if !leftovers.is_empty() {
    let wait = pool.config().result_timeout.unwrap_or(DEFAULT_RESULT_TIMEOUT);
    leftovers.drain(pool, wait);
    if !leftovers.is_empty() {
      warn!(
        "仍有 {} 个检测结果、{} 张图像未能取回",
        leftovers.detections.len(),
        leftovers.images.len()
      );
    }
  }

  info!("任务完成，退出");
  Ok(())
}

#[cfg(test)]
mod tests {
  use parking_lot::Mutex;
  use thiserror::Error;

  use super::*;
  use crate::model::{Model, ModelBuilder};
  use crate::pool::{NoAnnotate, PoolConfig};

  #[derive(Error, Debug)]
  #[error("测试错误: {0}")]
  struct TestError(String);

  /// 结果为输入的两倍；`slow` 中的帧推理前 sleep
  struct Doubler {
    slow: Option<(u32, Duration)>,
  }

  impl Model for Doubler {
    type Input = u32;
    type Output = u32;
    type Error = TestError;

    fn infer(&mut self, input: &u32) -> Result<u32, TestError> {
      if let Some((value, delay)) = self.slow
        && value == *input
      {
        thread::sleep(delay);
      }
      Ok(input * 2)
    }
  }

  #[derive(Default)]
  struct DoublerBuilder {
    slow: Option<(u32, Duration)>,
  }

  impl ModelBuilder for DoublerBuilder {
    type Model = Doubler;
    type Error = TestError;

    fn build(&self) -> Result<Doubler, TestError> {
      Ok(Doubler { slow: self.slow })
    }
  }

  /// 记录每次输出的 (帧号, 图像, 结果)；`fail_at` 帧返回错误
  #[derive(Default)]
  struct Collect {
    seen: Mutex<Vec<(FrameId, u32, u32)>>,
    fail_at: Option<FrameId>,
  }

  impl Render<u32, u32> for &Collect {
    type Error = TestError;

    fn render_result(&self, id: FrameId, frame: &u32, result: &u32) -> Result<(), TestError> {
      if self.fail_at == Some(id) {
        return Err(TestError(format!("无法写出帧 {}", id)));
      }
      self.seen.lock().push((id, *frame, *result));
      Ok(())
    }
  }

  fn pool(builder: DoublerBuilder, config: PoolConfig) -> ThreadPool<u32, u32> {
    ThreadPool::set_up(builder, NoAnnotate, config).unwrap()
  }

  fn config(workers: usize) -> PoolConfig {
    PoolConfig::default()
      .with_workers(workers)
      .with_result_timeout(Some(Duration::from_secs(5)))
  }

  #[test]
  fn meter_reports_once_per_window() {
    let start = Instant::now();
    let mut meter = ThroughputMeter::new(start);

    for i in 1..10 {
      assert_eq!(meter.tick(start + Duration::from_millis(i * 100)), None);
    }
    let fps = meter.tick(start + Duration::from_secs(1)).unwrap();
    assert!((fps - 10.0).abs() < 1e-9);

    assert_eq!(meter.tick(start + Duration::from_millis(1500)), None);
    assert_eq!(meter.total(), 11);
  }

  #[test]
  fn one_shot_renders_frame_zero() {
    let pool = pool(DoublerBuilder::default(), config(2));
    let sink = Collect::default();

    OneShotTask.run_task(vec![21u32, 5].into_iter(), &pool, &sink).unwrap();

    assert_eq!(*sink.seen.lock(), vec![(0, 21, 42)]);
    assert_eq!(pool.unclaimed(), (0, 0));
  }

  #[test]
  fn one_shot_without_input_fails() {
    let pool = pool(DoublerBuilder::default(), config(1));
    let sink = Collect::default();

    assert!(OneShotTask.run_task(std::iter::empty::<u32>(), &pool, &sink).is_err());
    assert!(sink.seen.lock().is_empty());
  }

  #[test]
  fn producer_reports_total_at_end_of_stream() {
    let pool = pool(DoublerBuilder::default(), config(2));
    let (tx, rx) = mpsc::channel();

    produce(0u32..10, &pool, Some(3), tx);

    let events: Vec<_> = rx.iter().collect();
    assert_eq!(
      events,
      vec![
        FrameEvent::Submitted(0),
        FrameEvent::Submitted(1),
        FrameEvent::Submitted(2),
        FrameEvent::EndOfStream { total: 3 },
      ]
    );
    for id in 0..3 {
      assert_eq!(pool.get_result(id), Ok(id as u32 * 2));
    }
  }

  #[test]
  fn stream_renders_every_frame_in_order() {
    let pool = pool(DoublerBuilder::default(), config(3).with_high_water(4));
    let sink = Collect::default();

    PooledStreamTask::default()
      .run_task(100u32..120, &pool, &sink)
      .unwrap();

    let seen = sink.seen.lock();
    assert_eq!(seen.len(), 20);
    for (i, &(id, frame, result)) in seen.iter().enumerate() {
      assert_eq!(id, i as u64);
      assert_eq!(frame, 100 + i as u32);
      assert_eq!(result, frame * 2);
    }
    assert_eq!(pool.unclaimed(), (0, 0));
  }

  #[test]
  fn stream_stops_at_frame_limit() {
    let pool = pool(DoublerBuilder::default(), config(2));
    let sink = Collect::default();

    PooledStreamTask::default()
      .with_frame_number(Some(5))
      .run_task(0u32.., &pool, &sink)
      .unwrap();

    assert_eq!(sink.seen.lock().len(), 5);
    assert_eq!(pool.pending(), 0);
    assert_eq!(pool.unclaimed(), (0, 0));
  }

  #[test]
  fn sink_failure_stops_pool_and_producer() {
    let pool = pool(DoublerBuilder::default(), config(1).with_high_water(2));
    let sink = Collect {
      fail_at: Some(3),
      ..Collect::default()
    };

    // 输入无穷，生产者只能因线程池停止而退出
    let result = PooledStreamTask::default().run_task(0u32.., &pool, &sink);

    assert!(result.is_err());
    assert!(pool.is_stopped());
    assert_eq!(sink.seen.lock().len(), 3);
  }

  #[test]
  fn late_result_is_reclaimed() {
    let builder = DoublerBuilder {
      slow: Some((0, Duration::from_millis(150))),
    };
    let pool = pool(
      builder,
      config(1).with_result_timeout(Some(Duration::from_millis(100))),
    );
    let sink = Collect::default();

    PooledStreamTask::default()
      .run_task(vec![0u32, 1, 2].into_iter(), &pool, &sink)
      .unwrap();

    let ids: Vec<_> = sink.seen.lock().iter().map(|&(id, _, _)| id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(pool.unclaimed(), (0, 0));

    thread::sleep(Duration::from_millis(300));
    assert_eq!(pool.unclaimed(), (0, 0));
  }
}
