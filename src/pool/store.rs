// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool/store.rs - 按帧号存放的推理结果
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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::FrameId;

/// 单帧推理失败的记录，与“没有检测到目标”区分开
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceFailure {
  pub message: String,
}

pub(crate) type Outcome<D> = Result<D, InferenceFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
  Timeout,
  Stopped,
}

/// 检测结果表与图像结果表
///
/// 两张表各有一把锁和一个条件变量。写入时按“检测表 → 图像表”的顺序同时持有两把锁，
/// 读取时只持有对应的一把。
pub(crate) struct ResultStore<F, D> {
  detections: Mutex<HashMap<FrameId, Outcome<D>>>,
  detection_ready: Condvar,
  images: Mutex<HashMap<FrameId, F>>,
  image_ready: Condvar,
}

impl<F, D> ResultStore<F, D> {
  pub fn new() -> Self {
    Self {
      detections: Mutex::new(HashMap::new()),
      detection_ready: Condvar::new(),
      images: Mutex::new(HashMap::new()),
      image_ready: Condvar::new(),
    }
  }

  pub fn publish(&self, id: FrameId, outcome: Outcome<D>, frame: F) {
    {
      let mut detections = self.detections.lock();
      let mut images = self.images.lock();
      let replaced_detection = detections.insert(id, outcome).is_some();
      let replaced_image = images.insert(id, frame).is_some();
      if replaced_detection || replaced_image {
        warn!("帧 {} 的结果尚未取走即被覆盖，帧号可能重复提交", id);
      }
    }
    self.detection_ready.notify_all();
    self.image_ready.notify_all();
  }

  pub fn take_detection(
    &self,
    id: FrameId,
    timeout: Option<Duration>,
    stop: &AtomicBool,
  ) -> Result<Outcome<D>, WaitError> {
    let outcome = wait_take(&self.detections, &self.detection_ready, id, timeout, stop)?;
    self.detection_ready.notify_all();
    Ok(outcome)
  }

  pub fn take_image(
    &self,
    id: FrameId,
    timeout: Option<Duration>,
    stop: &AtomicBool,
  ) -> Result<F, WaitError> {
    let frame = wait_take(&self.images, &self.image_ready, id, timeout, stop)?;
    self.notify_room();
    Ok(frame)
  }

  /// 不等待地取走帧 `id` 的检测结果，条目不存在时返回 `None`
  pub fn try_take_detection(&self, id: FrameId) -> Option<Outcome<D>> {
    let outcome = self.detections.lock().remove(&id);
    if outcome.is_some() {
      self.detection_ready.notify_all();
    }
    outcome
  }

  pub fn try_take_image(&self, id: FrameId) -> Option<F> {
    let frame = self.images.lock().remove(&id);
    if frame.is_some() {
      self.notify_room();
    }
    frame
  }

  /// 阻塞直到“未取走结果的帧数 + `outstanding()`”低于 `capacity`
  ///
  /// `outstanding` 返回仍在队列中或正在处理的任务数，在检测表的锁下调用。
  pub fn wait_for_room(
    &self,
    capacity: usize,
    outstanding: impl Fn() -> usize,
    stop: &AtomicBool,
  ) -> Result<(), WaitError> {
    let mut detections = self.detections.lock();
    loop {
      let live = detections.len().max(self.images.lock().len()) + outstanding();
      if live < capacity {
        return Ok(());
      }
      if stop.load(Ordering::Acquire) {
        return Err(WaitError::Stopped);
      }
      self.detection_ready.wait(&mut detections);
    }
  }

  /// 唤醒容量等待方；等待方持有检测表的锁检查计数，必须在这把锁下唤醒
  pub fn notify_room(&self) {
    let _detections = self.detections.lock();
    self.detection_ready.notify_all();
  }

  /// (检测表条目数, 图像表条目数)
  pub fn len(&self) -> (usize, usize) {
    let detections = self.detections.lock().len();
    let images = self.images.lock().len();
    (detections, images)
  }

  pub fn wake_all(&self) {
    {
      let _detections = self.detections.lock();
      self.detection_ready.notify_all();
    }
    let _images = self.images.lock();
    self.image_ready.notify_all();
  }
}

fn wait_take<V>(
  map: &Mutex<HashMap<FrameId, V>>,
  ready: &Condvar,
  id: FrameId,
  timeout: Option<Duration>,
  stop: &AtomicBool,
) -> Result<V, WaitError> {
  let deadline = timeout.map(|timeout| Instant::now() + timeout);
  let mut entries = map.lock();
  loop {
    if let Some(value) = entries.remove(&id) {
      return Ok(value);
    }
    if stop.load(Ordering::Acquire) {
      return Err(WaitError::Stopped);
    }
    match deadline {
      Some(deadline) => {
        if ready.wait_until(&mut entries, deadline).timed_out() {
          return entries.remove(&id).ok_or(WaitError::Timeout);
        }
      }
      None => ready.wait(&mut entries),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::thread;

  use super::*;

  const SHORT: Option<Duration> = Some(Duration::from_millis(30));

  #[test]
  fn take_is_destructive() {
    let store: ResultStore<&str, u32> = ResultStore::new();
    let stop = AtomicBool::new(false);
    store.publish(7, Ok(3), "frame-7");

    assert_eq!(store.take_detection(7, SHORT, &stop), Ok(Ok(3)));
    assert_eq!(store.take_detection(7, SHORT, &stop), Err(WaitError::Timeout));
    assert_eq!(store.len(), (0, 1));

    assert_eq!(store.take_image(7, SHORT, &stop), Ok("frame-7"));
    assert_eq!(store.take_image(7, SHORT, &stop), Err(WaitError::Timeout));
    assert_eq!(store.len(), (0, 0));
  }

  #[test]
  fn waiter_wakes_on_publish() {
    let store: Arc<ResultStore<u8, u8>> = Arc::new(ResultStore::new());
    let stop = Arc::new(AtomicBool::new(false));

    let consumer = {
      let store = Arc::clone(&store);
      let stop = Arc::clone(&stop);
      thread::spawn(move || store.take_detection(1, None, &stop))
    };

    thread::sleep(Duration::from_millis(20));
    store.publish(1, Ok(42), 0);
    assert_eq!(consumer.join().unwrap(), Ok(Ok(42)));
  }

  #[test]
  fn stop_releases_unbounded_waiter() {
    let store: Arc<ResultStore<u8, u8>> = Arc::new(ResultStore::new());
    let stop = Arc::new(AtomicBool::new(false));

    let consumer = {
      let store = Arc::clone(&store);
      let stop = Arc::clone(&stop);
      thread::spawn(move || store.take_image(5, None, &stop))
    };

    thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::Release);
    store.wake_all();
    assert_eq!(consumer.join().unwrap(), Err(WaitError::Stopped));
  }

  #[test]
  fn room_opens_when_both_tables_drain() {
    let store: Arc<ResultStore<u8, u8>> = Arc::new(ResultStore::new());
    let stop = Arc::new(AtomicBool::new(false));
    store.publish(0, Ok(0), 0);

    let producer = {
      let store = Arc::clone(&store);
      let stop = Arc::clone(&stop);
      thread::spawn(move || store.wait_for_room(1, || 0, &stop))
    };

    store.take_detection(0, SHORT, &stop).unwrap().unwrap();
    thread::sleep(Duration::from_millis(20));
    assert!(!producer.is_finished());

    store.take_image(0, SHORT, &stop).unwrap();
    assert_eq!(producer.join().unwrap(), Ok(()));
  }

  #[test]
  fn outstanding_work_counts_against_room() {
    let store: ResultStore<u8, u8> = ResultStore::new();
    let stop = AtomicBool::new(false);
    store.publish(0, Ok(0), 0);

    assert_eq!(store.wait_for_room(3, || 1, &stop), Ok(()));

    stop.store(true, Ordering::Release);
    assert_eq!(store.wait_for_room(2, || 1, &stop), Err(WaitError::Stopped));
  }

  #[test]
  fn try_take_does_not_wait() {
    let store: ResultStore<u8, u8> = ResultStore::new();
    assert_eq!(store.try_take_detection(3), None);
    assert_eq!(store.try_take_image(3), None);

    store.publish(3, Ok(9), 1);
    assert_eq!(store.try_take_detection(3), Some(Ok(9)));
    assert_eq!(store.try_take_image(3), Some(1));
    assert_eq!(store.len(), (0, 0));
  }
}
