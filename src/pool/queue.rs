// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pool/queue.rs - 任务队列与提交背压
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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use super::FrameId;

pub(crate) struct Task<F> {
  pub id: FrameId,
  pub frame: F,
}

/// 线程池已停止
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stopped;

struct QueueState<F> {
  tasks: VecDeque<Task<F>>,
  in_flight: usize,
  peak_depth: usize,
}

/// FIFO 任务队列
///
/// 深度达到 `high_water` 时 `push` 阻塞，直到工作线程取走任务或线程池停止。
pub(crate) struct TaskQueue<F> {
  state: Mutex<QueueState<F>>,
  task_ready: Condvar,
  space_ready: Condvar,
  high_water: usize,
}

impl<F> TaskQueue<F> {
  pub fn new(high_water: usize) -> Self {
    Self {
      state: Mutex::new(QueueState {
        tasks: VecDeque::with_capacity(high_water),
        in_flight: 0,
        peak_depth: 0,
      }),
      task_ready: Condvar::new(),
      space_ready: Condvar::new(),
      high_water,
    }
  }

  pub fn push(&self, task: Task<F>, stop: &AtomicBool) -> Result<(), Stopped> {
    let mut state = self.state.lock();
    loop {
      if stop.load(Ordering::Acquire) {
        return Err(Stopped);
      }
      if state.tasks.len() < self.high_water {
        break;
      }
      self.space_ready.wait(&mut state);
    }

    state.tasks.push_back(task);
    state.peak_depth = state.peak_depth.max(state.tasks.len());
    drop(state);

    self.task_ready.notify_one();
    Ok(())
  }

  /// 取出队首任务，队列为空时阻塞；线程池停止后返回 `None`，剩余任务不再处理。
  pub fn pop(&self, stop: &AtomicBool) -> Option<Task<F>> {
    let mut state = self.state.lock();
    loop {
      if stop.load(Ordering::Acquire) {
        return None;
      }
      if let Some(task) = state.tasks.pop_front() {
        state.in_flight += 1;
        drop(state);
        self.space_ready.notify_one();
        return Some(task);
      }
      self.task_ready.wait(&mut state);
    }
  }

  /// 工作线程处理完一个任务后调用
  pub fn finish(&self) {
    let mut state = self.state.lock();
    state.in_flight = state.in_flight.saturating_sub(1);
  }

  pub fn wake_all(&self) {
    let _state = self.state.lock();
    self.task_ready.notify_all();
    self.space_ready.notify_all();
  }

  pub fn depth(&self) -> usize {
    self.state.lock().tasks.len()
  }

  /// 队列中与正在处理的任务总数
  pub fn outstanding(&self) -> usize {
    let state = self.state.lock();
    state.tasks.len() + state.in_flight
  }

  pub fn in_flight(&self) -> usize {
    self.state.lock().in_flight
  }

  pub fn peak_depth(&self) -> usize {
    self.state.lock().peak_depth
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::thread;
  use std::time::Duration;

  use super::*;

  fn task(id: FrameId) -> Task<u8> {
    Task { id, frame: id as u8 }
  }

  #[test]
  fn pops_in_submission_order() {
    let queue = TaskQueue::new(4);
    let stop = AtomicBool::new(false);
    for id in 0..3 {
      queue.push(task(id), &stop).unwrap();
    }
    let ids: Vec<_> = (0..3).map(|_| queue.pop(&stop).unwrap().id).collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(queue.in_flight(), 3);
    queue.finish();
    assert_eq!(queue.in_flight(), 2);
    assert_eq!(queue.outstanding(), 2);
  }

  #[test]
  fn push_blocks_at_high_water() {
    let queue = Arc::new(TaskQueue::new(2));
    let stop = Arc::new(AtomicBool::new(false));
    queue.push(task(0), &stop).unwrap();
    queue.push(task(1), &stop).unwrap();

    let producer = {
      let queue = Arc::clone(&queue);
      let stop = Arc::clone(&stop);
      thread::spawn(move || queue.push(task(2), &stop))
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.depth(), 2);
    assert!(!producer.is_finished());

    assert_eq!(queue.pop(&stop).unwrap().id, 0);
    producer.join().unwrap().unwrap();
    assert_eq!(queue.depth(), 2);
    assert_eq!(queue.peak_depth(), 2);
  }

  #[test]
  fn stop_releases_blocked_threads() {
    let queue = Arc::new(TaskQueue::<u8>::new(1));
    let stop = Arc::new(AtomicBool::new(false));
    queue.push(task(0), &stop).unwrap();

    let producer = {
      let queue = Arc::clone(&queue);
      let stop = Arc::clone(&stop);
      thread::spawn(move || queue.push(task(1), &stop))
    };
    thread::sleep(Duration::from_millis(20));

    stop.store(true, Ordering::Release);
    queue.wake_all();

    assert_eq!(producer.join().unwrap(), Err(Stopped));
    assert!(queue.pop(&stop).is_none());
  }
}
