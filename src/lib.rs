// 该文件是 Shanan （山南西风） 项目的一部分。
// src/lib.rs - 库主文件
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

//! # Shanan Pool
//!
//! 多线程推理池：生产者按帧号提交图像，N 个工作线程各自持有独立的模型实例
//! 并发推理、绘制，消费者再按帧号取回检测结果与绘制后的图像。
//!
//! - [`pool`]：线程池核心（任务队列、背压、结果存储、按帧号取回）
//! - [`model`]：模型接口与 YOLOv5 后处理
//! - [`input`] / [`output`]：帧来源与结果去向
//! - [`task`]：把输入、线程池、输出串起来的任务驱动

pub mod frame;
pub mod input;
pub mod model;
pub mod output;
pub mod pool;
pub mod task;

pub trait FromUrl {
  type Error;
  fn from_url(url: &url::Url) -> Result<Self, Self::Error>
  where
    Self: Sized;
}

pub trait FromUrlWithScheme: FromUrl {
  const SCHEME: &'static str;
}
