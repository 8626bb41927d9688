// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/pool_oneshot.rs - 单张图像经线程池推理
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shanan_pool::{
  FromUrl,
  input::InputWrapper,
  model::Yolov5Builder,
  output::{OutputWrapper, draw::Draw},
  pool::{PoolConfig, ThreadPool},
  task::{OneShotTask, Task},
};

/// 单帧推理参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型，例如 yolov5:///models/yolov5s.rknn
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 image:///data/bus.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 image:///data/result.jpg
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 工作线程数量
  #[arg(long, default_value_t = 1)]
  pub workers: usize,
  /// 标签字体文件（TTF/OTF），不指定则只画框
  #[arg(long, value_name = "FONT")]
  pub font: Option<PathBuf>,
  /// 等待结果的秒数
  #[arg(long, default_value_t = 5)]
  pub timeout: u64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = InputWrapper::<640, 640>::from_url(&args.input)?;
  let output = OutputWrapper::<640, 640>::from_url(&args.output)?;
  let builder = Yolov5Builder::from_url(&args.model)?;

  let draw = match &args.font {
    Some(font) => Draw::default().with_font_file(font)?,
    None => Draw::default(),
  };

  let config = PoolConfig::default()
    .with_workers(args.workers)
    .with_result_timeout(Some(Duration::from_secs(args.timeout)));
  let pool = ThreadPool::set_up(builder, draw, config)?;

  OneShotTask.run_task(input, &pool, output)?;

  Ok(())
}
