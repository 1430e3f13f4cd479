// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use shanhu::{
  CoralPipeline, FromUrl,
  input::InputWrapper,
  output::OutputWrapper,
  task::{BatchTask, OneShotTask, Task},
};

use crate::args::{Args, Mode};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测模型: {}", args.detector);
  info!("分割模型: {}", args.segmenter);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);
  info!("期望设备: {}", args.device);

  let config = args.to_config()?;
  let pipeline = CoralPipeline::load(&config)?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  match args.mode {
    Mode::Single => OneShotTask.run_task(input, &pipeline, output)?,
    Mode::Batch => BatchTask.run_task(input, &pipeline, output)?,
  }

  info!("处理完成");
  Ok(())
}
