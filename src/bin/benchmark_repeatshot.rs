// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 重复运行同一张图像的耗时测试
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

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use shanhu::{
  CoralPipeline, FromUrl, PipelineConfig,
  input::InputWrapper,
  labels::LabelSet,
  model::Device,
  output::OutputWrapper,
  task::{RepeatShotTask, Task},
};

/// 重复运行基准
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型
  #[arg(long, value_name = "MODEL")]
  pub detector: Url,
  /// 分割模型
  #[arg(long, value_name = "MODEL")]
  pub segmenter: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 类别表文件
  #[arg(long, default_value = "labels/coral.txt", value_name = "FILE")]
  pub labels: PathBuf,
  #[arg(long, default_value = "cpu", value_name = "DEVICE")]
  pub device: Device,
  /// 重复次数
  #[arg(long, default_value = "100", value_name = "COUNT")]
  pub repeat: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测模型: {}", args.detector);
  info!("分割模型: {}", args.segmenter);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = PipelineConfig::new(args.detector, args.segmenter)
    .with_device(args.device)
    .with_labels(LabelSet::from_file(&args.labels)?);
  let pipeline = CoralPipeline::load(&config)?;
  let input = InputWrapper::from_url(&args.input)?;
  let output = OutputWrapper::from_url(&args.output)?;

  RepeatShotTask::default()
    .with_repeat(args.repeat)
    .run_task(input, &pipeline, output)?;

  Ok(())
}
