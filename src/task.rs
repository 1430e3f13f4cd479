// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/task.rs - 任务调度
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

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::{
  input::{InputError, InputImage},
  output::Render,
  pipeline::CoralPipeline,
};

pub trait Task<I, O>: Sized {
  type Error;
  fn run_task(self, input: I, pipeline: &CoralPipeline, output: O) -> Result<(), Self::Error>;
}

/// 只处理第一张图像
pub struct OneShotTask;

impl<RE, I, O> Task<I, O> for OneShotTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: IntoIterator<Item = Result<InputImage, InputError>>,
  O: Render<Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pipeline: &CoralPipeline, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let InputImage { name, image } = input
      .into_iter()
      .next()
      .ok_or_else(|| anyhow::anyhow!("没有输入图像"))??;
    info!("输入图像 {} 获取成功，开始处理...", name);
    let now = Instant::now();
    let result = pipeline.run(&image)?;
    info!("处理完成，耗时: {:.2?}", now.elapsed());
    output.render_result(&name, &result)?;
    info!("保存完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 并行处理全部输入图像；单张失败不影响其它图像，最后汇总报告
pub struct BatchTask;

impl<RE, I, O> Task<I, O> for BatchTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: IntoIterator<Item = Result<InputImage, InputError>>,
  O: Render<Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pipeline: &CoralPipeline, output: O) -> Result<(), Self::Error> {
    info!("开始批处理任务...");
    let mut failures = 0usize;
    let mut names = Vec::new();
    let mut images = Vec::new();
    for item in input {
      match item {
        Ok(InputImage { name, image }) => {
          names.push(name);
          images.push(image);
        }
        Err(e) => {
          error!("读取输入失败: {}", e);
          failures += 1;
        }
      }
    }

    let now = Instant::now();
    let results = pipeline.run_batch(&images);
    info!("{} 张图像处理完成，耗时: {:.2?}", images.len(), now.elapsed());

    for (name, result) in names.iter().zip(results) {
      let saved = match result {
        Ok(result) => output.render_result(name, &result).map_err(anyhow::Error::from),
        Err(e) => Err(e.into()),
      };
      if let Err(e) = saved {
        error!("图像 {} 处理失败: {}", name, e);
        failures += 1;
      }
    }

    if failures > 0 {
      anyhow::bail!("{} 张图像处理失败", failures);
    }
    Ok(())
  }
}

/// 对同一张图像重复运行，统计平均耗时
pub struct RepeatShotTask {
  repeat: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { repeat: 100 }
  }
}

impl RepeatShotTask {
  /// 前两次视为预热，不计入平均值
  const WARMUP: usize = 2;

  pub fn with_repeat(mut self, repeat: usize) -> Self {
    self.repeat = repeat;
    self
  }
}

impl<RE, I, O> Task<I, O> for RepeatShotTask
where
  RE: std::error::Error + Sync + Send + 'static,
  I: IntoIterator<Item = Result<InputImage, InputError>>,
  O: Render<Error = RE>,
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, pipeline: &CoralPipeline, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let InputImage { name, image } = input
      .into_iter()
      .next()
      .ok_or_else(|| anyhow::anyhow!("没有输入图像"))??;
    info!("输入图像 {} 获取成功，开始处理...", name);
    let mut times = Vec::with_capacity(self.repeat);
    for i in 0..self.repeat {
      let now = Instant::now();
      let result = pipeline.run(&image)?;
      let elapsed = now.elapsed();
      info!("({})处理完成，耗时: {:.2?}", i, elapsed);
      output.render_result(&name, &result)?;
      times.push(elapsed);
    }

    if times.len() > Self::WARMUP {
      let measured = &times[Self::WARMUP..];
      warn!(
        "平均处理时间: {:.2?}",
        measured.iter().sum::<Duration>() / measured.len() as u32
      );
    } else {
      warn!("重复次数不足 {}，不计算平均值", Self::WARMUP + 1);
    }

    Ok(())
  }
}
