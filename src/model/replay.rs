// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/model/replay.rs - 录制输出回放后端
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

//! 回放一次已录制的模型原始输出。
//!
//! 文件格式为 JSON：
//!
//! ```json
//! { "input_width": 640, "input_height": 640,
//!   "tensors": [ { "shape": [1, 6, 2], "data": [ ... ] } ] }
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::Image,
  model::{Device, InferenceError, ModelAdapter, ModelLoadError, RawOutput, RawTensor},
  url_path,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Recording {
  input_width: u32,
  input_height: u32,
  tensors: Vec<RawTensor>,
}

/// 对任意输入都返回同一份录制输出
#[derive(Debug, Clone)]
pub struct ReplayModel {
  output: RawOutput,
}

impl ReplayModel {
  /// 从内存中的张量构造；张量形状与数据长度必须一致
  pub fn from_tensors(
    input_width: u32,
    input_height: u32,
    tensors: Vec<RawTensor>,
  ) -> Result<Self, ModelLoadError> {
    Self::check(Path::new("<memory>"), &tensors)?;
    Ok(Self {
      output: RawOutput {
        tensors,
        input_width,
        input_height,
      },
    })
  }

  fn check(path: &Path, tensors: &[RawTensor]) -> Result<(), ModelLoadError> {
    for (index, tensor) in tensors.iter().enumerate() {
      if !tensor.is_consistent() {
        return Err(ModelLoadError::incompatible(
          path,
          format!(
            "张量 {} 形状 {:?} 与数据长度 {} 不一致",
            index,
            tensor.shape,
            tensor.data.len()
          ),
        ));
      }
    }
    Ok(())
  }

  /// 序列化为回放文件内容
  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Recording {
      input_width: self.output.input_width,
      input_height: self.output.input_height,
      tensors: self.output.tensors.clone(),
    })
  }
}

pub struct ReplayModelBuilder {
  path: PathBuf,
}

impl FromUrlWithScheme for ReplayModelBuilder {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayModelBuilder {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelLoadError::SchemeMismatch(url.scheme().to_string()));
    }
    Ok(ReplayModelBuilder {
      path: url_path(url),
    })
  }
}

impl ReplayModelBuilder {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn build(self) -> Result<ReplayModel, ModelLoadError> {
    info!("加载回放文件: {}", self.path.display());
    ModelLoadError::check_exists(&self.path)?;
    let content = std::fs::read_to_string(&self.path).map_err(|e| ModelLoadError::Io {
      path: self.path.clone(),
      source: e,
    })?;
    let recording: Recording =
      serde_json::from_str(&content).map_err(|e| ModelLoadError::corrupt(&self.path, e))?;
    ReplayModel::check(&self.path, &recording.tensors)?;
    debug!("回放张量数量: {}", recording.tensors.len());

    Ok(ReplayModel {
      output: RawOutput {
        tensors: recording.tensors,
        input_width: recording.input_width,
        input_height: recording.input_height,
      },
    })
  }
}

impl ModelAdapter for ReplayModel {
  fn input_size(&self) -> (u32, u32) {
    (self.output.input_width, self.output.input_height)
  }

  fn infer(&self, image: &Image, device: Device) -> Result<RawOutput, InferenceError> {
    debug!(
      "回放推理输出 ({}x{}, 设备 {})",
      image.width(),
      image.height(),
      device
    );
    Ok(self.output.clone())
  }
}
