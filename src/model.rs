// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/model.rs - 模型适配器
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

//! 检测器与分割器统一的推理接口。
//!
//! 每种推理后端各自实现 [`ModelAdapter`]，[`ModelHandle`] 按后端标签分发。
//! 设备在加载时确定并固定在句柄上，每次推理显式传入。

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::Image};

#[cfg(feature = "backend_onnx")]
mod onnx;
#[cfg(feature = "backend_onnx")]
pub use self::onnx::{OnnxModel, OnnxModelBuilder};

mod replay;
pub use self::replay::{ReplayModel, ReplayModelBuilder};

/// 计算设备
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Device {
  #[default]
  Cpu,
  Cuda(i32),
}

impl fmt::Display for Device {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Device::Cpu => write!(f, "cpu"),
      Device::Cuda(id) => write!(f, "cuda:{}", id),
    }
  }
}

impl FromStr for Device {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
      "cpu" => Ok(Device::Cpu),
      "cuda" | "gpu" => Ok(Device::Cuda(0)),
      _ => match s.strip_prefix("cuda:") {
        Some(id) => id
          .parse()
          .map(Device::Cuda)
          .map_err(|_| format!("无效的 CUDA 设备编号: {}", id)),
        None => Err(format!("未知设备: {}", s)),
      },
    }
  }
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("读取模型文件 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("模型文件损坏 {path}: {reason}")]
  Corrupt { path: PathBuf, reason: String },
  #[error("模型结构不兼容 {path}: {reason}")]
  Incompatible { path: PathBuf, reason: String },
  #[error("不支持的模型 URI 方案: {0}")]
  SchemeMismatch(String),
}

impl ModelLoadError {
  pub fn corrupt(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
    ModelLoadError::Corrupt {
      path: path.into(),
      reason: reason.to_string(),
    }
  }

  pub fn incompatible(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
    ModelLoadError::Incompatible {
      path: path.into(),
      reason: reason.to_string(),
    }
  }

  /// 读取前检查文件存在
  pub(crate) fn check_exists(path: &std::path::Path) -> Result<(), Self> {
    match std::fs::metadata(path) {
      Ok(meta) if meta.is_file() => Ok(()),
      Ok(_) => Err(ModelLoadError::NotFound(path.to_path_buf())),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        Err(ModelLoadError::NotFound(path.to_path_buf()))
      }
      Err(e) => Err(ModelLoadError::Io {
        path: path.to_path_buf(),
        source: e,
      }),
    }
  }
}

#[derive(Error, Debug)]
pub enum InferenceError {
  #[error("张量形状不匹配: 期望 {expected}, 实际 {actual:?}")]
  ShapeMismatch { expected: String, actual: Vec<usize> },
  #[error("不支持的数据类型: {0}")]
  UnsupportedDtype(String),
  #[error("设备或内存资源耗尽: {0}")]
  ResourceExhausted(String),
  #[error("推理后端错误: {0}")]
  Backend(String),
  #[error("模型句柄锁已失效")]
  Poisoned,
}

impl InferenceError {
  pub fn shape(expected: impl Into<String>, actual: &[usize]) -> Self {
    InferenceError::ShapeMismatch {
      expected: expected.into(),
      actual: actual.to_vec(),
    }
  }
}

/// 模型原始输出张量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl RawTensor {
  /// 形状与数据长度不一致时返回 None
  pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Option<Self> {
    if shape.iter().product::<usize>() == data.len() {
      Some(Self { shape, data })
    } else {
      None
    }
  }

  pub fn is_consistent(&self) -> bool {
    self.shape.iter().product::<usize>() == self.data.len()
  }

  /// 去掉前导的批大小 1 维度
  pub fn squeezed_shape(&self) -> &[usize] {
    let mut shape = self.shape.as_slice();
    while shape.len() > 1 && shape[0] == 1 {
      shape = &shape[1..];
    }
    shape
  }
}

/// 一次推理的原始输出
#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
  pub tensors: Vec<RawTensor>,
  /// 模型看到的画布宽度
  pub input_width: u32,
  /// 模型看到的画布高度
  pub input_height: u32,
}

impl RawOutput {
  pub fn tensor(&self, index: usize) -> Result<&RawTensor, InferenceError> {
    self.tensors.get(index).ok_or_else(|| {
      InferenceError::shape(
        format!("至少 {} 个输出张量", index + 1),
        &[self.tensors.len()],
      )
    })
  }
}

/// 推理后端的能力约定
pub trait ModelAdapter: Send + Sync {
  /// 模型输入画布尺寸 (宽, 高)
  fn input_size(&self) -> (u32, u32);

  fn infer(&self, image: &Image, device: Device) -> Result<RawOutput, InferenceError>;
}

enum Backend {
  #[cfg(feature = "backend_onnx")]
  Onnx(OnnxModel),
  Replay(ReplayModel),
}

/// 已加载的模型句柄；加载后只读，可在多个调用间共享
pub struct ModelHandle {
  backend: Backend,
  device: Device,
  source: String,
}

impl fmt::Debug for ModelHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModelHandle")
      .field("backend", &self.backend_name())
      .field("device", &self.device)
      .field("source", &self.source)
      .finish()
  }
}

impl ModelHandle {
  /// 按 URI 方案加载模型，`preferred` 不可用时回退到 CPU
  pub fn load(url: &Url, preferred: Device) -> Result<Self, ModelLoadError> {
    info!("加载模型: {} (期望设备: {})", url, preferred);
    match url.scheme() {
      #[cfg(feature = "backend_onnx")]
      OnnxModelBuilder::SCHEME => {
        let model = OnnxModelBuilder::from_url(url)?
          .default_device(preferred)
          .build()?;
        let device = model.device();
        Ok(Self::with_backend(Backend::Onnx(model), device, url))
      }
      ReplayModelBuilder::SCHEME => {
        let model = ReplayModelBuilder::from_url(url)?.build()?;
        Ok(Self::with_backend(Backend::Replay(model), preferred, url))
      }
      other => Err(ModelLoadError::SchemeMismatch(other.to_string())),
    }
  }

  /// 直接包装一个回放模型
  pub fn replay(model: ReplayModel, source: impl Into<String>) -> Self {
    Self {
      backend: Backend::Replay(model),
      device: Device::Cpu,
      source: source.into(),
    }
  }

  fn with_backend(backend: Backend, device: Device, url: &Url) -> Self {
    Self {
      backend,
      device,
      source: url.to_string(),
    }
  }

  pub fn device(&self) -> Device {
    self.device
  }

  pub fn source(&self) -> &str {
    &self.source
  }

  pub fn backend_name(&self) -> &'static str {
    match self.backend {
      #[cfg(feature = "backend_onnx")]
      Backend::Onnx(_) => "onnx",
      Backend::Replay(_) => "replay",
    }
  }

  fn adapter(&self) -> &dyn ModelAdapter {
    match &self.backend {
      #[cfg(feature = "backend_onnx")]
      Backend::Onnx(model) => model,
      Backend::Replay(model) => model,
    }
  }

  pub fn input_size(&self) -> (u32, u32) {
    self.adapter().input_size()
  }

  pub fn infer(&self, image: &Image) -> Result<RawOutput, InferenceError> {
    self.adapter().infer(image, self.device)
  }
}
