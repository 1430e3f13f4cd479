// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 推理后端
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

use std::{collections::HashMap, path::PathBuf, sync::Mutex};

use ort::{
  execution_providers::{CUDAExecutionProvider, ExecutionProvider},
  session::{
    Session,
    builder::{GraphOptimizationLevel, SessionBuilder},
  },
  value::Tensor,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{Image, NchwTensor},
  model::{Device, InferenceError, ModelAdapter, ModelLoadError, RawOutput, RawTensor},
  url_path,
};

const ONNX_DEFAULT_INPUT_SIZE: u32 = 640;
const ONNX_NUM_INPUTS: usize = 1;

/// ONNX 模型；会话运行需要独占访问，因此放在互斥锁中
pub struct OnnxModel {
  session: Mutex<Session>,
  input_width: u32,
  input_height: u32,
  device: Device,
}

pub struct OnnxModelBuilder {
  model_path: PathBuf,
  input_width: u32,
  input_height: u32,
  device: Option<Device>,
  intra_threads: Option<usize>,
}

impl FromUrlWithScheme for OnnxModelBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for OnnxModelBuilder {
  type Error = ModelLoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelLoadError::SchemeMismatch(url.scheme().to_string()));
    }

    let model_path = url_path(url);
    let query_pairs: HashMap<_, _> = url.query_pairs().collect();
    let size: Option<u32> = query_pairs.get("size").and_then(|v| v.parse().ok());
    let input_width = query_pairs
      .get("width")
      .and_then(|v| v.parse().ok())
      .or(size)
      .unwrap_or(ONNX_DEFAULT_INPUT_SIZE);
    let input_height = query_pairs
      .get("height")
      .and_then(|v| v.parse().ok())
      .or(size)
      .unwrap_or(ONNX_DEFAULT_INPUT_SIZE);
    let device = match query_pairs.get("device") {
      Some(v) => Some(
        v.parse::<Device>()
          .map_err(|e| ModelLoadError::incompatible(&model_path, e))?,
      ),
      None => None,
    };
    let intra_threads = query_pairs.get("threads").and_then(|v| v.parse().ok());

    Ok(OnnxModelBuilder {
      model_path,
      input_width,
      input_height,
      device,
      intra_threads,
    })
  }
}

impl OnnxModelBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      input_width: ONNX_DEFAULT_INPUT_SIZE,
      input_height: ONNX_DEFAULT_INPUT_SIZE,
      device: None,
      intra_threads: None,
    }
  }

  pub fn input_size(mut self, width: u32, height: u32) -> Self {
    self.input_width = width;
    self.input_height = height;
    self
  }

  pub fn device(mut self, device: Device) -> Self {
    self.device = Some(device);
    self
  }

  /// URI 未指定设备时使用的设备
  pub fn default_device(mut self, device: Device) -> Self {
    self.device.get_or_insert(device);
    self
  }

  fn session_builder(&self) -> Result<SessionBuilder, ModelLoadError> {
    let builder = Session::builder()
      .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
      .map_err(|e| ModelLoadError::corrupt(&self.model_path, e))?;
    match self.intra_threads {
      Some(threads) => builder
        .with_intra_threads(threads)
        .map_err(|e| ModelLoadError::corrupt(&self.model_path, e)),
      None => Ok(builder),
    }
  }

  /// 注册执行设备；设备不可用时回退到 CPU
  fn place(&self, preferred: Device) -> Result<(SessionBuilder, Device), ModelLoadError> {
    let builder = self.session_builder()?;
    let Device::Cuda(id) = preferred else {
      return Ok((builder, Device::Cpu));
    };

    let provider = CUDAExecutionProvider::default().with_device_id(id);
    match provider.is_available() {
      Ok(true) => {}
      Ok(false) => {
        warn!("CUDA 设备 {} 不可用，回退到 CPU", id);
        return Ok((builder, Device::Cpu));
      }
      Err(e) => {
        warn!("查询 CUDA 可用性失败: {}，回退到 CPU", e);
        return Ok((builder, Device::Cpu));
      }
    }

    match builder.with_execution_providers([provider.build().error_on_failure()]) {
      Ok(builder) => Ok((builder, preferred)),
      Err(e) => {
        warn!("注册 CUDA 设备 {} 失败: {}，回退到 CPU", id, e);
        Ok((self.session_builder()?, Device::Cpu))
      }
    }
  }

  pub fn build(self) -> Result<OnnxModel, ModelLoadError> {
    info!("加载模型文件: {}", self.model_path.display());
    ModelLoadError::check_exists(&self.model_path)?;
    if let Ok(meta) = std::fs::metadata(&self.model_path) {
      debug!(
        "模型文件大小: {:.2} MB",
        meta.len() as f64 / (1024.0 * 1024.0)
      );
    }

    let (builder, device) = self.place(self.device.unwrap_or_default())?;
    let session = builder
      .commit_from_file(&self.model_path)
      .map_err(|e| ModelLoadError::corrupt(&self.model_path, e))?;

    let num_inputs = session.inputs.len();
    let num_outputs = session.outputs.len();
    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    if num_inputs != ONNX_NUM_INPUTS {
      return Err(ModelLoadError::incompatible(
        &self.model_path,
        format!("预期模型输入数量为 {}, 实际为 {}", ONNX_NUM_INPUTS, num_inputs),
      ));
    }
    if num_outputs == 0 {
      return Err(ModelLoadError::incompatible(&self.model_path, "模型没有输出"));
    }

    info!(
      "模型加载完成: {} ({}x{}, 设备 {})",
      self.model_path.display(),
      self.input_width,
      self.input_height,
      device
    );

    Ok(OnnxModel {
      session: Mutex::new(session),
      input_width: self.input_width,
      input_height: self.input_height,
      device,
    })
  }
}

impl OnnxModel {
  pub fn device(&self) -> Device {
    self.device
  }
}

fn classify_runtime_error(e: ort::Error) -> InferenceError {
  let message = e.to_string();
  let lower = message.to_ascii_lowercase();
  if lower.contains("out of memory") || lower.contains("failed to allocate") {
    InferenceError::ResourceExhausted(message)
  } else {
    InferenceError::Backend(message)
  }
}

impl ModelAdapter for OnnxModel {
  fn input_size(&self) -> (u32, u32) {
    (self.input_width, self.input_height)
  }

  fn infer(&self, image: &Image, device: Device) -> Result<RawOutput, InferenceError> {
    debug!("设置模型输入 ({})", device);
    let input = NchwTensor::from_image(image, self.input_width, self.input_height);
    let shape = input.shape();
    let value =
      Tensor::from_array((shape.as_slice(), input.into_data())).map_err(classify_runtime_error)?;

    let mut session = self.session.lock().map_err(|_| InferenceError::Poisoned)?;
    debug!("执行模型推理");
    let outputs = session
      .run(ort::inputs![value])
      .map_err(classify_runtime_error)?;

    debug!("获取模型输出");
    let mut tensors = Vec::with_capacity(outputs.len());
    for index in 0..outputs.len() {
      let (shape, data) = outputs[index]
        .try_extract_tensor::<f32>()
        .map_err(|e| InferenceError::UnsupportedDtype(e.to_string()))?;
      let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
      debug!("输出 {} 形状: {:?}", index, shape);
      tensors.push(RawTensor {
        shape,
        data: data.to_vec(),
      });
    }

    Ok(RawOutput {
      tensors,
      input_width: self.input_width,
      input_height: self.input_height,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_reads_query() {
    let url = Url::parse("onnx:///models/coral%20det.onnx?size=512&device=cuda:1&threads=2").unwrap();
    let builder = OnnxModelBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/models/coral det.onnx"));
    assert_eq!((builder.input_width, builder.input_height), (512, 512));
    assert_eq!(builder.device, Some(Device::Cuda(1)));
    assert_eq!(builder.intra_threads, Some(2));
  }

  #[test]
  fn url_device_wins_over_default() {
    let url = Url::parse("onnx:///models/seg.onnx?device=cpu&width=1024&height=768").unwrap();
    let builder = OnnxModelBuilder::from_url(&url)
      .unwrap()
      .default_device(Device::Cuda(0));
    assert_eq!(builder.device, Some(Device::Cpu));
    assert_eq!((builder.input_width, builder.input_height), (1024, 768));
  }

  #[test]
  fn missing_weights_fail_before_runtime() {
    let result = OnnxModelBuilder::new("/nonexistent/shanhu/model.onnx").build();
    assert!(matches!(result, Err(ModelLoadError::NotFound(_))));
  }
}
