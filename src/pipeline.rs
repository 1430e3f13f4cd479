// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/pipeline.rs - 检测、分割、对齐、绘制与统计的编排
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

//! 一次调用处理一张图像：检测与分割并行，对齐后再并行绘制与统计。
//! 模型句柄在构造时加载一次，之后只读共享。

use std::{path::PathBuf, time::Instant};

use chrono::Utc;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  detection::{DetectionConfig, DetectionStage},
  frame::Image,
  labels::LabelSet,
  metrics::{MetricsAggregator, ModelInfo, ResultsRecord, RunMetadata, StageTimings},
  model::{Device, InferenceError, ModelHandle, ModelLoadError},
  output::{OverlayConfig, OverlayRenderer},
  reconcile::{DEFAULT_MATCH_IOU, Reconciler},
  segmentation::{SegmentationConfig, SegmentationHead, SegmentationStage},
};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("模型加载失败: {0}")]
  Load(#[from] ModelLoadError),
  #[error("检测阶段失败: {0}")]
  Detection(#[source] InferenceError),
  #[error("分割阶段失败: {0}")]
  Segmentation(#[source] InferenceError),
}

/// 构造期配置，运行中不可修改
#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub detector: Url,
  pub segmenter: Url,
  /// 期望设备，不可用时加载阶段回退到 CPU
  pub device: Device,
  pub detection: DetectionConfig,
  pub segmentation: SegmentationConfig,
  /// 检测与掩码配对所需的最小 IoU（严格大于）
  pub match_iou: f32,
  pub overlay: OverlayConfig,
}

impl PipelineConfig {
  pub fn new(detector: Url, segmenter: Url) -> Self {
    Self {
      detector,
      segmenter,
      device: Device::default(),
      detection: DetectionConfig::default(),
      segmentation: SegmentationConfig::default(),
      match_iou: DEFAULT_MATCH_IOU,
      overlay: OverlayConfig::default(),
    }
  }

  pub fn with_device(mut self, device: Device) -> Self {
    self.device = device;
    self
  }

  /// 检测器与分割器共用同一份类别表
  pub fn with_labels(mut self, labels: LabelSet) -> Self {
    self.detection.labels = labels.clone();
    self.segmentation.labels = labels;
    self
  }

  pub fn with_detection_labels(mut self, labels: LabelSet) -> Self {
    self.detection.labels = labels;
    self
  }

  pub fn with_segmentation_labels(mut self, labels: LabelSet) -> Self {
    self.segmentation.labels = labels;
    self
  }

  pub fn with_detection_threshold(mut self, threshold: f32) -> Self {
    self.detection.confidence_threshold = threshold;
    self
  }

  pub fn with_nms_threshold(mut self, threshold: f32) -> Self {
    self.detection.nms_threshold = threshold;
    self
  }

  pub fn with_segmentation_threshold(mut self, threshold: f32) -> Self {
    self.segmentation.confidence_threshold = threshold;
    self
  }

  pub fn with_mask_threshold(mut self, threshold: f32) -> Self {
    self.segmentation.mask_threshold = threshold;
    self
  }

  pub fn with_segmentation_head(mut self, head: SegmentationHead) -> Self {
    self.segmentation.head = head;
    self
  }

  pub fn with_background_class(mut self, class: Option<usize>) -> Self {
    self.segmentation.background_class = class;
    self
  }

  pub fn with_match_iou(mut self, iou: f32) -> Self {
    self.match_iou = iou;
    self
  }

  pub fn with_overlay(mut self, overlay: OverlayConfig) -> Self {
    self.overlay = overlay;
    self
  }

  pub fn with_font(mut self, path: Option<PathBuf>) -> Self {
    self.overlay.font_path = path;
    self
  }

  /// 两个类别表的并集，保持首次出现的顺序
  pub fn known_labels(&self) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for name in self
      .detection
      .labels
      .names()
      .iter()
      .chain(self.segmentation.labels.names())
    {
      if !labels.contains(name) {
        labels.push(name.clone());
      }
    }
    labels
  }
}

/// 一次调用的两个产物，总是同时返回
#[derive(Debug, Clone)]
pub struct PipelineOutput {
  pub overlay: Image,
  pub record: ResultsRecord,
}

pub struct CoralPipeline {
  detector: ModelHandle,
  segmenter: ModelHandle,
  detection: DetectionStage,
  segmentation: SegmentationStage,
  reconciler: Reconciler,
  renderer: OverlayRenderer,
  aggregator: MetricsAggregator,
}

fn timed<T>(f: impl FnOnce() -> T) -> (T, f64) {
  let now = Instant::now();
  let value = f();
  (value, now.elapsed().as_secs_f64() * 1000.0)
}

fn model_info(handle: &ModelHandle) -> ModelInfo {
  ModelInfo {
    backend: handle.backend_name().to_string(),
    device: handle.device().to_string(),
    source: handle.source().to_string(),
  }
}

impl CoralPipeline {
  /// 加载检测与分割模型
  pub fn load(config: &PipelineConfig) -> Result<Self, PipelineError> {
    let detector = ModelHandle::load(&config.detector, config.device)?;
    let segmenter = ModelHandle::load(&config.segmenter, config.device)?;
    info!(
      "模型加载完成: 检测 {} ({}), 分割 {} ({})",
      detector.backend_name(),
      detector.device(),
      segmenter.backend_name(),
      segmenter.device()
    );
    Ok(Self::from_handles(detector, segmenter, config))
  }

  /// 使用已加载的句柄
  pub fn from_handles(detector: ModelHandle, segmenter: ModelHandle, config: &PipelineConfig) -> Self {
    Self {
      detector,
      segmenter,
      detection: DetectionStage::new(config.detection.clone()),
      segmentation: SegmentationStage::new(config.segmentation.clone()),
      reconciler: Reconciler::new(config.match_iou),
      renderer: OverlayRenderer::new(config.overlay.clone()),
      aggregator: MetricsAggregator::new(config.known_labels()),
    }
  }

  /// 替换叠加绘制器
  pub fn with_renderer(mut self, renderer: OverlayRenderer) -> Self {
    self.renderer = renderer;
    self
  }

  pub fn detector(&self) -> &ModelHandle {
    &self.detector
  }

  pub fn segmenter(&self) -> &ModelHandle {
    &self.segmenter
  }

  /// 处理一张图像；任一阶段失败时不返回部分结果。
  ///
  /// 检测与分割同时失败时报告检测阶段的错误。
  pub fn run(&self, image: &Image) -> Result<PipelineOutput, PipelineError> {
    let started_at = Utc::now();
    let start = Instant::now();

    let ((detections, detection_ms), (masks, segmentation_ms)) = rayon::join(
      || timed(|| self.detection.detect(&self.detector, image)),
      || timed(|| self.segmentation.segment(&self.segmenter, image)),
    );
    let detections = detections.map_err(PipelineError::Detection)?;
    let masks = masks.map_err(PipelineError::Segmentation)?;
    debug!("检测 {} 个, 掩码 {} 个", detections.len(), masks.len());

    let (instances, reconcile_ms) = timed(|| self.reconciler.reconcile(detections, masks));

    let image_area = image.width() as u64 * image.height() as u64;
    let ((overlay, render_ms), (record, aggregate_ms)) = rayon::join(
      || timed(|| self.renderer.render(image, &instances)),
      || timed(|| self.aggregator.aggregate(&instances, image_area)),
    );

    let timings = StageTimings {
      detection_ms,
      segmentation_ms,
      reconcile_ms,
      render_ms,
      aggregate_ms,
      total_ms: start.elapsed().as_secs_f64() * 1000.0,
    };
    info!(
      "处理完成: {} 个实例, 覆盖率 {:.2}%, 耗时 {:.2} ms",
      record.total_instances, record.aggregate_coverage_pct, timings.total_ms
    );

    let record = record.with_metadata(RunMetadata {
      image_width: image.width(),
      image_height: image.height(),
      detector: Some(model_info(&self.detector)),
      segmenter: Some(model_info(&self.segmenter)),
      started_at: Some(started_at),
      timings,
    });
    Ok(PipelineOutput { overlay, record })
  }

  /// 并行处理多张图像，各图像的结果互不影响，顺序与输入一致
  pub fn run_batch(&self, images: &[Image]) -> Vec<Result<PipelineOutput, PipelineError>> {
    images.par_iter().map(|image| self.run(image)).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn assert_send_sync<T: Send + Sync>() {}

  #[test]
  fn pipeline_is_shareable_across_threads() {
    assert_send_sync::<CoralPipeline>();
  }

  fn config() -> PipelineConfig {
    PipelineConfig::new(
      Url::parse("replay:///models/det.json").unwrap(),
      Url::parse("replay:///models/seg.json").unwrap(),
    )
  }

  #[test]
  fn defaults_follow_documented_thresholds() {
    let config = config();
    assert_eq!(config.detection.confidence_threshold, 0.25);
    assert_eq!(config.detection.nms_threshold, 0.45);
    assert_eq!(config.segmentation.mask_threshold, 0.5);
    assert_eq!(config.match_iou, 0.5);
    assert_eq!(config.device, Device::Cpu);
  }

  #[test]
  fn known_labels_merge_without_duplicates() {
    let config = config()
      .with_detection_labels(LabelSet::new(["coral", "algae"]))
      .with_segmentation_labels(LabelSet::new(["algae", "sand"]));
    assert_eq!(config.known_labels(), vec!["coral", "algae", "sand"]);
  }

  #[test]
  fn missing_model_is_a_load_error() {
    assert!(matches!(
      CoralPipeline::load(&config()),
      Err(PipelineError::Load(ModelLoadError::NotFound(_)))
    ));
  }
}
