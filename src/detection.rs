// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/detection.rs - 目标检测阶段
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

use serde::Serialize;
use tracing::debug;

use crate::{
  frame::Image,
  geometry::BBox,
  labels::LabelSet,
  model::{InferenceError, ModelHandle, RawOutput, RawTensor},
  validation::{ValidationError, check_bbox, check_confidence, retain_valid},
};

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_NMS_THRESHOLD: f32 = 0.45;
/// cx, cy, w, h
const BOX_FEATURES: usize = 4;

/// 检测结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  /// 类别名称
  pub label: String,
  /// 类别索引
  pub class_id: usize,
  /// 置信度
  pub confidence: f32,
  /// 源图像像素坐标
  pub bbox: BBox,
}

impl Detection {
  pub fn new(label: impl Into<String>, class_id: usize, confidence: f32, bbox: BBox) -> Self {
    Self {
      label: label.into(),
      class_id,
      confidence,
      bbox,
    }
  }

  pub fn validate(&self, width: u32, height: u32) -> Result<(), ValidationError> {
    check_confidence(self.confidence)?;
    check_bbox(&self.bbox, width, height)
  }
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
  /// 置信度阈值，低于该值的检测被丢弃
  pub confidence_threshold: f32,
  /// NMS IoU 阈值
  pub nms_threshold: f32,
  pub labels: LabelSet,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      nms_threshold: DEFAULT_NMS_THRESHOLD,
      labels: LabelSet::default(),
    }
  }
}

/// 检测输出矩阵的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
  /// [4 + C, N]
  FeaturesMajor { features: usize, anchors: usize },
  /// [N, 4 + C]
  AnchorsMajor { features: usize, anchors: usize },
}

impl Layout {
  fn detect(tensor: &RawTensor, num_labels: usize) -> Result<Self, InferenceError> {
    let shape = &tensor.shape;
    if shape.len() < 2 || shape[..shape.len() - 2].iter().any(|&d| d != 1) {
      return Err(InferenceError::shape("[1, 4+C, N] 或 [1, N, 4+C]", shape));
    }
    let rows = shape[shape.len() - 2];
    let cols = shape[shape.len() - 1];
    let expected = BOX_FEATURES + num_labels;

    let layout = if num_labels > 0 && rows == expected {
      Layout::FeaturesMajor {
        features: rows,
        anchors: cols,
      }
    } else if num_labels > 0 && cols == expected {
      Layout::AnchorsMajor {
        features: cols,
        anchors: rows,
      }
    } else if rows <= cols && rows > BOX_FEATURES {
      Layout::FeaturesMajor {
        features: rows,
        anchors: cols,
      }
    } else {
      Layout::AnchorsMajor {
        features: cols,
        anchors: rows,
      }
    };

    match layout {
      Layout::FeaturesMajor { features, .. } | Layout::AnchorsMajor { features, .. }
        if features > BOX_FEATURES =>
      {
        Ok(layout)
      }
      _ => Err(InferenceError::shape("至少 5 个特征通道", shape)),
    }
  }

  fn features(&self) -> usize {
    match *self {
      Layout::FeaturesMajor { features, .. } | Layout::AnchorsMajor { features, .. } => features,
    }
  }

  fn anchors(&self) -> usize {
    match *self {
      Layout::FeaturesMajor { anchors, .. } | Layout::AnchorsMajor { anchors, .. } => anchors,
    }
  }

  #[inline]
  fn index(&self, feature: usize, anchor: usize) -> usize {
    match *self {
      Layout::FeaturesMajor { anchors, .. } => feature * anchors + anchor,
      Layout::AnchorsMajor { features, .. } => anchor * features + feature,
    }
  }
}

/// 检测阶段：运行检测模型并整理为有序的检测记录
#[derive(Debug, Clone, Default)]
pub struct DetectionStage {
  config: DetectionConfig,
}

impl DetectionStage {
  pub fn new(config: DetectionConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &DetectionConfig {
    &self.config
  }

  /// 运行推理，输出按置信度降序排列
  pub fn detect(&self, handle: &ModelHandle, image: &Image) -> Result<Vec<Detection>, InferenceError> {
    let raw = handle.infer(image)?;
    let candidates = self.decode(&raw, image.width(), image.height())?;
    Ok(self.postprocess(candidates, image.width(), image.height()))
  }

  /// 将原始张量解码为源图像坐标下的候选检测
  pub fn decode(
    &self,
    raw: &RawOutput,
    width: u32,
    height: u32,
  ) -> Result<Vec<Detection>, InferenceError> {
    let tensor = raw.tensor(0)?;
    let layout = Layout::detect(tensor, self.config.labels.len())?;
    let data = &tensor.data;
    let num_classes = layout.features() - BOX_FEATURES;
    debug!(
      "检测输出: {:?}, {} 个候选, {} 个类别",
      tensor.shape,
      layout.anchors(),
      num_classes
    );

    if raw.input_width == 0 || raw.input_height == 0 {
      return Err(InferenceError::shape(
        "非零的模型画布尺寸",
        &[raw.input_width as usize, raw.input_height as usize],
      ));
    }
    let sx = width as f32 / raw.input_width as f32;
    let sy = height as f32 / raw.input_height as f32;

    let mut items = Vec::new();
    for anchor in 0..layout.anchors() {
      let (score, class_id) = {
        let mut max_score = f32::MIN;
        let mut cls_idx = 0usize;
        for c in 0..num_classes {
          let score = data[layout.index(BOX_FEATURES + c, anchor)];
          if score > max_score {
            max_score = score;
            cls_idx = c;
          }
        }
        (max_score, cls_idx)
      };

      if score < self.config.confidence_threshold {
        continue;
      }

      let cx = data[layout.index(0, anchor)];
      let cy = data[layout.index(1, anchor)];
      let w = data[layout.index(2, anchor)];
      let h = data[layout.index(3, anchor)];

      // 越界的框不裁剪，交由校验丢弃
      let bbox = BBox::from_center(cx, cy, w, h).scale(sx, sy);

      items.push(Detection::new(
        self.config.labels.name(class_id),
        class_id,
        score,
        bbox,
      ));
    }

    debug!("解码得到 {} 个候选检测", items.len());
    Ok(items)
  }

  /// 校验、阈值过滤、按类别 NMS，并按置信度降序排列
  pub fn postprocess(&self, candidates: Vec<Detection>, width: u32, height: u32) -> Vec<Detection> {
    let valid = retain_valid(candidates, "检测阶段", |d| d.validate(width, height));
    let kept: Vec<Detection> = valid
      .into_iter()
      .filter(|d| d.confidence >= self.config.confidence_threshold)
      .collect();
    let result = non_max_suppression(kept, self.config.nms_threshold);
    debug!("检测到 {} 个物体", result.len());
    result
  }
}

/// 按置信度降序稳定排序
pub fn sort_by_confidence(detections: &mut [Detection]) {
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
}

/// 非极大值抑制：同类别框 IoU 超过阈值时只保留置信度更高者
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
  sort_by_confidence(&mut detections);

  let mut result: Vec<Detection> = Vec::with_capacity(detections.len());
  for det in detections {
    let suppressed = result
      .iter()
      .any(|kept| kept.label == det.label && kept.bbox.iou(&det.bbox) > iou_threshold);
    if !suppressed {
      result.push(det);
    }
  }
  result
}
