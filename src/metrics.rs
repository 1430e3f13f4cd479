// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/metrics.rs - 计数与覆盖率统计
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

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
  reconcile::{Instance, InstanceKind},
  segmentation::BinaryMask,
};

/// 单个实例的明细
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceDetail {
  pub id: usize,
  pub label: String,
  pub kind: InstanceKind,
  pub confidence: f32,
  pub detection_confidence: Option<f32>,
  pub mask_confidence: Option<f32>,
  /// [x_min, y_min, x_max, y_max]
  pub bbox: Option<[f32; 4]>,
  pub mask_area: Option<u64>,
  pub match_iou: Option<f32>,
}

impl From<&Instance> for InstanceDetail {
  fn from(instance: &Instance) -> Self {
    Self {
      id: instance.id(),
      label: instance.label().to_string(),
      kind: instance.kind(),
      confidence: instance.confidence(),
      detection_confidence: instance.detection().map(|d| d.confidence),
      mask_confidence: instance.mask().map(|m| m.confidence),
      bbox: instance.bbox().map(|b| b.to_array()),
      mask_area: instance.mask().map(|m| m.area()),
      match_iou: instance.match_iou(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelInfo {
  pub backend: String,
  pub device: String,
  pub source: String,
}

/// 各阶段耗时（毫秒）
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTimings {
  pub detection_ms: f64,
  pub segmentation_ms: f64,
  pub reconcile_ms: f64,
  pub render_ms: f64,
  pub aggregate_ms: f64,
  pub total_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunMetadata {
  pub image_width: u32,
  pub image_height: u32,
  pub detector: Option<ModelInfo>,
  pub segmenter: Option<ModelInfo>,
  pub started_at: Option<DateTime<Utc>>,
  pub timings: StageTimings,
}

/// 一次流水线运行的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultsRecord {
  pub image_area: u64,
  pub total_instances: usize,
  pub class_counts: BTreeMap<String, usize>,
  /// 每类掩码像素并集 / 图像面积
  pub class_coverage: BTreeMap<String, f64>,
  /// 全部掩码像素并集 / 图像面积
  pub aggregate_coverage: f64,
  pub aggregate_coverage_pct: f64,
  pub has_segmentation: bool,
  pub instances: Vec<InstanceDetail>,
  pub metadata: RunMetadata,
}

impl ResultsRecord {
  pub fn with_metadata(mut self, metadata: RunMetadata) -> Self {
    self.metadata = metadata;
    self
  }

  pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(self)
  }
}

/// 覆盖像素并集
#[derive(Default)]
struct Union {
  pixels: Vec<bool>,
}

impl Union {
  fn add(&mut self, mask: &BinaryMask) {
    let width = mask.width() as usize;
    let len = width * mask.height() as usize;
    if self.pixels.len() < len {
      self.pixels.resize(len, false);
    }
    for (x, y) in mask.pixels() {
      self.pixels[y as usize * width + x as usize] = true;
    }
  }

  fn count(&self) -> u64 {
    self.pixels.iter().filter(|&&on| on).count() as u64
  }
}

fn fraction(pixels: u64, image_area: u64) -> f64 {
  if image_area == 0 {
    0.0
  } else {
    (pixels as f64 / image_area as f64).min(1.0)
  }
}

/// 由实例集合计算统计结果；纯函数，无副作用
#[derive(Debug, Clone, Default)]
pub struct MetricsAggregator {
  known_labels: Vec<String>,
}

impl MetricsAggregator {
  /// `known_labels` 中的类别即使没有实例也会以 0 出现在结果中
  pub fn new<I, S>(known_labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      known_labels: known_labels.into_iter().map(Into::into).collect(),
    }
  }

  pub fn aggregate(&self, instances: &[Instance], image_area: u64) -> ResultsRecord {
    let mut class_counts: BTreeMap<String, usize> = self
      .known_labels
      .iter()
      .map(|label| (label.clone(), 0))
      .collect();
    let mut class_unions: BTreeMap<String, Union> = BTreeMap::new();
    let mut total_union = Union::default();

    for instance in instances {
      *class_counts.entry(instance.label().to_string()).or_insert(0) += 1;
      if let Some(mask) = instance.mask() {
        class_unions
          .entry(instance.label().to_string())
          .or_default()
          .add(&mask.mask);
        total_union.add(&mask.mask);
      }
    }

    let class_coverage: BTreeMap<String, f64> = class_counts
      .keys()
      .map(|label| {
        let pixels = class_unions.get(label).map_or(0, Union::count);
        (label.clone(), fraction(pixels, image_area))
      })
      .collect();
    let aggregate_coverage = fraction(total_union.count(), image_area);

    ResultsRecord {
      image_area,
      total_instances: instances.len(),
      class_counts,
      class_coverage,
      aggregate_coverage,
      aggregate_coverage_pct: aggregate_coverage * 100.0,
      has_segmentation: instances.iter().any(|i| i.mask().is_some()),
      instances: instances.iter().map(InstanceDetail::from).collect(),
      metadata: RunMetadata::default(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    detection::Detection,
    geometry::BBox,
    reconcile::Reconciler,
    segmentation::{BinaryMask, Mask},
  };

  fn rect_mask(label: &str, rect: [u32; 4]) -> Mask {
    Mask::new(
      label,
      0,
      0.8,
      BinaryMask::from_rect(100, 100, rect[0], rect[1], rect[2], rect[3]),
    )
  }

  #[test]
  fn empty_instances_report_zeros() {
    let aggregator = MetricsAggregator::new(["coral", "algae"]);
    let record = aggregator.aggregate(&[], 10_000);
    assert_eq!(record.total_instances, 0);
    assert_eq!(record.class_counts.values().sum::<usize>(), 0);
    assert!(record.class_coverage.values().all(|&c| c == 0.0));
    assert_eq!(record.class_counts.len(), 2);
    assert_eq!(record.aggregate_coverage, 0.0);
    assert!(!record.has_segmentation);
  }

  #[test]
  fn overlapping_same_class_masks_are_unioned() {
    let instances = Reconciler::default().reconcile(
      vec![],
      vec![
        rect_mask("coral", [0, 0, 20, 10]),
        rect_mask("coral", [10, 0, 30, 10]),
      ],
    );
    let record = MetricsAggregator::default().aggregate(&instances, 10_000);
    assert_eq!(record.class_counts["coral"], 2);
    // 并集 300 像素，而非 400
    assert_eq!(record.class_coverage["coral"], 0.03);
    assert_eq!(record.aggregate_coverage, 0.03);
  }

  #[test]
  fn aggregate_never_exceeds_sum_of_classes() {
    let instances = Reconciler::default().reconcile(
      vec![],
      vec![
        rect_mask("coral", [0, 0, 50, 50]),
        rect_mask("algae", [25, 25, 75, 75]),
        rect_mask("sand", [80, 80, 100, 100]),
      ],
    );
    let record = MetricsAggregator::default().aggregate(&instances, 10_000);
    let sum: f64 = record.class_coverage.values().sum();
    assert!(record.aggregate_coverage < sum);
    assert_eq!(record.aggregate_coverage, (2500.0 + 2500.0 - 625.0 + 400.0) / 10_000.0);

    let disjoint = Reconciler::default().reconcile(
      vec![],
      vec![rect_mask("coral", [0, 0, 10, 10]), rect_mask("algae", [50, 50, 60, 60])],
    );
    let record = MetricsAggregator::default().aggregate(&disjoint, 10_000);
    let sum: f64 = record.class_coverage.values().sum();
    assert_eq!(record.aggregate_coverage, sum);
  }

  #[test]
  fn aggregate_is_idempotent() {
    let instances = Reconciler::default().reconcile(
      vec![Detection::new("coral", 0, 0.9, BBox::new(10.0, 10.0, 50.0, 50.0))],
      vec![rect_mask("coral", [10, 10, 50, 50]), rect_mask("algae", [0, 60, 30, 90])],
    );
    let aggregator = MetricsAggregator::new(["coral", "algae", "sponge"]);
    let first = aggregator.aggregate(&instances, 10_000).to_json_pretty().unwrap();
    let second = aggregator.aggregate(&instances, 10_000).to_json_pretty().unwrap();
    assert_eq!(first, second);
  }

  #[test]
  fn detection_only_instances_count_without_coverage() {
    let instances = Reconciler::default().reconcile(
      vec![Detection::new("coral", 0, 0.9, BBox::new(10.0, 10.0, 50.0, 50.0))],
      vec![],
    );
    let record = MetricsAggregator::default().aggregate(&instances, 10_000);
    assert_eq!(record.class_counts["coral"], 1);
    assert_eq!(record.class_coverage["coral"], 0.0);
    assert_eq!(record.instances[0].kind, InstanceKind::DetectionOnly);
    assert_eq!(record.instances[0].mask_area, None);
  }

  #[test]
  fn zero_area_image_does_not_divide_by_zero() {
    let record = MetricsAggregator::default().aggregate(&[], 0);
    assert_eq!(record.aggregate_coverage, 0.0);
  }
}
