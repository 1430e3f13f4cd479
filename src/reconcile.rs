// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/reconcile.rs - 检测框与分割掩码的实例配对
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

//! 将两个模型各自的输出对齐为“实例”。
//!
//! 每个检测框与同类别、尚未配对的掩码按 IoU 匹配；
//! 未配对的检测与掩码各自成为独立实例。

use std::cmp::Ordering;

use serde::Serialize;
use tracing::debug;

use crate::{
  detection::{Detection, sort_by_confidence},
  geometry::BBox,
  segmentation::Mask,
};

pub const DEFAULT_MATCH_IOU: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
  Paired,
  DetectionOnly,
  MaskOnly,
}

#[derive(Debug, Clone, PartialEq)]
enum Parts {
  Paired {
    detection: Detection,
    mask: Mask,
    iou: f32,
  },
  Detection(Detection),
  Mask(Mask),
}

/// 一个物理目标：至多一个检测与至多一个掩码，且二者不同时为空
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
  id: usize,
  parts: Parts,
}

impl Instance {
  /// 检测与掩码都为空时返回 None
  pub fn new(id: usize, detection: Option<Detection>, mask: Option<Mask>) -> Option<Self> {
    let parts = match (detection, mask) {
      (Some(detection), Some(mask)) => {
        let iou = mask.bbox().map_or(0.0, |b| detection.bbox.iou(&b));
        Parts::Paired {
          detection,
          mask,
          iou,
        }
      }
      (Some(detection), None) => Parts::Detection(detection),
      (None, Some(mask)) => Parts::Mask(mask),
      (None, None) => return None,
    };
    Some(Self { id, parts })
  }

  pub fn paired(id: usize, detection: Detection, mask: Mask, iou: f32) -> Self {
    Self {
      id,
      parts: Parts::Paired {
        detection,
        mask,
        iou,
      },
    }
  }

  pub fn detection_only(id: usize, detection: Detection) -> Self {
    Self {
      id,
      parts: Parts::Detection(detection),
    }
  }

  pub fn mask_only(id: usize, mask: Mask) -> Self {
    Self {
      id,
      parts: Parts::Mask(mask),
    }
  }

  pub fn id(&self) -> usize {
    self.id
  }

  pub fn detection(&self) -> Option<&Detection> {
    match &self.parts {
      Parts::Paired { detection, .. } | Parts::Detection(detection) => Some(detection),
      Parts::Mask(_) => None,
    }
  }

  pub fn mask(&self) -> Option<&Mask> {
    match &self.parts {
      Parts::Paired { mask, .. } | Parts::Mask(mask) => Some(mask),
      Parts::Detection(_) => None,
    }
  }

  pub fn match_iou(&self) -> Option<f32> {
    match self.parts {
      Parts::Paired { iou, .. } => Some(iou),
      _ => None,
    }
  }

  pub fn kind(&self) -> InstanceKind {
    match self.parts {
      Parts::Paired { .. } => InstanceKind::Paired,
      Parts::Detection(_) => InstanceKind::DetectionOnly,
      Parts::Mask(_) => InstanceKind::MaskOnly,
    }
  }

  pub fn label(&self) -> &str {
    match &self.parts {
      Parts::Paired { detection, .. } | Parts::Detection(detection) => &detection.label,
      Parts::Mask(mask) => &mask.label,
    }
  }

  /// 优先使用检测置信度
  pub fn confidence(&self) -> f32 {
    match &self.parts {
      Parts::Paired { detection, .. } | Parts::Detection(detection) => detection.confidence,
      Parts::Mask(mask) => mask.confidence,
    }
  }

  /// 检测框，若无检测则取掩码外接框
  pub fn bbox(&self) -> Option<BBox> {
    match &self.parts {
      Parts::Paired { detection, .. } | Parts::Detection(detection) => Some(detection.bbox),
      Parts::Mask(mask) => mask.bbox(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciler {
  iou_threshold: f32,
}

impl Default for Reconciler {
  fn default() -> Self {
    Self::new(DEFAULT_MATCH_IOU)
  }
}

struct Candidate {
  index: usize,
  iou: f32,
  confidence: f32,
}

impl Candidate {
  /// IoU 高者优先，其次掩码置信度高者，最后索引小者
  fn better_than(&self, other: &Candidate) -> bool {
    match self.iou.total_cmp(&other.iou) {
      Ordering::Greater => true,
      Ordering::Less => false,
      Ordering::Equal => match self.confidence.total_cmp(&other.confidence) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => self.index < other.index,
      },
    }
  }
}

impl Reconciler {
  pub fn new(iou_threshold: f32) -> Self {
    Self { iou_threshold }
  }

  pub fn iou_threshold(&self) -> f32 {
    self.iou_threshold
  }

  /// 输出顺序：含检测的实例按检测置信度降序，其后是仅掩码实例（按分割输出顺序）
  pub fn reconcile(&self, mut detections: Vec<Detection>, masks: Vec<Mask>) -> Vec<Instance> {
    sort_by_confidence(&mut detections);

    let mask_boxes: Vec<Option<BBox>> = masks.iter().map(Mask::bbox).collect();
    let mut slots: Vec<Option<Mask>> = masks.into_iter().map(Some).collect();
    let mut instances = Vec::with_capacity(detections.len() + slots.len());

    for detection in detections {
      let mut best: Option<Candidate> = None;
      for (index, slot) in slots.iter().enumerate() {
        let Some(mask) = slot else { continue };
        if mask.label != detection.label {
          continue;
        }
        let Some(mask_box) = mask_boxes[index] else {
          continue;
        };
        let iou = detection.bbox.iou(&mask_box);
        if iou <= self.iou_threshold {
          continue;
        }
        let candidate = Candidate {
          index,
          iou,
          confidence: mask.confidence,
        };
        if best.as_ref().is_none_or(|b| candidate.better_than(b)) {
          best = Some(candidate);
        }
      }

      let id = instances.len();
      let paired = best.and_then(|b| slots[b.index].take().map(|mask| (mask, b.iou)));
      match paired {
        Some((mask, iou)) => {
          debug!(
            "实例 {}: {} 检测与掩码配对 (IoU {:.3})",
            id, detection.label, iou
          );
          instances.push(Instance::paired(id, detection, mask, iou));
        }
        None => instances.push(Instance::detection_only(id, detection)),
      }
    }

    for mask in slots.into_iter().flatten() {
      let id = instances.len();
      instances.push(Instance::mask_only(id, mask));
    }

    debug!("配对得到 {} 个实例", instances.len());
    instances
  }
}
