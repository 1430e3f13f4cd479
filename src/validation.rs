// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/validation.rs - 检测/掩码记录校验
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

//! 阶段内部的记录校验。
//!
//! 校验失败只会让对应记录被丢弃并记录警告，不会向调用方传播。

use thiserror::Error;
use tracing::warn;

use crate::geometry::BBox;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
  #[error("置信度超出 [0, 1]: {0}")]
  ConfidenceOutOfRange(f32),
  #[error("边界框坐标非有限值: {0:?}")]
  NonFiniteBox([f32; 4]),
  #[error("边界框退化: {0:?}")]
  DegenerateBox([f32; 4]),
  #[error("边界框超出图像 {width}x{height}: {bbox:?}")]
  OutOfBounds {
    bbox: [f32; 4],
    width: u32,
    height: u32,
  },
  #[error("掩码尺寸 {actual:?} 与图像尺寸 {expected:?} 不一致")]
  MaskSizeMismatch {
    expected: (u32, u32),
    actual: (u32, u32),
  },
  #[error("掩码为空")]
  EmptyMask,
}

pub fn check_confidence(confidence: f32) -> Result<(), ValidationError> {
  if (0.0..=1.0).contains(&confidence) {
    Ok(())
  } else {
    Err(ValidationError::ConfidenceOutOfRange(confidence))
  }
}

pub fn check_bbox(bbox: &BBox, width: u32, height: u32) -> Result<(), ValidationError> {
  if !bbox.is_finite() {
    return Err(ValidationError::NonFiniteBox(bbox.to_array()));
  }
  if !bbox.is_ordered() {
    return Err(ValidationError::DegenerateBox(bbox.to_array()));
  }
  if !bbox.is_within(width, height) {
    return Err(ValidationError::OutOfBounds {
      bbox: bbox.to_array(),
      width,
      height,
    });
  }
  Ok(())
}

/// 保留通过校验的记录，其余记录以警告形式丢弃
pub fn retain_valid<T, F>(records: Vec<T>, stage: &str, check: F) -> Vec<T>
where
  F: Fn(&T) -> Result<(), ValidationError>,
{
  let before = records.len();
  let kept: Vec<T> = records
    .into_iter()
    .filter(|record| match check(record) {
      Ok(()) => true,
      Err(e) => {
        warn!("{}: 丢弃无效记录: {}", stage, e);
        false
      }
    })
    .collect();
  if kept.len() != before {
    warn!("{}: 共丢弃 {} 条无效记录", stage, before - kept.len());
  }
  kept
}
