// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/geometry.rs - 边界框几何
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

/// 源图像像素坐标下的边界框 [x_min, y_min, x_max, y_max]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
  pub x_min: f32,
  pub y_min: f32,
  pub x_max: f32,
  pub y_max: f32,
}

impl BBox {
  pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
    Self {
      x_min,
      y_min,
      x_max,
      y_max,
    }
  }

  /// 由中心点与宽高构造
  pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
  }

  pub fn width(&self) -> f32 {
    self.x_max - self.x_min
  }

  pub fn height(&self) -> f32 {
    self.y_max - self.y_min
  }

  pub fn area(&self) -> f32 {
    self.width().max(0.0) * self.height().max(0.0)
  }

  pub fn is_finite(&self) -> bool {
    self.x_min.is_finite() && self.y_min.is_finite() && self.x_max.is_finite() && self.y_max.is_finite()
  }

  /// 坐标有序（x_min < x_max 且 y_min < y_max）
  pub fn is_ordered(&self) -> bool {
    self.x_min < self.x_max && self.y_min < self.y_max
  }

  pub fn is_within(&self, width: u32, height: u32) -> bool {
    self.x_min >= 0.0
      && self.y_min >= 0.0
      && self.x_max <= width as f32
      && self.y_max <= height as f32
  }

  pub fn intersection(&self, other: &BBox) -> f32 {
    let x1 = self.x_min.max(other.x_min);
    let y1 = self.y_min.max(other.y_min);
    let x2 = self.x_max.min(other.x_max);
    let y2 = self.y_max.min(other.y_max);
    (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
  }

  /// 计算两个边界框的 IoU
  pub fn iou(&self, other: &BBox) -> f32 {
    let intersection = self.intersection(other);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }

  /// 按比例缩放（模型画布坐标 → 源图像坐标）
  pub fn scale(&self, sx: f32, sy: f32) -> Self {
    Self::new(
      self.x_min * sx,
      self.y_min * sy,
      self.x_max * sx,
      self.y_max * sy,
    )
  }

  /// 裁剪到图像范围内的整数像素框，返回 (x, y, w, h)；完全在图像外时返回 None
  pub fn to_pixel_rect(&self, width: u32, height: u32) -> Option<(i32, i32, u32, u32)> {
    if width == 0 || height == 0 || !self.is_finite() {
      return None;
    }
    let x_min = (self.x_min.floor() as i64).max(0);
    let y_min = (self.y_min.floor() as i64).max(0);
    let x_max = (self.x_max.ceil() as i64).min(width as i64);
    let y_max = (self.y_max.ceil() as i64).min(height as i64);

    if x_min >= x_max || y_min >= y_max {
      return None;
    }
    Some((
      x_min as i32,
      y_min as i32,
      (x_max - x_min) as u32,
      (y_max - y_min) as u32,
    ))
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.x_min, self.y_min, self.x_max, self.y_max]
  }
}
