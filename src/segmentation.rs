// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/segmentation.rs - 分割阶段
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

use std::{fmt, str::FromStr};

use tracing::debug;

use crate::{
  frame::Image,
  geometry::BBox,
  labels::LabelSet,
  model::{InferenceError, ModelHandle, RawOutput, RawTensor},
  validation::{ValidationError, check_confidence, retain_valid},
};

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;
const DEFAULT_MASK_THRESHOLD: f32 = 0.5;

/// 与源图像同尺寸的二值掩码，只保存边界框内的像素
#[derive(Clone, PartialEq)]
pub struct BinaryMask {
  width: u32,
  height: u32,
  /// 保存区域的左上角
  origin: (u32, u32),
  /// 保存区域的行宽
  stride: u32,
  data: Box<[bool]>,
  area: u64,
  bounds: Option<BBox>,
}

impl fmt::Debug for BinaryMask {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BinaryMask")
      .field("width", &self.width)
      .field("height", &self.height)
      .field("area", &self.area)
      .field("bounds", &self.bounds)
      .finish()
  }
}

impl BinaryMask {
  /// `f` 对每个像素至少调用一次，边界框内的像素会调用两次
  pub fn from_fn<F>(width: u32, height: u32, mut f: F) -> Self
  where
    F: FnMut(u32, u32) -> bool,
  {
    let mut area = 0u64;
    let (mut x0, mut y0, mut x1, mut y1) = (u32::MAX, u32::MAX, 0u32, 0u32);

    for y in 0..height {
      for x in 0..width {
        if f(x, y) {
          area += 1;
          x0 = x0.min(x);
          y0 = y0.min(y);
          x1 = x1.max(x);
          y1 = y1.max(y);
        }
      }
    }

    if area == 0 {
      return Self {
        width,
        height,
        origin: (0, 0),
        stride: 0,
        data: Box::default(),
        area,
        bounds: None,
      };
    }

    let stride = x1 - x0 + 1;
    let mut data = Vec::with_capacity(stride as usize * (y1 - y0 + 1) as usize);
    for y in y0..=y1 {
      for x in x0..=x1 {
        data.push(f(x, y));
      }
    }

    Self {
      width,
      height,
      origin: (x0, y0),
      stride,
      data: data.into_boxed_slice(),
      area,
      // 像素边界框，右下边界不包含
      bounds: Some(BBox::new(
        x0 as f32,
        y0 as f32,
        (x1 + 1) as f32,
        (y1 + 1) as f32,
      )),
    }
  }

  /// 矩形区域 [x_min, x_max) × [y_min, y_max)
  pub fn from_rect(width: u32, height: u32, x_min: u32, y_min: u32, x_max: u32, y_max: u32) -> Self {
    Self::from_fn(width, height, |x, y| {
      x >= x_min && x < x_max && y >= y_min && y < y_max
    })
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  /// 正像素数量
  pub fn area(&self) -> u64 {
    self.area
  }

  pub fn is_empty(&self) -> bool {
    self.area == 0
  }

  pub fn bounding_box(&self) -> Option<BBox> {
    self.bounds
  }

  pub fn get(&self, x: u32, y: u32) -> bool {
    let (x0, y0) = self.origin;
    if self.stride == 0 || x < x0 || y < y0 || x - x0 >= self.stride {
      return false;
    }
    let index = ((y - y0) as usize) * (self.stride as usize) + ((x - x0) as usize);
    self.data.get(index).copied().unwrap_or(false)
  }

  /// 按行优先顺序遍历正像素的坐标
  pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
    let (x0, y0) = self.origin;
    let stride = self.stride as usize;
    self
      .data
      .iter()
      .enumerate()
      .filter(|&(_, &on)| on)
      .map(move |(i, _)| (x0 + (i % stride) as u32, y0 + (i / stride) as u32))
  }
}

/// 分割结果
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
  pub label: String,
  pub class_id: usize,
  pub confidence: f32,
  pub mask: BinaryMask,
}

impl Mask {
  pub fn new(label: impl Into<String>, class_id: usize, confidence: f32, mask: BinaryMask) -> Self {
    Self {
      label: label.into(),
      class_id,
      confidence,
      mask,
    }
  }

  pub fn bbox(&self) -> Option<BBox> {
    self.mask.bounding_box()
  }

  pub fn area(&self) -> u64 {
    self.mask.area()
  }

  pub fn validate(&self, width: u32, height: u32) -> Result<(), ValidationError> {
    check_confidence(self.confidence)?;
    if (self.mask.width(), self.mask.height()) != (width, height) {
      return Err(ValidationError::MaskSizeMismatch {
        expected: (width, height),
        actual: (self.mask.width(), self.mask.height()),
      });
    }
    if self.mask.is_empty() {
      return Err(ValidationError::EmptyMask);
    }
    Ok(())
  }
}

/// 分割模型输出头的布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentationHead {
  /// 掩码 [1, N, Hm, Wm] + 类别分数 [1, N, C]
  #[default]
  Instance,
  /// 类别概率图 [1, C, Hm, Wm]
  Semantic,
}

impl FromStr for SegmentationHead {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "instance" => Ok(SegmentationHead::Instance),
      "semantic" => Ok(SegmentationHead::Semantic),
      other => Err(format!("未知的分割输出类型: {}", other)),
    }
  }
}

#[derive(Debug, Clone)]
pub struct SegmentationConfig {
  pub confidence_threshold: f32,
  /// 掩码概率二值化阈值
  pub mask_threshold: f32,
  pub head: SegmentationHead,
  /// 语义分割中的背景类别，不产生掩码
  pub background_class: Option<usize>,
  pub labels: LabelSet,
}

impl Default for SegmentationConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      mask_threshold: DEFAULT_MASK_THRESHOLD,
      head: SegmentationHead::default(),
      background_class: None,
      labels: LabelSet::default(),
    }
  }
}

/// 取张量最后 `n` 维，前导维度必须全为 1
fn trailing_dims<'a>(
  tensor: &'a RawTensor,
  n: usize,
  expected: &str,
) -> Result<&'a [usize], InferenceError> {
  let shape = &tensor.shape;
  if shape.len() < n || shape[..shape.len() - n].iter().any(|&d| d != 1) {
    return Err(InferenceError::shape(expected, shape));
  }
  Ok(&shape[shape.len() - n..])
}

/// 源图像坐标到掩码坐标的最近邻映射
fn nearest_lookup(source: u32, target: usize) -> Vec<usize> {
  (0..source)
    .map(|i| {
      let pos = ((i as f64 + 0.5) * target as f64 / source as f64) as usize;
      pos.min(target.saturating_sub(1))
    })
    .collect()
}

/// 分割阶段：运行分割模型并整理为掩码集合
#[derive(Debug, Clone, Default)]
pub struct SegmentationStage {
  config: SegmentationConfig,
}

impl SegmentationStage {
  pub fn new(config: SegmentationConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &SegmentationConfig {
    &self.config
  }

  pub fn segment(&self, handle: &ModelHandle, image: &Image) -> Result<Vec<Mask>, InferenceError> {
    let raw = handle.infer(image)?;
    let candidates = self.decode(&raw, image.width(), image.height())?;
    Ok(self.postprocess(candidates, image.width(), image.height()))
  }

  pub fn decode(&self, raw: &RawOutput, width: u32, height: u32) -> Result<Vec<Mask>, InferenceError> {
    match self.config.head {
      SegmentationHead::Instance => self.decode_instance(raw, width, height),
      SegmentationHead::Semantic => self.decode_semantic(raw, width, height),
    }
  }

  fn decode_instance(
    &self,
    raw: &RawOutput,
    width: u32,
    height: u32,
  ) -> Result<Vec<Mask>, InferenceError> {
    let masks = raw.tensor(0)?;
    let scores = raw.tensor(1)?;
    let mask_dims = trailing_dims(masks, 3, "[1, N, Hm, Wm]")?;
    let score_dims = trailing_dims(scores, 2, "[1, N, C]")?;
    let (queries, mh, mw) = (mask_dims[0], mask_dims[1], mask_dims[2]);
    let num_classes = score_dims[1];
    if mh == 0 || mw == 0 {
      return Err(InferenceError::shape("[1, N, Hm, Wm] (Hm, Wm > 0)", &masks.shape));
    }
    if score_dims[0] != queries || num_classes == 0 {
      return Err(InferenceError::shape(
        format!("[1, {}, C] (C > 0)", queries),
        &scores.shape,
      ));
    }
    debug!(
      "实例分割输出: {} 个查询, 掩码 {}x{}, {} 个类别",
      queries, mw, mh, num_classes
    );

    let xs = nearest_lookup(width, mw);
    let ys = nearest_lookup(height, mh);
    let plane = mh * mw;
    let mut items = Vec::new();

    for q in 0..queries {
      let row = &scores.data[q * num_classes..(q + 1) * num_classes];
      let (class_id, score) = row
        .iter()
        .copied()
        .enumerate()
        .fold((0usize, f32::MIN), |best, (c, s)| if s > best.1 { (c, s) } else { best });

      if score < self.config.confidence_threshold {
        continue;
      }

      let probs = &masks.data[q * plane..(q + 1) * plane];
      let threshold = self.config.mask_threshold;
      let mask = BinaryMask::from_fn(width, height, |x, y| {
        probs[ys[y as usize] * mw + xs[x as usize]] > threshold
      });
      items.push(Mask::new(self.config.labels.name(class_id), class_id, score, mask));
    }

    Ok(items)
  }

  fn decode_semantic(
    &self,
    raw: &RawOutput,
    width: u32,
    height: u32,
  ) -> Result<Vec<Mask>, InferenceError> {
    let probs = raw.tensor(0)?;
    let dims = trailing_dims(probs, 3, "[1, C, Hm, Wm]")?;
    let (num_classes, mh, mw) = (dims[0], dims[1], dims[2]);
    if num_classes == 0 || mh == 0 || mw == 0 {
      return Err(InferenceError::shape("[1, C, Hm, Wm] (C, Hm, Wm > 0)", &probs.shape));
    }
    debug!("语义分割输出: {} 个类别, {}x{}", num_classes, mw, mh);

    // 每个掩码像素的最大类别与概率
    let plane = mh * mw;
    let mut class_map = vec![0usize; plane];
    let mut prob_map = vec![f32::MIN; plane];
    for c in 0..num_classes {
      let channel = &probs.data[c * plane..(c + 1) * plane];
      for (i, &p) in channel.iter().enumerate() {
        if p > prob_map[i] {
          prob_map[i] = p;
          class_map[i] = c;
        }
      }
    }

    let mut sums = vec![0f64; num_classes];
    let mut counts = vec![0u64; num_classes];
    for (&c, &p) in class_map.iter().zip(prob_map.iter()) {
      sums[c] += p as f64;
      counts[c] += 1;
    }

    let xs = nearest_lookup(width, mw);
    let ys = nearest_lookup(height, mh);
    let mut items = Vec::new();

    for c in 0..num_classes {
      if Some(c) == self.config.background_class || counts[c] == 0 {
        continue;
      }
      let confidence = (sums[c] / counts[c] as f64) as f32;
      if confidence < self.config.confidence_threshold {
        continue;
      }
      let mask = BinaryMask::from_fn(width, height, |x, y| {
        class_map[ys[y as usize] * mw + xs[x as usize]] == c
      });
      items.push(Mask::new(self.config.labels.name(c), c, confidence, mask));
    }

    Ok(items)
  }

  /// 校验并过滤；空掩码被丢弃
  pub fn postprocess(&self, candidates: Vec<Mask>, width: u32, height: u32) -> Vec<Mask> {
    let valid = retain_valid(candidates, "分割阶段", |m| m.validate(width, height));
    let result: Vec<Mask> = valid
      .into_iter()
      .filter(|m| m.confidence >= self.config.confidence_threshold)
      .collect();
    debug!("分割得到 {} 个掩码", result.len());
    result
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::ReplayModel;

  fn stage(head: SegmentationHead, labels: &[&str]) -> SegmentationStage {
    SegmentationStage::new(SegmentationConfig {
      head,
      labels: LabelSet::new(labels.iter().copied()),
      ..SegmentationConfig::default()
    })
  }

  #[test]
  fn binary_mask_tracks_area_and_bounds() {
    let mask = BinaryMask::from_rect(100, 100, 10, 20, 50, 60);
    assert_eq!(mask.area(), 1600);
    assert_eq!(mask.bounding_box(), Some(BBox::new(10.0, 20.0, 50.0, 60.0)));
    assert!(mask.get(10, 20));
    assert!(!mask.get(50, 60));
    assert!(!mask.get(500, 0));

    let empty = BinaryMask::from_fn(4, 4, |_, _| false);
    assert!(empty.is_empty());
    assert_eq!(empty.bounding_box(), None);
    assert!(!empty.get(0, 0));
    assert_eq!(empty.pixels().count(), 0);
  }

  #[test]
  fn binary_mask_stores_only_its_bounding_box() {
    // 1000x1000 图像上的 40x40 掩码
    let mask = BinaryMask::from_rect(1000, 1000, 300, 700, 340, 740);
    assert_eq!(mask.data.len(), 40 * 40);
    assert_eq!(mask.area(), 1600);
    assert!(mask.get(300, 700));
    assert!(mask.get(339, 739));
    assert!(!mask.get(299, 700));
    assert!(!mask.get(340, 720));
    assert!(!mask.get(320, 740));

    // 非矩形掩码：保存区域内的空洞仍为 false
    let ring = BinaryMask::from_fn(50, 50, |x, y| {
      (10..20).contains(&x) && (10..20).contains(&y) && !((13..17).contains(&x) && (13..17).contains(&y))
    });
    assert_eq!(ring.data.len(), 100);
    assert_eq!(ring.area(), 84);
    assert!(!ring.get(15, 15));
    assert!(ring.get(10, 19));

    let pixels: Vec<(u32, u32)> = ring.pixels().collect();
    assert_eq!(pixels.len(), 84);
    assert_eq!(pixels[0], (10, 10));
    assert_eq!(pixels[83], (19, 19));
    assert!(pixels.iter().all(|&(x, y)| ring.get(x, y)));
  }

  #[test]
  fn instance_head_upsamples_and_thresholds() {
    // 两个查询，掩码 2x2，源图像 4x4
    #[rustfmt::skip]
    let masks = vec![
      0.9, 0.1,
      0.2, 0.1,
      // 第二个查询全部低于掩码阈值
      0.1, 0.1,
      0.1, 0.1,
    ];
    let scores = vec![0.8, 0.1, 0.2, 0.7];
    let raw = RawOutput {
      tensors: vec![
        RawTensor::new(vec![1, 2, 2, 2], masks).unwrap(),
        RawTensor::new(vec![1, 2, 2], scores).unwrap(),
      ],
      input_width: 4,
      input_height: 4,
    };
    let stage = stage(SegmentationHead::Instance, &["coral", "algae"]);
    let decoded = stage.decode(&raw, 4, 4).unwrap();
    assert_eq!(decoded.len(), 2);
    assert_eq!(decoded[0].label, "coral");
    assert_eq!(decoded[0].area(), 4);
    assert_eq!(decoded[0].bbox(), Some(BBox::new(0.0, 0.0, 2.0, 2.0)));

    // 空掩码在后处理中被丢弃
    let kept = stage.postprocess(decoded, 4, 4);
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].label, "coral");
  }

  #[test]
  fn semantic_head_skips_background() {
    // 3 个类别 (背景, coral, algae)，2x2
    #[rustfmt::skip]
    let probs = vec![
      0.8, 0.1, 0.1, 0.1,
      0.1, 0.8, 0.7, 0.2,
      0.1, 0.1, 0.2, 0.7,
    ];
    let raw = RawOutput {
      tensors: vec![RawTensor::new(vec![1, 3, 2, 2], probs).unwrap()],
      input_width: 2,
      input_height: 2,
    };
    let stage = SegmentationStage::new(SegmentationConfig {
      head: SegmentationHead::Semantic,
      background_class: Some(0),
      labels: LabelSet::new(["background", "coral", "algae"]),
      ..SegmentationConfig::default()
    });
    let masks = stage.decode(&raw, 2, 2).unwrap();
    assert_eq!(masks.len(), 2);
    assert_eq!(masks[0].label, "coral");
    assert_eq!(masks[0].area(), 2);
    assert!((masks[0].confidence - 0.75).abs() < 1e-6);
    assert_eq!(masks[1].label, "algae");
    assert_eq!(masks[1].area(), 1);
  }

  #[test]
  fn mismatched_score_tensor_is_shape_error() {
    let raw = RawOutput {
      tensors: vec![
        RawTensor::new(vec![1, 2, 2, 2], vec![0.0; 8]).unwrap(),
        RawTensor::new(vec![1, 3, 2], vec![0.0; 6]).unwrap(),
      ],
      input_width: 2,
      input_height: 2,
    };
    let stage = stage(SegmentationHead::Instance, &[]);
    assert!(matches!(
      stage.decode(&raw, 2, 2),
      Err(InferenceError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn zero_sized_mask_plane_is_shape_error() {
    let model = ReplayModel::from_tensors(
      4,
      4,
      vec![
        RawTensor::new(vec![1, 1, 0, 4], vec![]).unwrap(),
        RawTensor::new(vec![1, 1, 1], vec![0.9]).unwrap(),
      ],
    )
    .unwrap();
    let handle = ModelHandle::replay(model, "memory");
    let result = stage(SegmentationHead::Instance, &["coral"]).segment(&handle, &Image::new(8, 8));
    assert!(matches!(result, Err(InferenceError::ShapeMismatch { .. })));

    let raw = RawOutput {
      tensors: vec![RawTensor::new(vec![1, 2, 4, 0], vec![]).unwrap()],
      input_width: 4,
      input_height: 4,
    };
    assert!(matches!(
      stage(SegmentationHead::Semantic, &["coral", "algae"]).decode(&raw, 8, 8),
      Err(InferenceError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn segment_runs_through_handle() {
    let model = ReplayModel::from_tensors(
      2,
      2,
      vec![
        RawTensor::new(vec![1, 1, 2, 2], vec![0.9, 0.9, 0.0, 0.0]).unwrap(),
        RawTensor::new(vec![1, 1, 1], vec![0.95]).unwrap(),
      ],
    )
    .unwrap();
    let handle = ModelHandle::replay(model, "memory");
    let masks = stage(SegmentationHead::Instance, &["coral"])
      .segment(&handle, &Image::new(10, 10))
      .unwrap();
    assert_eq!(masks.len(), 1);
    assert_eq!(masks[0].area(), 50);
    assert_eq!(masks[0].bbox(), Some(BBox::new(0.0, 0.0, 10.0, 5.0)));
  }
}
