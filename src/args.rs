// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use url::Url;

use shanhu::{
  PipelineConfig,
  labels::LabelSet,
  model::Device,
  output::OverlayConfig,
  segmentation::SegmentationHead,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
  /// 只处理第一张输入图像
  Single,
  /// 并行处理全部输入图像
  Batch,
}

/// Shanhu 珊瑚礁图像标注
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型，例如 onnx:///models/det.onnx?size=640
  #[arg(long, value_name = "MODEL")]
  pub detector: Url,

  /// 分割模型，例如 onnx:///models/seg.onnx?size=640
  #[arg(long, value_name = "MODEL")]
  pub segmenter: Url,

  /// 输入来源
  /// - 单张图像: image:///path/reef.jpg
  /// - 图像目录: folder:///path/survey
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 输出去向
  /// - 单个文件: image:///path/overlay.png（同时写出 overlay.json）
  /// - 目录: folder:///path/records[?always]
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,

  /// 类别表文件，每行一个类别名
  #[arg(long, default_value = "labels/coral.txt", value_name = "FILE")]
  pub labels: PathBuf,

  /// 分割模型使用不同的类别表时指定
  #[arg(long, value_name = "FILE")]
  pub segmentation_labels: Option<PathBuf>,

  /// 计算设备: cpu, cuda, cuda:N
  #[arg(long, default_value = "cpu", value_name = "DEVICE")]
  pub device: Device,

  #[arg(long, value_enum, default_value = "batch")]
  pub mode: Mode,

  /// 检测置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 分割置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub segmentation_confidence: f32,

  /// 掩码二值化阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub mask_threshold: f32,

  /// 分割输出类型: instance 或 semantic
  #[arg(long, default_value = "instance", value_name = "HEAD")]
  pub segmentation_head: SegmentationHead,

  /// 语义分割的背景类别编号
  #[arg(long, value_name = "CLASS")]
  pub background_class: Option<usize>,

  /// 检测框与掩码配对的 IoU 阈值
  #[arg(long, default_value = "0.5", value_name = "IOU")]
  pub match_iou: f32,

  /// 掩码填充不透明度
  #[arg(long, default_value = "0.45", value_name = "ALPHA")]
  pub mask_alpha: f32,

  /// 标签字体文件
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
}

impl Args {
  pub fn to_config(&self) -> anyhow::Result<PipelineConfig> {
    let labels = LabelSet::from_file(&self.labels)?;
    let segmentation_labels = match &self.segmentation_labels {
      Some(path) => LabelSet::from_file(path)?,
      None => labels.clone(),
    };

    Ok(
      PipelineConfig::new(self.detector.clone(), self.segmenter.clone())
        .with_device(self.device)
        .with_detection_labels(labels)
        .with_segmentation_labels(segmentation_labels)
        .with_detection_threshold(self.confidence)
        .with_nms_threshold(self.nms_threshold)
        .with_segmentation_threshold(self.segmentation_confidence)
        .with_mask_threshold(self.mask_threshold)
        .with_segmentation_head(self.segmentation_head)
        .with_background_class(self.background_class)
        .with_match_iou(self.match_iou)
        .with_overlay(OverlayConfig {
          mask_alpha: self.mask_alpha,
          font_path: self.font.clone(),
          ..OverlayConfig::default()
        }),
    )
  }
}
