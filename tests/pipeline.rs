// 该文件是 Shanhu （珊瑚） 项目的一部分。
// tests/pipeline.rs - 流水线端到端测试
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

use std::path::Path;

use image::Rgb;
use url::Url;

use shanhu::{
  CoralPipeline, FromUrl, Image, PipelineConfig, PipelineError,
  input::InputWrapper,
  labels::LabelSet,
  model::{InferenceError, ModelHandle, ModelLoadError, RawTensor, ReplayModel},
  output::{OutputWrapper, OverlayConfig, OverlayRenderer},
  reconcile::InstanceKind,
  task::{BatchTask, Task},
};

const SIZE: u32 = 100;
const AREA: f64 = (SIZE * SIZE) as f64;

fn tensor(shape: &[usize], data: Vec<f32>) -> RawTensor {
  RawTensor::new(shape.to_vec(), data).unwrap()
}

/// 检测输出 [1, 4 + 2, N]，每个框为 (cx, cy, w, h, coral, algae)
fn detector(boxes: &[[f32; 6]]) -> ModelHandle {
  let n = boxes.len();
  let mut data = vec![0.0; 6 * n];
  for (anchor, row) in boxes.iter().enumerate() {
    for (feature, value) in row.iter().enumerate() {
      data[feature * n + anchor] = *value;
    }
  }
  let model = ReplayModel::from_tensors(SIZE, SIZE, vec![tensor(&[1, 6, n], data)]).unwrap();
  ModelHandle::replay(model, "replay:detector")
}

/// 实例分割输出：掩码 [1, N, H, W] 与分数 [1, N, 2]
fn segmenter(masks: &[([u32; 4], [f32; 2])]) -> ModelHandle {
  let n = masks.len();
  let plane = (SIZE * SIZE) as usize;
  let mut mask_data = vec![0.0; n * plane];
  let mut score_data = Vec::with_capacity(n * 2);
  for (q, ([x0, y0, x1, y1], scores)) in masks.iter().enumerate() {
    for y in *y0..*y1 {
      for x in *x0..*x1 {
        mask_data[q * plane + (y * SIZE + x) as usize] = 1.0;
      }
    }
    score_data.extend_from_slice(scores);
  }
  let model = ReplayModel::from_tensors(
    SIZE,
    SIZE,
    vec![
      tensor(&[1, n, SIZE as usize, SIZE as usize], mask_data),
      tensor(&[1, n, 2], score_data),
    ],
  )
  .unwrap();
  ModelHandle::replay(model, "replay:segmenter")
}

fn config() -> PipelineConfig {
  PipelineConfig::new(
    Url::parse("replay:///unused/det.json").unwrap(),
    Url::parse("replay:///unused/seg.json").unwrap(),
  )
  .with_labels(LabelSet::new(["coral", "algae"]))
}

fn pipeline(detector: ModelHandle, segmenter: ModelHandle) -> CoralPipeline {
  let config = config();
  CoralPipeline::from_handles(detector, segmenter, &config)
    .with_renderer(OverlayRenderer::without_font(OverlayConfig::default()))
}

fn source() -> Image {
  Image::from_pixel(SIZE, SIZE, Rgb([20, 60, 120]))
}

#[test]
fn empty_outputs_give_zero_metrics_and_untouched_overlay() {
  let pipeline = pipeline(detector(&[]), segmenter(&[]));
  let image = source();
  let output = pipeline.run(&image).unwrap();

  assert_eq!(output.overlay, image);
  let record = &output.record;
  assert_eq!(record.total_instances, 0);
  assert_eq!(record.class_counts["coral"], 0);
  assert_eq!(record.class_counts["algae"], 0);
  assert!(record.class_coverage.values().all(|&c| c == 0.0));
  assert_eq!(record.aggregate_coverage, 0.0);
  assert!(!record.has_segmentation);
}

#[test]
fn matching_detection_and_mask_form_one_instance() {
  let pipeline = pipeline(
    detector(&[[40.0, 40.0, 40.0, 40.0, 0.9, 0.1]]),
    segmenter(&[([20, 20, 60, 60], [0.8, 0.1])]),
  );
  let image = source();
  let output = pipeline.run(&image).unwrap();
  let record = &output.record;

  assert_eq!(record.total_instances, 1);
  assert_eq!(record.class_counts["coral"], 1);
  assert_eq!(record.class_counts["algae"], 0);
  assert_eq!(record.class_coverage["coral"], 1600.0 / AREA);
  assert_eq!(record.aggregate_coverage, 1600.0 / AREA);
  assert!(record.has_segmentation);

  let instance = &record.instances[0];
  assert_eq!(instance.kind, InstanceKind::Paired);
  assert_eq!(instance.label, "coral");
  assert_eq!(instance.confidence, 0.9);
  assert_eq!(instance.mask_area, Some(1600));
  assert_eq!(instance.match_iou, Some(1.0));

  assert_eq!(output.overlay.dimensions(), image.dimensions());
  assert_ne!(output.overlay, image);
  assert_eq!(record.metadata.image_width, SIZE);
  assert_eq!(record.metadata.detector.as_ref().unwrap().backend, "replay");
  assert!(record.metadata.started_at.is_some());
}

#[test]
fn offset_mask_above_match_threshold_pairs_and_counts_coverage() {
  // 检测框 20..60，掩码右移 7 像素：交集 33x40，IoU = 1320 / 1880
  let pipeline = pipeline(
    detector(&[[40.0, 40.0, 40.0, 40.0, 0.9, 0.1]]),
    segmenter(&[([27, 20, 67, 60], [0.8, 0.1])]),
  );
  let record = pipeline.run(&source()).unwrap().record;

  assert_eq!(record.total_instances, 1);
  assert_eq!(record.class_counts["coral"], 1);
  assert_eq!(record.class_counts["algae"], 0);
  assert_eq!(record.class_coverage["coral"], 1600.0 / AREA);
  assert_eq!(record.aggregate_coverage, 1600.0 / AREA);

  let instance = &record.instances[0];
  assert_eq!(instance.kind, InstanceKind::Paired);
  assert_eq!(instance.confidence, 0.9);
  assert_eq!(instance.mask_area, Some(1600));
  let iou = instance.match_iou.unwrap();
  assert!((iou - 1320.0 / 1880.0).abs() < 1e-4, "iou = {}", iou);
}

#[test]
fn different_classes_stay_separate() {
  let pipeline = pipeline(
    detector(&[[40.0, 40.0, 40.0, 40.0, 0.9, 0.1]]),
    segmenter(&[([20, 20, 60, 60], [0.1, 0.8])]),
  );
  let record = pipeline.run(&source()).unwrap().record;

  assert_eq!(record.total_instances, 2);
  assert_eq!(record.instances[0].kind, InstanceKind::DetectionOnly);
  assert_eq!(record.instances[1].kind, InstanceKind::MaskOnly);
  assert_eq!(record.class_counts["coral"], 1);
  assert_eq!(record.class_counts["algae"], 1);
  assert_eq!(record.class_coverage["coral"], 0.0);
  assert_eq!(record.class_coverage["algae"], 1600.0 / AREA);
}

#[test]
fn low_confidence_records_are_filtered() {
  let pipeline = pipeline(
    detector(&[[40.0, 40.0, 40.0, 40.0, 0.1, 0.05]]),
    segmenter(&[([20, 20, 60, 60], [0.2, 0.1])]),
  );
  let record = pipeline.run(&source()).unwrap().record;
  assert_eq!(record.total_instances, 0);
}

#[test]
fn segmentation_failure_yields_no_partial_output() {
  let broken = ReplayModel::from_tensors(SIZE, SIZE, vec![tensor(&[1, 2], vec![0.0, 1.0])]).unwrap();
  let pipeline = pipeline(
    detector(&[[40.0, 40.0, 40.0, 40.0, 0.9, 0.1]]),
    ModelHandle::replay(broken, "replay:broken"),
  );
  assert!(matches!(
    pipeline.run(&source()),
    Err(PipelineError::Segmentation(InferenceError::ShapeMismatch { .. }))
  ));
}

#[test]
fn detection_failure_is_reported_first() {
  let broken = || {
    let model = ReplayModel::from_tensors(SIZE, SIZE, vec![tensor(&[1, 3, 2], vec![0.0; 6])]).unwrap();
    ModelHandle::replay(model, "replay:broken")
  };
  let pipeline = pipeline(broken(), broken());
  assert!(matches!(
    pipeline.run(&source()),
    Err(PipelineError::Detection(InferenceError::ShapeMismatch { .. }))
  ));
}

#[test]
fn batch_results_keep_input_order_and_match_single_runs() {
  let pipeline = pipeline(
    detector(&[[40.0, 40.0, 40.0, 40.0, 0.9, 0.1]]),
    segmenter(&[([20, 20, 60, 60], [0.8, 0.1])]),
  );
  let images: Vec<Image> = (0..4)
    .map(|i| Image::from_pixel(SIZE, SIZE, Rgb([i * 40, 0, 0])))
    .collect();

  let results = pipeline.run_batch(&images);
  assert_eq!(results.len(), images.len());
  for (image, result) in images.iter().zip(results) {
    let batch = result.unwrap();
    let single = pipeline.run(image).unwrap();
    assert_eq!(batch.overlay, single.overlay);
    assert_eq!(batch.record.class_counts, single.record.class_counts);
    assert_eq!(batch.record.class_coverage, single.record.class_coverage);
    assert_eq!(batch.record.instances, single.record.instances);
  }
}

#[test]
fn concurrent_runs_share_handles() {
  let pipeline = pipeline(
    detector(&[[40.0, 40.0, 40.0, 40.0, 0.9, 0.1]]),
    segmenter(&[([20, 20, 60, 60], [0.8, 0.1])]),
  );
  let image = source();
  let expected = pipeline.run(&image).unwrap();

  std::thread::scope(|scope| {
    let handles: Vec<_> = (0..4).map(|_| scope.spawn(|| pipeline.run(&image))).collect();
    for handle in handles {
      let output = handle.join().unwrap().unwrap();
      assert_eq!(output.overlay, expected.overlay);
      assert_eq!(output.record.instances, expected.record.instances);
    }
  });
}

fn replay_url(path: &Path) -> Url {
  let url = Url::from_file_path(path).unwrap();
  Url::parse(&url.as_str().replacen("file:", "replay:", 1)).unwrap()
}

fn scheme_url(scheme: &str, path: &Path) -> Url {
  let url = Url::from_directory_path(path).unwrap();
  Url::parse(&url.as_str().replacen("file:", &format!("{}:", scheme), 1)).unwrap()
}

fn write_recording(path: &Path, model: &ReplayModel) {
  std::fs::write(path, model.to_json().unwrap()).unwrap();
}

#[test]
fn load_from_replay_files() {
  let dir = tempfile::tempdir().unwrap();
  let det_path = dir.path().join("det.json");
  let seg_path = dir.path().join("seg.json");
  write_recording(
    &det_path,
    &ReplayModel::from_tensors(SIZE, SIZE, vec![tensor(&[1, 6, 0], vec![])]).unwrap(),
  );
  write_recording(
    &seg_path,
    &ReplayModel::from_tensors(
      SIZE,
      SIZE,
      vec![
        tensor(&[1, 0, SIZE as usize, SIZE as usize], vec![]),
        tensor(&[1, 0, 2], vec![]),
      ],
    )
    .unwrap(),
  );

  let config = PipelineConfig::new(replay_url(&det_path), replay_url(&seg_path))
    .with_labels(LabelSet::new(["coral", "algae"]));
  let pipeline = CoralPipeline::load(&config).unwrap();
  let output = pipeline.run(&source()).unwrap();
  assert_eq!(output.record.total_instances, 0);
  assert_eq!(output.record.class_counts.len(), 2);
}

#[test]
fn load_reports_missing_and_corrupt_models() {
  let dir = tempfile::tempdir().unwrap();
  let corrupt = dir.path().join("corrupt.json");
  std::fs::write(&corrupt, "not a recording").unwrap();
  let missing = dir.path().join("missing.json");

  let config = PipelineConfig::new(replay_url(&missing), replay_url(&corrupt));
  assert!(matches!(
    CoralPipeline::load(&config),
    Err(PipelineError::Load(ModelLoadError::NotFound(_)))
  ));

  let config = PipelineConfig::new(replay_url(&corrupt), replay_url(&corrupt));
  assert!(matches!(
    CoralPipeline::load(&config),
    Err(PipelineError::Load(ModelLoadError::Corrupt { .. }))
  ));
}

#[test]
fn batch_task_records_every_image() {
  let inputs = tempfile::tempdir().unwrap();
  let records = tempfile::tempdir().unwrap();
  for name in ["a", "b", "c"] {
    source().save(inputs.path().join(format!("{}.png", name))).unwrap();
  }

  let pipeline = pipeline(
    detector(&[[40.0, 40.0, 40.0, 40.0, 0.9, 0.1]]),
    segmenter(&[([20, 20, 60, 60], [0.8, 0.1])]),
  );
  let input = InputWrapper::from_url(&scheme_url("folder", inputs.path())).unwrap();
  let output = OutputWrapper::from_url(&scheme_url("folder", records.path())).unwrap();
  BatchTask.run_task(input, &pipeline, output).unwrap();

  let mut json = Vec::new();
  let mut stack = vec![records.path().to_path_buf()];
  while let Some(dir) = stack.pop() {
    for entry in std::fs::read_dir(dir).unwrap() {
      let path = entry.unwrap().path();
      if path.is_dir() {
        stack.push(path);
      } else if path.extension().is_some_and(|e| e == "json") {
        json.push(path);
      }
    }
  }
  assert_eq!(json.len(), 3);
  let report: serde_json::Value =
    serde_json::from_str(&std::fs::read_to_string(&json[0]).unwrap()).unwrap();
  assert_eq!(report["total_instances"], 1);
  assert_eq!(report["class_counts"]["coral"], 1);
}
