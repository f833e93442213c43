// 该文件是 Guangjian （光检） 项目的一部分。
// tests/cascade_pipeline.rs - 级联推理端到端测试
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

use std::convert::Infallible;

use image::{Rgb, RgbImage};

use guangjian::{
  cascade::{CascadeConfig, CascadeOrchestrator},
  frame::{Normalization, TensorFrame},
  geometry::BBox,
  input::GroundTruthBox,
  matching::{MatchConfig, match_image},
  model::{ClassLabel, Classifier, Detector, Predictor, RawDetection},
};

/// 在画布张量上找出红色区域的外接框
struct RedRegionDetector;

impl Detector for RedRegionDetector {
  type Error = Infallible;

  fn detect(&self, input: &TensorFrame) -> Result<Vec<RawDetection>, Self::Error> {
    assert_eq!(input.normalization(), Normalization::UnitRange);
    let [_, _, h, w] = input.shape();
    let data = input.as_nchw();
    let (red, green) = (&data[..h * w], &data[h * w..2 * h * w]);

    let mut bounds: Option<[usize; 4]> = None;
    for y in 0..h {
      for x in 0..w {
        let i = y * w + x;
        if red[i] > 0.5 && green[i] < 0.25 {
          let b = bounds.get_or_insert([x, y, x, y]);
          b[0] = b[0].min(x);
          b[1] = b[1].min(y);
          b[2] = b[2].max(x + 1);
          b[3] = b[3].max(y + 1);
        }
      }
    }

    Ok(
      bounds
        .map(|[x1, y1, x2, y2]| RawDetection {
          bbox: [x1 as f32, y1 as f32, x2 as f32, y2 as f32],
          confidence: 0.75,
          class_id: 0,
        })
        .into_iter()
        .collect(),
    )
  }
}

/// 分数为裁剪图中红色像素的比例
struct RedFractionClassifier;

impl Classifier for RedFractionClassifier {
  type Error = Infallible;

  fn classify(&self, crop: &TensorFrame) -> Result<f32, Self::Error> {
    let [_, _, h, w] = crop.shape();
    let red = &crop.as_nchw()[..h * w];
    let threshold = match crop.normalization() {
      Normalization::UnitRange => 0.5,
      Normalization::Raw => 127.5,
    };
    Ok(red.iter().filter(|v| **v > threshold).count() as f32 / red.len() as f32)
  }
}

fn scene() -> RgbImage {
  RgbImage::from_fn(300, 150, |x, y| {
    if (60..120).contains(&x) && (30..90).contains(&y) {
      Rgb([220, 20, 20])
    } else {
      Rgb([30, 60, 30])
    }
  })
}

fn cascade() -> CascadeOrchestrator<RedRegionDetector, RedFractionClassifier> {
  let config = CascadeConfig::default()
    .with_detector_input_size(150)
    .with_classifier_input_size(32)
    .with_max_concurrency(4);
  CascadeOrchestrator::new(RedRegionDetector, RedFractionClassifier)
    .with_config(config)
    .unwrap()
}

fn close(a: f64, b: f64, tolerance: f64) -> bool {
  (a - b).abs() <= tolerance
}

#[test]
fn detected_box_lands_on_the_object_in_original_coordinates() {
  let predictions = cascade().run("scene.png", &scene()).unwrap();
  assert_eq!(predictions.len(), 1);

  let p = &predictions[0];
  assert!(close(p.bbox.x1(), 60.0, 2.0), "{:?}", p.bbox);
  assert!(close(p.bbox.y1(), 30.0, 2.0), "{:?}", p.bbox);
  assert!(close(p.bbox.x2(), 120.0, 2.0), "{:?}", p.bbox);
  assert!(close(p.bbox.y2(), 90.0, 2.0), "{:?}", p.bbox);
  assert_eq!(p.bbox.x1().fract(), 0.0);

  assert!(p.cls_score > 0.9);
  assert!(close(p.damaged_score + p.healthy_score, p.confidence, 1e-9));
  assert!(close(p.confidence, 0.75, 1e-6));
}

#[test]
fn cascade_output_matches_ground_truth() {
  let predictions = cascade().run("scene.png", &scene()).unwrap();
  let ground_truth = vec![GroundTruthBox {
    label: ClassLabel::Healthy,
    bbox: BBox::new(60.0, 30.0, 120.0, 90.0),
  }];

  let records = match_image("scene.png", &predictions, &ground_truth, &MatchConfig::default());
  assert_eq!(records.len(), 1);
  assert_eq!(records[0].actual, ClassLabel::Healthy);
  assert_eq!(records[0].predicted_label, ClassLabel::Healthy);
  assert!(records[0].iou > 0.9);
}

#[test]
fn predictor_reads_the_image_from_disk() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("scene.png");
  scene().save(&path).unwrap();

  let predictions = cascade().predict("scene.png", &path).unwrap();
  assert_eq!(predictions.len(), 1);
  assert_eq!(predictions[0].image, "scene.png");

  let missing = cascade().predict("missing.png", &dir.path().join("missing.png"));
  assert!(missing.is_err());
}

#[test]
fn empty_scene_has_no_predictions() {
  let empty = RgbImage::from_pixel(120, 80, Rgb([30, 60, 30]));
  assert!(cascade().run("empty.png", &empty).unwrap().is_empty());
}
