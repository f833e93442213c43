// 该文件是 Guangjian （光检） 项目的一部分。
// tests/perturbation_groups.rs - 扰动分组与分组指标测试
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

use image::{Rgb, RgbImage};

use guangjian::{
  geometry::BBox,
  matching::{MatchConfig, ObjectPrediction},
  metrics::MetricsConfig,
  model::ClassLabel,
  output::{exchange::save_evaluation, report::GroupMetricsReport},
  perturb::{
    ImageProperty, MANIFEST_FILE, PerturbationLevel, PerturbationManifest, create_group,
    measure_properties,
  },
  task::{EVALUATION_FILE, group_metrics},
};

fn write_sources(dir: &std::path::Path) -> Vec<PathBuf> {
  let colors = [[200u8, 100, 50], [40, 160, 90], [120, 60, 220]];
  colors
    .iter()
    .enumerate()
    .map(|(i, color)| {
      let path = dir.join(format!("panel_{}.png", i));
      RgbImage::from_fn(24, 24, |x, y| {
        if (x + y) % 5 == 0 { Rgb([128, 128, 128]) } else { Rgb(*color) }
      })
      .save(&path)
      .unwrap();
      path
    })
    .collect()
}

fn record(actual: ClassLabel, predicted: ClassLabel, score: f64) -> ObjectPrediction {
  ObjectPrediction {
    image: "panel_0.png".to_string(),
    actual,
    actual_bbox: Some(BBox::new(0.0, 0.0, 10.0, 10.0)),
    predicted_bbox: Some(BBox::new(0.0, 0.0, 10.0, 10.0)),
    predicted_label: predicted,
    score,
    iou: 1.0,
    confidence: 0.9,
  }
}

#[test]
fn relative_saturation_groups_shift_the_measured_value() {
  let dir = tempfile::tempdir().unwrap();
  let sources = write_sources(dir.path());
  let out = dir.path().join("groups");

  let original = measure_properties(&image::open(&sources[0]).unwrap().to_rgb8()).saturation;
  let lower = create_group(
    &out,
    &sources,
    ImageProperty::Saturation,
    PerturbationLevel::Relative { change: -0.5 },
  )
  .unwrap();
  let higher = create_group(
    &out,
    &sources,
    ImageProperty::Saturation,
    PerturbationLevel::Relative { change: 0.3 },
  )
  .unwrap();

  assert_eq!(lower.name, "saturation_rel_-0.50");
  assert_eq!(higher.name, "saturation_rel_+0.30");
  assert!(lower.directory.ends_with("saturation_relative_analysis/saturation_rel_-0.50"));
  assert_eq!(lower.images.len(), 3);
  assert!(lower.images[0].actual_value < original);
  assert!(higher.images[0].actual_value > original);
  assert_eq!(lower.images[0].original_properties.saturation, original);
}

#[test]
fn manifest_to_metrics_report() {
  let dir = tempfile::tempdir().unwrap();
  let sources = write_sources(dir.path());
  let out = dir.path().join("groups");

  let groups: Vec<_> = [0.3, 0.6]
    .into_iter()
    .map(|target| {
      create_group(
        &out,
        &sources,
        ImageProperty::Brightness,
        PerturbationLevel::Absolute { target },
      )
      .unwrap()
    })
    .collect();
  let manifest = PerturbationManifest {
    property: ImageProperty::Brightness,
    groups,
  };
  let manifest_path = out.join(MANIFEST_FILE);
  manifest.save(&manifest_path).unwrap();
  let manifest = PerturbationManifest::load(&manifest_path).unwrap();

  // 只有第一个分组有匹配结果
  save_evaluation(
    &manifest.groups[0].directory.join(EVALUATION_FILE),
    &[
      record(ClassLabel::Healthy, ClassLabel::Healthy, 0.9),
      record(ClassLabel::Damaged, ClassLabel::Damaged, 0.1),
    ],
  )
  .unwrap();

  let rows = group_metrics(&manifest, &MetricsConfig::default()).unwrap();
  assert_eq!(rows.len(), 1);
  assert_eq!(rows[0].group, "brightness_0.30");
  let stats = rows[0].statistics.unwrap();
  assert!((stats.mean - 0.3).abs() < 0.02);
  assert!((rows[0].metrics.map.map_50 - 1.0).abs() < 1e-9);
  assert!((rows[0].metrics.classification.f1_damaged - 1.0).abs() < 1e-9);

  let report = GroupMetricsReport::new(
    manifest.property,
    MatchConfig::default(),
    MetricsConfig::default(),
    rows,
  );
  let report_path = out.join("group_metrics.json");
  report.save(&report_path).unwrap();

  let value: serde_json::Value =
    serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
  let row = &value["groups"][0];
  assert_eq!(row["group"], "brightness_0.30");
  assert_eq!(row["target_brightness"], 0.3);
  assert_eq!(row["sample_count"], 2);
  assert_eq!(row["mAP_50"], 1.0);
  assert!(row["mean_brightness"].is_number());
}
