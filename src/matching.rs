// 该文件是 Guangjian （光检） 项目的一部分。
// src/matching.rs - 预测框与标注框的贪心 IoU 匹配
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

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  geometry::BBox,
  input::GroundTruthBox,
  model::{ClassLabel, FusedPrediction},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
  /// healthy/damaged 分数都低于该值时判为背景
  pub confidence_threshold: f64,
  /// 匹配所需的最小 IoU
  pub iou_threshold: f64,
}

impl Default for MatchConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: 0.4,
      iou_threshold: 0.5,
    }
  }
}

impl MatchConfig {
  pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn with_iou_threshold(mut self, threshold: f64) -> Self {
    self.iou_threshold = threshold;
    self
  }
}

/// 一条匹配结果：匹配对、误检（actual 为背景）或漏检（predicted_bbox 为空）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPrediction {
  #[serde(default)]
  pub image: String,
  pub actual: ClassLabel,
  #[serde(default)]
  pub actual_bbox: Option<BBox>,
  #[serde(default)]
  pub predicted_bbox: Option<BBox>,
  pub predicted_label: ClassLabel,
  /// 分类分数 cls_score
  #[serde(default)]
  pub score: f64,
  #[serde(default)]
  pub iou: f64,
  #[serde(default)]
  pub confidence: f64,
}

impl ObjectPrediction {
  pub fn is_missed(&self) -> bool {
    self.predicted_bbox.is_none()
  }
}

/// 两个分数都低于阈值为背景，否则取较大者，相等时判为 damaged
pub fn predicted_label(prediction: &FusedPrediction, config: &MatchConfig) -> ClassLabel {
  if prediction.healthy_score < config.confidence_threshold
    && prediction.damaged_score < config.confidence_threshold
  {
    ClassLabel::Background
  } else if prediction.healthy_score > prediction.damaged_score {
    ClassLabel::Healthy
  } else {
    ClassLabel::Damaged
  }
}

/// 单张图片的贪心匹配。
///
/// 预测按置信度降序（稳定排序）依次处理，每个预测在尚未被占用的标注框中
/// 选择 IoU 不低于阈值且最大的一个；IoU 相同时先出现的标注框胜出。
/// 这不是最优二分匹配，处理顺序会影响结果。
/// 全部预测处理完后，剩余的标注框各生成一条漏检记录。
pub fn match_image(
  image_id: &str,
  predictions: &[FusedPrediction],
  ground_truth: &[GroundTruthBox],
  config: &MatchConfig,
) -> Vec<ObjectPrediction> {
  let mut order: Vec<usize> = (0..predictions.len()).collect();
  order.sort_by(|&a, &b| predictions[b].confidence.total_cmp(&predictions[a].confidence));

  let mut claimed = vec![false; ground_truth.len()];
  let mut results = Vec::with_capacity(predictions.len() + ground_truth.len());

  for index in order {
    let prediction = &predictions[index];
    let mut best_iou = 0.0;
    let mut best_gt = None;

    for (gt_index, gt) in ground_truth.iter().enumerate() {
      if claimed[gt_index] {
        continue;
      }
      let iou = prediction.bbox.iou(&gt.bbox);
      if iou >= config.iou_threshold && iou > best_iou {
        best_iou = iou;
        best_gt = Some(gt_index);
      }
    }

    if let Some(gt_index) = best_gt {
      claimed[gt_index] = true;
    }

    results.push(ObjectPrediction {
      image: prediction.image.clone(),
      actual: best_gt
        .map(|i| ground_truth[i].label)
        .unwrap_or(ClassLabel::Background),
      actual_bbox: best_gt.map(|i| ground_truth[i].bbox),
      predicted_bbox: Some(prediction.bbox),
      predicted_label: predicted_label(prediction, config),
      score: prediction.cls_score,
      iou: best_iou,
      confidence: prediction.confidence,
    });
  }

  let mut missed = 0;
  for (gt, _) in ground_truth.iter().zip(&claimed).filter(|(_, used)| !**used) {
    missed += 1;
    results.push(ObjectPrediction {
      image: image_id.to_string(),
      actual: gt.label,
      actual_bbox: Some(gt.bbox),
      predicted_bbox: None,
      predicted_label: ClassLabel::Background,
      score: 0.0,
      iou: 0.0,
      confidence: 0.0,
    });
  }

  debug!(
    "{}: 预测 {} 个，标注 {} 个，漏检 {} 个",
    image_id,
    predictions.len(),
    ground_truth.len(),
    missed
  );
  results
}

#[cfg(test)]
mod tests {
  use super::*;

  fn prediction(bbox: BBox, confidence: f64, healthy_score: f64, damaged_score: f64) -> FusedPrediction {
    FusedPrediction {
      image: "img.jpg".to_string(),
      bbox,
      confidence,
      cls_score: if confidence > 0.0 { healthy_score / confidence } else { 0.0 },
      damaged_score,
      healthy_score,
    }
  }

  fn gt(label: ClassLabel, bbox: BBox) -> GroundTruthBox {
    GroundTruthBox { label, bbox }
  }

  #[test]
  fn matched_pair_takes_ground_truth_label() {
    let truth = [gt(ClassLabel::Healthy, BBox::new(50.0, 50.0, 150.0, 150.0))];
    let preds = [prediction(BBox::new(55.0, 55.0, 145.0, 145.0), 0.9, 0.8, 0.1)];

    let results = match_image("img.jpg", &preds, &truth, &MatchConfig::default());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].actual, ClassLabel::Healthy);
    assert_eq!(results[0].predicted_label, ClassLabel::Healthy);
    assert!((results[0].iou - 0.81).abs() < 1e-9);
    assert_eq!(results[0].actual_bbox, Some(truth[0].bbox));
  }

  #[test]
  fn unmatched_ground_truth_is_a_missed_detection() {
    let truth = [gt(ClassLabel::Damaged, BBox::new(0.0, 0.0, 10.0, 10.0))];
    let preds = [prediction(BBox::new(100.0, 100.0, 120.0, 120.0), 0.7, 0.1, 0.6)];

    let results = match_image("img.jpg", &preds, &truth, &MatchConfig::default());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].actual, ClassLabel::Background);
    assert_eq!(results[0].iou, 0.0);
    assert_eq!(results[0].actual_bbox, None);

    let missed = &results[1];
    assert!(missed.is_missed());
    assert_eq!(missed.actual, ClassLabel::Damaged);
    assert_eq!(missed.predicted_label, ClassLabel::Background);
    assert_eq!((missed.score, missed.iou, missed.confidence), (0.0, 0.0, 0.0));
  }

  #[test]
  fn higher_confidence_claims_ground_truth_first() {
    let truth = [gt(ClassLabel::Healthy, BBox::new(0.0, 0.0, 100.0, 100.0))];
    let preds = [
      // 更贴合但置信度更低
      prediction(BBox::new(0.0, 0.0, 100.0, 100.0), 0.6, 0.5, 0.1),
      prediction(BBox::new(0.0, 0.0, 90.0, 90.0), 0.9, 0.8, 0.1),
    ];

    let results = match_image("img.jpg", &preds, &truth, &MatchConfig::default());
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].confidence, 0.9);
    assert_eq!(results[0].actual, ClassLabel::Healthy);
    assert_eq!(results[1].confidence, 0.6);
    assert_eq!(results[1].actual, ClassLabel::Background);
  }

  #[test]
  fn ground_truth_is_never_claimed_twice() {
    let truth = [
      gt(ClassLabel::Healthy, BBox::new(0.0, 0.0, 100.0, 100.0)),
      gt(ClassLabel::Damaged, BBox::new(0.0, 0.0, 100.0, 100.0)),
    ];
    let preds: Vec<FusedPrediction> = (0..4)
      .map(|i| prediction(BBox::new(0.0, 0.0, 95.0, 95.0), 0.9 - i as f64 * 0.1, 0.5, 0.2))
      .collect();

    let results = match_image("img.jpg", &preds, &truth, &MatchConfig::default());
    let matched: Vec<_> = results.iter().filter_map(|r| r.actual_bbox.filter(|_| !r.is_missed())).collect();
    assert_eq!(matched.len(), 2);
    // IoU 相同时先出现的标注框胜出
    assert_eq!(results[0].actual, ClassLabel::Healthy);
    assert_eq!(results[1].actual, ClassLabel::Damaged);
    assert!(results[2..].iter().all(|r| r.actual == ClassLabel::Background));
  }

  #[test]
  fn equal_confidence_keeps_input_order() {
    let truth = [gt(ClassLabel::Healthy, BBox::new(0.0, 0.0, 100.0, 100.0))];
    let preds = [
      prediction(BBox::new(0.0, 0.0, 80.0, 80.0), 0.5, 0.45, 0.05),
      prediction(BBox::new(0.0, 0.0, 100.0, 100.0), 0.5, 0.45, 0.05),
    ];
    let results = match_image("img.jpg", &preds, &truth, &MatchConfig::default());
    assert_eq!(results[0].predicted_bbox, Some(preds[0].bbox));
    assert_eq!(results[0].actual, ClassLabel::Healthy);
    assert_eq!(results[1].actual, ClassLabel::Background);
  }

  #[test]
  fn predicted_label_rules() {
    let config = MatchConfig::default();
    let bbox = BBox::new(0.0, 0.0, 1.0, 1.0);
    assert_eq!(predicted_label(&prediction(bbox, 0.5, 0.3, 0.2), &config), ClassLabel::Background);
    assert_eq!(predicted_label(&prediction(bbox, 0.9, 0.5, 0.4), &config), ClassLabel::Healthy);
    assert_eq!(predicted_label(&prediction(bbox, 0.9, 0.1, 0.8), &config), ClassLabel::Damaged);
    assert_eq!(predicted_label(&prediction(bbox, 1.0, 0.5, 0.5), &config), ClassLabel::Damaged);
  }
}
