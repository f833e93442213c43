// 该文件是 Guangjian （光检） 项目的一部分。
// src/metrics.rs - 分类指标与 mAP 计算
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

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{matching::ObjectPrediction, model::ClassLabel};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
  pub map_iou_start: f64,
  pub map_iou_step: f64,
  pub map_iou_steps: usize,
  /// 分类分数的 healthy/damaged 分界
  pub score_split: f64,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      map_iou_start: 0.5,
      map_iou_step: 0.05,
      map_iou_steps: 10,
      score_split: 0.5,
    }
  }
}

impl MetricsConfig {
  pub fn with_iou_sweep(mut self, start: f64, step: f64, steps: usize) -> Self {
    self.map_iou_start = start;
    self.map_iou_step = step;
    self.map_iou_steps = steps;
    self
  }

  pub fn with_score_split(mut self, split: f64) -> Self {
    self.score_split = split;
    self
  }

  /// 0.50, 0.55, ..., 0.95
  pub fn thresholds(&self) -> Vec<f64> {
    (0..self.map_iou_steps)
      .map(|i| self.map_iou_start + i as f64 * self.map_iou_step)
      .collect()
  }
}

fn safe_div(numerator: f64, denominator: f64) -> f64 {
  if denominator > 0.0 { numerator / denominator } else { 0.0 }
}

/// healthy/damaged 两类的精确率、召回率与 F1，分母为 0 时取 0
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassificationMetrics {
  pub precision_healthy: f64,
  pub precision_damaged: f64,
  pub recall_healthy: f64,
  pub recall_damaged: f64,
  pub f1_healthy: f64,
  pub f1_damaged: f64,
}

fn precision_recall_f1(records: &[ObjectPrediction], class: ClassLabel) -> (f64, f64, f64) {
  let mut true_positive = 0usize;
  let mut predicted = 0usize;
  let mut actual = 0usize;
  for record in records {
    let is_actual = record.actual == class;
    let is_predicted = record.predicted_label == class;
    actual += is_actual as usize;
    predicted += is_predicted as usize;
    true_positive += (is_actual && is_predicted) as usize;
  }

  let precision = safe_div(true_positive as f64, predicted as f64);
  let recall = safe_div(true_positive as f64, actual as f64);
  let f1 = safe_div(2.0 * precision * recall, precision + recall);
  (precision, recall, f1)
}

impl ClassificationMetrics {
  pub fn compute(records: &[ObjectPrediction]) -> Self {
    let (precision_healthy, recall_healthy, f1_healthy) =
      precision_recall_f1(records, ClassLabel::Healthy);
    let (precision_damaged, recall_damaged, f1_damaged) =
      precision_recall_f1(records, ClassLabel::Damaged);
    Self {
      precision_healthy,
      precision_damaged,
      recall_healthy,
      recall_damaged,
      f1_healthy,
      f1_damaged,
    }
  }
}

/// 阶梯式平均精度 `AP = Σ (R_k − R_{k−1}) · P_k`。
///
/// 按分数降序遍历，分数相同的样本同时进入曲线。没有正样本时返回 0。
pub fn average_precision(truth: &[bool], scores: &[f64]) -> f64 {
  debug_assert_eq!(truth.len(), scores.len());
  let positives = truth.iter().filter(|t| **t).count();
  if positives == 0 {
    return 0.0;
  }

  let mut order: Vec<usize> = (0..truth.len().min(scores.len())).collect();
  order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

  let mut true_positive = 0usize;
  let mut seen = 0usize;
  let mut previous_recall = 0.0;
  let mut ap = 0.0;

  let mut i = 0;
  while i < order.len() {
    let threshold = scores[order[i]];
    while i < order.len() && scores[order[i]].total_cmp(&threshold) == Ordering::Equal {
      true_positive += truth[order[i]] as usize;
      seen += 1;
      i += 1;
    }
    let precision = true_positive as f64 / seen as f64;
    let recall = true_positive as f64 / positives as f64;
    ap += (recall - previous_recall) * precision;
    previous_recall = recall;
  }
  ap
}

/// 单个 IoU 阈值下两类的 AP
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdAp {
  pub iou_threshold: f64,
  pub ap_healthy: f64,
  pub ap_damaged: f64,
  pub map: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapMetrics {
  #[serde(rename = "mAP_50")]
  pub map_50: f64,
  #[serde(rename = "mAP_50_95")]
  pub map_50_95: f64,
  #[serde(skip)]
  pub per_threshold: Vec<ThresholdAp>,
}

/// 某一 IoU 阈值下的排序分数。
///
/// healthy: `confidence · score · [iou ≥ t] · [score ≥ split]`，
/// damaged: `confidence · (1 − score) · [iou ≥ t] · [score ≤ split]`。
/// 注意：检测置信度、分类概率和对错门限被混成了一个排序信号，
/// 与常规检测 mAP（只按置信度排序）不同，可能是指标定义上的缺陷。
pub fn ranking_score(record: &ObjectPrediction, class: ClassLabel, iou_threshold: f64, split: f64) -> f64 {
  let iou_gate = if record.iou >= iou_threshold { 1.0 } else { 0.0 };
  match class {
    ClassLabel::Healthy => {
      let side = if record.score >= split { 1.0 } else { 0.0 };
      record.confidence * record.score * iou_gate * side
    }
    ClassLabel::Damaged => {
      let side = if record.score <= split { 1.0 } else { 0.0 };
      record.confidence * (1.0 - record.score) * iou_gate * side
    }
    ClassLabel::Background => 0.0,
  }
}

fn class_ap(records: &[ObjectPrediction], class: ClassLabel, iou_threshold: f64, split: f64) -> f64 {
  let truth: Vec<bool> = records.iter().map(|r| r.actual == class).collect();
  let scores: Vec<f64> = records
    .iter()
    .map(|r| ranking_score(r, class, iou_threshold, split))
    .collect();
  average_precision(&truth, &scores)
}

impl MapMetrics {
  pub fn compute(records: &[ObjectPrediction], config: &MetricsConfig) -> Self {
    let per_threshold: Vec<ThresholdAp> = config
      .thresholds()
      .into_iter()
      .map(|iou_threshold| {
        let ap_healthy = class_ap(records, ClassLabel::Healthy, iou_threshold, config.score_split);
        let ap_damaged = class_ap(records, ClassLabel::Damaged, iou_threshold, config.score_split);
        ThresholdAp {
          iou_threshold,
          ap_healthy,
          ap_damaged,
          map: (ap_healthy + ap_damaged) / 2.0,
        }
      })
      .collect();

    let map_50 = per_threshold.first().map(|t| t.map).unwrap_or(0.0);
    let map_50_95 = safe_div(
      per_threshold.iter().map(|t| t.map).sum(),
      per_threshold.len() as f64,
    );
    Self {
      map_50,
      map_50_95,
      per_threshold,
    }
  }
}

/// 一组匹配结果的全部指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMetrics {
  #[serde(flatten)]
  pub classification: ClassificationMetrics,
  #[serde(flatten)]
  pub map: MapMetrics,
  pub sample_count: usize,
}

impl GroupMetrics {
  pub fn compute(records: &[ObjectPrediction], config: &MetricsConfig) -> Self {
    Self {
      classification: ClassificationMetrics::compute(records),
      map: MapMetrics::compute(records, config),
      sample_count: records.len(),
    }
  }
}
