// 该文件是 Guangjian （光检） 项目的一部分。
// src/model.rs - 检测/分类模型接口与预测数据
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

use serde::{Deserialize, Serialize};

use crate::{frame::TensorFrame, geometry::BBox};

/// 目标的类别标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassLabel {
  Healthy,
  Damaged,
  Background,
}

/// 标注文件中 class_id 对应的标签顺序：0 = damaged，1 = healthy
pub const GROUND_TRUTH_LABELS: [ClassLabel; 2] = [ClassLabel::Damaged, ClassLabel::Healthy];

pub trait WithLabel: Sized + std::fmt::Debug {
  fn to_label_str(&self) -> &'static str;
  fn from_label_id(id: i64, labels: &[Self]) -> Option<Self>;
}

impl WithLabel for ClassLabel {
  fn to_label_str(&self) -> &'static str {
    match self {
      ClassLabel::Healthy => "healthy",
      ClassLabel::Damaged => "damaged",
      ClassLabel::Background => "background",
    }
  }

  fn from_label_id(id: i64, labels: &[Self]) -> Option<Self> {
    usize::try_from(id).ok().and_then(|idx| labels.get(idx)).copied()
  }
}

impl std::fmt::Display for ClassLabel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.to_label_str())
  }
}

/// 检测模型的原始输出，坐标位于模型输入画布上
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
  pub confidence: f32,
  pub class_id: u32,
}

/// 已映射回原图坐标的检测框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionCandidate {
  pub bbox: BBox,
  pub confidence: f64,
}

/// 检测置信度与分类分数融合后的单个目标预测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedPrediction {
  #[serde(default)]
  pub image: String,
  #[serde(rename = "box")]
  pub bbox: BBox,
  #[serde(default)]
  pub confidence: f64,
  #[serde(default)]
  pub cls_score: f64,
  #[serde(default)]
  pub damaged_score: f64,
  #[serde(default)]
  pub healthy_score: f64,
}

impl FusedPrediction {
  /// `damaged_score = confidence * (1 - score)`，`healthy_score = confidence * score`
  pub fn fuse(image: impl Into<String>, candidate: DetectionCandidate, score: f64) -> Self {
    let confidence = candidate.confidence;
    Self {
      image: image.into(),
      bbox: candidate.bbox,
      confidence,
      cls_score: score,
      damaged_score: confidence * (1.0 - score),
      healthy_score: confidence * score,
    }
  }
}

/// 检测模型：输入 letterbox 后的方形张量，输出画布坐标系下的检测框。
/// 置信度不大于 0 的检测框表示“无目标”，由调用方过滤。
pub trait Detector {
  type Error: std::error::Error + Send + Sync + 'static;

  fn detect(&self, input: &TensorFrame) -> Result<Vec<RawDetection>, Self::Error>;
}

/// 二分类模型：输入方形裁剪图，输出 [0, 1] 内的 healthy 概率
pub trait Classifier {
  type Error: std::error::Error + Send + Sync + 'static;

  fn classify(&self, crop: &TensorFrame) -> Result<f32, Self::Error>;
}

/// 从一张图片得到全部融合预测，本地级联与远程服务都实现该接口
pub trait Predictor {
  type Error: std::error::Error + Send + Sync + 'static;

  fn predict(&self, image_id: &str, path: &Path) -> Result<Vec<FusedPrediction>, Self::Error>;
}

#[cfg(feature = "remote_model")]
mod remote;
#[cfg(feature = "remote_model")]
pub use self::remote::{
  PipelineClient, PipelineClientBuilder, RemoteClassifier, RemoteDetector, RemoteModelBuilder,
  RemoteModelError,
};
