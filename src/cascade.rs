// 该文件是 Guangjian （光检） 项目的一部分。
// src/cascade.rs - 检测-分类级联推理
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

use std::{path::Path, sync::mpsc, thread};

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
  frame::{Normalization, TensorFrame},
  geometry::{BBox, letterbox, square_resize},
  input::{InputError, load_image},
  model::{Classifier, DetectionCandidate, Detector, FusedPrediction, Predictor},
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq)]
pub struct CascadeConfig {
  /// 检测模型输入边长
  pub detector_input_size: u32,
  pub letterbox_fill: [u8; 3],
  /// 分类模型输入边长
  pub classifier_input_size: u32,
  pub square_fill: [u8; 3],
  pub classifier_normalization: Normalization,
  /// 同时进行的分类请求上限
  pub max_concurrency: usize,
}

impl Default for CascadeConfig {
  fn default() -> Self {
    Self {
      detector_input_size: 640,
      letterbox_fill: [114, 114, 114],
      classifier_input_size: 380,
      square_fill: [0, 0, 0],
      classifier_normalization: Normalization::Raw,
      max_concurrency: 8,
    }
  }
}

impl CascadeConfig {
  pub fn with_detector_input_size(mut self, size: u32) -> Self {
    self.detector_input_size = size;
    self
  }

  pub fn with_classifier_input_size(mut self, size: u32) -> Self {
    self.classifier_input_size = size;
    self
  }

  pub fn with_classifier_normalization(mut self, normalization: Normalization) -> Self {
    self.classifier_normalization = normalization;
    self
  }

  pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
    self.max_concurrency = max_concurrency.max(1);
    self
  }

  /// 输入边长必须为正
  pub fn validate(&self) -> Result<(), CascadeError> {
    if self.detector_input_size == 0 {
      return Err(CascadeError::InvalidConfig("检测模型输入边长不能为 0".to_string()));
    }
    if self.classifier_input_size == 0 {
      return Err(CascadeError::InvalidConfig("分类模型输入边长不能为 0".to_string()));
    }
    Ok(())
  }
}

#[derive(Error, Debug)]
pub enum CascadeError {
  #[error("级联配置错误: {0}")]
  InvalidConfig(String),
  #[error("输入图像错误: {0}")]
  Input(#[from] InputError),
  #[error("检测模型调用失败: {0}")]
  Detector(#[source] BoxError),
  #[error("第 {index} 个检测框分类失败: {source}")]
  Classifier {
    index: usize,
    #[source]
    source: BoxError,
  },
}

impl CascadeError {
  /// 远程模型超时与其他失败区分开
  pub fn is_timeout(&self) -> bool {
    match self {
      CascadeError::Detector(source) | CascadeError::Classifier { source, .. } => {
        is_timeout_error(&**source)
      }
      CascadeError::InvalidConfig(_) | CascadeError::Input(_) => false,
    }
  }
}

#[cfg(feature = "remote_model")]
fn is_timeout_error(err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
  err
    .downcast_ref::<crate::model::RemoteModelError>()
    .is_some_and(|remote| remote.is_timeout())
}

#[cfg(not(feature = "remote_model"))]
fn is_timeout_error(_err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
  false
}

#[derive(Error, Debug)]
#[error("分类分数 {0} 不在 [0, 1] 范围内")]
pub struct ScoreOutOfRange(pub f32);

/// 分类分数必须是 [0, 1] 内的有限值
fn checked_score(score: f32) -> Result<f64, ScoreOutOfRange> {
  if score.is_finite() && (0.0..=1.0).contains(&score) {
    Ok(score as f64)
  } else {
    Err(ScoreOutOfRange(score))
  }
}

/// 级联推理：letterbox -> 检测 -> 逆映射 -> 逐框分类 -> 分数融合
pub struct CascadeOrchestrator<D, C> {
  detector: D,
  classifier: C,
  config: CascadeConfig,
}

impl<D: Detector, C: Classifier + Sync> CascadeOrchestrator<D, C> {
  pub fn new(detector: D, classifier: C) -> Self {
    Self {
      detector,
      classifier,
      config: CascadeConfig::default(),
    }
  }

  /// 配置不合法时在构建阶段返回错误
  pub fn with_config(mut self, config: CascadeConfig) -> Result<Self, CascadeError> {
    config.validate()?;
    self.config = config;
    Ok(self)
  }

  pub fn config(&self) -> &CascadeConfig {
    &self.config
  }

  /// 检测并把检测框映射回原图坐标，丢弃置信度不大于 0 的结果
  pub fn detect_candidates(&self, image: &RgbImage) -> Result<Vec<DetectionCandidate>, CascadeError> {
    let letterboxed = letterbox(image, self.config.detector_input_size, self.config.letterbox_fill);
    let tensor = TensorFrame::from_rgb_image(&letterboxed.canvas, Normalization::UnitRange);
    let transform = letterboxed.transform;
    debug!(
      "letterbox: scale = {:.4}, pad_top = {}, pad_left = {}",
      transform.scale(),
      transform.pad_top(),
      transform.pad_left()
    );

    let raw = self
      .detector
      .detect(&tensor)
      .map_err(|e| CascadeError::Detector(Box::new(e)))?;
    let total = raw.len();

    let mut candidates = Vec::with_capacity(total);
    for detection in raw.into_iter().filter(|d| d.confidence > 0.0) {
      let bbox = transform.inverse_bbox(&detection.bbox).truncated();
      if bbox.is_empty() {
        warn!("检测框映射回原图后为空，已丢弃: {:?}", detection.bbox);
        continue;
      }
      candidates.push(DetectionCandidate {
        bbox,
        confidence: detection.confidence as f64,
      });
    }
    debug!("检测结果 {} 个，有效 {} 个", total, candidates.len());
    Ok(candidates)
  }

  /// 从原图裁剪检测框区域并转换为分类模型输入
  pub fn prepare_crop(&self, image: &RgbImage, bbox: &BBox) -> TensorFrame {
    let x = bbox.x1() as u32;
    let y = bbox.y1() as u32;
    let width = (bbox.width() as u32).max(1);
    let height = (bbox.height() as u32).max(1);
    let crop = image::imageops::crop_imm(image, x, y, width, height).to_image();
    let resized = square_resize(
      &crop,
      self.config.classifier_input_size,
      self.config.square_fill,
    );
    TensorFrame::from_rgb_image(&resized, self.config.classifier_normalization)
  }

  /// 并发分类，结果按检测框序号重新组装，与完成顺序无关
  pub fn classify_crops(&self, crops: &[TensorFrame]) -> Result<Vec<f64>, CascadeError> {
    let chunk_size = self.config.max_concurrency.max(1);
    let mut results: Vec<Option<Result<f32, C::Error>>> = Vec::with_capacity(crops.len());
    results.resize_with(crops.len(), || None);

    for (chunk_index, chunk) in crops.chunks(chunk_size).enumerate() {
      let base = chunk_index * chunk_size;
      let (tx, rx) = mpsc::channel();
      let classifier = &self.classifier;

      thread::scope(|scope| {
        for (offset, crop) in chunk.iter().enumerate() {
          let tx = tx.clone();
          scope.spawn(move || {
            let _ = tx.send((base + offset, classifier.classify(crop)));
          });
        }
      });
      drop(tx);

      for (index, result) in rx {
        results[index] = Some(result);
      }
    }

    results
      .into_iter()
      .enumerate()
      .map(|(index, result)| match result {
        Some(Ok(score)) => checked_score(score).map_err(|e| CascadeError::Classifier {
          index,
          source: Box::new(e),
        }),
        Some(Err(e)) => Err(CascadeError::Classifier {
          index,
          source: Box::new(e),
        }),
        None => Err(CascadeError::Classifier {
          index,
          source: "分类任务没有返回结果".into(),
        }),
      })
      .collect()
  }

  /// 对单张图片运行完整级联
  pub fn run(&self, image_id: &str, image: &RgbImage) -> Result<Vec<FusedPrediction>, CascadeError> {
    let now = std::time::Instant::now();
    let candidates = self.detect_candidates(image)?;
    let elapsed_detect = now.elapsed();

    let crops: Vec<TensorFrame> = candidates
      .iter()
      .map(|candidate| self.prepare_crop(image, &candidate.bbox))
      .collect();
    let scores = self.classify_crops(&crops)?;

    let predictions: Vec<FusedPrediction> = candidates
      .into_iter()
      .zip(scores)
      .map(|(candidate, score)| FusedPrediction::fuse(image_id, candidate, score))
      .collect();

    info!(
      "{}: {} 个目标，检测耗时: {:.2?}，总耗时: {:.2?}",
      image_id,
      predictions.len(),
      elapsed_detect,
      now.elapsed()
    );
    Ok(predictions)
  }
}

impl<D: Detector, C: Classifier + Sync> Predictor for CascadeOrchestrator<D, C> {
  type Error = CascadeError;

  fn predict(&self, image_id: &str, path: &Path) -> Result<Vec<FusedPrediction>, Self::Error> {
    let image = load_image(path)?;
    self.run(image_id, &image)
  }
}
