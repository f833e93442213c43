// 该文件是 Guangjian （光检） 项目的一部分。
// src/output/exchange.rs - 预测与评估结果的 JSON 文件
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

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::ser::PrettyFormatter;
use thiserror::Error;
use tracing::info;

use crate::{matching::ObjectPrediction, model::FusedPrediction};

const JSON_INDENT: &[u8] = b"    ";

#[derive(Error, Debug)]
pub enum ExchangeError {
  #[error("读写 {} 失败: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("{} 的 JSON 格式错误: {source}", .path.display())]
  Json {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ExchangeError> {
  let content = std::fs::read(path).map_err(|source| ExchangeError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  serde_json::from_slice(&content).map_err(|source| ExchangeError::Json {
    path: path.to_path_buf(),
    source,
  })
}

/// 四空格缩进写出 JSON，自动创建上级目录
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ExchangeError> {
  let mut buffer = Vec::new();
  let mut serializer =
    serde_json::Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(JSON_INDENT));
  value
    .serialize(&mut serializer)
    .map_err(|source| ExchangeError::Json {
      path: path.to_path_buf(),
      source,
    })?;

  let io_error = |source| ExchangeError::Io {
    path: path.to_path_buf(),
    source,
  };
  if let Some(parent) = path.parent()
    && !parent.as_os_str().is_empty()
  {
    std::fs::create_dir_all(parent).map_err(io_error)?;
  }
  std::fs::write(path, buffer).map_err(io_error)
}

pub fn load_predictions(path: &Path) -> Result<Vec<FusedPrediction>, ExchangeError> {
  let predictions: Vec<FusedPrediction> = read_json(path)?;
  info!("从 {} 读取 {} 条预测", path.display(), predictions.len());
  Ok(predictions)
}

pub fn save_predictions(path: &Path, predictions: &[FusedPrediction]) -> Result<(), ExchangeError> {
  write_json(path, predictions)?;
  info!("写出 {} 条预测到 {}", predictions.len(), path.display());
  Ok(())
}

/// 按 `image` 字段分组，组内保持文件中的顺序
pub fn group_by_image(predictions: Vec<FusedPrediction>) -> HashMap<String, Vec<FusedPrediction>> {
  let mut grouped: HashMap<String, Vec<FusedPrediction>> = HashMap::new();
  for prediction in predictions {
    grouped
      .entry(prediction.image.clone())
      .or_default()
      .push(prediction);
  }
  grouped
}

pub fn load_evaluation(path: &Path) -> Result<Vec<ObjectPrediction>, ExchangeError> {
  read_json(path)
}

pub fn save_evaluation(path: &Path, records: &[ObjectPrediction]) -> Result<(), ExchangeError> {
  write_json(path, records)?;
  info!("写出 {} 条匹配结果到 {}", records.len(), path.display());
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{geometry::BBox, model::ClassLabel};

  fn prediction(image: &str, confidence: f64) -> FusedPrediction {
    FusedPrediction {
      image: image.to_string(),
      bbox: BBox::new(1.0, 2.0, 3.0, 4.0),
      confidence,
      cls_score: 0.5,
      damaged_score: confidence * 0.5,
      healthy_score: confidence * 0.5,
    }
  }

  #[test]
  fn evaluation_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("evaluation.json");
    let records = vec![
      ObjectPrediction {
        image: "a.jpg".to_string(),
        actual: ClassLabel::Healthy,
        actual_bbox: Some(BBox::new(50.0, 50.0, 150.0, 150.0)),
        predicted_bbox: Some(BBox::new(55.0, 55.0, 145.0, 145.0)),
        predicted_label: ClassLabel::Healthy,
        score: 0.875,
        iou: 0.8125,
        confidence: 0.5,
      },
      ObjectPrediction {
        image: "a.jpg".to_string(),
        actual: ClassLabel::Damaged,
        actual_bbox: Some(BBox::new(0.0, 0.0, 10.0, 10.0)),
        predicted_bbox: None,
        predicted_label: ClassLabel::Background,
        score: 0.0,
        iou: 0.0,
        confidence: 0.0,
      },
    ];

    save_evaluation(&path, &records).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\n        \"actual\": \"healthy\""));
    assert!(text.contains("\"predicted_bbox\": null"));
    assert!(text.contains("\"x1\": 50,"));

    assert_eq!(load_evaluation(&path).unwrap(), records);
  }

  #[test]
  fn predictions_group_by_image_in_file_order() {
    let grouped = group_by_image(vec![
      prediction("a.jpg", 0.9),
      prediction("b.jpg", 0.8),
      prediction("a.jpg", 0.7),
    ]);
    assert_eq!(grouped.len(), 2);
    let a: Vec<f64> = grouped["a.jpg"].iter().map(|p| p.confidence).collect();
    assert_eq!(a, vec![0.9, 0.7]);
  }

  #[test]
  fn malformed_file_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("predictions.json");
    std::fs::write(&path, "[{\"image\": \"a.jpg\"}]").unwrap();
    let err = load_predictions(&path).unwrap_err();
    assert!(matches!(err, ExchangeError::Json { .. }));
    assert!(err.to_string().contains("predictions.json"));
  }
}
