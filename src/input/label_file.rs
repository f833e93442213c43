// 该文件是 Guangjian （光检） 项目的一部分。
// src/input/label_file.rs - YOLO 格式标注文件解析
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
use tracing::debug;

use crate::{
  geometry::BBox,
  input::InputError,
  model::{ClassLabel, WithLabel},
};

const LABEL_FIELDS: usize = 5;

/// 标注框，像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthBox {
  pub label: ClassLabel,
  pub bbox: BBox,
}

/// 解析一行 `class_id cx cy w h`，空行返回 `None`。
/// `line` 从 1 开始计数，仅用于报错。
pub fn parse_label_line(
  text: &str,
  line: usize,
  path: &Path,
  labels: &[ClassLabel],
  image_width: u32,
  image_height: u32,
) -> Result<Option<GroundTruthBox>, InputError> {
  let text = text.trim();
  if text.is_empty() {
    return Ok(None);
  }

  let malformed = |reason: String| InputError::MalformedLabel {
    path: path.to_path_buf(),
    line,
    reason,
  };

  let fields: Vec<&str> = text.split_whitespace().collect();
  if fields.len() != LABEL_FIELDS {
    return Err(malformed(format!(
      "需要 {} 个字段，实际为 {}",
      LABEL_FIELDS,
      fields.len()
    )));
  }

  let mut values = [0.0f64; LABEL_FIELDS];
  for (value, field) in values.iter_mut().zip(&fields) {
    *value = field
      .parse::<f64>()
      .ok()
      .filter(|v| v.is_finite())
      .ok_or_else(|| malformed(format!("无法解析数值 '{}'", field)))?;
  }

  let [class_id, cx, cy, w, h] = values;
  let class_id = class_id.trunc() as i64;
  let label = ClassLabel::from_label_id(class_id, labels).ok_or_else(|| {
    InputError::ClassOutOfRange {
      path: path.to_path_buf(),
      line,
      class_id,
      num_classes: labels.len(),
    }
  })?;

  Ok(Some(GroundTruthBox {
    label,
    bbox: BBox::from_normalized_center(cx, cy, w, h, image_width, image_height),
  }))
}

/// 读取整份标注文件
pub fn load_ground_truth(
  path: &Path,
  labels: &[ClassLabel],
  image_width: u32,
  image_height: u32,
) -> Result<Vec<GroundTruthBox>, InputError> {
  if !path.exists() {
    return Err(InputError::MissingLabel(path.to_path_buf()));
  }
  let content = std::fs::read_to_string(path).map_err(|e| InputError::io(path, e))?;

  let mut boxes = Vec::new();
  for (index, text) in content.lines().enumerate() {
    if let Some(gt) = parse_label_line(text, index + 1, path, labels, image_width, image_height)? {
      boxes.push(gt);
    }
  }
  debug!("{}: {} 个标注框", path.display(), boxes.len());
  Ok(boxes)
}
