// 该文件是 Guangjian （光检） 项目的一部分。
// src/output/draw.rs - 标注框与预测框可视化
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::{
  geometry::BBox,
  input::GroundTruthBox,
  matching::{MatchConfig, predicted_label},
  model::{ClassLabel, FusedPrediction},
};

const GT_HEALTHY_COLOR: [u8; 3] = [0, 255, 0];
const GT_DAMAGED_COLOR: [u8; 3] = [255, 0, 0];
const PRED_HEALTHY_COLOR: [u8; 3] = [0, 160, 255];
const PRED_DAMAGED_COLOR: [u8; 3] = [255, 160, 0];
const PRED_BACKGROUND_COLOR: [u8; 3] = [160, 160, 160];

/// 一张图上要画的内容
#[derive(Debug, Clone, Default)]
pub struct Annotations {
  pub ground_truth: Vec<GroundTruthBox>,
  pub predictions: Vec<FusedPrediction>,
}

pub struct Draw {
  match_config: MatchConfig,
  thickness: Option<u32>,
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      match_config: MatchConfig::default(),
      thickness: None,
    }
  }
}

impl Draw {
  pub fn with_match_config(mut self, match_config: MatchConfig) -> Self {
    self.match_config = match_config;
    self
  }

  pub fn with_thickness(mut self, thickness: u32) -> Self {
    self.thickness = Some(thickness.max(1));
    self
  }

  /// 默认线宽随图像尺寸变化：`max(2, round(0.005 · (w + h) / 2))`
  pub fn line_thickness(&self, image: &RgbImage) -> u32 {
    self.thickness.unwrap_or_else(|| {
      let mean_side = (image.width() + image.height()) as f64 / 2.0;
      ((0.005 * mean_side).round() as u32).max(2)
    })
  }

  fn draw_bbox(&self, image: &mut RgbImage, bbox: &BBox, color: [u8; 3], thickness: u32) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
      return;
    }
    let bbox = bbox.clamp_to(w - 1, h - 1);
    let x = bbox.x1() as i32;
    let y = bbox.y1() as i32;
    let width = bbox.width() as u32 + 1;
    let height = bbox.height() as u32 + 1;

    // 向内加粗
    for inset in 0..thickness {
      let inset_2 = inset * 2;
      if inset_2 >= width || inset_2 >= height {
        break;
      }
      let rect = Rect::at(x + inset as i32, y + inset as i32).of_size(width - inset_2, height - inset_2);
      draw_hollow_rect_mut(image, rect, Rgb(color));
    }
  }

  pub fn draw_ground_truth(&self, image: &mut RgbImage, boxes: &[GroundTruthBox]) {
    let thickness = self.line_thickness(image);
    for gt in boxes {
      let color = match gt.label {
        ClassLabel::Healthy => GT_HEALTHY_COLOR,
        _ => GT_DAMAGED_COLOR,
      };
      self.draw_bbox(image, &gt.bbox, color, thickness);
    }
  }

  pub fn draw_predictions(&self, image: &mut RgbImage, predictions: &[FusedPrediction]) {
    let thickness = self.line_thickness(image).div_ceil(2);
    for prediction in predictions {
      let color = match predicted_label(prediction, &self.match_config) {
        ClassLabel::Healthy => PRED_HEALTHY_COLOR,
        ClassLabel::Damaged => PRED_DAMAGED_COLOR,
        ClassLabel::Background => PRED_BACKGROUND_COLOR,
      };
      self.draw_bbox(image, &prediction.bbox, color, thickness);
    }
  }

  pub fn draw_annotations(&self, image: &RgbImage, annotations: &Annotations) -> RgbImage {
    let mut canvas = image.clone();
    self.draw_ground_truth(&mut canvas, &annotations.ground_truth);
    self.draw_predictions(&mut canvas, &annotations.predictions);
    canvas
  }
}
