// 该文件是 Guangjian （光检） 项目的一部分。
// src/geometry.rs - 边界框与 letterbox 坐标变换
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

use image::{Rgb, RgbImage, imageops::FilterType};
use serde::{Deserialize, Serialize, Serializer};

/// 原图像素坐标系下的边界框 [x1, y1, x2, y2]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
  #[serde(serialize_with = "serialize_coord")]
  x1: f64,
  #[serde(serialize_with = "serialize_coord")]
  y1: f64,
  #[serde(serialize_with = "serialize_coord")]
  x2: f64,
  #[serde(serialize_with = "serialize_coord")]
  y2: f64,
}

// 整数坐标按整数写出，与既有的 JSON 文件保持一致
fn serialize_coord<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
  if value.fract() == 0.0 && value.abs() < 9.0e15 {
    serializer.serialize_i64(*value as i64)
  } else {
    serializer.serialize_f64(*value)
  }
}

impl BBox {
  /// 角点顺序颠倒时自动交换
  pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
    Self {
      x1: x1.min(x2),
      y1: y1.min(y2),
      x2: x1.max(x2),
      y2: y1.max(y2),
    }
  }

  /// 由归一化的中心点与宽高 (cx, cy, w, h) 得到像素坐标，向零截断
  pub fn from_normalized_center(cx: f64, cy: f64, w: f64, h: f64, image_w: u32, image_h: u32) -> Self {
    let x_center = cx * image_w as f64;
    let y_center = cy * image_h as f64;
    let width = w * image_w as f64;
    let height = h * image_h as f64;

    Self::new(
      (x_center - width / 2.0).trunc(),
      (y_center - height / 2.0).trunc(),
      (x_center + width / 2.0).trunc(),
      (y_center + height / 2.0).trunc(),
    )
  }

  pub fn x1(&self) -> f64 {
    self.x1
  }

  pub fn y1(&self) -> f64 {
    self.y1
  }

  pub fn x2(&self) -> f64 {
    self.x2
  }

  pub fn y2(&self) -> f64 {
    self.y2
  }

  pub fn width(&self) -> f64 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f64 {
    self.y2 - self.y1
  }

  pub fn area(&self) -> f64 {
    self.width() * self.height()
  }

  pub fn is_empty(&self) -> bool {
    self.width() <= 0.0 || self.height() <= 0.0
  }

  pub fn clamp_to(&self, width: u32, height: u32) -> Self {
    let (w, h) = (width as f64, height as f64);
    Self::new(
      self.x1.clamp(0.0, w),
      self.y1.clamp(0.0, h),
      self.x2.clamp(0.0, w),
      self.y2.clamp(0.0, h),
    )
  }

  /// 坐标取整（向零截断），裁剪时使用
  pub fn truncated(&self) -> Self {
    Self::new(self.x1.trunc(), self.y1.trunc(), self.x2.trunc(), self.y2.trunc())
  }

  pub fn intersection_area(&self, other: &BBox) -> f64 {
    let x_a = self.x1.max(other.x1);
    let y_a = self.y1.max(other.y1);
    let x_b = self.x2.min(other.x2);
    let y_b = self.y2.min(other.y2);

    (x_b - x_a).max(0.0) * (y_b - y_a).max(0.0)
  }

  pub fn iou(&self, other: &BBox) -> f64 {
    let intersection = self.intersection_area(other);
    let union = self.area() + other.area() - intersection;

    if union > 0.0 { intersection / union } else { 0.0 }
  }
}

/// letterbox 变换参数，记录原图到模型输入画布的映射
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxTransform {
  scale: f64,
  pad_top: u32,
  pad_left: u32,
  orig_width: u32,
  orig_height: u32,
  target_size: u32,
}

/// letterbox 后的画布及其变换参数
#[derive(Debug, Clone)]
pub struct Letterboxed {
  pub canvas: RgbImage,
  pub transform: LetterboxTransform,
}

/// 等比缩放使长边恰好放入 `target_size`，居中贴到纯色方形画布上
pub fn letterbox(image: &RgbImage, target_size: u32, fill: [u8; 3]) -> Letterboxed {
  let (orig_width, orig_height) = image.dimensions();
  let size = target_size as f64;
  let scale = (size / orig_height.max(1) as f64).min(size / orig_width.max(1) as f64);

  let new_width = ((orig_width as f64 * scale).round() as u32).clamp(1, target_size);
  let new_height = ((orig_height as f64 * scale).round() as u32).clamp(1, target_size);
  let resized = image::imageops::resize(image, new_width, new_height, FilterType::Triangle);

  let pad_left = (target_size - new_width) / 2;
  let pad_top = (target_size - new_height) / 2;

  let mut canvas = RgbImage::from_pixel(target_size, target_size, Rgb(fill));
  image::imageops::replace(&mut canvas, &resized, pad_left as i64, pad_top as i64);

  Letterboxed {
    canvas,
    transform: LetterboxTransform {
      scale,
      pad_top,
      pad_left,
      orig_width,
      orig_height,
      target_size,
    },
  }
}

impl LetterboxTransform {
  pub fn scale(&self) -> f64 {
    self.scale
  }

  pub fn pad_top(&self) -> u32 {
    self.pad_top
  }

  pub fn pad_left(&self) -> u32 {
    self.pad_left
  }

  pub fn target_size(&self) -> u32 {
    self.target_size
  }

  pub fn original_size(&self) -> (u32, u32) {
    (self.orig_width, self.orig_height)
  }

  /// 原图坐标 -> 画布坐标
  pub fn forward_point(&self, x: f64, y: f64) -> (f64, f64) {
    (
      x * self.scale + self.pad_left as f64,
      y * self.scale + self.pad_top as f64,
    )
  }

  /// 画布坐标 -> 原图坐标，结果必须夹到原图范围内
  pub fn inverse_point(&self, x: f64, y: f64) -> (f64, f64) {
    let xo = (x - self.pad_left as f64) / self.scale;
    let yo = (y - self.pad_top as f64) / self.scale;
    (
      xo.clamp(0.0, self.orig_width as f64),
      yo.clamp(0.0, self.orig_height as f64),
    )
  }

  pub fn forward_bbox(&self, bbox: &BBox) -> BBox {
    let (x1, y1) = self.forward_point(bbox.x1, bbox.y1);
    let (x2, y2) = self.forward_point(bbox.x2, bbox.y2);
    BBox::new(x1, y1, x2, y2)
  }

  pub fn inverse_bbox(&self, bbox: &[f32; 4]) -> BBox {
    let (x1, y1) = self.inverse_point(bbox[0] as f64, bbox[1] as f64);
    let (x2, y2) = self.inverse_point(bbox[2] as f64, bbox[3] as f64);
    BBox::new(x1, y1, x2, y2)
  }
}

/// 以长边为边长居中补边成正方形
pub fn pad_to_square(image: &RgbImage, fill: [u8; 3]) -> RgbImage {
  let (width, height) = image.dimensions();
  let side = width.max(height);
  let mut canvas = RgbImage::from_pixel(side, side, Rgb(fill));
  image::imageops::replace(
    &mut canvas,
    image,
    ((side - width) / 2) as i64,
    ((side - height) / 2) as i64,
  );
  canvas
}

/// 分类模型的预处理：补成正方形后缩放到固定分辨率，无需逆变换
pub fn square_resize(image: &RgbImage, size: u32, fill: [u8; 3]) -> RgbImage {
  let square = pad_to_square(image, fill);
  image::imageops::resize(&square, size, size, FilterType::Lanczos3)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn iou_of_identical_and_disjoint_boxes() {
    let a = BBox::new(10.0, 10.0, 50.0, 40.0);
    let b = BBox::new(60.0, 60.0, 80.0, 90.0);
    assert!((a.iou(&a) - 1.0).abs() < 1e-12);
    assert_eq!(a.iou(&b), 0.0);

    // 仅边相接
    let c = BBox::new(50.0, 10.0, 70.0, 40.0);
    assert_eq!(a.iou(&c), 0.0);
  }

  #[test]
  fn iou_of_nested_boxes() {
    let gt = BBox::new(50.0, 50.0, 150.0, 150.0);
    let pred = BBox::new(55.0, 55.0, 145.0, 145.0);
    assert!((gt.iou(&pred) - 0.81).abs() < 1e-9);
  }

  #[test]
  fn degenerate_boxes_are_tolerated() {
    let swapped = BBox::new(30.0, 40.0, 10.0, 20.0);
    assert_eq!(swapped, BBox::new(10.0, 20.0, 30.0, 40.0));

    let line = BBox::new(5.0, 5.0, 5.0, 20.0);
    assert!(line.is_empty());
    assert_eq!(line.iou(&line), 0.0);
  }

  #[test]
  fn letterbox_pads_shorter_side() {
    let image = RgbImage::from_pixel(200, 100, Rgb([10, 20, 30]));
    let out = letterbox(&image, 64, [114, 114, 114]);

    assert_eq!(out.canvas.dimensions(), (64, 64));
    assert_eq!(out.transform.pad_left(), 0);
    assert_eq!(out.transform.pad_top(), 16);
    assert!((out.transform.scale() - 0.32).abs() < 1e-12);
    assert_eq!(out.canvas.get_pixel(32, 2), &Rgb([114, 114, 114]));
    assert_eq!(out.canvas.get_pixel(32, 32), &Rgb([10, 20, 30]));
    assert_eq!(out.canvas.get_pixel(32, 61), &Rgb([114, 114, 114]));
  }

  #[test]
  fn odd_padding_splits_floor_first() {
    let image = RgbImage::new(100, 33);
    let out = letterbox(&image, 100, [0, 0, 0]);
    // 33 -> 67 像素的补边，上方 33，下方 34
    assert_eq!(out.transform.pad_top(), 33);
  }

  #[test]
  fn inverse_of_forward_reproduces_box() {
    let image = RgbImage::new(1280, 720);
    let transform = letterbox(&image, 640, [114, 114, 114]).transform;

    for bbox in [
      BBox::new(0.0, 0.0, 1280.0, 720.0),
      BBox::new(100.0, 50.0, 400.0, 300.0),
      BBox::new(1000.5, 700.25, 1279.0, 719.0),
    ] {
      let canvas = transform.forward_bbox(&bbox);
      let raw = [
        canvas.x1() as f32,
        canvas.y1() as f32,
        canvas.x2() as f32,
        canvas.y2() as f32,
      ];
      let back = transform.inverse_bbox(&raw);
      assert!((back.x1() - bbox.x1()).abs() <= 1.0);
      assert!((back.y1() - bbox.y1()).abs() <= 1.0);
      assert!((back.x2() - bbox.x2()).abs() <= 1.0);
      assert!((back.y2() - bbox.y2()).abs() <= 1.0);
    }
  }

  #[test]
  fn inverse_clamps_points_outside_image() {
    let image = RgbImage::new(200, 100);
    let transform = letterbox(&image, 100, [114, 114, 114]).transform;
    // 画布上方补边区域与右侧越界
    let bbox = transform.inverse_bbox(&[-3.0, 10.0, 104.0, 99.0]);
    assert_eq!(bbox.x1(), 0.0);
    assert_eq!(bbox.y1(), 0.0);
    assert_eq!(bbox.x2(), 200.0);
    assert_eq!(bbox.y2(), 100.0);
  }

  #[test]
  fn square_resize_centers_on_black() {
    let image = RgbImage::from_pixel(40, 20, Rgb([200, 200, 200]));
    let square = pad_to_square(&image, [0, 0, 0]);
    assert_eq!(square.dimensions(), (40, 40));
    assert_eq!(square.get_pixel(20, 5), &Rgb([0, 0, 0]));
    assert_eq!(square.get_pixel(20, 20), &Rgb([200, 200, 200]));

    let resized = square_resize(&image, 16, [0, 0, 0]);
    assert_eq!(resized.dimensions(), (16, 16));
  }

  #[test]
  fn whole_coordinates_serialize_as_integers() {
    let bbox = BBox::new(50.0, 50.5, 150.0, 150.0);
    let json = serde_json::to_string(&bbox).unwrap();
    assert_eq!(json, r#"{"x1":50,"y1":50.5,"x2":150,"y2":150}"#);
    let back: BBox = serde_json::from_str(&json).unwrap();
    assert_eq!(back, bbox);
  }
}
