// 该文件是 Guangjian （光检） 项目的一部分。
// src/frame.rs - NCHW 张量帧定义
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

use image::{ImageBuffer, Rgb, RgbImage};
use serde::{Deserialize, Serialize};

const RGB_CHANNELS: usize = 3;

/// 像素归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
  /// 归一化到 [0, 1]，检测模型使用
  #[default]
  UnitRange,
  /// 保持 [0, 255]，由模型内部完成归一化（EfficientNet 系列）
  Raw,
}

impl Normalization {
  fn scale(self) -> f32 {
    match self {
      Normalization::UnitRange => 1.0 / 255.0,
      Normalization::Raw => 1.0,
    }
  }
}

/// RGB 顺序、NCHW 排布的浮点张量，批大小固定为 1
#[derive(Debug, Clone)]
pub struct TensorFrame {
  data: Box<[f32]>,
  width: u32,
  height: u32,
  normalization: Normalization,
}

impl TensorFrame {
  pub fn with_shape(height: u32, width: u32, normalization: Normalization) -> Self {
    let size = RGB_CHANNELS * (width as usize) * (height as usize);
    Self {
      data: vec![0.0f32; size].into_boxed_slice(),
      width,
      height,
      normalization,
    }
  }

  pub fn from_rgb_image(image: &RgbImage, normalization: Normalization) -> Self {
    let (width, height) = image.dimensions();
    let mut frame = Self::with_shape(height, width, normalization);
    let plane_size = (width * height) as usize;
    let scale = normalization.scale();

    for (x, y, pixel) in image.enumerate_pixels() {
      let idx = (y * width + x) as usize;
      frame.data[idx] = pixel[0] as f32 * scale;
      frame.data[plane_size + idx] = pixel[1] as f32 * scale;
      frame.data[2 * plane_size + idx] = pixel[2] as f32 * scale;
    }
    frame
  }

  /// 还原为 RGB 图像，用于编码后发送给远程模型
  pub fn to_rgb_image(&self) -> RgbImage {
    let width = self.width as usize;
    let plane_size = width * self.height as usize;
    let scale = self.normalization.scale();
    let to_u8 = |v: f32| (v / scale).round().clamp(0.0, 255.0) as u8;

    ImageBuffer::from_fn(self.width, self.height, |x, y| {
      let idx = y as usize * width + x as usize;
      let r = to_u8(self.data[idx]);
      let g = to_u8(self.data[plane_size + idx]);
      let b = to_u8(self.data[2 * plane_size + idx]);
      Rgb([r, g, b])
    })
  }

  /// 张量形状 [N, C, H, W]
  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.height as usize, self.width as usize]
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn normalization(&self) -> Normalization {
    self.normalization
  }

  pub fn as_nchw(&self) -> &[f32] {
    &self.data
  }
}

impl AsMut<[f32]> for TensorFrame {
  fn as_mut(&mut self) -> &mut [f32] {
    &mut self.data
  }
}
