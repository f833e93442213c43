// 该文件是 Guangjian （光检） 项目的一部分。
// src/perturb.rs - 图像属性测量与扰动分组
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
  path::{Path, PathBuf},
  str::FromStr,
};

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::input::{InputError, image_id, load_image};

pub const MANIFEST_FILE: &str = "groups.json";

const BLUR_KERNEL_SCALE: f64 = 15.0;

#[derive(Error, Debug)]
pub enum PerturbError {
  #[error("未知的图像属性: {0}")]
  UnknownProperty(String),
  #[error("读写 {} 失败: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("分组清单 {} 格式错误: {source}", .path.display())]
  Manifest {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageProperty {
  Brightness,
  Contrast,
  Saturation,
  Blur,
}

impl ImageProperty {
  pub fn as_str(&self) -> &'static str {
    match self {
      ImageProperty::Brightness => "brightness",
      ImageProperty::Contrast => "contrast",
      ImageProperty::Saturation => "saturation",
      ImageProperty::Blur => "blur",
    }
  }
}

impl std::fmt::Display for ImageProperty {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ImageProperty {
  type Err = PerturbError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "brightness" => Ok(ImageProperty::Brightness),
      "contrast" => Ok(ImageProperty::Contrast),
      "saturation" => Ok(ImageProperty::Saturation),
      "blur" => Ok(ImageProperty::Blur),
      _ => Err(PerturbError::UnknownProperty(s.to_string())),
    }
  }
}

/// 图像的可测属性，除 sharpness 外都在 [0, 1] 内
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageProperties {
  pub brightness: f64,
  pub contrast: f64,
  pub saturation: f64,
  /// Sobel 梯度能量（Tenengrad）均值，越模糊越小
  pub sharpness: f64,
}

impl ImageProperties {
  /// 与扰动属性对应的测量值，blur 用 sharpness 表示
  pub fn value_of(&self, property: ImageProperty) -> f64 {
    match property {
      ImageProperty::Brightness => self.brightness,
      ImageProperty::Contrast => self.contrast,
      ImageProperty::Saturation => self.saturation,
      ImageProperty::Blur => self.sharpness,
    }
  }
}

fn luma(pixel: &Rgb<u8>) -> u8 {
  let [r, g, b] = pixel.0;
  (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64)
    .round()
    .clamp(0.0, 255.0) as u8
}

fn to_gray(image: &RgbImage) -> GrayImage {
  GrayImage::from_fn(image.width(), image.height(), |x, y| {
    Luma([luma(image.get_pixel(x, y))])
  })
}

/// 8 位 HSV 的 S 通道
fn hsv_saturation(pixel: &Rgb<u8>) -> f64 {
  let max = pixel.0.iter().copied().max().unwrap_or(0) as f64;
  let min = pixel.0.iter().copied().min().unwrap_or(0) as f64;
  if max > 0.0 {
    (255.0 * (max - min) / max).round()
  } else {
    0.0
  }
}

pub fn measure_properties(image: &RgbImage) -> ImageProperties {
  let count = (image.width() as u64 * image.height() as u64) as f64;
  if count == 0.0 {
    return ImageProperties::default();
  }

  let gray = to_gray(image);
  let mean = gray.pixels().map(|p| p[0] as f64).sum::<f64>() / count;
  let variance = gray
    .pixels()
    .map(|p| (p[0] as f64 - mean).powi(2))
    .sum::<f64>()
    / count;
  let saturation = image.pixels().map(hsv_saturation).sum::<f64>() / count;

  let gx = horizontal_sobel(&gray);
  let gy = vertical_sobel(&gray);
  let energy = gx
    .pixels()
    .zip(gy.pixels())
    .map(|(x, y)| {
      let (x, y) = (x[0] as f64 / 255.0, y[0] as f64 / 255.0);
      x * x + y * y
    })
    .sum::<f64>()
    / count;

  ImageProperties {
    brightness: mean / 255.0,
    contrast: variance.sqrt() / 255.0,
    saturation: saturation / 255.0,
    sharpness: energy,
  }
}

/// `out = degenerate + factor * (image - degenerate)`，逐通道裁剪到 [0, 255]
fn blend_with<F>(image: &RgbImage, factor: f64, degenerate: F) -> RgbImage
where
  F: Fn(&Rgb<u8>) -> [f64; 3],
{
  let mut out = image.clone();
  for pixel in out.pixels_mut() {
    let base = degenerate(pixel);
    for (channel, base) in pixel.0.iter_mut().zip(base) {
      let value = base + factor * (*channel as f64 - base);
      *channel = value.round().clamp(0.0, 255.0) as u8;
    }
  }
  out
}

pub fn adjust_brightness(image: &RgbImage, factor: f64) -> RgbImage {
  blend_with(image, factor, |_| [0.0; 3])
}

pub fn adjust_saturation(image: &RgbImage, factor: f64) -> RgbImage {
  blend_with(image, factor, |pixel| [luma(pixel) as f64; 3])
}

pub fn adjust_contrast(image: &RgbImage, factor: f64) -> RgbImage {
  let count = (image.width() as u64 * image.height() as u64).max(1) as f64;
  let mean = image.pixels().map(|p| luma(p) as f64).sum::<f64>() / count;
  let mean = mean.round();
  blend_with(image, factor, |_| [mean; 3])
}

/// 高斯模糊，核大小 `max(1, ⌊15·change⌋)` 取奇数，只用来推出 sigma。
/// `imageops::blur` 按 sigma 自行决定卷积范围，不截断到 k×k 窗口，
/// 因此模糊强度与固定 k×k 核的实现不完全一致，测得的清晰度也会有差异。
pub fn add_blur(image: &RgbImage, change: f64) -> RgbImage {
  let mut kernel = ((BLUR_KERNEL_SCALE * change) as i64).max(1);
  if kernel % 2 == 0 {
    kernel += 1;
  }
  if kernel == 1 {
    return image.clone();
  }
  let sigma = 0.3 * ((kernel - 1) as f64 * 0.5 - 1.0) + 0.8;
  image::imageops::blur(image, sigma as f32)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PerturbationLevel {
  /// 把属性调整到目标值
  Absolute { target: f64 },
  /// 按比例调整，`0.2` 表示 +20%
  Relative { change: f64 },
}

impl PerturbationLevel {
  pub fn group_name(&self, property: ImageProperty) -> String {
    match self {
      PerturbationLevel::Absolute { target } => format!("{}_{:.2}", property, target),
      PerturbationLevel::Relative { change } => format!("{}_rel_{:+.2}", property, change),
    }
  }

  pub fn analysis_dir_name(&self, property: ImageProperty) -> String {
    match self {
      PerturbationLevel::Absolute { .. } => format!("{}_analysis", property),
      PerturbationLevel::Relative { .. } => format!("{}_relative_analysis", property),
    }
  }

  pub fn target(&self) -> Option<f64> {
    match self {
      PerturbationLevel::Absolute { target } => Some(*target),
      PerturbationLevel::Relative { .. } => None,
    }
  }
}

/// 按扰动级别修改图像，`current` 为原图的测量值
pub fn apply_perturbation(
  image: &RgbImage,
  current: &ImageProperties,
  property: ImageProperty,
  level: PerturbationLevel,
) -> RgbImage {
  let factor = match (property, level) {
    (ImageProperty::Blur, PerturbationLevel::Absolute { .. }) => {
      warn!("blur 不支持绝对目标值，图像保持不变");
      return image.clone();
    }
    (ImageProperty::Blur, PerturbationLevel::Relative { change }) => {
      if change < 0.0 {
        warn!("忽略负的模糊变化 ({:+.2})，无法把模糊降到原图以下", change);
        return image.clone();
      }
      if change == 0.0 {
        return image.clone();
      }
      return add_blur(image, change);
    }
    (_, PerturbationLevel::Absolute { target }) => {
      let value = current.value_of(property);
      if value <= 0.0 {
        return image.clone();
      }
      target / value
    }
    (_, PerturbationLevel::Relative { change }) => {
      if change == 0.0 {
        return image.clone();
      }
      1.0 + change
    }
  };

  match property {
    ImageProperty::Brightness => adjust_brightness(image, factor),
    ImageProperty::Saturation => adjust_saturation(image, factor),
    ImageProperty::Contrast => adjust_contrast(image, factor),
    ImageProperty::Blur => image.clone(),
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbedImage {
  pub original_path: PathBuf,
  pub modified_path: PathBuf,
  pub original_properties: ImageProperties,
  pub actual_properties: ImageProperties,
  pub actual_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationGroup {
  pub name: String,
  pub property: ImageProperty,
  pub level: PerturbationLevel,
  pub directory: PathBuf,
  pub images: Vec<PerturbedImage>,
  pub actual_property_values: Vec<f64>,
}

/// 为一个扰动级别生成整组图像，单张失败只记录警告
pub fn create_group<P: AsRef<Path>>(
  base_dir: &Path,
  sources: &[P],
  property: ImageProperty,
  level: PerturbationLevel,
) -> Result<PerturbationGroup, PerturbError> {
  let name = level.group_name(property);
  let directory = base_dir.join(level.analysis_dir_name(property)).join(&name);
  std::fs::create_dir_all(&directory).map_err(|source| PerturbError::Io {
    path: directory.clone(),
    source,
  })?;
  info!("创建 {} 分组 {} ({} 张图片)", property, name, sources.len());

  let mut group = PerturbationGroup {
    name,
    property,
    level,
    directory,
    images: Vec::with_capacity(sources.len()),
    actual_property_values: Vec::with_capacity(sources.len()),
  };

  for source in sources {
    let original_path = source.as_ref();
    match perturb_one(original_path, &group.directory, property, level) {
      Ok(item) => {
        group.actual_property_values.push(item.actual_value);
        group.images.push(item);
      }
      Err(e) => warn!("跳过图片 {}: {}", original_path.display(), e),
    }
  }
  Ok(group)
}

#[derive(Error, Debug)]
enum PerturbItemError {
  #[error(transparent)]
  Input(#[from] InputError),
  #[error("保存图像失败: {0}")]
  Save(#[from] image::ImageError),
}

fn perturb_one(
  original_path: &Path,
  directory: &Path,
  property: ImageProperty,
  level: PerturbationLevel,
) -> Result<PerturbedImage, PerturbItemError> {
  let image = load_image(original_path)?;
  let original_properties = measure_properties(&image);
  let modified = apply_perturbation(&image, &original_properties, property, level);

  let modified_path = directory.join(image_id(original_path));
  modified.save(&modified_path)?;

  // 重新读取保存后的文件，计入编码损失
  let actual_properties = measure_properties(&load_image(&modified_path)?);
  Ok(PerturbedImage {
    original_path: original_path.to_path_buf(),
    modified_path,
    original_properties,
    actual_value: actual_properties.value_of(property),
    actual_properties,
  })
}

/// 一次扰动运行生成的全部分组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationManifest {
  pub property: ImageProperty,
  pub groups: Vec<PerturbationGroup>,
}

impl PerturbationManifest {
  pub fn load(path: &Path) -> Result<Self, PerturbError> {
    let content = std::fs::read_to_string(path).map_err(|source| PerturbError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    serde_json::from_str(&content).map_err(|source| PerturbError::Manifest {
      path: path.to_path_buf(),
      source,
    })
  }

  pub fn save(&self, path: &Path) -> Result<(), PerturbError> {
    let content = serde_json::to_string_pretty(self).map_err(|source| PerturbError::Manifest {
      path: path.to_path_buf(),
      source,
    })?;
    std::fs::write(path, content).map_err(|source| PerturbError::Io {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// 组内实际属性值的描述统计（总体标准差）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PropertyStatistics {
  pub min: f64,
  pub max: f64,
  pub mean: f64,
  pub std: f64,
  pub target: f64,
}

impl PropertyStatistics {
  pub fn from_values(values: &[f64], target: f64) -> Option<Self> {
    if values.is_empty() {
      return None;
    }
    let count = values.len() as f64;
    let mean = values.iter().sum::<f64>() / count;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count;
    Some(Self {
      min: values.iter().copied().fold(f64::INFINITY, f64::min),
      max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
      mean,
      std: variance.sqrt(),
      target,
    })
  }

  /// 只有绝对目标值的分组才有统计
  pub fn from_group(group: &PerturbationGroup) -> Option<Self> {
    let target = group.level.target()?;
    Self::from_values(&group.actual_property_values, target)
  }
}
