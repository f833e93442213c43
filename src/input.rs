// 该文件是 Guangjian （光检） 项目的一部分。
// src/input.rs - 图像与标注输入
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

use std::path::{Path, PathBuf};

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, warn};

mod label_file;
pub use self::label_file::{GroundTruthBox, load_ground_truth, parse_label_line};

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum InputError {
  #[error("读取 {} 失败: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("解码图像 {} 失败: {source}", .path.display())]
  Image {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
  #[error("缺少标注文件: {}", .0.display())]
  MissingLabel(PathBuf),
  #[error("标注文件 {} 第 {line} 行格式错误: {reason}", .path.display())]
  MalformedLabel {
    path: PathBuf,
    line: usize,
    reason: String,
  },
  #[error(
    "标注文件 {} 第 {line} 行类别 {class_id} 超出范围 (共 {num_classes} 类)",
    .path.display()
  )]
  ClassOutOfRange {
    path: PathBuf,
    line: usize,
    class_id: i64,
    num_classes: usize,
  },
}

impl InputError {
  pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
    InputError::Io {
      path: path.to_path_buf(),
      source,
    }
  }

  pub(crate) fn image(path: &Path, source: image::ImageError) -> Self {
    InputError::Image {
      path: path.to_path_buf(),
      source,
    }
  }

  /// 数据本身有缺陷（而非运行时问题），批处理遇到时应当中止
  pub fn is_data_consistency(&self) -> bool {
    matches!(self, InputError::ClassOutOfRange { .. })
  }
}

fn has_image_extension(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// 收集输入图片：文件直接加入，目录按文件名排序展开（不递归）
pub fn collect_images<P: AsRef<Path>>(sources: &[P]) -> Result<Vec<PathBuf>, InputError> {
  let mut images = Vec::new();
  for source in sources {
    let source = source.as_ref();
    if source.is_dir() {
      let entries = std::fs::read_dir(source).map_err(|e| InputError::io(source, e))?;
      let mut found = Vec::new();
      for entry in entries {
        let path = entry.map_err(|e| InputError::io(source, e))?.path();
        if path.is_file() && has_image_extension(&path) {
          found.push(path);
        }
      }
      found.sort();
      debug!("目录 {} 中找到 {} 张图片", source.display(), found.len());
      images.extend(found);
    } else if source.is_file() {
      if !has_image_extension(source) {
        warn!("文件扩展名不是常见图片格式: {}", source.display());
      }
      images.push(source.to_path_buf());
    } else {
      return Err(InputError::io(
        source,
        std::io::Error::new(std::io::ErrorKind::NotFound, "输入路径不存在"),
      ));
    }
  }
  Ok(images)
}

/// 图片标识，取文件名
pub fn image_id(path: &Path) -> String {
  path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

pub fn load_image(path: &Path) -> Result<RgbImage, InputError> {
  let image = ImageReader::open(path)
    .map_err(|e| InputError::io(path, e))?
    .with_guessed_format()
    .map_err(|e| InputError::io(path, e))?
    .decode()
    .map_err(|e| InputError::image(path, e))?;
  Ok(image.to_rgb8())
}

/// 只读取图片头部得到 (宽, 高)
pub fn image_dimensions(path: &Path) -> Result<(u32, u32), InputError> {
  image::image_dimensions(path).map_err(|e| InputError::image(path, e))
}

/// `labels_dir/<图片文件名主干>.txt`
pub fn label_path_for(image: &Path, labels_dir: &Path) -> PathBuf {
  let stem = image
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_default();
  labels_dir.join(format!("{}.txt", stem))
}
