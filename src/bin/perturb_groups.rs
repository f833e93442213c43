// 该文件是 Guangjian （光检） 项目的一部分。
// src/bin/perturb_groups.rs - 生成扰动分组
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

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;

use guangjian::{
  input::collect_images,
  perturb::{
    ImageProperty, MANIFEST_FILE, PerturbationLevel, PerturbationManifest, PropertyStatistics,
    create_group,
  },
};

/// 按属性生成扰动图像分组，并写出分组清单
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 原始图片或目录
  #[arg(long, value_name = "SOURCE", num_args = 1.., required = true)]
  pub input: Vec<PathBuf>,
  /// 输出根目录
  #[arg(long, value_name = "DIR")]
  pub output: PathBuf,
  /// 图像属性: brightness, contrast, saturation, blur
  #[arg(long, value_name = "PROPERTY")]
  pub property: ImageProperty,
  /// 绝对目标值，逗号分隔，例如 0.2,0.4,0.6
  #[arg(long, value_name = "TARGETS", value_delimiter = ',')]
  pub targets: Vec<f64>,
  /// 相对变化，逗号分隔，例如 -0.4,-0.2,0.2
  #[arg(long, value_name = "CHANGES", value_delimiter = ',', allow_negative_numbers = true)]
  pub relative: Vec<f64>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let levels: Vec<PerturbationLevel> = args
    .targets
    .iter()
    .map(|&target| PerturbationLevel::Absolute { target })
    .chain(
      args
        .relative
        .iter()
        .map(|&change| PerturbationLevel::Relative { change }),
    )
    .collect();
  if levels.is_empty() {
    bail!("至少需要一个 --targets 或 --relative 级别");
  }

  let images = collect_images(&args.input)?;
  info!("{} 张原始图片，{} 个 {} 级别", images.len(), levels.len(), args.property);

  let mut manifest = PerturbationManifest {
    property: args.property,
    groups: Vec::with_capacity(levels.len()),
  };
  for level in levels {
    let group = create_group(&args.output, &images, args.property, level)?;
    if let Some(stats) = PropertyStatistics::from_group(&group) {
      info!(
        "{}: 目标 {:.3}，实际 {:.3} ± {:.3} [{:.3}, {:.3}]",
        group.name, stats.target, stats.mean, stats.std, stats.min, stats.max
      );
    } else {
      info!("{}: {} 张图片", group.name, group.images.len());
    }
    manifest.groups.push(group);
  }

  let manifest_path = args.output.join(MANIFEST_FILE);
  manifest.save(&manifest_path)?;
  info!("分组清单已写出: {}", manifest_path.display());

  Ok(())
}
