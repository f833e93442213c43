// 该文件是 Guangjian （光检） 项目的一部分。
// src/bin/match_predictions.rs - 预测与标注匹配
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use guangjian::{
  input::collect_images,
  matching::MatchConfig,
  output::exchange::{group_by_image, load_predictions, save_evaluation},
  task::match_dataset,
};

/// 把预测文件与 YOLO 格式标注匹配，写出评估 JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 预测结果文件
  #[arg(long, value_name = "FILE")]
  pub predictions: PathBuf,
  /// 标注目录，文件名为 `<图片名主干>.txt`
  #[arg(long, value_name = "DIR")]
  pub labels: PathBuf,
  /// 参与评估的图片或目录；未指定时使用预测文件中出现的图片
  #[arg(long, value_name = "SOURCE", num_args = 1..)]
  pub images: Vec<PathBuf>,
  /// 评估结果输出文件
  #[arg(long, default_value = "evaluation.json", value_name = "FILE")]
  pub output: PathBuf,
  /// healthy/damaged 分数都低于该值时判为背景
  #[arg(long, default_value = "0.4", value_name = "THRESHOLD")]
  pub confidence_threshold: f64,
  /// 匹配所需的最小 IoU
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub iou_threshold: f64,
  /// 并行线程数，默认为可用核数
  #[arg(long, value_name = "COUNT")]
  pub workers: Option<usize>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let predictions = group_by_image(load_predictions(&args.predictions)?);
  let images = if args.images.is_empty() {
    let mut images: Vec<PathBuf> = predictions.keys().map(PathBuf::from).collect();
    images.sort();
    images
  } else {
    collect_images(&args.images)?
  };

  let config = MatchConfig::default()
    .with_confidence_threshold(args.confidence_threshold)
    .with_iou_threshold(args.iou_threshold);
  let workers = args.workers.unwrap_or_else(|| {
    std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(1)
  });
  info!("匹配 {} 张图片，{} 个线程", images.len(), workers);

  let matched = match_dataset(&images, &predictions, &args.labels, &config, workers)?;
  save_evaluation(&args.output, &matched.records)?;

  Ok(())
}
