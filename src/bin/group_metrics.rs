// 该文件是 Guangjian （光检） 项目的一部分。
// src/bin/group_metrics.rs - 扰动分组指标
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

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use guangjian::{
  matching::MatchConfig,
  metrics::MetricsConfig,
  output::{
    exchange::{group_by_image, load_predictions, save_evaluation},
    report::GroupMetricsReport,
  },
  perturb::PerturbationManifest,
  task::{EVALUATION_FILE, group_metrics, match_dataset},
};

/// 读取分组清单，计算每个分组的分类与检测指标
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 分组清单 groups.json
  #[arg(long, value_name = "FILE")]
  pub manifest: PathBuf,
  /// 报告输出文件，默认与清单同目录
  #[arg(long, value_name = "FILE")]
  pub output: Option<PathBuf>,
  /// 标注目录；提供时先把分组目录下的 predictions.json 匹配成 evaluation.json
  #[arg(long, value_name = "DIR")]
  pub labels: Option<PathBuf>,
  /// 分组目录下的预测文件名
  #[arg(long, default_value = "predictions.json", value_name = "NAME")]
  pub predictions_name: String,
  /// healthy/damaged 分数都低于该值时判为背景
  #[arg(long, default_value = "0.4", value_name = "THRESHOLD")]
  pub confidence_threshold: f64,
  /// 匹配所需的最小 IoU
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub iou_threshold: f64,
  /// mAP 的 IoU 起点
  #[arg(long, default_value = "0.5", value_name = "IOU")]
  pub map_iou_start: f64,
  /// mAP 的 IoU 步长
  #[arg(long, default_value = "0.05", value_name = "STEP")]
  pub map_iou_step: f64,
  /// mAP 的 IoU 阈值个数
  #[arg(long, default_value = "10", value_name = "COUNT")]
  pub map_iou_steps: usize,
  /// 分类分数的 healthy/damaged 分界
  #[arg(long, default_value = "0.5", value_name = "SCORE")]
  pub score_split: f64,
  /// 匹配时的并行线程数
  #[arg(long, default_value = "4", value_name = "COUNT")]
  pub workers: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let manifest = PerturbationManifest::load(&args.manifest)?;
  info!("{} 个 {} 分组", manifest.groups.len(), manifest.property);

  let match_config = MatchConfig::default()
    .with_confidence_threshold(args.confidence_threshold)
    .with_iou_threshold(args.iou_threshold);
  let metrics_config = MetricsConfig::default()
    .with_iou_sweep(args.map_iou_start, args.map_iou_step, args.map_iou_steps)
    .with_score_split(args.score_split);

  if let Some(labels) = &args.labels {
    for group in &manifest.groups {
      let predictions_path = group.directory.join(&args.predictions_name);
      if !predictions_path.exists() {
        warn!("分组 {} 缺少 {}, 不做匹配", group.name, predictions_path.display());
        continue;
      }
      let predictions = group_by_image(load_predictions(&predictions_path)?);
      let images: Vec<PathBuf> = group.images.iter().map(|i| i.modified_path.clone()).collect();
      let matched = match_dataset(&images, &predictions, labels, &match_config, args.workers)
        .with_context(|| format!("分组 {} 匹配失败", group.name))?;
      save_evaluation(&group.directory.join(EVALUATION_FILE), &matched.records)?;
    }
  }

  let rows = group_metrics(&manifest, &metrics_config)?;
  let report = GroupMetricsReport::new(manifest.property, match_config, metrics_config, rows);
  report.log_table();

  let output = args.output.unwrap_or_else(|| {
    args
      .manifest
      .parent()
      .map(|dir| dir.join("group_metrics.json"))
      .unwrap_or_else(|| PathBuf::from("group_metrics.json"))
  });
  report.save(&output)?;

  Ok(())
}
