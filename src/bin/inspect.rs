// 该文件是 Guangjian （光检） 项目的一部分。
// src/bin/inspect.rs - 单张图片级联推理
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
use tracing::info;
use url::Url;

use guangjian::{
  FromUrl,
  cascade::{CascadeConfig, CascadeOrchestrator},
  frame::Normalization,
  input::{GroundTruthBox, image_id, label_path_for, load_ground_truth, load_image},
  model::{GROUND_TRUTH_LABELS, RemoteModelBuilder},
};

/// 对一张图片运行“检测 + 分类”级联
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测服务地址，可带 `?timeout=<秒>`
  #[arg(long, value_name = "URL")]
  pub detector: Url,
  /// 分类服务地址，可带 `?timeout=<秒>`
  #[arg(long, value_name = "URL")]
  pub classifier: Url,
  /// 输入图片
  #[arg(long, value_name = "IMAGE")]
  pub input: PathBuf,
  /// 标注图输出，例如 image:///tmp/out.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,
  /// 标注目录，提供时把真值框一起画出
  #[arg(long, value_name = "DIR")]
  pub labels: Option<PathBuf>,
  /// 检测模型输入边长
  #[arg(long, default_value = "640", value_name = "SIZE")]
  pub detector_size: u32,
  /// 分类模型输入边长
  #[arg(long, default_value = "380", value_name = "SIZE")]
  pub classifier_size: u32,
  /// 分类输入归一化到 [0, 1]
  #[arg(long)]
  pub unit_range_crops: bool,
  /// 同时进行的分类请求上限
  #[arg(long, default_value = "8", value_name = "COUNT")]
  pub max_concurrency: usize,
  /// 预测框着色使用的背景阈值
  #[arg(long, default_value = "0.4", value_name = "THRESHOLD")]
  pub confidence_threshold: f64,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("检测服务: {}", args.detector);
  info!("分类服务: {}", args.classifier);
  info!("输入图片: {}", args.input.display());

  let detector = RemoteModelBuilder::from_url(&args.detector)?.build_detector()?;
  let classifier = RemoteModelBuilder::from_url(&args.classifier)?.build_classifier()?;
  let normalization = if args.unit_range_crops {
    Normalization::UnitRange
  } else {
    Normalization::Raw
  };
  let config = CascadeConfig::default()
    .with_detector_input_size(args.detector_size)
    .with_classifier_input_size(args.classifier_size)
    .with_classifier_normalization(normalization)
    .with_max_concurrency(args.max_concurrency);
  let cascade = CascadeOrchestrator::new(detector, classifier).with_config(config)?;

  let image = load_image(&args.input)?;
  let now = std::time::Instant::now();
  let predictions = cascade
    .run(&image_id(&args.input), &image)
    .with_context(|| format!("推理 {} 失败", args.input.display()))?;
  info!("推理完成，{} 个目标，耗时: {:.2?}", predictions.len(), now.elapsed());
  for (index, p) in predictions.iter().enumerate() {
    info!(
      "#{} [{}, {}, {}, {}] conf {:.3} cls {:.3} healthy {:.3} damaged {:.3}",
      index,
      p.bbox.x1(),
      p.bbox.y1(),
      p.bbox.x2(),
      p.bbox.y2(),
      p.confidence,
      p.cls_score,
      p.healthy_score,
      p.damaged_score
    );
  }

  let ground_truth: Vec<GroundTruthBox> = match &args.labels {
    Some(dir) => load_ground_truth(
      &label_path_for(&args.input, dir),
      &GROUND_TRUTH_LABELS,
      image.width(),
      image.height(),
    )?,
    None => Vec::new(),
  };

  if let Some(output) = &args.output {
    render(output, &image, ground_truth, predictions, &args)?;
  }

  Ok(())
}

#[cfg(feature = "save_image_file")]
fn render(
  output: &Url,
  image: &image::RgbImage,
  ground_truth: Vec<GroundTruthBox>,
  predictions: Vec<guangjian::model::FusedPrediction>,
  args: &Args,
) -> Result<()> {
  use guangjian::{
    matching::MatchConfig,
    output::{Render, SaveImageFileOutput, draw::Annotations},
  };

  let match_config = MatchConfig::default().with_confidence_threshold(args.confidence_threshold);
  let output = SaveImageFileOutput::from_url(output)?.with_match_config(match_config);
  output.render_result(
    image,
    &Annotations {
      ground_truth,
      predictions,
    },
  )?;
  Ok(())
}

#[cfg(not(feature = "save_image_file"))]
fn render(
  output: &Url,
  _image: &image::RgbImage,
  _ground_truth: Vec<GroundTruthBox>,
  _predictions: Vec<guangjian::model::FusedPrediction>,
  _args: &Args,
) -> Result<()> {
  tracing::warn!("未启用 save_image_file 功能，忽略输出 {}", output);
  Ok(())
}
