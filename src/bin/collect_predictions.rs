// 该文件是 Guangjian （光检） 项目的一部分。
// src/bin/collect_predictions.rs - 批量收集预测结果
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

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use guangjian::{
  FromUrl,
  cascade::{CascadeConfig, CascadeOrchestrator},
  input::collect_images,
  model::{PipelineClientBuilder, Predictor, RemoteModelBuilder},
  task::{BatchReport, CollectPredictionsTask, Task},
};

/// 对一批图片收集融合预测，写出预测 JSON
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入图片或目录（目录按文件名排序，不递归）
  #[arg(long, value_name = "SOURCE", num_args = 1.., required = true)]
  pub input: Vec<PathBuf>,
  /// 预测结果输出文件
  #[arg(long, default_value = "predictions.json", value_name = "FILE")]
  pub output: PathBuf,
  /// 远程完整级联服务地址；未指定时读取 PREDICTION_URL 环境变量
  #[arg(long, value_name = "URL", conflicts_with_all = ["detector", "classifier"])]
  pub pipeline: Option<Url>,
  /// 本地级联使用的检测服务地址
  #[arg(long, value_name = "URL", requires = "classifier")]
  pub detector: Option<Url>,
  /// 本地级联使用的分类服务地址
  #[arg(long, value_name = "URL", requires = "detector")]
  pub classifier: Option<Url>,
  /// 请求超时（秒），覆盖 URL 中的 timeout 参数
  #[arg(long, value_name = "SECONDS")]
  pub timeout: Option<f64>,
  /// 同时进行的分类请求上限
  #[arg(long, default_value = "8", value_name = "COUNT")]
  pub max_concurrency: usize,
  /// 最多处理的图片数
  #[arg(long, value_name = "COUNT")]
  pub max_images: Option<usize>,
}

fn run<M: Predictor>(model: M, images: Vec<PathBuf>, args: &Args) -> Result<BatchReport> {
  CollectPredictionsTask::default()
    .with_max_images(args.max_images)
    .with_interrupt_handler(true)
    .run_task(images, model, &args.output)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let timeout = match args.timeout {
    Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
    Some(secs) => bail!("无效的超时: {}", secs),
    None => None,
  };

  let images = collect_images(&args.input)?;
  info!("共 {} 张图片，输出到 {}", images.len(), args.output.display());

  let report = match (&args.detector, &args.classifier) {
    (Some(detector), Some(classifier)) => {
      let mut detector = RemoteModelBuilder::from_url(detector)?;
      let mut classifier = RemoteModelBuilder::from_url(classifier)?;
      if let Some(timeout) = timeout {
        detector = detector.timeout(timeout);
        classifier = classifier.timeout(timeout);
      }
      let config = CascadeConfig::default().with_max_concurrency(args.max_concurrency);
      let cascade = CascadeOrchestrator::new(detector.build_detector()?, classifier.build_classifier()?)
        .with_config(config)?;
      run(cascade, images, &args)?
    }
    _ => {
      let mut builder = match &args.pipeline {
        Some(url) => PipelineClientBuilder::from_url(url)?,
        None => PipelineClientBuilder::from_env()?,
      };
      if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
      }
      run(builder.build()?, images, &args)?
    }
  };

  for failure in &report.failures {
    warn!("失败: {}: {}", failure.path.display(), failure.reason);
  }
  if report.interrupted {
    warn!("任务被中断，已写出部分结果");
  }
  info!(
    "{} 条预测，{} 张图片失败",
    report.predictions.len(),
    report.failures.len()
  );

  Ok(())
}
