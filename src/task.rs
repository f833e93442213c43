// 该文件是 Guangjian （光检） 项目的一部分。
// src/task.rs - 批处理任务
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
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc,
  },
  thread,
  time::{Duration, Instant},
};

use tracing::{info, warn};

use crate::{
  input::{self, InputError, image_dimensions, label_path_for, load_ground_truth},
  matching::{MatchConfig, ObjectPrediction, match_image},
  metrics::{GroupMetrics, MetricsConfig},
  model::{FusedPrediction, GROUND_TRUTH_LABELS, Predictor},
  output::{
    exchange::{load_evaluation, save_predictions},
    report::GroupReportRow,
  },
  perturb::{PerturbationManifest, PropertyStatistics},
};

/// 每个扰动分组目录下的匹配结果文件
pub const EVALUATION_FILE: &str = "evaluation.json";

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 单个条目的失败记录
#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure {
  pub path: PathBuf,
  pub reason: String,
}

impl ItemFailure {
  fn new(path: &Path, reason: impl ToString) -> Self {
    Self {
      path: path.to_path_buf(),
      reason: reason.to_string(),
    }
  }
}

#[derive(Debug, Default)]
pub struct BatchReport {
  pub processed: usize,
  pub predictions: Vec<FusedPrediction>,
  pub failures: Vec<ItemFailure>,
  pub interrupted: bool,
}

/// 逐张调用预测器，结果写入预测交换文件。
/// 单张失败只记录，收到中断信号后在两张图片之间停止，已有结果仍然写出。
#[derive(Default, Debug)]
pub struct CollectPredictionsTask {
  max_images: Option<usize>,
  handle_interrupt: bool,
}

impl CollectPredictionsTask {
  pub fn with_max_images(mut self, max_images: Option<usize>) -> Self {
    self.max_images = max_images;
    self
  }

  /// 注册 Ctrl-C 处理，一个进程只能注册一次
  pub fn with_interrupt_handler(mut self, handle_interrupt: bool) -> Self {
    self.handle_interrupt = handle_interrupt;
    self
  }
}

impl<I, M, O> Task<I, M, O> for CollectPredictionsTask
where
  I: IntoIterator<Item = PathBuf>,
  M: Predictor,
  O: AsRef<Path>,
{
  type Output = BatchReport;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始收集预测...");
    let (tx, rx) = mpsc::channel();

    if self.handle_interrupt {
      ctrlc::set_handler(move || {
        info!("收到中断信号，准备退出...");
        let _ = tx.send(());
        thread::spawn(|| {
          thread::sleep(Duration::from_secs(30));
          warn!("强制退出程序");
          std::process::exit(1);
        });
      })?;
    } else {
      drop(tx);
    }

    let mut report = BatchReport::default();
    let started = Instant::now();
    for path in input {
      if self.max_images.is_some_and(|n| report.processed >= n) {
        info!("达到指定图片数 {}, 停止", report.processed);
        break;
      }
      if rx.try_recv().is_ok() {
        warn!("中断信号接收，停止收集");
        report.interrupted = true;
        break;
      }

      report.processed += 1;
      let image_id = path.to_string_lossy().into_owned();
      let now = Instant::now();
      match model.predict(&image_id, &path) {
        Ok(predictions) => {
          info!(
            "({}) {}: {} 个目标，耗时: {:.2?}",
            report.processed,
            image_id,
            predictions.len(),
            now.elapsed()
          );
          report.predictions.extend(predictions);
        }
        Err(e) => {
          warn!("({}) {} 预测失败: {}", report.processed, image_id, e);
          report.failures.push(ItemFailure::new(&path, e));
        }
      }
    }

    save_predictions(output.as_ref(), &report.predictions)?;
    info!(
      "收集完成: {} 张图片，{} 张失败，总耗时: {:.2?}",
      report.processed,
      report.failures.len(),
      started.elapsed()
    );
    Ok(report)
  }
}

#[derive(Debug, Default)]
pub struct DatasetMatch {
  pub records: Vec<ObjectPrediction>,
  pub skipped: Vec<ItemFailure>,
}

/// 预测文件中的 `image` 可能是完整路径，也可能只是文件名
fn predictions_for<'a>(
  predictions: &'a HashMap<String, Vec<FusedPrediction>>,
  path: &Path,
) -> &'a [FusedPrediction] {
  predictions
    .get(&*path.to_string_lossy())
    .or_else(|| predictions.get(&input::image_id(path)))
    .map(Vec::as_slice)
    .unwrap_or(&[])
}

fn match_one(
  path: &Path,
  predictions: &HashMap<String, Vec<FusedPrediction>>,
  labels_dir: &Path,
  config: &MatchConfig,
) -> Result<Vec<ObjectPrediction>, InputError> {
  let label_path = label_path_for(path, labels_dir);
  if !label_path.exists() {
    return Err(InputError::MissingLabel(label_path));
  }
  let (width, height) = image_dimensions(path)?;
  let ground_truth = load_ground_truth(&label_path, &GROUND_TRUTH_LABELS, width, height)?;
  let image_id = path.to_string_lossy();
  Ok(match_image(
    &image_id,
    predictions_for(predictions, path),
    &ground_truth,
    config,
  ))
}

/// 对整个数据集做匹配，图片之间并行，结果按输入顺序拼接。
/// 缺失或格式错误的标注、无法读取的图片跳过并记录；类别越界直接返回错误。
pub fn match_dataset(
  images: &[PathBuf],
  predictions: &HashMap<String, Vec<FusedPrediction>>,
  labels_dir: &Path,
  config: &MatchConfig,
  max_workers: usize,
) -> anyhow::Result<DatasetMatch> {
  let workers = max_workers.clamp(1, images.len().max(1));
  let next = AtomicUsize::new(0);
  let (tx, rx) = mpsc::channel();

  thread::scope(|scope| {
    for _ in 0..workers {
      let tx = tx.clone();
      let next = &next;
      scope.spawn(move || {
        loop {
          let index = next.fetch_add(1, Ordering::Relaxed);
          let Some(path) = images.get(index) else {
            break;
          };
          let result = match_one(path, predictions, labels_dir, config);
          if tx.send((index, result)).is_err() {
            break;
          }
        }
      });
    }
  });
  drop(tx);

  let mut results: Vec<_> = rx.into_iter().collect();
  results.sort_by_key(|(index, _)| *index);

  let mut matched = DatasetMatch::default();
  for (index, result) in results {
    let path = &images[index];
    match result {
      Ok(records) => matched.records.extend(records),
      Err(e) if e.is_data_consistency() => {
        return Err(anyhow::Error::new(e).context(format!("匹配 {} 失败", path.display())));
      }
      Err(e) => {
        warn!("跳过 {}: {}", path.display(), e);
        matched.skipped.push(ItemFailure::new(path, e));
      }
    }
  }
  info!(
    "匹配完成: {} 张图片，跳过 {} 张，{} 条记录",
    images.len(),
    matched.skipped.len(),
    matched.records.len()
  );
  Ok(matched)
}

/// 按清单顺序计算每个分组的指标，缺少匹配结果的分组跳过
pub fn group_metrics(
  manifest: &PerturbationManifest,
  config: &MetricsConfig,
) -> anyhow::Result<Vec<GroupReportRow>> {
  let mut rows = Vec::with_capacity(manifest.groups.len());
  for group in &manifest.groups {
    let path = group.directory.join(EVALUATION_FILE);
    if !path.exists() {
      warn!("分组 {} 缺少 {}, 跳过", group.name, path.display());
      continue;
    }
    let records = load_evaluation(&path)?;
    let metrics = GroupMetrics::compute(&records, config);
    info!(
      "分组 {}: {} 条记录，mAP50 {:.3}",
      group.name, metrics.sample_count, metrics.map.map_50
    );
    rows.push(GroupReportRow {
      group: group.name.clone(),
      property: group.property,
      level: group.level,
      metrics,
      statistics: PropertyStatistics::from_group(group),
    });
  }
  Ok(rows)
}

#[cfg(test)]
mod tests {
  use image::{Rgb, RgbImage};
  use thiserror::Error;

  use super::*;
  use crate::{
    geometry::BBox,
    model::ClassLabel,
    output::exchange::{load_predictions, save_evaluation},
    perturb::{ImageProperty, PerturbationGroup, PerturbationLevel},
  };

  #[derive(Debug, Error)]
  #[error("predictor unavailable")]
  struct Unavailable;

  struct FixedPredictor;

  impl Predictor for FixedPredictor {
    type Error = Unavailable;

    fn predict(&self, image_id: &str, path: &Path) -> Result<Vec<FusedPrediction>, Self::Error> {
      if path.to_string_lossy().contains("bad") {
        return Err(Unavailable);
      }
      Ok(vec![FusedPrediction {
        image: image_id.to_string(),
        bbox: BBox::new(55.0, 55.0, 145.0, 145.0),
        confidence: 0.9,
        cls_score: 0.8 / 0.9,
        damaged_score: 0.1,
        healthy_score: 0.8,
      }])
    }
  }

  #[test]
  fn collect_keeps_partial_results() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("predictions.json");
    let inputs = vec![
      PathBuf::from("a.jpg"),
      PathBuf::from("bad.jpg"),
      PathBuf::from("c.jpg"),
    ];

    let report = CollectPredictionsTask::default()
      .run_task(inputs, FixedPredictor, &output)
      .unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.predictions.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, PathBuf::from("bad.jpg"));
    assert!(!report.interrupted);

    let saved = load_predictions(&output).unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[1].image, "c.jpg");
  }

  #[test]
  fn collect_stops_at_max_images() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("predictions.json");
    let inputs = vec![PathBuf::from("a.jpg"), PathBuf::from("b.jpg")];
    let report = CollectPredictionsTask::default()
      .with_max_images(Some(1))
      .run_task(inputs, FixedPredictor, &output)
      .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(load_predictions(&output).unwrap().len(), 1);
  }

  fn write_dataset(dir: &Path) -> (PathBuf, Vec<PathBuf>) {
    let labels = dir.join("labels");
    std::fs::create_dir_all(&labels).unwrap();
    let mut images = Vec::new();
    for name in ["a", "b", "c", "d"] {
      let path = dir.join(format!("{}.png", name));
      RgbImage::from_pixel(200, 200, Rgb([10, 10, 10])).save(&path).unwrap();
      images.push(path);
    }
    // a: 一个 healthy；b: 缺少标注；c: 空文件；d: 一个 damaged
    std::fs::write(labels.join("a.txt"), "1 0.5 0.5 0.5 0.5\n").unwrap();
    std::fs::write(labels.join("c.txt"), "").unwrap();
    std::fs::write(labels.join("d.txt"), "0 0.25 0.25 0.1 0.1\n").unwrap();
    (labels, images)
  }

  #[test]
  fn match_dataset_skips_missing_labels_and_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let (labels, images) = write_dataset(dir.path());

    let mut predictions = HashMap::new();
    predictions.insert(
      "a.png".to_string(),
      FixedPredictor.predict("a.png", Path::new("a.png")).unwrap(),
    );

    let matched = match_dataset(&images, &predictions, &labels, &MatchConfig::default(), 3).unwrap();
    assert_eq!(matched.skipped.len(), 1);
    assert_eq!(matched.skipped[0].path, images[1]);

    assert_eq!(matched.records.len(), 2);
    let first = &matched.records[0];
    assert_eq!(first.actual, ClassLabel::Healthy);
    assert_eq!(first.predicted_label, ClassLabel::Healthy);
    let second = &matched.records[1];
    assert_eq!(second.actual, ClassLabel::Damaged);
    assert!(second.is_missed());
    assert_eq!(second.image, images[3].to_string_lossy());
  }

  #[test]
  fn out_of_range_class_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (labels, images) = write_dataset(dir.path());
    std::fs::write(labels.join("c.txt"), "7 0.5 0.5 0.1 0.1\n").unwrap();

    let err = match_dataset(&images, &HashMap::new(), &labels, &MatchConfig::default(), 2).unwrap_err();
    assert!(matches!(
      err.downcast_ref::<InputError>(),
      Some(InputError::ClassOutOfRange { class_id: 7, .. })
    ));
  }

  #[test]
  fn group_metrics_follow_manifest_order() {
    let dir = tempfile::tempdir().unwrap();
    let group = |name: &str, target: f64| PerturbationGroup {
      name: name.to_string(),
      property: ImageProperty::Brightness,
      level: PerturbationLevel::Absolute { target },
      directory: dir.path().join(name),
      images: Vec::new(),
      actual_property_values: vec![target - 0.01, target + 0.01],
    };
    let manifest = PerturbationManifest {
      property: ImageProperty::Brightness,
      groups: vec![
        group("brightness_0.40", 0.4),
        group("brightness_0.60", 0.6),
        group("brightness_0.80", 0.8),
      ],
    };

    let record = ObjectPrediction {
      image: "a.jpg".to_string(),
      actual: ClassLabel::Healthy,
      actual_bbox: Some(BBox::new(0.0, 0.0, 10.0, 10.0)),
      predicted_bbox: Some(BBox::new(0.0, 0.0, 10.0, 10.0)),
      predicted_label: ClassLabel::Healthy,
      score: 0.9,
      iou: 1.0,
      confidence: 0.9,
    };
    for name in ["brightness_0.80", "brightness_0.40"] {
      save_evaluation(&dir.path().join(name).join(EVALUATION_FILE), &[record.clone()]).unwrap();
    }

    let rows = group_metrics(&manifest, &MetricsConfig::default()).unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r.group.as_str()).collect();
    assert_eq!(names, vec!["brightness_0.40", "brightness_0.80"]);
    assert_eq!(rows[0].metrics.sample_count, 1);
    let stats = rows[1].statistics.unwrap();
    assert!((stats.mean - 0.8).abs() < 1e-9);
    assert_eq!(stats.target, 0.8);
  }
}
