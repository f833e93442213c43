// 该文件是 Guangjian （光检） 项目的一部分。
// src/output/report.rs - 扰动分组指标报告
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

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer, ser::SerializeMap};
use tracing::info;

use crate::{
  matching::MatchConfig,
  metrics::{GroupMetrics, MetricsConfig},
  output::exchange::{ExchangeError, write_json},
  perturb::{ImageProperty, PerturbationLevel, PropertyStatistics},
};

/// 报告中的一行，对应一个扰动分组
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReportRow {
  pub group: String,
  pub property: ImageProperty,
  pub level: PerturbationLevel,
  pub metrics: GroupMetrics,
  pub statistics: Option<PropertyStatistics>,
}

// 列名带属性名前缀（如 `min_brightness`），只能手写
impl Serialize for GroupReportRow {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let property = self.property.as_str();
    let classification = &self.metrics.classification;
    let mut map = serializer.serialize_map(None)?;

    map.serialize_entry("group", &self.group)?;
    if let PerturbationLevel::Relative { change } = self.level {
      map.serialize_entry("relative_change", &change)?;
    }
    map.serialize_entry("precision_healthy", &classification.precision_healthy)?;
    map.serialize_entry("precision_damaged", &classification.precision_damaged)?;
    map.serialize_entry("recall_healthy", &classification.recall_healthy)?;
    map.serialize_entry("recall_damaged", &classification.recall_damaged)?;
    map.serialize_entry("f1_healthy", &classification.f1_healthy)?;
    map.serialize_entry("f1_damaged", &classification.f1_damaged)?;
    map.serialize_entry("mAP_50", &self.metrics.map.map_50)?;
    map.serialize_entry("mAP_50_95", &self.metrics.map.map_50_95)?;

    if let Some(stats) = &self.statistics {
      map.serialize_entry(&format!("min_{}", property), &stats.min)?;
      map.serialize_entry(&format!("max_{}", property), &stats.max)?;
      map.serialize_entry(&format!("mean_{}", property), &stats.mean)?;
      map.serialize_entry(&format!("std_{}", property), &stats.std)?;
      map.serialize_entry(&format!("target_{}", property), &stats.target)?;
    }
    map.serialize_entry("sample_count", &self.metrics.sample_count)?;
    map.end()
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupMetricsReport {
  pub generated_at: DateTime<Utc>,
  pub property: ImageProperty,
  pub match_config: MatchConfig,
  pub metrics_config: MetricsConfig,
  pub groups: Vec<GroupReportRow>,
}

impl GroupMetricsReport {
  pub fn new(
    property: ImageProperty,
    match_config: MatchConfig,
    metrics_config: MetricsConfig,
    groups: Vec<GroupReportRow>,
  ) -> Self {
    Self {
      generated_at: Utc::now(),
      property,
      match_config,
      metrics_config,
      groups,
    }
  }

  pub fn save(&self, path: &Path) -> Result<(), ExchangeError> {
    write_json(path, self)?;
    info!("指标报告已写出: {}", path.display());
    Ok(())
  }

  /// 以表格形式输出到日志
  pub fn log_table(&self) {
    info!(
      "{:<28} {:>7} {:>7} {:>7} {:>7} {:>7} {:>9} {:>7}",
      "group", "P(h)", "P(d)", "R(h)", "R(d)", "mAP50", "mAP50-95", "n"
    );
    for row in &self.groups {
      let c = &row.metrics.classification;
      info!(
        "{:<28} {:>7.3} {:>7.3} {:>7.3} {:>7.3} {:>7.3} {:>9.3} {:>7}",
        row.group,
        c.precision_healthy,
        c.precision_damaged,
        c.recall_healthy,
        c.recall_damaged,
        row.metrics.map.map_50,
        row.metrics.map.map_50_95,
        row.metrics.sample_count
      );
    }
  }
}
