// 该文件是 Guangjian （光检） 项目的一部分。
// src/model/remote.rs - 基于 HTTP 的远程检测/分类服务
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

use std::{io::Cursor, path::Path, time::Duration};

use image::ImageFormat;
use reqwest::blocking::{
  Client,
  multipart::{Form, Part},
};
use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl,
  frame::TensorFrame,
  model::{Classifier, Detector, FusedPrediction, Predictor, RawDetection},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const TIMEOUT_QUERY_KEY: &str = "timeout";
const IMAGE_FIELD: &str = "image";

pub const DEFAULT_PREDICTION_URL: &str = "http://localhost:3000/predict";
pub const PREDICTION_URL_ENV: &str = "PREDICTION_URL";

#[derive(Error, Debug)]
pub enum RemoteModelError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("无效的 URL: {0}")]
  InvalidUrl(String),
  #[error("请求超时: {0}")]
  Timeout(String),
  #[error("服务返回错误状态 {0}: {1}")]
  Status(u16, String),
  #[error("请求失败: {0}")]
  Transport(reqwest::Error),
  #[error("响应解析失败: {0}")]
  Decode(String),
  #[error("图像编码失败: {0}")]
  Encode(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for RemoteModelError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      let target = err.url().map(Url::to_string).unwrap_or_default();
      RemoteModelError::Timeout(target)
    } else {
      RemoteModelError::Transport(err)
    }
  }
}

impl RemoteModelError {
  pub fn is_timeout(&self) -> bool {
    matches!(self, RemoteModelError::Timeout(_))
  }
}

/// 单个 HTTP 端点，所有远程模型共用的请求逻辑
#[derive(Debug, Clone)]
struct Endpoint {
  client: Client,
  url: Url,
}

impl Endpoint {
  fn new(url: Url, timeout: Duration) -> Result<Self, RemoteModelError> {
    let client = Client::builder().timeout(timeout).build()?;
    Ok(Self { client, url })
  }

  fn post_image<T: DeserializeOwned>(
    &self,
    body: Vec<u8>,
    file_name: &str,
    mime: &str,
  ) -> Result<T, RemoteModelError> {
    let part = Part::bytes(body)
      .file_name(file_name.to_string())
      .mime_str(mime)?;
    let form = Form::new().part(IMAGE_FIELD, part);

    let now = std::time::Instant::now();
    let response = self.client.post(self.url.clone()).multipart(form).send()?;
    let status = response.status();
    if !status.is_success() {
      let text = response.text().unwrap_or_default();
      warn!("服务 {} 返回错误状态: {}", self.url, status);
      return Err(RemoteModelError::Status(status.as_u16(), text));
    }

    let bytes = response.bytes()?;
    debug!("请求 {} 完成，耗时: {:.2?}", self.url, now.elapsed());
    serde_json::from_slice(&bytes).map_err(|e| RemoteModelError::Decode(e.to_string()))
  }

  fn post_tensor<T: DeserializeOwned>(&self, tensor: &TensorFrame) -> Result<T, RemoteModelError> {
    let image = tensor.to_rgb_image();
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    self.post_image(buffer.into_inner(), "image.png", "image/png")
  }
}

/// 远程模型构建器，URL 形如 `http://host:port/detect?timeout=10`
pub struct RemoteModelBuilder {
  url: Url,
  timeout: Duration,
}

fn check_http_scheme(url: &Url) -> Result<(), RemoteModelError> {
  match url.scheme() {
    "http" | "https" => Ok(()),
    other => Err(RemoteModelError::SchemeMismatch(format!(
      "期望 'http' 或 'https', 实际为 '{}'",
      other
    ))),
  }
}

/// 取出 `timeout` 查询参数（单位秒），并返回去掉该参数后的 URL
fn split_timeout(url: &Url) -> Result<(Url, Option<Duration>), RemoteModelError> {
  let mut timeout = None;
  let mut rest = Vec::new();
  for (key, value) in url.query_pairs() {
    if key == TIMEOUT_QUERY_KEY {
      let secs = value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .ok_or_else(|| RemoteModelError::InvalidUrl(format!("无效的超时参数: {}", value)))?;
      timeout = Some(Duration::from_secs_f64(secs));
    } else {
      rest.push((key.into_owned(), value.into_owned()));
    }
  }

  let mut stripped = url.clone();
  if rest.is_empty() {
    stripped.set_query(None);
  } else {
    stripped.query_pairs_mut().clear().extend_pairs(rest);
  }
  Ok((stripped, timeout))
}

impl FromUrl for RemoteModelBuilder {
  type Error = RemoteModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_http_scheme(url)?;
    let (url, timeout) = split_timeout(url)?;
    Ok(RemoteModelBuilder {
      url,
      timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
    })
  }
}

impl RemoteModelBuilder {
  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn build_detector(self) -> Result<RemoteDetector, RemoteModelError> {
    info!("远程检测服务: {} (超时 {:.2?})", self.url, self.timeout);
    Ok(RemoteDetector {
      endpoint: Endpoint::new(self.url, self.timeout)?,
    })
  }

  pub fn build_classifier(self) -> Result<RemoteClassifier, RemoteModelError> {
    info!("远程分类服务: {} (超时 {:.2?})", self.url, self.timeout);
    Ok(RemoteClassifier {
      endpoint: Endpoint::new(self.url, self.timeout)?,
    })
  }
}

/// 远程检测模型，响应为 `[[x1, y1, x2, y2, confidence, class_id], ...]`
#[derive(Debug, Clone)]
pub struct RemoteDetector {
  endpoint: Endpoint,
}

impl Detector for RemoteDetector {
  type Error = RemoteModelError;

  fn detect(&self, input: &TensorFrame) -> Result<Vec<RawDetection>, Self::Error> {
    let rows: Vec<[f32; 6]> = self.endpoint.post_tensor(input)?;
    Ok(
      rows
        .into_iter()
        .map(|row| RawDetection {
          bbox: [row[0], row[1], row[2], row[3]],
          confidence: row[4],
          class_id: row[5].max(0.0) as u32,
        })
        .collect(),
    )
  }
}

#[derive(Debug, Deserialize)]
struct ClassifierScore {
  score: f32,
}

/// 远程分类模型，响应为 `[{"score": <f>}]`
#[derive(Debug, Clone)]
pub struct RemoteClassifier {
  endpoint: Endpoint,
}

impl Classifier for RemoteClassifier {
  type Error = RemoteModelError;

  fn classify(&self, crop: &TensorFrame) -> Result<f32, Self::Error> {
    let scores: Vec<ClassifierScore> = self.endpoint.post_tensor(crop)?;
    scores
      .first()
      .map(|s| s.score)
      .ok_or_else(|| RemoteModelError::Decode("分类服务返回空结果".to_string()))
  }
}

/// 远程完整级联服务客户端
pub struct PipelineClientBuilder {
  inner: RemoteModelBuilder,
}

impl FromUrl for PipelineClientBuilder {
  type Error = RemoteModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    Ok(PipelineClientBuilder {
      inner: RemoteModelBuilder::from_url(url)?,
    })
  }
}

impl PipelineClientBuilder {
  /// 读取 `PREDICTION_URL` 环境变量，未设置时使用本地默认地址
  pub fn from_env() -> Result<Self, RemoteModelError> {
    let raw = std::env::var(PREDICTION_URL_ENV).unwrap_or_else(|_| DEFAULT_PREDICTION_URL.to_string());
    let url = Url::parse(&raw).map_err(|e| RemoteModelError::InvalidUrl(format!("{}: {}", raw, e)))?;
    Self::from_url(&url)
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.inner = self.inner.timeout(timeout);
    self
  }

  pub fn build(self) -> Result<PipelineClient, RemoteModelError> {
    info!("远程预测服务: {} (超时 {:.2?})", self.inner.url, self.inner.timeout);
    Ok(PipelineClient {
      endpoint: Endpoint::new(self.inner.url, self.inner.timeout)?,
    })
  }
}

#[derive(Debug, Clone)]
pub struct PipelineClient {
  endpoint: Endpoint,
}

impl Predictor for PipelineClient {
  type Error = RemoteModelError;

  fn predict(&self, image_id: &str, path: &Path) -> Result<Vec<FusedPrediction>, Self::Error> {
    let body = std::fs::read(path)?;
    let mime = match path.extension().and_then(|e| e.to_str()) {
      Some(ext) if ext.eq_ignore_ascii_case("png") => "image/png",
      _ => "image/jpeg",
    };
    let file_name = path
      .file_name()
      .and_then(|n| n.to_str())
      .unwrap_or(image_id);

    let mut predictions: Vec<FusedPrediction> = self.endpoint.post_image(body, file_name, mime)?;
    for prediction in &mut predictions {
      prediction.image = image_id.to_string();
    }
    Ok(predictions)
  }
}
