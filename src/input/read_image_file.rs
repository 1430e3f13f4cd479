// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/input/read_image_file.rs - 单个图像文件输入
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

use tracing::error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{InputError, InputImage},
  url_path,
};

/// `image:///path/reef.jpg`，产生一张图像
pub struct ImageFileInput {
  path: PathBuf,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    }

    Ok(ImageFileInput {
      path: url_path(url),
    })
  }
}

impl ImageFileInput {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl IntoIterator for ImageFileInput {
  type Item = Result<InputImage, InputError>;
  type IntoIter = std::option::IntoIter<Result<InputImage, InputError>>;

  /// 解码延迟到迭代时进行
  fn into_iter(self) -> Self::IntoIter {
    Some(InputImage::open(&self.path)).into_iter()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::Image;

  #[test]
  fn yields_single_named_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reef 01.png");
    Image::new(5, 3).save(&path).unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let url = Url::parse(&url.as_str().replacen("file:", "image:", 1)).unwrap();
    let images: Vec<_> = ImageFileInput::from_url(&url).unwrap().into_iter().collect();
    assert_eq!(images.len(), 1);
    let image = images.into_iter().next().unwrap().unwrap();
    assert_eq!(image.name, "reef 01");
    assert_eq!(image.image.dimensions(), (5, 3));
  }
}
