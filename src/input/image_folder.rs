// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/input/image_folder.rs - 目录图像输入
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

use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  input::{InputError, InputImage},
  url_path,
};

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// `folder:///path/survey`：目录下所有 png/jpeg 文件，按文件名排序，不递归
pub struct ImageFolderInput {
  files: Vec<PathBuf>,
}

impl FromUrlWithScheme for ImageFolderInput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for ImageFolderInput {
  type Error = InputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(InputError::SchemeMismatch(url.scheme().to_string()));
    }
    Self::open(url_path(url))
  }
}

impl ImageFolderInput {
  pub fn open(directory: impl Into<PathBuf>) -> Result<Self, InputError> {
    let directory = directory.into();
    let io_error = |e| InputError::Io {
      path: directory.clone(),
      source: e,
    };

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&directory).map_err(io_error)? {
      let path = entry.map_err(io_error)?.path();
      let is_image = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
      if path.is_file() && is_image {
        files.push(path);
      } else {
        debug!("跳过非图像文件: {}", path.display());
      }
    }
    files.sort();
    info!("目录 {} 中有 {} 张图像", directory.display(), files.len());
    Ok(Self { files })
  }

  pub fn len(&self) -> usize {
    self.files.len()
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty()
  }
}

pub struct ImageFolderIter {
  files: std::vec::IntoIter<PathBuf>,
}

impl Iterator for ImageFolderIter {
  type Item = Result<InputImage, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.files.next().map(|path| InputImage::open(&path))
  }
}

impl IntoIterator for ImageFolderInput {
  type Item = Result<InputImage, InputError>;
  type IntoIter = ImageFolderIter;

  fn into_iter(self) -> Self::IntoIter {
    ImageFolderIter {
      files: self.files.into_iter(),
    }
  }
}
