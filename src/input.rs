// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/input.rs - 图像输入
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

use image::ImageReader;
use thiserror::Error;

use crate::{FromUrl, FromUrlWithScheme, frame::Image};

mod image_folder;
mod read_image_file;

pub use self::image_folder::{ImageFolderInput, ImageFolderIter};
pub use self::read_image_file::ImageFileInput;

#[derive(Error, Debug)]
pub enum InputError {
  #[error("读取 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("解码图像 {path} 失败: {source}")]
  Decode {
    path: PathBuf,
    #[source]
    source: image::ImageError,
  },
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

/// 带名字的输入图像，名字为文件名去掉扩展名
#[derive(Debug, Clone)]
pub struct InputImage {
  pub name: String,
  pub image: Image,
}

impl InputImage {
  pub fn open(path: &Path) -> Result<Self, InputError> {
    let image = ImageReader::open(path)
      .map_err(|e| InputError::Io {
        path: path.to_path_buf(),
        source: e,
      })?
      .with_guessed_format()
      .map_err(|e| InputError::Io {
        path: path.to_path_buf(),
        source: e,
      })?
      .decode()
      .map_err(|e| InputError::Decode {
        path: path.to_path_buf(),
        source: e,
      })?
      .to_rgb8();
    let name = path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "image".to_string());
    Ok(Self { name, image })
  }
}

pub enum InputWrapper {
  ReadImageFile(ImageFileInput),
  ImageFolder(ImageFolderInput),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      ImageFileInput::SCHEME => Ok(InputWrapper::ReadImageFile(ImageFileInput::from_url(url)?)),
      ImageFolderInput::SCHEME => Ok(InputWrapper::ImageFolder(ImageFolderInput::from_url(url)?)),
      other => Err(InputError::SchemeMismatch(other.to_string())),
    }
  }
}

impl IntoIterator for InputWrapper {
  type Item = Result<InputImage, InputError>;
  type IntoIter = InputWrapperIter;

  fn into_iter(self) -> Self::IntoIter {
    match self {
      InputWrapper::ReadImageFile(input) => InputWrapperIter::ReadImageFile(input.into_iter()),
      InputWrapper::ImageFolder(input) => InputWrapperIter::ImageFolder(input.into_iter()),
    }
  }
}

pub enum InputWrapperIter {
  ReadImageFile(std::option::IntoIter<Result<InputImage, InputError>>),
  ImageFolder(ImageFolderIter),
}

impl Iterator for InputWrapperIter {
  type Item = Result<InputImage, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      InputWrapperIter::ReadImageFile(input) => input.next(),
      InputWrapperIter::ImageFolder(input) => input.next(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = url::Url::parse("v4l:///dev/video0").unwrap();
    assert!(matches!(
      InputWrapper::from_url(&url),
      Err(InputError::SchemeMismatch(s)) if s == "v4l"
    ));
  }

  #[test]
  fn missing_file_is_io_error() {
    assert!(matches!(
      InputImage::open(Path::new("/nonexistent/shanhu/reef.png")),
      Err(InputError::Io { .. })
    ));
  }
}
