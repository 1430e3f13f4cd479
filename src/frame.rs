// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/frame.rs - 图像与 NCHW 张量
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

use image::{RgbImage, imageops::FilterType};

/// 流水线输入图像，RGB 通道顺序，加载后不再修改
pub type Image = RgbImage;

const RGB_CHANNELS: usize = 3;

/// 模型输入张量，布局为 [1, 3, H, W]，取值范围 [0, 1]
#[derive(Debug, Clone)]
pub struct NchwTensor {
  width: usize,
  height: usize,
  data: Box<[f32]>,
}

impl NchwTensor {
  /// 缩放到模型输入尺寸并转为 NCHW 浮点张量
  pub fn from_image(image: &Image, width: u32, height: u32) -> Self {
    let resized;
    let source = if image.width() == width && image.height() == height {
      image
    } else {
      resized = image::imageops::resize(image, width, height, FilterType::Triangle);
      &resized
    };

    let (w, h) = (width as usize, height as usize);
    let plane_size = w * h;
    let mut data = vec![0f32; plane_size * RGB_CHANNELS];

    for (x, y, pixel) in source.enumerate_pixels() {
      let idx = (y as usize) * w + (x as usize);
      data[idx] = pixel[0] as f32 / 255.0;
      data[plane_size + idx] = pixel[1] as f32 / 255.0;
      data[2 * plane_size + idx] = pixel[2] as f32 / 255.0;
    }

    Self {
      width: w,
      height: h,
      data: data.into_boxed_slice(),
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.height, self.width]
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn into_data(self) -> Box<[f32]> {
    self.data
  }
}
