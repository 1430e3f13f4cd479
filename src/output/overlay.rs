// 该文件是 Shanhu （珊瑚） 项目的一部分。
// src/output/overlay.rs - 实例叠加绘制
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

use ab_glyph::{FontVec, PxScale};
use image::Rgb;
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::{debug, info, warn};

use crate::{frame::Image, reconcile::Instance, segmentation::BinaryMask};

const SYSTEM_FONTS: [&str; 4] = [
  "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
  "/usr/share/fonts/TTF/DejaVuSans.ttf",
  "/System/Library/Fonts/Supplemental/Arial.ttf",
  "C:\\Windows\\Fonts\\arial.ttf",
];

const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_PADDING: u32 = 2;

#[derive(Debug, Clone)]
pub struct OverlayConfig {
  /// 掩码填充不透明度 [0, 1]
  pub mask_alpha: f32,
  /// 边框线宽（像素）
  pub box_thickness: u32,
  pub font_scale: f32,
  /// 字体文件；未指定时尝试系统字体
  pub font_path: Option<PathBuf>,
}

impl Default for OverlayConfig {
  fn default() -> Self {
    Self {
      mask_alpha: 0.45,
      box_thickness: 2,
      font_scale: 16.0,
      font_path: None,
    }
  }
}

/// 把实例绘制到源图像的副本上
pub struct OverlayRenderer {
  config: OverlayConfig,
  font: Option<FontVec>,
}

impl Default for OverlayRenderer {
  fn default() -> Self {
    Self::new(OverlayConfig::default())
  }
}

fn load_font(path: &Path) -> Option<FontVec> {
  let data = std::fs::read(path).ok()?;
  FontVec::try_from_vec(data).ok()
}

impl OverlayRenderer {
  pub fn new(config: OverlayConfig) -> Self {
    let configured = config.font_path.as_deref().and_then(|path| {
      let font = load_font(path);
      if font.is_none() {
        warn!("无法加载字体 {}，尝试系统字体", path.display());
      }
      font
    });
    let font = configured.or_else(|| {
      SYSTEM_FONTS.iter().find_map(|path| {
        let font = load_font(Path::new(path))?;
        info!("使用系统字体: {}", path);
        Some(font)
      })
    });
    if font.is_none() {
      info!("未找到可用字体，标签将只绘制色块");
    }
    Self { config, font }
  }

  /// 不加载任何字体
  pub fn without_font(config: OverlayConfig) -> Self {
    Self { config, font: None }
  }

  pub fn config(&self) -> &OverlayConfig {
    &self.config
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  /// 按给定顺序绘制，后绘制的实例位于上层；源图像不被修改
  pub fn render(&self, image: &Image, instances: &[Instance]) -> Image {
    let mut canvas = image.clone();
    for instance in instances {
      let color = label_color(instance.label());
      if let Some(mask) = instance.mask() {
        self.blend_mask(&mut canvas, &mask.mask, color);
      }
      let Some(rect) = instance
        .bbox()
        .and_then(|bbox| bbox.to_pixel_rect(canvas.width(), canvas.height()))
      else {
        continue;
      };
      self.draw_box(&mut canvas, rect, color);
      let text = format!("{} {:.2}", instance.label(), instance.confidence());
      self.draw_label(&mut canvas, rect, &text, color);
    }
    debug!("绘制实例数: {}", instances.len());
    canvas
  }

  fn blend_mask(&self, canvas: &mut Image, mask: &BinaryMask, color: Rgb<u8>) {
    let alpha = self.config.mask_alpha.clamp(0.0, 1.0);
    let (width, height) = canvas.dimensions();
    for (x, y) in mask.pixels() {
      if x >= width || y >= height {
        continue;
      }
      let pixel = canvas.get_pixel_mut(x, y);
      for c in 0..3 {
        let blended = pixel[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha;
        pixel[c] = blended.round().clamp(0.0, 255.0) as u8;
      }
    }
  }

  fn draw_box(&self, canvas: &mut Image, (x, y, w, h): (i32, i32, u32, u32), color: Rgb<u8>) {
    for t in 0..self.config.box_thickness {
      if w <= 2 * t || h <= 2 * t {
        break;
      }
      let rect = Rect::at(x + t as i32, y + t as i32).of_size(w - 2 * t, h - 2 * t);
      draw_hollow_rect_mut(canvas, rect, color);
    }
  }

  fn draw_label(
    &self,
    canvas: &mut Image,
    (x, y, _, _): (i32, i32, u32, u32),
    text: &str,
    color: Rgb<u8>,
  ) {
    let scale = PxScale::from(self.config.font_scale);
    let (text_w, text_h) = match &self.font {
      Some(font) => text_size(scale, font, text),
      None => (
        (text.chars().count() as f32 * self.config.font_scale * 0.5) as u32,
        self.config.font_scale as u32,
      ),
    };
    let tag_w = text_w + 2 * LABEL_PADDING;
    let tag_h = text_h + 2 * LABEL_PADDING;

    // 优先放在边框上方，放不下时放在框内顶部
    let tag_y = if y >= tag_h as i32 { y - tag_h as i32 } else { y };
    let tag_x = x.min(canvas.width() as i32 - 1).max(0);
    let tag_w = tag_w.min(canvas.width().saturating_sub(tag_x as u32));
    let tag_h = tag_h.min(canvas.height().saturating_sub(tag_y as u32));
    if tag_w == 0 || tag_h == 0 {
      return;
    }

    draw_filled_rect_mut(canvas, Rect::at(tag_x, tag_y).of_size(tag_w, tag_h), color);
    if let Some(font) = &self.font {
      draw_text_mut(
        canvas,
        TEXT_COLOR,
        tag_x + LABEL_PADDING as i32,
        tag_y + LABEL_PADDING as i32,
        scale,
        font,
        text,
      );
    }
  }
}

/// 由类别名确定的颜色，同一类别在不同运行间颜色一致
pub fn label_color(label: &str) -> Rgb<u8> {
  // FNV-1a
  let hash = label
    .bytes()
    .fold(0x811c_9dc5u32, |h, b| (h ^ b as u32).wrapping_mul(0x0100_0193));
  let hue = (hash % 360) as f32;
  hsv_to_rgb(hue, 0.8, 0.9)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
