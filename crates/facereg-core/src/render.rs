//! Image-side collaborators: annotated output images and enrollment thumbnails.

use crate::session::{Renderer, ThumbnailSink};
use crate::types::{BoundingBox, Embedding, LabeledFace};
use ab_glyph::{point, Font, FontVec, GlyphId, PxScale, ScaleFont};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_OUTLINE_WIDTH: u32 = 4;
/// Label text height in pixels.
pub const DEFAULT_LABEL_SIZE: f32 = 12.0;
const OUTLINE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const UNIQUE_FACES_INDEX: &str = "unique_faces.json";

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("image encode failed for {path}: {source}")]
    Encode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("thumbnail index {path}: {reason}")]
    Index { path: String, reason: String },
    #[error("source has no file name: {0}")]
    NoFileName(String),
    #[error("cannot load label font {path}: {reason}")]
    Font { path: String, reason: String },
}

fn create_dir(dir: &Path) -> Result<(), RenderError> {
    std::fs::create_dir_all(dir).map_err(|source| RenderError::Io {
        path: dir.display().to_string(),
        source,
    })
}

fn save_image(img: &RgbImage, path: &Path) -> Result<(), RenderError> {
    img.save(path).map_err(|source| RenderError::Encode {
        path: path.display().to_string(),
        source,
    })
}

/// Draw a rectangle outline `stroke` pixels wide, growing inward from the box edges.
pub fn draw_outline(img: &mut RgbImage, bbox: &BoundingBox, stroke: u32, color: Rgb<u8>) {
    if img.width() == 0 || img.height() == 0 {
        return;
    }
    let b = bbox.clamp_to(img.width(), img.height());
    for t in 0..stroke {
        let top = b.top.saturating_add(t);
        let bottom = b.bottom.saturating_sub(t);
        let left = b.left.saturating_add(t);
        let right = b.right.saturating_sub(t);
        if top > bottom || left > right {
            break;
        }
        for x in left..=right {
            img.put_pixel(x, top, color);
            img.put_pixel(x, bottom, color);
        }
        for y in top..=bottom {
            img.put_pixel(left, y, color);
            img.put_pixel(right, y, color);
        }
    }
}

/// A TrueType/OpenType font used to write face names onto output images.
pub struct LabelFont {
    font: FontVec,
    scale: PxScale,
}

impl LabelFont {
    pub fn open(path: &Path, size_px: f32) -> Result<Self, RenderError> {
        let data = std::fs::read(path).map_err(|source| RenderError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_bytes(data, size_px).map_err(|reason| RenderError::Font {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn from_bytes(data: Vec<u8>, size_px: f32) -> Result<Self, String> {
        let font = FontVec::try_from_vec(data).map_err(|e| e.to_string())?;
        Ok(Self {
            font,
            scale: PxScale::from(size_px),
        })
    }
}

/// Write `text` with its top-left corner at (`x`, `y`), blending glyph
/// coverage into the image. Pixels outside the image are dropped.
pub fn draw_label(img: &mut RgbImage, font: &LabelFont, x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let scaled = font.font.as_scaled(font.scale);
    let mut caret = point(x as f32, y as f32 + scaled.ascent());
    let mut prev: Option<GlyphId> = None;

    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(p) = prev {
            caret.x += scaled.kern(p, id);
        }
        let glyph = id.with_scale_and_position(font.scale, caret);
        caret.x += scaled.h_advance(id);
        prev = Some(id);

        let Some(outlined) = font.font.outline_glyph(glyph) else {
            continue;
        };
        let bounds = outlined.px_bounds();
        outlined.draw(|gx, gy, coverage| {
            let px = bounds.min.x as i32 + gx as i32;
            let py = bounds.min.y as i32 + gy as i32;
            if px < 0 || py < 0 || px as u32 >= img.width() || py as u32 >= img.height() {
                return;
            }
            let pixel = img.get_pixel_mut(px as u32, py as u32);
            for (dst, src) in pixel.0.iter_mut().zip(color.0) {
                *dst = (*dst as f32 * (1.0 - coverage) + src as f32 * coverage).round() as u8;
            }
        });
    }
}

/// Writes a copy of each processed image with a red box around every face
/// to `<output_dir>/<file name>`. With a [`LabelFont`], the face's name is
/// written inside the bottom-left corner of its box.
pub struct OutlineRenderer {
    output_dir: PathBuf,
    stroke: u32,
    font: Option<LabelFont>,
}

impl OutlineRenderer {
    pub fn new(output_dir: impl Into<PathBuf>, stroke: u32) -> Self {
        Self {
            output_dir: output_dir.into(),
            stroke,
            font: None,
        }
    }

    pub fn with_font(mut self, font: LabelFont) -> Self {
        self.font = Some(font);
        self
    }
}

impl Renderer for OutlineRenderer {
    fn render(
        &mut self,
        source: &Path,
        pixels: &RgbImage,
        faces: &[LabeledFace],
    ) -> Result<Option<PathBuf>, RenderError> {
        let file_name = source
            .file_name()
            .ok_or_else(|| RenderError::NoFileName(source.display().to_string()))?;
        create_dir(&self.output_dir)?;

        let mut out = pixels.clone();
        for face in faces {
            draw_outline(&mut out, &face.bbox, self.stroke, OUTLINE_COLOR);
            if let Some(font) = &self.font {
                let x = face.bbox.left as i32 + 6;
                let y = face.bbox.bottom as i32 - 10;
                draw_label(&mut out, font, x, y, &face.name, OUTLINE_COLOR);
            }
        }

        let path = self.output_dir.join(file_name);
        save_image(&out, &path)?;
        Ok(Some(path))
    }
}

/// One entry of the `unique_faces.json` index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueFace {
    pub name: String,
    pub thumbnail: String,
    pub encoding: Embedding,
}

/// Saves a PNG crop of every newly enrolled face as `<dir>/<name>.png` and
/// keeps `<dir>/unique_faces.json` up to date.
pub struct ThumbnailWriter {
    dir: PathBuf,
    entries: Vec<UniqueFace>,
}

impl ThumbnailWriter {
    /// Open the thumbnail directory, picking up an existing index.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RenderError> {
        let dir = dir.into();
        create_dir(&dir)?;
        let index = dir.join(UNIQUE_FACES_INDEX);
        let entries = match std::fs::read_to_string(&index) {
            Ok(data) => serde_json::from_str(&data).map_err(|e| RenderError::Index {
                path: index.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(source) => {
                return Err(RenderError::Io {
                    path: index.display().to_string(),
                    source,
                })
            }
        };
        Ok(Self { dir, entries })
    }

    pub fn entries(&self) -> &[UniqueFace] {
        &self.entries
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(UNIQUE_FACES_INDEX)
    }

    fn write_index(&self) -> Result<(), RenderError> {
        let path = self.index_path();
        let json = serde_json::to_string_pretty(&self.entries).map_err(|e| RenderError::Index {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|source| RenderError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

impl ThumbnailSink for ThumbnailWriter {
    fn save(&mut self, name: &str, crop: &RgbImage, embedding: &Embedding) -> Result<PathBuf, RenderError> {
        let path = self.dir.join(format!("{name}.png"));
        save_image(crop, &path)?;
        self.entries.push(UniqueFace {
            name: name.to_string(),
            thumbnail: path.display().to_string(),
            encoding: embedding.clone(),
        });
        self.write_index()?;
        tracing::debug!(name, thumbnail = %path.display(), "saved face thumbnail");
        Ok(path)
    }
}
