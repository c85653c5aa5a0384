//! Sidecar face provider.
//!
//! Detection and embedding extraction run outside this engine. The detector
//! writes its output for `photo.jpg` to `photo.faces.json` next to the image:
//!
//! ```json
//! [{"box": {"top": 40, "right": 120, "bottom": 110, "left": 50}, "embedding": [0.01, ...]}]
//! ```

use crate::session::{FaceProvider, ProviderError};
use crate::types::Detection;
use image::RgbImage;
use std::path::{Path, PathBuf};

pub const SIDECAR_SUFFIX: &str = "faces.json";

/// Path of the detections file for an image.
pub fn sidecar_path(image: &Path) -> PathBuf {
    let stem = image.file_stem().unwrap_or_default().to_string_lossy();
    image.with_file_name(format!("{stem}.{SIDECAR_SUFFIX}"))
}

/// Reads detections from `<stem>.faces.json` sidecar files.
#[derive(Debug, Default, Clone, Copy)]
pub struct SidecarProvider;

impl FaceProvider for SidecarProvider {
    fn detect(&mut self, source: &Path, pixels: &RgbImage) -> Result<Vec<Detection>, ProviderError> {
        let path = sidecar_path(source);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(sidecar = %path.display(), "no detections file; treating as no faces");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ProviderError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        let mut detections: Vec<Detection> =
            serde_json::from_str(&data).map_err(|e| ProviderError::Malformed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        for d in &mut detections {
            if d.bbox.left > d.bbox.right || d.bbox.top > d.bbox.bottom {
                return Err(ProviderError::Malformed {
                    path: path.display().to_string(),
                    reason: format!("inverted box {:?}", d.bbox),
                });
            }
            d.bbox = d.bbox.clamp_to(pixels.width(), pixels.height());
        }

        tracing::debug!(sidecar = %path.display(), faces = detections.len(), "loaded detections");
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/imgs/alice.jpg")),
            PathBuf::from("/imgs/alice.faces.json")
        );
    }

    #[test]
    fn test_missing_sidecar_is_no_faces() {
        let dir = tempfile::tempdir().unwrap();
        let faces = SidecarProvider
            .detect(&dir.path().join("a.jpg"), &RgbImage::new(8, 8))
            .unwrap();
        assert!(faces.is_empty());
    }

    #[test]
    fn test_reads_and_clamps_detections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.faces.json"),
            r#"[
                {"box": {"top": 1, "right": 5, "bottom": 4, "left": 2}, "embedding": [0.1, 0.2]},
                {"box": {"top": 3, "right": 50, "bottom": 60, "left": 4}, "embedding": [0.3, 0.4]}
            ]"#,
        )
        .unwrap();
        let faces = SidecarProvider
            .detect(&dir.path().join("a.jpg"), &RgbImage::new(10, 10))
            .unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].bbox, BoundingBox::new(1, 5, 4, 2));
        assert_eq!(faces[1].bbox, BoundingBox::new(3, 9, 9, 4));
        assert_eq!(faces[1].embedding.values(), &[0.3, 0.4]);
    }

    #[test]
    fn test_malformed_sidecar_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.faces.json"), "[{").unwrap();
        let r = SidecarProvider.detect(&dir.path().join("a.jpg"), &RgbImage::new(8, 8));
        assert!(matches!(r, Err(ProviderError::Malformed { .. })));
    }

    #[test]
    fn test_inverted_box_is_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.faces.json"),
            r#"[{"box": {"top": 5, "right": 1, "bottom": 6, "left": 4}, "embedding": [0.0]}]"#,
        )
        .unwrap();
        let r = SidecarProvider.detect(&dir.path().join("a.jpg"), &RgbImage::new(8, 8));
        assert!(r.is_err());
    }
}
