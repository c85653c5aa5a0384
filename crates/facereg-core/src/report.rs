//! JSON report shapes for recognition results.

use crate::session::ImageOutcome;
use crate::types::{BoundingBox, RecognitionResult};
use serde::Serialize;

/// `{"image": ..., "names": [...]}`, plus `"skipped": reason` when the image
/// could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamesReport {
    pub image: String,
    pub names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceEntry {
    pub name: String,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

/// `{"image": ..., "names": [...], "faces": [{"name": ..., "box": {...}}]}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacesReport {
    pub image: String,
    pub names: Vec<String>,
    pub faces: Vec<FaceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl From<&RecognitionResult> for NamesReport {
    fn from(r: &RecognitionResult) -> Self {
        Self {
            image: r.image.clone(),
            names: r.names().map(str::to_string).collect(),
            skipped: None,
        }
    }
}

impl From<&RecognitionResult> for FacesReport {
    fn from(r: &RecognitionResult) -> Self {
        Self {
            image: r.image.clone(),
            names: r.names().map(str::to_string).collect(),
            faces: r
                .faces
                .iter()
                .map(|f| FaceEntry {
                    name: f.name.clone(),
                    bbox: f.bbox,
                })
                .collect(),
            skipped: None,
        }
    }
}

impl From<&ImageOutcome> for NamesReport {
    fn from(o: &ImageOutcome) -> Self {
        match o {
            ImageOutcome::Recognized { result, .. } => result.into(),
            ImageOutcome::Skipped { image, reason } => Self {
                image: image.clone(),
                names: Vec::new(),
                skipped: Some(reason.to_string()),
            },
        }
    }
}

impl From<&ImageOutcome> for FacesReport {
    fn from(o: &ImageOutcome) -> Self {
        match o {
            ImageOutcome::Recognized { result, .. } => result.into(),
            ImageOutcome::Skipped { image, reason } => Self {
                image: image.clone(),
                names: Vec::new(),
                faces: Vec::new(),
                skipped: Some(reason.to_string()),
            },
        }
    }
}

impl FacesReport {
    /// Report for a processed image that points at the annotated copy when
    /// one was written, otherwise at the caller's image reference.
    pub fn for_output(outcome: &ImageOutcome) -> Self {
        let mut report = Self::from(outcome);
        if let ImageOutcome::Recognized {
            annotated: Some(path),
            ..
        } = outcome
        {
            report.image = path.display().to_string();
        }
        report
    }
}
