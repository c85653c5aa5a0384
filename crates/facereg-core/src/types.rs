use serde::{Deserialize, Serialize};

/// Face bounding box in pixel coordinates, in the detector's
/// (top, right, bottom, left) convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self { top, right, bottom, left }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    /// Clamp the box to an image of the given size, keeping `left <= right`
    /// and `top <= bottom`.
    pub fn clamp_to(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1);
        let max_y = height.saturating_sub(1);
        let left = self.left.min(max_x);
        let top = self.top.min(max_y);
        Self {
            top,
            right: self.right.min(max_x).max(left),
            bottom: self.bottom.min(max_y).max(top),
            left,
        }
    }
}

/// Fixed-length face embedding produced by an external model.
///
/// Immutable once created: the values are only reachable through `values()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// True when no component is NaN or infinite. Overflowing JSON numbers
    /// decode to infinity, which no backend can round-trip.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Only meaningful for equal dimensions; callers validate that first.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// One face found in one image by the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// How a face got its label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaceOutcome {
    /// Re-observation of a known identity.
    Matched { distance: f32 },
    /// No identity within tolerance; a new embedding was enrolled.
    Enrolled,
}

/// A detected face with the label the engine assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledFace {
    pub name: String,
    pub bbox: BoundingBox,
    pub outcome: FaceOutcome,
}

/// Labels for every face of one image, in detection order.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    /// Caller-supplied image reference (path or URL).
    pub image: String,
    pub faces: Vec<LabeledFace>,
    /// Enrollments from this image that are held in memory only.
    pub unpersisted: usize,
}

impl RecognitionResult {
    pub fn empty(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            faces: Vec::new(),
            unpersisted: 0,
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.faces.iter().map(|f| f.name.as_str())
    }

    pub fn enrolled_count(&self) -> usize {
        self.faces
            .iter()
            .filter(|f| f.outcome == FaceOutcome::Enrolled)
            .count()
    }
}
