use crate::engine::EngineHandle;
use facereg_core::report::FacesReport;
use facereg_core::session::ImageOutcome;
use std::path::PathBuf;
use zbus::interface;

pub const BUS_NAME: &str = "org.facereg.Registry1";
pub const OBJECT_PATH: &str = "/org/facereg/Registry1";

/// D-Bus interface for the facereg recognition daemon.
///
/// Bus name: org.facereg.Registry1
/// Object path: /org/facereg/Registry1
pub struct RegistryService {
    engine: EngineHandle,
}

impl RegistryService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// JSON report for one processed image.
pub fn report_json(outcome: &ImageOutcome) -> String {
    serde_json::to_string(&FacesReport::for_output(outcome)).unwrap_or_else(|_| "{}".into())
}

#[interface(name = "org.facereg.Registry1")]
impl RegistryService {
    /// Recognize the faces in an image file, enrolling unknown faces.
    async fn recognize(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "recognize requested");
        let outcome = self
            .engine
            .recognize(PathBuf::from(path), path.to_string())
            .await
            .map_err(failed)?;
        Ok(report_json(&outcome))
    }

    /// List known identities and how many embeddings each holds.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let ids = self.engine.list_identities().await.map_err(failed)?;
        let entries: Vec<serde_json::Value> = ids
            .into_iter()
            .map(|(name, embeddings)| serde_json::json!({ "name": name, "embeddings": embeddings }))
            .collect();
        Ok(serde_json::Value::Array(entries).to_string())
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "store": status.store,
            "embeddings": status.embeddings,
            "identities": status.identities,
            "pending": status.pending,
            "tolerance": status.tolerance,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facereg_core::session::SkipReason;
    use facereg_core::types::{BoundingBox, FaceOutcome, LabeledFace, RecognitionResult};

    #[test]
    fn test_report_uses_annotated_path() {
        let outcome = ImageOutcome::Recognized {
            result: RecognitionResult {
                image: "/in/a.jpg".into(),
                faces: vec![LabeledFace {
                    name: "a".into(),
                    bbox: BoundingBox::new(1, 2, 3, 0),
                    outcome: FaceOutcome::Enrolled,
                }],
                unpersisted: 0,
            },
            annotated: Some(PathBuf::from("/out/a.jpg")),
        };
        let v: serde_json::Value = serde_json::from_str(&report_json(&outcome)).unwrap();
        assert_eq!(v["image"], "/out/a.jpg");
        assert_eq!(v["names"], serde_json::json!(["a"]));
        assert_eq!(v["faces"][0]["box"]["right"], 2);
    }

    #[test]
    fn test_report_for_skipped_image() {
        let outcome = ImageOutcome::Skipped {
            image: "/in/missing.jpg".into(),
            reason: SkipReason::Missing,
        };
        let v: serde_json::Value = serde_json::from_str(&report_json(&outcome)).unwrap();
        assert_eq!(v["image"], "/in/missing.jpg");
        assert_eq!(v["names"], serde_json::json!([]));
        assert_eq!(v["skipped"], "input image does not exist");
    }

    #[test]
    fn test_report_without_faces_has_no_skip_marker() {
        let outcome = ImageOutcome::Recognized {
            result: RecognitionResult::empty("/in/empty.jpg"),
            annotated: None,
        };
        let v: serde_json::Value = serde_json::from_str(&report_json(&outcome)).unwrap();
        assert_eq!(v["names"], serde_json::json!([]));
        assert!(v.get("skipped").is_none());
    }
}
