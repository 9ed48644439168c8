use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::metrics;
use crate::utils::write_atomic;

#[derive(Debug, Error)]
#[error("invalid bbox [{0}, {1}, {2}, {3}]: coordinates must be normalized and non-inverted")]
pub struct InvalidBBox(f32, f32, f32, f32);

#[derive(Debug, Error)]
#[error("score {0} outside [0, 1]")]
pub struct InvalidScore(f32);

/// Axis-aligned box with all coordinates normalized to `[0, 1]`,
/// `y_min <= y_max` and `x_min <= x_max`. Serialized on the wire as the
/// array `[y_min, x_min, y_max, x_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f32; 4]", try_from = "[f32; 4]")]
pub struct BBox {
    y_min: f32,
    x_min: f32,
    y_max: f32,
    x_max: f32,
}

impl BBox {
    pub fn new(y_min: f32, x_min: f32, y_max: f32, x_max: f32) -> Result<Self, InvalidBBox> {
        let in_range = |v: f32| (0.0..=1.0).contains(&v);
        if !in_range(y_min) || !in_range(x_min) || !in_range(y_max) || !in_range(x_max) {
            return Err(InvalidBBox(y_min, x_min, y_max, x_max));
        }
        if y_min > y_max || x_min > x_max {
            return Err(InvalidBBox(y_min, x_min, y_max, x_max));
        }
        Ok(Self { y_min, x_min, y_max, x_max })
    }

    pub fn y_min(&self) -> f32 {
        self.y_min
    }

    pub fn x_min(&self) -> f32 {
        self.x_min
    }

    pub fn y_max(&self) -> f32 {
        self.y_max
    }

    pub fn x_max(&self) -> f32 {
        self.x_max
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.y_min, b.x_min, b.y_max, b.x_max]
    }
}

impl TryFrom<[f32; 4]> for BBox {
    type Error = InvalidBBox;

    fn try_from([y_min, x_min, y_max, x_max]: [f32; 4]) -> Result<Self, Self::Error> {
        BBox::new(y_min, x_min, y_max, x_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationSource {
    Manual,
    Auto,
}

/// One labeled box on one image. Multiple annotations may reference the
/// same image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub image_id: String,
    pub class_name: String,
    pub bbox: BBox,
    score: f32,
    source: AnnotationSource,
}

impl Annotation {
    /// A human-supplied annotation. Always carries score 1.0.
    pub fn manual(image_id: impl Into<String>, class_name: impl Into<String>, bbox: BBox) -> Self {
        Self {
            image_id: image_id.into(),
            class_name: class_name.into(),
            bbox,
            score: 1.0,
            source: AnnotationSource::Manual,
        }
    }

    /// A detector-produced annotation; the score must be a confidence
    /// in `[0, 1]`.
    pub fn auto(
        image_id: impl Into<String>,
        class_name: impl Into<String>,
        bbox: BBox,
        score: f32,
    ) -> Result<Self, InvalidScore> {
        if !(0.0..=1.0).contains(&score) {
            return Err(InvalidScore(score));
        }
        Ok(Self {
            image_id: image_id.into(),
            class_name: class_name.into(),
            bbox,
            score,
            source: AnnotationSource::Auto,
        })
    }

    pub fn is_manual(&self) -> bool {
        self.source == AnnotationSource::Manual
    }

    /// Confidence in `[0, 1]`; 1.0 for manual annotations. Only the
    /// validating constructors can set it.
    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn source(&self) -> AnnotationSource {
        self.source
    }
}

/// Manual-annotation submission item, as accepted by the CLI and the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualAnnotation {
    pub image_id: String,
    pub class_name: String,
    pub bbox: [f32; 4],
}

impl ManualAnnotation {
    pub fn into_annotation(self) -> Result<Annotation, InvalidBBox> {
        let bbox = BBox::try_from(self.bbox)?;
        Ok(Annotation::manual(self.image_id, self.class_name, bbox))
    }
}

/// On-disk element of the per-image annotation file. `image_id` is carried
/// by the filename, not the element.
#[derive(Debug, Serialize, Deserialize)]
struct WireAnnotation {
    class_name: String,
    bbox: BBox,
    score: f32,
    source: AnnotationSource,
}

/// Per-image annotation records with the manual-wins merge rule.
///
/// Persists one JSON array per image under `dir`, named after the image id
/// with a `.json` extension. Files are written atomically so an interrupted
/// save never leaves a half-written record behind.
pub struct AnnotationStore {
    dir: PathBuf,
    map: BTreeMap<String, Vec<Annotation>>,
    dropped_conflicts: u64,
}

impl AnnotationStore {
    /// Open the store at `dir`, loading any previously saved records.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let mut map = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json") != Some(true) {
                continue;
            }
            let Some(image_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data = fs::read(&path)?;
            let wire: Vec<WireAnnotation> = serde_json::from_slice(&data)
                .with_context(|| format!("malformed annotation file {}", path.display()))?;
            let annotations = wire
                .into_iter()
                .map(|w| Annotation {
                    image_id: image_id.to_string(),
                    class_name: w.class_name,
                    bbox: w.bbox,
                    score: w.score,
                    source: w.source,
                })
                .collect();
            map.insert(image_id.to_string(), annotations);
        }
        Ok(Self { dir, map, dropped_conflicts: 0 })
    }

    /// Insert one annotation, applying the manual-wins rule:
    /// a manual annotation replaces any auto-only set for its image, and an
    /// auto annotation for an image that already has a manual one is
    /// silently dropped (counted for observability).
    pub fn put(&mut self, annotation: Annotation) {
        let entry = self.map.entry(annotation.image_id.clone()).or_default();
        let has_manual = entry.iter().any(|a| a.is_manual());
        match annotation.source {
            AnnotationSource::Manual => {
                if !has_manual && !entry.is_empty() {
                    debug!(
                        "replacing {} auto annotations on {} with manual",
                        entry.len(),
                        annotation.image_id
                    );
                    entry.clear();
                }
                entry.push(annotation);
            }
            AnnotationSource::Auto => {
                if has_manual {
                    self.dropped_conflicts += 1;
                    metrics::inc_auto_dropped_conflict();
                    debug!("dropping auto annotation on manually labeled {}", annotation.image_id);
                } else {
                    entry.push(annotation);
                }
            }
        }
    }

    pub fn get_all(&self, image_id: &str) -> &[Annotation] {
        self.map.get(image_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all(&self) -> impl Iterator<Item = (&str, &Annotation)> {
        self.map.iter().flat_map(|(id, annos)| annos.iter().map(move |a| (id.as_str(), a)))
    }

    pub fn is_empty(&self) -> bool {
        self.map.values().all(Vec::is_empty)
    }

    /// Auto annotations dropped because the image already had a manual one.
    pub fn dropped_conflicts(&self) -> u64 {
        self.dropped_conflicts
    }

    /// Write every image's annotation file. Each file is replaced
    /// atomically via a temp file and rename.
    pub fn save(&self) -> Result<()> {
        for (image_id, annotations) in &self.map {
            if annotations.is_empty() {
                continue;
            }
            let wire: Vec<WireAnnotation> = annotations
                .iter()
                .map(|a| WireAnnotation {
                    class_name: a.class_name.clone(),
                    bbox: a.bbox,
                    score: a.score,
                    source: a.source,
                })
                .collect();
            let path = self.annotation_path(image_id);
            let data = serde_json::to_vec(&wire)?;
            write_atomic(&path, &data)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(())
    }

    fn annotation_path(&self, image_id: &str) -> PathBuf {
        self.dir.join(format!("{image_id}.json"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for AnnotationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotationStore")
            .field("dir", &self.dir)
            .field("images", &self.map.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox() -> BBox {
        BBox::new(0.1, 0.2, 0.5, 0.6).unwrap()
    }

    #[test]
    fn bbox_rejects_inverted_and_out_of_range() {
        assert!(BBox::new(0.5, 0.2, 0.1, 0.6).is_err());
        assert!(BBox::new(0.1, 0.6, 0.5, 0.2).is_err());
        assert!(BBox::new(-0.1, 0.0, 0.5, 0.5).is_err());
        assert!(BBox::new(0.0, 0.0, 1.1, 0.5).is_err());
        assert!(BBox::new(0.0, 0.0, 1.0, 1.0).is_ok());
    }

    #[test]
    fn coordinates_and_score_readable_after_validation() {
        let b = BBox::new(0.1, 0.2, 0.5, 0.6).unwrap();
        assert_eq!((b.y_min(), b.x_min(), b.y_max(), b.x_max()), (0.1, 0.2, 0.5, 0.6));
        assert_eq!(<[f32; 4]>::from(b), [0.1, 0.2, 0.5, 0.6]);

        let manual = Annotation::manual("img", "cat", b);
        assert_eq!(manual.score(), 1.0);
        assert_eq!(manual.source(), AnnotationSource::Manual);
        let auto = Annotation::auto("img", "cat", b, 0.7).unwrap();
        assert_eq!(auto.score(), 0.7);
        assert_eq!(auto.source(), AnnotationSource::Auto);
    }

    #[test]
    fn auto_score_must_be_normalized() {
        assert!(Annotation::auto("img", "cat", bbox(), 1.5).is_err());
        assert!(Annotation::auto("img", "cat", bbox(), -0.1).is_err());
        assert!(Annotation::auto("img", "cat", bbox(), 0.7).is_ok());
    }

    #[test]
    fn manual_replaces_auto() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AnnotationStore::open(dir.path()).unwrap();
        store.put(Annotation::auto("img", "cat", bbox(), 0.8).unwrap());
        store.put(Annotation::auto("img", "dog", bbox(), 0.6).unwrap());
        assert_eq!(store.get_all("img").len(), 2);

        store.put(Annotation::manual("img", "cat", bbox()));
        let remaining = store.get_all("img");
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].is_manual());
        assert_eq!(remaining[0].score(), 1.0);
    }

    #[test]
    fn auto_after_manual_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AnnotationStore::open(dir.path()).unwrap();
        store.put(Annotation::manual("img", "cat", bbox()));
        store.put(Annotation::auto("img", "cat", bbox(), 0.9).unwrap());

        let remaining = store.get_all("img");
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].is_manual());
        assert_eq!(store.dropped_conflicts(), 1);
    }

    #[test]
    fn multiple_manual_annotations_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AnnotationStore::open(dir.path()).unwrap();
        store.put(Annotation::manual("img", "cat", bbox()));
        store.put(Annotation::manual("img", "dog", bbox()));
        assert_eq!(store.get_all("img").len(), 2);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let original = vec![
            Annotation::manual("img1", "cat", BBox::new(0.125, 0.25, 0.875, 0.9375).unwrap()),
            Annotation::auto("img2", "dog", BBox::new(0.1, 0.2, 0.3, 0.4).unwrap(), 0.73)
                .unwrap(),
        ];
        {
            let mut store = AnnotationStore::open(dir.path()).unwrap();
            for a in &original {
                store.put(a.clone());
            }
            store.save().unwrap();
        }

        let store = AnnotationStore::open(dir.path()).unwrap();
        for a in &original {
            let loaded = store.get_all(&a.image_id);
            assert_eq!(loaded.len(), 1);
            assert_eq!(loaded[0].class_name, a.class_name);
            assert_eq!(loaded[0].bbox, a.bbox);
            assert_eq!(loaded[0].score(), a.score());
            assert_eq!(loaded[0].source(), a.source());
        }
        assert!(dir.path().join("img1.json").exists());
        assert!(dir.path().join("img2.json").exists());
    }
}
