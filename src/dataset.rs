use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::annotation::Annotation;
use crate::session::ImageRecord;
use crate::utils::write_atomic;

/// Ordered, deduplicated class names with stable positive ids.
///
/// Ids are assigned from the lexicographic order of the distinct names, so
/// the same name set always yields the same ids regardless of annotation
/// order. A changed name set renumbers everything; a model trained against
/// a stale registry must be re-exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRegistry {
    names: Vec<String>,
}

impl ClassRegistry {
    pub fn from_names<I>(names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();
        Self { names }
    }

    /// 1-based id of a class, `None` for unknown names.
    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.names.binary_search_by(|n| n.as_str().cmp(name)).ok().map(|i| i as u32 + 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i as u32 + 1, n.as_str()))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Immutable input to one training call. Rebuilt whole whenever the
/// annotation set changes, never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub image_dir: PathBuf,
    pub label_dir: PathBuf,
    pub classes: ClassRegistry,
}

/// Serialized form of the descriptor file consumed by the trainer.
#[derive(Debug, Serialize, Deserialize)]
struct DescriptorFile {
    train: PathBuf,
    val: PathBuf,
    nc: usize,
    names: Vec<String>,
}

impl DatasetDescriptor {
    /// Write the descriptor file and the label map into `dir` and return
    /// the descriptor file path, which is what the trainer receives.
    pub fn write_files(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let descriptor = DescriptorFile {
            train: self.image_dir.clone(),
            val: self.image_dir.clone(),
            nc: self.classes.len(),
            names: self.classes.names().to_vec(),
        };
        let descriptor_path = dir.join("dataset.json");
        write_atomic(&descriptor_path, &serde_json::to_vec_pretty(&descriptor)?)?;

        let label_map_path = dir.join("label_map.pbtxt");
        write_atomic(&label_map_path, label_map(&self.classes).as_bytes())?;

        info!("dataset descriptor written to {}", descriptor_path.display());
        Ok(descriptor_path)
    }
}

/// Render the class registry in label-map form, ids starting at 1.
fn label_map(classes: &ClassRegistry) -> String {
    let mut out = String::new();
    for (id, name) in classes.iter() {
        let _ = writeln!(out, "item {{");
        let _ = writeln!(out, "  id: {id}");
        let _ = writeln!(out, "  name: '{name}'");
        let _ = writeln!(out, "}}");
    }
    out
}

/// Aggregates annotation records into a training-ready descriptor.
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    image_dir: PathBuf,
    label_dir: PathBuf,
}

impl DatasetBuilder {
    pub fn new(image_dir: PathBuf, label_dir: PathBuf) -> Self {
        Self { image_dir, label_dir }
    }

    /// Build a descriptor from `images` and the given annotations.
    ///
    /// Deterministic for identical inputs. An annotation whose image is not
    /// in `images` is skipped with a log line rather than failing the build.
    pub fn build<'a, I>(&self, images: &[ImageRecord], annotations: I) -> DatasetDescriptor
    where
        I: IntoIterator<Item = (&'a str, &'a Annotation)>,
    {
        let known: HashSet<&str> = images.iter().map(|r| r.id.as_str()).collect();
        let mut class_names = Vec::new();
        for (image_id, annotation) in annotations {
            if !known.contains(image_id) {
                warn!("skipping annotation for unknown image {image_id}");
                continue;
            }
            class_names.push(annotation.class_name.clone());
        }
        DatasetDescriptor {
            image_dir: self.image_dir.clone(),
            label_dir: self.label_dir.clone(),
            classes: ClassRegistry::from_names(class_names),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::BBox;

    fn record(id: &str) -> ImageRecord {
        ImageRecord::new(id, None, PathBuf::from(format!("/img/{id}.jpg")))
    }

    fn annotation(image_id: &str, class_name: &str) -> Annotation {
        Annotation::manual(image_id, class_name, BBox::new(0.0, 0.0, 1.0, 1.0).unwrap())
    }

    #[test]
    fn registry_ids_are_lexicographic_from_one() {
        let registry = ClassRegistry::from_names(["dog", "cat", "bird", "dog"]);
        assert_eq!(registry.id_of("bird"), Some(1));
        assert_eq!(registry.id_of("cat"), Some(2));
        assert_eq!(registry.id_of("dog"), Some(3));
        assert_eq!(registry.id_of("fish"), None);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn registry_stable_under_reordering() {
        let a = ClassRegistry::from_names(["dog", "cat", "bird"]);
        let b = ClassRegistry::from_names(["bird", "dog", "cat", "cat"]);
        assert_eq!(a, b);
    }

    #[test]
    fn registry_renumbers_when_name_set_changes() {
        let a = ClassRegistry::from_names(["cat", "dog"]);
        let b = ClassRegistry::from_names(["ant", "cat", "dog"]);
        assert_eq!(a.id_of("cat"), Some(1));
        assert_eq!(b.id_of("cat"), Some(2));
        assert_eq!(b.id_of("dog"), Some(3));
    }

    #[test]
    fn builder_skips_annotations_without_image() {
        let builder = DatasetBuilder::new(PathBuf::from("/img"), PathBuf::from("/lbl"));
        let images = vec![record("a")];
        let annos = [annotation("a", "cat"), annotation("ghost", "dog")];
        let descriptor =
            builder.build(&images, annos.iter().map(|a| (a.image_id.as_str(), a)));
        assert_eq!(descriptor.classes.names(), ["cat"]);
    }

    #[test]
    fn label_map_format() {
        let registry = ClassRegistry::from_names(["cat", "dog"]);
        let map = label_map(&registry);
        assert_eq!(map, "item {\n  id: 1\n  name: 'cat'\n}\nitem {\n  id: 2\n  name: 'dog'\n}\n");
    }
}
