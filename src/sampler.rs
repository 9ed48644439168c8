use std::cmp::Ordering;
use std::sync::Arc;

use log::{debug, warn};
use ndarray::Array2;
use rayon::prelude::*;

use crate::backend::FeatureExtractor;
use crate::metrics;
use crate::session::ImageRecord;

/// Selects the `k` most mutually dissimilar images from a candidate pool.
///
/// Each image is ranked by the sum of its cosine distances to every other
/// candidate, a global measure that is deterministic and O(n²) in the pool
/// size (pools are bounded by the search result cap). Ties are broken by
/// original list position, and the selected subset is returned in ascending
/// input order, so identical inputs always produce identical output.
#[derive(Clone)]
pub struct DiversitySampler {
    extractor: Arc<dyn FeatureExtractor>,
}

impl DiversitySampler {
    pub fn new(extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self { extractor }
    }

    /// Pick `k` maximally dissimilar images. With `k` or fewer candidates
    /// the input comes back unchanged. Images whose embedding cannot be
    /// computed, or comes back as a zero vector, are dropped from
    /// consideration, never an error: if fewer than `k` embeddings survive,
    /// all surviving images are returned and the shortfall is the caller's
    /// to notice.
    pub fn select(&self, mut images: Vec<ImageRecord>, k: usize) -> Vec<ImageRecord> {
        if images.len() <= k {
            return images;
        }

        // Embedding is per-image independent, the one safe place for
        // parallelism; everything after it is sequential for
        // reproducibility.
        images.par_iter_mut().for_each(|record| {
            if record.embedding.is_none() {
                match self.extractor.embed(&record.local_path) {
                    Ok(embedding) => record.embedding = Some(embedding),
                    Err(e) => {
                        metrics::inc_embed_failure();
                        warn!("dropping {} from sampling: {e}", record.id);
                    }
                }
            }
        });

        let dim = images.iter().find_map(|r| r.embedding.as_ref().map(Vec::len)).unwrap_or(0);
        let valid: Vec<usize> = images
            .iter()
            .enumerate()
            .filter(|(_, r)| match &r.embedding {
                Some(e) if e.len() != dim => {
                    warn!("dropping {}: embedding dim {} != {dim}", r.id, e.len());
                    false
                }
                // a zero vector has no direction; its cosine distance to
                // everything would degenerate to the maximum score
                Some(e) if e.iter().all(|v| *v == 0.0) => {
                    warn!("dropping {}: zero-norm embedding", r.id);
                    false
                }
                Some(_) => true,
                None => false,
            })
            .map(|(i, _)| i)
            .collect();

        let selected: Vec<usize> = if valid.len() <= k {
            debug!("only {} of {} candidates embeddable, returning all", valid.len(), images.len());
            valid
        } else {
            let scores = dissimilarity_scores(&images, &valid, dim);
            let mut order: Vec<usize> = (0..valid.len()).collect();
            order.sort_by(|&a, &b| {
                scores[b]
                    .partial_cmp(&scores[a])
                    .unwrap_or(Ordering::Equal)
                    .then(valid[a].cmp(&valid[b]))
            });
            let mut picked: Vec<usize> = order[..k].iter().map(|&i| valid[i]).collect();
            picked.sort_unstable();
            picked
        };

        let mut keep = vec![false; images.len()];
        for i in &selected {
            keep[*i] = true;
        }
        images
            .into_iter()
            .zip(keep)
            .filter_map(|(record, keep)| keep.then_some(record))
            .collect()
    }
}

/// Sum of cosine distances from each valid image to all other valid images.
fn dissimilarity_scores(images: &[ImageRecord], valid: &[usize], dim: usize) -> Vec<f32> {
    let n = valid.len();
    let mut m = Array2::<f32>::zeros((n, dim));
    for (row, &i) in valid.iter().enumerate() {
        let embedding = images[i].embedding.as_ref().expect("valid index without embedding");
        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for (col, v) in embedding.iter().enumerate() {
                m[(row, col)] = v / norm;
            }
        }
    }

    // With unit rows, dist(i, j) = 1 - sim(i, j); summing over j != i.
    let sim = m.dot(&m.t());
    (0..n)
        .map(|i| {
            let row_sum = sim.row(i).sum();
            (n as f32 - 1.0) - (row_sum - sim[(i, i)])
        })
        .collect()
}
