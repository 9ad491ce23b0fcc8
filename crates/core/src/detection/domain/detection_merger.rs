use crate::detection::infrastructure::math;
use crate::shared::constants::DEFAULT_OVERLAP_MERGE_THRESHOLD;
use crate::shared::detection::Detection;
use crate::shared::geometry::{iou, BBox};

/// Collapses duplicate detections of the same physical object.
///
/// Boxes are linked when their IoU exceeds the threshold, and every connected
/// component becomes one detection: the box is the confidence-weighted mean
/// of the members, while class, confidence and tracker id come from the most
/// confident member. Singletons pass through untouched.
pub struct DetectionMerger {
    overlap_threshold: f64,
}

impl DetectionMerger {
    pub fn new(overlap_threshold: f64) -> Self {
        Self { overlap_threshold }
    }

    pub fn merge(&self, detections: &[Detection]) -> Vec<Detection> {
        let n = detections.len();
        let mut parent: Vec<usize> = (0..n).collect();
        for i in 0..n {
            for j in (i + 1)..n {
                if iou(&detections[i].bbox, &detections[j].bbox) > self.overlap_threshold {
                    math::union(&mut parent, i, j);
                }
            }
        }

        math::components(&mut parent)
            .into_iter()
            .map(|members| merge_component(detections, &members))
            .collect()
    }
}

impl Default for DetectionMerger {
    fn default() -> Self {
        Self::new(DEFAULT_OVERLAP_MERGE_THRESHOLD)
    }
}

fn merge_component(detections: &[Detection], members: &[usize]) -> Detection {
    if let [only] = members {
        return detections[*only].clone();
    }

    // First member wins ties so the result is independent of float noise.
    let best = members
        .iter()
        .copied()
        .reduce(|best, i| {
            if detections[i].confidence > detections[best].confidence {
                i
            } else {
                best
            }
        })
        .unwrap_or(members[0]);

    Detection {
        bbox: weighted_box(detections, members),
        ..detections[best].clone()
    }
}

fn weighted_box(detections: &[Detection], members: &[usize]) -> BBox {
    let total: f64 = members
        .iter()
        .map(|&i| detections[i].confidence.max(0.0))
        .sum();

    let mut bbox = [0.0; 4];
    for &i in members {
        let weight = if total > 0.0 {
            detections[i].confidence.max(0.0) / total
        } else {
            1.0 / members.len() as f64
        };
        for (acc, v) in bbox.iter_mut().zip(detections[i].bbox.iter()) {
            *acc += weight * v;
        }
    }
    bbox
}
