use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Dimensionality of every embedding the recognizer emits and the gallery stores.
pub const EMBEDDING_DIM: usize = 128;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Fixed-length face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// True when the vector has the recognizer's dimensionality and only finite components.
    pub fn is_valid(&self) -> bool {
        self.values.len() == EMBEDDING_DIM && self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Capture quality recorded alongside an enrolled embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingQuality {
    pub detection_score: f32,
    pub face_width: u32,
    pub face_height: u32,
}

/// A named person in the reference gallery with one or more reference embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub person: String,
    pub embeddings: Vec<Embedding>,
    /// Parallel to `embeddings` when present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quality: Vec<EmbeddingQuality>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

impl GalleryEntry {
    pub fn new(person: impl Into<String>, embeddings: Vec<Embedding>) -> Self {
        Self {
            person: person.into(),
            embeddings,
            quality: Vec::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

/// Which detector tier(s) the engine runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorMode {
    /// Low-latency detector only.
    Fast,
    /// High-recall detector only.
    Thorough,
    /// Fast detector first, thorough detector when it finds nothing.
    #[default]
    Hybrid,
}

impl fmt::Display for DetectorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorMode::Fast => "fast",
            DetectorMode::Thorough => "thorough",
            DetectorMode::Hybrid => "hybrid",
        })
    }
}

impl FromStr for DetectorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(DetectorMode::Fast),
            "thorough" => Ok(DetectorMode::Thorough),
            "hybrid" => Ok(DetectorMode::Hybrid),
            other => Err(format!("unknown detector mode: {other}")),
        }
    }
}

/// Identity assigned to a detected face.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Unknown,
    Person(String),
}

impl Label {
    pub fn person(&self) -> Option<&str> {
        match self {
            Label::Person(name) => Some(name),
            Label::Unknown => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Unknown => f.write_str("unknown"),
            Label::Person(name) => f.write_str(name),
        }
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: Label,
    /// Distance to the closest valid reference embedding; infinite when nothing was comparable.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            label: Label::Unknown,
            distance,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self.label, Label::Person(_))
    }
}

/// Strategy for comparing a probe embedding against the reference gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Minimum-Euclidean-distance matcher.
///
/// Each person scores the distance of their closest reference embedding. The
/// lowest score wins, ties go to the lexically smaller name, and the winner is
/// only reported when its distance is strictly below the threshold.
/// Embeddings with the wrong dimensionality are skipped on both sides.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        if !probe.is_valid() {
            tracing::warn!(dim = probe.values.len(), "discarding probe embedding with wrong dimensionality");
            return MatchResult::unknown(f32::INFINITY);
        }

        let mut best: Option<(&str, f32)> = None;

        for entry in gallery {
            let person_best = entry
                .embeddings
                .iter()
                .filter(|reference| reference.is_valid())
                .map(|reference| probe.euclidean_distance(reference))
                .fold(f32::INFINITY, f32::min);

            if !person_best.is_finite() {
                continue;
            }

            let better = match best {
                None => true,
                Some((name, distance)) => {
                    person_best < distance
                        || (person_best == distance && entry.person.as_str() < name)
                }
            };
            if better {
                best = Some((entry.person.as_str(), person_best));
            }
        }

        match best {
            Some((name, distance)) if distance < threshold => MatchResult {
                label: Label::Person(name.to_string()),
                distance,
            },
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Unit vector along `axis`, scaled by `scale`.
    fn axis(axis: usize, scale: f32) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[axis] = scale;
        Embedding::new(values)
    }

    /// Embedding at exactly `distance` from `axis(0, 1.0)`.
    fn at_distance(distance: f32) -> Embedding {
        let mut values = vec![0.0; EMBEDDING_DIM];
        values[0] = 1.0;
        values[1] = distance;
        Embedding::new(values)
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = axis(0, 1.0);
        assert!(a.euclidean_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_orthogonal() {
        let a = axis(0, 1.0);
        let b = axis(1, 1.0);
        assert!((a.euclidean_distance(&b) - 2f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_validity() {
        assert!(axis(0, 1.0).is_valid());
        assert!(!Embedding::new(vec![0.0; 64]).is_valid());
        let mut nan = axis(0, 1.0);
        nan.values[3] = f32::NAN;
        assert!(!nan.is_valid());
    }

    #[test]
    fn test_matcher_picks_closest_reference_per_person() {
        // Ada has three references; the closest is 0.55 away.
        let gallery = vec![GalleryEntry::new(
            "Ada",
            vec![at_distance(0.9), at_distance(0.55), at_distance(1.2)],
        )];
        let result = EuclideanMatcher.compare(&axis(0, 1.0), &gallery, 0.6);
        assert_eq!(result.label, Label::Person("Ada".into()));
        assert!((result.distance - 0.55).abs() < 1e-5);
    }

    #[test]
    fn test_matcher_above_threshold_is_unknown() {
        let gallery = vec![GalleryEntry::new("Ada", vec![at_distance(0.62)])];
        let result = EuclideanMatcher.compare(&axis(0, 1.0), &gallery, 0.6);
        assert_eq!(result.label, Label::Unknown);
        assert!((result.distance - 0.62).abs() < 1e-5);
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        let gallery = vec![GalleryEntry::new("Ada", vec![at_distance(0.5)])];
        let result = EuclideanMatcher.compare(&axis(0, 1.0), &gallery, 0.5);
        assert!(!result.is_match());
    }

    #[test]
    fn test_matcher_lowest_distance_wins_across_people() {
        let gallery = vec![
            GalleryEntry::new("Grace", vec![at_distance(0.4)]),
            GalleryEntry::new("Ada", vec![at_distance(0.3)]),
        ];
        let result = EuclideanMatcher.compare(&axis(0, 1.0), &gallery, 0.6);
        assert_eq!(result.label, Label::Person("Ada".into()));
    }

    #[test]
    fn test_matcher_tie_breaks_by_name() {
        let gallery = vec![
            GalleryEntry::new("Zed", vec![at_distance(0.3)]),
            GalleryEntry::new("Ada", vec![at_distance(0.3)]),
        ];
        let result = EuclideanMatcher.compare(&axis(0, 1.0), &gallery, 0.6);
        assert_eq!(result.label, Label::Person("Ada".into()));

        // Order of iteration does not matter.
        let reversed: Vec<_> = gallery.into_iter().rev().collect();
        let result = EuclideanMatcher.compare(&axis(0, 1.0), &reversed, 0.6);
        assert_eq!(result.label, Label::Person("Ada".into()));
    }

    #[test]
    fn test_matcher_skips_wrong_dimension_references() {
        let gallery = vec![GalleryEntry::new(
            "Ada",
            vec![Embedding::new(vec![1.0; 3]), at_distance(0.7)],
        )];
        let result = EuclideanMatcher.compare(&axis(0, 1.0), &gallery, 0.6);
        assert_eq!(result.label, Label::Unknown);
        assert!((result.distance - 0.7).abs() < 1e-5);
    }

    #[test]
    fn test_matcher_wrong_dimension_probe() {
        let gallery = vec![GalleryEntry::new("Ada", vec![axis(0, 1.0)])];
        let result = EuclideanMatcher.compare(&Embedding::new(vec![1.0; 10]), &gallery, 0.6);
        assert_eq!(result.label, Label::Unknown);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let result = EuclideanMatcher.compare(&axis(0, 1.0), &[], 0.6);
        assert_eq!(result.label, Label::Unknown);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_matcher_threshold_monotonicity() {
        let gallery = vec![
            GalleryEntry::new("Ada", vec![at_distance(0.45)]),
            GalleryEntry::new("Grace", vec![at_distance(0.8)]),
        ];
        let probe = axis(0, 1.0);
        let thresholds = [0.1, 0.3, 0.45, 0.46, 0.6, 0.9, 1.5];
        let mut matched_before = false;
        for threshold in thresholds {
            let matched = EuclideanMatcher.compare(&probe, &gallery, threshold).is_match();
            assert!(matched || !matched_before, "raising threshold lost a match at {threshold}");
            matched_before = matched;
        }
        assert!(matched_before);
    }

    #[test]
    fn test_detector_mode_parse() {
        assert_eq!("Hybrid".parse::<DetectorMode>(), Ok(DetectorMode::Hybrid));
        assert_eq!(" fast ".parse::<DetectorMode>(), Ok(DetectorMode::Fast));
        assert!("ssd".parse::<DetectorMode>().is_err());
        assert_eq!(DetectorMode::default(), DetectorMode::Hybrid);
    }
}
