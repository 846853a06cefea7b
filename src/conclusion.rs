/// Maps a computed gap/percentage pair to a categorical label. The reporting
/// platform supplies its own mapping in production; this trait is the seam,
/// and `labels` exists so summaries can report zero counts for every label.
pub trait ConclusionClassifier {
    fn classify(&self, gap: f64, percentage: f64) -> String;
    fn labels(&self) -> Vec<String>;
}

pub const ABOVE_STANDARD: &str = "Above Standard";
pub const MEETS_STANDARD: &str = "Meets Standard";
pub const BELOW_STANDARD: &str = "Below Standard";

/// Default gap-sign classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct GapBandClassifier;

impl ConclusionClassifier for GapBandClassifier {
    fn classify(&self, gap: f64, _percentage: f64) -> String {
        if gap > 1e-9 {
            ABOVE_STANDARD.to_string()
        } else if gap < -1e-9 {
            BELOW_STANDARD.to_string()
        } else {
            MEETS_STANDARD.to_string()
        }
    }

    fn labels(&self) -> Vec<String> {
        vec![
            ABOVE_STANDARD.to_string(),
            MEETS_STANDARD.to_string(),
            BELOW_STANDARD.to_string(),
        ]
    }
}
