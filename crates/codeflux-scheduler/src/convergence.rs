use std::collections::HashMap;
use std::path::PathBuf;

use codeflux_core::{AnalysisResult, ConvergenceMark, IndexIssue};

/// Files eligible for a refinement pass: at least one suggestion above the
/// confidence threshold and not yet refined by a previous pass. Sorted for
/// deterministic enqueue order.
pub fn select_candidates(
    marks: &HashMap<PathBuf, ConvergenceMark>,
    confidence_threshold: f32,
) -> Vec<PathBuf> {
    let mut selected: Vec<PathBuf> = marks
        .iter()
        .filter(|(_, mark)| {
            !mark.iteration_refined
                && mark
                    .suggestions
                    .iter()
                    .any(|s| s.confidence > confidence_threshold)
        })
        .map(|(path, _)| path.clone())
        .collect();
    selected.sort();
    selected
}

/// Flatten the issues of every indexed file into the terminal report,
/// ordered by path.
pub fn aggregate_issues(results: &HashMap<PathBuf, AnalysisResult>) -> Vec<IndexIssue> {
    let mut paths: Vec<&PathBuf> = results.keys().collect();
    paths.sort();
    paths
        .into_iter()
        .flat_map(|path| results[path].issues.iter().cloned())
        .collect()
}
