//! Post-processing of parsed page data: fuzzy project matching and
//! discipline inference.
//!
//! ## Match tiers
//!
//! | Tier | Rule | Confidence |
//! |------|------|------------|
//! | exact | normalised names equal | 1.0 |
//! | substring | one name contains the other | `min(0.9, 0.7 + 0.3 × short/long)` |
//! | address | a known address fragment appears in the extracted name or address | 0.7 |
//!
//! Only the single highest-scoring candidate is kept.

use crate::output::{ExtractedDocumentData, ProjectMatch};
use crate::projects::KnownProject;
use crate::prompts::DISCIPLINE_PREFIXES;
use once_cell::sync::Lazy;
use regex::Regex;

const EXACT_CONFIDENCE: f64 = 1.0;
const SUBSTRING_FLOOR: f64 = 0.7;
const SUBSTRING_CAP: f64 = 0.9;
const ADDRESS_CONFIDENCE: f64 = 0.7;
/// Address fragments shorter than this match too much to be useful.
const MIN_FRAGMENT_LEN: usize = 4;

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Leading letters of a drawing number, e.g. `FP` in `FP-101` or `A` in `A2.01`.
static RE_DRAWING_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z]{1,2})[\s\-.]?\d").unwrap());

/// Apply all post-processing rules to freshly parsed page data.
pub fn post_process(mut data: ExtractedDocumentData, projects: &[KnownProject]) -> ExtractedDocumentData {
    if let Some(mut current) = data.project_match.take() {
        current.confidence = clamp_confidence(current.confidence);
        data.project_match = Some(resolve_project(current, projects));
    }

    if let Some(drawing) = data.drawing.as_mut() {
        let missing = drawing
            .discipline
            .as_deref()
            .map_or(true, |d| d.trim().is_empty());
        if missing {
            drawing.discipline = drawing
                .drawing_number
                .as_deref()
                .and_then(infer_discipline)
                .map(str::to_string);
        }
    }

    data
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        return 0.0;
    }
    confidence.clamp(0.0, 1.0)
}

/// Fill in a project id when the model returned a name but no id.
fn resolve_project(current: ProjectMatch, projects: &[KnownProject]) -> ProjectMatch {
    let has_id = current
        .project_id
        .as_deref()
        .is_some_and(|id| !id.trim().is_empty());
    if has_id {
        return current;
    }

    let Some(name) = current.project_name.as_deref() else {
        return current;
    };

    match best_project_match(name, current.address.as_deref(), projects) {
        Some(found) => found,
        None => current,
    }
}

/// Score every known project against an extracted name/address and return
/// the best candidate, if any tier matched.
pub fn best_project_match(
    name: &str,
    address: Option<&str>,
    projects: &[KnownProject],
) -> Option<ProjectMatch> {
    let extracted = normalise(name);
    let extracted_address = address.map(normalise);
    if extracted.is_empty() && extracted_address.is_none() {
        return None;
    }

    let mut best: Option<(f64, &KnownProject)> = None;
    for project in projects {
        let Some(score) = score_project(&extracted, extracted_address.as_deref(), project) else {
            continue;
        };
        if best.map_or(true, |(s, _)| score > s) {
            best = Some((score, project));
        }
    }

    best.map(|(confidence, project)| ProjectMatch {
        project_id: Some(project.id.clone()),
        project_name: Some(project.name.clone()),
        address: project.address.clone(),
        confidence,
    })
}

fn score_project(extracted: &str, extracted_address: Option<&str>, project: &KnownProject) -> Option<f64> {
    let known = normalise(&project.name);

    if !extracted.is_empty() && !known.is_empty() {
        if extracted == known {
            return Some(EXACT_CONFIDENCE);
        }
        if extracted.contains(&known) || known.contains(extracted) {
            let (short, long) = if extracted.len() < known.len() {
                (extracted.len(), known.len())
            } else {
                (known.len(), extracted.len())
            };
            let overlap = short as f64 / long as f64;
            return Some((SUBSTRING_FLOOR + 0.3 * overlap).min(SUBSTRING_CAP));
        }
    }

    let known_address = project.address.as_deref()?;
    let fragment_hit = address_fragments(known_address).any(|fragment| {
        extracted.contains(&fragment) || extracted_address.is_some_and(|a| a.contains(&fragment))
    });
    fragment_hit.then_some(ADDRESS_CONFIDENCE)
}

/// Comma-separated parts of an address, normalised, ignoring short noise.
fn address_fragments(address: &str) -> impl Iterator<Item = String> + '_ {
    address
        .split(',')
        .map(normalise)
        .filter(|f| f.len() >= MIN_FRAGMENT_LEN)
}

fn normalise(s: &str) -> String {
    RE_WHITESPACE
        .replace_all(s.trim(), " ")
        .to_lowercase()
}

/// Map a drawing number's prefix to its discipline.
pub fn infer_discipline(drawing_number: &str) -> Option<&'static str> {
    let caps = RE_DRAWING_PREFIX.captures(drawing_number)?;
    let prefix = caps[1].to_uppercase();
    DISCIPLINE_PREFIXES
        .iter()
        .find(|(p, _)| *p == prefix)
        .or_else(|| {
            // `AD101`-style numbers: fall back to the first letter.
            let first = &prefix[..1];
            DISCIPLINE_PREFIXES.iter().find(|(p, _)| *p == first)
        })
        .map(|(_, d)| *d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::DrawingInfo;

    fn projects() -> Vec<KnownProject> {
        vec![
            KnownProject::new("p1", "Riverside Bridge").with_address("12 Quay Street, Portland"),
            KnownProject::new("p2", "Harbor Tower").with_address("400 Pier Road, Seattle"),
        ]
    }

    #[test]
    fn exact_match_is_full_confidence() {
        let m = best_project_match("riverside bridge", None, &projects()).unwrap();
        assert_eq!(m.project_id.as_deref(), Some("p1"));
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn exact_match_ignores_whitespace_runs() {
        let m = best_project_match("  Riverside   Bridge ", None, &projects()).unwrap();
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn substring_match_is_between_address_and_exact() {
        let m = best_project_match("Riverside", None, &projects()).unwrap();
        assert_eq!(m.project_id.as_deref(), Some("p1"));
        assert!(m.confidence > 0.7 && m.confidence < 1.0, "got {}", m.confidence);
        assert!(m.confidence <= SUBSTRING_CAP);
    }

    #[test]
    fn substring_confidence_capped() {
        let m = best_project_match("Riverside Bridge Phase", None, &projects()).unwrap();
        assert_eq!(m.confidence, SUBSTRING_CAP);
    }

    #[test]
    fn address_fragment_match() {
        let m = best_project_match("New Office", Some("400 Pier Road"), &projects()).unwrap();
        assert_eq!(m.project_id.as_deref(), Some("p2"));
        assert_eq!(m.confidence, ADDRESS_CONFIDENCE);
    }

    #[test]
    fn best_candidate_wins() {
        let list = vec![
            KnownProject::new("a", "Tower").with_address("1 Main Street"),
            KnownProject::new("b", "Harbor Tower"),
        ];
        let m = best_project_match("Harbor Tower", None, &list).unwrap();
        assert_eq!(m.project_id.as_deref(), Some("b"));
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn no_match() {
        assert!(best_project_match("Unrelated Mall", None, &projects()).is_none());
        assert!(best_project_match("", None, &projects()).is_none());
    }

    #[test]
    fn post_process_keeps_model_supplied_id() {
        let data = ExtractedDocumentData {
            project_match: Some(ProjectMatch {
                project_id: Some("p2".into()),
                project_name: Some("Riverside Bridge".into()),
                address: None,
                confidence: 0.8,
            }),
            ..Default::default()
        };
        let out = post_process(data, &projects());
        let m = out.project_match.unwrap();
        assert_eq!(m.project_id.as_deref(), Some("p2"));
        assert_eq!(m.confidence, 0.8);
    }

    #[test]
    fn post_process_fills_missing_id() {
        let data = ExtractedDocumentData {
            project_match: Some(ProjectMatch {
                project_name: Some("RIVERSIDE BRIDGE".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let m = post_process(data, &projects()).project_match.unwrap();
        assert_eq!(m.project_id.as_deref(), Some("p1"));
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn post_process_infers_discipline() {
        let data = ExtractedDocumentData {
            drawing: Some(DrawingInfo {
                drawing_number: Some("FP-101".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(post_process(data, &[]).discipline(), Some("Fire Protection"));
    }

    #[test]
    fn discipline_prefixes() {
        assert_eq!(infer_discipline("A-101"), Some("Architectural"));
        assert_eq!(infer_discipline("s2.01"), Some("Structural"));
        assert_eq!(infer_discipline("E101"), Some("Electrical"));
        assert_eq!(infer_discipline("FP-2"), Some("Fire Protection"));
        assert_eq!(infer_discipline("AD101"), Some("Architectural"));
        assert_eq!(infer_discipline("X-1"), None);
        assert_eq!(infer_discipline("Sheet 4"), None);
    }
}
