//! Prompt construction for title-block extraction.
//!
//! The prompt and the discipline taxonomy live here so prompt changes never
//! touch the call/retry logic in [`crate::pipeline::llm`], and so tests can
//! inspect the exact text sent to the model.

use crate::projects::KnownProject;
use std::fmt::Write as _;

/// Drawing-number prefix → discipline.
///
/// Two-letter prefixes come first so `FP-101` is not read as `F…`.
pub const DISCIPLINE_PREFIXES: &[(&str, &str)] = &[
    ("FP", "Fire Protection"),
    ("C", "Civil"),
    ("A", "Architectural"),
    ("S", "Structural"),
    ("M", "Mechanical"),
    ("E", "Electrical"),
    ("P", "Plumbing"),
    ("L", "Landscape"),
    ("G", "General"),
];

const EXTRACTION_INSTRUCTIONS: &str = r#"You are analyzing one page of a construction document. Read the title block and any visible annotations and extract the following information.

Respond with a single JSON object and nothing else, using exactly this shape (omit any field you cannot read):

{
  "projectMatch": { "projectId": "id from the list below, if one matches", "projectName": "project name as printed", "address": "site address as printed", "confidence": 0.0 },
  "drawing": { "drawingNumber": "", "sheetNumber": "", "sheetTitle": "", "revision": "", "scale": "", "discipline": "" },
  "location": { "building": "", "floor": "", "zone": "", "room": "" },
  "dates": { "issueDate": "YYYY-MM-DD", "revisionDate": "YYYY-MM-DD" },
  "rawText": "up to 500 characters of the most relevant title-block text"
}

If the page is not a construction document (for example a photo, an invoice or a blank page), respond with:
{ "error": "not a construction document" }"#;

/// Build the full extraction prompt for one page.
///
/// `projects` is embedded so the model can match the printed project name
/// against ids the caller knows about.
pub fn extraction_prompt(projects: &[KnownProject]) -> String {
    let mut prompt = String::from(EXTRACTION_INSTRUCTIONS);

    prompt.push_str("\n\nDISCIPLINE RULES (from the drawing-number prefix):\n");
    for (prefix, discipline) in DISCIPLINE_PREFIXES {
        let _ = writeln!(prompt, "- {prefix} = {discipline}");
    }

    if projects.is_empty() {
        prompt.push_str("\nNo known projects are available; leave projectId empty.\n");
    } else {
        prompt.push_str("\nKNOWN PROJECTS (match by name or address):\n");
        for p in projects {
            match &p.address {
                Some(addr) => {
                    let _ = writeln!(prompt, "- id={} name=\"{}\" address=\"{}\"", p.id, p.name, addr);
                }
                None => {
                    let _ = writeln!(prompt, "- id={} name=\"{}\"", p.id, p.name);
                }
            }
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_every_discipline() {
        let prompt = extraction_prompt(&[]);
        for (prefix, name) in DISCIPLINE_PREFIXES {
            assert!(prompt.contains(&format!("- {prefix} = {name}")), "missing {prefix}");
        }
        assert!(prompt.contains("leave projectId empty"));
    }

    #[test]
    fn prompt_embeds_known_projects() {
        let projects = vec![
            KnownProject::new("p1", "Riverside Bridge").with_address("12 Quay St, Portland"),
            KnownProject::new("p2", "Harbor Tower"),
        ];
        let prompt = extraction_prompt(&projects);
        assert!(prompt.contains("id=p1 name=\"Riverside Bridge\" address=\"12 Quay St, Portland\""));
        assert!(prompt.contains("id=p2 name=\"Harbor Tower\""));
    }

    #[test]
    fn two_letter_prefix_listed_first() {
        assert_eq!(DISCIPLINE_PREFIXES[0].0, "FP");
    }
}
