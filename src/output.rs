//! Extraction output types.
//!
//! Field names serialise as camelCase so the persisted `result` payload keeps
//! the shape downstream readers already consume:
//!
//! ```text
//! { pageCount, pages: [{ pageNumber, data }], summary?: { projectMatch?,
//!   uniqueDrawings[], sheetTitles[], disciplines[] }, error? }
//! ```
//!
//! Every field of [`ExtractedDocumentData`] is optional: partial extraction
//! is the normal case for construction drawings, not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Candidate association between a document and a known project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectMatch {
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub address: Option<String>,
    /// 0.0–1.0
    #[serde(deserialize_with = "lenient_confidence")]
    pub confidence: f64,
}

/// Models send `null`, `"0.8"` or nothing at all; anything that is not a
/// number reads as 0.0 rather than failing the page.
fn lenient_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok(),
        _ => None,
    };
    Ok(parsed.filter(|c| c.is_finite()).unwrap_or(0.0))
}

/// Title-block fields of a drawing sheet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrawingInfo {
    pub drawing_number: Option<String>,
    pub sheet_number: Option<String>,
    pub sheet_title: Option<String>,
    pub revision: Option<String>,
    pub scale: Option<String>,
    pub discipline: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocationInfo {
    pub building: Option<String>,
    pub floor: Option<String>,
    pub zone: Option<String>,
    pub room: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DateInfo {
    pub issue_date: Option<String>,
    pub revision_date: Option<String>,
}

/// Semantic content pulled from one page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractedDocumentData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_match: Option<ProjectMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drawing: Option<DrawingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dates: Option<DateInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractedDocumentData {
    /// A record carrying only an error message.
    pub fn from_error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn drawing_number(&self) -> Option<&str> {
        self.drawing.as_ref()?.drawing_number.as_deref()
    }

    pub fn sheet_title(&self) -> Option<&str> {
        self.drawing.as_ref()?.sheet_title.as_deref()
    }

    pub fn discipline(&self) -> Option<&str> {
        self.drawing.as_ref()?.discipline.as_deref()
    }
}

/// One page's record within a multi-page run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageExtraction {
    /// 1-indexed
    pub page_number: usize,
    pub data: ExtractedDocumentData,
}

/// Document-level roll-up across all analysed pages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_match: Option<ProjectMatch>,
    pub unique_drawings: Vec<String>,
    pub sheet_titles: Vec<String>,
    pub disciplines: Vec<String>,
}

/// The result payload stored on a COMPLETED job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    /// True page count of the document, including pages beyond the cap.
    pub page_count: usize,
    pub pages: Vec<PageExtraction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExtractionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractionResult {
    /// Wrap a single page's data (single-page path).
    pub fn single_page(page_count: usize, data: ExtractedDocumentData) -> Self {
        let pages = vec![PageExtraction {
            page_number: 1,
            data,
        }];
        let summary = crate::pipeline::aggregate::summarize(&pages);
        let error = pages[0].data.error.clone();
        Self {
            page_count,
            pages,
            summary: Some(summary),
            error,
        }
    }

    /// Best available data for the denormalised metadata projection:
    /// the summary's project match plus the first page carrying a drawing.
    fn primary_page(&self) -> Option<&ExtractedDocumentData> {
        self.pages
            .iter()
            .map(|p| &p.data)
            .find(|d| d.drawing.is_some())
            .or_else(|| self.pages.first().map(|p| &p.data))
    }
}

/// Denormalised, one-per-file projection of the most recent extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub file_id: String,
    pub drawing_number: Option<String>,
    pub title: Option<String>,
    pub discipline: Option<String>,
    pub scale: Option<String>,
    pub building: Option<String>,
    pub floor: Option<String>,
    pub zone: Option<String>,
    pub room: Option<String>,
    pub confidence: Option<f64>,
    pub raw_response: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl DocumentMetadata {
    /// Project an extraction result onto the per-file metadata row.
    pub fn from_result(file_id: impl Into<String>, result: &ExtractionResult) -> Self {
        let page = result.primary_page();
        let drawing = page.and_then(|d| d.drawing.clone()).unwrap_or_default();
        let location = page.and_then(|d| d.location.clone()).unwrap_or_default();
        let confidence = result
            .summary
            .as_ref()
            .and_then(|s| s.project_match.as_ref())
            .map(|m| m.confidence);

        Self {
            file_id: file_id.into(),
            drawing_number: drawing.drawing_number,
            title: drawing.sheet_title,
            discipline: drawing.discipline,
            scale: drawing.scale,
            building: location.building,
            floor: location.floor,
            zone: location.zone,
            room: location.room,
            confidence,
            raw_response: serde_json::to_value(result).unwrap_or(serde_json::Value::Null),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drawing(number: &str, title: &str) -> ExtractedDocumentData {
        ExtractedDocumentData {
            drawing: Some(DrawingInfo {
                drawing_number: Some(number.into()),
                sheet_title: Some(title.into()),
                scale: Some("1/8\" = 1'-0\"".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn result_serialises_with_camel_case_shape() {
        let result = ExtractionResult {
            page_count: 2,
            pages: vec![PageExtraction {
                page_number: 1,
                data: drawing("A-101", "Floor Plan"),
            }],
            summary: Some(ExtractionSummary {
                unique_drawings: vec!["A-101".into()],
                ..Default::default()
            }),
            error: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["pageCount"], 2);
        assert_eq!(json["pages"][0]["pageNumber"], 1);
        assert_eq!(json["pages"][0]["data"]["drawing"]["drawingNumber"], "A-101");
        assert_eq!(json["summary"]["uniqueDrawings"][0], "A-101");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn metadata_prefers_page_with_drawing() {
        let result = ExtractionResult {
            page_count: 2,
            pages: vec![
                PageExtraction {
                    page_number: 1,
                    data: ExtractedDocumentData::from_error("cover sheet"),
                },
                PageExtraction {
                    page_number: 2,
                    data: drawing("S-201", "Foundation Plan"),
                },
            ],
            summary: None,
            error: None,
        };
        let meta = DocumentMetadata::from_result("file-1", &result);
        assert_eq!(meta.drawing_number.as_deref(), Some("S-201"));
        assert_eq!(meta.title.as_deref(), Some("Foundation Plan"));
        assert_eq!(meta.confidence, None);
        assert_eq!(meta.raw_response["pageCount"], 2);
    }

    #[test]
    fn partial_data_deserialises() {
        let data: ExtractedDocumentData =
            serde_json::from_str(r#"{"drawing":{"sheetTitle":"Site Plan"}}"#).unwrap();
        assert_eq!(data.sheet_title(), Some("Site Plan"));
        assert_eq!(data.drawing_number(), None);
        assert!(data.location.is_none());
    }
}
