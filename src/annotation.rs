//! Serde models for the labeling-job documents around the two stages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PrepError, Result};
use crate::geometry::{BoundingBox, Point};
use crate::locator::Locator;

/// Event handed to a stage once workers have finished annotating
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostAnnotationEvent {
    pub payload: Payload,
    pub label_attribute_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Payload {
    /// Locator of the manifest listing every annotated image
    #[serde(rename = "s3Uri")]
    pub s3_uri: String,
}

/// One annotated image in the manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestItem {
    pub dataset_object_id: Value,
    pub data_object: DataObject,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataObject {
    #[serde(rename = "s3Uri")]
    pub s3_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub annotation_data: AnnotationData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationData {
    /// A JSON document encoded as a string
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AnnotatedResult {
    polygons: Vec<Polygon>,
}

#[derive(Debug, Clone, Deserialize)]
struct Polygon {
    vertices: Vec<Point>,
}

/// Vertices of the first polygon in a corner annotation, or `None` when the
/// content carries no polygon result at all.
pub fn parse_polygon(content: &str) -> Result<Option<Vec<Point>>> {
    let doc: Value = serde_json::from_str(content)?;
    let Some(result) = doc.get("annotatedResult") else {
        return Ok(None);
    };
    let result: AnnotatedResult = serde_json::from_value(result.clone())?;
    let polygon = result
        .polygons
        .into_iter()
        .next()
        .ok_or_else(|| PrepError::Annotation("annotatedResult has no polygons".to_string()))?;
    Ok(Some(polygon.vertices))
}

/// Bounding boxes of a box annotation.
///
/// Labeling templates nest the list under a form field name, so
/// `boundingBoxes` is looked up at the top level first and then one level
/// down. Every box needs a non-blank label.
pub fn parse_bounding_boxes(content: &str) -> Result<Vec<BoundingBox>> {
    let doc: Value = serde_json::from_str(content)?;
    let boxes = doc.get("boundingBoxes").or_else(|| {
        doc.as_object()?
            .values()
            .find_map(|field| field.get("boundingBoxes"))
    });
    let boxes: Vec<BoundingBox> = match boxes {
        Some(boxes) => serde_json::from_value(boxes.clone())?,
        None => {
            return Err(PrepError::Annotation(
                "content has no boundingBoxes list".to_string(),
            ))
        }
    };
    // Labels become key segments of the training crops.
    if let Some(index) = boxes.iter().position(|b| b.label.trim().is_empty()) {
        return Err(PrepError::Annotation(format!(
            "bounding box {} has an empty label",
            index
        )));
    }
    Ok(boxes)
}

/// Consolidated label for one dataset object
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedRecord {
    pub dataset_object_id: Value,
    pub consolidated_annotation: ConsolidatedAnnotation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedAnnotation {
    pub content: Map<String, Value>,
}

impl ConsolidatedRecord {
    pub fn new(dataset_object_id: Value, source_ref: &Locator, label_attribute: &str) -> Self {
        let mut content = Map::new();
        content.insert("source-ref".to_string(), Value::String(source_ref.to_string()));
        content.insert(label_attribute.to_string(), Value::Object(Map::new()));
        Self {
            dataset_object_id,
            consolidated_annotation: ConsolidatedAnnotation { content },
        }
    }
}

/// Event handed to the hook that prepares a labeling task
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAnnotationEvent {
    #[serde(default)]
    pub labeling_job_arn: Option<String>,
    pub data_object: TaskDataObject,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskDataObject {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, rename = "source-ref")]
    pub source_ref: Option<String>,
}

impl TaskDataObject {
    /// Inline `source` wins over `source-ref`
    pub fn task_object(&self) -> Option<&str> {
        self.source.as_deref().or(self.source_ref.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAnnotationResponse {
    pub task_input: TaskInput,
    /// Kept as the strings "true"/"false", as the labeling service expects
    pub human_annotation_required: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInput {
    pub task_object: Option<String>,
}

impl PreAnnotationResponse {
    pub fn new(task_object: Option<String>) -> Self {
        let required = task_object.is_some();
        Self {
            task_input: TaskInput { task_object },
            human_annotation_required: required.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_polygon_content() {
        let content = json!({
            "annotatedResult": {
                "polygons": [{"vertices": [
                    {"x": 1, "y": 2}, {"x": 30, "y": 2}, {"x": 1, "y": 40}, {"x": 30.5, "y": 41}
                ]}]
            }
        })
        .to_string();
        let vertices = parse_polygon(&content).unwrap().unwrap();
        assert_eq!(vertices.len(), 4);
        assert_eq!(vertices[3], Point::new(30.5, 41.0));
    }

    #[test]
    fn test_parse_polygon_absent_and_empty() {
        assert_eq!(parse_polygon(r#"{"other": 1}"#).unwrap(), None);
        assert!(matches!(
            parse_polygon(r#"{"annotatedResult": {"polygons": []}}"#),
            Err(PrepError::Annotation(_))
        ));
    }

    #[test]
    fn test_parse_nested_bounding_boxes() {
        let content = json!({
            "myTexts": {
                "boundingBoxes": [
                    {"top": 10, "left": 20, "width": 30, "height": 15, "label": "Empty"},
                    {"top": 50, "left": 5, "width": 8, "height": 9, "label": "Full"}
                ]
            }
        })
        .to_string();
        let boxes = parse_bounding_boxes(&content).unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[1].label, "Full");
    }

    #[test]
    fn test_parse_top_level_bounding_boxes() {
        let boxes = parse_bounding_boxes(r#"{"boundingBoxes": []}"#).unwrap();
        assert!(boxes.is_empty());
        assert!(parse_bounding_boxes(r#"{"x": {}}"#).is_err());
    }

    #[test]
    fn test_blank_box_label_is_rejected() {
        let content = json!({"boundingBoxes": [
            {"top": 1, "left": 2, "width": 3, "height": 4, "label": "Full"},
            {"top": 1, "left": 2, "width": 3, "height": 4, "label": " "}
        ]})
        .to_string();
        assert!(matches!(
            parse_bounding_boxes(&content),
            Err(PrepError::Annotation(msg)) if msg.contains("box 1")
        ));
    }

    #[test]
    fn test_consolidated_record_shape() {
        let loc = Locator::parse("s3://bucket/page-deskewed.jpg").unwrap();
        let record = ConsolidatedRecord::new(json!("7"), &loc, "corners");
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "datasetObjectId": "7",
                "consolidatedAnnotation": {
                    "content": {
                        "source-ref": "s3://bucket/page-deskewed.jpg",
                        "corners": {}
                    }
                }
            })
        );
    }

    #[test]
    fn test_task_object_prefers_source() {
        let both: TaskDataObject =
            serde_json::from_value(json!({"source": "inline", "source-ref": "s3://b/k"})).unwrap();
        assert_eq!(both.task_object(), Some("inline"));
        let reference: TaskDataObject =
            serde_json::from_value(json!({"source-ref": "s3://b/k"})).unwrap();
        assert_eq!(reference.task_object(), Some("s3://b/k"));
    }

    #[test]
    fn test_pre_annotation_response_without_task() {
        let response = PreAnnotationResponse::new(None);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"taskInput": {"taskObject": null}, "humanAnnotationRequired": "false"})
        );
    }
}
