use serde::Serialize;

use crate::RawPoint;

/// Why a single point of a write request was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The point failed validation.
    Invalid,
    /// The row store failed to write the point.
    Storage,
    /// The ingest queue was full.
    Dropped,
}

/// A write request can carry many points. Valid points are written while an
/// error is returned for every invalid one. This is the error information for
/// a single rejected point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PointFailure {
    /// Position of the point in the request body.
    pub index: usize,
    pub point: RawPoint,
    pub kind: FailureKind,
    pub error_message: String,
}

/// Response body for a write that was only partially accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResponse {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<PointFailure>,
}

impl WriteResponse {
    pub fn new(success: usize, errors: Vec<PointFailure>) -> Self {
        Self {
            success,
            failed: errors.len(),
            errors,
        }
    }

    /// True if any point was rejected because of the request itself rather
    /// than a server side failure.
    pub fn has_invalid_points(&self) -> bool {
        self.errors.iter().any(|e| e.kind == FailureKind::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn serialize_response() {
        let response = WriteResponse::new(
            1,
            vec![PointFailure {
                index: 1,
                point: RawPoint::number("os.cpu", 2.0),
                kind: FailureKind::Invalid,
                error_message: "point has no tags".into(),
            }],
        );
        assert!(response.has_invalid_points());

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "success": 1,
                "failed": 1,
                "errors": [{
                    "index": 1,
                    "point": {"metric": "os.cpu", "tags": {}, "value": 2.0},
                    "kind": "invalid",
                    "error_message": "point has no tags",
                }],
            })
        );
    }
}
