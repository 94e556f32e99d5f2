use crate::types::{MisrError, MisrResult, ProcessingConfig, SourceGranule};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Region parameters forwarded to the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRequest {
    pub lat: f64,
    pub lon: f64,
    pub margin: f64,
    pub resolution: f64,
}

/// One request line on the worker's stdin
///
/// Ids increase monotonically per bridge; the worker must echo the id in
/// its response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub op: String,
    pub path: PathBuf,
    pub region: RegionRequest,
    pub field: String,
    pub qa_enabled: bool,
}

impl WorkerRequest {
    pub fn process(id: u64, granule: &SourceGranule, config: &ProcessingConfig) -> Self {
        Self {
            id,
            op: "process".to_string(),
            path: granule.path.clone(),
            region: RegionRequest {
                lat: config.target_lat,
                lon: config.target_lon,
                margin: config.region_margin,
                resolution: config.target_resolution,
            },
            field: config.field_name.clone(),
            qa_enabled: config.enable_qa_filtering,
        }
    }
}

/// Worker verdict for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// One response line on the worker's stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: u64,
    pub status: ResponseStatus,
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Serialize a request to its single-line wire form (no trailing newline)
pub fn encode_request(request: &WorkerRequest) -> MisrResult<String> {
    serde_json::to_string(request)
        .map_err(|e| MisrError::BridgeProtocol(format!("cannot encode request: {}", e)))
}

/// Parse one response line; any malformed line is a protocol violation
pub fn decode_response(line: &str) -> MisrResult<WorkerResponse> {
    serde_json::from_str(line.trim())
        .map_err(|e| MisrError::BridgeProtocol(format!("malformed response line: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GranuleFormat;

    fn granule() -> SourceGranule {
        SourceGranule {
            path: PathBuf::from("/data/MISR_AM1_GRP_TERRAIN_GM_P043_O120540_AN.hdf"),
            format: GranuleFormat::ToolkitOnly,
            stem: "MISR_AM1_GRP_TERRAIN_GM_P043_O120540_AN".to_string(),
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let config = ProcessingConfig {
            target_lat: 52.15,
            target_lon: -117.29,
            ..ProcessingConfig::default()
        };
        let request = WorkerRequest::process(7, &granule(), &config);
        let line = encode_request(&request).unwrap();

        assert!(!line.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["op"], "process");
        assert_eq!(value["region"]["lat"], 52.15);
        assert_eq!(value["region"]["margin"], 2.0);
        assert_eq!(value["field"], "Red Radiance/RDQI");
        assert_eq!(value["qa_enabled"], false);
    }

    #[test]
    fn test_decode_ok_response() {
        let response =
            decode_response(r#"{"id":3,"status":"ok","artifact_path":"/tmp/out.tif","error":null}"#)
                .unwrap();
        assert_eq!(response.id, 3);
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.artifact_path, Some(PathBuf::from("/tmp/out.tif")));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_decode_error_response() {
        let response =
            decode_response(r#"{"id":4,"status":"error","artifact_path":null,"error":"bad block"}"#)
                .unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error.as_deref(), Some("bad block"));
    }

    #[test]
    fn test_optional_fields_default() {
        let response = decode_response(r#"{"id":5,"status":"ok"}"#).unwrap();
        assert!(response.artifact_path.is_none());
        assert!(response.error.is_none());
    }

    #[test]
    fn test_malformed_line_is_protocol_violation() {
        for line in ["not json", "{\"id\":}", "{\"status\":\"ok\"}", ""] {
            assert!(
                matches!(decode_response(line), Err(MisrError::BridgeProtocol(_))),
                "line {:?} should be rejected",
                line
            );
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert!(matches!(
            decode_response(r#"{"id":1,"status":"maybe"}"#),
            Err(MisrError::BridgeProtocol(_))
        ));
    }
}
