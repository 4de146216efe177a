//! Payload encoding for published and received data.
//!
//! The `encoding` field lists transformations applied to `data`, outermost
//! last, separated by `/`. Decoding unwinds them right to left.

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::channel::ChannelOptions;
use crate::error::{codes, ErrorInfo};

/// A payload that could not be decoded.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("decode failure: {0}")]
pub struct DecodeFailure(pub ErrorInfo);

impl DecodeFailure {
    pub fn code(&self) -> u32 {
        self.0.code
    }

    /// Continuity with earlier messages is lost; the channel must resync.
    pub fn needs_recovery(&self) -> bool {
        self.code() == codes::DELTA_DECODE_FAILED
    }

    /// No recovery is possible on this channel.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code(),
            codes::VCDIFF_UNSUPPORTED | codes::DELTA_BASE_UNAVAILABLE
        )
    }
}

pub trait MessageCodec: Send + Sync {
    fn encode(
        &self,
        data: &mut Option<Value>,
        encoding: &mut Option<String>,
        options: &ChannelOptions,
    ) -> Result<(), ErrorInfo>;

    fn decode(
        &self,
        data: &mut Option<Value>,
        encoding: &mut Option<String>,
        options: &ChannelOptions,
    ) -> Result<(), DecodeFailure>;
}

/// Handles the `json` and `utf-8` encodings.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode(
        &self,
        data: &mut Option<Value>,
        encoding: &mut Option<String>,
        _options: &ChannelOptions,
    ) -> Result<(), ErrorInfo> {
        let Some(value @ (Value::Object(_) | Value::Array(_))) = data.as_ref() else {
            return Ok(());
        };
        let text = serde_json::to_string(value).map_err(|e| {
            ErrorInfo::new(codes::BAD_REQUEST, 400, format!("Unable to encode data: {e}"))
        })?;
        *data = Some(Value::String(text));
        *encoding = Some(match encoding.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}/json"),
            _ => "json".to_string(),
        });
        Ok(())
    }

    fn decode(
        &self,
        data: &mut Option<Value>,
        encoding: &mut Option<String>,
        _options: &ChannelOptions,
    ) -> Result<(), DecodeFailure> {
        let Some(chain) = encoding.take().filter(|e| !e.is_empty()) else {
            return Ok(());
        };
        let mut steps: Vec<&str> = chain.split('/').collect();

        while let Some(step) = steps.last().copied() {
            match step {
                "utf-8" => {}
                "json" => {
                    let Some(Value::String(text)) = data.as_ref() else {
                        break;
                    };
                    let parsed = serde_json::from_str(text).map_err(|e| {
                        DecodeFailure(ErrorInfo::new(
                            codes::BAD_REQUEST,
                            400,
                            format!("Error processing the json encoding: {e}"),
                        ))
                    })?;
                    *data = Some(parsed);
                }
                "vcdiff" => {
                    *encoding = Some(steps.join("/"));
                    return Err(DecodeFailure(ErrorInfo::new(
                        codes::VCDIFF_UNSUPPORTED,
                        400,
                        "Missing vcdiff decoder",
                    )));
                }
                other => {
                    debug!(encoding = other, "Leaving unsupported encoding in place");
                    break;
                }
            }
            steps.pop();
        }

        *encoding = (!steps.is_empty()).then(|| steps.join("/"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(value: Value) -> (Option<Value>, Option<String>) {
        let codec = JsonCodec;
        let options = ChannelOptions::default();
        let mut data = Some(value);
        let mut encoding = None;
        codec.encode(&mut data, &mut encoding, &options).unwrap();
        (data, encoding)
    }

    #[test]
    fn objects_are_json_encoded() {
        let (data, encoding) = roundtrip(json!({"a": 1}));
        assert_eq!(encoding.as_deref(), Some("json"));
        assert_eq!(data, Some(json!("{\"a\":1}")));
    }

    #[test]
    fn strings_pass_through() {
        let (data, encoding) = roundtrip(json!("hello"));
        assert_eq!(encoding, None);
        assert_eq!(data, Some(json!("hello")));
    }

    #[test]
    fn decode_unwinds_chain() {
        let mut data = Some(json!("[1,2]"));
        let mut encoding = Some("utf-8/json".to_string());
        JsonCodec
            .decode(&mut data, &mut encoding, &ChannelOptions::default())
            .unwrap();
        assert_eq!(data, Some(json!([1, 2])));
        assert_eq!(encoding, None);
    }

    #[test]
    fn unknown_outer_encoding_is_left_in_place() {
        let mut data = Some(json!("abc"));
        let mut encoding = Some("json/cipher+aes".to_string());
        JsonCodec
            .decode(&mut data, &mut encoding, &ChannelOptions::default())
            .unwrap();
        assert_eq!(encoding.as_deref(), Some("json/cipher+aes"));
    }

    #[test]
    fn vcdiff_is_fatal() {
        let mut data = Some(json!("delta"));
        let mut encoding = Some("vcdiff".to_string());
        let err = JsonCodec
            .decode(&mut data, &mut encoding, &ChannelOptions::default())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!err.needs_recovery());
    }

    #[test]
    fn malformed_json_is_a_failure() {
        let mut data = Some(json!("{nope"));
        let mut encoding = Some("json".to_string());
        let err = JsonCodec
            .decode(&mut data, &mut encoding, &ChannelOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), 40000);
    }
}
