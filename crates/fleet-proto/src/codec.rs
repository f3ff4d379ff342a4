//! Binary frame codec
//!
//! One protocol message per transport frame, encoded with bincode.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::MAX_FRAME_SIZE;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Encode a message into a single frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode a single frame into a message
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, CodecError> {
    if frame.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bincode::deserialize(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        AgentConfigMap, AgentDescription, AgentRemoteConfig, AgentToServer, EffectiveConfig,
        KeyValue, ServerToAgent,
    };

    #[test]
    fn test_status_report_survives_codec() {
        let report = AgentToServer {
            instance_uid: "collector-1".to_string(),
            sequence_num: 7,
            agent_description: Some(AgentDescription {
                identifying_attributes: vec![KeyValue::new("service.name", "otelcol")],
                non_identifying_attributes: vec![],
            }),
            effective_config: Some(EffectiveConfig {
                config_map: AgentConfigMap::single(b"receivers: {}".to_vec(), "text/yaml"),
            }),
            ..Default::default()
        };

        let frame = encode_frame(&report).unwrap();
        let decoded: AgentToServer = decode_frame(&frame).unwrap();
        assert_eq!(decoded, report);
    }

    #[test]
    fn test_remote_config_survives_codec() {
        let remote =
            AgentRemoteConfig::new(AgentConfigMap::single(b"a: 1".to_vec(), "text/yaml"));
        let message = ServerToAgent {
            instance_uid: "collector-1".to_string(),
            remote_config: Some(remote.clone()),
            ..Default::default()
        };

        let frame = encode_frame(&message).unwrap();
        let decoded: ServerToAgent = decode_frame(&frame).unwrap();
        assert_eq!(decoded.remote_config, Some(remote));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let result: Result<AgentToServer, _> = decode_frame(&[]);
        assert!(matches!(result, Err(CodecError::EmptyFrame)));
    }

    #[test]
    fn test_garbage_frame_rejected() {
        let result: Result<AgentToServer, _> = decode_frame(&[0xff; 3]);
        assert!(matches!(result, Err(CodecError::Serialization(_))));
    }
}
