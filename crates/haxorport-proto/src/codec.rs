//! JSON codec for control-channel frames.
//!
//! Frames are UTF-8 JSON text. Decoding is deliberately lenient about
//! content it does not understand: an unrecognized tag still decodes, with
//! the tag string and payload preserved, so the dispatcher can decide what
//! to do with it. Only malformed JSON and a missing `type` field are errors.

use serde::Serialize;
use thiserror::Error;

use crate::messages::{Envelope, MessageType};

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is missing the `type` field")]
    MissingType,
}

/// Encode a tagged payload into frame bytes.
pub fn encode<P: Serialize>(message_type: MessageType, payload: &P) -> Result<Vec<u8>, CodecError> {
    let envelope = Envelope::new(message_type, payload)?;
    Ok(serde_json::to_vec(&envelope)?)
}

/// Encode an already-built envelope into the text form sent on the wire.
pub fn to_text(envelope: &Envelope) -> Result<String, CodecError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode frame bytes into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    match serde_json::from_slice::<Envelope>(bytes) {
        Ok(envelope) => Ok(envelope),
        Err(err) => {
            // A structurally valid object without `type` is reported
            // distinctly from broken JSON.
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
                if value.get("type").is_none() {
                    return Err(CodecError::MissingType);
                }
            }
            Err(CodecError::Malformed(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;

    fn round_trip<P>(message_type: MessageType, payload: &P) -> P
    where
        P: Serialize + serde::de::DeserializeOwned + PartialEq + std::fmt::Debug,
    {
        let bytes = encode(message_type.clone(), payload).unwrap();
        let envelope = decode(&bytes).unwrap();
        assert_eq!(envelope.message_type, message_type);
        envelope.parse_payload().unwrap()
    }

    #[test]
    fn round_trips_every_payload_shape() {
        let auth = AuthPayload {
            token: "tok".to_string(),
        };
        assert_eq!(round_trip(MessageType::Auth, &auth), auth);

        let register = RegisterPayload {
            tunnel_type: TunnelType::Http,
            subdomain: Some("app".to_string()),
            local_addr: Some("127.0.0.1".to_string()),
            local_port: 8080,
            remote_port: None,
            auth: Some(TunnelAuth::Header {
                header_name: "X-Key".to_string(),
                header_value: "v".to_string(),
            }),
        };
        assert_eq!(round_trip(MessageType::Register, &register), register);

        let reply = RegisterResponsePayload {
            success: true,
            tunnel_id: "t1".to_string(),
            url: Some("https://app.haxorport.online".to_string()),
            remote_port: None,
            error: None,
        };
        assert_eq!(round_trip(MessageType::Register, &reply), reply);

        let unregister = UnregisterPayload {
            tunnel_id: "t1".to_string(),
        };
        assert_eq!(round_trip(MessageType::Unregister, &unregister), unregister);

        let data = DataPayload {
            tunnel_id: "t2".to_string(),
            connection_id: "t2-99".to_string(),
            data: vec![0, 1, 2, 255],
        };
        assert_eq!(round_trip(MessageType::Data, &data), data);

        let error = ErrorPayload {
            code: "AUTH".to_string(),
            message: "bad token".to_string(),
        };
        assert_eq!(round_trip(MessageType::Error, &error), error);

        let request = HttpRequestPayload {
            request: HttpRequestData {
                id: "r1".to_string(),
                tunnel_id: "t1".to_string(),
                method: "GET".to_string(),
                url: "/".to_string(),
                headers: HeaderMap::new(),
                body: None,
                local_port: 8080,
                remote_addr: "1.2.3.4".to_string(),
                scheme: None,
            },
        };
        assert_eq!(round_trip(MessageType::HttpRequest, &request), request);

        let response = HttpResponsePayload {
            response: HttpResponseData {
                id: "r1".to_string(),
                status_code: 200,
                headers: HeaderMap::new(),
                body: Some(b"ok".to_vec()),
                error: None,
            },
        };
        assert_eq!(round_trip(MessageType::HttpResponse, &response), response);
    }

    #[test]
    fn ping_and_pong_have_null_payloads() {
        let text = to_text(&Envelope::empty(MessageType::Ping)).unwrap();
        let envelope = decode(text.as_bytes()).unwrap();
        assert_eq!(envelope.message_type, MessageType::Ping);
        assert!(envelope.payload.is_none());
    }

    #[test]
    fn unknown_tag_decodes_with_payload_retained() {
        let frame = br#"{"type":"topology_update","version":"1.0.0","timestamp":1,"payload":{"nodes":3}}"#;
        let envelope = decode(frame).unwrap();
        assert_eq!(
            envelope.message_type,
            MessageType::Unknown("topology_update".to_string())
        );
        let payload: serde_json::Value = envelope.parse_payload().unwrap();
        assert_eq!(payload["nodes"], 3);
    }

    #[test]
    fn missing_type_is_rejected() {
        let frame = br#"{"version":"1.0.0","timestamp":1}"#;
        assert!(matches!(decode(frame), Err(CodecError::MissingType)));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            decode(b"{not json"),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn missing_version_and_timestamp_are_tolerated() {
        let frame = br#"{"type":"pong"}"#;
        let envelope = decode(frame).unwrap();
        assert_eq!(envelope.message_type, MessageType::Pong);
        assert_eq!(envelope.version, PROTOCOL_VERSION);
        assert_eq!(envelope.timestamp, 0);
    }
}
