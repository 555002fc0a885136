//! Indodax websocket envelope types.
//!
//! Every inbound field is optional on the wire, so all response structs use
//! `#[serde(default)]`: an auth reply, a subscription ack and a publication all
//! decode into the same [`WsResponse`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FeedError;

/// Method number for a channel subscription. The auth request has no method.
pub const METHOD_SUBSCRIBE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<u8>,
    pub params: WsParams,
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WsParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl WsRequest {
    pub fn auth(token: &str, client_id: i64) -> Self {
        Self {
            method: None,
            params: WsParams {
                token: Some(token.to_string()),
                ..WsParams::default()
            },
            id: client_id,
        }
    }

    pub fn subscribe(channel: String, client_id: i64) -> Self {
        Self {
            method: Some(METHOD_SUBSCRIBE),
            params: WsParams {
                channel: Some(channel),
                ..WsParams::default()
            },
            id: client_id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WsResponse {
    pub id: i64,
    pub result: WsResult,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WsResult {
    pub channel: String,
    pub data: WsPublication,
    /// Session id; non-empty only in the auth reply.
    pub client: String,
    pub version: String,
    pub expires: bool,
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WsPublication {
    pub data: Value,
    pub offset: i64,
}

/// Decode every JSON value in a text frame.
///
/// The venue may concatenate several values into one frame. Decoding stops at
/// the first malformed value; the values before it are still returned.
pub fn decode_frame(text: &str) -> (Vec<WsResponse>, Option<FeedError>) {
    let mut values = Vec::new();
    for value in serde_json::Deserializer::from_str(text).into_iter::<WsResponse>() {
        match value {
            Ok(v) => values.push(v),
            Err(e) => return (values, Some(FeedError::from(e))),
        }
    }
    (values, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_request_has_no_method() {
        let json = serde_json::to_value(WsRequest::auth("tok", 42)).unwrap();
        assert_eq!(json, serde_json::json!({"params": {"token": "tok"}, "id": 42}));
    }

    #[test]
    fn subscribe_request_carries_method_and_channel() {
        let json = serde_json::to_value(WsRequest::subscribe("market:trade-activity-btcidr".into(), 7)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"method": 1, "params": {"channel": "market:trade-activity-btcidr"}, "id": 7})
        );
    }

    #[test]
    fn concatenated_values_are_all_decoded() {
        let frame = r#"{"result":{"channel":"a","data":{"data":[1],"offset":3}}}
{"result":{"channel":"b","data":{"data":{"pair":"btcidr"},"offset":4}}}"#;
        let (values, err) = decode_frame(frame);
        assert!(err.is_none());
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].result.channel, "a");
        assert_eq!(values[0].result.data.offset, 3);
        assert_eq!(values[1].result.data.data["pair"], "btcidr");
    }

    #[test]
    fn auth_reply_decodes_client() {
        let (values, _) = decode_frame(
            r#"{"id":1,"result":{"client":"abc-123","version":"2.8.5","expires":true,"ttl":900}}"#,
        );
        assert_eq!(values[0].result.client, "abc-123");
        assert!(values[0].result.expires);
        assert_eq!(values[0].result.ttl, 900);
    }

    #[test]
    fn malformed_tail_keeps_earlier_values() {
        let (values, err) = decode_frame(r#"{"result":{"channel":"a"}}{"result":"#);
        assert_eq!(values.len(), 1);
        assert!(matches!(err, Some(FeedError::Decode(_))));
    }
}
