//! Call/reply envelopes and their framing.
//!
//! Each message is a 4-byte big-endian length followed by a JSON envelope.
//! Calls on one connection are strictly sequential: a request, then its
//! reply carrying the same `seq`.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::Result;

/// Largest envelope either side accepts.
pub const MAX_MESSAGE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(seq: u64, result: Value) -> Self {
        Self {
            seq,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            result: None,
            error: Some(message.into()),
        }
    }
}

/// A connection speaking the envelope framing.
pub type RpcFramed<T> = Framed<T, LengthDelimitedCodec>;

pub fn framed<T>(io: T) -> RpcFramed<T>
where
    T: AsyncRead + AsyncWrite,
{
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE)
        .new_framed(io)
}

pub fn encode<M: Serialize>(message: &M) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<M> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn response_omits_absent_fields() {
        let ok = serde_json::to_value(Response::ok(4, json!({"version": "0.3.0"}))).unwrap();
        assert_eq!(ok, json!({"seq": 4, "result": {"version": "0.3.0"}}));

        let err = serde_json::to_value(Response::err(5, "boom")).unwrap();
        assert_eq!(err, json!({"seq": 5, "error": "boom"}));
    }

    #[test]
    fn request_params_default_to_null() {
        let request: Request = decode(br#"{"seq":1,"method":"Tarmak.Ping"}"#).unwrap();
        assert_eq!(request.params, Value::Null);
    }

    #[tokio::test]
    async fn envelopes_are_length_prefixed() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut framed_a = framed(a);
        let request = Request {
            seq: 1,
            method: "Tarmak.Ping".into(),
            params: json!({}),
        };
        framed_a.send(encode(&request).unwrap()).await.unwrap();

        let len = b.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        b.read_exact(&mut body).await.unwrap();
        assert_eq!(decode::<Request>(&body).unwrap(), request);
    }

    #[tokio::test]
    async fn oversized_envelope_is_rejected() {
        let (a, b) = tokio::io::duplex(64);
        let mut reader = framed(b);
        let writer = tokio::spawn(async move {
            let mut a = a;
            a.write_u32((MAX_MESSAGE + 1) as u32).await.unwrap();
        });
        let err = reader.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
        writer.await.unwrap();
    }
}
