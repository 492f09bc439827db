//! Minimal JSON-RPC 2.0 client used to talk to an Ethereum node.
//!
//! Requests are plain structs serialized with serde and posted over awc,
//! responses are parsed into either a result or a node-side error which is
//! surfaced unchanged as a [`BrokerError::JsonRpcError`].

use crate::error::BrokerError;
use awc::http::header;
use awc::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on response bodies, large enough for any receipt or block
/// the broker asks for
const RESPONSE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Serialize, Deserialize, Debug)]
pub struct Request<T> {
    id: u64,
    jsonrpc: String,
    method: String,
    params: T,
}

impl<T> Request<T> {
    pub fn new(id: u64, method: &str, params: T) -> Self {
        Self {
            id,
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum ResponseData<R> {
    Error { error: JsonRpcError },
    Success { result: R },
}

impl<R> ResponseData<R> {
    /// Consume response and return value
    pub fn into_result(self) -> Result<R, JsonRpcError> {
        match self {
            ResponseData::Success { result } => Ok(result),
            ResponseData::Error { error } => Err(error),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response<R> {
    pub id: Value,
    pub jsonrpc: String,
    #[serde(flatten)]
    pub data: ResponseData<R>,
}

#[derive(Clone)]
pub struct HttpClient {
    id_counter: Arc<Mutex<RefCell<u64>>>,
    url: String,
    client: Client,
}

impl HttpClient {
    pub fn new(url: &str) -> Self {
        Self {
            id_counter: Arc::new(Mutex::new(RefCell::new(0u64))),
            url: url.to_string(),
            client: Client::default(),
        }
    }

    fn next_id(&self) -> u64 {
        let counter = self.id_counter.clone();
        let counter = counter.lock().expect("id error");
        let mut value = counter.borrow_mut();
        *value += 1;
        *value
    }

    pub async fn request_method<T, R>(
        &self,
        method: &str,
        params: T,
        timeout: Duration,
    ) -> Result<R, BrokerError>
    where
        R: 'static,
        for<'de> R: Deserialize<'de>,
        T: Serialize,
        T: std::fmt::Debug,
        R: std::fmt::Debug,
    {
        trace!("Making request {} {:?}", method, params);
        let payload = Request::new(self.next_id(), method, params);
        let res = self
            .client
            .post(&self.url)
            .append_header((header::CONTENT_TYPE, "application/json"))
            .timeout(timeout)
            .send_json(&payload)
            .await;
        let mut res = match res {
            Ok(val) => val,
            Err(e) => return Err(BrokerError::FailedToSend(e)),
        };

        let body_bytes = match res.body().limit(RESPONSE_SIZE_LIMIT).await {
            Ok(val) => val,
            Err(e) => {
                return Err(BrokerError::BadResponse(format!(
                    "Size limit {RESPONSE_SIZE_LIMIT} exceeded or read failed: {e}"
                )))
            }
        };

        let decoded: Response<R> = match serde_json::from_slice(&body_bytes) {
            Ok(val) => val,
            Err(e) => {
                let body_str = String::from_utf8_lossy(&body_bytes);
                return Err(BrokerError::BadResponse(format!(
                    "Failed to parse response: {e}\nRaw response: {body_str}"
                )));
            }
        };
        trace!("got jsonrpc response {:#?}", decoded);

        match decoded.data.into_result() {
            Ok(r) => Ok(r),
            Err(e) => Err(BrokerError::JsonRpcError {
                code: e.code,
                message: e.message,
                data: format!("{:?}", e.data),
            }),
        }
    }
}

#[test]
fn test_response() {
    let response: Response<u64> =
        serde_json::from_str(r#"{"jsonrpc": "2.0", "result": 19, "id": 1}"#).unwrap();
    assert_eq!(response.id.as_u64().unwrap(), 1);
    assert_eq!(response.data.into_result().unwrap(), 19);
}

#[test]
fn test_error() {
    let response: Response<Value> = serde_json::from_str(r#"{"jsonrpc": "2.0", "error": {"code": -32601, "message": "Method not found"}, "id": "1"}"#).unwrap();
    assert_eq!(response.id.as_str().unwrap(), "1");
    let err = response.data.into_result().unwrap_err();
    assert_eq!(err.code, -32601);
    assert_eq!(err.message, "Method not found");
}
