//! Request body encoding and response body decoding.
//!
//! Both directions are plain functions: the executor calls [`encode`] once
//! per attempt after the request chain has run, and [`decode`] once per
//! transport response before the status check.

use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::config::{ContentType, ResponseType};
use crate::error::Error;
use crate::transport::{TransportError, TransportResponse};
use crate::util::lock_unpoisoned;

/// Payload attached to a request before content negotiation.
#[derive(Clone, Debug)]
pub enum RequestPayload {
    /// Structured data. Encoded according to the content-type hint.
    Json(Value),
    Text(String),
    /// Already-encoded binary content, sent untouched.
    Bytes(Bytes),
    /// Already-built URL-encoded pairs, sent untouched.
    UrlEncoded(Vec<(String, String)>),
    /// Multipart container; the transport chooses the boundary.
    Multipart(MultipartForm),
}

impl RequestPayload {
    pub fn json<T>(value: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_value(value).map(Self::Json).map_err(|source| {
            Error::caller(format!("failed to serialize request payload: {source}"))
                .with_source(source)
        })
    }
}

impl From<Value> for RequestPayload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<String> for RequestPayload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for RequestPayload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for RequestPayload {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<MultipartForm> for RequestPayload {
    fn from(value: MultipartForm) -> Self {
        Self::Multipart(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultipartForm {
    parts: Vec<MultipartPart>,
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: Bytes::from(value.into()),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(MultipartPart {
            name: name.into(),
            file_name: Some(file_name.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        });
        self
    }

    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    /// Serialize as `multipart/form-data` with the given boundary.
    pub fn encode(&self, boundary: &str) -> Bytes {
        let mut out = BytesMut::new();
        for part in &self.parts {
            out.put_slice(b"--");
            out.put_slice(boundary.as_bytes());
            out.put_slice(b"\r\n");
            let disposition = match &part.file_name {
                Some(file_name) => format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                    escape_quoted(&part.name),
                    escape_quoted(file_name)
                ),
                None => format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n",
                    escape_quoted(&part.name)
                ),
            };
            out.put_slice(disposition.as_bytes());
            if let Some(content_type) = &part.content_type {
                out.put_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
            }
            out.put_slice(b"\r\n");
            out.put_slice(&part.data);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"--");
        out.put_slice(boundary.as_bytes());
        out.put_slice(b"--\r\n");
        out.freeze()
    }
}

fn escape_quoted(value: &str) -> String {
    value.replace('"', "%22").replace(['\r', '\n'], " ")
}

/// Body as handed to the transport.
#[derive(Clone, Debug, Default)]
pub enum WireBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Multipart(MultipartForm),
}

impl WireBody {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Multipart(form) => form.parts().is_empty(),
        }
    }
}

/// Encode a payload for the wire and return the adjusted headers.
pub fn encode(
    payload: Option<&RequestPayload>,
    hint: Option<&ContentType>,
    mut headers: HeaderMap,
) -> crate::Result<(WireBody, HeaderMap)> {
    let Some(payload) = payload else {
        return Ok((WireBody::Empty, headers));
    };

    let body = match payload {
        RequestPayload::Bytes(bytes) => {
            if let Some(hint) = hint {
                set_default_content_type(&mut headers, hint.mime())?;
            }
            WireBody::Bytes(bytes.clone())
        }
        RequestPayload::UrlEncoded(pairs) => {
            set_default_content_type(&mut headers, ContentType::Form.mime())?;
            WireBody::Bytes(Bytes::from(encode_form_pairs(pairs)))
        }
        RequestPayload::Multipart(form) => {
            headers.remove(CONTENT_TYPE);
            WireBody::Multipart(form.clone())
        }
        RequestPayload::Text(text) => {
            let hint = hint.unwrap_or(&ContentType::Text);
            set_content_type(&mut headers, hint.mime())?;
            WireBody::Bytes(Bytes::from(text.clone()))
        }
        RequestPayload::Json(value) => match hint {
            None | Some(ContentType::Json) => {
                set_content_type(&mut headers, ContentType::Json.mime())?;
                WireBody::Bytes(Bytes::from(value.to_string()))
            }
            Some(ContentType::Form) => {
                let pairs = flatten_form_pairs(value).ok_or_else(|| {
                    Error::caller("form encoding requires an object payload")
                })?;
                set_content_type(&mut headers, ContentType::Form.mime())?;
                WireBody::Bytes(Bytes::from(encode_form_pairs(&pairs)))
            }
            Some(hint) => {
                set_content_type(&mut headers, hint.mime())?;
                WireBody::Bytes(Bytes::from(stringify(value)))
            }
        },
    };
    Ok((body, headers))
}

fn set_content_type(headers: &mut HeaderMap, mime: &str) -> crate::Result<()> {
    let value = HeaderValue::from_str(mime).map_err(|source| {
        Error::caller(format!("invalid content type {mime}")).with_source(source)
    })?;
    headers.insert(CONTENT_TYPE, value);
    Ok(())
}

fn set_default_content_type(headers: &mut HeaderMap, mime: &str) -> crate::Result<()> {
    if headers.contains_key(CONTENT_TYPE) {
        return Ok(());
    }
    set_content_type(headers, mime)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Flatten a JSON object into form pairs. `null` members are skipped;
/// nested arrays and objects are written as JSON text.
pub(crate) fn flatten_form_pairs(value: &Value) -> Option<Vec<(String, String)>> {
    let object = value.as_object()?;
    Some(
        object
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| (name.clone(), stringify(value)))
            .collect(),
    )
}

fn encode_form_pairs(pairs: &[(String, String)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in pairs {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

/// Transport response handed back untouched for `ResponseType::Raw`.
///
/// Cloning shares the same underlying response; the first `take` wins.
#[derive(Clone)]
pub struct RawResponse {
    inner: Arc<Mutex<Option<TransportResponse>>>,
}

impl RawResponse {
    fn new(response: TransportResponse) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(response))),
        }
    }

    pub fn take(&self) -> Option<TransportResponse> {
        lock_unpoisoned(&self.inner).take()
    }
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let taken = lock_unpoisoned(&self.inner).is_none();
        formatter
            .debug_struct("RawResponse")
            .field("taken", &taken)
            .finish()
    }
}

/// Decoded response body.
#[derive(Clone, Debug)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Bytes(Bytes),
    Raw(RawResponse),
}

impl ResponseBody {
    pub fn empty_json() -> Self {
        Self::Json(Value::Object(Map::new()))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Deserialize the body into `T`, whatever shape it was decoded as.
    pub fn deserialize<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        match self {
            Self::Json(value) => T::deserialize(value),
            Self::Text(text) => serde_json::from_str(text),
            Self::Bytes(bytes) => serde_json::from_slice(bytes),
            Self::Raw(_) => Err(serde::de::Error::custom(
                "raw transport responses cannot be deserialized",
            )),
        }
    }

    fn empty_for(response_type: ResponseType) -> Self {
        match response_type {
            ResponseType::Auto | ResponseType::Json | ResponseType::Raw => Self::empty_json(),
            ResponseType::Text => Self::Text(String::new()),
            ResponseType::Bytes => Self::Bytes(Bytes::new()),
        }
    }
}

/// Decode a transport response according to the response-type hint.
pub async fn decode(
    response: TransportResponse,
    response_type: ResponseType,
    parse_json: bool,
) -> Result<ResponseBody, TransportError> {
    if response_type == ResponseType::Raw {
        return Ok(ResponseBody::Raw(RawResponse::new(response)));
    }
    if is_bodyless(response.status(), response.headers()) {
        return Ok(ResponseBody::empty_for(response_type));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_ascii_lowercase);
    let strategy = match response_type {
        ResponseType::Auto => negotiate(content_type.as_deref()),
        other => other,
    };

    let bytes = response.bytes().await?;
    Ok(match strategy {
        ResponseType::Bytes => ResponseBody::Bytes(bytes),
        ResponseType::Text => ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
        _ => decode_json_or_text(&bytes, parse_json),
    })
}

fn is_bodyless(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::NO_CONTENT {
        return true;
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        == Some(0)
}

fn negotiate(content_type: Option<&str>) -> ResponseType {
    let Some(content_type) = content_type else {
        return ResponseType::Json;
    };
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if essence.ends_with("json") {
        ResponseType::Json
    } else if essence.starts_with("text/") || essence.ends_with("xml") || essence.ends_with("html")
    {
        ResponseType::Text
    } else if essence.is_empty() {
        ResponseType::Json
    } else {
        ResponseType::Bytes
    }
}

fn decode_json_or_text(bytes: &Bytes, parse_json: bool) -> ResponseBody {
    if bytes.is_empty() {
        return ResponseBody::empty_json();
    }
    if parse_json && let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return ResponseBody::Json(value);
    }
    ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned())
}
