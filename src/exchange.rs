//! The captured-message model shared by every stage of the pipeline.
use crate::body::Body;
use crate::codec::EditedMessage;
use crate::encoding::{self, ContentCoding};
use crate::errors::{Error, Result};
use crate::pairing::PAIR_ID_HEADER;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

/// Whether a record is the client's request or the upstream's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
  /// client to upstream
  Request,
  /// upstream to client
  Response,
}

impl fmt::Display for ExchangeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ExchangeKind::Request => f.write_str("request"),
      ExchangeKind::Response => f.write_str("response"),
    }
  }
}

/// Request methods observers can filter on. Anything else maps to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  /// GET
  Get,
  /// POST
  Post,
  /// DELETE
  Delete,
  /// HEAD
  Head,
  /// OPTIONS
  Options,
  /// PATCH
  Patch,
  /// TRACE
  Trace,
}

impl Method {
  /// Case-insensitive lookup of a method token.
  pub fn parse(token: &str) -> Option<Self> {
    match token.to_ascii_uppercase().as_str() {
      "GET" => Some(Method::Get),
      "POST" => Some(Method::Post),
      "DELETE" => Some(Method::Delete),
      "HEAD" => Some(Method::Head),
      "OPTIONS" => Some(Method::Options),
      "PATCH" => Some(Method::Patch),
      "TRACE" => Some(Method::Trace),
      _ => None,
    }
  }

  /// Upper-case token.
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Delete => "DELETE",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Patch => "PATCH",
      Method::Trace => "TRACE",
    }
  }
}

/// Reconstruct the display form of a header name: every `-` separated
/// segment capitalized, e.g. `content-type` becomes `Content-Type`.
pub fn display_name(name: &str) -> String {
  name
    .split('-')
    .map(|segment| {
      let mut chars = segment.chars();
      match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
      }
    })
    .collect::<Vec<String>>()
    .join("-")
}

/// Ordered header list of typed names and raw values. Names are lower-cased
/// by [`HeaderName`]; values keep the bytes seen on the wire; duplicates and
/// their interleaving are kept, which a `HeaderMap` does not preserve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
  entries: Vec<(HeaderName, HeaderValue)>,
}

impl Headers {
  /// Empty list.
  pub fn new() -> Self {
    Self::default()
  }

  /// Build from `(name, value)` text pairs.
  pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
    let mut headers = Headers::new();
    for (name, value) in pairs {
      headers.append(name, value)?;
    }
    Ok(headers)
  }

  /// Add a header after the existing ones.
  pub fn append<K, V>(&mut self, name: K, value: V) -> Result<()>
  where
    HeaderName: TryFrom<K>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
  {
    let (name, value) = typed(name, value)?;
    self.entries.push((name, value));
    Ok(())
  }

  /// Replace every header with this name by a single one, keeping the
  /// position of the first occurrence.
  pub fn set<K, V>(&mut self, name: K, value: V) -> Result<()>
  where
    HeaderName: TryFrom<K>,
    <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    HeaderValue: TryFrom<V>,
    <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
  {
    let (name, value) = typed(name, value)?;
    match self.position(name.as_str()) {
      Some(index) => {
        self.entries[index].1 = value;
        let mut seen = false;
        self.entries.retain(|(n, _)| {
          if *n != name {
            return true;
          }
          let keep = !seen;
          seen = true;
          keep
        });
      }
      None => self.entries.push((name, value)),
    }
    Ok(())
  }

  /// Put a header at `index` (clamped to the end).
  pub fn insert_at(&mut self, index: usize, name: HeaderName, value: HeaderValue) {
    let index = index.min(self.entries.len());
    self.entries.insert(index, (name, value));
  }

  pub(crate) fn push(&mut self, name: HeaderName, value: HeaderValue) {
    self.entries.push((name, value));
  }

  /// First value for the name as text, case-insensitively. Values that are
  /// not visible ASCII read as `None`; see [`Headers::get_raw`].
  pub fn get(&self, name: &str) -> Option<&str> {
    self.get_raw(name).and_then(|v| v.to_str().ok())
  }

  /// First value for the name, as received.
  pub fn get_raw(&self, name: &str) -> Option<&HeaderValue> {
    self
      .entries
      .iter()
      .find(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
      .map(|(_, v)| v)
  }

  /// Index of the first header with the name.
  pub fn position(&self, name: &str) -> Option<usize> {
    self
      .entries
      .iter()
      .position(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
  }

  /// Whether the name is present.
  pub fn contains(&self, name: &str) -> bool {
    self.position(name).is_some()
  }

  /// Remove every header with the name, returning the first value.
  pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
    let first = self.get_raw(name).cloned();
    self
      .entries
      .retain(|(n, _)| !n.as_str().eq_ignore_ascii_case(name));
    first
  }

  /// Whether a comma separated header contains the token.
  pub fn has_token(&self, name: &str, token: &str) -> bool {
    self
      .entries
      .iter()
      .filter(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
      .filter_map(|(_, v)| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .any(|t| t.trim().eq_ignore_ascii_case(token))
  }

  /// (name, value) pairs in order.
  pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
    self.entries.iter().map(|(n, v)| (n, v))
  }

  /// number of entries
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// no entries
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

fn typed<K, V>(name: K, value: V) -> Result<(HeaderName, HeaderValue)>
where
  HeaderName: TryFrom<K>,
  <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
  HeaderValue: TryFrom<V>,
  <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
{
  let name = HeaderName::try_from(name).map_err(|e| Error::Http(e.into()))?;
  let value = HeaderValue::try_from(value).map_err(|e| Error::Http(e.into()))?;
  Ok((name, value))
}

/// Text form of a raw value; bytes that are not UTF-8 are replaced.
pub(crate) fn value_text(value: &HeaderValue) -> Cow<'_, str> {
  String::from_utf8_lossy(value.as_bytes())
}

impl FromIterator<(HeaderName, HeaderValue)> for Headers {
  fn from_iter<T: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: T) -> Self {
    Self {
      entries: iter.into_iter().collect(),
    }
  }
}

/// Serialized as a JSON object in header order; repeated names are joined
/// with `, `.
impl Serialize for Headers {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let mut merged: Vec<(&str, String)> = Vec::with_capacity(self.entries.len());
    for (name, value) in &self.entries {
      let value = value_text(value);
      match merged.iter_mut().find(|(n, _)| *n == name.as_str()) {
        Some((_, joined)) => {
          joined.push_str(", ");
          joined.push_str(&value);
        }
        None => merged.push((name.as_str(), value.into_owned())),
      }
    }
    let mut map = serializer.serialize_map(Some(merged.len()))?;
    for (name, value) in &merged {
      map.serialize_entry(name, value)?;
    }
    map.end()
  }
}

/// One captured request or response.
///
/// `id` is assigned by the [`ExchangeStore`](crate::ExchangeStore) on append;
/// an exchange that has not been appended yet reports `0`.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
  id: u64,
  placeholder: bool,
  /// request or response
  pub kind: ExchangeKind,
  /// method token as received (requests only)
  pub method: Option<String>,
  /// absolute url of the request; copied onto the response
  pub url: Option<String>,
  /// status code (responses only)
  pub status: Option<u16>,
  /// e.g. `HTTP/1.1`
  pub version: String,
  /// header list, including the internal pair id
  pub headers: Headers,
  /// payload
  pub body: Body,
  /// held for operator edit
  pub piloted: bool,
}

impl Exchange {
  /// A request record.
  pub fn request(
    method: impl Into<String>,
    url: impl Into<String>,
    version: impl Into<String>,
    headers: Headers,
    body: impl Into<Body>,
  ) -> Self {
    Self {
      id: 0,
      placeholder: false,
      kind: ExchangeKind::Request,
      method: Some(method.into()),
      url: Some(url.into()),
      status: None,
      version: version.into(),
      headers,
      body: body.into(),
      piloted: false,
    }
  }

  /// A response record.
  pub fn response(
    status: u16,
    version: impl Into<String>,
    headers: Headers,
    body: impl Into<Body>,
  ) -> Self {
    Self {
      id: 0,
      placeholder: false,
      kind: ExchangeKind::Response,
      method: None,
      url: None,
      status: Some(status),
      version: version.into(),
      headers,
      body: body.into(),
      piloted: false,
    }
  }

  /// Stand-in returned when a lookup finds nothing. Never equal to a
  /// captured exchange.
  pub fn empty(kind: ExchangeKind) -> Self {
    Self {
      id: 0,
      placeholder: true,
      kind,
      method: None,
      url: None,
      status: None,
      version: String::new(),
      headers: Headers::new(),
      body: Body::empty(),
      piloted: false,
    }
  }

  /// Store-assigned id, `0` before append.
  pub fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn with_id(mut self, id: u64) -> Self {
    self.id = id;
    self
  }

  /// Whether this is the lookup stand-in.
  pub fn is_placeholder(&self) -> bool {
    self.placeholder
  }

  /// Recognized method, `None` for responses and unlisted methods.
  pub fn http_method(&self) -> Option<Method> {
    self.method.as_deref().and_then(Method::parse)
  }

  /// Correlation id carried in the internal header.
  pub fn pair_id(&self) -> Option<&str> {
    self.headers.get(PAIR_ID_HEADER)
  }

  /// Attach (or replace) the correlation id.
  pub fn set_pair_id(&mut self, pair_id: &str) -> Result<()> {
    self.headers.set(PAIR_ID_HEADER, pair_id)
  }

  /// Request-target for the start-line: path and query of an absolute url,
  /// the url itself otherwise.
  pub fn target(&self) -> String {
    let url = self.url.as_deref().unwrap_or("/");
    match url.parse::<http::Uri>() {
      Ok(uri) if uri.scheme().is_some() => uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string()),
      _ => url.to_string(),
    }
  }

  /// Body decoded according to `Content-Encoding`, as text.
  pub fn display_body(&self) -> String {
    encoding::display_text(self.headers.get("content-encoding"), &self.body)
  }

  /// Build the replacement for this exchange from operator-edited text.
  ///
  /// The pair id is never part of the edited text; it is carried over from
  /// `self` at its original position. An origin-form target is resolved
  /// against this exchange's scheme and the edited `Host` header.
  pub fn apply_edit(&self, edited: EditedMessage) -> Result<Exchange> {
    if edited.kind != self.kind {
      return Err(Error::InvalidEditableText(format!(
        "expected a {}, got a {}",
        self.kind, edited.kind
      )));
    }
    let mut headers = edited.headers;
    headers.remove(PAIR_ID_HEADER);
    if let Some(pair_id) = self.headers.get_raw(PAIR_ID_HEADER) {
      let index = self.headers.position(PAIR_ID_HEADER).unwrap_or(headers.len());
      headers.insert_at(index, HeaderName::from_static(PAIR_ID_HEADER), pair_id.clone());
    }
    let body = if edited.body == self.display_body() {
      self.body.clone()
    } else {
      let plain = Bytes::from(edited.body.into_bytes());
      match ContentCoding::from_header(headers.get("content-encoding")) {
        Ok(coding) => Body::from(coding.encode(&plain)?),
        Err(_) => Body::from(plain),
      }
    };
    let url = match self.kind {
      ExchangeKind::Request => edited
        .target
        .map(|target| resolve_target(&target, self.url.as_deref(), headers.get("host"))),
      ExchangeKind::Response => self.url.clone(),
    };
    Ok(Exchange {
      id: 0,
      placeholder: false,
      kind: self.kind,
      method: edited.method,
      url,
      status: edited.status,
      version: edited.version,
      headers,
      body,
      piloted: self.piloted,
    })
  }
}

/// Turn an origin-form target back into an absolute url.
fn resolve_target(target: &str, original_url: Option<&str>, host: Option<&str>) -> String {
  if !target.starts_with('/') {
    return target.to_string();
  }
  let original = original_url.and_then(|u| u.parse::<http::Uri>().ok());
  let scheme = original
    .as_ref()
    .and_then(|u| u.scheme_str().map(str::to_owned))
    .unwrap_or_else(|| "http".to_string());
  let authority = host
    .map(str::to_owned)
    .or_else(|| original.as_ref().and_then(|u| u.authority().map(|a| a.to_string())));
  match authority {
    Some(authority) => format!("{}://{}{}", scheme, authority, target),
    None => target.to_string(),
  }
}

impl Serialize for Exchange {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let mut s = serializer.serialize_struct("Exchange", 11)?;
    s.serialize_field("id", &self.id)?;
    s.serialize_field("kind", &self.kind)?;
    // `method` is the token as sent, `http_method` the recognized one
    s.serialize_field("method", &self.method)?;
    s.serialize_field("http_method", &self.http_method())?;
    s.serialize_field("url", &self.url)?;
    s.serialize_field("status", &self.status)?;
    s.serialize_field("version", &self.version)?;
    s.serialize_field("headers", &self.headers)?;
    s.serialize_field("body", &self.display_body())?;
    s.serialize_field("piloted", &self.piloted)?;
    s.serialize_field("pair_id", &self.pair_id())?;
    s.end()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::{from_editable_text, to_editable_text};

  fn sample_request() -> Exchange {
    let headers = Headers::from_pairs([
      ("host", "example.com"),
      ("pair-id", "abc"),
      ("accept", "text/html"),
    ])
    .unwrap();
    Exchange::request("GET", "http://example.com/index.html", "HTTP/1.1", headers, "")
  }

  #[test]
  fn display_name_capitalizes_every_segment() {
    assert_eq!(display_name("content-type"), "Content-Type");
    assert_eq!(display_name("x-forwarded-for"), "X-Forwarded-For");
    assert_eq!(display_name("HOST"), "Host");
    assert_eq!(display_name("pair-id"), "Pair-Id");
  }

  #[test]
  fn method_mapping_covers_known_tokens_only() {
    assert_eq!(Method::parse("get"), Some(Method::Get));
    assert_eq!(Method::parse("TRACE"), Some(Method::Trace));
    assert_eq!(Method::parse("PUT"), None);
    let mut put = sample_request();
    put.method = Some("PUT".into());
    assert_eq!(put.http_method(), None);
    assert_eq!(sample_request().http_method(), Some(Method::Get));
  }

  #[test]
  fn header_lookup_is_case_insensitive() {
    let mut headers = Headers::new();
    headers.append("Content-Type", "text/plain").unwrap();
    headers.append("Set-Cookie", "a=1").unwrap();
    headers.append("set-cookie", "b=2").unwrap();
    assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
    headers.set("SET-COOKIE", "c=3").unwrap();
    assert_eq!(headers.len(), 2);
    assert_eq!(headers.get("set-cookie"), Some("c=3"));
    assert_eq!(
      headers.remove("content-type"),
      Some(HeaderValue::from_static("text/plain"))
    );
    assert!(!headers.contains("content-type"));
  }

  #[test]
  fn invalid_names_and_values_are_rejected() {
    let mut headers = Headers::new();
    assert!(headers.append("bad name", "x").is_err());
    assert!(headers.append("x-ok", "line\nbreak").is_err());
    assert!(headers.is_empty());
  }

  #[test]
  fn raw_values_are_kept() {
    let mut headers = Headers::new();
    headers.append("x-latin", &b"caf\xe9"[..]).unwrap();
    assert_eq!(headers.get("x-latin"), None);
    assert_eq!(headers.get_raw("x-latin").unwrap().as_bytes(), b"caf\xe9");
    let value = serde_json::to_value(&headers).unwrap();
    assert_eq!(value["x-latin"], "caf\u{fffd}");
  }

  #[test]
  fn pair_id_is_read_from_either_case() {
    let mut headers = Headers::new();
    headers.append("Pair-Id", "xyz").unwrap();
    let response = Exchange::response(200, "HTTP/1.1", headers, "");
    assert_eq!(response.pair_id(), Some("xyz"));
  }

  #[test]
  fn placeholder_never_equals_a_capture() {
    let empty = Exchange::empty(ExchangeKind::Response);
    let real = Exchange::response(200, "HTTP/1.1", Headers::new(), "").with_id(1);
    assert!(empty.is_placeholder());
    assert!(!real.is_placeholder());
    assert_ne!(empty, real);
    let mut lookalike = Exchange::response(200, "", Headers::new(), "");
    lookalike.status = None;
    assert_ne!(Exchange::empty(ExchangeKind::Response), lookalike);
  }

  #[test]
  fn target_strips_scheme_and_authority() {
    let mut request = sample_request();
    assert_eq!(request.target(), "/index.html");
    request.url = Some("http://example.com/search?q=rust".into());
    assert_eq!(request.target(), "/search?q=rust");
    request.url = Some("http://example.com".into());
    assert_eq!(request.target(), "/");
  }

  #[test]
  fn editable_round_trip_restores_every_field() {
    let mut request = sample_request();
    request.method = Some("POST".into());
    request.headers.append("content-type", "application/json").unwrap();
    request.body = Body::from("{\"a\":1}\nsecond line");
    request.piloted = true;
    let text = to_editable_text(&request);
    assert!(!text.to_ascii_lowercase().contains("pair-id"));
    let edited = from_editable_text(&text, ExchangeKind::Request).unwrap();
    let back = request.apply_edit(edited).unwrap();
    assert_eq!(back, request);
  }

  #[test]
  fn response_round_trip_keeps_url_and_pair() {
    let headers =
      Headers::from_pairs([("content-type", "text/plain"), ("pair-id", "abc")]).unwrap();
    let mut response = Exchange::response(404, "HTTP/1.1", headers, "missing");
    response.url = Some("http://example.com/index.html".into());
    let edited = from_editable_text(&to_editable_text(&response), ExchangeKind::Response).unwrap();
    let back = response.apply_edit(edited).unwrap();
    assert_eq!(back, response);
    assert_eq!(back.pair_id(), Some("abc"));
  }

  #[test]
  fn edited_path_is_resolved_against_original_scheme() {
    let mut request = sample_request();
    request.url = Some("https://example.com/index.html".into());
    let edited =
      from_editable_text("GET /admin HTTP/1.1\nHost: example.com\n\n", ExchangeKind::Request)
        .unwrap();
    let back = request.apply_edit(edited).unwrap();
    assert_eq!(back.url.as_deref(), Some("https://example.com/admin"));
    assert_eq!(back.pair_id(), Some("abc"));
  }

  #[test]
  fn kind_mismatch_is_an_invalid_edit() {
    let edited = from_editable_text("HTTP/1.1 200\n\n", ExchangeKind::Response).unwrap();
    let err = sample_request().apply_edit(edited).unwrap_err();
    assert!(err.is_recoverable_edit());
  }

  #[test]
  fn serializes_headers_as_string_map() {
    let mut request = sample_request();
    request.headers.append("accept", "application/json").unwrap();
    let value = serde_json::to_value(&request).unwrap();
    assert_eq!(value["kind"], "request");
    assert_eq!(value["method"], "GET");
    assert_eq!(value["http_method"], "GET");
    assert_eq!(value["headers"]["host"], "example.com");
    assert_eq!(value["headers"]["accept"], "text/html, application/json");
    assert_eq!(value["pair_id"], "abc");
    assert_eq!(value["piloted"], false);
    assert_eq!(value["status"], serde_json::Value::Null);
  }

  #[test]
  fn unrecognized_method_serializes_as_null() {
    let request = Exchange::request("PUT", "http://example.com/", "HTTP/1.1", Headers::new(), "x");
    assert_eq!(request.http_method(), None);
    let value = serde_json::to_value(&request).unwrap();
    assert_eq!(value["method"], "PUT");
    assert_eq!(value["http_method"], serde_json::Value::Null);
    let response = Exchange::response(200, "HTTP/1.1", Headers::new(), "");
    assert_eq!(serde_json::to_value(&response).unwrap()["http_method"], serde_json::Value::Null);
  }
}
