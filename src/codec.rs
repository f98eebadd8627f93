//! HTTP/1.x wire codec and the operator-editable text form.
//!
//! Heads are parsed from raw bytes ([`parse_request_head`],
//! [`parse_response_head`]); the async readers pull a complete message (head
//! plus de-chunked body) off a buffered stream. [`to_editable_text`] and
//! [`from_editable_text`] convert between an [`Exchange`] and the plain text
//! the operator edits in pilot mode.
use crate::errors::{new_io_error, Error, Result};
use crate::exchange::{display_name, value_text, Exchange, ExchangeKind, Headers};
use crate::pairing::PAIR_ID_HEADER;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

/// Headers that only describe the connection they arrived on and are rewritten
/// by the proxy.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "proxy-connection",
  "keep-alive",
  "transfer-encoding",
  "content-length",
  "upgrade",
  "proxy-authorization",
];

/// Request start-line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
  /// method token
  pub method: String,
  /// request-target as written (absolute-form, origin-form or authority-form)
  pub target: String,
  /// protocol version
  pub version: String,
  /// headers
  pub headers: Headers,
}

/// Response status-line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
  /// status code
  pub status: u16,
  /// reason phrase, possibly empty
  pub reason: String,
  /// protocol version
  pub version: String,
  /// headers
  pub headers: Headers,
}

/// Fields recovered from operator-edited text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditedMessage {
  /// request or response
  pub kind: ExchangeKind,
  /// method token (requests)
  pub method: Option<String>,
  /// request-target as typed (requests)
  pub target: Option<String>,
  /// status code (responses)
  pub status: Option<u16>,
  /// protocol version
  pub version: String,
  /// headers, names lower-cased
  pub headers: Headers,
  /// everything after the first blank line
  pub body: String,
}

/// Size limits applied while reading from a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
  /// start-line plus headers
  pub max_head_bytes: usize,
  /// decoded body
  pub max_body_bytes: usize,
}

impl Default for Limits {
  fn default() -> Self {
    Self {
      max_head_bytes: 64 * 1024,
      max_body_bytes: 16 * 1024 * 1024,
    }
  }
}

/// Parse `METHOD SP target SP version` plus headers.
pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
  let (start, headers) = split_head(raw)?;
  let parts: Vec<&str> = start.split_whitespace().collect();
  if parts.len() != 3 {
    return Err(Error::malformed(
      format!("request line has {} tokens", parts.len()),
      Bytes::copy_from_slice(raw),
    ));
  }
  if !parts[2].starts_with("HTTP/") {
    return Err(Error::malformed(
      format!("invalid http version {:?}", parts[2]),
      Bytes::copy_from_slice(raw),
    ));
  }
  Ok(RequestHead {
    method: parts[0].to_string(),
    target: parts[1].to_string(),
    version: parts[2].to_string(),
    headers,
  })
}

/// Parse `version SP status [SP reason]` plus headers.
pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead> {
  let (start, headers) = split_head(raw)?;
  let mut parts = start.splitn(3, ' ');
  let version = parts.next().unwrap_or_default();
  let status = parts.next().unwrap_or_default();
  let reason = parts.next().unwrap_or_default().trim();
  if !version.starts_with("HTTP/") {
    return Err(Error::malformed(
      format!("invalid http version {:?}", version),
      Bytes::copy_from_slice(raw),
    ));
  }
  let status = parse_status(status).ok_or_else(|| {
    Error::malformed(
      format!("invalid status code {:?}", status),
      Bytes::copy_from_slice(raw),
    )
  })?;
  Ok(ResponseHead {
    status,
    reason: reason.to_string(),
    version: version.to_string(),
    headers,
  })
}

fn parse_status(token: &str) -> Option<u16> {
  if token.len() != 3 || !token.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  token.parse().ok().filter(|s| (100..=999).contains(s))
}

fn split_head(raw: &[u8]) -> Result<(String, Headers)> {
  let malformed = |reason: String| Error::malformed(reason, Bytes::copy_from_slice(raw));
  let mut lines = raw.split(|b| *b == b'\n').map(strip_cr);
  let start = lines
    .by_ref()
    .find(|l| !l.is_empty())
    .ok_or_else(|| malformed("empty message".to_string()))?;
  let start = std::str::from_utf8(start)
    .map_err(|_| malformed("start line is not utf-8".to_string()))?
    .to_string();
  let mut headers = Headers::new();
  for line in lines {
    if line.is_empty() {
      break;
    }
    let (name, value) = parse_header_line(line).ok_or_else(|| {
      malformed(format!(
        "invalid header line {:?}",
        String::from_utf8_lossy(line)
      ))
    })?;
    headers.push(name, value);
  }
  Ok((start, headers))
}

fn strip_cr(line: &[u8]) -> &[u8] {
  line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_ows(mut bytes: &[u8]) -> &[u8] {
  while let [b' ' | b'\t', rest @ ..] = bytes {
    bytes = rest;
  }
  while let [rest @ .., b' ' | b'\t'] = bytes {
    bytes = rest;
  }
  bytes
}

/// `name: value` with the value kept as raw bytes. Names are lower-cased.
fn parse_header_line(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
  let colon = line.iter().position(|b| *b == b':')?;
  let name = trim_ows(&line[..colon]);
  if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
    return None;
  }
  let name = HeaderName::from_bytes(name).ok()?;
  let value = HeaderValue::from_bytes(trim_ows(&line[colon + 1..])).ok()?;
  Some((name, value))
}

/// Render the editable block: start-line, `Name: value` headers (pair id
/// left out), a blank line, then the decoded body. Lines end with `\n`.
pub fn to_editable_text(exchange: &Exchange) -> String {
  let mut text = String::new();
  match exchange.kind {
    ExchangeKind::Request => {
      text.push_str(exchange.method.as_deref().unwrap_or("GET"));
      text.push(' ');
      text.push_str(&exchange.target());
      text.push(' ');
      text.push_str(&exchange.version);
    }
    ExchangeKind::Response => {
      let status = exchange.status.unwrap_or(200);
      text.push_str(&exchange.version);
      text.push(' ');
      text.push_str(&status.to_string());
      if let Some(reason) = canonical_reason(status) {
        text.push(' ');
        text.push_str(reason);
      }
    }
  }
  text.push('\n');
  for (name, value) in exchange.headers.iter() {
    if name == PAIR_ID_HEADER {
      continue;
    }
    text.push_str(&display_name(name.as_str()));
    text.push_str(": ");
    text.push_str(&value_text(value));
    text.push('\n');
  }
  text.push('\n');
  text.push_str(&exchange.display_body());
  text
}

/// Inverse of [`to_editable_text`]. The first line is the start-line, the
/// following non-empty lines up to the first blank line are headers, and the
/// rest is the body, byte for byte.
pub fn from_editable_text(text: &str, kind: ExchangeKind) -> Result<EditedMessage> {
  let (head, body) = split_editable(text);
  let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
  let start = lines
    .next()
    .map(str::trim)
    .filter(|l| !l.is_empty())
    .ok_or_else(|| Error::InvalidEditableText("missing start line".to_string()))?;
  let mut headers = Headers::new();
  for line in lines {
    if line.trim().is_empty() {
      continue;
    }
    let (name, value) = parse_header_line(line.as_bytes())
      .ok_or_else(|| Error::InvalidEditableText(format!("bad header line {:?}", line)))?;
    headers.push(name, value);
  }
  let body = body.to_string();
  match kind {
    ExchangeKind::Request => {
      let parts: Vec<&str> = start.split_whitespace().collect();
      if parts.len() != 3 || !parts[2].starts_with("HTTP/") {
        return Err(Error::InvalidEditableText(format!(
          "bad request line {:?}",
          start
        )));
      }
      Ok(EditedMessage {
        kind,
        method: Some(parts[0].to_string()),
        target: Some(parts[1].to_string()),
        status: None,
        version: parts[2].to_string(),
        headers,
        body,
      })
    }
    ExchangeKind::Response => {
      let mut parts = start.split_whitespace();
      let version = parts.next().unwrap_or_default();
      let status = parts.next().and_then(parse_status);
      match status {
        Some(status) if version.starts_with("HTTP/") => Ok(EditedMessage {
          kind,
          method: None,
          target: None,
          status: Some(status),
          version: version.to_string(),
          headers,
          body,
        }),
        _ => Err(Error::InvalidEditableText(format!(
          "bad status line {:?}",
          start
        ))),
      }
    }
  }
}

/// Split at the first blank line after the start-line.
fn split_editable(text: &str) -> (&str, &str) {
  let mut offset = 0;
  for (index, line) in text.split_inclusive('\n').enumerate() {
    let content = line.trim_end_matches(|c| c == '\r' || c == '\n');
    if index > 0 && content.is_empty() {
      return (&text[..offset], &text[offset + line.len()..]);
    }
    offset += line.len();
  }
  (text, "")
}

fn canonical_reason(status: u16) -> Option<&'static str> {
  http::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
  out.extend(display_name(name).as_bytes());
  out.extend(COLON_SPACE);
  out.extend(value);
  out.extend(CR_LF);
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
  name == PAIR_ID_HEADER || HOP_BY_HOP.contains(&name.as_str())
}

/// Serialize a request for the upstream connection: origin-form target, no
/// pair id, `Host` filled in, framing recomputed and `Connection: close`.
pub fn request_to_wire(exchange: &Exchange) -> Bytes {
  let mut out = Vec::new();
  out.extend(exchange.method.as_deref().unwrap_or("GET").as_bytes());
  out.extend(SPACE);
  out.extend(exchange.target().as_bytes());
  out.extend(SPACE);
  out.extend(exchange.version.as_bytes());
  out.extend(CR_LF);
  if !exchange.headers.contains("host") {
    let authority = exchange
      .url
      .as_deref()
      .and_then(|u| u.parse::<http::Uri>().ok())
      .and_then(|u| u.authority().map(|a| a.to_string()));
    if let Some(authority) = authority {
      push_header(&mut out, "host", authority.as_bytes());
    }
  }
  for (name, value) in exchange.headers.iter() {
    if !is_hop_by_hop(name) {
      push_header(&mut out, name.as_str(), value.as_bytes());
    }
  }
  let framed = exchange.headers.contains("content-length")
    || exchange.headers.contains("transfer-encoding");
  if !exchange.body.is_empty() || framed {
    push_header(&mut out, "content-length", exchange.body.len().to_string().as_bytes());
  }
  push_header(&mut out, "connection", b"close");
  out.extend(CR_LF);
  out.extend(&exchange.body[..]);
  Bytes::from(out)
}

/// Serialize a response for the client connection. The body is always sent
/// with a `Content-Length`; for a HEAD request the upstream's length is kept.
pub fn response_to_wire(exchange: &Exchange, head_request: bool, keep_alive: bool) -> Bytes {
  let status = exchange.status.unwrap_or(200);
  let mut out = Vec::new();
  out.extend(exchange.version.as_bytes());
  out.extend(SPACE);
  out.extend(status.to_string().as_bytes());
  out.extend(SPACE);
  out.extend(canonical_reason(status).unwrap_or("Unknown").as_bytes());
  out.extend(CR_LF);
  for (name, value) in exchange.headers.iter() {
    if !is_hop_by_hop(name) {
      push_header(&mut out, name.as_str(), value.as_bytes());
    }
  }
  if head_request {
    if let Some(length) = exchange.headers.get_raw("content-length") {
      push_header(&mut out, "content-length", length.as_bytes());
    }
  } else if !matches!(status, 100..=199 | 204 | 304) {
    push_header(&mut out, "content-length", exchange.body.len().to_string().as_bytes());
  }
  push_header(
    &mut out,
    "connection",
    if keep_alive { b"keep-alive" } else { b"close" },
  );
  out.extend(CR_LF);
  if !head_request {
    out.extend(&exchange.body[..]);
  }
  Bytes::from(out)
}

/// Minimal response the proxy itself produces for failed flows.
pub(crate) fn status_only(status: u16, message: &str) -> Bytes {
  let reason = canonical_reason(status).unwrap_or("Error");
  Bytes::from(format!(
    "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\
     Connection: close\r\n\r\n{}",
    status,
    reason,
    message.len(),
    message
  ))
}

enum Framing {
  Empty,
  Length(u64),
  Chunked,
  UntilEof,
}

fn content_length(headers: &Headers, raw: &[u8]) -> Result<Option<u64>> {
  match headers.get_raw("content-length") {
    Some(v) => v
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<u64>().ok())
      .map(Some)
      .ok_or_else(|| {
        Error::malformed(
          format!("invalid content-length {:?}", value_text(v)),
          Bytes::copy_from_slice(raw),
        )
      }),
    None => Ok(None),
  }
}

/// Read one request. Returns `None` when the peer closed the connection
/// before sending anything.
pub async fn read_request<R>(
  reader: &mut BufReader<R>,
  limits: &Limits,
) -> Result<Option<(RequestHead, Bytes)>>
where
  R: AsyncRead + Unpin,
{
  let raw = match read_head(reader, limits.max_head_bytes).await? {
    Some(raw) => raw,
    None => return Ok(None),
  };
  let head = parse_request_head(&raw)?;
  let framing = if head.headers.has_token("transfer-encoding", "chunked") {
    Framing::Chunked
  } else {
    match content_length(&head.headers, &raw)? {
      Some(0) | None => Framing::Empty,
      Some(n) => Framing::Length(n),
    }
  };
  let body = read_body(reader, framing, limits.max_body_bytes).await?;
  Ok(Some((head, body)))
}

/// Read one final response, skipping interim `1xx` answers. `request_method`
/// decides whether a body can follow.
pub async fn read_response<R>(
  reader: &mut BufReader<R>,
  limits: &Limits,
  request_method: &str,
) -> Result<(ResponseHead, Bytes)>
where
  R: AsyncRead + Unpin,
{
  loop {
    let raw = read_head(reader, limits.max_head_bytes)
      .await?
      .ok_or_else(|| new_io_error(ErrorKind::UnexpectedEof, "upstream closed before responding"))?;
    let head = parse_response_head(&raw)?;
    if (100..200).contains(&head.status) && head.status != 101 {
      continue;
    }
    let framing = if request_method.eq_ignore_ascii_case("HEAD")
      || matches!(head.status, 100..=199 | 204 | 304)
    {
      Framing::Empty
    } else if head.headers.has_token("transfer-encoding", "chunked") {
      Framing::Chunked
    } else {
      match content_length(&head.headers, &raw)? {
        Some(0) => Framing::Empty,
        Some(n) => Framing::Length(n),
        None => Framing::UntilEof,
      }
    };
    let body = read_body(reader, framing, limits.max_body_bytes).await?;
    return Ok((head, body));
  }
}

/// Accumulate lines up to and including the blank line. Leading blank lines
/// are skipped.
async fn read_head<R>(reader: &mut BufReader<R>, max: usize) -> Result<Option<Vec<u8>>>
where
  R: AsyncRead + Unpin,
{
  let mut raw = Vec::new();
  loop {
    let mut line = Vec::new();
    let remaining = (max - raw.len()) as u64 + 1;
    let n = (&mut *reader)
      .take(remaining)
      .read_until(b'\n', &mut line)
      .await?;
    if n == 0 {
      if raw.is_empty() {
        return Ok(None);
      }
      return Err(Error::malformed("connection closed inside message head", raw));
    }
    let blank = line == b"\r\n" || line == b"\n";
    if raw.is_empty() && blank {
      continue;
    }
    raw.extend_from_slice(&line);
    if raw.len() > max {
      return Err(Error::malformed("message head exceeds limit", raw));
    }
    if blank {
      return Ok(Some(raw));
    }
  }
}

async fn read_body<R>(reader: &mut BufReader<R>, framing: Framing, max: usize) -> Result<Bytes>
where
  R: AsyncRead + Unpin,
{
  match framing {
    Framing::Empty => Ok(Bytes::new()),
    Framing::Length(n) => {
      if n > max as u64 {
        return Err(new_io_error(ErrorKind::InvalidData, "body exceeds limit"));
      }
      let mut body = Vec::with_capacity(n as usize);
      (&mut *reader).take(n).read_to_end(&mut body).await?;
      if (body.len() as u64) < n {
        return Err(new_io_error(ErrorKind::UnexpectedEof, "body shorter than content-length"));
      }
      Ok(Bytes::from(body))
    }
    Framing::UntilEof => {
      let mut body = Vec::new();
      (&mut *reader)
        .take(max as u64 + 1)
        .read_to_end(&mut body)
        .await?;
      if body.len() > max {
        return Err(new_io_error(ErrorKind::InvalidData, "body exceeds limit"));
      }
      Ok(Bytes::from(body))
    }
    Framing::Chunked => read_chunked_body(reader, max).await.map(Bytes::from),
  }
}

async fn read_chunked_body<R>(reader: &mut BufReader<R>, max: usize) -> Result<Vec<u8>>
where
  R: AsyncRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  loop {
    let mut line = String::new();
    let n = (&mut *reader).take(1024).read_line(&mut line).await?;
    if n == 0 {
      return Err(new_io_error(ErrorKind::UnexpectedEof, "connection closed inside chunked body"));
    }
    let size = line.trim().split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
      continue;
    }
    let size = usize::from_str_radix(size, 16)
      .map_err(|_| Error::malformed(format!("invalid chunk size {:?}", size), Bytes::new()))?;
    if size == 0 {
      // trailers, discarded
      loop {
        line.clear();
        let n = (&mut *reader).take(8192).read_line(&mut line).await?;
        if n == 0 || line.trim().is_empty() {
          break;
        }
      }
      return Ok(body);
    }
    let start = body.len();
    let end = start
      .checked_add(size)
      .filter(|end| *end <= max)
      .ok_or_else(|| {
        Error::malformed(
          format!("chunk of {} bytes exceeds the body limit", size),
          Bytes::new(),
        )
      })?;
    body.resize(end, 0);
    reader.read_exact(&mut body[start..]).await?;
  }
}
