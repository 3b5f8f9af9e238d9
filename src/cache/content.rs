//! Immutable snapshot of a captured response.

use std::fmt;
use std::io::{self, Read};

use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};

use super::error::CacheError;
use super::http::HttpResponse;

const COPY_CHUNK_BYTES: usize = 8 * 1024;

/// Which output accessor produced the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    Bytes,
    Text,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Bytes => f.write_str("bytes"),
            WriteMode::Text => f.write_str("text"),
        }
    }
}

/// Cached response: status, content metadata, ordered headers and payload.
///
/// The payload is a [`Bytes`] handle, so every clone reads independently
/// from offset zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheContent {
    status: u16,
    character_encoding: Option<String>,
    content_type: Option<String>,
    headers: Vec<(String, String)>,
    payload: Bytes,
    write_mode: WriteMode,
}

impl CacheContent {
    pub fn new(status: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            character_encoding: None,
            content_type: None,
            headers: Vec::new(),
            payload: payload.into(),
            write_mode: WriteMode::Bytes,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_character_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.character_encoding = Some(encoding.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn character_encoding(&self) -> Option<&str> {
        self.character_encoding.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// All values recorded for `name`, in order.
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Drop every value of `name`. Returns how many were removed.
    pub fn remove_header(&mut self, name: &str) -> usize {
        let before = self.headers.len();
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before - self.headers.len()
    }

    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn reader(&self) -> impl Read {
        self.payload.clone().reader()
    }

    pub fn write_mode(&self) -> WriteMode {
        self.write_mode
    }

    /// Replay this snapshot onto a live response.
    pub fn write_to(&self, response: &mut dyn HttpResponse) -> Result<(), CacheError> {
        response.set_status(self.status);
        for (name, value) in &self.headers {
            response.add_header(name, value);
        }
        if let Some(encoding) = self.character_encoding.as_deref() {
            response.set_character_encoding(encoding);
        }
        if let Some(content_type) = self.content_type.as_deref() {
            response.set_content_type(content_type);
        }

        match self.write_mode {
            WriteMode::Bytes => {
                let mut reader = self.reader();
                let mut chunk = [0u8; COPY_CHUNK_BYTES];
                loop {
                    let read = reader.read(&mut chunk).map_err(CacheError::DataStream)?;
                    if read == 0 {
                        break;
                    }
                    response.write_bytes(&chunk[..read])?;
                }
            }
            WriteMode::Text => {
                let text = std::str::from_utf8(&self.payload).map_err(|err| {
                    CacheError::DataStream(io::Error::new(io::ErrorKind::InvalidData, err))
                })?;
                response.write_text(text)?;
            }
        }

        response.flush()
    }
}
