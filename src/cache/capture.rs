//! Tee capture of a live response.
//!
//! [`ResponseCapture`] wraps the live response for one cache miss. Every
//! write goes to the client first and then into a store-supplied
//! [`TempSink`], which is opened lazily on the first write and dropped with
//! the capture.

use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::content::{CacheContent, WriteMode};
use super::error::CacheError;
use super::http::{HttpResponse, split_content_type};
use super::keys::CacheKey;
use super::sink::TempSink;
use super::store::CacheStore;

pub struct ResponseCapture<'a> {
    inner: &'a mut dyn HttpResponse,
    key: CacheKey,
    store: Arc<dyn CacheStore>,
    spill: Option<(WriteMode, Box<dyn TempSink>)>,
    status: u16,
    content_type: Option<String>,
    character_encoding: Option<String>,
}

impl<'a> ResponseCapture<'a> {
    pub(crate) fn new(
        inner: &'a mut dyn HttpResponse,
        key: CacheKey,
        store: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            status: inner.status(),
            content_type: inner.content_type().map(str::to_string),
            character_encoding: inner.character_encoding().map(str::to_string),
            inner,
            key,
            store,
            spill: None,
        }
    }

    /// Key of the request this capture belongs to.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Output mode in use, `None` before the first write.
    pub fn write_mode(&self) -> Option<WriteMode> {
        self.spill.as_ref().map(|(mode, _)| *mode)
    }

    /// Bytes spooled so far.
    pub fn captured_len(&self) -> u64 {
        self.spill.as_ref().map_or(0, |(_, sink)| sink.len())
    }

    fn open(&mut self, requested: WriteMode) -> Result<(), CacheError> {
        if let Some((active, _)) = &self.spill {
            if *active != requested {
                return Err(CacheError::OutputModeConflict {
                    active: *active,
                    requested,
                });
            }
            return Ok(());
        }

        let sink = self.store.create_temp_sink()?;
        debug!(key = %self.key, mode = %requested, "opened capture sink");
        self.spill = Some((requested, sink));
        Ok(())
    }

    fn spool(&mut self, bytes: &[u8]) -> Result<(), CacheError> {
        if let Some((_, sink)) = self.spill.as_mut() {
            sink.write_all(bytes)?;
        }
        Ok(())
    }

    /// Package what was captured. Consumes the capture, releasing the sink.
    pub(crate) fn into_content(mut self) -> Result<CacheContent, CacheError> {
        let (mode, payload) = match self.spill.as_mut() {
            Some((mode, sink)) => (*mode, sink.to_bytes()?),
            None => (WriteMode::Bytes, Bytes::new()),
        };

        let mut content = CacheContent::new(self.status, payload)
            .with_headers(self.inner.headers())
            .with_write_mode(mode);
        if let Some(content_type) = self.content_type.take() {
            content = content.with_content_type(content_type);
        }
        if let Some(encoding) = self.character_encoding.take() {
            content = content.with_character_encoding(encoding);
        }
        Ok(content)
    }
}

impl HttpResponse for ResponseCapture<'_> {
    fn status(&self) -> u16 {
        self.status
    }

    fn set_status(&mut self, status: u16) {
        self.status = status;
        self.inner.set_status(status);
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.inner.headers()
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.inner.set_header(name, value);
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.inner.add_header(name, value);
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn set_content_type(&mut self, content_type: &str) {
        let (media_type, charset) = split_content_type(content_type);
        self.content_type = Some(media_type);
        if charset.is_some() {
            self.character_encoding = charset;
        }
        self.inner.set_content_type(content_type);
    }

    fn character_encoding(&self) -> Option<&str> {
        self.character_encoding.as_deref()
    }

    fn set_character_encoding(&mut self, encoding: &str) {
        self.character_encoding = Some(encoding.to_string());
        self.inner.set_character_encoding(encoding);
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CacheError> {
        self.open(WriteMode::Bytes)?;
        self.inner.write_bytes(bytes)?;
        self.spool(bytes)
    }

    fn write_text(&mut self, text: &str) -> Result<(), CacheError> {
        self.open(WriteMode::Text)?;
        self.inner.write_text(text)?;
        self.spool(text.as_bytes())
    }

    fn flush(&mut self) -> Result<(), CacheError> {
        self.inner.flush()?;
        if let Some((_, sink)) = self.spill.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}
