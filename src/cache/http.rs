//! Transport and identity collaborators.
//!
//! The engine never touches a concrete HTTP stack. It reads requests through
//! [`HttpRequest`], writes responses through [`HttpResponse`] and asks an
//! [`IdentityProvider`] about the caller. [`RequestSnapshot`] and
//! [`BufferedResponse`] are owned implementations used by the axum adapter.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::content::WriteMode;
use super::error::CacheError;

/// Read-only view of an inbound request.
pub trait HttpRequest {
    fn method(&self) -> &str;
    /// Request path without query string, e.g. `/products/42.detail.json`.
    fn path(&self) -> &str;
    fn header(&self, name: &str) -> Option<&str>;
    fn cookie(&self, name: &str) -> Option<&str>;
    fn parameter(&self, name: &str) -> Option<&str>;
    /// Authenticated user id, `None` for anonymous callers.
    fn remote_user(&self) -> Option<&str>;
}

/// Narrow write surface of a live response.
///
/// Implementations accept exactly one output mode per response: once bytes
/// were written, text writes fail and vice versa.
pub trait HttpResponse {
    fn status(&self) -> u16;
    fn set_status(&mut self, status: u16);

    /// Headers in insertion order, multi-valued names repeated.
    fn headers(&self) -> Vec<(String, String)>;
    /// Replace every value of `name`.
    fn set_header(&mut self, name: &str, value: &str);
    /// Append a value to `name`.
    fn add_header(&mut self, name: &str, value: &str);

    fn header(&self, name: &str) -> Option<String> {
        self.headers()
            .into_iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    fn content_type(&self) -> Option<&str>;
    fn set_content_type(&mut self, content_type: &str);
    fn character_encoding(&self) -> Option<&str>;
    fn set_character_encoding(&mut self, encoding: &str);

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CacheError>;
    fn write_text(&mut self, text: &str) -> Result<(), CacheError>;
    fn flush(&mut self) -> Result<(), CacheError>;
}

/// Answers who is calling. Backed by an external directory in production.
pub trait IdentityProvider: Send + Sync {
    fn is_anonymous(&self, request: &dyn HttpRequest) -> bool {
        request.remote_user().is_none()
    }

    /// Group memberships of an authenticated caller.
    fn groups(&self, request: &dyn HttpRequest) -> Result<HashSet<String>, CacheError>;
}

/// Static user → groups directory.
#[derive(Debug, Clone, Default)]
pub struct DirectoryIdentity {
    members: HashMap<String, HashSet<String>>,
}

impl DirectoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user<I, S>(mut self, user: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members
            .insert(user.into(), groups.into_iter().map(Into::into).collect());
        self
    }
}

impl IdentityProvider for DirectoryIdentity {
    fn groups(&self, request: &dyn HttpRequest) -> Result<HashSet<String>, CacheError> {
        let Some(user) = request.remote_user() else {
            return Ok(HashSet::new());
        };
        Ok(self.members.get(user).cloned().unwrap_or_default())
    }
}

/// Decomposition of a request path into resource path, selectors and extension.
///
/// `/content/site/page.mobile.print.html` has resource path
/// `/content/site/page`, selectors `[mobile, print]` and extension `html`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestPathInfo {
    pub resource_path: String,
    pub selectors: Vec<String>,
    pub extension: Option<String>,
}

impl RequestPathInfo {
    pub fn parse(path: &str) -> Result<Self, CacheError> {
        if !path.starts_with('/') {
            return Err(CacheError::key_creation(format!(
                "request path `{path}` is not absolute"
            )));
        }

        let (parent, last) = match path.rfind('/') {
            Some(index) => path.split_at(index + 1),
            None => ("", path),
        };

        let mut parts = last.split('.').filter(|part| !part.is_empty());
        let name = parts.next().unwrap_or_default();
        let mut rest: Vec<String> = parts.map(str::to_string).collect();
        let extension = rest.pop();

        let mut resource_path = format!("{parent}{name}");
        if resource_path.len() > 1 && resource_path.ends_with('/') {
            resource_path.pop();
        }

        Ok(Self {
            resource_path,
            selectors: rest,
            extension,
        })
    }

    /// Rebuild the request path this info was parsed from.
    pub fn to_uri(&self) -> String {
        let mut uri = self.resource_path.clone();
        for selector in &self.selectors {
            uri.push('.');
            uri.push_str(selector);
        }
        if let Some(extension) = &self.extension {
            uri.push('.');
            uri.push_str(extension);
        }
        uri
    }
}

/// Owned request view.
#[derive(Debug, Clone, Default)]
pub struct RequestSnapshot {
    method: String,
    path: String,
    headers: BTreeMap<String, String>,
    cookies: BTreeMap<String, String>,
    parameters: BTreeMap<String, String>,
    remote_user: Option<String>,
}

impl RequestSnapshot {
    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.remote_user = Some(user.into());
        self
    }

    /// Parse a `Cookie` header value (`a=1; b=2`) into the cookie jar.
    pub fn with_cookie_header(mut self, value: &str) -> Self {
        for pair in value.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                self.cookies
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }
        self
    }

    /// Parse a raw query string (`a=1&b=2`) into the parameter map.
    pub fn with_query(mut self, query: &str) -> Self {
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            self.parameters.insert(name.to_string(), value.to_string());
        }
        self
    }
}

impl HttpRequest for RequestSnapshot {
    fn method(&self) -> &str {
        &self.method
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    fn remote_user(&self) -> Option<&str> {
        self.remote_user.as_deref()
    }
}

/// In-memory response that enforces a single output mode.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    content_type: Option<String>,
    character_encoding: Option<String>,
    mode: Option<WriteMode>,
    body: Vec<u8>,
}

impl Default for BufferedResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedResponse {
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            content_type: None,
            character_encoding: None,
            mode: None,
            body: Vec::new(),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    pub fn write_mode(&self) -> Option<WriteMode> {
        self.mode
    }

    /// `Content-Type` header value combining type and charset.
    pub fn content_type_header(&self) -> Option<String> {
        let content_type = self.content_type.as_deref()?;
        Some(match self.character_encoding.as_deref() {
            Some(charset) => format!("{content_type}; charset={charset}"),
            None => content_type.to_string(),
        })
    }

    fn open(&mut self, requested: WriteMode) -> Result<(), CacheError> {
        match self.mode {
            Some(active) if active != requested => {
                Err(CacheError::OutputModeConflict { active, requested })
            }
            _ => {
                self.mode = Some(requested);
                Ok(())
            }
        }
    }
}

impl HttpResponse for BufferedResponse {
    fn status(&self) -> u16 {
        self.status
    }

    fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn set_content_type(&mut self, content_type: &str) {
        let (content_type, charset) = split_content_type(content_type);
        self.content_type = Some(content_type);
        if let Some(charset) = charset {
            self.character_encoding = Some(charset);
        }
    }

    fn character_encoding(&self) -> Option<&str> {
        self.character_encoding.as_deref()
    }

    fn set_character_encoding(&mut self, encoding: &str) {
        self.character_encoding = Some(encoding.to_string());
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CacheError> {
        self.open(WriteMode::Bytes)?;
        self.body.extend_from_slice(bytes);
        Ok(())
    }

    fn write_text(&mut self, text: &str) -> Result<(), CacheError> {
        self.open(WriteMode::Text)?;
        self.body.extend_from_slice(text.as_bytes());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Split `text/html; charset=utf-8` into `("text/html", Some("utf-8"))`.
pub fn split_content_type(value: &str) -> (String, Option<String>) {
    let mut parts = value.split(';');
    let media_type = parts.next().unwrap_or_default().trim().to_string();
    let charset = parts.find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    });
    (media_type, charset)
}
