//! Declarative cache policy.
//!
//! A [`CacheConfig`] decides which requests are cacheable, which store holds
//! their responses, which request facets become part of the key and which
//! content paths invalidate them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::CacheError;
use super::http::{HttpRequest, IdentityProvider, RequestPathInfo};
use super::keys::{CacheKey, ExpiryOverrides};

/// Who may be served from a config's cache entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRequirement {
    #[default]
    Anonymous,
    Authenticated,
    Any,
}

impl AuthRequirement {
    fn admits(self, anonymous: bool) -> bool {
        match self {
            AuthRequirement::Anonymous => anonymous,
            AuthRequirement::Authenticated => !anonymous,
            AuthRequirement::Any => true,
        }
    }
}

/// A request facet whose value becomes part of the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum KeyFacet {
    Header(String),
    Cookie(String),
    Parameter(String),
}

impl KeyFacet {
    pub fn value<'r>(&self, request: &'r dyn HttpRequest) -> Option<&'r str> {
        match self {
            KeyFacet::Header(name) => request.header(name),
            KeyFacet::Cookie(name) => request.cookie(name),
            KeyFacet::Parameter(name) => request.parameter(name),
        }
    }
}

impl fmt::Display for KeyFacet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyFacet::Header(name) => write!(f, "header:{}", name.to_ascii_lowercase()),
            KeyFacet::Cookie(name) => write!(f, "cookie:{name}"),
            KeyFacet::Parameter(name) => write!(f, "parameter:{name}"),
        }
    }
}

/// Whole-string regular expression that remembers its source.
#[derive(Debug, Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("^(?:{source})$"))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

fn any_match(patterns: &[Pattern], value: &str) -> bool {
    patterns.iter().any(|pattern| pattern.is_match(value))
}

/// Cache policy. Build with [`CacheConfig::builder`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    name: String,
    store: String,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
    invalidation: Vec<Pattern>,
    response_mime_type: Option<String>,
    auth: AuthRequirement,
    mandatory_groups: BTreeSet<String>,
    optional_groups: BTreeSet<String>,
    facets: BTreeSet<KeyFacet>,
    expiry: ExpiryOverrides,
    attributes: BTreeMap<String, String>,
}

impl CacheConfig {
    pub fn builder(name: impl Into<String>, store: impl Into<String>) -> CacheConfigBuilder {
        CacheConfigBuilder {
            name: name.into(),
            store: store.into(),
            include: Vec::new(),
            exclude: Vec::new(),
            invalidation: Vec::new(),
            response_mime_type: None,
            auth: AuthRequirement::default(),
            mandatory_groups: BTreeSet::new(),
            optional_groups: BTreeSet::new(),
            facets: BTreeSet::new(),
            expiry: ExpiryOverrides::default(),
            attributes: BTreeMap::new(),
        }
    }

    /// Identity of this config.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn auth(&self) -> AuthRequirement {
        self.auth
    }

    pub fn mandatory_groups(&self) -> &BTreeSet<String> {
        &self.mandatory_groups
    }

    pub fn optional_groups(&self) -> &BTreeSet<String> {
        &self.optional_groups
    }

    pub fn facets(&self) -> &BTreeSet<KeyFacet> {
        &self.facets
    }

    pub fn expiry(&self) -> ExpiryOverrides {
        self.expiry
    }

    pub fn response_mime_type(&self) -> Option<&str> {
        self.response_mime_type.as_deref()
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn include_patterns(&self) -> impl Iterator<Item = &str> {
        self.include.iter().map(Pattern::as_str)
    }

    /// Whether any invalidation pattern matches a changed content path.
    pub fn matches_invalidation(&self, path: &str) -> bool {
        any_match(&self.invalidation, path)
    }

    /// Request-acceptance predicate, short-circuiting in order:
    /// auth requirement, include patterns, exclude patterns, groups.
    pub fn accepts(
        &self,
        request: &dyn HttpRequest,
        identity: &dyn IdentityProvider,
    ) -> Result<bool, CacheError> {
        let anonymous = identity.is_anonymous(request);
        if !self.auth.admits(anonymous) {
            return Ok(false);
        }
        if !any_match(&self.include, request.path()) {
            return Ok(false);
        }
        if any_match(&self.exclude, request.path()) {
            return Ok(false);
        }
        if anonymous || (self.mandatory_groups.is_empty() && self.optional_groups.is_empty()) {
            return Ok(true);
        }

        let groups = identity.groups(request)?;
        let mandatory = self
            .mandatory_groups
            .iter()
            .all(|group| groups.contains(group));
        let optional = self.optional_groups.is_empty()
            || self
                .optional_groups
                .iter()
                .any(|group| groups.contains(group));
        Ok(mandatory && optional)
    }

    /// Whether `key` is one of this config's entries.
    ///
    /// Only keys built under this config's name belong to it. A key carrying
    /// this name but a facet set the config no longer declares cannot be
    /// classified and yields [`CacheError::KeyCreation`].
    pub fn knows(&self, key: &CacheKey) -> Result<bool, CacheError> {
        if key.config_name() != self.name {
            return Ok(false);
        }
        RequestPathInfo::parse(key.uri())?;
        if !key.facets().keys().eq(self.facets.iter()) {
            return Err(CacheError::key_creation(format!(
                "key {key} predates the current facets of config `{}`",
                self.name
            )));
        }
        Ok(true)
    }
}

pub struct CacheConfigBuilder {
    name: String,
    store: String,
    include: Vec<String>,
    exclude: Vec<String>,
    invalidation: Vec<String>,
    response_mime_type: Option<String>,
    auth: AuthRequirement,
    mandatory_groups: BTreeSet<String>,
    optional_groups: BTreeSet<String>,
    facets: BTreeSet<KeyFacet>,
    expiry: ExpiryOverrides,
    attributes: BTreeMap<String, String>,
}

impl CacheConfigBuilder {
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn invalidate_on(mut self, pattern: impl Into<String>) -> Self {
        self.invalidation.push(pattern.into());
        self
    }

    pub fn response_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.response_mime_type = Some(mime.into());
        self
    }

    pub fn auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = auth;
        self
    }

    pub fn mandatory_group(mut self, group: impl Into<String>) -> Self {
        self.mandatory_groups.insert(group.into());
        self
    }

    pub fn optional_group(mut self, group: impl Into<String>) -> Self {
        self.optional_groups.insert(group.into());
        self
    }

    pub fn facet(mut self, facet: KeyFacet) -> Self {
        self.facets.insert(facet);
        self
    }

    pub fn expiry_on_create(mut self, ttl: Duration) -> Self {
        self.expiry.on_create = Some(ttl);
        self
    }

    pub fn expiry_on_update(mut self, ttl: Duration) -> Self {
        self.expiry.on_update = Some(ttl);
        self
    }

    pub fn expiry_on_access(mut self, ttl: Duration) -> Self {
        self.expiry.on_access = Some(ttl);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<CacheConfig, CacheError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(CacheError::invalid_config("<unnamed>", "name must not be empty"));
        }
        if self.store.trim().is_empty() {
            return Err(CacheError::invalid_config(name, "store must not be empty"));
        }
        if self.include.is_empty() {
            return Err(CacheError::invalid_config(
                name,
                "at least one include pattern is required",
            ));
        }

        let compile = |sources: Vec<String>| -> Result<Vec<Pattern>, CacheError> {
            sources
                .iter()
                .map(|source| {
                    Pattern::new(source).map_err(|err| {
                        CacheError::invalid_config(
                            name.as_str(),
                            format!("bad pattern `{source}`: {err}"),
                        )
                    })
                })
                .collect()
        };

        let include = compile(self.include)?;
        let exclude = compile(self.exclude)?;
        let invalidation = compile(self.invalidation)?;

        Ok(CacheConfig {
            name,
            store: self.store.trim().to_string(),
            include,
            exclude,
            invalidation,
            response_mime_type: self.response_mime_type,
            auth: self.auth,
            mandatory_groups: self.mandatory_groups,
            optional_groups: self.optional_groups,
            facets: self.facets,
            expiry: self.expiry,
            attributes: self.attributes,
        })
    }
}
