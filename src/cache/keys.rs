//! Cache key definitions.
//!
//! A [`CacheKey`] fingerprints one cacheable request variant under one
//! config: the request path split into resource path, selectors and
//! extension, the owning config's identity, its auth and group policy, and
//! the values of every facet the config allow-lists.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use sha2::{Digest, Sha256};

use super::config::{AuthRequirement, CacheConfig, KeyFacet};
use super::error::CacheError;
use super::http::{HttpRequest, RequestPathInfo};

/// Per-key expiry overrides. Absent or zero means "use the store default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryOverrides {
    pub on_create: Option<Duration>,
    pub on_update: Option<Duration>,
    pub on_access: Option<Duration>,
}

impl ExpiryOverrides {
    pub fn on_create(&self) -> Option<Duration> {
        positive(self.on_create)
    }

    pub fn on_update(&self) -> Option<Duration> {
        positive(self.on_update)
    }

    pub fn on_access(&self) -> Option<Duration> {
        positive(self.on_access)
    }
}

fn positive(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|ttl| !ttl.is_zero())
}

/// Deterministic request fingerprint. Expiry overrides ride along but are not
/// part of the key's identity.
#[derive(Debug, Clone)]
pub struct CacheKey {
    path: RequestPathInfo,
    uri: String,
    config_name: String,
    auth: AuthRequirement,
    mandatory_groups: BTreeSet<String>,
    optional_groups: BTreeSet<String>,
    facets: BTreeMap<KeyFacet, Option<String>>,
    expiry: ExpiryOverrides,
}

impl CacheKey {
    /// Key for `request` under `config`, including every allow-listed facet.
    pub fn from_request(
        request: &dyn HttpRequest,
        config: &CacheConfig,
    ) -> Result<Self, CacheError> {
        let mut key = Self::for_uri(request.path(), config)?;
        key.facets = config
            .facets()
            .iter()
            .map(|facet| (facet.clone(), facet.value(request).map(str::to_string)))
            .collect();
        Ok(key)
    }

    /// Key for a bare request path under `config`, with every facet absent.
    pub fn for_uri(uri: &str, config: &CacheConfig) -> Result<Self, CacheError> {
        let path = RequestPathInfo::parse(uri)?;
        Ok(Self {
            uri: path.to_uri(),
            path,
            config_name: config.name().to_string(),
            auth: config.auth(),
            mandatory_groups: config.mandatory_groups().clone(),
            optional_groups: config.optional_groups().clone(),
            facets: config.facets().iter().map(|f| (f.clone(), None)).collect(),
            expiry: config.expiry(),
        })
    }

    pub fn with_expiry(mut self, expiry: ExpiryOverrides) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn resource_path(&self) -> &str {
        &self.path.resource_path
    }

    pub fn selectors(&self) -> &[String] {
        &self.path.selectors
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension.as_deref()
    }

    pub fn config_name(&self) -> &str {
        &self.config_name
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

    pub fn facets(&self) -> &BTreeMap<KeyFacet, Option<String>> {
        &self.facets
    }

    pub fn expiry(&self) -> ExpiryOverrides {
        self.expiry
    }

    /// Hierarchical invalidation: `self` goes when `other` names the same
    /// resource or one of its ancestors, whatever the selectors, extension
    /// or facets.
    pub fn is_invalidated_by(&self, other: &CacheKey) -> bool {
        let mine = self.resource_path();
        let theirs = other.resource_path();
        if mine == theirs || theirs == "/" {
            return true;
        }
        mine.strip_prefix(theirs)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Stable hex digest of the key identity, used in observability output.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn canonical(&self) -> String {
        let mut out = format!(
            "{}|{}|{:?}|{}|{}",
            self.config_name,
            self.uri,
            self.auth,
            join(&self.mandatory_groups),
            join(&self.optional_groups)
        );
        for (facet, value) in &self.facets {
            out.push('|');
            out.push_str(&facet.to_string());
            out.push('=');
            out.push_str(value.as_deref().unwrap_or("\u{0}"));
        }
        out
    }
}

fn join(groups: &BTreeSet<String>) -> String {
    groups.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
            && self.config_name == other.config_name
            && self.auth == other.auth
            && self.mandatory_groups == other.mandatory_groups
            && self.optional_groups == other.optional_groups
            && self.facets == other.facets
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
        self.config_name.hash(state);
        self.auth.hash(state);
        self.mandatory_groups.hash(state);
        self.optional_groups.hash(state);
        self.facets.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.uri, self.config_name)?;
        for (facet, value) in &self.facets {
            write!(f, " {facet}={}", value.as_deref().unwrap_or("-"))?;
        }
        Ok(())
    }
}
