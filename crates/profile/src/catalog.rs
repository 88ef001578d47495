//! URL-pattern catalog of known systems
//!
//! Each system lists substrings expected in its login URLs. A system matches
//! a URL when at least half of its patterns occur in it (case-insensitive);
//! systems are tried in declaration order and the first match wins. URLs that
//! match nothing get the fallback template.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info};

use crate::template::RequestTemplate;
use crate::{Error, ProfileSource, Result};

/// One catalog row as written in config (`[[systems]]`).
#[derive(Debug, Clone, Deserialize)]
pub struct SystemProfile {
    pub id: String,
    /// Substrings of the login URL, e.g. `"/webui/"` or `"routerlogin"`
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(flatten)]
    pub template: RequestTemplate,
}

struct Entry {
    id: String,
    patterns: Vec<String>,
    template: Arc<RequestTemplate>,
}

impl Entry {
    fn matches(&self, url_lower: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let hits = self
            .patterns
            .iter()
            .filter(|p| url_lower.contains(p.as_str()))
            .count();
        hits * 2 >= self.patterns.len()
    }
}

/// Ordered set of system profiles plus a fallback.
pub struct Catalog {
    entries: Vec<Entry>,
    fallback: Arc<RequestTemplate>,
}

impl Catalog {
    /// Build a catalog, validating each profile.
    ///
    /// Rejects duplicate or empty ids, empty login endpoints, and templates
    /// whose username and password fields collide.
    pub fn new(systems: Vec<SystemProfile>, fallback: RequestTemplate) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(systems.len());

        for system in systems {
            let SystemProfile {
                id,
                patterns,
                mut template,
            } = system;
            if id.trim().is_empty() {
                return Err(Error::InvalidProfile {
                    id,
                    reason: "id must not be empty".into(),
                });
            }
            if !seen.insert(id.clone()) {
                return Err(Error::InvalidProfile {
                    id,
                    reason: "duplicate id".into(),
                });
            }
            validate_template(&id, &template)?;
            if template.name.is_empty() {
                template.name = id.clone();
            }
            entries.push(Entry {
                id,
                patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
                template: Arc::new(template),
            });
        }
        validate_template("fallback", &fallback)?;

        info!(systems = entries.len(), "profile catalog loaded");
        Ok(Self {
            entries,
            fallback: Arc::new(fallback),
        })
    }

    /// Number of named systems (the fallback is not counted).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id of the system matching `url`, or `None` for the fallback.
    pub fn identify(&self, url: &str) -> Option<&str> {
        let lower = url.to_lowercase();
        self.entries
            .iter()
            .find(|e| e.matches(&lower))
            .map(|e| e.id.as_str())
    }
}

impl ProfileSource for Catalog {
    fn profile(&self, url: &str) -> Arc<RequestTemplate> {
        let lower = url.to_lowercase();
        match self.entries.iter().find(|e| e.matches(&lower)) {
            Some(entry) => {
                debug!(system = %entry.id, "matched system profile");
                entry.template.clone()
            }
            None => self.fallback.clone(),
        }
    }
}

fn validate_template(id: &str, template: &RequestTemplate) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidProfile {
        id: id.to_string(),
        reason: reason.to_string(),
    };
    if template.login_endpoint.trim().is_empty() {
        return Err(invalid("login_endpoint must not be empty"));
    }
    if template.username_field.is_empty() || template.password_field.is_empty() {
        return Err(invalid("username_field and password_field must be set"));
    }
    if template.username_field == template.password_field {
        return Err(invalid("username_field and password_field must differ"));
    }
    Ok(())
}
