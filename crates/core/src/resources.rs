use serde::{Deserialize, Serialize};

/// A served resource kind, used as a lookup key and as a URL builder.
///
/// Only `group`, `version` and `plural` take part in equality and hashing:
/// the rest is informational and may vary between discoveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
    pub namespaced: bool,
    /// Served sub-resources, e.g. `status`, `scale`.
    #[serde(default)]
    pub subresources: Vec<String>,
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.version == other.version && self.plural == other.plural
    }
}

impl Eq for Resource {}

impl std::hash::Hash for Resource {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.version.hash(state);
        self.plural.hash(state);
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

impl Resource {
    pub fn new(group: &str, version: &str, plural: &str, kind: &str, namespaced: bool) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
            kind: kind.to_string(),
            namespaced,
            subresources: Vec::new(),
            verbs: Vec::new(),
        }
    }

    pub fn with_subresources<I: IntoIterator<Item = S>, S: Into<String>>(mut self, subs: I) -> Self {
        self.subresources = subs.into_iter().map(Into::into).collect();
        self
    }

    /// Parse `group/version/plural` or `version/plural` (core group).
    pub fn parse_key(key: &str, kind: &str, namespaced: bool) -> Option<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [version, plural] => Some(Self::new("", version, plural, kind, namespaced)),
            [group, version, plural] => Some(Self::new(group, version, plural, kind, namespaced)),
            _ => None,
        }
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.plural)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.plural)
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn has_subresource(&self, name: &str) -> bool {
        self.subresources.iter().any(|s| s == name)
    }

    /// Verbs are optional in descriptors; an empty list means "unknown, assume served".
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.is_empty() || self.verbs.iter().any(|v| v == verb)
    }

    /// Build the API path for a list, an object or its sub-resource.
    ///
    /// Cluster-scoped resources ignore the namespace.
    pub fn url(&self, namespace: Option<&str>, name: Option<&str>, subresource: Option<&str>) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(8);
        let api_version = self.api_version();
        if self.group.is_empty() {
            parts.push("api");
        } else {
            parts.push("apis");
        }
        parts.push(&api_version);
        if self.namespaced {
            if let Some(ns) = namespace {
                parts.push("namespaces");
                parts.push(ns);
            }
        }
        parts.push(&self.plural);
        if let Some(name) = name {
            parts.push(name);
            if let Some(sub) = subresource {
                parts.push(sub);
            }
        }
        format!("/{}", parts.join("/"))
    }
}
