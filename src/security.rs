//! Abstract permission model and its mapping onto Kubernetes resources
//!
//! API operations declare the [`ResourceAction`]s they require in terms of an
//! abstract vocabulary ([`ResourceType`] plus [`ResourceVerb`]). The
//! [`ResourceMap`] translates each type into the concrete [`GroupResource`]s
//! that are probed with `SelfSubjectAccessReview`s on OpenShift. Types absent
//! from the map are not gated by cluster permissions.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::error::AuthError;

/// Canonical form of a [`GroupResource`]: `resource[.group][/subResource]`,
/// e.g. `flightrecorders.operator.cryostat.io/status`.
static RESOURCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(\w+)([.\w]+)?(?:/(\w+))?$").expect("resource pattern is valid")
});

/// Kinds of resources the monitoring service exposes through its API
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum ResourceType {
    /// A connectable JVM target
    Target,
    /// A flight recording on a target or in the archive
    Recording,
    /// An event template
    Template,
    /// An agent probe template
    ProbeTemplate,
    /// An automated analysis report
    Report,
    /// An automated rule definition
    Rule,
    /// Stored JMX credentials
    Credentials,
    /// A trusted SSL certificate
    Certificate,
}

impl ResourceType {
    /// Name used in configuration keys and API documentation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Target => "TARGET",
            Self::Recording => "RECORDING",
            Self::Template => "TEMPLATE",
            Self::ProbeTemplate => "PROBE_TEMPLATE",
            Self::Report => "REPORT",
            Self::Rule => "RULE",
            Self::Credentials => "CREDENTIALS",
            Self::Certificate => "CERTIFICATE",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TARGET" => Ok(Self::Target),
            "RECORDING" => Ok(Self::Recording),
            "TEMPLATE" => Ok(Self::Template),
            "PROBE_TEMPLATE" => Ok(Self::ProbeTemplate),
            "REPORT" => Ok(Self::Report),
            "RULE" => Ok(Self::Rule),
            "CREDENTIALS" => Ok(Self::Credentials),
            "CERTIFICATE" => Ok(Self::Certificate),
            other => Err(AuthError::invalid_argument(format!(
                "unknown resource type \"{other}\""
            ))),
        }
    }
}

/// Operations that can be performed on a [`ResourceType`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceVerb {
    /// Create a new instance
    Create,
    /// Read one or more instances
    Read,
    /// Modify an existing instance
    Update,
    /// Remove an instance
    Delete,
}

impl ResourceVerb {
    /// The Kubernetes verb submitted in access review probes
    pub fn kube_verb(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "get",
            Self::Update => "patch",
            Self::Delete => "delete",
        }
    }
}

/// An abstract permission: a verb applied to a resource type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceAction {
    resource: ResourceType,
    verb: ResourceVerb,
}

impl ResourceAction {
    /// Pair a resource type with a verb
    pub fn new(resource: ResourceType, verb: ResourceVerb) -> Self {
        Self { resource, verb }
    }

    /// The resource type this action applies to
    pub fn resource(&self) -> ResourceType {
        self.resource
    }

    /// The operation being performed
    pub fn verb(&self) -> ResourceVerb {
        self.verb
    }
}

/// A concrete Kubernetes `(group, resource, subResource)` triple
///
/// Any component may be empty; the core group is the empty string. Parses
/// from and formats to the canonical `resource[.group][/subResource]` form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupResource {
    group: String,
    resource: String,
    sub_resource: String,
}

impl GroupResource {
    /// Build a triple from its components
    pub fn new(
        group: impl Into<String>,
        resource: impl Into<String>,
        sub_resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
            sub_resource: sub_resource.into(),
        }
    }

    /// API group, empty for the core group
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Resource plural name
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Subresource name, empty when the probe targets the resource itself
    pub fn sub_resource(&self) -> &str {
        &self.sub_resource
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resource)?;
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        if !self.sub_resource.is_empty() {
            write!(f, "/{}", self.sub_resource)?;
        }
        Ok(())
    }
}

impl FromStr for GroupResource {
    type Err = AuthError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let captures = RESOURCE_PATTERN.captures(raw).ok_or_else(|| {
            AuthError::invalid_argument(format!("malformed group resource \"{raw}\""))
        })?;
        let resource = &captures[1];
        // The second capture includes the '.' separating it from the
        // resource name.
        let group = captures
            .get(2)
            .map(|m| &m.as_str()[1..])
            .unwrap_or_default();
        let sub_resource = captures.get(3).map(|m| m.as_str()).unwrap_or_default();
        Ok(Self::new(group, resource, sub_resource))
    }
}

/// Immutable mapping from [`ResourceType`] to the [`GroupResource`]s probed
/// for it
///
/// Built once at startup from a properties-style key/value source. Lookup of
/// a type absent from the map yields no probes, which grants the action.
#[derive(Clone, Debug, Default)]
pub struct ResourceMap {
    entries: HashMap<ResourceType, BTreeSet<GroupResource>>,
}

impl ResourceMap {
    /// Parse a properties-style source (`KEY=value` lines, `#` comments)
    ///
    /// Keys are [`ResourceType`] names; values are comma-separated canonical
    /// [`GroupResource`] strings. Unrecognized keys and malformed values are
    /// logged and dropped; construction never fails.
    pub fn from_properties(source: &str) -> Self {
        let mut entries = HashMap::new();
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(line, "resource mapping line is not KEY=value, skipping");
                continue;
            };
            let resource_type = match key.trim().parse::<ResourceType>() {
                Ok(rt) => rt,
                Err(_) => {
                    warn!(key, "unrecognized resource type in mapping, skipping");
                    continue;
                }
            };
            let resources: BTreeSet<GroupResource> = value
                .split(',')
                .map(str::trim)
                .filter(|piece| !piece.is_empty())
                .filter_map(|piece| match piece.parse::<GroupResource>() {
                    Ok(gr) => Some(gr),
                    Err(err) => {
                        warn!(%resource_type, piece, %err, "malformed group resource, skipping");
                        None
                    }
                })
                .collect();
            entries.insert(resource_type, resources);
        }
        Self { entries }
    }

    /// The mapping shipped with the service for OpenShift deployments
    pub fn openshift_defaults() -> Self {
        Self::from_properties(include_str!("openshift_resource_map.properties"))
    }

    /// The group resources gating the given type; empty for unmapped types
    pub fn get(&self, resource: ResourceType) -> impl Iterator<Item = &GroupResource> {
        self.entries.get(&resource).into_iter().flatten()
    }

    /// Whether any type has at least one mapped group resource
    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeSet::is_empty)
    }
}
