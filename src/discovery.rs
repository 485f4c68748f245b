//! Runtime discovery of manageable resource kinds
//!
//! The manager does not know ahead of time which kinds exist in the
//! cluster. Each reconcile pass enumerates the preferred API resources and
//! keeps those whose advertised verbs include everything TTL enforcement
//! needs: `list` and `watch` to observe objects, `delete` to act on them.

use std::fmt;
use std::hash::{Hash, Hasher};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use kube::discovery::ApiResource;
use kube::Client;
use tracing::warn;

use crate::Error;

/// Verbs a kind must advertise to be managed at all
const REQUIRED_VERBS: &[&str] = &["list", "watch", "delete"];

/// Identity of a REST collection on the API server: the
/// `(group, version, resource)` triple, plus the capabilities needed to
/// build clients for it.
///
/// Equality and hashing consider only the triple; `kind` and `namespaced`
/// ride along for API construction.
#[derive(Debug, Clone)]
pub struct ResourceKind {
    /// API group; empty for the core group
    pub group: String,
    /// API version within the group, e.g. `v1`
    pub version: String,
    /// Plural resource name, e.g. `configmaps`
    pub resource: String,
    /// Object kind served by the collection, e.g. `ConfigMap`
    pub kind: String,
    /// Whether objects of this kind live in namespaces
    pub namespaced: bool,
}

impl ResourceKind {
    /// The `ApiResource` used to build dynamic clients for this kind
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: if self.group.is_empty() {
                self.version.clone()
            } else {
                format!("{}/{}", self.group, self.version)
            },
            kind: self.kind.clone(),
            plural: self.resource.clone(),
        }
    }
}

impl PartialEq for ResourceKind {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
            && self.version == other.version
            && self.resource == other.resource
    }
}

impl Eq for ResourceKind {}

impl Hash for ResourceKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.version.hash(state);
        self.resource.hash(state);
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Enumerate every kind, at its group's preferred version, that supports
/// `list`, `watch` and `delete`.
///
/// Groups that fail to enumerate are logged and skipped so one unreachable
/// aggregated API does not take TTL enforcement down for everything else.
/// Failing to list the groups themselves, or a malformed `groupVersion` in
/// a response, aborts the call.
pub async fn discover(client: &Client) -> crate::Result<Vec<ResourceKind>> {
    let mut kinds = Vec::new();

    let core = match client.list_core_api_versions().await {
        Ok(versions) => versions.versions.first().cloned(),
        Err(err) => {
            warn!(group = "core", error = %err, "skipping group after discovery failure");
            None
        }
    };
    if let Some(version) = core {
        match client.list_core_api_resources(&version).await {
            Ok(list) => kinds.extend(eligible_kinds(&list)?),
            Err(err) => {
                warn!(group = "core", error = %err, "skipping group after discovery failure");
            }
        }
    }

    let groups = client
        .list_api_groups()
        .await
        .map_err(|err| Error::discovery(format!("listing api groups: {err}")))?;
    for group in &groups.groups {
        let preferred = group.preferred_version.as_ref().or_else(|| group.versions.first());
        let Some(version) = preferred else { continue };
        match client.list_api_group_resources(&version.group_version).await {
            Ok(list) => kinds.extend(eligible_kinds(&list)?),
            Err(err) => {
                warn!(group = %group.name, error = %err, "skipping group after discovery failure");
            }
        }
    }

    Ok(kinds)
}

/// Extract the kinds of one discovery response that advertise every
/// required verb (pure function). Subresources never qualify.
fn eligible_kinds(list: &APIResourceList) -> crate::Result<Vec<ResourceKind>> {
    let (group, version) = parse_group_version(&list.group_version)?;
    Ok(list
        .resources
        .iter()
        .filter(|resource| !resource.name.contains('/'))
        .filter(|resource| {
            REQUIRED_VERBS
                .iter()
                .all(|needed| resource.verbs.iter().any(|verb| verb == needed))
        })
        .map(|resource| ResourceKind {
            group: group.clone(),
            version: version.clone(),
            resource: resource.name.clone(),
            kind: resource.kind.clone(),
            namespaced: resource.namespaced,
        })
        .collect())
}

/// Split a `groupVersion` string (`apps/v1`, or `v1` for the core group)
/// into its parts (pure function)
fn parse_group_version(group_version: &str) -> crate::Result<(String, String)> {
    match group_version.split_once('/') {
        Some((group, version))
            if !group.is_empty() && !version.is_empty() && !version.contains('/') =>
        {
            Ok((group.to_string(), version.to_string()))
        }
        None if !group_version.is_empty() => Ok((String::new(), group_version.to_string())),
        _ => Err(Error::discovery(format!(
            "invalid group version {group_version:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
    use std::collections::HashSet;

    fn api_resource(name: &str, kind: &str, namespaced: bool, verbs: &[&str]) -> APIResource {
        APIResource {
            name: name.to_string(),
            kind: kind.to_string(),
            namespaced,
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    fn full_verbs() -> Vec<&'static str> {
        vec!["create", "delete", "get", "list", "patch", "update", "watch"]
    }

    #[test]
    fn keeps_kinds_with_all_required_verbs() {
        let list = APIResourceList {
            group_version: "v1".to_string(),
            resources: vec![
                api_resource("configmaps", "ConfigMap", true, &full_verbs()),
                api_resource("pods", "Pod", true, &full_verbs()),
            ],
        };
        let kinds = eligible_kinds(&list).unwrap();
        assert_eq!(kinds.len(), 2);
        assert_eq!(kinds[0].resource, "configmaps");
        assert_eq!(kinds[0].group, "");
        assert_eq!(kinds[0].version, "v1");
        assert!(kinds[0].namespaced);
    }

    #[test]
    fn drops_kinds_missing_a_required_verb() {
        let list = APIResourceList {
            group_version: "v1".to_string(),
            resources: vec![
                // componentstatuses is list/get only
                api_resource("componentstatuses", "ComponentStatus", false, &["get", "list"]),
                api_resource("bindings", "Binding", true, &["create"]),
                api_resource("pods", "Pod", true, &full_verbs()),
            ],
        };
        let kinds = eligible_kinds(&list).unwrap();
        assert_eq!(kinds.len(), 1);
        assert_eq!(kinds[0].resource, "pods");
    }

    #[test]
    fn drops_subresources() {
        let list = APIResourceList {
            group_version: "apps/v1".to_string(),
            resources: vec![
                api_resource("deployments", "Deployment", true, &full_verbs()),
                api_resource("deployments/status", "Deployment", true, &full_verbs()),
            ],
        };
        let kinds = eligible_kinds(&list).unwrap();
        assert_eq!(kinds.len(), 1);
        assert_eq!(kinds[0].resource, "deployments");
        assert_eq!(kinds[0].group, "apps");
    }

    #[test]
    fn invalid_group_version_aborts() {
        let list = APIResourceList {
            group_version: "apps/v1/extra".to_string(),
            resources: vec![api_resource("deployments", "Deployment", true, &full_verbs())],
        };
        assert!(eligible_kinds(&list).is_err());

        let list = APIResourceList {
            group_version: String::new(),
            resources: vec![],
        };
        assert!(eligible_kinds(&list).is_err());
    }

    #[test]
    fn parses_core_and_grouped_versions() {
        assert_eq!(
            parse_group_version("v1").unwrap(),
            (String::new(), "v1".to_string())
        );
        assert_eq!(
            parse_group_version("apps/v1").unwrap(),
            ("apps".to_string(), "v1".to_string())
        );
        assert!(parse_group_version("").is_err());
        assert!(parse_group_version("/v1").is_err());
        assert!(parse_group_version("apps/").is_err());
    }

    #[test]
    fn identity_is_the_triple_only() {
        let namespaced = ResourceKind {
            group: "apps".into(),
            version: "v1".into(),
            resource: "deployments".into(),
            kind: "Deployment".into(),
            namespaced: true,
        };
        let mut cluster_scoped = namespaced.clone();
        cluster_scoped.namespaced = false;
        cluster_scoped.kind = "Renamed".into();
        assert_eq!(namespaced, cluster_scoped);

        let mut set = HashSet::new();
        set.insert(namespaced);
        assert!(set.contains(&cluster_scoped));
    }

    #[test]
    fn api_resource_carries_the_right_api_version() {
        let core = ResourceKind {
            group: String::new(),
            version: "v1".into(),
            resource: "configmaps".into(),
            kind: "ConfigMap".into(),
            namespaced: true,
        };
        let ar = core.api_resource();
        assert_eq!(ar.api_version, "v1");
        assert_eq!(ar.plural, "configmaps");

        let grouped = ResourceKind {
            group: "batch".into(),
            version: "v1".into(),
            resource: "jobs".into(),
            kind: "Job".into(),
            namespaced: true,
        };
        assert_eq!(grouped.api_resource().api_version, "batch/v1");
    }

    #[test]
    fn display_reads_like_an_api_path() {
        let core = ResourceKind {
            group: String::new(),
            version: "v1".into(),
            resource: "pods".into(),
            kind: "Pod".into(),
            namespaced: true,
        };
        assert_eq!(core.to_string(), "v1/pods");

        let grouped = ResourceKind {
            group: "apps".into(),
            version: "v1".into(),
            resource: "deployments".into(),
            kind: "Deployment".into(),
            namespaced: true,
        };
        assert_eq!(grouped.to_string(), "apps/v1/deployments");
    }
}
