//! Permission checks for discovered kinds
//!
//! Discovery tells us which kinds the cluster serves; it says nothing about
//! which kinds our service account may touch. Before a controller is
//! started for a kind, every verb TTL enforcement uses is checked with a
//! self-subject access review. The checks run on every manager pass and
//! are never cached, so a revoked permission stops the kind's controller
//! within one pass.

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{debug, warn};

use crate::discovery::ResourceKind;

/// Verbs the identity must hold on a kind before we manage it. `get` is not
/// used by the controller itself but is required alongside the others so
/// that partial grants surface early.
const REQUIRED_VERBS: &[&str] = &["get", "list", "watch", "delete"];

/// Access reviews are namespace-scoped questions; all kinds are checked
/// against this fixed namespace.
const REVIEW_NAMESPACE: &str = "default";

/// Asks the API server which verbs the current identity holds
pub struct AccessChecker {
    reviews: Api<SelfSubjectAccessReview>,
}

impl AccessChecker {
    /// Create a checker for the identity behind `client`
    pub fn new(client: Client) -> Self {
        Self {
            reviews: Api::all(client),
        }
    }

    /// Whether the current identity may list, watch, and delete objects of
    /// this kind.
    ///
    /// Any review error counts as "no": a kind we cannot verify is a kind
    /// we do not manage.
    pub async fn may_manage(&self, kind: &ResourceKind) -> bool {
        for verb in REQUIRED_VERBS {
            match self.allowed(kind, verb).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(resource = %kind, verb, "identity lacks verb, kind not managed");
                    return false;
                }
                Err(err) => {
                    warn!(resource = %kind, verb, error = %err, "access review failed, kind not managed");
                    return false;
                }
            }
        }
        true
    }

    async fn allowed(&self, kind: &ResourceKind, verb: &str) -> kube::Result<bool> {
        let review = self
            .reviews
            .create(&PostParams::default(), &access_review(kind, verb))
            .await?;
        Ok(review.status.map(|status| status.allowed).unwrap_or(false))
    }
}

/// Build the review asking "may I perform `verb` on `kind`?" (pure function)
fn access_review(kind: &ResourceKind, verb: &str) -> SelfSubjectAccessReview {
    SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                group: Some(kind.group.clone()),
                version: Some(kind.version.clone()),
                resource: Some(kind.resource.clone()),
                namespace: Some(REVIEW_NAMESPACE.to_string()),
                verb: Some(verb.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}
