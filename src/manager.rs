//! OpenShift-backed authentication and authorization facade
//!
//! This module ties the subsystem together: token extraction, token review,
//! the access review fan-out, OAuth login/logout URLs, and the per-token
//! client cache behind one [`AuthManager`] implementation.
//!
//! # Decision flow
//!
//! 1. Extract the bearer token from the HTTP header or WebSocket
//!    subprotocol; no token short-circuits to `false` with no cluster call.
//! 2. With no required resource actions, a `TokenReview` alone decides
//!    (authentication only: callers must not rely on this as a permission
//!    check).
//! 3. With required actions, one `SelfSubjectAccessReview` is submitted per
//!    mapped group resource, running as the caller, and the results are
//!    reduced: allowed iff every probe is allowed.
//!
//! # Failure semantics
//!
//! Validation entry points never fail for a missing or malformed token;
//! they return `false`. Everything else rides [`AuthError`], and any error
//! surfaced for a token invalidates that token's cached cluster client
//! first, so a renewed presentation starts clean.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::authentication::v1::TokenReviewStatus;
use kube::{Client, Config};
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::cache::UserClientCache;
use crate::client::{
    BearerTokenClientFactory, KubeServiceAccountClient, ServiceAccountClient, UserClient,
    UserClientFactory,
};
use crate::error::AuthError;
use crate::oauth::{oauth_access_token_name, AuthorizationUrlParams, OAuthEndpoints};
use crate::security::{GroupResource, ResourceAction, ResourceMap};
use crate::token;

/// Environment variable naming the OAuth client service account
pub const CRYOSTAT_OAUTH_CLIENT_ID: &str = "CRYOSTAT_OAUTH_CLIENT_ID";
/// Environment variable naming the role requested in the OAuth token scope
pub const CRYOSTAT_OAUTH_ROLE: &str = "CRYOSTAT_OAUTH_ROLE";

/// Where the pod's own namespace is mounted in-cluster
const NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// HTTP authentication scheme advertised in `WWW-Authenticate`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthenticationScheme {
    /// Username/password credentials
    Basic,
    /// Opaque bearer token
    Bearer,
    /// No authentication required
    None,
}

impl fmt::Display for AuthenticationScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Basic => "Basic",
            Self::Bearer => "Bearer",
            Self::None => "None",
        })
    }
}

/// Identity of an authenticated caller
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    /// Cluster username associated with the reviewed token
    pub username: String,
}

/// Read access to process environment variables
#[cfg_attr(test, automock)]
pub trait Environment: Send + Sync {
    /// The value of `name`, or `None` when unset
    fn get_env(&self, name: &str) -> Option<String>;
}

/// [`Environment`] backed by the real process environment
pub struct ProcessEnvironment;

impl Environment for ProcessEnvironment {
    fn get_env(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Yields the namespace access review probes run against
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceProvider: Send + Sync {
    /// The namespace, resolved lazily
    async fn namespace(&self) -> Result<String, AuthError>;
}

/// [`NamespaceProvider`] reading the pod's own namespace from the
/// serviceaccount mount, once
pub struct PodNamespaceProvider {
    path: PathBuf,
    cached: OnceCell<String>,
}

impl PodNamespaceProvider {
    /// Read from the standard in-cluster serviceaccount mount
    pub fn new() -> Self {
        Self::with_path(NAMESPACE_PATH)
    }

    /// Read from an alternate path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: OnceCell::new(),
        }
    }
}

impl Default for PodNamespaceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NamespaceProvider for PodNamespaceProvider {
    async fn namespace(&self) -> Result<String, AuthError> {
        self.cached
            .get_or_try_init(|| async {
                let contents = tokio::fs::read_to_string(&self.path).await.map_err(|err| {
                    AuthError::internal(format!(
                        "failed to read namespace from {}: {err}",
                        self.path.display()
                    ))
                })?;
                Ok(contents.trim().to_string())
            })
            .await
            .cloned()
    }
}

/// Tunables of the auth manager
#[derive(Clone, Debug)]
pub struct AuthManagerConfig {
    /// Overall deadline for one validation's access review fan-out
    pub access_review_deadline: Duration,
    /// How long an unused per-token cluster client stays cached
    pub client_cache_idle: Duration,
}

impl Default for AuthManagerConfig {
    fn default() -> Self {
        Self {
            access_review_deadline: Duration::from_secs(15),
            client_cache_idle: Duration::from_secs(300),
        }
    }
}

/// Gate for every request the monitoring service serves
///
/// All methods are safe for concurrent invocation from arbitrary tasks.
#[async_trait]
pub trait AuthManager: Send + Sync {
    /// The HTTP authentication scheme this manager understands
    fn scheme(&self) -> AuthenticationScheme;

    /// Review the header's bearer token and return the caller's identity
    async fn get_user_info(&self, header: Option<&str>) -> Result<UserInfo, AuthError>;

    /// Validate a raw bearer token against the required resource actions
    ///
    /// An empty action set collapses to pure authentication: a valid token
    /// passes with no permission check at all. Callers gating privileged
    /// operations must pass the actions those operations require.
    async fn validate_token(
        &self,
        token: &str,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<bool, AuthError>;

    /// Validate the bearer token carried in an HTTP `Authorization` header
    ///
    /// A missing, non-Bearer, or undecodable header yields `Ok(false)`
    /// without a cluster call. The empty-action-set caveat of
    /// [`validate_token`](AuthManager::validate_token) applies.
    async fn validate_http_header(
        &self,
        header: Option<&str>,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<bool, AuthError>;

    /// Validate the bearer token carried in a WebSocket subprotocol string
    async fn validate_websocket_subprotocol(
        &self,
        subprotocol: Option<&str>,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<bool, AuthError>;

    /// Where to send an interactive caller who is not (sufficiently)
    /// logged in
    ///
    /// Returns `None` when the presented header already validates for the
    /// required actions, and the OAuth authorization URL when it does not
    /// or when validation fails for a credential-shaped reason.
    async fn get_login_redirect_url(
        &self,
        header: Option<&str>,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<Option<String>, AuthError>;

    /// Revoke the header's token on the cluster and return the URL ending
    /// the OAuth session
    async fn logout(&self, header: Option<&str>) -> Result<Option<String>, AuthError>;
}

/// Telemetry bracket around one cluster auth call
///
/// Always committed, whether the call succeeded or not, so operators can
/// count and time auth traffic against the cluster.
struct AuthRequest {
    started: Instant,
    request_successful: bool,
}

impl AuthRequest {
    fn begin() -> Self {
        Self {
            started: Instant::now(),
            request_successful: false,
        }
    }

    fn set_request_successful(&mut self, successful: bool) {
        self.request_successful = successful;
    }

    fn commit(self) {
        info!(
            target: "cryostat::auth",
            category = "Cryostat",
            label = "AuthRequest",
            request_successful = self.request_successful,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "auth request",
        );
    }
}

/// [`AuthManager`] delegating every decision to the OpenShift cluster
pub struct OpenShiftAuthManager {
    env: Arc<dyn Environment>,
    namespace: Arc<dyn NamespaceProvider>,
    service_account: Arc<dyn ServiceAccountClient>,
    user_clients: UserClientCache,
    oauth: OAuthEndpoints,
    resource_map: ResourceMap,
    config: AuthManagerConfig,
}

impl OpenShiftAuthManager {
    /// Assemble a manager from explicit collaborators
    pub fn new(
        env: Arc<dyn Environment>,
        namespace: Arc<dyn NamespaceProvider>,
        service_account: Arc<dyn ServiceAccountClient>,
        user_client_factory: Arc<dyn UserClientFactory>,
        resource_map: ResourceMap,
        config: AuthManagerConfig,
    ) -> Self {
        let user_clients = UserClientCache::new(user_client_factory, config.client_cache_idle);
        let oauth = OAuthEndpoints::new(Arc::clone(&service_account));
        Self {
            env,
            namespace,
            service_account,
            user_clients,
            oauth,
            resource_map,
            config,
        }
    }

    /// Assemble a manager for in-cluster deployment
    ///
    /// Uses the pod's serviceaccount credentials, environment, and
    /// namespace mount.
    pub fn in_cluster(
        resource_map: ResourceMap,
        config: AuthManagerConfig,
    ) -> Result<Self, AuthError> {
        let kube_config = Config::incluster()
            .map_err(|err| AuthError::cluster_client(format!("in-cluster config: {err}")))?;
        let client = Client::try_from(kube_config.clone())?;
        Ok(Self::new(
            Arc::new(ProcessEnvironment),
            Arc::new(PodNamespaceProvider::new()),
            Arc::new(KubeServiceAccountClient::new(client)),
            Arc::new(BearerTokenClientFactory::new(kube_config)),
            resource_map,
            config,
        ))
    }

    async fn perform_token_review(&self, token: &str) -> Result<TokenReviewStatus, AuthError> {
        let mut event = AuthRequest::begin();
        let outcome = self.service_account.create_token_review(token).await;
        event.set_request_successful(outcome.is_ok());
        event.commit();

        let status = outcome?;
        if let Some(error) = status.error.as_deref().filter(|e| !e.trim().is_empty()) {
            return Err(AuthError::authorization_failure(error));
        }
        Ok(status)
    }

    async fn review_token(&self, token: &str) -> Result<bool, AuthError> {
        let status = self.perform_token_review(token).await?;
        Ok(status.authenticated.unwrap_or(false))
    }

    async fn validate_actions(
        &self,
        client: Arc<dyn UserClient>,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<bool, AuthError> {
        let namespace = self.namespace.namespace().await?;

        let mut probes = Vec::new();
        for action in resource_actions {
            let verb = action.verb().kube_verb();
            for group_resource in self.resource_map.get(action.resource()) {
                probes.push(Self::submit_access_review(
                    Arc::clone(&client),
                    namespace.clone(),
                    group_resource.clone(),
                    verb,
                ));
            }
        }
        // Actions with no mapped group resources are not gated.
        if probes.is_empty() {
            return Ok(true);
        }

        match tokio::time::timeout(self.config.access_review_deadline, try_join_all(probes)).await
        {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AuthError::Timeout(self.config.access_review_deadline)),
        }
    }

    async fn submit_access_review(
        client: Arc<dyn UserClient>,
        namespace: String,
        group_resource: GroupResource,
        verb: &'static str,
    ) -> Result<(), AuthError> {
        let review = SelfSubjectAccessReview {
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(namespace.clone()),
                    group: non_empty(group_resource.group()),
                    resource: non_empty(group_resource.resource()),
                    subresource: non_empty(group_resource.sub_resource()),
                    verb: Some(verb.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut event = AuthRequest::begin();
        let outcome = client.create_access_review(review).await;
        event.set_request_successful(outcome.is_ok());
        event.commit();

        let status = outcome?.status.unwrap_or_default();
        if status.allowed {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied {
                namespace,
                resource: group_resource.to_string(),
                verb: verb.to_string(),
                reason: status.reason.unwrap_or_default(),
            })
        }
    }

    async fn authorization_url(&self) -> Result<String, AuthError> {
        self.oauth
            .authorization_url(|| async {
                let namespace = self.namespace.namespace().await?;
                let client_id = self.require_env(CRYOSTAT_OAUTH_CLIENT_ID)?;
                let role = self.require_env(CRYOSTAT_OAUTH_ROLE)?;
                Ok(AuthorizationUrlParams {
                    client_id: format!("system:serviceaccount:{namespace}:{client_id}"),
                    scope: format!("user:check-access role:{role}:{namespace}"),
                })
            })
            .await
    }

    fn require_env(&self, name: &str) -> Result<String, AuthError> {
        self.env
            .get_env(name)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| AuthError::MissingEnvironmentVariable(name.to_string()))
    }
}

#[async_trait]
impl AuthManager for OpenShiftAuthManager {
    fn scheme(&self) -> AuthenticationScheme {
        AuthenticationScheme::Bearer
    }

    async fn get_user_info(&self, header: Option<&str>) -> Result<UserInfo, AuthError> {
        let token = header
            .and_then(token::from_http_header)
            .ok_or_else(|| AuthError::authorization_failure("no bearer token presented"))?;
        let status = self.perform_token_review(&token).await?;
        if status.authenticated != Some(true) {
            return Err(AuthError::authorization_failure("authentication failed"));
        }
        let username = status
            .user
            .and_then(|user| user.username)
            .unwrap_or_default();
        Ok(UserInfo { username })
    }

    #[instrument(skip_all, fields(actions = resource_actions.len()))]
    async fn validate_token(
        &self,
        token: &str,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<bool, AuthError> {
        if token.trim().is_empty() {
            return Ok(false);
        }
        if resource_actions.is_empty() {
            return self.review_token(token).await;
        }

        let client = self.user_clients.get(token).await?;
        let result = self.validate_actions(client, resource_actions).await;
        if let Err(err) = &result {
            // Invalidate before the failure surfaces so a renewed token
            // presentation rebuilds a fresh client.
            self.user_clients.invalidate(token).await;
            info!(%err, "resource action validation failed; cached user client invalidated");
        }
        result
    }

    async fn validate_http_header(
        &self,
        header: Option<&str>,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<bool, AuthError> {
        match header.and_then(token::from_http_header) {
            Some(token) => self.validate_token(&token, resource_actions).await,
            None => Ok(false),
        }
    }

    async fn validate_websocket_subprotocol(
        &self,
        subprotocol: Option<&str>,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<bool, AuthError> {
        match subprotocol.and_then(token::from_websocket_subprotocol) {
            Some(token) => self.validate_token(&token, resource_actions).await,
            None => Ok(false),
        }
    }

    #[instrument(skip_all)]
    async fn get_login_redirect_url(
        &self,
        header: Option<&str>,
        resource_actions: &BTreeSet<ResourceAction>,
    ) -> Result<Option<String>, AuthError> {
        match self.validate_http_header(header, resource_actions).await {
            Ok(true) => Ok(None),
            Ok(false) => Ok(Some(self.authorization_url().await?)),
            Err(err) if err.is_credential_failure() => {
                warn!(%err, "header validation failed; redirecting caller to login");
                Ok(Some(self.authorization_url().await?))
            }
            Err(err) => Err(err),
        }
    }

    async fn logout(&self, header: Option<&str>) -> Result<Option<String>, AuthError> {
        let token = header
            .and_then(token::from_http_header)
            .ok_or(AuthError::TokenNotFound)?;
        let name = oauth_access_token_name(&token);
        let deleted = self.service_account.delete_oauth_access_token(&name).await?;
        if !deleted {
            return Err(AuthError::TokenNotFound);
        }
        Ok(Some(self.oauth.logout_url().await?))
    }
}

fn non_empty(component: &str) -> Option<String> {
    if component.is_empty() {
        None
    } else {
        Some(component.to_string())
    }
}
