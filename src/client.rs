//! Cluster client seams and their kube-backed implementations
//!
//! Two identities talk to the cluster:
//! - the **service account** client, used for token review, OAuth metadata
//!   discovery, and token revocation;
//! - **user** clients, one per presented bearer token, used only for
//!   `SelfSubjectAccessReview` probes so that the review runs as the caller.
//!
//! Both are traits so tests can inject mock implementations without real
//! infrastructure.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use k8s_openapi::api::authorization::v1::SelfSubjectAccessReview;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, PostParams};
use kube::config::AuthInfo;
use kube::{Client, Config};
use secrecy::SecretString;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::error::AuthError;

/// Cluster operations performed under the service's own identity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceAccountClient: Send + Sync {
    /// Submit a `TokenReview` for the given bearer token and return its
    /// status
    async fn create_token_review(&self, token: &str) -> Result<TokenReviewStatus, AuthError>;

    /// Delete the `OAuthAccessToken` object with the given name
    ///
    /// Returns `false` when the cluster does not know the token (already
    /// revoked or never issued).
    async fn delete_oauth_access_token(&self, name: &str) -> Result<bool, AuthError>;

    /// Perform a raw GET against the cluster API server, returning the
    /// response body
    ///
    /// `path` is absolute on the API server (e.g. the OAuth discovery
    /// document); the request carries `Accept: application/json`.
    async fn get_raw(&self, path: &str) -> Result<String, AuthError>;
}

/// Cluster operations performed as a specific end user
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserClient: Send + Sync {
    /// Submit a `SelfSubjectAccessReview` running as this client's bearer
    async fn create_access_review(
        &self,
        review: SelfSubjectAccessReview,
    ) -> Result<SelfSubjectAccessReview, AuthError>;

    /// Release any resources held by the client
    ///
    /// Invoked exactly once when the client is evicted from the per-token
    /// cache.
    fn close(&self);
}

/// Builds a [`UserClient`] bound to a bearer token
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserClientFactory: Send + Sync {
    /// Construct a cluster client whose requests authenticate as `token`
    async fn client_for_token(&self, token: &str) -> Result<Arc<dyn UserClient>, AuthError>;
}

/// [`ServiceAccountClient`] backed by the in-cluster [`kube::Client`]
pub struct KubeServiceAccountClient {
    client: Client,
    oauth_access_tokens: ApiResource,
}

impl KubeServiceAccountClient {
    /// Wrap an existing service-account authenticated client
    pub fn new(client: Client) -> Self {
        // OAuthAccessToken is an OpenShift API group, so it is addressed
        // dynamically rather than through k8s-openapi.
        let gvk = GroupVersionKind::gvk("oauth.openshift.io", "v1", "OAuthAccessToken");
        let oauth_access_tokens = ApiResource::from_gvk_with_plural(&gvk, "oauthaccesstokens");
        Self {
            client,
            oauth_access_tokens,
        }
    }
}

#[async_trait]
impl ServiceAccountClient for KubeServiceAccountClient {
    async fn create_token_review(&self, token: &str) -> Result<TokenReviewStatus, AuthError> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<TokenReview> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), &review).await?;
        created
            .status
            .ok_or_else(|| AuthError::internal("token review returned no status"))
    }

    async fn delete_oauth_access_token(&self, name: &str) -> Result<bool, AuthError> {
        let api: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &self.oauth_access_tokens);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_raw(&self, path: &str) -> Result<String, AuthError> {
        let request = http::Request::get(path)
            .header(http::header::ACCEPT, "application/json")
            .body(Vec::new())
            .map_err(|err| AuthError::internal(format!("malformed request for {path}: {err}")))?;
        Ok(self.client.request_text(request).await?)
    }
}

/// [`UserClient`] backed by a [`kube::Client`] authenticated as the bearer
pub struct KubeUserClient {
    client: Client,
}

impl KubeUserClient {
    /// Wrap a client already configured with the user's bearer token
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UserClient for KubeUserClient {
    async fn create_access_review(
        &self,
        review: SelfSubjectAccessReview,
    ) -> Result<SelfSubjectAccessReview, AuthError> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), &review).await?)
    }

    fn close(&self) {
        // kube clients release their pooled connections on drop; the hook
        // exists so evictions are observable.
        debug!("releasing cached user cluster client");
    }
}

/// [`UserClientFactory`] that rebinds the in-cluster configuration to each
/// presented bearer token
pub struct BearerTokenClientFactory {
    base: Config,
}

impl BearerTokenClientFactory {
    /// Derive user clients from the given base configuration
    ///
    /// Everything except the credentials (cluster URL, CA bundle, timeouts)
    /// is inherited from `base`.
    pub fn new(base: Config) -> Self {
        Self { base }
    }
}

#[async_trait]
impl UserClientFactory for BearerTokenClientFactory {
    async fn client_for_token(&self, token: &str) -> Result<Arc<dyn UserClient>, AuthError> {
        let mut config = self.base.clone();
        config.auth_info = AuthInfo {
            token: Some(SecretString::from(token.to_string())),
            ..AuthInfo::default()
        };
        let client = Client::try_from(config)?;
        Ok(Arc::new(KubeUserClient::new(client)))
    }
}
