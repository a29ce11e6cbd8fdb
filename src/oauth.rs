//! OAuth server discovery, login/logout URL construction, and token
//! revocation naming
//!
//! OpenShift serves its OAuth endpoints in a discovery document at
//! `/.well-known/oauth-authorization-server` on the API server. The
//! document, the assembled authorization URL, and the logout URL are each
//! computed at most once per process: concurrent first callers share the
//! in-flight computation and every later caller observes the stored result,
//! failures included. A transient discovery failure therefore stays until
//! restart; it is logged when first stored so operators can tell.

use std::future::Future;
use std::sync::Arc;

use aws_lc_rs::digest::{digest, SHA256};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::client::ServiceAccountClient;
use crate::error::AuthError;

/// Discovery document path on the API server
pub const WELL_KNOWN_PATH: &str = "/.well-known/oauth-authorization-server";

const SHA256_PREFIX: &str = "sha256~";

/// The fields of the OAuth discovery document the service uses
///
/// Unknown properties in the document are ignored.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct OAuthMetadata {
    /// Base URL of the OAuth server
    pub issuer: String,
    /// Endpoint interactive clients are redirected to for login
    pub authorization_endpoint: String,
}

/// Caller-specific parameters of the authorization URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationUrlParams {
    /// OAuth client identifier (the service account user name)
    pub client_id: String,
    /// Token scope requested for the logged-in user
    pub scope: String,
}

/// Lazily discovered, memoized OAuth endpoints
pub struct OAuthEndpoints {
    service_account: Arc<dyn ServiceAccountClient>,
    metadata: OnceCell<Result<OAuthMetadata, AuthError>>,
    authorization_url: OnceCell<Result<String, AuthError>>,
    logout_url: OnceCell<Result<String, AuthError>>,
}

impl OAuthEndpoints {
    /// Discover endpoints through the given service-account client
    pub fn new(service_account: Arc<dyn ServiceAccountClient>) -> Self {
        Self {
            service_account,
            metadata: OnceCell::new(),
            authorization_url: OnceCell::new(),
            logout_url: OnceCell::new(),
        }
    }

    /// The discovery document, fetched on first use
    pub async fn oauth_metadata(&self) -> Result<OAuthMetadata, AuthError> {
        self.metadata
            .get_or_init(|| async {
                let result = self.fetch_metadata().await;
                match &result {
                    Ok(metadata) => debug!(issuer = %metadata.issuer, "discovered OAuth server"),
                    Err(err) => {
                        warn!(%err, "OAuth discovery failed; the failure is retained until restart");
                    }
                }
                result
            })
            .await
            .clone()
    }

    /// The authorization URL interactive clients are redirected to
    ///
    /// `params` is evaluated inside the memoized computation, so its
    /// failures (such as a missing environment variable) are retained
    /// exactly like discovery failures.
    pub async fn authorization_url<F, Fut>(&self, params: F) -> Result<String, AuthError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AuthorizationUrlParams, AuthError>>,
    {
        self.authorization_url
            .get_or_init(|| async {
                let params = params().await?;
                let metadata = self.oauth_metadata().await?;
                build_authorization_url(&metadata.authorization_endpoint, &params)
            })
            .await
            .clone()
    }

    /// The URL ending the user's OAuth session
    pub async fn logout_url(&self) -> Result<String, AuthError> {
        self.logout_url
            .get_or_init(|| async {
                let metadata = self.oauth_metadata().await?;
                Ok(format!("{}/logout", metadata.issuer))
            })
            .await
            .clone()
    }

    async fn fetch_metadata(&self) -> Result<OAuthMetadata, AuthError> {
        let body = self.service_account.get_raw(WELL_KNOWN_PATH).await?;
        serde_json::from_str(&body).map_err(|err| {
            AuthError::cluster_client(format!("malformed OAuth discovery document: {err}"))
        })
    }
}

fn build_authorization_url(
    endpoint: &str,
    params: &AuthorizationUrlParams,
) -> Result<String, AuthError> {
    let mut url = Url::parse(endpoint).map_err(|err| {
        AuthError::cluster_client(format!("invalid authorization endpoint {endpoint}: {err}"))
    })?;
    url.query_pairs_mut()
        .append_pair("client_id", &params.client_id)
        .append_pair("response_type", "token")
        .append_pair("response_mode", "fragment")
        .append_pair("scope", &params.scope);
    Ok(url.into())
}

/// Derive the cluster-side `OAuthAccessToken` object name for a bearer token
///
/// OpenShift names token objects by the base64url-encoded SHA-256 digest of
/// the raw token, unpadded, behind a `sha256~` prefix. A `sha256~` prefix on
/// the presented token is stripped before hashing, so the derivation is
/// insensitive to whether the caller included it.
pub fn oauth_access_token_name(token: &str) -> String {
    let raw = token.strip_prefix(SHA256_PREFIX).unwrap_or(token);
    let checksum = digest(&SHA256, raw.as_bytes());
    format!("{SHA256_PREFIX}{}", URL_SAFE_NO_PAD.encode(checksum.as_ref()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use k8s_openapi::api::authentication::v1::TokenReviewStatus;

    use super::*;

    const DISCOVERY_DOC: &str = r#"{
        "issuer": "https://oauth.example.com",
        "authorization_endpoint": "https://oauth.example.com/oauth/authorize",
        "token_endpoint": "https://oauth.example.com/oauth/token",
        "scopes_supported": ["user:check-access", "user:full"],
        "response_types_supported": ["token"]
    }"#;

    struct StubServiceAccount {
        fetches: AtomicUsize,
        responses: Vec<Result<String, AuthError>>,
    }

    impl StubServiceAccount {
        fn with_responses(responses: Vec<Result<String, AuthError>>) -> Arc<Self> {
            Arc::new(Self {
                fetches: AtomicUsize::new(0),
                responses,
            })
        }
    }

    #[async_trait]
    impl ServiceAccountClient for StubServiceAccount {
        async fn create_token_review(&self, _token: &str) -> Result<TokenReviewStatus, AuthError> {
            unimplemented!("not used by these tests")
        }

        async fn delete_oauth_access_token(&self, _name: &str) -> Result<bool, AuthError> {
            unimplemented!("not used by these tests")
        }

        async fn get_raw(&self, _path: &str) -> Result<String, AuthError> {
            let index = self.fetches.fetch_add(1, Ordering::SeqCst);
            self.responses[index.min(self.responses.len() - 1)].clone()
        }
    }

    fn params() -> AuthorizationUrlParams {
        AuthorizationUrlParams {
            client_id: "system:serviceaccount:ns:cryostat".into(),
            scope: "user:check-access role:cryostat-operator-oauth-client:ns".into(),
        }
    }

    #[test]
    fn metadata_parsing_ignores_unknown_properties() {
        let metadata: OAuthMetadata = serde_json::from_str(DISCOVERY_DOC).unwrap();
        assert_eq!(metadata.issuer, "https://oauth.example.com");
        assert_eq!(
            metadata.authorization_endpoint,
            "https://oauth.example.com/oauth/authorize"
        );
    }

    #[tokio::test]
    async fn discovery_runs_once_for_all_endpoints() {
        let stub = StubServiceAccount::with_responses(vec![Ok(DISCOVERY_DOC.to_string())]);
        let endpoints = OAuthEndpoints::new(Arc::clone(&stub) as _);

        let auth_url = endpoints
            .authorization_url(|| async { Ok(params()) })
            .await
            .unwrap();
        let logout_url = endpoints.logout_url().await.unwrap();

        assert!(auth_url.starts_with("https://oauth.example.com/oauth/authorize?"));
        assert_eq!(logout_url, "https://oauth.example.com/logout");
        assert_eq!(stub.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authorization_url_carries_the_oauth_query_parameters() {
        let stub = StubServiceAccount::with_responses(vec![Ok(DISCOVERY_DOC.to_string())]);
        let endpoints = OAuthEndpoints::new(Arc::clone(&stub) as _);

        let url = endpoints
            .authorization_url(|| async { Ok(params()) })
            .await
            .unwrap();
        let parsed = Url::parse(&url).unwrap();
        let query: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        assert!(query.contains(&(
            "client_id".to_string(),
            "system:serviceaccount:ns:cryostat".to_string()
        )));
        assert!(query.contains(&("response_type".to_string(), "token".to_string())));
        assert!(query.contains(&("response_mode".to_string(), "fragment".to_string())));
        assert!(query.contains(&(
            "scope".to_string(),
            "user:check-access role:cryostat-operator-oauth-client:ns".to_string()
        )));
    }

    #[tokio::test]
    async fn first_discovery_failure_is_retained() {
        let stub = StubServiceAccount::with_responses(vec![
            Err(AuthError::cluster_client("connection refused")),
            Ok(DISCOVERY_DOC.to_string()),
        ]);
        let endpoints = OAuthEndpoints::new(Arc::clone(&stub) as _);

        let first = endpoints.oauth_metadata().await;
        let second = endpoints.oauth_metadata().await;

        // The would-be-successful second fetch never happens; the stored
        // failure is handed to every caller.
        assert_eq!(first, second);
        assert!(first.is_err());
        assert_eq!(stub.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_params_poison_the_authorization_url() {
        let stub = StubServiceAccount::with_responses(vec![Ok(DISCOVERY_DOC.to_string())]);
        let endpoints = OAuthEndpoints::new(Arc::clone(&stub) as _);

        let first = endpoints
            .authorization_url(|| async {
                Err(AuthError::MissingEnvironmentVariable(
                    "CRYOSTAT_OAUTH_CLIENT_ID".into(),
                ))
            })
            .await;
        let second = endpoints
            .authorization_url(|| async { Ok(params()) })
            .await;

        assert_eq!(first, second);
        assert_eq!(
            first,
            Err(AuthError::MissingEnvironmentVariable(
                "CRYOSTAT_OAUTH_CLIENT_ID".into()
            ))
        );
    }

    #[tokio::test]
    async fn malformed_discovery_documents_fail_as_cluster_errors() {
        let stub = StubServiceAccount::with_responses(vec![Ok("not json".to_string())]);
        let endpoints = OAuthEndpoints::new(Arc::clone(&stub) as _);

        let result = endpoints.oauth_metadata().await;
        assert!(matches!(result, Err(AuthError::ClusterClient(_))));
    }

    #[test]
    fn token_names_use_the_unpadded_digest_form() {
        // sha256("abc"), base64url, trailing padding stripped
        assert_eq!(
            oauth_access_token_name("abc"),
            "sha256~ungWv48Bz-pBQUDeXa4iI7ADYaOWF3qctBD_YfIAFa0"
        );
    }

    #[test]
    fn token_names_are_insensitive_to_an_existing_prefix() {
        assert_eq!(
            oauth_access_token_name("sha256~abc"),
            oauth_access_token_name("abc")
        );
    }

    #[test]
    fn token_names_are_deterministic() {
        assert_eq!(
            oauth_access_token_name("some-opaque-token"),
            oauth_access_token_name("some-opaque-token")
        );
    }
}
