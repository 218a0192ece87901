use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningParams, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{AuthMode, KafkaConfig};
use crate::retry::RetryPolicy;

const MSK_SIGNING_NAME: &str = "kafka-cluster";
const MSK_ACTION: &str = "kafka-cluster:Connect";
const MSK_TOKEN_LIFETIME: Duration = Duration::from_secs(900);
const CREDENTIALS_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const USER_AGENT: &str = concat!("microbatch-pipeline/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("failed to resolve AWS credentials: {0}")]
    Credentials(String),
    #[error("failed to sign authentication token: {0}")]
    Signing(String),
    #[error("token generation backing off for {retry_in:?} after: {last_error}")]
    Backoff {
        retry_in: Duration,
        last_error: String,
    },
    #[error("token provider returned an already expired token")]
    Expired,
}

/// A short-lived bearer token and the instant it stops being accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialToken {
    pub token: String,
    pub principal: String,
    pub expires_at: OffsetDateTime,
}

impl CredentialToken {
    pub fn remaining(&self, now: OffsetDateTime) -> time::Duration {
        self.expires_at - now
    }

    pub fn is_valid_for(&self, now: OffsetDateTime, min_remaining: Duration) -> bool {
        self.remaining(now) >= min_remaining
    }

    /// Expiry as milliseconds since the unix epoch, the form librdkafka expects.
    pub fn expires_at_unix_ms(&self) -> i64 {
        (self.expires_at.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Produces authentication tokens. Called synchronously by the Kafka client
/// before an authentication handshake, so implementations must not block on I/O.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<CredentialToken, CredentialError>;
}

/// Fixed token, for local brokers and tests.
pub struct StaticTokenProvider {
    token: String,
    principal: String,
    lifetime: Duration,
}

impl StaticTokenProvider {
    pub fn new(token: &str, principal: &str, lifetime: Duration) -> Self {
        Self {
            token: token.to_owned(),
            principal: principal.to_owned(),
            lifetime,
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Result<CredentialToken, CredentialError> {
        Ok(CredentialToken {
            token: self.token.clone(),
            principal: self.principal.clone(),
            expires_at: OffsetDateTime::now_utc() + self.lifetime,
        })
    }
}

/// Amazon MSK IAM tokens: a SigV4 presigned `kafka-cluster:Connect` URL,
/// base64url encoded. AWS credentials are resolved asynchronously and kept
/// in memory, so `token()` only performs the signing.
pub struct MskIamTokenProvider {
    region: String,
    provider: SharedCredentialsProvider,
    credentials: RwLock<Option<Credentials>>,
}

impl MskIamTokenProvider {
    /// Resolve credentials through the default AWS chain (env, profile, web identity, IMDS).
    pub async fn from_env(region: &str) -> Result<Self, CredentialError> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .load()
            .await;

        let provider = sdk_config.credentials_provider().ok_or_else(|| {
            CredentialError::Credentials("no AWS credentials provider configured".to_owned())
        })?;

        let token_provider = Self {
            region: region.to_owned(),
            provider,
            credentials: RwLock::new(None),
        };
        token_provider.refresh_credentials().await?;

        info!("resolved AWS credentials for MSK IAM in {}", region);
        Ok(token_provider)
    }

    pub async fn refresh_credentials(&self) -> Result<(), CredentialError> {
        let credentials = self
            .provider
            .provide_credentials()
            .await
            .map_err(|e| CredentialError::Credentials(e.to_string()))?;

        match self.credentials.write() {
            Ok(mut cached) => *cached = Some(credentials),
            Err(poisoned) => *poisoned.into_inner() = Some(credentials),
        }
        Ok(())
    }

    /// Re-resolve the AWS credentials every `interval`, backing off on failure.
    /// Runs for the process lifetime.
    pub fn spawn_credentials_refresh(
        self: &Arc<Self>,
        interval: Duration,
        retry_policy: RetryPolicy,
    ) -> JoinHandle<()> {
        let provider = self.clone();
        tokio::spawn(async move {
            let mut failures = 0;
            loop {
                let wait = match failures {
                    0 => interval,
                    n => retry_policy.time_until_next_retry(n - 1),
                };
                tokio::time::sleep(wait).await;

                match provider.refresh_credentials().await {
                    Ok(()) => {
                        debug!("refreshed AWS credentials");
                        failures = 0;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!("failed to refresh AWS credentials (attempt {}): {}", failures, e);
                    }
                }
            }
        })
    }

    fn cached_credentials(&self) -> Result<Credentials, CredentialError> {
        let cached = match self.credentials.read() {
            Ok(cached) => cached.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        cached.ok_or_else(|| CredentialError::Credentials("credentials not resolved yet".to_owned()))
    }
}

impl TokenProvider for MskIamTokenProvider {
    fn token(&self) -> Result<CredentialToken, CredentialError> {
        let credentials = self.cached_credentials()?;
        sign_msk_token(&credentials, &self.region, SystemTime::now())
    }
}

/// Build the MSK IAM auth token for `region`, signed at `now`.
pub fn sign_msk_token(
    credentials: &Credentials,
    region: &str,
    now: SystemTime,
) -> Result<CredentialToken, CredentialError> {
    let mut url = Url::parse(&format!("https://kafka.{}.amazonaws.com/", region))
        .map_err(|e| CredentialError::Signing(e.to_string()))?;
    url.query_pairs_mut().append_pair("Action", MSK_ACTION);

    let identity = Identity::new(credentials.clone(), credentials.expiry());
    let mut settings = SigningSettings::default();
    settings.signature_location = SignatureLocation::QueryParams;
    settings.expires_in = Some(MSK_TOKEN_LIFETIME);

    let signing_params: SigningParams<'_> = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(MSK_SIGNING_NAME)
        .time(now)
        .settings(settings)
        .build()
        .map_err(|e| CredentialError::Signing(e.to_string()))?
        .into();

    let request = SignableRequest::new(
        "GET",
        url.as_str(),
        std::iter::empty(),
        SignableBody::Bytes(&[]),
    )
    .map_err(|e| CredentialError::Signing(e.to_string()))?;

    let (instructions, _signature) = sign(request, &signing_params)
        .map_err(|e| CredentialError::Signing(e.to_string()))?
        .into_parts();

    {
        let mut query = url.query_pairs_mut();
        for (name, value) in instructions.params() {
            query.append_pair(name, value);
        }
        query.append_pair("User-Agent", USER_AGENT);
    }

    // The token cannot outlive the credentials that signed it
    let mut expires_at = now + MSK_TOKEN_LIFETIME;
    if let Some(expiry) = credentials.expiry() {
        expires_at = expires_at.min(expiry);
    }

    Ok(CredentialToken {
        token: URL_SAFE_NO_PAD.encode(url.as_str()),
        principal: credentials.access_key_id().to_owned(),
        expires_at: OffsetDateTime::from(expires_at),
    })
}

#[derive(Default)]
struct CacheState {
    token: Option<CredentialToken>,
    failures: u32,
    retry_at: Option<OffsetDateTime>,
    last_error: Option<CredentialError>,
}

/// Token cache held by the Kafka client. Serves the cached token while it has at
/// least `min_remaining` lifetime left, otherwise asks the provider for a new one.
/// Provider failures put the cache in backoff: until the retry instant, callers get
/// `CredentialError::Backoff` without the provider being called.
pub struct TokenCache {
    provider: Arc<dyn TokenProvider>,
    min_remaining: Duration,
    retry_policy: RetryPolicy,
    state: Mutex<CacheState>,
}

impl TokenCache {
    pub fn new(
        provider: Arc<dyn TokenProvider>,
        min_remaining: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            min_remaining,
            retry_policy,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn token(&self) -> Result<CredentialToken, CredentialError> {
        self.token_at(OffsetDateTime::now_utc())
    }

    pub fn token_at(&self, now: OffsetDateTime) -> Result<CredentialToken, CredentialError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(token) = &state.token {
            if token.is_valid_for(now, self.min_remaining) {
                return Ok(token.clone());
            }
        }

        if let Some(retry_at) = state.retry_at {
            if now < retry_at {
                let last_error = state
                    .last_error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                return Err(CredentialError::Backoff {
                    retry_in: (retry_at - now).try_into().unwrap_or_default(),
                    last_error,
                });
            }
        }

        match self.provider.token() {
            Ok(token) if token.expires_at <= now => {
                self.record_failure(&mut state, now, CredentialError::Expired)
            }
            Ok(token) => {
                if !token.is_valid_for(now, self.min_remaining) {
                    warn!(
                        "new token expires in {}, below the {:?} refresh threshold",
                        token.remaining(now),
                        self.min_remaining
                    );
                }
                state.failures = 0;
                state.retry_at = None;
                state.last_error = None;
                state.token = Some(token.clone());
                metrics::counter!("kafka_auth_token_generated_total").increment(1);
                Ok(token)
            }
            Err(e) => self.record_failure(&mut state, now, e),
        }
    }

    /// Drop the cached token, e.g. after the broker rejected it.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.token = None;
    }

    fn record_failure(
        &self,
        state: &mut CacheState,
        now: OffsetDateTime,
        error: CredentialError,
    ) -> Result<CredentialToken, CredentialError> {
        let delay = self.retry_policy.time_until_next_retry(state.failures);
        state.failures += 1;
        state.retry_at = Some(now + delay);
        state.last_error = Some(error.clone());

        metrics::counter!("kafka_auth_token_errors_total").increment(1);
        warn!(
            "failed to generate auth token (attempt {}), retrying in {:?}: {}",
            state.failures, delay, error
        );
        Err(error)
    }
}

/// Token cache for the configured auth mode. MSK IAM signs with AWS credentials
/// kept fresh by a background task; other modes need no tokens.
pub async fn token_cache_for(
    config: &KafkaConfig,
) -> Result<Option<Arc<TokenCache>>, CredentialError> {
    if config.auth_mode != AuthMode::MskIam {
        return Ok(None);
    }

    let provider = Arc::new(MskIamTokenProvider::from_env(&config.aws_region).await?);
    provider.spawn_credentials_refresh(CREDENTIALS_REFRESH_INTERVAL, RetryPolicy::default());

    Ok(Some(Arc::new(TokenCache::new(
        provider,
        config.token_min_lifetime.0,
        RetryPolicy::default(),
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        calls: AtomicUsize,
        fail_first: usize,
        lifetime: Duration,
    }

    impl ScriptedProvider {
        fn new(fail_first: usize, lifetime: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                lifetime,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenProvider for ScriptedProvider {
        fn token(&self) -> Result<CredentialToken, CredentialError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(CredentialError::Signing("signer unavailable".to_owned()));
            }
            Ok(CredentialToken {
                token: format!("token-{}", call),
                principal: "test".to_owned(),
                expires_at: OffsetDateTime::now_utc() + self.lifetime,
            })
        }
    }

    fn cache(provider: Arc<ScriptedProvider>) -> TokenCache {
        TokenCache::new(
            provider,
            Duration::from_secs(300),
            RetryPolicy::new(2, Duration::from_secs(1), Duration::from_secs(60)),
        )
    }

    #[test]
    fn serves_cached_token_while_fresh() {
        let provider = Arc::new(ScriptedProvider::new(0, Duration::from_secs(900)));
        let cache = cache(provider.clone());

        let now = OffsetDateTime::now_utc();
        let first = cache.token_at(now).unwrap();
        let second = cache.token_at(now + Duration::from_secs(60)).unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls(), 1);
    }

    #[test]
    fn regenerates_when_expiry_is_imminent() {
        let provider = Arc::new(ScriptedProvider::new(0, Duration::from_secs(900)));
        let cache = cache(provider.clone());

        let now = OffsetDateTime::now_utc();
        let first = cache.token_at(now).unwrap();
        // 700s later only ~200s remain, below the 300s threshold
        let second = cache.token_at(now + Duration::from_secs(700)).unwrap();

        assert_ne!(first.token, second.token);
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn invalidate_forces_a_new_token() {
        let provider = Arc::new(ScriptedProvider::new(0, Duration::from_secs(900)));
        let cache = cache(provider.clone());

        cache.token().unwrap();
        cache.invalidate();
        cache.token().unwrap();

        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn failures_back_off_exponentially() {
        let provider = Arc::new(ScriptedProvider::new(2, Duration::from_secs(900)));
        let cache = cache(provider.clone());
        let now = OffsetDateTime::now_utc();

        assert!(matches!(
            cache.token_at(now),
            Err(CredentialError::Signing(_))
        ));
        // Inside the 1s backoff window the provider is not called
        assert!(matches!(
            cache.token_at(now + Duration::from_millis(500)),
            Err(CredentialError::Backoff { .. })
        ));
        assert_eq!(provider.calls(), 1);

        // Second failure doubles the window
        assert!(cache.token_at(now + Duration::from_secs(1)).is_err());
        assert!(matches!(
            cache.token_at(now + Duration::from_millis(2500)),
            Err(CredentialError::Backoff { .. })
        ));
        assert_eq!(provider.calls(), 2);

        let token = cache.token_at(now + Duration::from_secs(4)).unwrap();
        assert_eq!(token.token, "token-2");
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let provider = Arc::new(ScriptedProvider::new(0, Duration::ZERO));
        let cache = cache(provider);

        assert_eq!(
            cache.token_at(OffsetDateTime::now_utc() + Duration::from_secs(1)),
            Err(CredentialError::Expired)
        );
    }

    #[test]
    fn msk_token_is_a_presigned_connect_url() {
        let credentials = Credentials::new("AKIDEXAMPLE", "secret", None, None, "test");
        let now = SystemTime::now();

        let token = sign_msk_token(&credentials, "eu-west-1", now).unwrap();

        let decoded = URL_SAFE_NO_PAD.decode(&token.token).unwrap();
        let url = Url::parse(std::str::from_utf8(&decoded).unwrap()).unwrap();
        assert_eq!(url.host_str(), Some("kafka.eu-west-1.amazonaws.com"));

        let params: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        assert_eq!(params.get("Action").map(String::as_str), Some(MSK_ACTION));
        assert_eq!(params.get("X-Amz-Expires").map(String::as_str), Some("900"));
        assert!(params.contains_key("X-Amz-Signature"));
        assert!(params
            .get("X-Amz-Credential")
            .unwrap()
            .contains("eu-west-1/kafka-cluster/aws4_request"));
        assert!(params.contains_key("User-Agent"));

        assert_eq!(token.expires_at, OffsetDateTime::from(now + MSK_TOKEN_LIFETIME));
    }

    #[test]
    fn msk_token_expiry_is_capped_by_credentials() {
        let now = SystemTime::now();
        let credentials = Credentials::new(
            "AKIDEXAMPLE",
            "secret",
            Some("session".to_owned()),
            Some(now + Duration::from_secs(60)),
            "test",
        );

        let token = sign_msk_token(&credentials, "us-east-1", now).unwrap();

        assert_eq!(
            token.expires_at,
            OffsetDateTime::from(now + Duration::from_secs(60))
        );
        let decoded = String::from_utf8(URL_SAFE_NO_PAD.decode(&token.token).unwrap()).unwrap();
        assert!(decoded.contains("X-Amz-Security-Token=session"));
    }

    #[tokio::test]
    async fn no_tokens_without_msk_iam() {
        let config = KafkaConfig {
            bootstrap_servers: "localhost:9092".to_owned(),
            auth_mode: crate::config::AuthMode::Plaintext,
            aws_region: "us-east-1".to_owned(),
            token_min_lifetime: crate::config::EnvSecsDuration(Duration::from_secs(300)),
        };
        assert!(token_cache_for(&config).await.unwrap().is_none());
    }
}
