//! Request authentication and authorization gate
//!
//! Every protected request passes through here before reaching its resource
//! handler: is there a valid bearer token, does the claimed subject still
//! exist in the user store, and does its role satisfy the route's required
//! role set.
//!
//! The gate is constructed once at startup from the shared token service and
//! subject store and injected wherever it is needed; there is no global
//! instance. Every failure mode is fail-closed: a request that cannot be
//! positively authenticated is anonymous.

pub mod middleware;

pub use middleware::{GateRejection, RequireAuth};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use db_pool::{PgConnectionPool, PoolError};
use jwt_security::TokenService;
use tracing::{debug, error, warn};

const BEARER_PREFIX: &str = "Bearer ";

/// Outcome of authenticating one request. Built fresh per request, never
/// shared across requests.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject_id: i64,
    pub role: String,
    pub authenticated: bool,
}

impl AuthContext {
    fn authenticated(subject_id: i64, role: String) -> Self {
        Self {
            subject_id,
            role,
            authenticated: true,
        }
    }

    /// Context for a request that carried no usable credential.
    pub fn anonymous() -> Self {
        Self {
            subject_id: 0,
            role: String::new(),
            authenticated: false,
        }
    }
}

/// The gate's view of the user store: does a record for the subject still
/// exist. Factored behind a trait so tests run against a fake.
#[async_trait]
pub trait SubjectStore: Send + Sync {
    async fn subject_exists(&self, subject_id: i64) -> Result<bool, PoolError>;
}

/// Subject store backed by the shared connection pool.
pub struct PgSubjectStore {
    pool: Arc<PgConnectionPool>,
}

impl PgSubjectStore {
    pub fn new(pool: Arc<PgConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubjectStore for PgSubjectStore {
    async fn subject_exists(&self, subject_id: i64) -> Result<bool, PoolError> {
        // Borrow a session around the single statement; the handle releases
        // it on success and error paths alike.
        let mut session = self.pool.acquire().await?;
        let row = sqlx::query_scalar::<_, i32>("SELECT 1 FROM users WHERE user_id = $1")
            .bind(subject_id)
            .fetch_optional(&mut *session)
            .await?;
        Ok(row.is_some())
    }
}

/// Per-request authentication/authorization decisions.
pub struct AuthGate {
    tokens: Arc<TokenService>,
    subjects: Arc<dyn SubjectStore>,
}

impl AuthGate {
    pub fn new(tokens: Arc<TokenService>, subjects: Arc<dyn SubjectStore>) -> Self {
        Self { tokens, subjects }
    }

    /// Authenticate a request from the value of its authorization header.
    ///
    /// A token remains structurally valid after the underlying account is
    /// deleted, so a verified token is additionally checked against the user
    /// store. Store errors do not admit the request.
    pub async fn authenticate(&self, authorization: Option<&str>) -> AuthContext {
        let Some(header) = authorization else {
            debug!("request carried no authorization header");
            return AuthContext::anonymous();
        };

        let Some(token) = header.strip_prefix(BEARER_PREFIX) else {
            debug!("authorization header is not a bearer credential");
            return AuthContext::anonymous();
        };

        let claims = match self.tokens.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                warn!(error = %e, "token verification failed");
                return AuthContext::anonymous();
            }
        };

        match self.subjects.subject_exists(claims.id).await {
            Ok(true) => AuthContext::authenticated(claims.id, claims.role),
            Ok(false) => {
                warn!(subject_id = claims.id, "token subject no longer exists");
                AuthContext::anonymous()
            }
            Err(e) => {
                // Fail closed: a broken store must not admit anyone.
                error!(error = %e, "subject existence check failed");
                AuthContext::anonymous()
            }
        }
    }

    /// Whether the context satisfies the route's required role set.
    ///
    /// An empty set admits any authenticated subject. Role comparison is
    /// exact-string and case-sensitive; there is no role hierarchy.
    pub fn authorize(&self, context: &AuthContext, required_roles: &HashSet<String>) -> bool {
        if !context.authenticated {
            return false;
        }
        required_roles.is_empty() || required_roles.contains(&context.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jwt_security::JwtConfig;

    struct FakeSubjects {
        exists: bool,
        fail: bool,
    }

    impl FakeSubjects {
        fn with(exists: bool) -> Arc<Self> {
            Arc::new(Self {
                exists,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                exists: true,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl SubjectStore for FakeSubjects {
        async fn subject_exists(&self, _subject_id: i64) -> Result<bool, PoolError> {
            if self.fail {
                Err(PoolError::NotInitialized)
            } else {
                Ok(self.exists)
            }
        }
    }

    fn token_service() -> Arc<TokenService> {
        Arc::new(TokenService::new(&JwtConfig {
            secret: String::from("a-test-secret-nobody-should-reuse"),
            issuer: String::from("flightdeck-api"),
            expiry_seconds: 3600,
        }))
    }

    fn gate(subjects: Arc<dyn SubjectStore>) -> AuthGate {
        AuthGate::new(token_service(), subjects)
    }

    fn roles(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn valid_bearer_token_authenticates() {
        let gate = gate(FakeSubjects::with(true));
        let token = token_service().issue(7, "worker").unwrap();

        let context = gate
            .authenticate(Some(&format!("Bearer {token}")))
            .await;
        assert!(context.authenticated);
        assert_eq!(context.subject_id, 7);
        assert_eq!(context.role, "worker");
    }

    #[tokio::test]
    async fn missing_header_is_anonymous() {
        let gate = gate(FakeSubjects::with(true));
        assert!(!gate.authenticate(None).await.authenticated);
    }

    #[tokio::test]
    async fn non_bearer_scheme_is_anonymous() {
        let gate = gate(FakeSubjects::with(true));
        let context = gate.authenticate(Some("Basic dXNlcjpwYXNz")).await;
        assert!(!context.authenticated);
    }

    #[tokio::test]
    async fn garbage_token_is_anonymous() {
        let gate = gate(FakeSubjects::with(true));
        let context = gate.authenticate(Some("Bearer not-a-token")).await;
        assert!(!context.authenticated);
    }

    #[tokio::test]
    async fn deleted_subject_is_anonymous() {
        let gate = gate(FakeSubjects::with(false));
        let token = token_service().issue(7, "worker").unwrap();

        let context = gate
            .authenticate(Some(&format!("Bearer {token}")))
            .await;
        assert!(!context.authenticated);
    }

    #[tokio::test]
    async fn store_error_fails_closed() {
        let gate = gate(FakeSubjects::failing());
        let token = token_service().issue(7, "worker").unwrap();

        let context = gate
            .authenticate(Some(&format!("Bearer {token}")))
            .await;
        assert!(!context.authenticated);
    }

    #[tokio::test]
    async fn token_from_foreign_secret_is_anonymous() {
        let gate = gate(FakeSubjects::with(true));
        let foreign = TokenService::new(&JwtConfig {
            secret: String::from("someone-elses-secret"),
            issuer: String::from("flightdeck-api"),
            expiry_seconds: 3600,
        });
        let token = foreign.issue(7, "admin").unwrap();

        let context = gate
            .authenticate(Some(&format!("Bearer {token}")))
            .await;
        assert!(!context.authenticated);
    }

    #[test]
    fn empty_role_set_admits_any_authenticated_subject() {
        let gate = gate(FakeSubjects::with(true));
        let context = AuthContext::authenticated(7, String::from("worker"));
        assert!(gate.authorize(&context, &roles(&[])));
    }

    #[test]
    fn unauthenticated_context_is_never_authorized() {
        let gate = gate(FakeSubjects::with(true));
        assert!(!gate.authorize(&AuthContext::anonymous(), &roles(&[])));

        // Even a context that claims a matching role fails when it was never
        // authenticated.
        let mut context = AuthContext::authenticated(7, String::from("admin"));
        context.authenticated = false;
        assert!(!gate.authorize(&context, &roles(&["admin"])));
    }

    #[test]
    fn role_must_be_in_the_required_set() {
        let gate = gate(FakeSubjects::with(true));
        let context = AuthContext::authenticated(7, String::from("worker"));

        assert!(!gate.authorize(&context, &roles(&["admin"])));
        assert!(gate.authorize(&context, &roles(&["admin", "worker"])));
    }

    #[test]
    fn role_comparison_is_case_sensitive() {
        let gate = gate(FakeSubjects::with(true));
        let context = AuthContext::authenticated(7, String::from("Admin"));
        assert!(!gate.authorize(&context, &roles(&["admin"])));
    }
}
