//! actix-web adapter for the authorization gate.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    Error, HttpMessage, HttpResponse, ResponseError,
};
use futures::future::{ready, Ready};
use serde_json::json;

use crate::{AuthContext, AuthGate};

/// Rejection raised by [`RequireAuth`], rendered as the JSON error body the
/// route dispatch layer returns.
///
/// The 401 message is deliberately generic for every authentication failure
/// so responses leak nothing about which accounts exist.
#[derive(Debug, thiserror::Error)]
pub enum GateRejection {
    #[error("Not authorized to access this route")]
    NotAuthenticated,

    #[error("User role '{0}' is not authorized to access this route")]
    RoleNotAllowed(String),
}

impl ResponseError for GateRejection {
    fn status_code(&self) -> StatusCode {
        match self {
            GateRejection::NotAuthenticated => StatusCode::UNAUTHORIZED,
            GateRejection::RoleNotAllowed(_) => StatusCode::FORBIDDEN,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "success": false,
            "error": self.to_string(),
        }))
    }
}

/// Middleware guarding a route or scope behind the gate.
///
/// Short-circuits with 401 when the request cannot be authenticated and 403
/// when the subject's role is not in the required set; otherwise stores the
/// [`AuthContext`] in the request extensions for handlers to extract.
pub struct RequireAuth {
    gate: Arc<AuthGate>,
    roles: HashSet<String>,
}

impl RequireAuth {
    /// Admit any authenticated subject.
    pub fn new(gate: Arc<AuthGate>) -> Self {
        Self {
            gate,
            roles: HashSet::new(),
        }
    }

    /// Additionally require one of the given roles.
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequireAuth
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RequireAuthService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequireAuthService {
            service: Rc::new(service),
            gate: self.gate.clone(),
            roles: self.roles.clone(),
        }))
    }
}

pub struct RequireAuthService<S> {
    service: Rc<S>,
    gate: Arc<AuthGate>,
    roles: HashSet<String>,
}

/// Short-circuit the request with the rejection's JSON response.
fn reject<B>(req: ServiceRequest, rejection: GateRejection) -> ServiceResponse<EitherBody<B>> {
    let response = rejection.error_response().map_into_right_body();
    req.into_response(response)
}

impl<S, B> Service<ServiceRequest> for RequireAuthService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let gate = self.gate.clone();
        let roles = self.roles.clone();

        Box::pin(async move {
            let authorization = req
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .map(str::to_owned);

            let context = gate.authenticate(authorization.as_deref()).await;
            if !context.authenticated {
                return Ok(reject(req, GateRejection::NotAuthenticated));
            }
            if !gate.authorize(&context, &roles) {
                return Ok(reject(req, GateRejection::RoleNotAllowed(context.role)));
            }

            req.extensions_mut().insert(context);
            service
                .call(req)
                .await
                .map(|res| res.map_into_left_body())
        })
    }
}

/// Extract the [`AuthContext`] stored by [`RequireAuth`].
impl actix_web::FromRequest for AuthContext {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(
        req: &actix_web::HttpRequest,
        _payload: &mut actix_web::dev::Payload,
    ) -> Self::Future {
        match req.extensions().get::<AuthContext>() {
            Some(context) => ready(Ok(context.clone())),
            None => ready(Err(GateRejection::NotAuthenticated.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubjectStore;
    use actix_web::{test, web, App, Responder};
    use async_trait::async_trait;
    use db_pool::PoolError;
    use jwt_security::{JwtConfig, TokenService};

    struct EveryoneExists;

    #[async_trait]
    impl SubjectStore for EveryoneExists {
        async fn subject_exists(&self, _subject_id: i64) -> Result<bool, PoolError> {
            Ok(true)
        }
    }

    fn token_service() -> Arc<TokenService> {
        Arc::new(TokenService::new(&JwtConfig {
            secret: String::from("a-test-secret-nobody-should-reuse"),
            issuer: String::from("flightdeck-api"),
            expiry_seconds: 3600,
        }))
    }

    fn gate() -> Arc<AuthGate> {
        Arc::new(AuthGate::new(token_service(), Arc::new(EveryoneExists)))
    }

    async fn whoami(context: AuthContext) -> impl Responder {
        HttpResponse::Ok().json(json!({
            "success": true,
            "data": { "id": context.subject_id, "role": context.role },
        }))
    }

    #[actix_web::test]
    async fn request_without_credential_is_401() {
        let app = test::init_service(
            App::new()
                .wrap(RequireAuth::new(gate()))
                .route("/me", web::get().to(whoami)),
        )
        .await;

        let req = test::TestRequest::get().uri("/me").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let body: serde_json::Value = test::read_body_json(res).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Not authorized to access this route");
    }

    #[actix_web::test]
    async fn wrong_role_is_403_naming_the_role() {
        let app = test::init_service(
            App::new()
                .wrap(RequireAuth::new(gate()).with_roles(["admin"]))
                .route("/me", web::get().to(whoami)),
        )
        .await;

        let token = token_service().issue(7, "worker").unwrap();
        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let body: serde_json::Value = test::read_body_json(res).await;
        assert_eq!(body["success"], false);
        assert_eq!(
            body["error"],
            "User role 'worker' is not authorized to access this route"
        );
    }

    #[actix_web::test]
    async fn authenticated_request_reaches_the_handler() {
        let app = test::init_service(
            App::new()
                .wrap(RequireAuth::new(gate()).with_roles(["admin", "worker"]))
                .route("/me", web::get().to(whoami)),
        )
        .await;

        let token = token_service().issue(42, "admin").unwrap();
        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);

        let body: serde_json::Value = test::read_body_json(res).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["id"], 42);
        assert_eq!(body["data"]["role"], "admin");
    }
}
