//! Bearer-token gate in front of the Microsub API.
//!
//! Every request except a CORS preflight (`OPTIONS`) must carry a token the
//! token endpoint vouches for *and* whose `me` is this site.  The validated
//! [`Token`] is handed to the inner service as a request extension.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::auth::http_validator::{AuthError, TokenValidator};
use crate::auth::token::Token;
use crate::metrics::{GateDecision, Metrics};

/// Token validation plus the identity check that the validator leaves to
/// its caller.
pub struct Gate {
    validator: TokenValidator,
    site_me: String,
    metrics: Arc<Metrics>,
}

impl Gate {
    pub fn new(validator: TokenValidator, site_me: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            validator,
            site_me: site_me.into(),
            metrics,
        }
    }

    /// Validate `auth_header` and require the token to belong to this site.
    pub async fn authorize(&self, auth_header: &str) -> Result<Token, AuthError> {
        let token = self.validator.validate(auth_header).await?;
        if !token.is_for(&self.site_me) {
            return Err(AuthError::WrongIdentity(token.me));
        }
        Ok(token)
    }
}

/// [`Layer`] that wraps a service in an [`AuthGate`].
#[derive(Clone)]
pub struct AuthGateLayer {
    gate: Arc<Gate>,
}

impl AuthGateLayer {
    pub fn new(gate: Gate) -> Self {
        Self {
            gate: Arc::new(gate),
        }
    }
}

impl<S> Layer<S> for AuthGateLayer {
    type Service = AuthGate<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthGate {
            inner,
            gate: Arc::clone(&self.gate),
        }
    }
}

#[derive(Clone)]
pub struct AuthGate<S> {
    inner: S,
    gate: Arc<Gate>,
}

impl<S> Service<Request> for AuthGate<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let gate = Arc::clone(&self.gate);
        // Use the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if req.method() == Method::OPTIONS {
                gate.metrics.gate(GateDecision::Preflight);
                return inner.call(req).await;
            }

            let auth_header = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_owned();

            match gate.authorize(&auth_header).await {
                Ok(token) => {
                    gate.metrics.gate(GateDecision::Allowed);
                    debug!(me = %token.me, path = %req.uri().path(), "request authorized");
                    req.extensions_mut().insert(token);
                    inner.call(req).await
                }
                Err(AuthError::WrongIdentity(me)) => {
                    gate.metrics.gate(GateDecision::WrongIdentity);
                    warn!(%me, "token is for a different identity");
                    Ok((StatusCode::FORBIDDEN, "Wrong me").into_response())
                }
                Err(e) => {
                    gate.metrics.gate(GateDecision::Denied);
                    warn!(error = %e, "token could not be validated");
                    Ok((StatusCode::FORBIDDEN, "Can't validate token").into_response())
                }
            }
        })
    }
}
