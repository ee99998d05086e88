//! Authenticator that admits every connection.

use async_trait::async_trait;
use tracing::debug;

use super::{AuthDecision, Authenticator, ConnectionRequest};

#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthenticator;

#[async_trait]
impl Authenticator for NoAuthenticator {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn authenticate(&self, request: &ConnectionRequest) -> AuthDecision {
        debug!("admitting {} without authentication", request.path);
        AuthDecision::Admit
    }
}
