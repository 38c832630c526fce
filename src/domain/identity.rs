use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token claims issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

impl Claims {
    #[must_use]
    pub const fn new(sub: Uuid, exp: usize) -> Self {
        Self { sub, exp }
    }
}

/// Supplies the authenticated caller.
#[async_trait]
pub trait IdentityProvider: Send + Sync + std::fmt::Debug {
    async fn current_user(&self) -> Option<Uuid>;
}
