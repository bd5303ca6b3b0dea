use super::repository::GatewayConfigStore;
use crate::error::InitiationError;
use crate::models::GatewayCredentials;
use std::sync::Arc;

/// Resolves the Daraja credentials an organization's invoices are paid with.
///
/// An organization without a usable configuration cannot take M-Pesa
/// payments; there is no process-wide fallback.
#[derive(Clone)]
pub struct CredentialRouter {
    store: Arc<dyn GatewayConfigStore>,
}

impl CredentialRouter {
    pub fn new(store: Arc<dyn GatewayConfigStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, organization_id: i64) -> Result<GatewayCredentials, InitiationError> {
        match self.store.find_by_organization(organization_id).await? {
            Some(credentials) if credentials.is_usable() => Ok(credentials),
            Some(_) => {
                tracing::warn!(
                    organization_id,
                    "Gateway configuration present but incomplete"
                );
                Err(InitiationError::ConfigurationMissing(organization_id))
            }
            None => Err(InitiationError::ConfigurationMissing(organization_id)),
        }
    }
}
