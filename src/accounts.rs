use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::cloud::{CloudError, DatabaseService};

/// Database service clients keyed by account name
#[derive(Clone, Default)]
pub struct AccountRegistry {
    accounts: BTreeMap<String, Arc<dyn DatabaseService>>,
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, name: &str, database: Arc<dyn DatabaseService>) -> Self {
        self.accounts.insert(name.to_string(), database);
        self
    }

    pub fn database(&self, account_name: &str) -> Option<Arc<dyn DatabaseService>> {
        self.accounts.get(account_name).cloned()
    }

    /// Name of the first account (in name order) that has `rds_instance`
    pub async fn find_account(&self, rds_instance: &str) -> Result<Option<String>, CloudError> {
        for (name, database) in &self.accounts {
            if database.describe_instance(rds_instance).await?.is_some() {
                debug!("Found RDS instance {} in account {}", rds_instance, name);
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeDatabaseService;

    #[tokio::test]
    async fn finds_the_account_owning_an_instance() {
        let staging = Arc::new(FakeDatabaseService::new(1));
        let prod = Arc::new(FakeDatabaseService::new(1));
        prod.add_instance(FakeDatabaseService::source_instance("orders-db"));

        let registry = AccountRegistry::new()
            .with_account("staging", staging)
            .with_account("prod", prod);

        assert_eq!(
            registry.find_account("orders-db").await.unwrap().as_deref(),
            Some("prod")
        );
        assert_eq!(registry.find_account("missing").await.unwrap(), None);
        assert!(registry.database("prod").is_some());
        assert!(registry.database("dev").is_none());
    }
}
