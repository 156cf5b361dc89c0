//! Memoized user display-name lookup.

use std::collections::HashMap;
use std::time::Duration;

use moka::future::Cache;
use tracing::warn;

use crate::text::UNKNOWN_USER;
use crate::traits::WikiApi;

/// Display names keyed by account id / user key.
///
/// Owned by one connector, so entries never leak between wiki instances.
/// Without a TTL an entry lives as long as the cache. Failed lookups are
/// cached as [`UNKNOWN_USER`] too. Concurrent lookups of one id share a
/// single upstream call.
#[derive(Clone)]
pub struct UserNameCache {
    names: Cache<String, String>,
}

impl Default for UserNameCache {
    fn default() -> Self {
        Self::new(None)
    }
}

impl UserNameCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        let builder = Cache::builder();
        let names = match ttl {
            Some(ttl) => builder.time_to_live(ttl).build(),
            None => builder.build(),
        };
        Self { names }
    }

    /// Resolve a user id, asking the API only on a cache miss.
    pub async fn display_name(&self, api: &dyn WikiApi, user_id: &str) -> String {
        self.names
            .get_with(user_id.to_string(), async {
                match api.get_user_display_name(user_id).await {
                    Ok(Some(name)) => name,
                    Ok(None) => UNKNOWN_USER.to_string(),
                    Err(e) => {
                        warn!(user_id, error = %e, "unable to get the user display name");
                        UNKNOWN_USER.to_string()
                    }
                }
            })
            .await
    }

    /// Resolve every id in `user_ids`.
    pub async fn resolve_all(
        &self,
        api: &dyn WikiApi,
        user_ids: &[String],
    ) -> HashMap<String, String> {
        let mut names = HashMap::with_capacity(user_ids.len());
        for id in user_ids {
            let name = self.display_name(api, id).await;
            names.insert(id.clone(), name);
        }
        names
    }
}
