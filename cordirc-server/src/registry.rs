//! Process-wide directory of upstream accounts and guild sessions.
//!
//! Both maps hold one `OnceCell` per key. The map lock is taken only to find
//! or insert the cell; the upstream calls that fill a cell run outside it,
//! and concurrent first lookups of the same key all wait on the same cell.

use std::collections::HashMap;
use std::sync::Arc;

use cordirc_platform::{Connector, Platform, User};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::error::BridgeError;
use crate::guild::{GuildSession, Scope};
use crate::router;

/// One credential's live upstream.
pub struct Account {
    pub credential: String,
    pub platform: Arc<dyn Platform>,
    /// The platform user the credential belongs to.
    pub me: User,
}

impl Account {
    pub fn new(credential: &str, platform: Arc<dyn Platform>, me: User) -> Self {
        Self {
            credential: credential.to_string(),
            platform,
            me,
        }
    }
}

type SessionKey = (String, Scope);

pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    cache_size: usize,
    accounts: Mutex<HashMap<String, Arc<OnceCell<Arc<Account>>>>>,
    sessions: Mutex<HashMap<SessionKey, Arc<OnceCell<Arc<GuildSession>>>>>,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>, cache_size: usize) -> Arc<Self> {
        Arc::new(Self {
            connector,
            cache_size,
            accounts: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// The live account for a credential, connecting on first use.
    ///
    /// A failed connect leaves nothing behind; the next call retries.
    pub async fn account(self: &Arc<Self>, credential: &str) -> Result<Arc<Account>, BridgeError> {
        let cell = self
            .accounts
            .lock()
            .entry(credential.to_string())
            .or_default()
            .clone();
        cell.get_or_try_init(|| async {
            let upstream = self.connector.connect(credential).await?;
            let me = upstream.platform.current_user().await?;
            let account = Arc::new(Account::new(credential, upstream.platform, me));
            tracing::info!(user = %account.me.tag(), "Upstream account connected");
            tokio::spawn(router::run(
                Arc::downgrade(self),
                account.clone(),
                upstream.events,
            ));
            Ok::<_, BridgeError>(account)
        })
        .await
        .cloned()
    }

    /// Session for `(credential, scope)`, creating it on first reference.
    pub async fn get_or_create(
        self: &Arc<Self>,
        credential: &str,
        scope: Scope,
    ) -> Result<Arc<GuildSession>, BridgeError> {
        let account = self.account(credential).await?;
        self.session(&account, scope).await
    }

    /// Session for an already connected account.
    pub async fn session(
        &self,
        account: &Arc<Account>,
        scope: Scope,
    ) -> Result<Arc<GuildSession>, BridgeError> {
        let cell = self
            .sessions
            .lock()
            .entry((account.credential.clone(), scope))
            .or_default()
            .clone();
        let session = cell
            .get_or_try_init(|| async {
                GuildSession::load(account.clone(), scope, self.cache_size)
                    .await
                    .map(Arc::new)
            })
            .await?
            .clone();
        // No-op once requested; a failed request is retried on the next lookup.
        if let Err(e) = session.request_roster().await {
            tracing::warn!(scope = %scope, error = %e, "Member list request failed");
        }
        Ok(session)
    }

    /// An existing session, without creating one.
    pub fn lookup(&self, credential: &str, scope: Scope) -> Option<Arc<GuildSession>> {
        self.sessions
            .lock()
            .get(&(credential.to_string(), scope))
            .and_then(|cell| cell.get().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordirc_platform::Snowflake;
    use cordirc_platform::memory::{self, MemoryConnector, MemoryPlatform};

    fn fixture() -> (Arc<MemoryConnector>, Arc<MemoryPlatform>) {
        let connector = Arc::new(MemoryConnector::new());
        let platform = Arc::new(MemoryPlatform::new(memory::user(1, "me")));
        platform.add_guild(memory::guild(
            100,
            "Guild",
            vec![memory::text_channel(10, 100, "general")],
            1,
        ));
        connector.register("tok", platform.clone());
        (connector, platform)
    }

    #[tokio::test]
    async fn concurrent_first_lookups_share_one_session() {
        let (connector, platform) = fixture();
        let registry = SessionRegistry::new(connector.clone(), 100);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .get_or_create("tok", Scope::Guild(Snowflake(100)))
                    .await
                    .unwrap()
            }));
        }
        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(connector.connects(), 1);
        assert_eq!(platform.guild_fetches(), 1);
        assert!(registry.lookup("tok", Scope::Guild(Snowflake(100))).is_some());
    }

    #[tokio::test]
    async fn failed_connect_is_retried() {
        let connector = Arc::new(MemoryConnector::new());
        let registry = SessionRegistry::new(connector.clone(), 100);
        assert!(registry.get_or_create("late", Scope::Direct).await.is_err());

        connector.register("late", Arc::new(MemoryPlatform::new(memory::user(1, "me"))));
        assert!(registry.get_or_create("late", Scope::Direct).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_guild_fails_without_caching() {
        let (connector, _platform) = fixture();
        let registry = SessionRegistry::new(connector, 100);
        let Err(err) = registry
            .get_or_create("tok", Scope::Guild(Snowflake(999)))
            .await
        else {
            panic!("unknown guild resolved");
        };
        assert!(matches!(err, BridgeError::Upstream(_)));
        assert!(registry.lookup("tok", Scope::Guild(Snowflake(999))).is_none());
    }
}
