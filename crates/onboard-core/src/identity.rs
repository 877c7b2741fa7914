//! Identity session manager over an external identity provider.

use crate::error::{AuthFailure, OnboardError};
use crate::store::InvestorRepository;
use crate::types::{AuthSession, Identity, Investor, Profile, SessionPersistence};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// One-time-code challenge as issued by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpTicket {
    pub challenge_id: String,
    pub phone: String,
    pub expires_at: DateTime<Utc>,
}

/// External identity provider: accounts, sessions and phone challenges.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, OnboardError>;

    async fn sign_in(
        &self,
        email: &str,
        password: &str,
        persistence: SessionPersistence,
    ) -> Result<AuthSession, OnboardError>;

    async fn sign_out(&self, token: &str) -> Result<(), OnboardError>;

    async fn session(&self, token: &str) -> Result<Option<AuthSession>, OnboardError>;

    /// Send a one-time code to an E.164 phone number.
    async fn send_otp(&self, phone: &str) -> Result<OtpTicket, OnboardError>;

    /// Consume the challenge; returns the verified phone number.
    async fn confirm_otp(&self, challenge_id: &str, code: &str) -> Result<String, OnboardError>;

    /// Attach a verified phone number to the account.
    async fn bind_phone(&self, uid: &str, phone: &str) -> Result<(), OnboardError>;
}

/// Account creation, login and the client's current session.
pub struct IdentitySessionManager {
    provider: Arc<dyn IdentityProvider>,
    investors: InvestorRepository,
    current: RwLock<Option<AuthSession>>,
}

impl IdentitySessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>, investors: InvestorRepository) -> Self {
        Self {
            provider,
            investors,
            current: RwLock::new(None),
        }
    }

    pub fn provider(&self) -> &Arc<dyn IdentityProvider> {
        &self.provider
    }

    /// Create the provider account and its investor record at `pending_nda`.
    pub async fn create_account(
        &self,
        email: &str,
        password: &str,
        profile: Profile,
    ) -> Result<Investor, OnboardError> {
        let email = normalize_email(email);
        let identity = match self.provider.create_account(&email, password).await {
            Ok(identity) => identity,
            Err(
                err @ OnboardError::Auth {
                    failure: AuthFailure::DuplicateEmail,
                    ..
                },
            ) => match self.account_without_record(&email, password).await? {
                Some(identity) => {
                    warn!(uid = %identity.uid, "completing signup for account without investor record");
                    identity
                }
                None => return Err(err),
            },
            Err(err) => return Err(err),
        };
        let investor = Investor::new_pending(identity.uid.clone(), identity.email, profile);

        if let Err(err) = self.investors.create(&investor).await {
            error!(
                uid = %identity.uid,
                error = %err,
                "account created but investor record could not be written"
            );
            return Err(err);
        }

        info!(uid = %investor.uid, "investor account created");
        Ok(investor)
    }

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        persistence: SessionPersistence,
    ) -> Result<AuthSession, OnboardError> {
        let email = normalize_email(email);
        let session = self.provider.sign_in(&email, password, persistence).await?;

        match self
            .investors
            .touch_login(&session.identity.uid, session.issued_at)
            .await
        {
            Ok(()) => {}
            Err(OnboardError::NotFound(_)) => {
                self.restore_investor_record(&session.identity, session.issued_at)
                    .await?
            }
            Err(err) => warn!(
                uid = %session.identity.uid,
                error = %err,
                "could not record last login"
            ),
        }

        info!(uid = %session.identity.uid, persistence = ?persistence, "signed in");
        *self.current.write().await = Some(session.clone());
        Ok(session)
    }

    pub async fn logout(&self) -> Result<(), OnboardError> {
        let session = self.current.write().await.take();
        if let Some(session) = session {
            self.provider.sign_out(&session.token).await?;
            info!(uid = %session.identity.uid, "signed out");
        }
        Ok(())
    }

    /// Identity of the live current session, if any.
    pub async fn current_identity(&self) -> Result<Option<Identity>, OnboardError> {
        let token = match self.current.read().await.as_ref() {
            Some(session) => session.token.clone(),
            None => return Ok(None),
        };

        match self.provider.session(&token).await? {
            Some(session) if session.is_live(Utc::now()) => Ok(Some(session.identity)),
            _ => {
                debug!("current session expired or revoked");
                *self.current.write().await = None;
                Ok(None)
            }
        }
    }

    /// Resolve a bearer token presented by a remote client.
    pub async fn resolve(&self, token: &str) -> Result<Identity, OnboardError> {
        match self.provider.session(token).await? {
            Some(session) if session.is_live(Utc::now()) => Ok(session.identity),
            Some(_) => Err(OnboardError::auth(
                AuthFailure::SessionExpired,
                "session expired",
            )),
            None => Err(OnboardError::auth(
                AuthFailure::SessionExpired,
                "unknown session token",
            )),
        }
    }

    /// Provider account for `email` that never got its investor record, proven by
    /// `password`. Admin accounts never qualify.
    async fn account_without_record(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Identity>, OnboardError> {
        let Ok(session) = self
            .provider
            .sign_in(email, password, SessionPersistence::Ephemeral)
            .await
        else {
            return Ok(None);
        };
        self.provider.sign_out(&session.token).await?;

        let uid = &session.identity.uid;
        if self.investors.get(uid).await?.is_some()
            || self.investors.admins().get(uid).await?.is_some()
        {
            return Ok(None);
        }
        Ok(Some(session.identity))
    }

    /// Recreate the record of an investor whose signup stopped after the provider account.
    async fn restore_investor_record(
        &self,
        identity: &Identity,
        at: DateTime<Utc>,
    ) -> Result<(), OnboardError> {
        // Admin accounts have no investor record.
        if self.investors.admins().get(&identity.uid).await?.is_some() {
            debug!(uid = %identity.uid, "admin login");
            return Ok(());
        }

        let investor = Investor::new_pending(
            identity.uid.clone(),
            identity.email.clone(),
            Profile::default(),
        );
        match self.investors.create(&investor).await {
            Ok(()) | Err(OnboardError::Conflict(_)) => {}
            Err(err) => return Err(err),
        }
        warn!(uid = %identity.uid, "investor record was missing at login; recreated at pending_nda");
        self.investors.touch_login(&identity.uid, at).await
    }

    /// Revoke a bearer token presented by a remote client.
    pub async fn revoke(&self, token: &str) -> Result<(), OnboardError> {
        self.provider.sign_out(token).await
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryDocumentStore, InMemoryIdentityProvider};
    use crate::store::{Collection, DocumentStore, FieldEquals, Patch, Subscription};
    use crate::types::InvestorStatus;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn manager() -> (IdentitySessionManager, InvestorRepository) {
        let repo = InvestorRepository::new(Arc::new(InMemoryDocumentStore::new()));
        let provider = Arc::new(InMemoryIdentityProvider::new());
        (IdentitySessionManager::new(provider, repo.clone()), repo)
    }

    /// Store whose next investor insert fails, as if the database dropped the write.
    struct DroppingStore {
        inner: InMemoryDocumentStore,
        drop_next_insert: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for DroppingStore {
        fn backend_label(&self) -> &'static str {
            "dropping"
        }

        async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, OnboardError> {
            self.inner.get(collection, id).await
        }

        async fn create(
            &self,
            collection: Collection,
            id: &str,
            document: Value,
        ) -> Result<(), OnboardError> {
            if collection == Collection::Investors
                && self.drop_next_insert.swap(false, Ordering::SeqCst)
            {
                return Err(OnboardError::Backend("connection reset".to_string()));
            }
            self.inner.create(collection, id, document).await
        }

        async fn set(
            &self,
            collection: Collection,
            id: &str,
            document: Value,
        ) -> Result<(), OnboardError> {
            self.inner.set(collection, id, document).await
        }

        async fn update(
            &self,
            collection: Collection,
            id: &str,
            patch: Patch,
            conditions: &[FieldEquals],
        ) -> Result<Value, OnboardError> {
            self.inner.update(collection, id, patch, conditions).await
        }

        async fn query(
            &self,
            collection: Collection,
            field: &str,
            value: &Value,
        ) -> Result<Vec<Value>, OnboardError> {
            self.inner.query(collection, field, value).await
        }

        async fn list(&self, collection: Collection) -> Result<Vec<Value>, OnboardError> {
            self.inner.list(collection).await
        }

        fn subscribe(&self, collection: Collection, id: Option<&str>) -> Subscription {
            self.inner.subscribe(collection, id)
        }
    }

    /// Manager whose first signup creates the provider account but loses the record.
    async fn half_signed_up() -> (IdentitySessionManager, InvestorRepository) {
        let store = Arc::new(DroppingStore {
            inner: InMemoryDocumentStore::new(),
            drop_next_insert: AtomicBool::new(true),
        });
        let repo = InvestorRepository::new(store);
        let manager =
            IdentitySessionManager::new(Arc::new(InMemoryIdentityProvider::new()), repo.clone());

        let err = manager
            .create_account("investor@x.com", "s3cretpass", Profile::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OnboardError::Backend(_)));
        assert!(repo.find_by_email("investor@x.com").await.unwrap().is_none());
        (manager, repo)
    }

    #[tokio::test]
    async fn new_account_starts_pending_nda() {
        let (manager, repo) = manager();
        let investor = manager
            .create_account(" Investor@X.com ", "s3cretpass", Profile::default())
            .await
            .unwrap();

        assert_eq!(investor.email, "investor@x.com");
        let stored = repo.require(&investor.uid).await.unwrap();
        assert_eq!(stored.status, InvestorStatus::PendingNda);
    }

    #[tokio::test]
    async fn duplicate_email_is_reported() {
        let (manager, _) = manager();
        manager
            .create_account("investor@x.com", "s3cretpass", Profile::default())
            .await
            .unwrap();
        let err = manager
            .create_account("investor@x.com", "s3cretpass", Profile::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OnboardError::Auth {
                failure: AuthFailure::DuplicateEmail,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn login_sets_current_identity_and_last_login() {
        let (manager, repo) = manager();
        let investor = manager
            .create_account("investor@x.com", "s3cretpass", Profile::default())
            .await
            .unwrap();

        assert!(manager.current_identity().await.unwrap().is_none());
        manager
            .login("investor@x.com", "s3cretpass", SessionPersistence::Ephemeral)
            .await
            .unwrap();

        let identity = manager.current_identity().await.unwrap().unwrap();
        assert_eq!(identity.uid, investor.uid);
        assert!(repo.require(&investor.uid).await.unwrap().last_login.is_some());

        manager.logout().await.unwrap();
        assert!(manager.current_identity().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credential() {
        let (manager, _) = manager();
        manager
            .create_account("investor@x.com", "s3cretpass", Profile::default())
            .await
            .unwrap();
        let err = manager
            .login("investor@x.com", "nope-nope1", SessionPersistence::Durable)
            .await
            .unwrap_err();
        assert!(err.user_message().contains("incorrect"));
    }

    #[tokio::test]
    async fn retried_signup_completes_an_account_without_record() {
        let (manager, repo) = half_signed_up().await;

        // Someone else cannot claim the account.
        let err = manager
            .create_account("investor@x.com", "other-pass9", Profile::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OnboardError::Auth {
                failure: AuthFailure::DuplicateEmail,
                ..
            }
        ));

        let profile = Profile {
            name: "Jane Doe".to_string(),
            company: "Doe Capital".to_string(),
            role: "Partner".to_string(),
        };
        let investor = manager
            .create_account("investor@x.com", "s3cretpass", profile)
            .await
            .unwrap();
        let stored = repo.require(&investor.uid).await.unwrap();
        assert_eq!(stored.status, InvestorStatus::PendingNda);
        assert_eq!(stored.name, "Jane Doe");

        // With the record in place the email is a plain duplicate again.
        assert!(manager
            .create_account("investor@x.com", "s3cretpass", Profile::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn login_restores_a_missing_investor_record() {
        let (manager, repo) = half_signed_up().await;

        let session = manager
            .login("investor@x.com", "s3cretpass", SessionPersistence::Durable)
            .await
            .unwrap();

        let stored = repo.require(&session.identity.uid).await.unwrap();
        assert_eq!(stored.status, InvestorStatus::PendingNda);
        assert_eq!(stored.email, "investor@x.com");
        assert!(stored.last_login.is_some());
    }
}
