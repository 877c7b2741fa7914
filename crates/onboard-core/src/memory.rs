//! In-memory reference implementations of the external collaborators.
//!
//! These adapters are deterministic and test-friendly. Production deployments plug
//! real providers (identity, object storage, database) in behind the same traits.

use crate::connectors::BlobStorage;
use crate::error::{AuthFailure, OnboardError};
use crate::identity::{IdentityProvider, OtpTicket};
use crate::otp::is_e164;
use crate::store::{ChangeFeed, Collection, DocumentStore, FieldEquals, Patch, Subscription};
use crate::types::{AuthSession, Identity, SessionPersistence};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

fn poisoned(what: &str) -> OnboardError {
    OnboardError::Backend(format!("{what} lock poisoned"))
}

/// In-memory document store with change notifications.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<Collection, BTreeMap<String, Value>>>,
    feed: ChangeFeed,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, OnboardError> {
        let guard = self.documents.read().map_err(|_| poisoned("documents"))?;
        Ok(guard
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn create(
        &self,
        collection: Collection,
        id: &str,
        document: Value,
    ) -> Result<(), OnboardError> {
        {
            let mut guard = self.documents.write().map_err(|_| poisoned("documents"))?;
            let docs = guard.entry(collection).or_default();
            if docs.contains_key(id) {
                return Err(OnboardError::Conflict(format!(
                    "{} '{}' already exists",
                    collection.name(),
                    id
                )));
            }
            docs.insert(id.to_string(), document.clone());
        }
        self.feed.publish(collection, id, document);
        Ok(())
    }

    async fn set(
        &self,
        collection: Collection,
        id: &str,
        document: Value,
    ) -> Result<(), OnboardError> {
        {
            let mut guard = self.documents.write().map_err(|_| poisoned("documents"))?;
            guard
                .entry(collection)
                .or_default()
                .insert(id.to_string(), document.clone());
        }
        self.feed.publish(collection, id, document);
        Ok(())
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: Patch,
        conditions: &[FieldEquals],
    ) -> Result<Value, OnboardError> {
        let merged = {
            let mut guard = self.documents.write().map_err(|_| poisoned("documents"))?;
            let document = guard
                .get_mut(&collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| {
                    OnboardError::NotFound(format!("{} '{}' not found", collection.name(), id))
                })?;

            if let Some(failed) = conditions.iter().find(|c| !c.holds(document)) {
                return Err(OnboardError::Conflict(format!(
                    "precondition failed on {} '{}': {} != {}",
                    collection.name(),
                    id,
                    failed.field,
                    failed.value
                )));
            }

            let fields = document.as_object_mut().ok_or_else(|| {
                OnboardError::Serialization(format!(
                    "{} '{}' is not a JSON object",
                    collection.name(),
                    id
                ))
            })?;
            fields.extend(patch);
            document.clone()
        };

        self.feed.publish(collection, id, merged.clone());
        Ok(merged)
    }

    async fn query(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, OnboardError> {
        let guard = self.documents.read().map_err(|_| poisoned("documents"))?;
        Ok(guard
            .get(&collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| doc.get(field) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Value>, OnboardError> {
        let guard = self.documents.read().map_err(|_| poisoned("documents"))?;
        Ok(guard
            .get(&collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    fn subscribe(&self, collection: Collection, id: Option<&str>) -> Subscription {
        self.feed.subscribe(collection, id)
    }
}

/// In-memory blob storage returning `mem://` URLs.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, (Vec<u8>, String)>>,
    fail_uploads: AtomicBool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail (outage simulation).
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.blobs
            .read()
            .ok()
            .and_then(|blobs| blobs.get(path).map(|(bytes, _)| bytes.clone()))
    }

    pub fn paths(&self) -> Vec<String> {
        self.blobs
            .read()
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlobStorage for InMemoryBlobStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn put(
        &self,
        bytes: Vec<u8>,
        path: &str,
        content_type: &str,
    ) -> Result<String, OnboardError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(OnboardError::Storage(format!("upload of '{path}' refused")));
        }
        let mut guard = self.blobs.write().map_err(|_| poisoned("blobs"))?;
        guard.insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(format!("mem://{path}"))
    }

    async fn delete(&self, path: &str) -> Result<(), OnboardError> {
        let mut guard = self.blobs.write().map_err(|_| poisoned("blobs"))?;
        guard.remove(path);
        Ok(())
    }
}

/// Limits applied by [`InMemoryIdentityProvider`].
#[derive(Debug, Clone)]
pub struct ProviderPolicy {
    pub durable_session_ttl: Duration,
    pub ephemeral_session_ttl: Duration,
    pub otp_ttl: Duration,
    pub max_login_failures: u32,
    pub lockout: Duration,
    pub max_otp_sends: usize,
    pub otp_send_window: Duration,
    pub max_code_attempts: u32,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        Self {
            durable_session_ttl: Duration::days(30),
            ephemeral_session_ttl: Duration::hours(12),
            otp_ttl: Duration::minutes(5),
            max_login_failures: 5,
            lockout: Duration::minutes(15),
            max_otp_sends: 5,
            otp_send_window: Duration::minutes(10),
            max_code_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct Account {
    uid: String,
    email: String,
    salt: [u8; 16],
    credential: blake3::Hash,
    phone: Option<String>,
}

/// Stored form of an [`Account`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountRecord {
    uid: String,
    email: String,
    salt: [u8; 16],
    credential: String,
    #[serde(default)]
    phone: Option<String>,
}

impl Account {
    fn to_document(&self) -> Result<Value, OnboardError> {
        Ok(serde_json::to_value(AccountRecord {
            uid: self.uid.clone(),
            email: self.email.clone(),
            salt: self.salt,
            credential: self.credential.to_hex().to_string(),
            phone: self.phone.clone(),
        })?)
    }

    fn from_document(document: Value) -> Result<Self, OnboardError> {
        let record: AccountRecord = serde_json::from_value(document)?;
        let credential = blake3::Hash::from_hex(&record.credential).map_err(|err| {
            OnboardError::Backend(format!("account '{}' has a corrupt credential: {err}", record.email))
        })?;
        Ok(Self {
            uid: record.uid,
            email: record.email,
            salt: record.salt,
            credential,
            phone: record.phone,
        })
    }
}

#[derive(Debug, Clone, Default)]
struct LoginFailures {
    count: u32,
    last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct OpenChallenge {
    phone: String,
    code: String,
    expires_at: DateTime<Utc>,
    attempts: u32,
}

#[derive(Default)]
struct ProviderState {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, AuthSession>,
    failures: HashMap<String, LoginFailures>,
    challenges: HashMap<String, OpenChallenge>,
    sends: HashMap<String, Vec<DateTime<Utc>>>,
    last_codes: HashMap<String, String>,
}

/// Self-contained identity provider: salted blake3 credentials, bearer sessions and
/// six-digit phone challenges.
///
/// With [`with_account_store`](Self::with_account_store) attached, accounts are written
/// through to the document store and survive restarts. Sessions, challenges and
/// failure counters always stay in process.
pub struct InMemoryIdentityProvider {
    state: RwLock<ProviderState>,
    policy: ProviderPolicy,
    fixed_code: Option<String>,
    accounts: Option<Arc<dyn DocumentStore>>,
}

impl Default for InMemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::with_policy(ProviderPolicy::default())
    }

    pub fn with_policy(policy: ProviderPolicy) -> Self {
        Self {
            state: RwLock::new(ProviderState::default()),
            policy,
            fixed_code: None,
            accounts: None,
        }
    }

    /// Persist accounts in `store` under [`Collection::Accounts`].
    pub fn with_account_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.accounts = Some(store);
        self
    }

    /// Issue `code` for every challenge instead of a random one.
    pub fn with_fixed_code(mut self, code: impl Into<String>) -> Self {
        self.fixed_code = Some(code.into());
        self
    }

    /// Last code delivered to `phone` (stands in for the SMS inbox).
    pub fn last_code_for(&self, phone: &str) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.last_codes.get(phone).cloned())
    }

    pub fn bound_phone(&self, uid: &str) -> Option<String> {
        self.state.read().ok().and_then(|state| {
            state
                .accounts
                .values()
                .find(|account| account.uid == uid)
                .and_then(|account| account.phone.clone())
        })
    }

    /// Pull a stored account into the cache when it is not there yet.
    async fn load_account(&self, email: &str) -> Result<(), OnboardError> {
        let Some(store) = &self.accounts else {
            return Ok(());
        };
        let cached = self
            .state
            .read()
            .map_err(|_| poisoned("identity"))?
            .accounts
            .contains_key(email);
        if cached {
            return Ok(());
        }
        if let Some(document) = store.get(Collection::Accounts, email).await? {
            let account = Account::from_document(document)?;
            self.state
                .write()
                .map_err(|_| poisoned("identity"))?
                .accounts
                .entry(email.to_string())
                .or_insert(account);
        }
        Ok(())
    }

    fn session_ttl(&self, persistence: SessionPersistence) -> Duration {
        match persistence {
            SessionPersistence::Durable => self.policy.durable_session_ttl,
            SessionPersistence::Ephemeral => self.policy.ephemeral_session_ttl,
        }
    }
}

fn hash_credential(salt: &[u8; 16], password: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hasher.finalize()
}

fn random_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn valid_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain.contains('.')
                && !email.contains(char::is_whitespace)
        }
        None => false,
    }
}

fn strong_password(password: &str) -> bool {
    password.chars().count() >= 8
        && password.chars().any(|c| c.is_alphabetic())
        && password.chars().any(|c| c.is_ascii_digit())
}

#[async_trait]
impl IdentityProvider for InMemoryIdentityProvider {
    async fn create_account(&self, email: &str, password: &str) -> Result<Identity, OnboardError> {
        if !valid_email(email) {
            return Err(OnboardError::Validation(format!(
                "'{email}' is not a valid email address"
            )));
        }
        if !strong_password(password) {
            return Err(OnboardError::auth(
                AuthFailure::WeakCredential,
                "password policy not met",
            ));
        }

        let duplicate = || {
            OnboardError::auth(
                AuthFailure::DuplicateEmail,
                format!("account '{email}' exists"),
            )
        };
        let taken = self
            .state
            .read()
            .map_err(|_| poisoned("identity"))?
            .accounts
            .contains_key(email);
        if taken {
            return Err(duplicate());
        }

        let salt: [u8; 16] = rand::thread_rng().gen();
        let account = Account {
            uid: Uuid::new_v4().to_string(),
            email: email.to_string(),
            salt,
            credential: hash_credential(&salt, password),
            phone: None,
        };
        if let Some(store) = &self.accounts {
            match store
                .create(Collection::Accounts, email, account.to_document()?)
                .await
            {
                Ok(()) => {}
                Err(OnboardError::Conflict(_)) => return Err(duplicate()),
                Err(err) => return Err(err),
            }
        }

        let identity = Identity {
            uid: account.uid.clone(),
            email: account.email.clone(),
        };
        let mut state = self.state.write().map_err(|_| poisoned("identity"))?;
        if state.accounts.contains_key(email) {
            return Err(duplicate());
        }
        state.accounts.insert(email.to_string(), account);
        Ok(identity)
    }

    async fn sign_in(
        &self,
        email: &str,
        password: &str,
        persistence: SessionPersistence,
    ) -> Result<AuthSession, OnboardError> {
        self.load_account(email).await?;
        let now = Utc::now();
        let mut state = self.state.write().map_err(|_| poisoned("identity"))?;

        if let Some(failures) = state.failures.get(email) {
            let locked = failures.count >= self.policy.max_login_failures
                && failures
                    .last_failure
                    .map(|at| now - at < self.policy.lockout)
                    .unwrap_or(false);
            if locked {
                warn!(email, "login rate limited");
                return Err(OnboardError::auth(
                    AuthFailure::RateLimited,
                    format!("{} failed attempts", failures.count),
                ));
            }
        }

        let verified = state
            .accounts
            .get(email)
            .filter(|account| hash_credential(&account.salt, password) == account.credential)
            .map(|account| Identity {
                uid: account.uid.clone(),
                email: account.email.clone(),
            });

        let Some(identity) = verified else {
            let entry = state.failures.entry(email.to_string()).or_default();
            entry.count += 1;
            entry.last_failure = Some(now);
            return Err(OnboardError::auth(
                AuthFailure::InvalidCredential,
                "email or password mismatch",
            ));
        };

        state.failures.remove(email);
        let session = AuthSession {
            token: random_token(),
            identity,
            persistence,
            issued_at: now,
            expires_at: now + self.session_ttl(persistence),
        };
        state
            .sessions
            .insert(session.token.clone(), session.clone());
        Ok(session)
    }

    async fn sign_out(&self, token: &str) -> Result<(), OnboardError> {
        let mut state = self.state.write().map_err(|_| poisoned("identity"))?;
        state.sessions.remove(token);
        Ok(())
    }

    async fn session(&self, token: &str) -> Result<Option<AuthSession>, OnboardError> {
        let state = self.state.read().map_err(|_| poisoned("identity"))?;
        Ok(state.sessions.get(token).cloned())
    }

    async fn send_otp(&self, phone: &str) -> Result<OtpTicket, OnboardError> {
        if !is_e164(phone) {
            return Err(OnboardError::Verification(format!(
                "'{phone}' is not an E.164 phone number"
            )));
        }

        let now = Utc::now();
        let mut state = self.state.write().map_err(|_| poisoned("identity"))?;
        let window_start = now - self.policy.otp_send_window;
        let sends = state.sends.entry(phone.to_string()).or_default();
        sends.retain(|at| *at > window_start);
        if sends.len() >= self.policy.max_otp_sends {
            warn!(phone, "otp send rate limited");
            return Err(OnboardError::auth(
                AuthFailure::RateLimited,
                format!("{} codes sent in window", sends.len()),
            ));
        }
        sends.push(now);

        let code = self
            .fixed_code
            .clone()
            .unwrap_or_else(|| format!("{:06}", rand::thread_rng().gen_range(0..1_000_000)));
        let challenge_id = Uuid::new_v4().to_string();
        let expires_at = now + self.policy.otp_ttl;
        state.challenges.insert(
            challenge_id.clone(),
            OpenChallenge {
                phone: phone.to_string(),
                code: code.clone(),
                expires_at,
                attempts: 0,
            },
        );
        state.last_codes.insert(phone.to_string(), code);
        info!(phone, challenge_id = %challenge_id, "otp challenge issued");

        Ok(OtpTicket {
            challenge_id,
            phone: phone.to_string(),
            expires_at,
        })
    }

    async fn confirm_otp(&self, challenge_id: &str, code: &str) -> Result<String, OnboardError> {
        let now = Utc::now();
        let mut state = self.state.write().map_err(|_| poisoned("identity"))?;
        let challenge = state.challenges.get_mut(challenge_id).ok_or_else(|| {
            OnboardError::Verification("code expired or already used".to_string())
        })?;

        if now >= challenge.expires_at {
            state.challenges.remove(challenge_id);
            return Err(OnboardError::Verification("code expired".to_string()));
        }

        if challenge.code != code {
            challenge.attempts += 1;
            if challenge.attempts >= self.policy.max_code_attempts {
                state.challenges.remove(challenge_id);
            }
            return Err(OnboardError::Verification("invalid code".to_string()));
        }

        let phone = challenge.phone.clone();
        state.challenges.remove(challenge_id);
        Ok(phone)
    }

    async fn bind_phone(&self, uid: &str, phone: &str) -> Result<(), OnboardError> {
        let email = {
            let mut state = self.state.write().map_err(|_| poisoned("identity"))?;
            let account = state
                .accounts
                .values_mut()
                .find(|account| account.uid == uid)
                .ok_or_else(|| OnboardError::NotFound(format!("account '{uid}' not found")))?;
            account.phone = Some(phone.to_string());
            account.email.clone()
        };

        if let Some(store) = &self.accounts {
            let mut patch = Patch::new();
            patch.insert("phone".to_string(), Value::from(phone));
            store
                .update(Collection::Accounts, &email, patch, &[])
                .await?;
        }
        Ok(())
    }
}
