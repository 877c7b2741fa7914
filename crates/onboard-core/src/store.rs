//! Persistence layer over the `investors` and `admins` collections.
//!
//! The raw [`DocumentStore`] contract speaks JSON documents with partial merges and
//! field-equality preconditions. [`InvestorRepository`] and [`AdminDirectory`] layer the
//! typed records, the status graph and admin authorization on top of it.

use crate::error::{AuthFailure, OnboardError};
use crate::types::{Admin, AdminRole, Investor, InvestorStatus, SignatoryData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Partial document used by [`DocumentStore::update`]; top-level keys replace existing ones.
pub type Patch = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Investors,
    Admins,
    /// Credential records of the built-in identity provider.
    Accounts,
}

impl Collection {
    pub fn name(self) -> &'static str {
        match self {
            Self::Investors => "investors",
            Self::Admins => "admins",
            Self::Accounts => "accounts",
        }
    }
}

/// Precondition for a conditional write: top-level `field` must currently equal `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldEquals {
    pub field: String,
    pub value: Value,
}

impl FieldEquals {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn holds(&self, document: &Value) -> bool {
        document.get(&self.field) == Some(&self.value)
    }
}

/// Storage contract for JSON documents keyed by collection + id.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, OnboardError>;

    /// Insert a new document; fails with `Conflict` when the id is taken.
    async fn create(
        &self,
        collection: Collection,
        id: &str,
        document: Value,
    ) -> Result<(), OnboardError>;

    /// Insert or fully replace a document.
    async fn set(&self, collection: Collection, id: &str, document: Value)
        -> Result<(), OnboardError>;

    /// Merge `patch` into an existing document when every condition holds.
    ///
    /// Returns the merged document. Missing document is `NotFound`; a failed
    /// precondition is `Conflict`.
    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: Patch,
        conditions: &[FieldEquals],
    ) -> Result<Value, OnboardError>;

    /// Documents whose top-level `field` equals `value`.
    async fn query(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, OnboardError>;

    async fn list(&self, collection: Collection) -> Result<Vec<Value>, OnboardError>;

    /// Push stream of full snapshots for one document, or the whole collection when
    /// `id` is `None`.
    fn subscribe(&self, collection: Collection, id: Option<&str>) -> Subscription;
}

/// Change notification carrying the full document after the write.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub id: String,
    pub snapshot: Value,
}

/// In-process fan-out of committed writes, shared by the store backends.
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, collection: Collection, id: &str, snapshot: Value) {
        // No receivers is fine: nobody is watching.
        let _ = self.sender.send(ChangeEvent {
            collection,
            id: id.to_string(),
            snapshot,
        });
    }

    pub fn subscribe(&self, collection: Collection, id: Option<&str>) -> Subscription {
        Subscription {
            receiver: Some(self.sender.subscribe()),
            collection,
            id: id.map(str::to_string),
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Live subscription to document snapshots.
///
/// Cancelled explicitly with [`Subscription::cancel`] or implicitly on drop.
#[derive(Debug)]
pub struct Subscription {
    receiver: Option<broadcast::Receiver<ChangeEvent>>,
    collection: Collection,
    id: Option<String>,
}

impl Subscription {
    /// Next matching snapshot; `None` once cancelled or the feed is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(event) => {
                    if event.collection != self.collection {
                        continue;
                    }
                    if let Some(id) = &self.id {
                        if &event.id != id {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        collection = self.collection.name(),
                        skipped, "subscription lagged; older snapshots dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    pub fn cancel(&mut self) {
        self.receiver = None;
    }

    pub fn is_active(&self) -> bool {
        self.receiver.is_some()
    }
}

/// Admin list filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Only(InvestorStatus),
}

impl StatusFilter {
    pub fn matches(self, status: InvestorStatus) -> bool {
        match self {
            Self::All => true,
            Self::Only(expected) => expected == status,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = OnboardError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        value.parse::<InvestorStatus>().map(Self::Only)
    }
}

/// Typed access to the `admins` collection.
#[derive(Clone)]
pub struct AdminDirectory {
    store: Arc<dyn DocumentStore>,
}

impl AdminDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, uid: &str) -> Result<Option<Admin>, OnboardError> {
        match self.store.get(Collection::Admins, uid).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn upsert(&self, admin: &Admin) -> Result<(), OnboardError> {
        self.store
            .set(Collection::Admins, &admin.uid, serde_json::to_value(admin)?)
            .await
    }

    pub async fn list(&self) -> Result<Vec<Admin>, OnboardError> {
        self.store
            .query(
                Collection::Admins,
                "role",
                &serde_json::to_value(AdminRole::Admin)?,
            )
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(OnboardError::from))
            .collect()
    }

    /// Resolve `uid` to an admin with `role = admin`, else `Unauthorized`.
    pub async fn require_admin(&self, uid: &str) -> Result<Admin, OnboardError> {
        match self.get(uid).await? {
            Some(admin) if admin.role == AdminRole::Admin => Ok(admin),
            _ => {
                warn!(uid, "review attempted by non-admin identity");
                Err(OnboardError::auth(
                    AuthFailure::Unauthorized,
                    format!("uid '{}' is not an admin", uid),
                ))
            }
        }
    }
}

/// NDA data written on the `pending_nda -> pending_approval` transition.
#[derive(Debug, Clone)]
pub struct NdaSignature {
    pub signatory: SignatoryData,
    pub pdf_url: String,
    pub signed_at: DateTime<Utc>,
    pub signed_ip: String,
    pub nda_version: String,
}

/// Admin decision on a pending investor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject { reason: Option<String> },
}

impl ReviewDecision {
    pub fn target_status(&self) -> InvestorStatus {
        match self {
            Self::Approve => InvestorStatus::Approved,
            Self::Reject { .. } => InvestorStatus::Rejected,
        }
    }
}

/// Result of applying a review decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewOutcome {
    Applied(Investor),
    /// Record was already approved or rejected; nothing was written.
    AlreadyFinal(Investor),
}

impl ReviewOutcome {
    pub fn investor(&self) -> &Investor {
        match self {
            Self::Applied(investor) | Self::AlreadyFinal(investor) => investor,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Typed access to the `investors` collection.
///
/// Exposes no delete: investor records are retained for audit, terminal ones included.
#[derive(Clone)]
pub struct InvestorRepository {
    store: Arc<dyn DocumentStore>,
    admins: AdminDirectory,
}

impl InvestorRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            admins: AdminDirectory::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn admins(&self) -> &AdminDirectory {
        &self.admins
    }

    pub async fn create(&self, investor: &Investor) -> Result<(), OnboardError> {
        if investor.status != InvestorStatus::PendingNda {
            return Err(OnboardError::Validation(format!(
                "new investors start at pending_nda, got '{}'",
                investor.status
            )));
        }
        self.store
            .create(
                Collection::Investors,
                &investor.uid,
                serde_json::to_value(investor)?,
            )
            .await?;
        info!(uid = %investor.uid, "investor record created");
        Ok(())
    }

    pub async fn get(&self, uid: &str) -> Result<Option<Investor>, OnboardError> {
        match self.store.get(Collection::Investors, uid).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn require(&self, uid: &str) -> Result<Investor, OnboardError> {
        self.get(uid)
            .await?
            .ok_or_else(|| OnboardError::NotFound(format!("investor '{}' not found", uid)))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<Investor>, OnboardError> {
        let found = self
            .store
            .query(Collection::Investors, "email", &Value::from(email))
            .await?;
        match found.into_iter().next() {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Investors matching `filter`, newest first.
    pub async fn list(&self, filter: StatusFilter) -> Result<Vec<Investor>, OnboardError> {
        let values = match filter {
            StatusFilter::All => self.store.list(Collection::Investors).await?,
            StatusFilter::Only(status) => {
                self.store
                    .query(Collection::Investors, "status", &Value::from(status.name()))
                    .await?
            }
        };
        let mut investors = values
            .into_iter()
            .map(serde_json::from_value::<Investor>)
            .collect::<Result<Vec<_>, _>>()?;
        investors.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(investors)
    }

    pub async fn touch_login(&self, uid: &str, at: DateTime<Utc>) -> Result<(), OnboardError> {
        let mut patch = Patch::new();
        patch.insert("lastLogin".to_string(), serde_json::to_value(at)?);
        self.store
            .update(Collection::Investors, uid, patch, &[])
            .await?;
        Ok(())
    }

    pub fn subscribe(&self, uid: Option<&str>) -> Subscription {
        self.store.subscribe(Collection::Investors, uid)
    }

    /// Single write for `pending_nda -> pending_approval`, conditional on the status and
    /// the version the caller read.
    pub async fn record_nda_signature(
        &self,
        uid: &str,
        expected_version: u64,
        signature: NdaSignature,
    ) -> Result<Investor, OnboardError> {
        let from = InvestorStatus::PendingNda;
        let to = InvestorStatus::PendingApproval;

        let mut patch = Patch::new();
        patch.insert("status".to_string(), Value::from(to.name()));
        patch.insert("phone".to_string(), Value::from(signature.signatory.phone.clone()));
        patch.insert(
            "ndaSignatoryData".to_string(),
            serde_json::to_value(&signature.signatory)?,
        );
        patch.insert("ndaPdfUrl".to_string(), Value::from(signature.pdf_url));
        patch.insert(
            "ndaSignedAt".to_string(),
            serde_json::to_value(signature.signed_at)?,
        );
        patch.insert("ndaSignedIp".to_string(), Value::from(signature.signed_ip));
        patch.insert("ndaVersion".to_string(), Value::from(signature.nda_version));
        patch.insert("version".to_string(), Value::from(expected_version + 1));

        let conditions = [
            FieldEquals::new("status", from.name()),
            FieldEquals::new("version", expected_version),
        ];
        let merged = self
            .store
            .update(Collection::Investors, uid, patch, &conditions)
            .await
            .map_err(|err| match err {
                OnboardError::Conflict(_) => OnboardError::Conflict(format!(
                    "investor '{}' changed since version {}; NDA not recorded",
                    uid, expected_version
                )),
                other => other,
            })?;

        info!(uid, from = %from, to = %to, "investor status transitioned");
        Ok(serde_json::from_value(merged)?)
    }

    /// Apply an admin decision.
    ///
    /// Authorization is enforced here, not by callers: `admin_uid` must resolve to an
    /// admin record. Terminal records are left untouched.
    pub async fn record_review(
        &self,
        uid: &str,
        admin_uid: &str,
        decision: ReviewDecision,
    ) -> Result<ReviewOutcome, OnboardError> {
        let admin = self.admins.require_admin(admin_uid).await?;
        let target = decision.target_status();

        // One retry: a lost race usually means the other admin finished the record.
        for attempt in 0..2 {
            let current = self.require(uid).await?;
            if current.status.is_terminal() {
                info!(
                    uid,
                    status = %current.status,
                    admin = %admin.uid,
                    "review ignored; investor already final"
                );
                return Ok(ReviewOutcome::AlreadyFinal(current));
            }
            if !current.status.can_transition_to(target) {
                return Err(OnboardError::status_violation(
                    current.status.name(),
                    target.name(),
                ));
            }

            let now = Utc::now();
            let mut patch = Patch::new();
            patch.insert("status".to_string(), Value::from(target.name()));
            patch.insert("version".to_string(), Value::from(current.version + 1));
            match &decision {
                ReviewDecision::Approve => {
                    patch.insert("approvedAt".to_string(), serde_json::to_value(now)?);
                    patch.insert("approvedBy".to_string(), Value::from(admin.uid.clone()));
                }
                ReviewDecision::Reject { reason } => {
                    patch.insert("rejectedAt".to_string(), serde_json::to_value(now)?);
                    patch.insert("rejectedBy".to_string(), Value::from(admin.uid.clone()));
                    if let Some(reason) = reason.as_ref().filter(|r| !r.trim().is_empty()) {
                        patch.insert(
                            "rejectionReason".to_string(),
                            Value::from(reason.trim().to_string()),
                        );
                    }
                }
            }

            let conditions = [
                FieldEquals::new("status", current.status.name()),
                FieldEquals::new("version", current.version),
            ];
            match self
                .store
                .update(Collection::Investors, uid, patch, &conditions)
                .await
            {
                Ok(merged) => {
                    info!(
                        uid,
                        from = %current.status,
                        to = %target,
                        admin = %admin.uid,
                        "investor status transitioned"
                    );
                    return Ok(ReviewOutcome::Applied(serde_json::from_value(merged)?));
                }
                Err(OnboardError::Conflict(detail)) => {
                    warn!(uid, attempt, detail = %detail, "review lost a concurrent write");
                }
                Err(err) => return Err(err),
            }
        }

        Err(OnboardError::Conflict(format!(
            "investor '{}' kept changing during review",
            uid
        )))
    }
}
