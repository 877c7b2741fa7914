//! Admin review console over the investor repository.

use crate::error::OnboardError;
use crate::signature::SignatureRaster;
use crate::store::{InvestorRepository, ReviewDecision, ReviewOutcome, StatusFilter, Subscription};
use crate::types::{Investor, SignatoryData};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEvent {
    AccountCreated,
    LastLogin,
    NdaSigned,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub event: TimelineEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything the console shows for one investor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestorDetail {
    pub investor: Investor,
    pub signatory: Option<SignatoryData>,
    /// Encoded signature image, when the NDA was signed.
    pub signature_image: Option<String>,
    pub timeline: Vec<TimelineEntry>,
}

impl InvestorDetail {
    pub fn from_investor(investor: Investor) -> Self {
        let signatory = investor.nda_signatory_data.clone();
        let signature_image = signatory
            .as_ref()
            .map(|data| data.signature_image.clone())
            .filter(|image| !image.is_empty());
        let timeline = timeline(&investor);
        Self {
            investor,
            signatory,
            signature_image,
            timeline,
        }
    }

    pub fn signature_raster(&self) -> Option<Result<SignatureRaster, OnboardError>> {
        self.signature_image
            .as_deref()
            .map(SignatureRaster::decode)
    }
}

fn timeline(investor: &Investor) -> Vec<TimelineEntry> {
    let mut entries = vec![TimelineEntry {
        at: investor.created_at,
        event: TimelineEvent::AccountCreated,
        detail: Some(investor.email.clone()),
    }];
    if let Some(at) = investor.nda_signed_at {
        entries.push(TimelineEntry {
            at,
            event: TimelineEvent::NdaSigned,
            detail: investor
                .nda_signed_ip
                .as_ref()
                .map(|ip| format!("from {ip}")),
        });
    }
    if let Some(at) = investor.approved_at {
        entries.push(TimelineEntry {
            at,
            event: TimelineEvent::Approved,
            detail: investor.approved_by.clone(),
        });
    }
    if let Some(at) = investor.rejected_at {
        let detail = match (&investor.rejected_by, &investor.rejection_reason) {
            (Some(by), Some(reason)) => Some(format!("{by}: {reason}")),
            (Some(by), None) => Some(by.clone()),
            (None, reason) => reason.clone(),
        };
        entries.push(TimelineEntry {
            at,
            event: TimelineEvent::Rejected,
            detail,
        });
    }
    if let Some(at) = investor.last_login {
        entries.push(TimelineEntry {
            at,
            event: TimelineEvent::LastLogin,
            detail: None,
        });
    }
    entries.sort_by_key(|entry| entry.at);
    entries
}

#[derive(Clone)]
pub struct AdminReviewConsole {
    investors: InvestorRepository,
}

impl AdminReviewConsole {
    pub fn new(investors: InvestorRepository) -> Self {
        Self { investors }
    }

    /// Investors matching `filter`, newest first.
    pub async fn list(&self, filter: StatusFilter) -> Result<Vec<Investor>, OnboardError> {
        self.investors.list(filter).await
    }

    pub async fn get(&self, uid: &str) -> Result<InvestorDetail, OnboardError> {
        let investor = self.investors.require(uid).await?;
        Ok(InvestorDetail::from_investor(investor))
    }

    pub async fn approve(&self, uid: &str, admin_uid: &str) -> Result<ReviewOutcome, OnboardError> {
        let outcome = self
            .investors
            .record_review(uid, admin_uid, ReviewDecision::Approve)
            .await?;
        if outcome.was_applied() {
            info!(uid, admin = admin_uid, "investor approved");
        }
        Ok(outcome)
    }

    pub async fn reject(
        &self,
        uid: &str,
        admin_uid: &str,
        reason: Option<String>,
    ) -> Result<ReviewOutcome, OnboardError> {
        let outcome = self
            .investors
            .record_review(uid, admin_uid, ReviewDecision::Reject { reason })
            .await?;
        if outcome.was_applied() {
            info!(uid, admin = admin_uid, "investor rejected");
        }
        Ok(outcome)
    }

    /// Live snapshots of one investor for the detail view.
    pub fn watch_investor(&self, uid: &str) -> Subscription {
        self.investors.subscribe(Some(uid))
    }

    /// Live snapshots of every investor for the list view.
    pub fn watch_all(&self) -> Subscription {
        self.investors.subscribe(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryDocumentStore;
    use crate::store::NdaSignature;
    use crate::types::{Admin, AdminRole, InvestorStatus, Profile};
    use std::sync::Arc;

    async fn console_with_signed_investor() -> (AdminReviewConsole, InvestorRepository) {
        let repo = InvestorRepository::new(Arc::new(InMemoryDocumentStore::new()));
        repo.admins()
            .upsert(&Admin {
                uid: "admin-1".to_string(),
                email: "admin@x.com".to_string(),
                name: "Admin".to_string(),
                role: AdminRole::Admin,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        repo.create(&Investor::new_pending("u1", "investor@x.com", Profile::default()))
            .await
            .unwrap();

        let signatory = SignatoryData {
            full_name: "Jane Doe".to_string(),
            nationality: "Portuguese".to_string(),
            marital_status: "single".to_string(),
            profession: "Engineer".to_string(),
            address: "Rua Augusta 1".to_string(),
            document_type: Default::default(),
            document_number: "P123456".to_string(),
            tax_id: "999888777".to_string(),
            phone: "+351900000000".to_string(),
            signature_date: "2025-01-10".to_string(),
            signature_image: String::new(),
            document_version: "1.0".to_string(),
            company_name: "Doe Capital".to_string(),
            company_role: "Partner".to_string(),
            email: "investor@x.com".to_string(),
        };
        repo.record_nda_signature(
            "u1",
            1,
            NdaSignature {
                signatory,
                pdf_url: "mem://ndas/u1/1.pdf".to_string(),
                signed_at: Utc::now(),
                signed_ip: "203.0.113.7".to_string(),
                nda_version: "1.0".to_string(),
            },
        )
        .await
        .unwrap();
        (AdminReviewConsole::new(repo.clone()), repo)
    }

    #[tokio::test]
    async fn detail_includes_signatory_and_timeline() {
        let (console, _) = console_with_signed_investor().await;
        let detail = console.get("u1").await.unwrap();

        assert_eq!(detail.signatory.unwrap().full_name, "Jane Doe");
        assert!(detail.signature_image.is_none());
        let events: Vec<_> = detail.timeline.iter().map(|entry| entry.event).collect();
        assert_eq!(
            events,
            vec![TimelineEvent::AccountCreated, TimelineEvent::NdaSigned]
        );
    }

    #[tokio::test]
    async fn reject_records_reason_and_second_review_is_a_no_op() {
        let (console, _) = console_with_signed_investor().await;

        let outcome = console
            .reject("u1", "admin-1", Some("  incomplete documentation ".to_string()))
            .await
            .unwrap();
        assert!(outcome.was_applied());
        let investor = outcome.investor();
        assert_eq!(investor.status, InvestorStatus::Rejected);
        assert_eq!(
            investor.rejection_reason.as_deref(),
            Some("incomplete documentation")
        );

        let again = console.approve("u1", "admin-1").await.unwrap();
        assert!(matches!(again, ReviewOutcome::AlreadyFinal(_)));
        assert_eq!(again.investor().status, InvestorStatus::Rejected);
    }

    #[tokio::test]
    async fn watcher_sees_approval() {
        let (console, _) = console_with_signed_investor().await;
        let mut watch = console.watch_investor("u1");

        console.approve("u1", "admin-1").await.unwrap();
        let event = watch.next().await.unwrap();
        assert_eq!(event.snapshot["status"], "approved");
        assert_eq!(event.snapshot["approvedBy"], "admin-1");
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let (console, repo) = console_with_signed_investor().await;
        let mut later = Investor::new_pending("u2", "second@x.com", Profile::default());
        later.created_at = Utc::now() + chrono::Duration::seconds(5);
        repo.create(&later).await.unwrap();

        let all = console.list(StatusFilter::All).await.unwrap();
        let uids: Vec<_> = all.iter().map(|i| i.uid.as_str()).collect();
        assert_eq!(uids, vec!["u2", "u1"]);

        let pending = console
            .list(StatusFilter::Only(InvestorStatus::PendingApproval))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }
}
