use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::OnboardError;

/// Investor lifecycle status.
///
/// The graph is forward-only: `pending_nda -> pending_approval -> approved | rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestorStatus {
    PendingNda,
    PendingApproval,
    Approved,
    Rejected,
}

impl InvestorStatus {
    pub const ALL: [InvestorStatus; 4] = [
        Self::PendingNda,
        Self::PendingApproval,
        Self::Approved,
        Self::Rejected,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PendingNda => "pending_nda",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }

    pub fn can_transition_to(self, next: InvestorStatus) -> bool {
        matches!(
            (self, next),
            (Self::PendingNda, Self::PendingApproval)
                | (Self::PendingApproval, Self::Approved)
                | (Self::PendingApproval, Self::Rejected)
        )
    }
}

impl std::fmt::Display for InvestorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InvestorStatus {
    type Err = OnboardError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.name() == value)
            .ok_or_else(|| {
                OnboardError::Validation(format!(
                    "invalid status '{}'; expected one of: pending_nda, pending_approval, approved, rejected",
                    value
                ))
            })
    }
}

/// Identity document presented by the signatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    #[default]
    CitizenCard,
    Passport,
    ResidencePermit,
    DrivingLicence,
}

impl DocumentType {
    pub fn label(self) -> &'static str {
        match self {
            Self::CitizenCard => "citizen card",
            Self::Passport => "passport",
            Self::ResidencePermit => "residence permit",
            Self::DrivingLicence => "driving licence",
        }
    }
}

/// Legal identity data captured for the NDA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatoryData {
    pub full_name: String,
    pub nationality: String,
    pub marital_status: String,
    pub profession: String,
    pub address: String,
    pub document_type: DocumentType,
    pub document_number: String,
    pub tax_id: String,
    pub phone: String,
    /// ISO date (`YYYY-MM-DD`) the agreement was signed.
    pub signature_date: String,
    /// Encoded signature raster (see `SignatureRaster::encode`).
    pub signature_image: String,
    pub document_version: String,
    pub company_name: String,
    pub company_role: String,
    pub email: String,
}

/// Investor record as persisted in the `investors` collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Investor {
    pub uid: String,
    pub name: String,
    pub company: String,
    pub role: String,
    pub email: String,
    pub phone: String,
    pub status: InvestorStatus,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nda_signed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nda_signed_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nda_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nda_pdf_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nda_signatory_data: Option<SignatoryData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// Incremented on every status-changing write; used for conditional updates.
    #[serde(default)]
    pub version: u64,
}

impl Investor {
    /// Fresh record created at signup.
    pub fn new_pending(uid: impl Into<String>, email: impl Into<String>, profile: Profile) -> Self {
        Self {
            uid: uid.into(),
            name: profile.name,
            company: profile.company,
            role: profile.role,
            email: email.into(),
            phone: String::new(),
            status: InvestorStatus::PendingNda,
            created_at: Utc::now(),
            last_login: None,
            nda_signed_at: None,
            nda_signed_ip: None,
            nda_version: None,
            nda_pdf_url: None,
            nda_signatory_data: None,
            approved_at: None,
            approved_by: None,
            rejected_at: None,
            rejected_by: None,
            rejection_reason: None,
            version: 1,
        }
    }
}

/// Optional profile captured on the signup form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    #[default]
    Admin,
}

/// Admin record as persisted in the `admins` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admin {
    pub uid: String,
    pub email: String,
    pub name: String,
    pub role: AdminRole,
    pub created_at: DateTime<Utc>,
}

/// How long a login session survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPersistence {
    /// Survives restarts ("remember me").
    #[default]
    Durable,
    /// Ends with the browsing session.
    Ephemeral,
}

/// Authenticated identity resolved from a provider session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    pub email: String,
}

/// Provider-issued login session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub identity: Identity,
    pub persistence: SessionPersistence,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}
