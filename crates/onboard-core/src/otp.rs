//! Phone verification over the identity provider's one-time-code challenges.
//!
//! A [`PhoneChallenge`] is a plain value owned by the workflow that requested it. There
//! is no global verifier handle; an abandoned challenge simply expires at the provider.

use crate::error::OnboardError;
use crate::identity::IdentityProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

pub const CODE_LENGTH: usize = 6;

/// Normalize user input to E.164 (`+` followed by 8 to 15 digits).
pub fn normalize_phone(input: &str) -> Result<String, OnboardError> {
    let compact: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    let candidate = match compact.strip_prefix("00") {
        Some(rest) => format!("+{rest}"),
        None => compact,
    };

    if is_e164(&candidate) {
        Ok(candidate)
    } else {
        Err(OnboardError::Verification(format!(
            "'{}' is not a valid international phone number (e.g. +351912345678)",
            input.trim()
        )))
    }
}

pub fn is_e164(phone: &str) -> bool {
    let Some(digits) = phone.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
}

pub fn is_well_formed_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.chars().all(|c| c.is_ascii_digit())
}

/// Open challenge held by a single workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneChallenge {
    pub challenge_id: String,
    pub phone: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PhoneChallenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Phone number proven to belong to the signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedPhone {
    pub phone: String,
    pub verified_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OtpVerifier {
    provider: Arc<dyn IdentityProvider>,
}

impl OtpVerifier {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self { provider }
    }

    pub async fn request(&self, raw_phone: &str) -> Result<PhoneChallenge, OnboardError> {
        let phone = normalize_phone(raw_phone)?;
        let ticket = self.provider.send_otp(&phone).await?;
        debug!(phone = %ticket.phone, "phone challenge opened");
        Ok(PhoneChallenge {
            challenge_id: ticket.challenge_id,
            phone: ticket.phone,
            issued_at: Utc::now(),
            expires_at: ticket.expires_at,
        })
    }

    /// Consume `challenge` with `code` and bind the phone to `uid`.
    pub async fn confirm(
        &self,
        challenge: &PhoneChallenge,
        code: &str,
        uid: &str,
    ) -> Result<VerifiedPhone, OnboardError> {
        let code = code.trim();
        if !is_well_formed_code(code) {
            return Err(OnboardError::Verification(format!(
                "the code must be {CODE_LENGTH} digits"
            )));
        }
        if challenge.is_expired(Utc::now()) {
            return Err(OnboardError::Verification(
                "code expired; request a new one".to_string(),
            ));
        }

        let phone = self
            .provider
            .confirm_otp(&challenge.challenge_id, code)
            .await?;
        if phone != challenge.phone {
            return Err(OnboardError::Verification(
                "code was issued for a different phone".to_string(),
            ));
        }
        self.provider.bind_phone(uid, &phone).await?;

        info!(uid, phone = %phone, "phone verified");
        Ok(VerifiedPhone {
            phone,
            verified_at: Utc::now(),
        })
    }
}
