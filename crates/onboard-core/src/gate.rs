//! Access gate: maps an identity's investor status to the screen it may see.

use crate::error::OnboardError;
use crate::store::InvestorRepository;
use crate::types::{Identity, InvestorStatus};
use crate::workflow::NdaStep;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
    Login,
    Onboarding { step: NdaStep },
    PendingApproval,
    Blocked,
    InvestorArea,
}

impl Route {
    pub fn for_status(status: InvestorStatus) -> Self {
        match status {
            InvestorStatus::PendingNda => Self::Onboarding {
                step: NdaStep::Read,
            },
            InvestorStatus::PendingApproval => Self::PendingApproval,
            InvestorStatus::Rejected => Self::Blocked,
            InvestorStatus::Approved => Self::InvestorArea,
        }
    }
}

#[derive(Clone)]
pub struct AccessGate {
    investors: InvestorRepository,
}

impl AccessGate {
    pub fn new(investors: InvestorRepository) -> Self {
        Self { investors }
    }

    pub async fn route(&self, identity: Option<&Identity>) -> Result<Route, OnboardError> {
        let Some(identity) = identity else {
            return Ok(Route::Login);
        };
        match self.investors.get(&identity.uid).await? {
            Some(investor) => {
                let route = Route::for_status(investor.status);
                debug!(uid = %identity.uid, status = %investor.status, ?route, "routed");
                Ok(route)
            }
            None => {
                warn!(uid = %identity.uid, "authenticated identity has no investor record");
                Ok(Route::Login)
            }
        }
    }

    /// Wait until the status of `uid` differs from `known`.
    ///
    /// Returns the new status, or `None` when `timeout` elapses first. Driven by the
    /// store's push subscription.
    pub async fn wait_for_change(
        &self,
        uid: &str,
        known: InvestorStatus,
        timeout: Duration,
    ) -> Result<Option<InvestorStatus>, OnboardError> {
        // Subscribe before reading so a write landing in between is not missed.
        let mut subscription = self.investors.subscribe(Some(uid));
        let current = self.investors.require(uid).await?;
        if current.status != known {
            return Ok(Some(current.status));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, subscription.next()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(OnboardError::Backend(
                        "investor change feed closed".to_string(),
                    ))
                }
                Err(_) => return Ok(None),
            };
            let status = event
                .snapshot
                .get("status")
                .cloned()
                .map(serde_json::from_value::<InvestorStatus>)
                .transpose()?;
            match status {
                Some(status) if status != known => {
                    debug!(uid, from = %known, to = %status, "status change observed");
                    return Ok(Some(status));
                }
                _ => continue,
            }
        }
    }
}
