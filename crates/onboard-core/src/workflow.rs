//! Six-step NDA signing workflow.
//!
//! `READ -> FILL -> PHONE -> VERIFY -> SIGN -> SUCCESS`. Each stage carries exactly the
//! validated data it needs, so SIGN cannot be reached with an incomplete form or an
//! unverified phone. Failed operations leave the stage untouched and keep the user-facing
//! message as the transient error.

use crate::config::OnboardConfig;
use crate::connectors::{BlobStorage, IpLookup};
use crate::document::{ensure_printable, DocumentGenerator};
use crate::error::OnboardError;
use crate::otp::{OtpVerifier, PhoneChallenge, VerifiedPhone};
use crate::signature::{DisplayTransform, Point, SignaturePad};
use crate::store::{InvestorRepository, NdaSignature};
use crate::types::{DocumentType, Identity, Investor, InvestorStatus, SignatoryData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const UNKNOWN_IP: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NdaStep {
    Read,
    Fill,
    Phone,
    Verify,
    Sign,
    Success,
}

impl NdaStep {
    pub fn name(self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Fill => "FILL",
            Self::Phone => "PHONE",
            Self::Verify => "VERIFY",
            Self::Sign => "SIGN",
            Self::Success => "SUCCESS",
        }
    }
}

impl std::fmt::Display for NdaStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Draft of the FILL form as typed by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FillForm {
    pub full_name: String,
    pub company: String,
    pub role: String,
    pub nationality: String,
    pub marital_status: String,
    pub profession: String,
    pub address: String,
    pub document_type: DocumentType,
    pub document_number: String,
    pub tax_id: String,
}

impl FillForm {
    fn required(&self) -> [(&'static str, &String); 9] {
        [
            ("fullName", &self.full_name),
            ("company", &self.company),
            ("role", &self.role),
            ("nationality", &self.nationality),
            ("maritalStatus", &self.marital_status),
            ("profession", &self.profession),
            ("address", &self.address),
            ("documentNumber", &self.document_number),
            ("taxId", &self.tax_id),
        ]
    }

    /// Names of required fields that are blank after trimming.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.required()
            .into_iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name)
            .collect()
    }

    pub fn validate(&self) -> Result<SignatoryDetails, OnboardError> {
        let missing = self.missing_fields();
        if !missing.is_empty() {
            return Err(OnboardError::Validation(format!(
                "please fill in all required fields: {}",
                missing.join(", ")
            )));
        }
        for (field, value) in self.required() {
            ensure_printable(field, value.trim())?;
        }
        Ok(SignatoryDetails {
            full_name: self.full_name.trim().to_string(),
            company: self.company.trim().to_string(),
            role: self.role.trim().to_string(),
            nationality: self.nationality.trim().to_string(),
            marital_status: self.marital_status.trim().to_string(),
            profession: self.profession.trim().to_string(),
            address: self.address.trim().to_string(),
            document_type: self.document_type,
            document_number: self.document_number.trim().to_string(),
            tax_id: self.tax_id.trim().to_string(),
        })
    }
}

/// FILL data that passed validation. Only [`FillForm::validate`] builds one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatoryDetails {
    full_name: String,
    company: String,
    role: String,
    nationality: String,
    marital_status: String,
    profession: String,
    address: String,
    document_type: DocumentType,
    document_number: String,
    tax_id: String,
}

impl SignatoryDetails {
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    fn into_signatory(
        self,
        phone: String,
        email: String,
        signature_date: String,
        signature_image: String,
        document_version: String,
    ) -> SignatoryData {
        SignatoryData {
            full_name: self.full_name,
            nationality: self.nationality,
            marital_status: self.marital_status,
            profession: self.profession,
            address: self.address,
            document_type: self.document_type,
            document_number: self.document_number,
            tax_id: self.tax_id,
            phone,
            signature_date,
            signature_image,
            document_version,
            company_name: self.company,
            company_role: self.role,
            email,
        }
    }
}

/// VERIFY either waits on a code or, after a back step from SIGN, already holds the
/// verified phone.
#[derive(Debug, Clone)]
enum Verification {
    Pending(PhoneChallenge),
    Verified(VerifiedPhone),
}

#[derive(Debug, Clone)]
enum Stage {
    Read,
    Fill,
    Phone {
        details: SignatoryDetails,
    },
    Verify {
        details: SignatoryDetails,
        verification: Verification,
    },
    Sign {
        details: SignatoryDetails,
        phone: VerifiedPhone,
    },
    Success {
        investor: Box<Investor>,
    },
}

impl Stage {
    fn step(&self) -> NdaStep {
        match self {
            Self::Read => NdaStep::Read,
            Self::Fill => NdaStep::Fill,
            Self::Phone { .. } => NdaStep::Phone,
            Self::Verify { .. } => NdaStep::Verify,
            Self::Sign { .. } => NdaStep::Sign,
            Self::Success { .. } => NdaStep::Success,
        }
    }
}

/// Collaborators shared by every workflow instance.
#[derive(Clone)]
pub struct WorkflowServices {
    pub investors: InvestorRepository,
    pub otp: OtpVerifier,
    pub blobs: Arc<dyn BlobStorage>,
    pub ip_lookup: Arc<dyn IpLookup>,
    pub documents: Arc<DocumentGenerator>,
    pub config: Arc<OnboardConfig>,
}

/// Client-facing snapshot of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowView {
    pub step: NdaStep,
    pub error: Option<String>,
    pub accepted: bool,
    pub read_to_end: bool,
    pub form: FillForm,
    pub phone_input: String,
    pub verified_phone: Option<String>,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub signature_empty: bool,
    pub pdf_url: Option<String>,
}

/// One signing session for one identity.
pub struct NdaWorkflow {
    services: WorkflowServices,
    identity: Identity,
    stage: Stage,
    accepted: bool,
    read_to_end: bool,
    draft: FillForm,
    phone_input: String,
    pad: SignaturePad,
    error: Option<String>,
}

impl NdaWorkflow {
    /// Open a workflow for an identity whose record is still at `pending_nda`.
    pub async fn start(services: WorkflowServices, identity: Identity) -> Result<Self, OnboardError> {
        let investor = services.investors.require(&identity.uid).await?;
        if investor.status != InvestorStatus::PendingNda {
            return Err(OnboardError::Conflict(format!(
                "investor '{}' is already at '{}'",
                investor.uid, investor.status
            )));
        }

        let draft = FillForm {
            full_name: investor.name,
            company: investor.company,
            role: investor.role,
            ..FillForm::default()
        };
        debug!(uid = %identity.uid, "nda workflow started");
        Ok(Self {
            services,
            identity,
            stage: Stage::Read,
            accepted: false,
            read_to_end: false,
            draft,
            phone_input: investor.phone,
            pad: SignaturePad::default(),
            error: None,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn step(&self) -> NdaStep {
        self.stage.step()
    }

    /// Transient message from the last failed operation.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn draft(&self) -> &FillForm {
        &self.draft
    }

    pub fn pad(&self) -> &SignaturePad {
        &self.pad
    }

    pub fn view(&self) -> WorkflowView {
        let (verified_phone, code_expires_at) = match &self.stage {
            Stage::Verify {
                verification: Verification::Pending(challenge),
                ..
            } => (None, Some(challenge.expires_at)),
            Stage::Verify {
                verification: Verification::Verified(phone),
                ..
            }
            | Stage::Sign { phone, .. } => (Some(phone.phone.clone()), None),
            _ => (None, None),
        };
        let pdf_url = match &self.stage {
            Stage::Success { investor } => investor.nda_pdf_url.clone(),
            _ => None,
        };
        WorkflowView {
            step: self.step(),
            error: self.error.clone(),
            accepted: self.accepted,
            read_to_end: self.read_to_end,
            form: self.draft.clone(),
            phone_input: self.phone_input.clone(),
            verified_phone,
            code_expires_at,
            signature_empty: self.pad.is_empty(),
            pdf_url,
        }
    }

    /// Scroll progress on the agreement text. Informational only.
    pub fn record_read_progress(&mut self, read_to_end: bool) {
        self.read_to_end = self.read_to_end || read_to_end;
    }

    /// READ -> FILL. Acceptance is the only gate.
    pub fn accept_terms(&mut self, accepted: bool) -> Result<NdaStep, OnboardError> {
        let result = self.expect_step(NdaStep::Read, "accept").and_then(|_| {
            if !accepted {
                return Err(OnboardError::Validation(
                    "please confirm you have read and accept the agreement".to_string(),
                ));
            }
            if !self.read_to_end {
                debug!(uid = %self.identity.uid, "terms accepted without scrolling to the end");
            }
            self.accepted = true;
            self.stage = Stage::Fill;
            Ok(NdaStep::Fill)
        });
        self.settle(result)
    }

    /// FILL -> PHONE. The draft is kept even when validation fails.
    pub fn submit_details(&mut self, form: FillForm) -> Result<NdaStep, OnboardError> {
        let result = self.expect_step(NdaStep::Fill, "submit details").and_then(|_| {
            self.draft = form;
            let details = self.draft.validate()?;
            self.stage = Stage::Phone { details };
            Ok(NdaStep::Phone)
        });
        self.settle(result)
    }

    /// PHONE -> VERIFY, or a resend while at VERIFY.
    pub async fn request_code(&mut self, raw_phone: &str) -> Result<NdaStep, OnboardError> {
        let details = match &self.stage {
            Stage::Phone { details } | Stage::Verify { details, .. } => Ok(details.clone()),
            other => Err(wrong_step(other.step(), "request code")),
        };
        let result = match details {
            Ok(details) => {
                self.phone_input = raw_phone.trim().to_string();
                match self.services.otp.request(raw_phone).await {
                    Ok(challenge) => {
                        info!(uid = %self.identity.uid, phone = %challenge.phone, "verification code sent");
                        self.stage = Stage::Verify {
                            details,
                            verification: Verification::Pending(challenge),
                        };
                        Ok(NdaStep::Verify)
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };
        self.settle(result)
    }

    /// VERIFY -> SIGN. When the phone was verified earlier the code is not checked again.
    pub async fn confirm_code(&mut self, code: &str) -> Result<NdaStep, OnboardError> {
        let (details, verification) = match &self.stage {
            Stage::Verify {
                details,
                verification,
            } => (details.clone(), verification.clone()),
            other => {
                let err = wrong_step(other.step(), "confirm code");
                return self.settle(Err(err));
            }
        };

        let result = match verification {
            Verification::Verified(phone) => Ok(phone),
            Verification::Pending(challenge) => {
                self.services
                    .otp
                    .confirm(&challenge, code, &self.identity.uid)
                    .await
            }
        };
        let result = result.map(|phone| {
            self.stage = Stage::Sign { details, phone };
            NdaStep::Sign
        });
        self.settle(result)
    }

    /// Replay one pointer stroke on the signature pad.
    pub fn draw(
        &mut self,
        transform: Option<DisplayTransform>,
        points: &[Point],
    ) -> Result<bool, OnboardError> {
        let result = self.expect_step(NdaStep::Sign, "draw").map(|_| {
            if let Some(transform) = transform {
                self.pad.set_transform(transform);
            }
            self.pad.stroke(points);
            !self.pad.is_empty()
        });
        self.settle(result)
    }

    pub fn pad_mut(&mut self) -> Result<&mut SignaturePad, OnboardError> {
        self.expect_step(NdaStep::Sign, "draw")?;
        Ok(&mut self.pad)
    }

    pub fn clear_signature(&mut self) -> Result<(), OnboardError> {
        let result = self
            .expect_step(NdaStep::Sign, "clear signature")
            .map(|_| self.pad.clear());
        self.settle(result)
    }

    pub fn can_commit(&self) -> bool {
        matches!(self.stage, Stage::Sign { .. }) && !self.pad.is_empty()
    }

    /// Step back one stage. Entered data is retained.
    pub fn back(&mut self) -> Result<NdaStep, OnboardError> {
        let previous = match &self.stage {
            Stage::Fill => Ok(Stage::Read),
            Stage::Phone { .. } => Ok(Stage::Fill),
            // The open challenge is dropped and simply expires at the provider.
            Stage::Verify { details, .. } => Ok(Stage::Phone {
                details: details.clone(),
            }),
            Stage::Sign { details, phone } => Ok(Stage::Verify {
                details: details.clone(),
                verification: Verification::Verified(phone.clone()),
            }),
            other => Err(wrong_step(other.step(), "go back")),
        };
        let result = previous.map(|stage| {
            self.stage = stage;
            self.stage.step()
        });
        self.settle(result)
    }

    /// SIGN -> SUCCESS, resolving the client IP through the configured lookup.
    pub async fn commit(&mut self) -> Result<Investor, OnboardError> {
        self.commit_with_ip(None).await
    }

    /// SIGN -> SUCCESS.
    ///
    /// Renders the agreement, uploads it and records the signature in one conditional
    /// write. If the write fails the uploaded document is deleted again.
    pub async fn commit_with_ip(
        &mut self,
        client_ip: Option<&str>,
    ) -> Result<Investor, OnboardError> {
        let result = self.try_commit(client_ip).await;
        let result = result.map(|investor| {
            self.stage = Stage::Success {
                investor: Box::new(investor.clone()),
            };
            investor
        });
        self.settle(result)
    }

    async fn try_commit(&self, client_ip: Option<&str>) -> Result<Investor, OnboardError> {
        let (details, phone) = match &self.stage {
            Stage::Sign { details, phone } => (details.clone(), phone.clone()),
            other => return Err(wrong_step(other.step(), "commit")),
        };
        if self.pad.is_empty() {
            return Err(OnboardError::Validation(
                "please sign before submitting".to_string(),
            ));
        }

        let uid = self.identity.uid.as_str();
        let services = &self.services;
        let config = services.config.as_ref();

        let current = services.investors.require(uid).await?;
        if current.status != InvestorStatus::PendingNda {
            return Err(OnboardError::status_violation(
                current.status.name(),
                InvestorStatus::PendingApproval.name(),
            ));
        }

        let signed_ip = self.resolve_ip(client_ip).await;
        let now = Utc::now();
        let raster = self.pad.raster();
        let signatory = details.into_signatory(
            phone.phone,
            self.identity.email.clone(),
            now.format("%Y-%m-%d").to_string(),
            raster.encode()?,
            config.nda_version.clone(),
        );

        let pdf = services.documents.render(
            &config.template_id,
            &signatory,
            &raster,
            now.date_naive(),
            config.locale,
        )?;
        let path = config.document_path(uid, now.timestamp_millis());
        let pdf_url = services.blobs.put(pdf, &path, "application/pdf").await?;
        debug!(uid, path = %path, backend = services.blobs.backend_label(), "agreement uploaded");

        let signature = NdaSignature {
            signatory,
            pdf_url,
            signed_at: now,
            signed_ip,
            nda_version: config.nda_version.clone(),
        };
        match services
            .investors
            .record_nda_signature(uid, current.version, signature)
            .await
        {
            Ok(investor) => {
                info!(uid, version = investor.version, "nda signed");
                Ok(investor)
            }
            Err(err) => {
                if let Err(cleanup) = services.blobs.delete(&path).await {
                    error!(
                        uid,
                        path = %path,
                        error = %cleanup,
                        "orphaned agreement left in blob storage"
                    );
                } else {
                    warn!(uid, path = %path, error = %err, "signature not recorded; upload rolled back");
                }
                Err(err)
            }
        }
    }

    async fn resolve_ip(&self, client_ip: Option<&str>) -> String {
        if let Some(ip) = client_ip.map(str::trim).filter(|ip| !ip.is_empty()) {
            return ip.to_string();
        }
        match self.services.ip_lookup.lookup().await {
            Ok(ip) => ip,
            Err(err) => {
                warn!(uid = %self.identity.uid, error = %err, "ip lookup failed; signing ip recorded as unknown");
                UNKNOWN_IP.to_string()
            }
        }
    }

    fn expect_step(&self, expected: NdaStep, operation: &str) -> Result<(), OnboardError> {
        let current = self.step();
        if current == expected {
            Ok(())
        } else {
            Err(wrong_step(current, operation))
        }
    }

    fn settle<T>(&mut self, result: Result<T, OnboardError>) -> Result<T, OnboardError> {
        match &result {
            Ok(_) => self.error = None,
            Err(err) => {
                debug!(uid = %self.identity.uid, step = %self.step(), error = %err, "workflow step failed");
                self.error = Some(err.user_message());
            }
        }
        result
    }
}

fn wrong_step(step: NdaStep, operation: &str) -> OnboardError {
    OnboardError::StepOrder(format!("cannot {operation} at step {step}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::StaticIpLookup;
    use crate::document::TemplateRegistry;
    use crate::identity::IdentityProvider;
    use crate::memory::{InMemoryBlobStore, InMemoryDocumentStore, InMemoryIdentityProvider};
    use crate::store::{Collection, DocumentStore, FieldEquals, Patch, Subscription};
    use crate::types::Profile;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Document store whose conditional updates can be made to fail.
    struct FlakyStore {
        inner: InMemoryDocumentStore,
        fail_updates: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        fn backend_label(&self) -> &'static str {
            "flaky"
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
            if self.fail_updates.load(Ordering::SeqCst) && !conditions.is_empty() {
                return Err(OnboardError::Backend("write timed out".to_string()));
            }
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

    struct Harness {
        services: WorkflowServices,
        store: Arc<FlakyStore>,
        blobs: Arc<InMemoryBlobStore>,
        identity: Identity,
    }

    async fn harness() -> Harness {
        let store = Arc::new(FlakyStore {
            inner: InMemoryDocumentStore::new(),
            fail_updates: AtomicBool::new(false),
        });
        let investors = InvestorRepository::new(store.clone());
        let provider = Arc::new(InMemoryIdentityProvider::new().with_fixed_code("482913"));
        let identity = provider
            .create_account("investor@x.com", "s3cretpass")
            .await
            .unwrap();
        investors
            .create(&Investor::new_pending(
                identity.uid.clone(),
                identity.email.clone(),
                Profile {
                    name: "Jane Doe".to_string(),
                    company: "Doe Capital".to_string(),
                    role: "Partner".to_string(),
                },
            ))
            .await
            .unwrap();

        let blobs = Arc::new(InMemoryBlobStore::new());
        let services = WorkflowServices {
            investors,
            otp: OtpVerifier::new(provider),
            blobs: blobs.clone(),
            ip_lookup: Arc::new(StaticIpLookup::new("203.0.113.7")),
            documents: Arc::new(DocumentGenerator::new(TemplateRegistry::default(), "Lisboa")),
            config: Arc::new(OnboardConfig::default()),
        };
        Harness {
            services,
            store,
            blobs,
            identity,
        }
    }

    fn complete_form() -> FillForm {
        FillForm {
            full_name: "Jane Doe".to_string(),
            company: "Doe Capital".to_string(),
            role: "Partner".to_string(),
            nationality: "Portuguese".to_string(),
            marital_status: "single".to_string(),
            profession: "Engineer".to_string(),
            address: "Rua Augusta 1, Lisboa".to_string(),
            document_type: DocumentType::Passport,
            document_number: "P123456".to_string(),
            tax_id: "999888777".to_string(),
        }
    }

    async fn at_sign(harness: &Harness) -> NdaWorkflow {
        let mut workflow = NdaWorkflow::start(harness.services.clone(), harness.identity.clone())
            .await
            .unwrap();
        workflow.accept_terms(true).unwrap();
        workflow.submit_details(complete_form()).unwrap();
        workflow.request_code("+351 900 000 000").await.unwrap();
        workflow.confirm_code("482913").await.unwrap();
        workflow
    }

    #[tokio::test]
    async fn draft_is_prefilled_from_signup_profile() {
        let h = harness().await;
        let workflow = NdaWorkflow::start(h.services.clone(), h.identity.clone())
            .await
            .unwrap();
        assert_eq!(workflow.step(), NdaStep::Read);
        assert_eq!(workflow.draft().full_name, "Jane Doe");
        assert_eq!(workflow.draft().company, "Doe Capital");
    }

    #[tokio::test]
    async fn acceptance_is_the_only_read_gate() {
        let h = harness().await;
        let mut workflow = NdaWorkflow::start(h.services.clone(), h.identity.clone())
            .await
            .unwrap();

        assert!(workflow.accept_terms(false).is_err());
        assert_eq!(workflow.step(), NdaStep::Read);
        assert!(workflow.error().is_some());

        // Not scrolled to the end, still allowed.
        assert_eq!(workflow.accept_terms(true).unwrap(), NdaStep::Fill);
        assert!(workflow.error().is_none());
    }

    #[tokio::test]
    async fn incomplete_form_lists_missing_fields_and_keeps_draft() {
        let h = harness().await;
        let mut workflow = NdaWorkflow::start(h.services.clone(), h.identity.clone())
            .await
            .unwrap();
        workflow.accept_terms(true).unwrap();

        let mut form = complete_form();
        form.tax_id = "   ".to_string();
        form.nationality.clear();
        let err = workflow.submit_details(form.clone()).unwrap_err();

        assert!(matches!(err, OnboardError::Validation(_)));
        let message = workflow.error().unwrap();
        assert!(message.contains("nationality") && message.contains("taxId"));
        assert_eq!(workflow.step(), NdaStep::Fill);
        assert_eq!(workflow.draft(), &form);
    }

    #[tokio::test]
    async fn unprintable_form_values_are_refused_at_fill() {
        let h = harness().await;
        let mut workflow = NdaWorkflow::start(h.services.clone(), h.identity.clone())
            .await
            .unwrap();
        workflow.accept_terms(true).unwrap();

        let mut form = complete_form();
        form.full_name = "Łukasz Żółw".to_string();
        let err = workflow.submit_details(form).unwrap_err();

        assert!(matches!(err, OnboardError::Validation(_)));
        assert!(workflow.error().unwrap().contains("fullName"));
        assert_eq!(workflow.step(), NdaStep::Fill);

        let mut form = complete_form();
        form.full_name = "João Gonçalves".to_string();
        assert_eq!(workflow.submit_details(form).unwrap(), NdaStep::Phone);
    }

    #[tokio::test]
    async fn out_of_order_operations_report_the_step() {
        let h = harness().await;
        let mut workflow = NdaWorkflow::start(h.services.clone(), h.identity.clone())
            .await
            .unwrap();
        workflow.accept_terms(true).unwrap();

        let err = workflow.accept_terms(true).unwrap_err();
        assert!(matches!(&err, OnboardError::StepOrder(detail) if detail.contains("FILL")));
        assert!(!workflow.error().unwrap().contains("changed elsewhere"));
        assert_eq!(workflow.step(), NdaStep::Fill);
        assert!(matches!(workflow.commit().await, Err(OnboardError::StepOrder(_))));
    }

    #[tokio::test]
    async fn invalid_code_leaves_workflow_at_verify() {
        let h = harness().await;
        let mut workflow = NdaWorkflow::start(h.services.clone(), h.identity.clone())
            .await
            .unwrap();
        workflow.accept_terms(true).unwrap();
        workflow.submit_details(complete_form()).unwrap();

        assert!(workflow.request_code("912").await.is_err());
        assert_eq!(workflow.step(), NdaStep::Phone);

        workflow.request_code("+351900000000").await.unwrap();
        assert!(workflow.confirm_code("000000").await.is_err());
        assert_eq!(workflow.step(), NdaStep::Verify);
        assert!(workflow.error().is_some());
    }

    #[tokio::test]
    async fn back_from_sign_keeps_verified_phone_and_strokes() {
        let h = harness().await;
        let mut workflow = at_sign(&h).await;
        workflow
            .draw(None, &[Point::new(40.0, 40.0), Point::new(200.0, 150.0)])
            .unwrap();

        assert_eq!(workflow.back().unwrap(), NdaStep::Verify);
        assert_eq!(
            workflow.view().verified_phone.as_deref(),
            Some("+351900000000")
        );
        // No new code needed.
        assert_eq!(workflow.confirm_code("").await.unwrap(), NdaStep::Sign);
        assert!(!workflow.pad().is_empty());

        workflow.back().unwrap();
        workflow.back().unwrap();
        assert_eq!(workflow.back().unwrap(), NdaStep::Fill);
        assert_eq!(workflow.draft(), &complete_form());
        assert_eq!(workflow.back().unwrap(), NdaStep::Read);
        assert!(workflow.back().is_err());
    }

    #[tokio::test]
    async fn empty_signature_cannot_be_committed() {
        let h = harness().await;
        let mut workflow = at_sign(&h).await;
        assert!(!workflow.can_commit());

        let err = workflow.commit().await.unwrap_err();
        assert!(matches!(err, OnboardError::Validation(_)));
        assert_eq!(workflow.step(), NdaStep::Sign);

        let record = h.services.investors.require(&h.identity.uid).await.unwrap();
        assert_eq!(record.status, InvestorStatus::PendingNda);
        assert!(h.blobs.paths().is_empty());
    }

    #[tokio::test]
    async fn commit_records_signature_and_document() {
        let h = harness().await;
        let mut workflow = at_sign(&h).await;
        workflow
            .draw(None, &[Point::new(40.0, 40.0), Point::new(200.0, 150.0)])
            .unwrap();

        let investor = workflow.commit().await.unwrap();
        assert_eq!(workflow.step(), NdaStep::Success);
        assert_eq!(investor.status, InvestorStatus::PendingApproval);
        assert_eq!(investor.phone, "+351900000000");
        assert_eq!(investor.nda_signed_ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(investor.nda_version.as_deref(), Some("1.0"));
        assert_eq!(investor.version, 2);

        let data = investor.nda_signatory_data.unwrap();
        assert_eq!(data.company_name, "Doe Capital");
        assert_eq!(data.email, "investor@x.com");
        assert!(data.signature_image.starts_with("data:"));

        let url = investor.nda_pdf_url.unwrap();
        let path = url.trim_start_matches("mem://");
        let pdf = h.blobs.get(path).unwrap();
        assert!(pdf.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn explicit_client_ip_wins_over_lookup() {
        let h = harness().await;
        let mut workflow = at_sign(&h).await;
        workflow
            .draw(None, &[Point::new(40.0, 40.0), Point::new(200.0, 150.0)])
            .unwrap();

        let investor = workflow.commit_with_ip(Some("198.51.100.2")).await.unwrap();
        assert_eq!(investor.nda_signed_ip.as_deref(), Some("198.51.100.2"));
    }

    #[tokio::test]
    async fn failed_upload_keeps_workflow_at_sign() {
        let h = harness().await;
        let mut workflow = at_sign(&h).await;
        workflow
            .draw(None, &[Point::new(40.0, 40.0), Point::new(200.0, 150.0)])
            .unwrap();
        h.blobs.fail_uploads(true);

        let err = workflow.commit().await.unwrap_err();
        assert!(matches!(err, OnboardError::Storage(_)));
        assert_eq!(workflow.step(), NdaStep::Sign);
        assert!(!workflow.pad().is_empty());

        h.blobs.fail_uploads(false);
        assert!(workflow.commit().await.is_ok());
    }

    #[tokio::test]
    async fn failed_record_write_deletes_uploaded_document() {
        let h = harness().await;
        let mut workflow = at_sign(&h).await;
        workflow
            .draw(None, &[Point::new(40.0, 40.0), Point::new(200.0, 150.0)])
            .unwrap();
        h.store.fail_updates.store(true, Ordering::SeqCst);

        assert!(workflow.commit().await.is_err());
        assert_eq!(workflow.step(), NdaStep::Sign);
        assert!(h.blobs.paths().is_empty());

        let record = h.services.investors.require(&h.identity.uid).await.unwrap();
        assert_eq!(record.status, InvestorStatus::PendingNda);
    }

    #[tokio::test]
    async fn concurrent_commit_of_same_identity_conflicts() {
        let h = harness().await;
        let mut first = at_sign(&h).await;
        let mut second = at_sign(&h).await;
        for workflow in [&mut first, &mut second] {
            workflow
                .draw(None, &[Point::new(40.0, 40.0), Point::new(200.0, 150.0)])
                .unwrap();
        }

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, OnboardError::Conflict(_)));
        assert_eq!(second.step(), NdaStep::Sign);
        assert_eq!(h.blobs.paths().len(), 1);
    }

    #[tokio::test]
    async fn workflow_refuses_identity_past_pending_nda() {
        let h = harness().await;
        let mut workflow = at_sign(&h).await;
        workflow
            .draw(None, &[Point::new(40.0, 40.0), Point::new(200.0, 150.0)])
            .unwrap();
        workflow.commit().await.unwrap();

        let err = NdaWorkflow::start(h.services.clone(), h.identity.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OnboardError::Conflict(_)));
    }
}
