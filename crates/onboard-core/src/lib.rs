//! Investor onboarding core.
//!
//! Identity sessions, the six-step NDA signing workflow, agreement rendering, the admin
//! review console and the access gate, written against collaborator traits so the
//! storage, blob and identity backends can be swapped.

#![deny(unsafe_code)]

pub mod config;
pub mod connectors;
pub mod document;
pub mod error;
pub mod gate;
pub mod identity;
pub mod memory;
pub mod otp;
pub mod review;
pub mod signature;
pub mod store;
pub mod types;
pub mod workflow;

pub use config::OnboardConfig;
pub use connectors::{BlobStorage, IpLookup, StaticIpLookup};
pub use document::{DocumentGenerator, Locale, NdaTemplate, TemplateRegistry, DEFAULT_TEMPLATE_ID};
pub use error::{AuthFailure, OnboardError};
pub use gate::{AccessGate, Route};
pub use identity::{IdentityProvider, IdentitySessionManager, OtpTicket};
pub use memory::{InMemoryBlobStore, InMemoryDocumentStore, InMemoryIdentityProvider, ProviderPolicy};
pub use otp::{OtpVerifier, PhoneChallenge, VerifiedPhone};
pub use review::{AdminReviewConsole, InvestorDetail, TimelineEntry, TimelineEvent};
pub use signature::{DisplayTransform, Point, SignaturePad, SignatureRaster};
pub use store::{
    AdminDirectory, ChangeEvent, ChangeFeed, Collection, DocumentStore, FieldEquals,
    InvestorRepository, NdaSignature, Patch, ReviewDecision, ReviewOutcome, StatusFilter,
    Subscription,
};
pub use types::{
    Admin, AdminRole, AuthSession, DocumentType, Identity, Investor, InvestorStatus, Profile,
    SessionPersistence, SignatoryData,
};
pub use workflow::{FillForm, NdaStep, NdaWorkflow, SignatoryDetails, WorkflowServices, WorkflowView};
