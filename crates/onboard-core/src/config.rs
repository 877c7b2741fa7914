use crate::document::{Locale, DEFAULT_TEMPLATE_ID};
use std::time::Duration;

/// Onboarding runtime configuration.
#[derive(Debug, Clone)]
pub struct OnboardConfig {
    /// Agreement version stamped on the record and into the signatory data.
    pub nda_version: String,
    pub template_id: String,
    pub locale: Locale,
    /// Place printed on the date line of the agreement.
    pub signing_location: String,
    /// Blob path prefix; documents land at `{prefix}/{uid}/{timestamp}.pdf`.
    pub document_prefix: String,
    /// Upper bound for a single `wait_for_change` call.
    pub max_wait: Duration,
}

impl Default for OnboardConfig {
    fn default() -> Self {
        Self {
            nda_version: "1.0".to_string(),
            template_id: DEFAULT_TEMPLATE_ID.to_string(),
            locale: Locale::Pt,
            signing_location: "Lisboa".to_string(),
            document_prefix: "ndas".to_string(),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl OnboardConfig {
    pub fn document_path(&self, uid: &str, stamp: i64) -> String {
        format!(
            "{}/{}/{}.pdf",
            self.document_prefix.trim_end_matches('/'),
            uid,
            stamp
        )
    }
}
