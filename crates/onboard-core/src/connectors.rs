use crate::error::OnboardError;
use async_trait::async_trait;

/// Binary object storage for generated agreements.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Store `bytes` under `path` and return a retrievable URL.
    async fn put(&self, bytes: Vec<u8>, path: &str, content_type: &str)
        -> Result<String, OnboardError>;

    async fn delete(&self, path: &str) -> Result<(), OnboardError>;
}

/// Resolves the public IP of the signing client.
#[async_trait]
pub trait IpLookup: Send + Sync {
    async fn lookup(&self) -> Result<String, OnboardError>;
}

/// Fixed address, used when the caller already knows the client IP.
#[derive(Debug, Clone)]
pub struct StaticIpLookup {
    ip: String,
}

impl StaticIpLookup {
    pub fn new(ip: impl Into<String>) -> Self {
        Self { ip: ip.into() }
    }
}

#[async_trait]
impl IpLookup for StaticIpLookup {
    async fn lookup(&self) -> Result<String, OnboardError> {
        Ok(self.ip.clone())
    }
}
