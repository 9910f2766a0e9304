pub mod providers;
pub mod types;

use async_trait::async_trait;

use crate::error::Error;
use types::{CompletionRequest, CompletionResponse, CompletionStream};

/// An upstream model API. Implementations make exactly one attempt per call;
/// retrying is the caller's concern.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// Fails with `MissingApiKey` when the provider cannot authenticate upstream.
    /// Checked before any quota is consumed.
    fn check_credentials(&self) -> Result<(), Error>;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, Error>;

    /// Resolves once the upstream stream is open, so connection failures are
    /// reported here rather than inside the stream.
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream, Error>;
}
