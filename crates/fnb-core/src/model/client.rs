use async_trait::async_trait;

use crate::Result;

use super::types::*;

/// Port for the external language-model service.
///
/// Implementations perform exactly one remote call per invocation. Timeouts and
/// retries are applied by the caller (`summarizer::SummarizerAdapter`), so a
/// client must not retry on its own.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResult>;
}
