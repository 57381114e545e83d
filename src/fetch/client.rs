use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes prepared HTTP requests. Shared by source fetching and the broker
/// client so both run over one connection pool.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
