//! The purchase collaborator workers call for each task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::task::PurchaseTarget;
use crate::dispatcher::{DispatchError, Dispatcher, RequestOptions, RequestPriority};
use crate::egress::EgressIdentity;
use crate::sync::lock;
use crate::transport::{HttpRequest, HttpTransport, TransportError, TransportResponse};

/// Why a purchase attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum PurchaseError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("purchase rejected (status {status})")]
    Rejected { status: u16 },
    #[error("invalid units value '{value}' in {header}")]
    InvalidUnits { header: String, value: String },
    #[error("{0}")]
    Other(String),
}

/// What a worker hands its executor.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub worker_id: usize,
    pub identity: EgressIdentity,
    /// The worker's own dispatcher. Requests made through it are throttled
    /// against this worker's quota only.
    pub dispatcher: Dispatcher,
}

/// Performs one purchase attempt.
#[async_trait]
pub trait PurchaseExecutor: Send + Sync {
    /// Returns the number of units acquired. Zero counts as a failed attempt.
    async fn purchase(
        &self,
        ctx: &WorkerContext,
        target: PurchaseTarget,
    ) -> Result<u32, PurchaseError>;
}

/// Purchases by POSTing to a URL template through the worker's dispatcher.
///
/// `{collection}` and `{item}` in the template are replaced with the target ids.
pub struct HttpPurchaseExecutor {
    url_template: String,
    units_header: Option<String>,
    headers: HashMap<String, String>,
    timeout: Duration,
    user_agent: Option<String>,
    transports: Mutex<HashMap<usize, HttpTransport>>,
}

impl HttpPurchaseExecutor {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url_template: url_template.into(),
            units_header: None,
            headers: HashMap::new(),
            timeout,
            user_agent: None,
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Read the acquired unit count from this response header.
    pub fn with_units_header(mut self, name: impl Into<String>) -> Self {
        self.units_header = Some(name.into());
        self
    }

    /// Send this header with every purchase request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn url_for(&self, target: PurchaseTarget) -> String {
        self.url_template
            .replace("{collection}", &target.collection_id.to_string())
            .replace("{item}", &target.item_id.to_string())
    }

    /// Units acquired according to a successful response.
    pub fn units_from(&self, response: &TransportResponse) -> Result<u32, PurchaseError> {
        if !response.is_success() {
            return Err(PurchaseError::Rejected {
                status: response.status,
            });
        }

        let Some(header) = &self.units_header else {
            return Ok(1);
        };
        match response.header(header) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| PurchaseError::InvalidUnits {
                    header: header.clone(),
                    value: value.to_string(),
                }),
            None => Ok(1),
        }
    }

    /// The worker's transport, built on first use for its identity.
    fn transport(&self, ctx: &WorkerContext) -> Result<HttpTransport, TransportError> {
        let mut transports = lock(&self.transports);
        if let Some(transport) = transports.get(&ctx.worker_id) {
            if transport.identity() == &ctx.identity {
                return Ok(transport.clone());
            }
        }

        let transport = HttpTransport::new(
            ctx.identity.clone(),
            self.timeout,
            self.user_agent.as_deref(),
        )?;
        transports.insert(ctx.worker_id, transport.clone());
        Ok(transport)
    }
}

#[async_trait]
impl PurchaseExecutor for HttpPurchaseExecutor {
    async fn purchase(
        &self,
        ctx: &WorkerContext,
        target: PurchaseTarget,
    ) -> Result<u32, PurchaseError> {
        let transport = self.transport(ctx)?;
        let url = self.url_for(target);
        debug!("Worker {} purchasing {} via {}", ctx.worker_id, target, ctx.identity);

        let request = HttpRequest::post(&url).headers(self.headers.clone());
        let response = ctx
            .dispatcher
            .execute(
                transport.operation(request),
                RequestOptions::new(RequestPriority::Critical),
            )
            .await?;

        self.units_from(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> HttpPurchaseExecutor {
        HttpPurchaseExecutor::new(
            "https://shop.test/api/collections/{collection}/items/{item}/buy",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_url_template() {
        assert_eq!(
            executor().url_for(PurchaseTarget::new(2, 19)),
            "https://shop.test/api/collections/2/items/19/buy"
        );
    }

    #[test]
    fn test_units_default_to_one_on_success() {
        let executor = executor();
        assert_eq!(executor.units_from(&TransportResponse::new(201)).unwrap(), 1);
        assert!(matches!(
            executor.units_from(&TransportResponse::new(409)),
            Err(PurchaseError::Rejected { status: 409 })
        ));
    }

    #[test]
    fn test_units_from_header() {
        let executor = executor().with_units_header("X-Units-Acquired");
        let response = TransportResponse::new(200).with_header("X-Units-Acquired", "3");
        assert_eq!(executor.units_from(&response).unwrap(), 3);

        let response = TransportResponse::new(200).with_header("X-Units-Acquired", "0");
        assert_eq!(executor.units_from(&response).unwrap(), 0);

        let response = TransportResponse::new(200).with_header("X-Units-Acquired", "many");
        assert!(matches!(
            executor.units_from(&response),
            Err(PurchaseError::InvalidUnits { .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_cached_per_worker() {
        let executor = executor();
        let ctx = WorkerContext {
            worker_id: 4,
            identity: EgressIdentity::Direct,
            dispatcher: Dispatcher::in_memory(crate::DispatcherConfig::for_tests()).await,
        };
        executor.transport(&ctx).unwrap();
        executor.transport(&ctx).unwrap();
        assert_eq!(lock(&executor.transports).len(), 1);
    }
}
