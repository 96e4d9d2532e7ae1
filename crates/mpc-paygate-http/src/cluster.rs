use std::time::Duration;

use mpc_paygate::{
    cluster::{
        Cluster, ClusterId, ComputeId, ComputeRequest, StoreId, StoreProgramRequest,
        StoreValuesRequest,
    },
    events::{ComputeEvent, ComputeEvents},
    identity::UserId,
    operation::Operation,
    payment::{PaymentReceipt, Quote},
    program::ActionId,
};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{Level, debug, error};
use url::Url;

use crate::{Clients, HttpError, fetch};

/// A [`Cluster`] reached over its REST API.
///
/// The routes are relative to the base url:
///
/// | Route                                      | Body                    | Response        |
/// |--------------------------------------------|-------------------------|-----------------|
/// | `POST v1/clusters/{cluster_id}/quote`      | `Operation`             | `Quote`         |
/// | `POST v1/clusters/{cluster_id}/programs`   | request and receipt     | `{action_id}`   |
/// | `POST v1/clusters/{cluster_id}/values`     | request and receipt     | `{store_id}`    |
/// | `POST v1/clusters/{cluster_id}/compute`    | request and receipt     | `{compute_id}`  |
/// | `GET v1/users/{user_id}/events?after=...`  |                         | `EventPage`     |
#[derive(Debug, Clone)]
pub struct HttpCluster {
    base_url: Url,
    clients: Clients,
    poll_interval: Duration,
}

/// A body of a paid request.
#[derive(Debug, Serialize)]
struct Paid<R> {
    request: R,
    receipt: PaymentReceipt,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    action_id: ActionId,
}

#[derive(Debug, Deserialize)]
struct StoreResponse {
    store_id: StoreId,
}

#[derive(Debug, Deserialize)]
struct ComputeResponse {
    compute_id: ComputeId,
}

/// One page of a long-polled event stream.
#[derive(Debug, Serialize, Deserialize)]
pub struct EventPage {
    /// Events in delivery order.
    pub events: Vec<ComputeEvent>,
    /// Cursor to continue after the last event.
    pub cursor: Option<String>,
}

impl HttpCluster {
    /// A cluster client for the API at `base_url`.
    pub fn new(base_url: Url) -> anyhow::Result<Self> {
        Self::with_opts(base_url, Duration::from_secs(60), Duration::from_secs(1))
    }

    /// A cluster client retrying idempotent requests for up to `retry_duration` and polling
    /// events every `poll_interval` while there are none.
    pub fn with_opts(
        base_url: Url,
        retry_duration: Duration,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base_url,
            clients: Clients::new(retry_duration)?,
            poll_interval,
        })
    }

    fn cluster_url(&self, cluster_id: &ClusterId, route: &str) -> Result<Url, HttpError> {
        Ok(self
            .base_url
            .join(&format!("v1/clusters/{cluster_id}/{route}"))?)
    }

    async fn paid<R: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
        request: R,
        receipt: PaymentReceipt,
    ) -> Result<T, HttpError> {
        let body = Paid { request, receipt };
        let req = self.clients.once.post(url.clone()).json(&body);
        fetch(url, req).await
    }
}

impl Cluster for HttpCluster {
    type Error = HttpError;

    #[tracing::instrument(level = Level::DEBUG, skip(self), err)]
    async fn quote(
        &self,
        cluster_id: &ClusterId,
        operation: &Operation,
    ) -> Result<Quote, Self::Error> {
        let url = self.cluster_url(cluster_id, "quote")?;
        let req = self.clients.retrying.post(url.clone()).json(operation);
        fetch(url, req).await
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, request, receipt), err)]
    async fn store_program(
        &self,
        cluster_id: &ClusterId,
        request: StoreProgramRequest,
        receipt: PaymentReceipt,
    ) -> Result<ActionId, Self::Error> {
        let url = self.cluster_url(cluster_id, "programs")?;
        let resp: ActionResponse = self.paid(url, request, receipt).await?;
        Ok(resp.action_id)
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, request, receipt), err)]
    async fn store_values(
        &self,
        cluster_id: &ClusterId,
        request: StoreValuesRequest,
        receipt: PaymentReceipt,
    ) -> Result<StoreId, Self::Error> {
        let url = self.cluster_url(cluster_id, "values")?;
        let resp: StoreResponse = self.paid(url, request, receipt).await?;
        Ok(resp.store_id)
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self, request, receipt), err)]
    async fn compute(
        &self,
        cluster_id: &ClusterId,
        request: ComputeRequest,
        receipt: PaymentReceipt,
    ) -> Result<ComputeId, Self::Error> {
        let url = self.cluster_url(cluster_id, "compute")?;
        let resp: ComputeResponse = self.paid(url, request, receipt).await?;
        Ok(resp.compute_id)
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), err)]
    async fn subscribe(&self, user_id: &UserId) -> Result<ComputeEvents, Self::Error> {
        let url = self.base_url.join(&format!("v1/users/{user_id}/events"))?;
        let (tx, events) = ComputeEvents::channel(64);
        tokio::spawn(poll_events(
            self.clients.retrying.clone(),
            url,
            tx,
            self.poll_interval,
        ));
        Ok(events)
    }
}

/// Long-polls `url` and forwards the events to `tx` until the receiver is dropped or polling
/// fails.
async fn poll_events(
    client: ClientWithMiddleware,
    url: Url,
    tx: mpsc::Sender<ComputeEvent>,
    poll_interval: Duration,
) {
    let mut cursor: Option<String> = None;
    loop {
        let mut req = client.get(url.clone());
        if let Some(cursor) = &cursor {
            req = req.query(&[("after", cursor)]);
        }
        let page: EventPage = tokio::select! {
            _ = tx.closed() => return,
            page = fetch(url.clone(), req) => match page {
                Ok(page) => page,
                Err(err) => {
                    error!(%err, "polling compute events failed, closing the event stream");
                    return;
                }
            },
        };
        let idle = page.events.is_empty();
        for event in page.events {
            debug!(?event, "received compute event");
            if tx.send(event).await.is_err() {
                return;
            }
        }
        if page.cursor.is_some() {
            cursor = page.cursor;
        }
        if idle {
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}
