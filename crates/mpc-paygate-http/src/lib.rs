//! JSON-over-HTTP collaborators for the `mpc-paygate` client.
//!
//! [`HttpCluster`] implements [`Cluster`] against the REST API of a cluster and [`HttpLedger`]
//! implements [`Ledger`] against the JSON gateway of the payment chain.
//!
//! Requests which are safe to repeat (quotes, account sequences, event polling) are sent through
//! a client with the [`RetryTransientMiddleware`]. Paid requests and payment transactions are
//! sent exactly once, a failure is reported to the caller which decides what to do with the
//! receipt.
//!
//! [`Cluster`]: mpc_paygate::cluster::Cluster
//! [`Ledger`]: mpc_paygate::payment::Ledger
use std::{fmt::Write, time::Duration};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::de::DeserializeOwned;
use url::Url;

mod cluster;
mod ledger;

pub use cluster::{EventPage, HttpCluster};
pub use ledger::HttpLedger;

/// Errors of the HTTP collaborators.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The request could not be sent or no response was received.
    #[error("failed request to {url}")]
    Request {
        /// The requested url.
        url: Url,
        /// The transport error.
        source: reqwest_middleware::Error,
    },
    /// The server answered with an error status.
    #[error("request to {url} failed with status {status}: {body}")]
    Status {
        /// The requested url.
        url: Url,
        /// The returned status.
        status: StatusCode,
        /// The returned body.
        body: String,
    },
    /// The response body could not be decoded.
    #[error("invalid response from {url}")]
    Response {
        /// The requested url.
        url: Url,
        /// The decoding error.
        source: reqwest::Error,
    },
    /// A url could not be built from the base url.
    #[error("unable to build request url")]
    Url(#[from] url::ParseError),
    /// The ledger returned a malformed transaction hash.
    #[error("invalid transaction hash {0:?}")]
    TxHash(String),
}

/// The pair of clients used by the collaborators.
#[derive(Debug, Clone)]
pub(crate) struct Clients {
    /// Retries transient failures.
    pub(crate) retrying: ClientWithMiddleware,
    /// Sends every request exactly once.
    pub(crate) once: ClientWithMiddleware,
}

impl Clients {
    pub(crate) fn new(total_retry_duration: Duration) -> anyhow::Result<Self> {
        #[allow(unused_mut)]
        let mut builder = reqwest::ClientBuilder::new();

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        {
            builder = builder.tcp_user_timeout(Duration::from_secs(60));
        }

        let reqwest_client = builder.build().context("unable to build HTTP client")?;
        let retry_policy =
            ExponentialBackoff::builder().build_with_total_retry_duration(total_retry_duration);
        let retrying = reqwest_middleware::ClientBuilder::new(reqwest_client.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let once = reqwest_middleware::ClientBuilder::new(reqwest_client).build();
        Ok(Self { retrying, once })
    }
}

/// Sends `req` and decodes the JSON response.
pub(crate) async fn fetch<T: DeserializeOwned>(
    url: Url,
    req: RequestBuilder,
) -> Result<T, HttpError> {
    let resp = req.send().await.map_err(|err| HttpError::Request {
        url: url.clone(),
        source: err,
    })?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp
            .text()
            .await
            .unwrap_or_else(|err| format_error_chain(&err));
        return Err(HttpError::Status { url, status, body });
    }
    resp.json()
        .await
        .map_err(|err| HttpError::Response { url, source: err })
}

pub(crate) fn format_error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = anyhow::Chain::new(err).peekable();
    let mut f = String::new();
    if let Some(err) = chain.next() {
        let _ = writeln!(&mut f, "Error: {err}");
    }
    if chain.peek().is_some() {
        let _ = writeln!(&mut f, "\nCaused by:");
    }
    for err in chain {
        let _ = writeln!(&mut f, "\t{err}");
    }
    f
}
