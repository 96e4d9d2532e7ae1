use std::time::Duration;

use mpc_paygate::payment::{Address, Ledger, SignedTransaction, TxHash};
use serde::{Deserialize, Serialize};
use tracing::Level;
use url::Url;

use crate::{Clients, HttpError, fetch};

/// A [`Ledger`] reached over the JSON gateway of the payment chain.
///
/// `GET accounts/{address}/sequence` returns `{"sequence": n}` and `POST txs` with a signed
/// transaction returns `{"tx_hash": "<hex>"}` once the transaction is committed.
#[derive(Debug, Clone)]
pub struct HttpLedger {
    endpoint: Url,
    clients: Clients,
}

#[derive(Debug, Deserialize)]
struct SequenceResponse {
    sequence: u64,
}

#[derive(Debug, Serialize)]
struct BroadcastRequest<'a> {
    tx: &'a SignedTransaction,
    mode: &'static str,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    tx_hash: String,
}

impl HttpLedger {
    /// A ledger client for the gateway at `endpoint`.
    pub fn new(endpoint: Url) -> anyhow::Result<Self> {
        Ok(Self {
            endpoint,
            clients: Clients::new(Duration::from_secs(60))?,
        })
    }
}

impl Ledger for HttpLedger {
    type Error = HttpError;

    #[tracing::instrument(level = Level::DEBUG, skip(self), err)]
    async fn account_sequence(&self, address: &Address) -> Result<u64, Self::Error> {
        let url = self
            .endpoint
            .join(&format!("accounts/{address}/sequence"))?;
        let req = self.clients.retrying.get(url.clone());
        let resp: SequenceResponse = fetch(url, req).await?;
        Ok(resp.sequence)
    }

    #[tracing::instrument(level = Level::DEBUG, skip_all, fields(sequence = tx.tx.sequence), err)]
    async fn submit(&self, tx: SignedTransaction) -> Result<TxHash, Self::Error> {
        let url = self.endpoint.join("txs")?;
        let body = BroadcastRequest {
            tx: &tx,
            mode: "commit",
        };
        let req = self.clients.once.post(url.clone()).json(&body);
        let resp: BroadcastResponse = fetch(url, req).await?;
        parse_tx_hash(&resp.tx_hash)
    }
}

fn parse_tx_hash(hex_hash: &str) -> Result<TxHash, HttpError> {
    let invalid = || HttpError::TxHash(hex_hash.to_string());
    let bytes = hex::decode(hex_hash).map_err(|_| invalid())?;
    let bytes = bytes.try_into().map_err(|_| invalid())?;
    Ok(TxHash(bytes))
}
