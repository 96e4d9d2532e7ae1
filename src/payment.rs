//! Quoting and paying for operations.
//!
//! The [`PaymentGateway`] first asks the cluster for a [`Quote`] of an [`Operation`] and then
//! settles the quoted amount on the ledger. The resulting [`PaymentReceipt`] is the only way to
//! get the operation executed.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{Level, debug, warn};
use uuid::Uuid;

use crate::{
    cluster::{Cluster, ClusterId},
    error::BoxError,
    identity::{PartyIdentity, UserId},
    operation::{Fingerprint, Operation, OperationKind},
};

/// A price quote issued by the cluster for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Unique id of the quote, referenced by the payment transaction.
    pub id: Uuid,
    /// The cluster that issued the quote.
    pub cluster_id: ClusterId,
    /// The quoted operation.
    pub fingerprint: Fingerprint,
    /// Price in the smallest denomination of the ledger's token.
    pub amount: u64,
}

/// The hash of a settled ledger transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({self})")
    }
}

/// A ledger account address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// The address of the account controlled by `key`.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(hex::encode(&blake3::hash(key.as_bytes()).as_bytes()[..20]))
    }

    /// The hex representation of this address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A payment for a quoted resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// The chain this transaction is valid on.
    pub chain_id: String,
    /// The paying account.
    pub payer: Address,
    /// The paid amount.
    pub amount: u64,
    /// The resource paid for, the quote id.
    pub resource: Vec<u8>,
    /// The account sequence number (nonce) of the payer.
    pub sequence: u64,
}

impl Transaction {
    /// The canonical encoding which is signed by the payer.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(64 + self.chain_id.len() + self.resource.len());
        for field in [self.chain_id.as_bytes(), self.payer.as_str().as_bytes()] {
            bytes.extend((field.len() as u64).to_le_bytes());
            bytes.extend(field);
        }
        bytes.extend(self.amount.to_le_bytes());
        bytes.extend((self.resource.len() as u64).to_le_bytes());
        bytes.extend(&self.resource);
        bytes.extend(self.sequence.to_le_bytes());
        bytes
    }
}

/// A [`Transaction`] signed by the payer's wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    /// The transaction.
    pub tx: Transaction,
    /// The payer's public key.
    pub public_key: [u8; 32],
    /// Signature over [`Transaction::signing_bytes`].
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    /// Checks the signature and that the public key controls the payer address.
    pub fn verify(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.public_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        Address::from_verifying_key(&key) == self.tx.payer
            && key.verify(&self.tx.signing_bytes(), &signature).is_ok()
    }
}

/// Errors when loading a [`Wallet`].
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// The private key is not valid hex.
    #[error("private key is not valid hex")]
    InvalidHex(#[source] hex::FromHexError),
    /// The private key does not have 32 bytes.
    #[error("private key must be 32 bytes, got {len}")]
    InvalidLength {
        /// Number of decoded bytes.
        len: usize,
    },
}

/// The funding account used to pay for operations.
pub struct Wallet {
    key: SigningKey,
    address: Address,
}

impl Wallet {
    /// Loads the wallet from a hex encoded 32 byte private key.
    pub fn from_hex(private_key: &str) -> Result<Self, WalletError> {
        let bytes = hex::decode(private_key.trim()).map_err(WalletError::InvalidHex)?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| WalletError::InvalidLength { len: bytes.len() })?;
        let key = SigningKey::from_bytes(&bytes);
        let address = Address::from_verifying_key(&key.verifying_key());
        Ok(Self { key, address })
    }

    /// The address of this wallet.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Signs `tx`.
    pub fn sign(&self, tx: Transaction) -> SignedTransaction {
        let signature = self.key.sign(&tx.signing_bytes());
        SignedTransaction {
            tx,
            public_key: self.key.verifying_key().to_bytes(),
            signature: signature.to_bytes().to_vec(),
        }
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address)
            .field("key", &"<REDACTED>")
            .finish()
    }
}

/// The ledger on which operations are paid for.
pub trait Ledger: Send + Sync + 'static {
    /// The error raised by the ledger client.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The next sequence number expected for transactions from `address`.
    fn account_sequence(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send;

    /// Submits `tx` and returns once it is final.
    ///
    /// Implementations must return an error if the transaction was not included, e.g. due to
    /// insufficient funds, a rejected sequence number or a timeout.
    fn submit(
        &self,
        tx: SignedTransaction,
    ) -> impl Future<Output = Result<TxHash, Self::Error>> + Send;
}

/// Proof that the operation described by a [`Quote`] has been paid for.
///
/// A receipt is not `Clone` and is consumed by the call it pays for. Serialized receipts are
/// evidence of a settled payment, the client rejects them once they have been spent.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentReceipt {
    quote: Quote,
    tx_hash: TxHash,
    payer: UserId,
    payer_key: [u8; 32],
    signature: Vec<u8>,
}

/// A receipt presented for an operation it was not issued for.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReceiptMismatchError {
    /// The receipt pays for another kind of operation.
    #[error("receipt pays for a {paid} operation, but a {expected} operation was requested")]
    Kind {
        /// Kind of the requested operation.
        expected: OperationKind,
        /// Kind the receipt was issued for.
        paid: OperationKind,
    },
    /// The receipt pays for another operation of the same kind.
    #[error("receipt pays for operation {paid}, but the request is for {expected}")]
    Operation {
        /// The requested operation.
        expected: Fingerprint,
        /// The operation the receipt was issued for.
        paid: Fingerprint,
    },
    /// The receipt was issued by another cluster.
    #[error("receipt was issued by cluster {paid}, but the request targets {expected}")]
    Cluster {
        /// The targeted cluster.
        expected: ClusterId,
        /// The cluster the receipt was issued by.
        paid: ClusterId,
    },
    /// The receipt belongs to another user or its signature is invalid.
    #[error("receipt is not validly signed by user {expected}")]
    Payer {
        /// The presenting user.
        expected: UserId,
    },
    /// The receipt has already been used.
    #[error("receipt for transaction {tx_hash} has already been spent")]
    AlreadySpent {
        /// The transaction of the spent receipt.
        tx_hash: TxHash,
    },
}

impl PaymentReceipt {
    fn new(quote: Quote, tx_hash: TxHash, identity: &PartyIdentity) -> Self {
        let signature = identity
            .signer()
            .sign(&receipt_signing_bytes(&quote, &tx_hash));
        Self {
            quote,
            tx_hash,
            payer: identity.user_id().clone(),
            payer_key: identity.signer().verifying_key().to_bytes(),
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// The paid quote.
    pub fn quote(&self) -> &Quote {
        &self.quote
    }

    /// The kind of operation paid for.
    pub fn kind(&self) -> OperationKind {
        self.quote.fingerprint.kind
    }

    /// The paid amount.
    pub fn amount(&self) -> u64 {
        self.quote.amount
    }

    /// The settled payment transaction.
    pub fn tx_hash(&self) -> TxHash {
        self.tx_hash
    }

    /// The user who paid.
    pub fn payer(&self) -> &UserId {
        &self.payer
    }

    /// Checks that the receipt was signed by the key of [`PaymentReceipt::payer`].
    pub fn verify_signature(&self) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.payer_key) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        UserId::from_verifying_key(&key) == self.payer
            && key
                .verify(&receipt_signing_bytes(&self.quote, &self.tx_hash), &signature)
                .is_ok()
    }

    /// Checks that this receipt pays for `operation` on `cluster_id` by `payer`.
    pub fn check(
        &self,
        cluster_id: &ClusterId,
        operation: &Operation,
        payer: &UserId,
    ) -> Result<(), ReceiptMismatchError> {
        let expected = operation.fingerprint();
        let paid = self.quote.fingerprint;
        if expected.kind != paid.kind {
            return Err(ReceiptMismatchError::Kind {
                expected: expected.kind,
                paid: paid.kind,
            });
        }
        if expected != paid {
            return Err(ReceiptMismatchError::Operation { expected, paid });
        }
        if &self.quote.cluster_id != cluster_id {
            return Err(ReceiptMismatchError::Cluster {
                expected: *cluster_id,
                paid: self.quote.cluster_id,
            });
        }
        if &self.payer != payer || !self.verify_signature() {
            return Err(ReceiptMismatchError::Payer {
                expected: payer.clone(),
            });
        }
        Ok(())
    }
}

fn receipt_signing_bytes(quote: &Quote, tx_hash: &TxHash) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(16 + 32 + 32);
    bytes.extend(quote.id.as_bytes());
    bytes.extend(quote.fingerprint.digest.as_bytes());
    bytes.extend(tx_hash.0);
    bytes
}

/// Errors of [`PaymentGateway::quote_and_pay`].
#[derive(Debug, thiserror::Error)]
pub enum PaymentGatewayError {
    /// The cluster did not quote the operation.
    #[error("cluster rejected the quote request")]
    Quote(#[source] BoxError),
    /// The cluster quoted something else than what was requested.
    #[error("quote {quote_id} does not match the requested operation {requested}")]
    QuoteMismatch {
        /// The received quote.
        quote_id: Uuid,
        /// The requested operation.
        requested: Fingerprint,
    },
    /// The payment transaction did not finalize.
    #[error("payment of quote {quote_id} did not finalize")]
    Payment {
        /// The quote that could not be paid.
        quote_id: Uuid,
        /// The ledger error.
        source: BoxError,
    },
}

/// Quotes operations and pays for them from a [`Wallet`].
///
/// Payments from one gateway are submitted one at a time, the gateway tracks the wallet's
/// account sequence so that concurrent payments never reuse a sequence number.
pub struct PaymentGateway<L> {
    ledger: L,
    wallet: Wallet,
    chain_id: String,
    next_sequence: Mutex<Option<u64>>,
}

impl<L: Ledger> PaymentGateway<L> {
    /// Create a gateway paying from `wallet` on chain `chain_id`.
    pub fn new(ledger: L, wallet: Wallet, chain_id: impl Into<String>) -> Self {
        Self {
            ledger,
            wallet,
            chain_id: chain_id.into(),
            next_sequence: Mutex::new(None),
        }
    }

    /// The paying wallet.
    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    /// The ledger client.
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Quotes `operation` on `cluster_id` and pays for it.
    ///
    /// This is not idempotent, every successful call settles a payment. Callers must not retry a
    /// failed call without checking whether a payment for it was settled.
    #[tracing::instrument(level = Level::DEBUG, skip_all, fields(kind = %operation.kind()))]
    pub async fn quote_and_pay<C: Cluster>(
        &self,
        cluster: &C,
        identity: &PartyIdentity,
        cluster_id: &ClusterId,
        operation: &Operation,
    ) -> Result<PaymentReceipt, PaymentGatewayError> {
        let requested = operation.fingerprint();
        let quote = cluster
            .quote(cluster_id, operation)
            .await
            .map_err(|err| PaymentGatewayError::Quote(Box::new(err)))?;
        if quote.fingerprint != requested || &quote.cluster_id != cluster_id {
            return Err(PaymentGatewayError::QuoteMismatch {
                quote_id: quote.id,
                requested,
            });
        }
        debug!(quote_id = %quote.id, amount = quote.amount, "received quote");
        let tx_hash = self.pay(&quote).await?;
        debug!(quote_id = %quote.id, %tx_hash, "paid quote");
        Ok(PaymentReceipt::new(quote, tx_hash, identity))
    }

    async fn pay(&self, quote: &Quote) -> Result<TxHash, PaymentGatewayError> {
        let payment_err = |err: BoxError| PaymentGatewayError::Payment {
            quote_id: quote.id,
            source: err,
        };
        // held until the transaction is final so sequence numbers are never reused
        let mut next_sequence = self.next_sequence.lock().await;
        // left empty while submitting, a dropped submission may or may not have used it
        let sequence = match next_sequence.take() {
            Some(sequence) => sequence,
            None => self
                .ledger
                .account_sequence(&self.wallet.address)
                .await
                .map_err(|err| payment_err(Box::new(err)))?,
        };
        let tx = self.wallet.sign(Transaction {
            chain_id: self.chain_id.clone(),
            payer: self.wallet.address.clone(),
            amount: quote.amount,
            resource: quote.id.as_bytes().to_vec(),
            sequence,
        });
        match self.ledger.submit(tx).await {
            Ok(tx_hash) => {
                *next_sequence = Some(sequence + 1);
                Ok(tx_hash)
            }
            Err(err) => {
                warn!(%err, sequence, "payment transaction failed, refreshing account sequence");
                Err(payment_err(Box::new(err)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    #[test]
    fn wallet_from_hex() {
        let wallet = Wallet::from_hex(KEY).unwrap();
        assert_eq!(wallet.address().as_str().len(), 40);
        assert!(!format!("{wallet:?}").contains(KEY));
        assert!(matches!(
            Wallet::from_hex("zz"),
            Err(WalletError::InvalidHex(_))
        ));
        assert!(matches!(
            Wallet::from_hex("0102"),
            Err(WalletError::InvalidLength { len: 2 })
        ));
    }

    #[test]
    fn signed_transactions_verify() {
        let wallet = Wallet::from_hex(KEY).unwrap();
        let mut signed = wallet.sign(Transaction {
            chain_id: "test-chain".to_string(),
            payer: wallet.address().clone(),
            amount: 10,
            resource: vec![1, 2, 3],
            sequence: 0,
        });
        assert!(signed.verify());
        signed.tx.amount = 11;
        assert!(!signed.verify());
    }

    #[test]
    fn receipts_are_bound_to_their_operation() {
        let identity = PartyIdentity::from_seed("abc").unwrap();
        let cluster_id = ClusterId(Uuid::from_u128(1));
        let program = crate::program::ProgramArtifact::from_bytes(b"prg".to_vec());
        let operation = Operation::store_program(&program);
        let quote = Quote {
            id: Uuid::from_u128(2),
            cluster_id,
            fingerprint: operation.fingerprint(),
            amount: 5,
        };
        let receipt = PaymentReceipt::new(quote, TxHash([7; 32]), &identity);
        assert!(receipt.verify_signature());
        assert_eq!(
            receipt.check(&cluster_id, &operation, identity.user_id()),
            Ok(())
        );

        let other = Operation::store_program(&crate::program::ProgramArtifact::from_bytes(
            b"other".to_vec(),
        ));
        assert!(matches!(
            receipt.check(&cluster_id, &other, identity.user_id()),
            Err(ReceiptMismatchError::Operation { .. })
        ));
        assert!(matches!(
            receipt.check(&ClusterId(Uuid::from_u128(9)), &operation, identity.user_id()),
            Err(ReceiptMismatchError::Cluster { .. })
        ));
        let stranger = PartyIdentity::from_seed("xyz").unwrap();
        assert!(matches!(
            receipt.check(&cluster_id, &operation, stranger.user_id()),
            Err(ReceiptMismatchError::Payer { .. })
        ));
    }

    /// Reports sequence 7 and stalls the first submission forever.
    #[derive(Default)]
    struct StallingLedger {
        sequence_reads: AtomicUsize,
        submissions: AtomicUsize,
    }

    impl Ledger for StallingLedger {
        type Error = std::io::Error;

        async fn account_sequence(&self, _address: &Address) -> Result<u64, Self::Error> {
            self.sequence_reads.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        }

        async fn submit(&self, tx: SignedTransaction) -> Result<TxHash, Self::Error> {
            if self.submissions.fetch_add(1, Ordering::SeqCst) == 0 {
                std::future::pending::<()>().await;
            }
            Ok(TxHash([tx.tx.sequence as u8; 32]))
        }
    }

    #[tokio::test]
    async fn dropped_payment_refreshes_the_sequence() {
        let gateway = PaymentGateway::new(
            StallingLedger::default(),
            Wallet::from_hex(KEY).unwrap(),
            "test-chain",
        );
        let program = crate::program::ProgramArtifact::from_bytes(b"prg".to_vec());
        let quote = Quote {
            id: Uuid::from_u128(2),
            cluster_id: ClusterId(Uuid::from_u128(1)),
            fingerprint: Operation::store_program(&program).fingerprint(),
            amount: 5,
        };

        let stalled = tokio::time::timeout(Duration::from_millis(20), gateway.pay(&quote)).await;
        assert!(stalled.is_err());

        assert_eq!(gateway.pay(&quote).await.unwrap(), TxHash([7; 32]));
        assert_eq!(gateway.ledger().sequence_reads.load(Ordering::SeqCst), 2);
        assert_eq!(gateway.pay(&quote).await.unwrap(), TxHash([8; 32]));
        assert_eq!(gateway.ledger().sequence_reads.load(Ordering::SeqCst), 2);
    }
}
