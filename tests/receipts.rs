mod common;

use common::{labels, setup};
use mpc_paygate::{
    ErrorKind, Stage,
    operation::Operation,
    payment::{PaymentReceipt, ReceiptMismatchError},
    permissions::Permissions,
    program::ProgramArtifact,
};

#[tokio::test]
async fn receipt_for_another_operation_is_rejected() {
    let (client, cluster, _) = setup("abc", 100);
    let first = ProgramArtifact::from_bytes(b"first".to_vec());
    let second = ProgramArtifact::from_bytes(b"second".to_vec());
    let receipt = client.pay(&Operation::store_program(&first)).await.unwrap();
    let tx_hash = receipt.tx_hash();

    let err = client
        .store_program("p", &second, receipt)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Stage::ProgramStore);
    assert!(matches!(
        err.kind(),
        ErrorKind::ReceiptMismatch(ReceiptMismatchError::Operation { .. })
    ));
    assert_eq!(err.charged(), Some(tx_hash));
    assert_eq!(cluster.receipts_spent(), 0);
}

#[tokio::test]
async fn receipt_for_another_kind_is_rejected() {
    let (client, cluster, _) = setup("abc", 100);
    let artifact = ProgramArtifact::from_bytes(b"p".to_vec());
    let receipt = client.pay(&Operation::store_program(&artifact)).await.unwrap();
    let permissions = Permissions::default_for_user(client.user_id().clone());

    let err = client
        .store_values(&labels(), &permissions, receipt)
        .await
        .unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::ReceiptMismatch(ReceiptMismatchError::Kind { .. })
    ));
    assert_eq!(cluster.receipts_spent(), 0);
}

#[tokio::test]
async fn receipt_of_another_user_is_rejected() {
    let (alice, _, _) = setup("alice", 100);
    let (bob, _, _) = setup("bob", 100);
    let artifact = ProgramArtifact::from_bytes(b"p".to_vec());
    let receipt = alice.pay(&Operation::store_program(&artifact)).await.unwrap();

    let err = bob.store_program("p", &artifact, receipt).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::ReceiptMismatch(ReceiptMismatchError::Payer { .. })
    ));
}

#[tokio::test]
async fn persisted_copy_of_a_spent_receipt_is_rejected() {
    let (client, cluster, _) = setup("abc", 100);
    let artifact = ProgramArtifact::from_bytes(b"p".to_vec());
    let receipt = client.pay(&Operation::store_program(&artifact)).await.unwrap();
    let persisted = serde_json::to_string(&receipt).unwrap();
    let tx_hash = receipt.tx_hash();

    client.store_program("p", &artifact, receipt).await.unwrap();
    let copy: PaymentReceipt = serde_json::from_str(&persisted).unwrap();
    let err = client
        .store_program("p", &artifact, copy)
        .await
        .unwrap_err();
    let ErrorKind::ReceiptMismatch(ReceiptMismatchError::AlreadySpent { tx_hash: spent }) =
        err.kind()
    else {
        panic!("expected an already spent receipt, got {err:?}");
    };
    assert_eq!(*spent, tx_hash);
    assert_eq!(cluster.receipts_spent(), 1);
}

#[tokio::test]
async fn receipt_survives_a_failed_upload() {
    let (client, cluster, ledger) = setup("abc", 100);
    cluster.fail_next_requests(1);
    let artifact = ProgramArtifact::from_bytes(b"p".to_vec());
    let receipt = client.pay(&Operation::store_program(&artifact)).await.unwrap();
    let persisted = serde_json::to_string(&receipt).unwrap();
    let tx_hash = receipt.tx_hash();

    let err = client
        .store_program("p", &artifact, receipt)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Stage::ProgramStore);
    assert!(matches!(err.kind(), ErrorKind::Upload(_)), "{err:?}");
    assert_eq!(err.charged(), Some(tx_hash));

    // retrying with the persisted receipt does not pay again
    let copy: PaymentReceipt = serde_json::from_str(&persisted).unwrap();
    let program = client.store_program("p", &artifact, copy).await.unwrap();
    assert_eq!(cluster.program(&program.id), Some(b"p".to_vec()));
    assert_eq!(ledger.transaction_count(), 1);
    assert_eq!(cluster.receipts_spent(), 1);
}

#[tokio::test]
async fn cluster_rejects_receipts_of_other_clients() {
    let (client, cluster, _) = setup("abc", 100);
    let artifact = ProgramArtifact::from_bytes(b"p".to_vec());
    let receipt = client.pay(&Operation::store_program(&artifact)).await.unwrap();
    let persisted = serde_json::to_string(&receipt).unwrap();
    client.store_program("p", &artifact, receipt).await.unwrap();

    // a second client with the same identity does not know the receipt was spent
    let copy: PaymentReceipt = serde_json::from_str(&persisted).unwrap();
    let twin = mpc_paygate::ClusterClient::new(
        &common::config("abc"),
        cluster.clone(),
        cluster.ledger().clone(),
    )
    .unwrap();
    let err = twin
        .store_program("p", &artifact, copy)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Upload(_)), "{err:?}");
    assert_eq!(cluster.receipts_spent(), 1);
}

#[tokio::test]
async fn persisted_copy_of_a_spent_values_receipt_is_rejected() {
    let (client, cluster, ledger) = setup("abc", 100);
    let permissions = Permissions::default_for_user(client.user_id().clone());
    let operation = Operation::store_values(&labels()).unwrap();
    let receipt = client.pay(&operation).await.unwrap();
    let persisted = serde_json::to_string(&receipt).unwrap();
    let tx_hash = receipt.tx_hash();

    client
        .store_values(&labels(), &permissions, receipt)
        .await
        .unwrap();
    let copy: PaymentReceipt = serde_json::from_str(&persisted).unwrap();
    let err = client
        .store_values(&labels(), &permissions, copy)
        .await
        .unwrap_err();
    assert_eq!(err.stage(), Stage::SecretStore);
    assert!(matches!(
        err.kind(),
        ErrorKind::ReceiptMismatch(ReceiptMismatchError::AlreadySpent { tx_hash: spent })
            if *spent == tx_hash
    ));
    assert_eq!(err.charged(), Some(tx_hash));
    assert_eq!(cluster.receipts_spent(), 1);
    assert_eq!(ledger.transaction_count(), 1);
}
