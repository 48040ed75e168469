//! End-to-end tests against mock token, FHIR, transfer and compliance endpoints
//!
//! Every test builds a full [`Runtime`] on in-memory stores and talks to a
//! `mockito` server standing in for the national exchange.

use carelink::adapters::audit_file::FileAuditLog;
use carelink::adapters::notification::RecordingNotifier;
use carelink::adapters::storage::{AuditSink, ClinicalRecordStore, MappingStore, MemoryStore, Stores};
use carelink::config::{parse_config, CarelinkConfig};
use carelink::core::audit::verify_chain;
use carelink::core::sync::ReconcileOutcome;
use carelink::domain::{
    AuditAction, CanonicalRecord, ComplianceItemInput, ConnectionId, CorrelationId,
    MedicationTransferPayload, NhsNumber, Notification, PatientId, SyncStatus, TransferStatus,
    TransferredMedication,
};
use carelink::runtime::Runtime;
use mockito::{Matcher, Server, ServerGuard};
use serde_json::{json, Value};
use std::sync::Arc;

const NHS: &str = "9434765919";

fn config(server: &ServerGuard, extra: &str) -> CarelinkConfig {
    let url = server.url();
    parse_config(&format!(
        r#"
[[connections]]
id = "practice-a"
organization_code = "A81001"
token_url = "{url}/oauth2/token"
client_id = "carelink"
client_secret = "s3cret"
fhir_base_url = "{url}/R4"
transfer_url = "{url}/transfers"
compliance_url = "{url}/submissions"

[fhir.retry]
max_attempts = 2
initial_delay_ms = 10
max_delay_ms = 20
jitter = false

[transfer]
max_attempts = 3
initial_backoff_ms = 20
max_backoff_ms = 40
timeout_seconds = 5

[compliance.retry]
max_attempts = 1
initial_delay_ms = 10
max_delay_ms = 10

[[compliance.schemas]]
kind = "falls"
required = {{ resident_count = "integer", falls = "array" }}
{extra}
"#
    ))
    .unwrap()
}

fn token_mock(server: &mut ServerGuard) -> mockito::Mock {
    server
        .mock("POST", "/oauth2/token")
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "client_credentials".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"tok-1","token_type":"Bearer","expires_in":3600}"#)
}

fn patient_bundle(family: &str) -> String {
    json!({
        "resourceType": "Bundle",
        "entry": [
            {
                "resource": {
                    "resourceType": "Patient",
                    "id": "pat-1",
                    "identifier": [{"system": "https://fhir.nhs.uk/Id/nhs-number", "value": NHS}],
                    "name": [{"use": "official", "family": family, "given": ["Jane"]}],
                    "birthDate": "1970-04-01"
                },
                "search": {"mode": "match"}
            },
            {
                "resource": {
                    "resourceType": "MedicationStatement",
                    "id": "m-1",
                    "status": "active",
                    "medicationCodeableConcept": {"text": "Amoxicillin 500mg capsules"}
                },
                "search": {"mode": "include"}
            }
        ]
    })
    .to_string()
}

async fn runtime_with(
    config: &CarelinkConfig,
    stores: Stores,
) -> (Runtime, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::new());
    let runtime = Runtime::with_stores(config, stores, notifier.clone())
        .await
        .unwrap();
    (runtime, notifier)
}

fn local_fields() -> CanonicalRecord {
    let mut fields = CanonicalRecord::new();
    fields.insert(
        "clinical.medications".to_string(),
        json!([{"id": "local-1", "label": "Metformin 500mg tablets"}]),
    );
    fields.insert("demographics.family_name".to_string(), json!("Smyth"));
    fields
}

fn transfer_payload(version: &str) -> MedicationTransferPayload {
    MedicationTransferPayload {
        patient: NhsNumber::parse(NHS).unwrap(),
        medication_list_version: version.into(),
        source_organization: "A81001".into(),
        destination_organization: "FA123".into(),
        medications: vec![TransferredMedication {
            name: "Metformin 500mg tablets".into(),
            code: Some("325278007".into()),
            dosage: Some("One tablet twice daily".into()),
            quantity: Some("56 tablets".into()),
        }],
        notes: None,
    }
}

#[tokio::test]
async fn test_reconcile_end_to_end_with_file_audit() {
    let mut server = Server::new_async().await;
    let token = token_mock(&mut server).expect(1).create_async().await;
    let fhir = server
        .mock("GET", "/R4/Patient")
        .match_query(Matcher::UrlEncoded(
            "identifier".into(),
            format!("https://fhir.nhs.uk/Id/nhs-number|{NHS}"),
        ))
        .match_header("authorization", "Bearer tok-1")
        .with_status(200)
        .with_body(patient_bundle("Smith"))
        .expect(2)
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let store = Arc::new(MemoryStore::new());
    let patient = PatientId::new("res-1").unwrap();
    store
        .insert_patient(patient.clone(), Some(NHS), local_fields())
        .await;
    let stores = Stores::in_memory(store.clone())
        .with_audit_sink(Arc::new(FileAuditLog::open(&audit_path).unwrap()));

    let config = config(&server, "");
    let (runtime, _) = runtime_with(&config, stores).await;
    let sync = runtime.sync_orchestrator("practice-a").unwrap();

    let first = CorrelationId::new();
    let outcome = sync.reconcile(&patient, first).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { version: 1, .. }));

    // Externally owned demographics overwritten, local medications kept
    let fields = store.load_fields(&patient).await.unwrap();
    assert_eq!(fields["demographics.family_name"], json!("Smith"));
    assert_eq!(
        fields["clinical.medications"],
        json!([{"id": "local-1", "label": "Metformin 500mg tablets"}])
    );
    let mapping = store.load_mapping(&patient).await.unwrap().unwrap();
    assert_eq!(mapping.sync_status, SyncStatus::Synced);
    assert_eq!(mapping.version, 1);

    // Same remote content: nothing written, token reused
    let outcome = sync.reconcile(&patient, CorrelationId::new()).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Unchanged { version: 1 });
    assert_eq!(store.record_write_count(), 1);

    token.assert_async().await;
    fhir.assert_async().await;

    // The chain survives a reopen of the file
    let reopened = FileAuditLog::open(&audit_path).unwrap();
    let entries = reopened.all_entries().await.unwrap();
    assert!(verify_chain(&entries).is_intact());
    let trail: Vec<AuditAction> = reopened
        .entries_for(&first)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert!(trail.contains(&AuditAction::TokenExchange));
    assert!(trail.contains(&AuditAction::RecordFetch));
    assert!(trail.contains(&AuditAction::ReconciliationApply));
}

#[tokio::test]
async fn test_reconcile_unknown_patient_notifies() {
    let mut server = Server::new_async().await;
    let _token = token_mock(&mut server).create_async().await;
    let _mock = server
        .mock("GET", "/R4/Patient")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({"resourceType": "Bundle", "entry": []}).to_string())
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    let patient = PatientId::new("res-2").unwrap();
    store
        .insert_patient(patient.clone(), Some(NHS), CanonicalRecord::new())
        .await;
    let config = config(&server, "");
    let (runtime, notifier) = runtime_with(&config, Stores::in_memory(store.clone())).await;

    let err = runtime
        .sync_orchestrator("practice-a")
        .unwrap()
        .reconcile(&patient, CorrelationId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, carelink::domain::CarelinkError::NotFound(_)));
    assert!(notifier
        .events()
        .iter()
        .any(|n| matches!(n, Notification::PatientNotFound { patient_id } if patient_id == &patient)));
    assert_eq!(store.record_write_count(), 0);
}

#[tokio::test]
async fn test_rejected_credentials_degrade_connection() {
    let mut server = Server::new_async().await;
    let token = server
        .mock("POST", "/oauth2/token")
        .with_status(401)
        .with_body(r#"{"error":"invalid_client"}"#)
        .expect(1)
        .create_async()
        .await;
    let store = Arc::new(MemoryStore::new());
    let patient = PatientId::new("res-3").unwrap();
    store
        .insert_patient(patient.clone(), Some(NHS), CanonicalRecord::new())
        .await;
    let config = config(&server, "");
    let (runtime, notifier) = runtime_with(&config, Stores::in_memory(store)).await;
    let sync = runtime.sync_orchestrator("practice-a").unwrap();

    assert!(sync.reconcile(&patient, CorrelationId::new()).await.is_err());
    // Degraded: the second call fails without another exchange
    let err = sync.reconcile(&patient, CorrelationId::new()).await.unwrap_err();
    assert!(matches!(
        err,
        carelink::domain::CarelinkError::ConnectionUnavailable { .. }
    ));
    token.assert_async().await;

    let id = ConnectionId::new("practice-a").unwrap();
    assert_eq!(
        runtime.auth().status(&id).await.unwrap(),
        carelink::domain::ConnectionStatus::Degraded
    );
    assert!(notifier
        .events()
        .iter()
        .any(|n| matches!(n, Notification::ConnectionDegraded { .. })));
}

#[tokio::test]
async fn test_transfer_is_sent_once_per_key() {
    let mut server = Server::new_async().await;
    let _token = token_mock(&mut server).create_async().await;
    let transfer = server
        .mock("POST", "/transfers")
        .match_header("idempotency-key", Matcher::Regex("^[0-9a-f]{64}$".into()))
        .with_status(201)
        .with_body(r#"{"acknowledgementId":"ack-1"}"#)
        .expect(1)
        .create_async()
        .await;

    let config = config(&server, "");
    let store = Arc::new(MemoryStore::new());
    let (runtime, _) = runtime_with(&config, Stores::in_memory(store)).await;
    let connection = ConnectionId::new("practice-a").unwrap();
    let gateway = runtime.gateway();

    let first = gateway
        .submit_transfer(&connection, transfer_payload("v7"), CorrelationId::new())
        .await
        .unwrap();
    assert_eq!(first.status, TransferStatus::Acked);
    assert!(!first.duplicate);

    let second = gateway
        .submit_transfer(&connection, transfer_payload("v7"), CorrelationId::new())
        .await
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(second.key, first.key);
    assert_eq!(
        second.acknowledgement.map(|a| a.acknowledgement_id),
        Some("ack-1".to_string())
    );

    transfer.assert_async().await;
}

#[tokio::test]
async fn test_transfer_retries_transient_failure() {
    let mut server = Server::new_async().await;
    let _token = token_mock(&mut server).create_async().await;
    let failing = server
        .mock("POST", "/transfers")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;
    // Serves requests once the failing mock has used up its single hit
    let ok = server
        .mock("POST", "/transfers")
        .with_status(201)
        .with_body(r#"{"acknowledgementId":"ack-2"}"#)
        .create_async()
        .await;

    let config = config(&server, "");
    let (runtime, _) = runtime_with(&config, Stores::in_memory(Arc::new(MemoryStore::new()))).await;
    let connection = ConnectionId::new("practice-a").unwrap();

    let outcome = runtime
        .gateway()
        .submit_transfer(&connection, transfer_payload("v8"), CorrelationId::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, TransferStatus::Pending);

    let settled = runtime.gateway().await_settled(&outcome.key).await.unwrap();
    assert_eq!(settled.status, TransferStatus::Acked);
    assert_eq!(settled.retry_count, 1);

    failing.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn test_revocation_cancels_pending_transfer() {
    let mut server = Server::new_async().await;
    let _token = token_mock(&mut server).create_async().await;
    let _transfer = server
        .mock("POST", "/transfers")
        .with_status(503)
        .create_async()
        .await;

    let mut config = config(&server, "");
    config.transfer.initial_backoff_ms = 30_000;
    config.transfer.max_backoff_ms = 60_000;
    let (runtime, notifier) =
        runtime_with(&config, Stores::in_memory(Arc::new(MemoryStore::new()))).await;
    let connection = ConnectionId::new("practice-a").unwrap();

    let outcome = runtime
        .gateway()
        .submit_transfer(&connection, transfer_payload("v9"), CorrelationId::new())
        .await
        .unwrap();
    assert_eq!(outcome.status, TransferStatus::Pending);

    let cancelled = runtime
        .gateway()
        .revoke_connection(&connection, "contract ended", CorrelationId::new())
        .await
        .unwrap();
    assert_eq!(cancelled, 1);

    let settled = runtime.gateway().await_settled(&outcome.key).await.unwrap();
    assert_eq!(settled.status, TransferStatus::Failed);
    assert!(settled
        .failure_reason
        .unwrap_or_default()
        .contains("revoked"));
    assert!(notifier
        .events()
        .iter()
        .any(|n| matches!(n, Notification::ConnectionRevoked { reason, .. } if reason == "contract ended")));
}

fn falls_item(id: &str, payload: Value) -> ComplianceItemInput {
    ComplianceItemInput {
        item_id: id.into(),
        kind: "falls".into(),
        payload,
    }
}

#[tokio::test]
async fn test_compliance_batch_with_one_invalid_item() {
    let mut server = Server::new_async().await;
    let _token = token_mock(&mut server).create_async().await;
    let first_run = server
        .mock("POST", "/submissions")
        .match_body(Matcher::Regex("falls-1".into()))
        .with_status(200)
        .with_body(
            json!({
                "results": (1..=5)
                    .map(|i| json!({"itemId": format!("falls-{i}"), "accepted": true}))
                    .collect::<Vec<_>>()
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let second_run = server
        .mock("POST", "/submissions")
        .match_body(Matcher::Regex("falls-6".into()))
        .with_status(200)
        .with_body(r#"{"results":[{"itemId":"falls-6","accepted":true}]}"#)
        .expect(1)
        .create_async()
        .await;

    let config = config(&server, "");
    let (runtime, notifier) =
        runtime_with(&config, Stores::in_memory(Arc::new(MemoryStore::new()))).await;
    let submitter = runtime.compliance_submitter("practice-a").unwrap();
    let period = "2026-10".parse().unwrap();

    let mut items: Vec<ComplianceItemInput> = (1..=5)
        .map(|i| falls_item(&format!("falls-{i}"), json!({"resident_count": 40, "falls": []})))
        .collect();
    items.push(falls_item("falls-6", json!({"falls": []})));

    let summary = submitter
        .submit(&period, items.clone(), CorrelationId::new())
        .await
        .unwrap();
    assert_eq!(summary.submitted, 5);
    assert_eq!(summary.invalid, 1);
    assert!(!summary.is_complete());
    assert!(notifier.events().iter().any(|n| matches!(
        n,
        Notification::ComplianceItemInvalid { item_id, .. } if item_id == "falls-6"
    )));

    // Corrected item goes out alone; accepted items are not resent
    items[5] = falls_item("falls-6", json!({"resident_count": 12, "falls": []}));
    let summary = submitter
        .submit(&period, items, CorrelationId::new())
        .await
        .unwrap();
    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.previously_submitted, 5);
    assert!(summary.is_complete());

    first_run.assert_async().await;
    second_run.assert_async().await;
}

#[tokio::test]
async fn test_deactivated_mapping_makes_no_call() {
    let mut server = Server::new_async().await;
    let _token = token_mock(&mut server).create_async().await;
    let fhir = server
        .mock("GET", "/R4/Patient")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(patient_bundle("Smith"))
        .expect(1)
        .create_async()
        .await;

    let store = Arc::new(MemoryStore::new());
    let patient = PatientId::new("res-4").unwrap();
    store
        .insert_patient(patient.clone(), Some(NHS), CanonicalRecord::new())
        .await;
    let config = config(&server, "");
    let (runtime, _) = runtime_with(&config, Stores::in_memory(store)).await;
    let sync = runtime.sync_orchestrator("practice-a").unwrap();

    sync.reconcile(&patient, CorrelationId::new()).await.unwrap();
    sync.deactivate(&patient, CorrelationId::new()).await.unwrap();
    let err = sync.reconcile(&patient, CorrelationId::new()).await.unwrap_err();
    assert!(matches!(err, carelink::domain::CarelinkError::Validation(_)));

    fhir.assert_async().await;
}
