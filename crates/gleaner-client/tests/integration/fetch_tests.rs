//! Record retrieval: primary POST, fallback GET.

use gleaner_client::CswClient;
use gleaner_core::fetch::retrieve;
use gleaner_core::traits::RecordFetcher;
use gleaner_core::{AppError, FetchFailure};
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::integration::common::{
    CSW_PATH, catalog, connect, exception_report, http_config, record_response, source, xml,
};

fn post_record(guid: &str) -> wiremock::MockBuilder {
    Mock::given(method("POST"))
        .and(path(CSW_PATH))
        .and(body_string_contains(format!("<csw:Id>{}</csw:Id>", guid)))
}

fn get_record(guid: &str) -> wiremock::MockBuilder {
    Mock::given(method("GET"))
        .and(path(CSW_PATH))
        .and(query_param("REQUEST", "GetRecordById"))
        .and(query_param("id", guid))
}

#[tokio::test]
async fn test_primary_success_skips_fallback() {
    let server = catalog().await;
    post_record("rec-1")
        .respond_with(xml(record_response("rec-1")))
        .expect(1)
        .mount(&server)
        .await;
    get_record("rec-1")
        .respond_with(xml(record_response("rec-1")))
        .expect(0)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let content = retrieve(&client, "rec-1").await.unwrap();

    assert!(content.starts_with("<gmd:MD_Metadata"));
    assert!(content.contains("rec-1"));
    assert!(content.ends_with("</gmd:MD_Metadata>"));
    assert!(!content.contains("GetRecordByIdResponse"));
}

#[tokio::test]
async fn test_primary_failure_uses_fallback_once() {
    let server = catalog().await;
    post_record("rec-1")
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    get_record("rec-1")
        .respond_with(xml(record_response("rec-1")))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let content = retrieve(&client, "rec-1").await.unwrap();

    assert!(content.contains("rec-1"));
}

#[tokio::test]
async fn test_both_requests_failing_is_a_retrieval_failure() {
    let server = catalog().await;
    post_record("rec-1")
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    get_record("rec-1")
        .respond_with(xml(exception_report("No record")))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let failure = retrieve(&client, "rec-1").await.unwrap_err();

    match failure {
        FetchFailure::Retrieval {
            guid,
            primary,
            fallback,
        } => {
            assert_eq!(guid, "rec-1");
            assert!(primary.contains("503"));
            assert!(fallback.contains("No record"));
        }
        other => panic!("expected a retrieval failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_response_is_empty_record() {
    let server = catalog().await;
    post_record("rec-1")
        .respond_with(xml(
            r#"<csw:GetRecordByIdResponse xmlns:csw="http://www.opengis.net/cat/csw/2.0.2"/>"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    get_record("rec-1")
        .respond_with(xml(record_response("rec-1")))
        .expect(0)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let failure = retrieve(&client, "rec-1").await.unwrap_err();

    assert_eq!(failure.reason(), "empty_record");
}

#[tokio::test]
async fn test_fetch_fallback_reads_kvp_response() {
    let server = catalog().await;
    get_record("a b")
        .respond_with(xml(record_response("a b")))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let record = client.fetch_fallback("a b").await.unwrap().unwrap();

    assert_eq!(record.document_element.as_deref(), Some("MD_Metadata"));
    assert!(record.content.contains("xmlns:gmd="));
}

#[tokio::test]
async fn test_connect_rejects_non_capabilities_document() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CSW_PATH))
        .respond_with(xml(
            r#"<csw:GetRecordsResponse xmlns:csw="http://www.opengis.net/cat/csw/2.0.2"/>"#,
        ))
        .mount(&server)
        .await;

    let result = CswClient::connect(&source(&server), http_config()).await;

    assert!(matches!(result, Err(AppError::ClientError(_))));
}
