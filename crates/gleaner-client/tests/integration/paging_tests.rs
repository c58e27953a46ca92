//! Identifier paging against a scripted catalog.

use gleaner_core::{AppError, IdentifierError};
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use crate::integration::common::{
    CSW_PATH, catalog, connect, exception_report, http_config, list, ok_ids, records_page, xml,
};

fn post_page(start: u64) -> wiremock::MockBuilder {
    Mock::given(method("POST"))
        .and(path(CSW_PATH))
        .and(body_string_contains("<csw:GetRecords "))
        .and(body_string_contains(format!("startPosition=\"{}\"", start)))
}

fn get_page(start: u64) -> wiremock::MockBuilder {
    Mock::given(method("GET"))
        .and(path(CSW_PATH))
        .and(query_param("REQUEST", "GetRecords"))
        .and(query_param("startPosition", start.to_string()))
}

fn any_get_records() -> wiremock::MockBuilder {
    Mock::given(method("GET"))
        .and(path(CSW_PATH))
        .and(query_param("REQUEST", "GetRecords"))
}

#[tokio::test]
async fn test_multi_page_listing_over_post() {
    let server = catalog().await;
    post_page(1)
        .respond_with(xml(records_page(5, 3, &["a", "b"])))
        .expect(1)
        .mount(&server)
        .await;
    post_page(3)
        .respond_with(xml(records_page(5, 5, &["c", "d"])))
        .expect(1)
        .mount(&server)
        .await;
    post_page(5)
        .respond_with(xml(records_page(5, 0, &["e"])))
        .expect(1)
        .mount(&server)
        .await;
    any_get_records()
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let items = list(&client, None).await;

    assert_eq!(ok_ids(&items), vec!["a", "b", "c", "d", "e"]);
    assert_eq!(items.len(), 5);
}

#[tokio::test]
async fn test_paging_stops_at_records_matched() {
    let server = catalog().await;
    post_page(1)
        .respond_with(xml(records_page(4, 3, &["a", "b"])))
        .mount(&server)
        .await;
    // nextRecord still points further; the matched count wins.
    post_page(3)
        .respond_with(xml(records_page(4, 5, &["c", "d"])))
        .mount(&server)
        .await;
    post_page(5)
        .respond_with(xml(records_page(4, 7, &["ghost"])))
        .expect(0)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let items = list(&client, None).await;

    assert_eq!(ok_ids(&items), vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_html_post_switches_rest_of_pass_to_get() {
    let server = catalog().await;
    Mock::given(method("POST"))
        .and(path(CSW_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<!DOCTYPE html><html><body>Method not allowed</body></html>"),
        )
        .expect(1)
        .mount(&server)
        .await;
    get_page(1)
        .respond_with(xml(records_page(3, 3, &["a", "b"])))
        .expect(1)
        .mount(&server)
        .await;
    get_page(3)
        .respond_with(xml(records_page(3, 0, &["c"])))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let items = list(&client, None).await;

    assert_eq!(ok_ids(&items), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_transient_page_failure_is_retried() {
    let server = catalog().await;
    // Registered first, so it answers the first request only.
    post_page(1)
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    post_page(1)
        .respond_with(xml(records_page(1, 0, &["a"])))
        .expect(1)
        .mount(&server)
        .await;
    any_get_records()
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let client = connect(&server, http_config().with_page_retries(1)).await;
    let items = list(&client, None).await;

    assert_eq!(ok_ids(&items), vec!["a"]);
}

#[tokio::test]
async fn test_exception_on_first_page_fails_the_listing() {
    let server = catalog().await;
    post_page(1)
        .respond_with(xml(exception_report("bad constraint")))
        .expect(1)
        .mount(&server)
        .await;
    get_page(1)
        .respond_with(xml(exception_report("bad constraint")))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let items = list(&client, Some("AnyText lik 'x'")).await;

    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(IdentifierError::Transport(AppError::CatalogException(message))) => {
            assert_eq!(message, "bad constraint")
        }
        other => panic!("expected a transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_exception_after_first_page_ends_the_listing() {
    let server = catalog().await;
    post_page(1)
        .respond_with(xml(records_page(10, 3, &["a", "b"])))
        .expect(1)
        .mount(&server)
        .await;
    post_page(3)
        .respond_with(xml(exception_report("Start position 3 greater than matches")))
        .expect(1)
        .mount(&server)
        .await;
    get_page(3)
        .respond_with(xml(exception_report("Start position 3 greater than matches")))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let items = list(&client, None).await;

    assert_eq!(items.len(), 2);
    assert_eq!(ok_ids(&items), vec!["a", "b"]);
}

#[tokio::test]
async fn test_unavailable_catalog_ends_with_transport_error() {
    let server = catalog().await;
    post_page(1)
        .respond_with(xml(records_page(6, 3, &["a", "b"])))
        .mount(&server)
        .await;
    post_page(3)
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    get_page(3)
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let items = list(&client, None).await;

    assert_eq!(ok_ids(&items), vec!["a", "b"]);
    assert_eq!(items.len(), 3);
    assert!(matches!(
        items.last(),
        Some(Err(IdentifierError::Transport(AppError::ClientError(_))))
    ));
}

#[tokio::test]
async fn test_filter_is_sent_as_cql_text() {
    let server = catalog().await;
    Mock::given(method("POST"))
        .and(path(CSW_PATH))
        .and(body_string_contains(
            "<csw:CqlText>AnyText like &apos;%soil%&apos;</csw:CqlText>",
        ))
        .respond_with(xml(records_page(1, 0, &["soil-1"])))
        .expect(1)
        .mount(&server)
        .await;

    let client = connect(&server, http_config()).await;
    let items = list(&client, Some("AnyText like '%soil%'")).await;

    assert_eq!(ok_ids(&items), vec!["soil-1"]);
}
