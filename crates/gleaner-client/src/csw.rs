//! CSW 2.0.2 client for harvesting ISO 19139 metadata catalogs.
//!
//! # Requests
//!
//! - `GetCapabilities` (GET) when the client is created, as a reachability probe
//! - `GetRecords` for identifier paging: XML POST first; the first POST that
//!   fails or answers with HTML switches the rest of the pass to KVP GET
//! - `GetRecordById`: POST as the primary request, KVP GET as the fallback
//!
//! Some catalogs only implement one binding, and some reverse proxies answer
//! POST with an HTML error page, which is why both are used.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use gleaner_core::traits::{IdentifierSource, RecordFetcher, SourceClientFactory};
use gleaner_core::{AppError, HarvestSource, HttpConfig, IdentifierError, RawRecord, SourceType};
use quick_xml::escape::escape;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::time::sleep;
use url::Url;

use crate::xml::{self, SearchPage};

pub const CSW_NAMESPACE: &str = "http://www.opengis.net/cat/csw/2.0.2";
pub const GMD_NAMESPACE: &str = "http://www.isotc211.org/2005/gmd";
const OGC_NAMESPACE: &str = "http://www.opengis.net/ogc";
const TYPE_NAMES: &str = "gmd:MD_Metadata";

/// HTTP client for one CSW endpoint.
///
/// Created per job by [`CswClientFactory`]; gather and fetch share it.
///
/// # Examples
///
/// ```no_run
/// use gleaner_client::CswClient;
/// use gleaner_core::{HarvestSource, HttpConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = HarvestSource::new("https://catalog.example.org/csw");
/// let client = CswClient::connect(&source, HttpConfig::default()).await?;
/// println!("{}", client.record_url("abc-123"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CswClient {
    client: Client,
    endpoint: Url,
    config: HttpConfig,
}

impl CswClient {
    /// Builds a client without contacting the catalog.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidSourceUrl` if the URL is malformed.
    /// Returns `AppError::ClientError` if the HTTP client cannot be built.
    pub fn new(source: &HarvestSource, config: HttpConfig) -> Result<Self, AppError> {
        let endpoint = Url::parse(&source.url)
            .map_err(|_| AppError::InvalidSourceUrl(source.url.clone()))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(AppError::InvalidSourceUrl(source.url.clone()));
        }

        if source.disable_ssl_verification {
            tracing::warn!(
                source = source.label(),
                "TLS certificate verification disabled for this source"
            );
        }

        let client = Client::builder()
            .user_agent(concat!("gleaner/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .danger_accept_invalid_certs(source.disable_ssl_verification)
            .build()
            .map_err(|e| AppError::ClientError(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            config,
        })
    }

    /// Builds a client and checks that the endpoint answers `GetCapabilities`.
    pub async fn connect(source: &HarvestSource, config: HttpConfig) -> Result<Self, AppError> {
        let client = Self::new(source, config)?;
        client.get_capabilities().await?;
        Ok(client)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Fetches the capabilities document and validates it.
    pub async fn get_capabilities(&self) -> Result<String, AppError> {
        let url = self.kvp_url(&[("REQUEST", "GetCapabilities")]);
        let body = self.send(self.client.get(url)).await?;
        xml::check_exception(&body)?;

        let root = xml::root_element(&body)?;
        if root != "Capabilities" {
            return Err(AppError::ClientError(format!(
                "Expected a CSW Capabilities document, got <{}>",
                root
            )));
        }
        tracing::debug!(endpoint = %self.endpoint, "Catalog capabilities OK");
        Ok(body)
    }

    /// URL retrieving one record as XML with a plain GET.
    pub fn record_url(&self, guid: &str) -> String {
        self.kvp_url(&[
            ("REQUEST", "GetRecordById"),
            ("OUTPUTSCHEMA", GMD_NAMESPACE),
            ("OUTPUTFORMAT", "application/xml"),
            ("ID", guid),
        ])
        .to_string()
    }

    // =========================================================================
    // GetRecords
    // =========================================================================

    /// Fetches one page of identifiers.
    ///
    /// `start` is the 1-based `startPosition`.
    pub async fn get_records(
        &self,
        start: u64,
        filter: Option<&str>,
        use_get: bool,
    ) -> Result<SearchPage, AppError> {
        let body = if use_get {
            self.send(self.client.get(self.get_records_url(start, filter)))
                .await?
        } else {
            self.send(
                self.client
                    .post(self.endpoint.clone())
                    .header(CONTENT_TYPE, "application/xml")
                    .body(get_records_body(start, self.config.page_size, filter)),
            )
            .await?
        };
        xml::parse_search_page(&body)
    }

    /// Same as [`get_records`](Self::get_records), retried on transient errors.
    async fn get_records_with_retry(
        &self,
        start: u64,
        filter: Option<&str>,
        use_get: bool,
    ) -> Result<SearchPage, AppError> {
        let mut attempt = 0;
        loop {
            match self.get_records(start, filter, use_get).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.config.page_retries => {
                    attempt += 1;
                    let delay = page_retry_delay(&self.config, attempt);
                    tracing::warn!(
                        start,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "GetRecords page failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn get_records_url(&self, start: u64, filter: Option<&str>) -> Url {
        let start = start.to_string();
        let max = self.config.page_size.to_string();
        let mut params = vec![
            ("REQUEST", "GetRecords"),
            ("typeNames", TYPE_NAMES),
            ("resultType", "results"),
            ("outputSchema", GMD_NAMESPACE),
            ("elementSetName", "brief"),
            ("startPosition", start.as_str()),
            ("maxRecords", max.as_str()),
        ];
        if let Some(cql) = filter {
            params.push(("constraintLanguage", "CQL_TEXT"));
            params.push(("constraint_language_version", "1.1.0"));
            params.push(("constraint", cql));
        }
        self.kvp_url(&params)
    }

    // =========================================================================
    // GetRecordById
    // =========================================================================

    async fn get_record_by_id(&self, guid: &str, use_get: bool) -> Result<Option<RawRecord>, AppError> {
        let request = if use_get {
            self.client.get(self.kvp_url(&[
                ("REQUEST", "GetRecordById"),
                ("id", guid),
                ("outputSchema", GMD_NAMESPACE),
                ("elementSetName", "full"),
            ]))
        } else {
            self.client
                .post(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/xml")
                .body(get_record_by_id_body(guid))
        };

        let body = match self.send(request).await {
            Ok(body) => body,
            Err(AppError::EmptyResponse) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(xml::extract_record(&body)?.map(|record| RawRecord {
            content: record.xml,
            document_element: Some(record.element),
        }))
    }

    // =========================================================================
    // HTTP plumbing
    // =========================================================================

    /// Endpoint URL with `SERVICE`/`VERSION` and the given parameters.
    ///
    /// Parameters already on the configured endpoint are kept.
    fn kvp_url(&self, params: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("SERVICE", "CSW")
                .append_pair("VERSION", "2.0.2");
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    /// Sends a request and returns the body of a successful XML response.
    async fn send(&self, request: RequestBuilder) -> Result<String, AppError> {
        let resp = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimitExceeded);
        }
        if status.is_server_error() {
            return Err(AppError::ClientError(format!(
                "Server error: HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(AppError::ClientError(format!(
                "HTTP {} from {}",
                status.as_u16(),
                self.endpoint
            )));
        }

        let body = resp.text().await.map_err(|e| self.map_send_error(e))?;
        if body.trim().is_empty() {
            return Err(AppError::EmptyResponse);
        }
        if xml::looks_like_html(&body) {
            return Err(AppError::ClientError(
                "Catalog returned HTML instead of XML".to_string(),
            ));
        }
        Ok(body)
    }

    fn map_send_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.config.timeout.as_secs())
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {}", e))
        } else {
            AppError::ClientError(e.to_string())
        }
    }
}

fn get_records_body(start: u64, max_records: usize, filter: Option<&str>) -> String {
    let constraint = filter
        .map(|cql| {
            format!(
                "<csw:Constraint version=\"1.1.0\"><csw:CqlText>{}</csw:CqlText></csw:Constraint>",
                escape(cql)
            )
        })
        .unwrap_or_default();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<csw:GetRecords xmlns:csw="{csw}" xmlns:ogc="{ogc}" xmlns:gmd="{gmd}" service="CSW" version="2.0.2" resultType="results" startPosition="{start}" maxRecords="{max_records}" outputSchema="{gmd}">
  <csw:Query typeNames="{type_names}">
    <csw:ElementSetName>brief</csw:ElementSetName>
    {constraint}
    <ogc:SortBy>
      <ogc:SortProperty>
        <ogc:PropertyName>dc:identifier</ogc:PropertyName>
        <ogc:SortOrder>ASC</ogc:SortOrder>
      </ogc:SortProperty>
    </ogc:SortBy>
  </csw:Query>
</csw:GetRecords>"#,
        csw = CSW_NAMESPACE,
        ogc = OGC_NAMESPACE,
        gmd = GMD_NAMESPACE,
        type_names = TYPE_NAMES,
    )
}

fn get_record_by_id_body(guid: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<csw:GetRecordById xmlns:csw="{csw}" service="CSW" version="2.0.2" outputSchema="{gmd}">
  <csw:Id>{id}</csw:Id>
  <csw:ElementSetName>full</csw:ElementSetName>
</csw:GetRecordById>"#,
        csw = CSW_NAMESPACE,
        gmd = GMD_NAMESPACE,
        id = escape(guid),
    )
}

// =============================================================================
// Identifier paging
// =============================================================================

/// Paging state of one `list_identifiers` pass.
struct Paging<'a> {
    client: &'a CswClient,
    filter: Option<&'a str>,
    /// Next 1-based `startPosition`.
    start: u64,
    matched: Option<u64>,
    /// Set once a `SearchResults` page has been parsed.
    seen_page: bool,
    use_get: bool,
    done: bool,
}

impl Paging<'_> {
    /// Fetches the next page; `None` once paging is over.
    async fn next_page(&mut self) -> Option<Vec<Result<String, IdentifierError>>> {
        if self.done {
            return None;
        }
        if self.matched.is_some_and(|matched| self.start > matched) {
            return None;
        }

        let page = match self.fetch().await {
            Ok(page) => page,
            Err(e @ AppError::CatalogException(_)) if !self.seen_page => {
                // No page parsed yet: a rejected request (bad constraint), not the end.
                self.done = true;
                return Some(vec![Err(IdentifierError::Transport(e))]);
            }
            Err(AppError::CatalogException(message)) => {
                // Some catalogs report running past the last record as an exception.
                tracing::warn!(
                    start = self.start,
                    exception = message.as_str(),
                    "Catalog exception while paging, treating as end of results"
                );
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(vec![Err(IdentifierError::Transport(e))]);
            }
        };

        if !self.seen_page {
            self.seen_page = true;
            self.matched = page.matched;
            tracing::info!(
                endpoint = %self.client.endpoint,
                matched = page.matched,
                "Catalog reports matching records"
            );
        }

        let count = page.records.len() as u64;
        if count == 0 || page.next_record == Some(0) {
            self.done = true;
        }
        self.start += count.max(1);

        Some(
            page.records
                .into_iter()
                .map(|item| item.map_err(IdentifierError::Record))
                .collect(),
        )
    }

    async fn fetch(&mut self) -> Result<SearchPage, AppError> {
        if !self.use_get {
            match self
                .client
                .get_records_with_retry(self.start, self.filter, false)
                .await
            {
                Ok(page) => return Ok(page),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "GetRecords POST failed, switching to GET for the rest of the pass"
                    );
                    self.use_get = true;
                }
            }
        }
        self.client
            .get_records_with_retry(self.start, self.filter, true)
            .await
    }
}

impl IdentifierSource for CswClient {
    fn list_identifiers<'a>(
        &'a self,
        filter: Option<&'a str>,
    ) -> BoxStream<'a, Result<String, IdentifierError>> {
        let paging = Paging {
            client: self,
            filter,
            start: 1,
            matched: None,
            seen_page: false,
            use_get: false,
            done: false,
        };

        stream::unfold(paging, |mut paging| async move {
            let page = paging.next_page().await?;
            Some((stream::iter(page), paging))
        })
        .flatten()
        .boxed()
    }
}

impl RecordFetcher for CswClient {
    async fn fetch_primary(&self, guid: &str) -> Result<Option<RawRecord>, AppError> {
        self.get_record_by_id(guid, false).await
    }

    async fn fetch_fallback(&self, guid: &str) -> Result<Option<RawRecord>, AppError> {
        self.get_record_by_id(guid, true).await
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Factory creating one connected [`CswClient`] per job.
#[derive(Debug, Clone, Default)]
pub struct CswClientFactory {
    config: HttpConfig,
}

impl CswClientFactory {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

impl SourceClientFactory for CswClientFactory {
    type Client = CswClient;

    async fn connect(&self, source: &HarvestSource) -> Result<CswClient, AppError> {
        match source.source_type {
            SourceType::Csw => CswClient::connect(source, self.config.clone()).await,
        }
    }
}

/// Linear backoff between two attempts at the same page.
fn page_retry_delay(config: &HttpConfig, attempt: u32) -> Duration {
    config.retry_base_delay * attempt
}
