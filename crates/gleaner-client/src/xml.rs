//! Parsing of CSW 2.0.2 responses.
//!
//! Works on local names only: catalogs disagree on prefixes, and some bind
//! the CSW namespace as the default namespace.

use gleaner_core::AppError;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// One page of a `GetRecords` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// `numberOfRecordsMatched` of `csw:SearchResults`.
    pub matched: Option<u64>,
    /// `numberOfRecordsReturned` of `csw:SearchResults`.
    pub returned: Option<u64>,
    /// `nextRecord` of `csw:SearchResults`; `0` means no more records.
    pub next_record: Option<u64>,
    /// One item per record: its identifier, or why none could be read.
    pub records: Vec<Result<String, String>>,
}

/// A record extracted from a `GetRecordById` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRecord {
    pub xml: String,
    pub element: String,
}

/// Returns true if the body looks like an HTML page instead of XML.
pub fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(512).collect();
    let head = head.to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.contains("<html")
}

/// Local name of the document element, or an error for unparsable input.
pub fn root_element(body: &str) -> Result<String, AppError> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => return Ok(local_name(&e)),
            Ok(Event::Eof) => return Err(AppError::EmptyResponse),
            Ok(_) => {}
            Err(e) => return Err(xml_error(&reader, e)),
        }
    }
}

/// Fails with [`AppError::CatalogException`] if `body` is an OWS exception report.
pub fn check_exception(body: &str) -> Result<(), AppError> {
    if root_element(body)? != "ExceptionReport" {
        return Ok(());
    }

    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);
    let mut code = None;
    let mut in_text = false;
    let mut texts = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match local_name(&e).as_str() {
                "Exception" => code = code.or_else(|| attribute(&e, "exceptionCode")),
                "ExceptionText" => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if local_name(&e) == "Exception" => {
                code = code.or_else(|| attribute(&e, "exceptionCode"));
            }
            Ok(Event::Text(t)) if in_text => {
                if let Ok(text) = t.unescape() {
                    texts.push(text.trim().to_string());
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"ExceptionText" => in_text = false,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(&reader, e)),
        }
    }

    let message = if texts.is_empty() {
        code.unwrap_or_else(|| "unknown exception".to_string())
    } else {
        texts.join("; ")
    };
    Err(AppError::CatalogException(message))
}

/// Parses a `GetRecordsResponse` into identifiers and paging counters.
///
/// Identifiers come from `gmd:fileIdentifier/gco:CharacterString` for ISO
/// records and from `dc:identifier` for `csw:Record`, `csw:SummaryRecord`
/// and `csw:BriefRecord`.
pub fn parse_search_page(body: &str) -> Result<SearchPage, AppError> {
    check_exception(body)?;

    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut page = SearchPage::default();
    let mut path: Vec<String> = Vec::new();
    let mut results_depth = None;
    // (depth, kind, identifier found so far)
    let mut record: Option<(usize, String, Option<String>)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                open_element(&e, &name, path.len(), &mut page, &mut results_depth, &mut record);
                path.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                open_element(&e, &name, path.len(), &mut page, &mut results_depth, &mut record);
                if record.as_ref().is_some_and(|(depth, _, _)| *depth == path.len()) {
                    close_record(&mut page, &mut record);
                }
            }
            Ok(Event::Text(t)) => {
                if let Some((depth, kind, found)) = record.as_mut() {
                    if found.is_none() && is_identifier_path(&path, *depth, kind) {
                        let text = t
                            .unescape()
                            .map_err(|e| AppError::XmlError(e.to_string()))?;
                        *found = Some(text.trim().to_string());
                    }
                }
            }
            Ok(Event::CData(t)) => {
                if let Some((depth, kind, found)) = record.as_mut() {
                    if found.is_none() && is_identifier_path(&path, *depth, kind) {
                        let text = String::from_utf8_lossy(&t);
                        *found = Some(text.trim().to_string());
                    }
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
                if record.as_ref().is_some_and(|(depth, _, _)| *depth == path.len()) {
                    close_record(&mut page, &mut record);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(xml_error(&reader, e)),
        }
    }

    if results_depth.is_none() {
        return Err(AppError::XmlError(
            "GetRecords response has no SearchResults element".to_string(),
        ));
    }

    Ok(page)
}

fn open_element(
    e: &BytesStart<'_>,
    name: &str,
    depth: usize,
    page: &mut SearchPage,
    results_depth: &mut Option<usize>,
    record: &mut Option<(usize, String, Option<String>)>,
) {
    if name == "SearchResults" && results_depth.is_none() {
        *results_depth = Some(depth);
        page.matched = attribute(e, "numberOfRecordsMatched").and_then(|v| v.parse().ok());
        page.returned = attribute(e, "numberOfRecordsReturned").and_then(|v| v.parse().ok());
        page.next_record = attribute(e, "nextRecord").and_then(|v| v.parse().ok());
    } else if record.is_none() && results_depth.is_some_and(|d| depth == d + 1) {
        *record = Some((depth, name.to_string(), None));
    }
}

fn close_record(page: &mut SearchPage, record: &mut Option<(usize, String, Option<String>)>) {
    if let Some((_, kind, found)) = record.take() {
        let item = match found {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(format!(
                "{} record #{} has no identifier",
                kind,
                page.records.len() + 1
            )),
        };
        page.records.push(item);
    }
}

/// Whether the current element path points at the identifier of a record.
fn is_identifier_path(path: &[String], record_depth: usize, kind: &str) -> bool {
    let rel = path.get(record_depth + 1..).unwrap_or_default();
    match kind {
        "MD_Metadata" | "MI_Metadata" => {
            matches!(rel, [a, b] if a == "fileIdentifier" && b == "CharacterString")
        }
        _ => matches!(rel, [a] if a == "identifier"),
    }
}

/// Extracts the metadata record from a `GetRecordById` response.
///
/// Returns the first child of `csw:GetRecordByIdResponse`, or the whole
/// document if the catalog answered with the bare record. Namespace
/// declarations of the response element are copied onto the extracted
/// record so it stays a standalone document. `None` means the response
/// holds no record.
pub fn extract_record(body: &str) -> Result<Option<ExtractedRecord>, AppError> {
    check_exception(body)?;

    let root = root_element(body)?;
    if root != "GetRecordByIdResponse" {
        return Ok(Some(ExtractedRecord {
            xml: body.to_string(),
            element: root,
        }));
    }

    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut depth = 0usize;
    let mut root_namespaces: Vec<(String, String)> = Vec::new();
    // (start offset, element qname, element local name, declared prefixes)
    let mut open: Option<(usize, String, String, Vec<String>)> = None;

    loop {
        let before = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                if depth == 1 {
                    root_namespaces = namespace_declarations(&e);
                } else if depth == 2 && open.is_none() {
                    open = Some((before, qname(&e), local_name(&e), declared_keys(&e)));
                }
            }
            Ok(Event::Empty(e)) => {
                if depth == 1 && open.is_none() {
                    let end = reader.buffer_position() as usize;
                    let declared = declared_keys(&e);
                    return Ok(Some(ExtractedRecord {
                        xml: standalone(&body[before..end], &qname(&e), &root_namespaces, &declared),
                        element: local_name(&e),
                    }));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    if let Some((start, name, element, declared)) = open.take() {
                        let end = reader.buffer_position() as usize;
                        return Ok(Some(ExtractedRecord {
                            xml: standalone(&body[start..end], &name, &root_namespaces, &declared),
                            element,
                        }));
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(xml_error(&reader, e)),
        }
    }
}

/// Re-declares inherited namespaces on the record's start tag.
fn standalone(
    fragment: &str,
    name: &str,
    inherited: &[(String, String)],
    declared: &[String],
) -> String {
    let fragment = fragment.trim();
    let missing: String = inherited
        .iter()
        .filter(|(key, _)| !declared.contains(key))
        .map(|(key, value)| format!(" {}=\"{}\"", key, quick_xml::escape::escape(value.as_str())))
        .collect();

    let insert_at = 1 + name.len();
    if missing.is_empty() || fragment.len() < insert_at {
        return fragment.to_string();
    }
    format!("{}{}{}", &fragment[..insert_at], missing, &fragment[insert_at..])
}

fn namespace_declarations(e: &BytesStart<'_>) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .filter_map(|attr| {
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            if key != "xmlns" && !key.starts_with("xmlns:") {
                return None;
            }
            let value = attr.unescape_value().ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

fn declared_keys(e: &BytesStart<'_>) -> Vec<String> {
    namespace_declarations(e)
        .into_iter()
        .map(|(key, _)| key)
        .collect()
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn qname(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name.as_bytes())
        .and_then(|attr| attr.unescape_value().ok())
        .map(|v| v.into_owned())
}

fn xml_error(reader: &Reader<&[u8]>, e: quick_xml::Error) -> AppError {
    AppError::XmlError(format!(
        "{} at position {}",
        e,
        reader.buffer_position()
    ))
}
