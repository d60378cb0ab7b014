use std::collections::HashSet;
use std::fs;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use super::RunContext;
use super::attribute::collect_ids;
use crate::error::MartError;
use crate::query::{Filter, IdSource, Query};

/// Materializes every sub-query and URL id list so the query can be compiled.
pub fn resolve_id_lists(query: &Query, context: RunContext<'_>) -> Result<Query, MartError> {
    let mut resolved = query.clone();
    for filter in query.filters() {
        let Filter::IdList(list) = filter else {
            continue;
        };
        let values = match &list.source {
            IdSource::Values(_) => continue,
            IdSource::SubQuery(sub_query) => {
                tracing::debug!(
                    field = %list.field,
                    dataset = %sub_query.dataset().name,
                    "resolving id list from sub-query"
                );
                collect_ids(context, sub_query)?
            }
            IdSource::Url(location) => {
                tracing::debug!(field = %list.field, location = %location, "resolving id list");
                parse_ids(&read_location(location)?)
            }
        };
        tracing::debug!(field = %list.field, ids = values.len(), "id list resolved");
        resolved.replace_filter(filter, Filter::IdList(list.with_values(values)));
    }
    Ok(resolved)
}

/// One identifier per non-blank line, first occurrence kept.
pub fn parse_ids(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(*line))
        .map(str::to_string)
        .collect()
}

fn read_location(location: &str) -> Result<String, MartError> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return fetch_url(location);
    }
    let path = location.strip_prefix("file://").unwrap_or(location);
    fs::read_to_string(path)
        .map_err(|err| MartError::Filesystem(format!("read id list {path}: {err}")))
}

fn fetch_url(url: &str) -> Result<String, MartError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("martq/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| MartError::IdListHttp(err.to_string()))?,
    );
    let client = Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|err| MartError::IdListHttp(err.to_string()))?;

    let response = send_with_retries(|| client.get(url))?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "id list request failed".to_string());
        tracing::warn!(url, status, "id list request failed");
        return Err(MartError::IdListStatus { status, message });
    }
    response
        .text()
        .map_err(|err| MartError::IdListHttp(err.to_string()))
}

fn send_with_retries<F>(mut make_req: F) -> Result<reqwest::blocking::Response, MartError>
where
    F: FnMut() -> reqwest::blocking::RequestBuilder,
{
    const MAX_RETRIES: usize = 3;
    const BASE_DELAY_MS: u64 = 200;
    let mut attempt = 0usize;
    loop {
        match make_req().send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                    attempt += 1;
                    continue;
                }
                return Err(MartError::IdListHttp(err.to_string()));
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_trimmed_and_unique() {
        let ids = parse_ids("ENSG1\n  ENSG2 \n\nENSG1\r\nENSG3\n");
        assert_eq!(ids, vec!["ENSG1", "ENSG2", "ENSG3"]);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(429));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn file_locations_are_read() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("ids.txt");
        fs::write(&path, "G1\nG2\n").unwrap();
        let plain = read_location(path.to_str().unwrap()).unwrap();
        let url = read_location(&format!("file://{}", path.display())).unwrap();
        assert_eq!(plain, url);
        assert_eq!(parse_ids(&plain), vec!["G1", "G2"]);
    }
}
