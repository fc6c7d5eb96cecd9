//! iNaturalist source boundary: page fetching, session login and record extraction.

use async_trait::async_trait;
use inat_core::{format_date, parse_date, ObservationRecord, PageResult, Query};
use inat_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "inat-adapters";

pub const DEFAULT_API_BASE: &str = "https://api.inaturalist.org/v1";
pub const DEFAULT_SITE_BASE: &str = "https://www.inaturalist.org";

/// Fetches one page of raw observation payloads for a query.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, query: &Query, page: u64) -> Result<PageResult, FetchError>;
}

/// Maps one raw payload to a destination record, or `None` when it carries no identity.
pub trait RecordExtractor: Send + Sync {
    fn extract(&self, raw: &JsonValue) -> Option<ObservationRecord>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEndpoints {
    pub api_base: String,
    pub site_base: String,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            site_base: DEFAULT_SITE_BASE.to_string(),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct INaturalistApi {
    http: HttpFetcher,
    endpoints: ApiEndpoints,
    credentials: Option<Credentials>,
    session: OnceCell<()>,
}

impl INaturalistApi {
    pub fn new(http: HttpFetcher, endpoints: ApiEndpoints) -> Self {
        Self {
            http,
            endpoints,
            credentials: None,
            session: OnceCell::new(),
        }
    }

    /// Log in once, before the first page is fetched.
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn endpoints(&self) -> &ApiEndpoints {
        &self.endpoints
    }

    /// Observations search URL for `page` of `query`, ascending by observation date.
    pub fn observations_url(&self, query: &Query, page: u64) -> Result<Url, FetchError> {
        let base = format!("{}/observations", self.endpoints.api_base.trim_end_matches('/'));
        let mut params: Vec<(&str, String)> = vec![
            ("verifiable", "true".to_string()),
            ("order_by", "observed_on".to_string()),
            ("order", "asc".to_string()),
            ("page", page.to_string()),
            ("spam", "false".to_string()),
            ("place_id", query.place_id.to_string()),
            ("taxon_id", query.taxon_id.to_string()),
            ("locale", "en".to_string()),
            ("per_page", query.page_size.to_string()),
        ];
        if let Some(cursor) = query.date_cursor {
            params.push(("d1", format_date(cursor)));
        }
        if let Some(until) = query.observed_until {
            params.push(("d2", format_date(until)));
        }
        Url::parse_with_params(&base, &params).map_err(|e| FetchError::Malformed {
            url: base.clone(),
            message: e.to_string(),
        })
    }

    /// Log in through the website form so the session cookie authenticates later requests.
    pub async fn login(&self, credentials: &Credentials) -> Result<(), FetchError> {
        let site = self.endpoints.site_base.trim_end_matches('/');
        let login_url = format!("{site}/login");
        let login_page = self.http.get(&login_url).await?;
        let token = authenticity_token(&login_page.text())?.ok_or_else(|| FetchError::Malformed {
            url: login_url.clone(),
            message: "login form has no authenticity_token".to_string(),
        })?;

        let session_url = format!("{site}/session");
        self.http
            .post_form(
                &session_url,
                &[
                    ("authenticity_token", token.as_str()),
                    ("user[email]", credentials.username.as_str()),
                    ("user[password]", credentials.password.as_str()),
                    ("user[remember_me]", "0"),
                ],
            )
            .await?;

        // A 200 from the session route does not prove success; the home page does.
        let home_url = format!("{site}/home");
        let home = self.http.get(&home_url).await?;
        if home_page_belongs_to(&home.text(), &credentials.username)? {
            info!(username = %credentials.username, "logged into iNaturalist");
            Ok(())
        } else {
            Err(FetchError::Auth {
                url: home_url,
                reason: format!("home page does not show user {}", credentials.username),
            })
        }
    }
}

#[async_trait]
impl PageFetcher for INaturalistApi {
    async fn fetch_page(&self, query: &Query, page: u64) -> Result<PageResult, FetchError> {
        if let Some(credentials) = &self.credentials {
            self.session
                .get_or_try_init(|| self.login(credentials))
                .await?;
        }
        let url = self.observations_url(query, page)?;
        let response = self.http.get(url.as_str()).await?;
        let result = parse_observations_page(url.as_str(), &response.body, page, query.page_size)?;
        debug!(page, records = result.len(), "fetched observations page");
        Ok(result)
    }
}

/// Split an API response body into the raw `results` payloads.
pub fn parse_observations_page(
    url: &str,
    body: &[u8],
    page: u64,
    page_size: u64,
) -> Result<PageResult, FetchError> {
    let malformed = |message: String| FetchError::Malformed {
        url: url.to_string(),
        message,
    };
    let value: JsonValue = serde_json::from_slice(body).map_err(|e| malformed(e.to_string()))?;
    let results = match value {
        JsonValue::Object(mut map) => match map.remove("results") {
            Some(JsonValue::Array(items)) => items,
            _ => return Err(malformed("response has no results array".to_string())),
        },
        _ => return Err(malformed("response is not a JSON object".to_string())),
    };
    Ok(PageResult::new(page, page_size, results))
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::Malformed {
        url: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, FetchError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(text_or_none))
}

/// CSRF token from the login form.
pub fn authenticity_token(login_html: &str) -> Result<Option<String>, FetchError> {
    let document = Html::parse_document(login_html);
    select_first_attr(&document, r#"form input[name="authenticity_token"]"#, "value")
}

/// True when the signed-in home page links the profile of `username`.
pub fn home_page_belongs_to(home_html: &str, username: &str) -> Result<bool, FetchError> {
    let document = Html::parse_document(home_html);
    let profile = format!("/people/{}", username.to_lowercase());
    Ok(select_first_attr(&document, "h1 a", "href")?
        .map(|href| href.to_lowercase().contains(&profile))
        .unwrap_or(false))
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

fn json_str(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_at(value, path)
        .and_then(|v| v.as_str())
        .and_then(text_or_none)
}

/// Extractor for observation objects of the `/v1/observations` API.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObservationExtractor;

impl RecordExtractor for JsonObservationExtractor {
    fn extract(&self, raw: &JsonValue) -> Option<ObservationRecord> {
        let Some(id) = json_at(raw, &["id"]).and_then(|v| v.as_i64()) else {
            warn!(payload = %truncate(raw), "observation without a numeric id skipped");
            return None;
        };

        let mut record = ObservationRecord::new(id);
        record.qual_grade = json_str(raw, &["quality_grade"]);
        record.date = json_str(raw, &["observed_on_details", "date"]).and_then(|d| parse_date(&d));
        record.locality = json_str(raw, &["place_guess"]);
        record.introduced = json_at(raw, &["taxon", "introduced"]).and_then(|v| v.as_bool());

        if let Some(name) = json_str(raw, &["taxon", "name"]) {
            let mut parts = name.split_whitespace().map(str::to_string);
            record.genus = parts.next();
            record.species = parts.next();
            record.subspecies = parts.next();
        }

        // geojson is [long, lat]; coords is rendered [lat, long] from the source's own number text.
        if let Some(JsonValue::Array(pair)) = json_at(raw, &["geojson", "coordinates"]) {
            if let [long, lat] = pair.as_slice() {
                if let (Some(lat_f), Some(long_f)) = (lat.as_f64(), long.as_f64()) {
                    record.lat = Some(lat_f);
                    record.long = Some(long_f);
                    record.coords = Some(format!("[{lat}, {long}]"));
                }
            }
        }

        if record.date.is_none() {
            debug!(id, "observation has no observed_on date");
        }
        if record.lat.is_none() {
            debug!(id, "observation has no coordinates");
        }
        Some(record)
    }
}

fn truncate(value: &JsonValue) -> String {
    let mut text = value.to_string();
    if text.len() > 120 {
        let mut cut = 120;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use inat_storage::HttpClientConfig;
    use serde_json::json;

    fn api() -> INaturalistApi {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("client");
        INaturalistApi::new(http, ApiEndpoints::default())
    }

    fn param(url: &Url, key: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn fresh_query_url_has_no_date_bounds() {
        let query = Query::new(7146, 85553, 100, 3);
        let url = api().observations_url(&query, 3).expect("url");
        assert_eq!(url.path(), "/v1/observations");
        assert_eq!(param(&url, "order_by").as_deref(), Some("observed_on"));
        assert_eq!(param(&url, "order").as_deref(), Some("asc"));
        assert_eq!(param(&url, "page").as_deref(), Some("3"));
        assert_eq!(param(&url, "per_page").as_deref(), Some("100"));
        assert_eq!(param(&url, "place_id").as_deref(), Some("7146"));
        assert_eq!(param(&url, "taxon_id").as_deref(), Some("85553"));
        assert!(param(&url, "d1").is_none());
        assert!(param(&url, "d2").is_none());
    }

    #[test]
    fn rolled_over_query_url_carries_inclusive_date_cursor() {
        let mut query = Query::new(6986, 26036, 200, 1)
            .with_observed_until(NaiveDate::from_ymd_opt(2021, 9, 1));
        query.date_cursor = NaiveDate::from_ymd_opt(1986, 7, 17);
        let url = api().observations_url(&query, 1).expect("url");
        assert_eq!(param(&url, "d1").as_deref(), Some("1986-07-17"));
        assert_eq!(param(&url, "d2").as_deref(), Some("2021-09-01"));
    }

    #[test]
    fn page_body_without_results_is_malformed() {
        let err = parse_observations_page("u", br#"{"error":"nope"}"#, 1, 100).expect_err("malformed");
        assert!(matches!(err, FetchError::Malformed { .. }));
        let err = parse_observations_page("u", b"<html>", 1, 100).expect_err("not json");
        assert!(matches!(err, FetchError::Malformed { .. }));

        let page = parse_observations_page("u", br#"{"total_results":1,"results":[{"id":1}]}"#, 4, 100)
            .expect("page");
        assert_eq!(page.page, 4);
        assert_eq!(page.len(), 1);
        assert!(page.is_final_page());
    }

    #[test]
    fn extractor_maps_a_full_observation() {
        let raw = json!({
            "id": 509046,
            "quality_grade": "research",
            "observed_on_details": {"date": "1988-01-02"},
            "place_guess": "Kariba",
            "geojson": {"type": "Point", "coordinates": [28.795252, -16.533578]},
            "taxon": {"name": "Dendroaspis polylepis", "introduced": false}
        });
        let record = JsonObservationExtractor.extract(&raw).expect("record");
        assert_eq!(record.id, 509046);
        assert_eq!(record.date, NaiveDate::from_ymd_opt(1988, 1, 2));
        assert_eq!(record.genus.as_deref(), Some("Dendroaspis"));
        assert_eq!(record.species.as_deref(), Some("polylepis"));
        assert_eq!(record.subspecies, None);
        assert_eq!(record.coords.as_deref(), Some("[-16.533578, 28.795252]"));
        assert_eq!(record.lat, Some(-16.533578));
        assert_eq!(record.long, Some(28.795252));
        assert_eq!(record.locality.as_deref(), Some("Kariba"));
        assert_eq!(record.introduced, Some(false));
        assert_eq!(record.qual_grade.as_deref(), Some("research"));
    }

    #[test]
    fn extractor_tolerates_missing_fields_but_needs_an_id() {
        let sparse = json!({"id": 169856, "taxon": {"name": "Duberria"}, "place_guess": null});
        let record = JsonObservationExtractor.extract(&sparse).expect("record");
        assert_eq!(record.genus.as_deref(), Some("Duberria"));
        assert_eq!(record.species, None);
        assert_eq!(record.date, None);
        assert_eq!(record.locality, None);
        assert_eq!(record.coords, None);

        assert!(JsonObservationExtractor.extract(&json!({"uuid": "x"})).is_none());
        assert!(JsonObservationExtractor.extract(&json!({"id": "509046"})).is_none());
    }

    #[test]
    fn login_page_token_and_home_profile_are_read_from_html() {
        let login = r#"<html><body><form action="/session" method="post">
            <input name="utf8" type="hidden" value="&#x2713;">
            <input name="authenticity_token" type="hidden" value="tok-123==">
            <input name="user[email]" type="text">
        </form></body></html>"#;
        assert_eq!(
            authenticity_token(login).expect("parse").as_deref(),
            Some("tok-123==")
        );
        assert_eq!(authenticity_token("<html></html>").expect("parse"), None);

        let home = r#"<html><body><h1><a href="/people/snakefan">snakefan</a></h1></body></html>"#;
        assert!(home_page_belongs_to(home, "SnakeFan").expect("parse"));
        assert!(!home_page_belongs_to(home, "someoneelse").expect("parse"));
        assert!(!home_page_belongs_to("<h1>Log In</h1>", "snakefan").expect("parse"));
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "snakefan".into(),
            password: "hunter2".into(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("snakefan"));
        assert!(!shown.contains("hunter2"));
    }
}
