//! Client for the USBC approved ball list JSON API.

use std::time::Duration;

use abl_core::{Ball, Brand};
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::NaiveDate;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const DEFAULT_BASE_URL: &str = "https://bowl.com/api/approvedballs";
pub const BRAND_QUERY_PARAM: &str = "brandName";
pub const MEDIA_HOST: &str = "https://bowl.com";
pub const NO_IMAGE_URL: &str =
    "https://images.bowl.com/bowl/media/legacy/internap/bowl/equipandspecs/images/approvedballs/noimage.jpg";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unparseable approval date {input:?}: {reason}")]
pub struct DateFormatError {
    pub input: String,
    pub reason: String,
}

impl DateFormatError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    Upstream { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decoding response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    DateFormat(#[from] DateFormatError),
}

/// Source of the upstream approved list, one brand at a time.
#[async_trait]
pub trait BallSource: Send + Sync {
    async fn list_balls(&self, brand: Brand) -> Result<Vec<Ball>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct UsbcConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for UsbcConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UsbcBall {
    #[serde(rename = "brandName", default)]
    brand: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "dateApproved", default)]
    date_approved: Option<String>,
    #[serde(rename = "image", default)]
    image_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UsbcClient {
    client: reqwest::Client,
    base_url: Url,
}

impl UsbcClient {
    pub fn new(config: UsbcConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing usbc base url {}", config.base_url))?;
        Ok(Self { client, base_url })
    }

    /// Upstream expects the brand name base64url-encoded.
    pub fn brand_url(&self, brand: Brand) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair(BRAND_QUERY_PARAM, &URL_SAFE.encode(brand.as_str()));
        url
    }

    async fn fetch(&self, brand: Brand) -> Result<Vec<Ball>, FetchError> {
        let url = self.brand_url(brand);
        let resp = self.client.get(url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Upstream {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        let records: Vec<UsbcBall> = serde_json::from_slice(&body)?;

        let mut balls = Vec::with_capacity(records.len());
        for record in records {
            let name = record.name.as_deref().unwrap_or_default().trim();
            let date_approved = record.date_approved.as_deref().unwrap_or_default().trim();
            if name.is_empty() || date_approved.is_empty() {
                continue;
            }

            let upstream_brand = record.brand.as_deref().unwrap_or_default().trim();
            if !upstream_brand.is_empty() && upstream_brand != brand.as_str() {
                warn!(%brand, upstream_brand, name, "upstream brand differs from requested brand");
            }

            let approval_date = parse_approval_date(date_approved)?;
            let image_url = normalize_image_url(record.image_url.as_deref().unwrap_or_default());
            balls.push(Ball::new(brand, name, approval_date, image_url));
        }

        debug!(%brand, count = balls.len(), "fetched balls");
        Ok(balls)
    }
}

#[async_trait]
impl BallSource for UsbcClient {
    async fn list_balls(&self, brand: Brand) -> Result<Vec<Ball>, FetchError> {
        let span = info_span!("usbc_fetch", %brand);
        self.fetch(brand).instrument(span).await
    }
}

/// Rewrite CMS media paths onto the public host; anything unparseable becomes the placeholder.
pub fn normalize_image_url(raw: &str) -> String {
    let raw = raw.trim();
    let candidate = if raw.contains("getmedia") {
        format!("{MEDIA_HOST}{}", raw.trim_start_matches('~'))
    } else {
        raw.to_string()
    };

    match Url::parse(&candidate) {
        Ok(url) => url.to_string(),
        Err(_) => NO_IMAGE_URL.to_string(),
    }
}

const FULL_MONTH_NAMES: [&str; 12] = [
    "January", "February", "March", "April", "May", "June", "July", "August", "September",
    "October", "November", "December",
];

fn month_number(name: &str) -> Option<u32> {
    let month = match name {
        "Jan" | "January" => 1,
        "Feb" | "February" => 2,
        "Mar" | "March" => 3,
        "Apr" | "April" => 4,
        "May" => 5,
        "Jun" | "June" => 6,
        "Jul" | "July" => 7,
        "Aug" | "August" => 8,
        "Sep" | "Sept" | "September" => 9,
        "Oct" | "October" => 10,
        "Nov" | "November" => 11,
        "Dec" | "December" => 12,
        _ => return None,
    };
    Some(month)
}

/// Day 0 of a month: the last day of the previous month.
fn day_zero(input: &str, year: i32, month: u32) -> Result<NaiveDate, DateFormatError> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .ok_or_else(|| DateFormatError::new(input, format!("year {year} out of range")))
}

/// Normalize the approval date formats the upstream list mixes together.
///
/// - `"January 2, 2006"`: full date.
/// - `"Jan-06"`, `"Jan-96"`, `"March-2004"`: month and year, day 0.
///   A year fragment starting with `9` gets a `19` prefix, any other two-character
///   fragment gets `20`.
/// - `"Dec00"`: month of 2000, day 0.
pub fn parse_approval_date(raw: &str) -> Result<NaiveDate, DateFormatError> {
    let stripped = raw.replace('\'', "");
    let date = stripped.trim();

    if date.contains(',') {
        // chrono's %B also takes abbreviations and any letter case.
        let month = date.split_whitespace().next().unwrap_or_default();
        if !FULL_MONTH_NAMES.contains(&month) {
            return Err(DateFormatError::new(raw, format!("invalid month string: {month}")));
        }
        return NaiveDate::parse_from_str(date, "%B %d, %Y")
            .map_err(|err| DateFormatError::new(raw, err.to_string()));
    }

    if date.contains('-') {
        let parts: Vec<&str> = date.split('-').collect();
        let [month, year] = parts.as_slice() else {
            return Err(DateFormatError::new(raw, "invalid month-year combo"));
        };

        let month_str = month.trim();
        let month = month_number(month_str)
            .ok_or_else(|| DateFormatError::new(raw, format!("invalid month string: {month_str}")))?;

        let fragment = year.trim();
        let year_str = if fragment.starts_with('9') {
            format!("19{fragment}")
        } else if fragment.len() == 2 {
            format!("20{fragment}")
        } else {
            fragment.to_string()
        };
        let year: i32 = year_str
            .parse()
            .map_err(|_| DateFormatError::new(raw, format!("invalid year: {year_str}")))?;

        return day_zero(raw, year, month);
    }

    if date.contains("00") {
        let rest = date.replace("00", "");
        let month_str = rest.trim();
        let month = month_number(month_str)
            .ok_or_else(|| DateFormatError::new(raw, format!("invalid month string: {month_str}")))?;
        return day_zero(raw, 2000, month);
    }

    Err(DateFormatError::new(raw, "unexpected date format"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn client_for(server: &MockServer) -> UsbcClient {
        UsbcClient::new(UsbcConfig {
            base_url: format!("{}/api/approvedballs", server.uri()),
            ..UsbcConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn full_us_dates_parse() {
        assert_eq!(parse_approval_date("January 2, 2006").unwrap(), date(2006, 1, 2));
        assert_eq!(parse_approval_date("  October 15, 2019 ").unwrap(), date(2019, 10, 15));
    }

    #[test]
    fn month_year_dates_land_on_day_zero() {
        // Day 0 of January 2006 is December 31 2005.
        assert_eq!(parse_approval_date("Jan-06").unwrap(), date(2005, 12, 31));
        assert_eq!(parse_approval_date("Jan-96").unwrap(), date(1995, 12, 31));
        assert_eq!(parse_approval_date("Mar-2004").unwrap(), date(2004, 2, 29));
        assert_eq!(parse_approval_date("Sept-'99").unwrap(), date(1999, 8, 31));
        assert_eq!(parse_approval_date("Dec-00").unwrap(), date(2000, 11, 30));
    }

    #[test]
    fn year_fragment_starting_with_nine_gets_nineteen_prefix() {
        assert_eq!(parse_approval_date("Feb-9").unwrap(), date(199, 1, 31));
        assert_eq!(parse_approval_date("Feb-99").unwrap(), date(1999, 1, 31));
    }

    #[test]
    fn double_zero_dates_default_to_2000() {
        assert_eq!(parse_approval_date("Dec00").unwrap(), date(2000, 11, 30));
        assert_eq!(parse_approval_date("June 00").unwrap(), date(2000, 5, 31));
    }

    #[test]
    fn unknown_shapes_are_rejected() {
        for bad in ["2006/01/02", "Smarch-06", "Jan-06-07", "Foo00", "Jan-xx", "Janaury 2, 2006"] {
            assert!(parse_approval_date(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn full_dates_require_the_full_capitalized_month() {
        for bad in ["Jan 2, 2006", "january 2, 2006", "JANUARY 2, 2006", "Sept 5, 2010", ", 2006"] {
            assert!(parse_approval_date(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn getmedia_paths_are_rewritten_onto_media_host() {
        assert_eq!(
            normalize_image_url("~/getmedia/abc/ball.png"),
            "https://bowl.com/getmedia/abc/ball.png"
        );
        assert_eq!(
            normalize_image_url("https://images.bowl.com/x.jpg"),
            "https://images.bowl.com/x.jpg"
        );
        assert_eq!(normalize_image_url(""), NO_IMAGE_URL);
        assert_eq!(normalize_image_url("not a url"), NO_IMAGE_URL);
        // Only getmedia paths are anchored to the media host.
        assert_eq!(normalize_image_url("/images/x.jpg"), NO_IMAGE_URL);
    }

    #[test]
    fn brand_is_sent_base64url_encoded() {
        let client = UsbcClient::new(UsbcConfig::default()).unwrap();
        let url = client.brand_url(Brand::Global);
        let (key, value) = url.query_pairs().next().unwrap();
        assert_eq!(key, BRAND_QUERY_PARAM);
        assert_eq!(value, URL_SAFE.encode("900 Global"));
    }

    #[tokio::test]
    async fn list_balls_parses_and_filters_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/approvedballs"))
            .and(query_param(BRAND_QUERY_PARAM, URL_SAFE.encode("Storm")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"brandName": " Storm ", "name": " Phaze II ", "dateApproved": "January 2, 2006", "image": "~/getmedia/1/phaze.png"},
                {"brandName": "Storm", "name": "", "dateApproved": "Jan-06", "image": ""},
                {"brandName": "Storm", "name": "Nameless Date", "dateApproved": "  ", "image": ""},
                {"brandName": "Storm", "name": "IQ Tour", "dateApproved": "Jan-96", "image": null},
                {"brandName": "Storm", "name": "Old Timer", "dateApproved": "Dec00"}
            ])))
            .mount(&server)
            .await;

        let balls = client_for(&server).list_balls(Brand::Storm).await.unwrap();
        assert_eq!(balls.len(), 3);

        assert_eq!(balls[0].name, "Phaze II");
        assert_eq!(balls[0].brand, Brand::Storm);
        assert_eq!(balls[0].approval_date, date(2006, 1, 2));
        assert_eq!(balls[0].image_url, "https://bowl.com/getmedia/1/phaze.png");
        assert!(balls[0].id.is_none());

        assert_eq!(balls[1].approval_date, date(1995, 12, 31));
        assert_eq!(balls[1].image_url, NO_IMAGE_URL);
        assert_eq!(balls[2].approval_date, date(2000, 11, 30));
    }

    #[tokio::test]
    async fn empty_array_is_valid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let balls = client_for(&server).list_balls(Brand::Swag).await.unwrap();
        assert!(balls.is_empty());
    }

    #[tokio::test]
    async fn non_success_status_is_an_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let err = client_for(&server).list_balls(Brand::Hammer).await.unwrap_err();
        assert!(matches!(err, FetchError::Upstream { status: 503, .. }), "{err}");
    }

    #[tokio::test]
    async fn bad_date_fails_the_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"brandName": "Motiv", "name": "Jackal", "dateApproved": "someday", "image": ""}
            ])))
            .mount(&server)
            .await;

        let err = client_for(&server).list_balls(Brand::Motiv).await.unwrap_err();
        assert!(matches!(err, FetchError::DateFormat(_)), "{err}");
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"oops\":true}"))
            .mount(&server)
            .await;

        let err = client_for(&server).list_balls(Brand::Radical).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)), "{err}");
    }
}
