//! Feed source contracts, the map-feed adapter, and marker mapping.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use homefeed_core::ListingDraft;
use homefeed_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "homefeed-adapters";

pub const MAP_FEED_SOURCE_ID: &str = "yad2-map";
pub const DEFAULT_FEED_ENDPOINT: &str = "https://gw.yad2.co.il/realestate-feed/forsale/map";

/// The upstream gateway rejects requests that do not look like they come from
/// its own web app.
pub const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("Accept", "application/json, text/plain, */*"),
    ("Accept-Language", "he-IL,he;q=0.9,en-US;q=0.8,en;q=0.7"),
    ("Connection", "keep-alive"),
    ("Origin", "https://www.yad2.co.il"),
    ("Referer", "https://www.yad2.co.il/"),
    ("Sec-Fetch-Dest", "empty"),
    ("Sec-Fetch-Mode", "cors"),
    ("Sec-Fetch-Site", "same-site"),
    (
        "User-Agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    ),
    (
        "sec-ch-ua",
        "\"Chromium\";v=\"130\", \"Google Chrome\";v=\"130\", \"Not?A_Brand\";v=\"99\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("network error: {0}")]
    Network(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("reading fixture feed {path}: {source}")]
    Fixture {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fetches the full marker list. Any failure discards the whole response.
    async fn fetch_markers(&self, ctx: &FeedContext) -> Result<Vec<Marker>, FeedError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub token: String,
    pub order_id: i64,
    pub price: i64,
    pub address: Option<MarkerAddress>,
    pub additional_details: Option<MarkerDetails>,
    pub meta_data: Option<MarkerMetaData>,
    /// The marker's JSON text exactly as it appeared in the response.
    #[serde(skip)]
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TextField {
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarkerAddress {
    pub city: Option<TextField>,
    pub neighborhood: Option<TextField>,
    pub area: Option<TextField>,
    pub street: Option<TextField>,
    pub house: Option<MarkerHouse>,
    pub coords: Option<MarkerCoords>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarkerHouse {
    pub number: Option<i32>,
    pub floor: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarkerCoords {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerDetails {
    pub property: Option<TextField>,
    pub rooms_count: Option<f64>,
    pub square_meter: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerMetaData {
    pub cover_image: Option<String>,
    pub images: Option<Vec<String>>,
    pub square_meter_build: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    data: FeedData,
}

#[derive(Debug, Deserialize)]
struct FeedData {
    markers: Vec<Box<RawValue>>,
}

/// Parses a `{ data: { markers: [...] } }` body. A single malformed marker
/// fails the whole body.
pub fn parse_feed_body(body: &[u8]) -> Result<Vec<Marker>, serde_json::Error> {
    let envelope: FeedEnvelope = serde_json::from_slice(body)?;
    envelope
        .data
        .markers
        .into_iter()
        .map(|raw| {
            let mut marker: Marker = serde_json::from_str(raw.get())?;
            marker.raw = raw.get().to_string();
            Ok(marker)
        })
        .collect()
}

fn text_of(field: Option<&TextField>) -> Option<String> {
    field.and_then(|f| f.text.clone())
}

/// Maps a marker onto the full set of creation attributes.
pub fn marker_to_draft(marker: &Marker) -> ListingDraft {
    let address = marker.address.clone().unwrap_or_default();
    let details = marker.additional_details.clone().unwrap_or_default();
    let meta = marker.meta_data.clone().unwrap_or_default();
    let house = address.house.unwrap_or_default();
    let coords = address.coords.unwrap_or_default();

    let square_meters = details
        .square_meter
        .filter(|sqm| *sqm != 0.0)
        .or(meta.square_meter_build);

    ListingDraft {
        id: marker.token.clone(),
        external_numeric_id: marker.order_id,
        price: marker.price,
        city: text_of(address.city.as_ref()),
        neighborhood: text_of(address.neighborhood.as_ref()),
        area: text_of(address.area.as_ref()),
        street: text_of(address.street.as_ref()),
        house_number: house.number,
        floor: house.floor,
        lat: coords.lat,
        lon: coords.lon,
        rooms: details.rooms_count,
        square_meters,
        property_type: text_of(details.property.as_ref()),
        cover_image: meta.cover_image,
        images: meta.images.unwrap_or_default(),
        raw_data: marker.raw.clone(),
    }
}

/// Fixed search criteria baked into every feed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapFeedQuery {
    pub city: &'static str,
    pub area: &'static str,
    pub top_area: &'static str,
    pub min_rooms: u32,
    pub max_rooms: u32,
    pub zoom: u32,
}

impl Default for MapFeedQuery {
    fn default() -> Self {
        Self {
            city: "0831",
            area: "89",
            top_area: "43",
            min_rooms: 3,
            max_rooms: 3,
            zoom: 12,
        }
    }
}

impl MapFeedQuery {
    pub fn url(&self, endpoint: &str) -> String {
        format!(
            "{}?city={}&area={}&topArea={}&minRooms={}&maxRooms={}&zoom={}",
            endpoint.trim_end_matches('?'),
            self.city,
            self.area,
            self.top_area,
            self.min_rooms,
            self.max_rooms,
            self.zoom
        )
    }
}

#[derive(Debug, Clone)]
pub struct MapFeedAdapter {
    http: HttpFetcher,
    endpoint: String,
    query: MapFeedQuery,
}

impl MapFeedAdapter {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            query: MapFeedQuery::default(),
        }
    }

    pub fn from_client_config(
        config: HttpClientConfig,
        endpoint: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self::new(HttpFetcher::new(config)?, endpoint))
    }

    pub fn request_url(&self) -> String {
        self.query.url(&self.endpoint)
    }
}

#[async_trait]
impl FeedSource for MapFeedAdapter {
    fn source_id(&self) -> &'static str {
        MAP_FEED_SOURCE_ID
    }

    async fn fetch_markers(&self, ctx: &FeedContext) -> Result<Vec<Marker>, FeedError> {
        let url = self.request_url();
        let resp = self
            .http
            .fetch_bytes(ctx.run_id, self.source_id(), &url, BROWSER_HEADERS)
            .await?;
        let markers = parse_feed_body(&resp.body)?;
        info!(run_id = %ctx.run_id, markers = markers.len(), "fetched markers from feed");
        Ok(markers)
    }
}

/// Reads a captured feed response from disk instead of the network.
#[derive(Debug, Clone)]
pub struct FixtureFeedSource {
    path: PathBuf,
}

impl FixtureFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub async fn load_fixture_feed(path: impl AsRef<Path>) -> Result<Vec<Marker>, FeedError> {
    let path = path.as_ref();
    let body = tokio::fs::read(path)
        .await
        .map_err(|source| FeedError::Fixture {
            path: path.display().to_string(),
            source,
        })?;
    Ok(parse_feed_body(&body)?)
}

#[async_trait]
impl FeedSource for FixtureFeedSource {
    fn source_id(&self) -> &'static str {
        MAP_FEED_SOURCE_ID
    }

    async fn fetch_markers(&self, ctx: &FeedContext) -> Result<Vec<Marker>, FeedError> {
        let markers = load_fixture_feed(&self.path).await?;
        info!(
            run_id = %ctx.run_id,
            markers = markers.len(),
            fixture = %self.path.display(),
            "loaded markers from fixture feed"
        );
        Ok(markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn sample_feed_path() -> PathBuf {
        workspace_root()
            .join("fixtures")
            .join(MAP_FEED_SOURCE_ID)
            .join("sample")
            .join("feed.json")
    }

    #[test]
    fn full_marker_maps_every_creation_field() {
        let body = br#"{"data":{"markers":[{
            "token":"abc123","orderId":991,"price":1500000,
            "address":{"city":{"text":"Ramat Gan"},"neighborhood":{"text":"Merom Nave"},
                "area":{"text":"Center"},"street":{"text":"Bialik"},
                "house":{"number":12,"floor":4},"coords":{"lat":32.08,"lon":34.81}},
            "additionalDetails":{"property":{"text":"Apartment"},"roomsCount":3,"squareMeter":80},
            "metaData":{"coverImage":"https://img.test/c.jpg","images":["https://img.test/1.jpg","https://img.test/2.jpg"],"squareMeterBuild":85}
        }]}}"#;
        let markers = parse_feed_body(body).unwrap();
        let draft = marker_to_draft(&markers[0]);

        assert_eq!(draft.id, "abc123");
        assert_eq!(draft.external_numeric_id, 991);
        assert_eq!(draft.price, 1_500_000);
        assert_eq!(draft.city.as_deref(), Some("Ramat Gan"));
        assert_eq!(draft.neighborhood.as_deref(), Some("Merom Nave"));
        assert_eq!(draft.area.as_deref(), Some("Center"));
        assert_eq!(draft.street.as_deref(), Some("Bialik"));
        assert_eq!(draft.house_number, Some(12));
        assert_eq!(draft.floor, Some(4));
        assert_eq!(draft.lat, Some(32.08));
        assert_eq!(draft.lon, Some(34.81));
        assert_eq!(draft.rooms, Some(3.0));
        assert_eq!(draft.square_meters, Some(80.0));
        assert_eq!(draft.property_type.as_deref(), Some("Apartment"));
        assert_eq!(draft.cover_image.as_deref(), Some("https://img.test/c.jpg"));
        assert_eq!(draft.images.len(), 2);
        assert!(draft.raw_data.starts_with('{'));
        assert!(draft.raw_data.contains("\"token\":\"abc123\""));
    }

    #[test]
    fn zero_square_meter_falls_back_to_build_figure() {
        let body = br#"{"data":{"markers":[{"token":"t","orderId":1,"price":1,
            "additionalDetails":{"squareMeter":0},"metaData":{"squareMeterBuild":95}}]}}"#;
        let draft = marker_to_draft(&parse_feed_body(body).unwrap()[0]);
        assert_eq!(draft.square_meters, Some(95.0));

        let body = br#"{"data":{"markers":[{"token":"t","orderId":1,"price":1,
            "metaData":{"squareMeterBuild":70}}]}}"#;
        let draft = marker_to_draft(&parse_feed_body(body).unwrap()[0]);
        assert_eq!(draft.square_meters, Some(70.0));
    }

    #[test]
    fn absent_nested_fields_are_stored_as_absent() {
        let body = br#"{"data":{"markers":[{"token":"bare","orderId":5,"price":10,
            "address":{"city":{"text":"Holon"},"neighborhood":null}}]}}"#;
        let draft = marker_to_draft(&parse_feed_body(body).unwrap()[0]);

        assert_eq!(draft.city.as_deref(), Some("Holon"));
        assert_eq!(draft.neighborhood, None);
        assert_eq!(draft.street, None);
        assert_eq!(draft.house_number, None);
        assert_eq!(draft.floor, None);
        assert_eq!(draft.lat, None);
        assert_eq!(draft.rooms, None);
        assert_eq!(draft.square_meters, None);
        assert!(draft.images.is_empty());
    }

    #[test]
    fn raw_data_keeps_marker_text_verbatim() {
        let body = br#"{"data":{"markers":[{"token":"z","price":3,"orderId":2,"extra":{"b":1,"a":2}}]}}"#;
        let markers = parse_feed_body(body).unwrap();
        assert_eq!(
            markers[0].raw,
            r#"{"token":"z","price":3,"orderId":2,"extra":{"b":1,"a":2}}"#
        );
    }

    #[test]
    fn malformed_bodies_are_parse_errors() {
        assert!(parse_feed_body(b"<html>blocked</html>").is_err());
        assert!(parse_feed_body(br#"{"data":{}}"#).is_err());
        assert!(parse_feed_body(br#"{"data":{"markers":[{"token":"no-price","orderId":1}]}}"#).is_err());
    }

    #[test]
    fn request_url_carries_fixed_query() {
        let query = MapFeedQuery::default();
        assert_eq!(
            query.url(DEFAULT_FEED_ENDPOINT),
            "https://gw.yad2.co.il/realestate-feed/forsale/map?city=0831&area=89&topArea=43&minRooms=3&maxRooms=3&zoom=12"
        );
    }

    #[test]
    fn browser_headers_include_origin_and_referer() {
        let names: Vec<_> = BROWSER_HEADERS.iter().map(|(k, _)| *k).collect();
        assert!(names.contains(&"Origin"));
        assert!(names.contains(&"Referer"));
        assert!(names.contains(&"User-Agent"));
    }

    #[tokio::test]
    async fn fixture_source_reads_sample_feed() {
        let source = FixtureFeedSource::new(sample_feed_path());
        let markers = source
            .fetch_markers(&FeedContext {
                run_id: Uuid::new_v4(),
            })
            .await
            .unwrap();
        assert_eq!(markers.len(), 3);
        assert!(markers.iter().all(|m| !m.raw.is_empty()));
    }

    #[tokio::test]
    async fn missing_fixture_is_reported_with_its_path() {
        let err = load_fixture_feed("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, FeedError::Fixture { .. }));
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }

    /// Answers one request on a local port with `status` and `body`, and
    /// returns the endpoint plus the raw request text.
    async fn serve_once(status: &str, body: &str) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.expect("write");
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf).to_string()
        });
        (format!("http://{addr}/realestate-feed/forsale/map"), handle)
    }

    fn ctx() -> FeedContext {
        FeedContext {
            run_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn adapter_sends_fixed_query_and_browser_headers() {
        let body = std::fs::read_to_string(sample_feed_path()).expect("sample feed");
        let (endpoint, server) = serve_once("200 OK", &body).await;
        let adapter =
            MapFeedAdapter::from_client_config(HttpClientConfig::default(), endpoint).unwrap();

        let markers = adapter.fetch_markers(&ctx()).await.unwrap();
        assert_eq!(markers.len(), 3);
        assert_eq!(markers[0].token, "abc123");

        let request = server.await.expect("server").to_ascii_lowercase();
        assert!(request.starts_with(
            "get /realestate-feed/forsale/map?city=0831&area=89&toparea=43&minrooms=3&maxrooms=3&zoom=12 "
        ));
        for (name, value) in BROWSER_HEADERS {
            // hyper manages the connection header itself
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            let line = format!("{}: {}", name, value).to_ascii_lowercase();
            assert!(request.contains(&line), "missing header line {line:?}");
        }
    }

    #[tokio::test]
    async fn server_error_surfaces_as_network_error() {
        let (endpoint, server) = serve_once("503 Service Unavailable", "").await;
        let adapter =
            MapFeedAdapter::from_client_config(HttpClientConfig::default(), endpoint).unwrap();

        let err = adapter.fetch_markers(&ctx()).await.unwrap_err();
        assert!(matches!(
            err,
            FeedError::Network(FetchError::HttpStatus { status: 503, .. })
        ));
        server.await.expect("server");
    }

    #[tokio::test]
    async fn html_challenge_page_surfaces_as_parse_error() {
        let (endpoint, server) =
            serve_once("200 OK", "<html><body>Are you a robot?</body></html>").await;
        let adapter =
            MapFeedAdapter::from_client_config(HttpClientConfig::default(), endpoint).unwrap();

        let err = adapter.fetch_markers(&ctx()).await.unwrap_err();
        assert!(matches!(err, FeedError::Parse(_)));
        server.await.expect("server");
    }
}
