//! Reddit-style listing client
//!
//! Speaks the public JSON listing shape: `/r/{sub}/{sort}.json` pages of
//! posts, `/r/{sub}/comments/{id}.json` for each post's comment tree.
//! Every upstream request gets up to three attempts with exponential
//! backoff; a terminal failure ends the stream with the error attached so
//! the scrape stage can report a partial result.

use crate::stream::{ItemStream, SourceEvent};
use crate::ContentSource;
use chrono::{DateTime, TimeZone, Utc};
use pulse_common::config::SourceConfig;
use pulse_common::{Error, ItemKind, RawItem, Result, SortOrder, SourceParams};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(1000),
    Duration::from_millis(4000),
];

/// Largest page the listing API serves
const MAX_PAGE_SIZE: u32 = 100;

const DEFAULT_USER_AGENT: &str = "pulse-platform/0.1";

/// HTTP content source against a Reddit-style API
pub struct RedditSource {
    http: reqwest::Client,
    base_url: String,
    page_timeout: Duration,
}

impl RedditSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let user_agent = config
            .credentials
            .get("user_agent")
            .map(String::as_str)
            .unwrap_or(DEFAULT_USER_AGENT);
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::Config(format!("cannot build source http client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_timeout: config.page_timeout(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.request_once(url).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    let delay = BACKOFF[(attempt - 1) as usize];
                    warn!(url, attempt, error = %e, "source request failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Internal("retry loop exhausted".into())))
    }

    async fn request_once<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .timeout(self.page_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("source page timed out: {}", e))
                } else {
                    Error::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Service {
                status: status.as_u16(),
                message: format!("source answered {}", status),
            });
        }

        response
            .json()
            .await
            .map_err(|e| Error::Decode(format!("malformed listing: {}", e)))
    }

    fn listing_url(&self, params: &SourceParams, after: Option<&str>, page_size: u32) -> String {
        let mut url = match &params.query {
            Some(q) => format!(
                "{}/r/{}/search.json?q={}&restrict_sr=1&sort={}&limit={}",
                self.base_url,
                params.subreddit,
                urlencode(q),
                params.sort.as_str(),
                page_size
            ),
            None => format!(
                "{}/r/{}/{}.json?limit={}",
                self.base_url,
                params.subreddit,
                params.sort.as_str(),
                page_size
            ),
        };
        if params.sort == SortOrder::Top || params.query.is_some() {
            url.push_str(&format!("&t={}", params.time_window.as_str()));
        }
        if let Some(after) = after {
            url.push_str(&format!("&after={}", after));
        }
        url
    }

    fn comments_url(&self, params: &SourceParams, post_id: &str) -> String {
        format!(
            "{}/r/{}/comments/{}.json?limit={}",
            self.base_url, params.subreddit, post_id, params.comment_limit_per_post
        )
    }

    async fn run(&self, params: SourceParams, tx: mpsc::Sender<SourceEvent>) {
        let mut fetched_posts = 0u32;
        let mut after: Option<String> = None;

        while fetched_posts < params.post_limit {
            let page_size = (params.post_limit - fetched_posts).min(MAX_PAGE_SIZE);
            let url = self.listing_url(&params, after.as_deref(), page_size);
            debug!(url, "fetching listing page");

            let listing: Listing = match self.get_json(&url).await {
                Ok(l) => l,
                Err(e) => {
                    let _ = tx.send(SourceEvent::Failed(e)).await;
                    return;
                }
            };

            let page_after = listing.data.after.clone();
            let posts: Vec<RawItem> = listing
                .data
                .children
                .into_iter()
                .filter(|c| c.kind == "t3")
                .filter_map(|c| c.data.into_post(&params.subreddit))
                .collect();

            if posts.is_empty() {
                break;
            }

            for post in posts {
                if fetched_posts >= params.post_limit {
                    break;
                }
                fetched_posts += 1;
                let post_id = post.id.clone();
                if tx.send(SourceEvent::Item(post)).await.is_err() {
                    return; // consumer gone
                }

                if params.comment_limit_per_post > 0 {
                    match self.fetch_comments(&params, &post_id).await {
                        Ok(comments) => {
                            for comment in comments {
                                if tx.send(SourceEvent::Item(comment)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(SourceEvent::Failed(e)).await;
                            return;
                        }
                    }
                }
            }

            after = page_after;
            if after.is_none() {
                break;
            }
        }
    }

    async fn fetch_comments(&self, params: &SourceParams, post_id: &str) -> Result<Vec<RawItem>> {
        let url = self.comments_url(params, post_id);
        debug!(url, "fetching comments");
        let listings: Vec<Listing> = self.get_json(&url).await?;

        // the comments endpoint answers [post listing, comment listing]
        let comments = listings
            .into_iter()
            .nth(1)
            .map(|l| l.data.children)
            .unwrap_or_default();

        Ok(comments
            .into_iter()
            .filter(|c| c.kind == "t1")
            .take(params.comment_limit_per_post as usize)
            .filter_map(|c| c.data.into_comment(&params.subreddit, post_id))
            .collect())
    }
}

impl ContentSource for RedditSource {
    fn fetch(&self, params: SourceParams) -> ItemStream {
        let (tx, rx) = mpsc::channel(64);
        let source = RedditSource {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            page_timeout: self.page_timeout,
        };
        tokio::spawn(async move {
            source.run(params, tx).await;
        });
        ItemStream::new(rx)
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '~' => out.push(c),
            other => {
                let mut buf = [0u8; 4];
                for b in other.encode_utf8(&mut buf).as_bytes() {
                    out.push_str(&format!("%{:02X}", b));
                }
            }
        }
    }
    out
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Child {
    kind: String,
    data: ChildData,
}

#[derive(Debug, Default, Deserialize)]
struct ChildData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    selftext: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    score: Option<i64>,
    #[serde(default)]
    upvote_ratio: Option<f64>,
    #[serde(default)]
    created_utc: Option<f64>,
    #[serde(default)]
    parent_id: Option<String>,
}

impl ChildData {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_utc
            .and_then(|secs| Utc.timestamp_opt(secs as i64, 0).single())
            .unwrap_or_else(Utc::now)
    }

    fn into_post(self, subreddit: &str) -> Option<RawItem> {
        let id = self.id.clone()?;
        Some(RawItem {
            created_at: self.created_at(),
            id,
            kind: ItemKind::Post,
            parent_id: None,
            author: self.author,
            subreddit: subreddit.to_string(),
            title: self.title,
            body: self.selftext.unwrap_or_default(),
            score: self.score,
            upvote_ratio: self.upvote_ratio,
        })
    }

    fn into_comment(self, subreddit: &str, post_id: &str) -> Option<RawItem> {
        let id = self.id.clone()?;
        let body = self.body.clone()?;
        Some(RawItem {
            created_at: self.created_at(),
            id,
            kind: ItemKind::Comment,
            parent_id: Some(self.parent_id.unwrap_or_else(|| post_id.to_string())),
            author: self.author,
            subreddit: subreddit.to_string(),
            title: None,
            body,
            score: self.score,
            upvote_ratio: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> SourceConfig {
        SourceConfig {
            base_url: server.uri(),
            page_timeout_ms: 2_000,
            credentials: Default::default(),
        }
    }

    fn params(post_limit: u32, comments: u32) -> SourceParams {
        SourceParams {
            subreddit: "ucla".into(),
            post_limit,
            comment_limit_per_post: comments,
            sort: SortOrder::Hot,
            time_window: Default::default(),
            query: None,
        }
    }

    fn post_json(id: &str, title: &str, body: &str) -> serde_json::Value {
        serde_json::json!({
            "kind": "t3",
            "data": {
                "id": id,
                "author": "student",
                "title": title,
                "selftext": body,
                "score": 10,
                "upvote_ratio": 0.9,
                "created_utc": 1_700_000_000.0
            }
        })
    }

    fn listing_json(children: Vec<serde_json::Value>, after: Option<&str>) -> serde_json::Value {
        serde_json::json!({"data": {"children": children, "after": after}})
    }

    #[tokio::test]
    async fn fetches_posts_without_comments() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/ucla/hot.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_json(
                vec![post_json("p1", "one", "alpha"), post_json("p2", "two", "beta")],
                None,
            )))
            .mount(&server)
            .await;

        let source = RedditSource::new(&config(&server)).unwrap();
        let mut stream = source.fetch(params(5, 0));

        let first = stream.next().await.unwrap();
        assert_eq!(first.id, "p1");
        assert_eq!(first.kind, ItemKind::Post);
        assert_eq!(first.title.as_deref(), Some("one"));
        let second = stream.next().await.unwrap();
        assert_eq!(second.id, "p2");
        assert!(stream.next().await.is_none());
        assert!(stream.error().is_none());
    }

    #[tokio::test]
    async fn posts_are_followed_by_their_comments() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/ucla/hot.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_json(
                vec![post_json("p1", "one", "alpha")],
                None,
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/ucla/comments/p1.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                listing_json(vec![], None),
                listing_json(
                    vec![
                        serde_json::json!({"kind": "t1", "data": {"id": "c1", "body": "nice", "author": "a", "parent_id": "t3_p1"}}),
                        serde_json::json!({"kind": "t1", "data": {"id": "c2", "body": "meh", "author": "b"}})
                    ],
                    None
                )
            ])))
            .mount(&server)
            .await;

        let source = RedditSource::new(&config(&server)).unwrap();
        let mut stream = source.fetch(params(1, 2));

        assert_eq!(stream.next().await.unwrap().id, "p1");
        let c1 = stream.next().await.unwrap();
        assert_eq!(c1.kind, ItemKind::Comment);
        assert_eq!(c1.parent_id.as_deref(), Some("t3_p1"));
        let c2 = stream.next().await.unwrap();
        assert_eq!(c2.parent_id.as_deref(), Some("p1"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn post_limit_bounds_the_sequence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/ucla/hot.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_json(
                vec![
                    post_json("p1", "one", "a"),
                    post_json("p2", "two", "b"),
                    post_json("p3", "three", "c"),
                ],
                Some("t3_p3"),
            )))
            .mount(&server)
            .await;

        let source = RedditSource::new(&config(&server)).unwrap();
        let mut stream = source.fetch(params(2, 0));

        let mut ids = Vec::new();
        while let Some(item) = stream.next().await {
            ids.push(item.id);
        }
        assert_eq!(ids, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/ucla/hot.json"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/r/ucla/hot.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_json(
                vec![post_json("p1", "one", "a")],
                None,
            )))
            .mount(&server)
            .await;

        let source = RedditSource::new(&config(&server)).unwrap();
        let mut stream = source.fetch(params(1, 0));
        assert_eq!(stream.next().await.unwrap().id, "p1");
        assert!(stream.error().is_none());
    }

    #[tokio::test]
    async fn terminal_failure_ends_with_the_error_attached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/ucla/hot.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = RedditSource::new(&config(&server)).unwrap();
        let mut stream = source.fetch(params(1, 0));
        assert!(stream.next().await.is_none());
        assert!(matches!(stream.error(), Some(Error::Service { status: 404, .. })));
    }

    #[tokio::test]
    async fn search_listing_carries_the_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/r/ucla/search.json"))
            .and(query_param("q", "finals week"))
            .and(query_param("restrict_sr", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_json(
                vec![post_json("p1", "finals", "week")],
                None,
            )))
            .mount(&server)
            .await;

        let source = RedditSource::new(&config(&server)).unwrap();
        let mut p = params(1, 0);
        p.query = Some("finals week".into());
        let mut stream = source.fetch(p);
        assert_eq!(stream.next().await.unwrap().id, "p1");
    }
}
