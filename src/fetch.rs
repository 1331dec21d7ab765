use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use spider_client::shapes::request::{ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::reader::FieldReader;

/// Result of loading one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub content: String,
    pub success: bool,
}

impl Fetched {
    pub fn ok(content: impl Into<String>) -> Self {
        Fetched {
            content: content.into(),
            success: true,
        }
    }

    pub fn failed() -> Self {
        Fetched {
            content: String::new(),
            success: false,
        }
    }

    /// Content of a successful fetch, or a retryable error.
    pub fn into_result(self, url: &str) -> Result<String> {
        if self.success {
            Ok(self.content)
        } else {
            Err(PipelineError::fetch(url, "fetch unsuccessful"))
        }
    }
}

/// Remote content loader. Implementations handle transport, waits and any
/// dynamic disclosure; callers only see markup and a success flag.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Fetched;

    /// Trigger the page's contact disclosure and return the markup that
    /// results. The default leaves the page as fetched.
    async fn perform_reveal_action(&self, _url: &str, content: String) -> String {
        content
    }
}

/// Plain HTTP loader. The reveal action follows the page's reply link and
/// appends whatever it returns.
pub struct HttpFetcher {
    client: reqwest::Client,
    reader: Arc<dyn FieldReader>,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration, reader: Arc<dyn FieldReader>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Configuration(format!("cannot build HTTP client: {}", e)))?;
        Ok(HttpFetcher { client, reader })
    }

    async fn get(&self, url: &str) -> std::result::Result<String, reqwest::Error> {
        self.client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Fetched {
        match self.get(url).await {
            Ok(body) => Fetched::ok(body),
            Err(e) => {
                warn!(url, "Error navigating to {}: {}", url, e);
                Fetched::failed()
            }
        }
    }

    async fn perform_reveal_action(&self, url: &str, content: String) -> String {
        let Some(href) = self.reader.reveal_link(&content) else {
            debug!(url, "no reply affordance");
            return content;
        };
        let target = match Url::parse(url).and_then(|base| base.join(&href)) {
            Ok(target) => target,
            Err(e) => {
                warn!(url, href = %href, "bad reply link: {}", e);
                return content;
            }
        };
        match self.get(target.as_str()).await {
            Ok(revealed) => format!("{}\n{}", content, revealed),
            Err(e) => {
                warn!(url, "reply disclosure failed: {}", e);
                content
            }
        }
    }
}

/// Rendered-page loader backed by spider.cloud.
pub struct SpiderFetcher {
    spider: Spider,
}

impl SpiderFetcher {
    /// Reads the API key from `SPIDER_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("SPIDER_API_KEY").map_err(|_| {
            PipelineError::Configuration("SPIDER_API_KEY environment variable must be set".into())
        })?;
        let spider = Spider::new(Some(api_key)).map_err(|e| {
            PipelineError::Configuration(format!("Failed to create Spider client: {}", e))
        })?;
        Ok(SpiderFetcher { spider })
    }
}

#[async_trait]
impl Fetcher for SpiderFetcher {
    async fn fetch(&self, url: &str) -> Fetched {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            ..Default::default()
        };

        let response = match self
            .spider
            .scrape_url(url, Some(params), "application/json")
            .await
        {
            Ok(value) => value,
            Err(e) => {
                warn!(url, "Spider scrape failed: {}", e);
                return Fetched::failed();
            }
        };

        let parsed: serde_json::Value = match response.as_str() {
            Some(s) => serde_json::from_str(s).unwrap_or(response.clone()),
            None => response,
        };
        let first = parsed.as_array().and_then(|arr| arr.first());
        let content = first
            .and_then(|obj| obj.get("content"))
            .and_then(|c| c.as_str());
        let status = first
            .and_then(|obj| obj.get("status"))
            .and_then(|s| s.as_i64());

        match (content, status) {
            (Some(content), None) => Fetched::ok(content),
            (Some(content), Some(s)) if (200..300).contains(&s) => Fetched::ok(content),
            (_, status) => {
                warn!(url, ?status, "No content in spider response");
                Fetched::failed()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use super::*;

    /// In-memory fetcher with canned pages. Unknown URLs fail, as do URLs
    /// listed in `failing`.
    #[derive(Default)]
    pub struct ScriptedFetcher {
        pages: HashMap<String, String>,
        reveals: HashMap<String, String>,
        failing: Mutex<HashSet<String>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn page(mut self, url: &str, content: impl Into<String>) -> Self {
            self.pages.insert(url.to_string(), content.into());
            self
        }

        /// Markup appended by the reveal action for `url`.
        pub fn reveal(mut self, url: &str, content: impl Into<String>) -> Self {
            self.reveals.insert(url.to_string(), content.into());
            self
        }

        pub fn fail(&self, url: &str) {
            self.failing.lock().unwrap().insert(url.to_string());
        }

        pub fn heal(&self, url: &str) {
            self.failing.lock().unwrap().remove(url);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_to(&self, url: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == url).count()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Fetched {
            self.calls.lock().unwrap().push(url.to_string());
            if self.failing.lock().unwrap().contains(url) {
                return Fetched::failed();
            }
            match self.pages.get(url) {
                Some(page) => Fetched::ok(page.clone()),
                None => Fetched::failed(),
            }
        }

        async fn perform_reveal_action(&self, url: &str, content: String) -> String {
            match self.reveals.get(url) {
                Some(extra) => format!("{}\n{}", content, extra),
                None => content,
            }
        }
    }
}
