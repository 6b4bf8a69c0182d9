//! Platform scraper adapter for myMoment.
//!
//! A [`PlatformSession`] is a stateful, cookie-bearing HTTP session tied to
//! one platform login: it authenticates through the HTML login form, lists
//! and filters article index pages, fetches article detail pages, and
//! submits comment forms. Every outbound request first passes through the
//! scraping rate limiter's per-domain delay.
//!
//! Cookies are managed explicitly (name → value) so the full session state
//! can be exported to and restored from an encrypted JSON blob by the
//! session manager.

pub mod parse;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{COOKIE, REFERER, SET_COOKIE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::ScrapeError;
use crate::ratelimit::ScrapingRateLimiter;

/// Maximum redirects followed per logical request.
const MAX_REDIRECTS: usize = 5;

/// Kind of an article index tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabKind {
    /// The login's own articles.
    Home,
    /// All visible articles.
    Alle,
    /// A class tab carrying a numeric class id.
    Class,
}

/// A tab available in the article index navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabDescriptor {
    /// Numeric class id for class tabs.
    pub id: Option<i64>,
    /// Human-readable tab label.
    pub label: String,
    /// Tab kind.
    pub kind: TabKind,
    /// Raw tab value usable as a `tab` query parameter (e.g. `class:12`).
    pub value: String,
}

/// Article metadata as listed on an index page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleMetadata {
    /// Platform-assigned article id.
    pub id: String,
    pub title: String,
    pub author: String,
    pub category_id: Option<i64>,
    pub task_id: Option<i64>,
    pub url: String,
}

/// Full article content from a detail page.
#[derive(Debug, Clone)]
pub struct ArticleDetail {
    pub metadata: ArticleMetadata,
    /// Whitespace-normalized plain text body.
    pub content: String,
    /// Raw HTML of the content element.
    pub raw_html: String,
    pub published_at: Option<DateTime<Utc>>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// Index filters applied when listing articles.
#[derive(Debug, Clone, Default)]
pub struct ArticleFilters {
    /// Tab to list (required; e.g. `alle` or `class:12`).
    pub tab: Option<String>,
    pub category: Option<i64>,
    pub task: Option<i64>,
    pub search: Option<String>,
    pub sort: Option<String>,
}

/// Serializable session state (persisted encrypted by the session manager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub cookies: BTreeMap<String, String>,
    pub csrf_token: Option<String>,
    pub authenticated: bool,
}

/// A cookie-bearing scraping session against the myMoment platform.
pub struct PlatformSession {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<ScrapingRateLimiter>,
    cookies: BTreeMap<String, String>,
    csrf_token: Option<String>,
    authenticated: bool,
}

impl std::fmt::Debug for PlatformSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformSession")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.authenticated)
            .field("cookie_count", &self.cookies.len())
            .finish_non_exhaustive()
    }
}

impl PlatformSession {
    /// Create an unauthenticated session.
    ///
    /// Redirects are handled manually so cookies set on intermediate
    /// responses (the login redirect carries the session cookie) are kept.
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        limiter: Arc<ScrapingRateLimiter>,
    ) -> Result<Self, ScrapeError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ScrapeError::Network { source: e })?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
            cookies: BTreeMap::new(),
            csrf_token: None,
            authenticated: false,
        })
    }

    /// Restore a session from previously exported state.
    pub fn from_state(
        base_url: &str,
        request_timeout: Duration,
        limiter: Arc<ScrapingRateLimiter>,
        state: SessionState,
    ) -> Result<Self, ScrapeError> {
        let mut session = Self::new(base_url, request_timeout, limiter)?;
        session.cookies = state.cookies;
        session.csrf_token = state.csrf_token;
        session.authenticated = state.authenticated;
        Ok(session)
    }

    /// Export the session state for persistence.
    pub fn export_state(&self) -> SessionState {
        SessionState {
            cookies: self.cookies.clone(),
            csrf_token: self.csrf_token.clone(),
            authenticated: self.authenticated,
        }
    }

    /// Whether the session currently believes itself authenticated.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Authenticate against the platform login form.
    ///
    /// Fetches the login page for a CSRF token, posts the credentials, and
    /// follows the redirect chain. The CSRF token rotates after login, so a
    /// follow-up index fetch refreshes it.
    pub async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), ScrapeError> {
        let login_url = format!("{}/accounts/login/", self.base_url);

        let (status, body) = self.request(Method::GET, login_url.clone(), None).await?;
        if !status.is_success() {
            return Err(ScrapeError::Http {
                status: status.as_u16(),
                message: "login page unavailable".to_string(),
            });
        }
        let csrf = parse::extract_csrf_token(&body).ok_or_else(|| ScrapeError::UnexpectedHtml {
            message: "login page has no CSRF token".to_string(),
        })?;

        let form = vec![
            ("csrfmiddlewaretoken".to_string(), csrf),
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
        ];
        let (status, body) = self
            .request(Method::POST, login_url, Some(&form))
            .await?;

        // A failed login re-renders the form with a 200.
        if !status.is_success() || parse::is_login_page(&body) {
            self.authenticated = false;
            return Err(ScrapeError::AuthFailed {
                message: "platform rejected the credentials".to_string(),
            });
        }

        self.authenticated = true;
        if let Some(token) = parse::extract_csrf_token(&body) {
            self.csrf_token = Some(token);
        }

        tracing::debug!(base_url = %self.base_url, "platform session authenticated");
        Ok(())
    }

    /// List the tabs visible to this session.
    pub async fn list_tabs(&mut self) -> Result<Vec<TabDescriptor>, ScrapeError> {
        let url = format!("{}/articles/", self.base_url);
        let (status, body) = self.request(Method::GET, url, None).await?;
        self.check_page(status, &body)?;
        Ok(parse::parse_tabs(&body))
    }

    /// List articles on an index page, applying filters, up to `limit`.
    ///
    /// The tab filter is required: without it the platform would fall back
    /// to an unpredictable default listing.
    pub async fn list_articles(
        &mut self,
        filters: &ArticleFilters,
        limit: usize,
    ) -> Result<Vec<ArticleMetadata>, ScrapeError> {
        let tab = filters
            .tab
            .as_deref()
            .ok_or_else(|| ScrapeError::MissingFilter {
                field: "tab_filter".to_string(),
            })?;

        let mut url = format!("{}/articles/?tab={tab}", self.base_url);
        if let Some(category) = filters.category {
            url.push_str(&format!("&category={category}"));
        }
        if let Some(task) = filters.task {
            url.push_str(&format!("&task={task}"));
        }
        if let Some(search) = filters.search.as_deref() {
            if !search.is_empty() {
                url.push_str(&format!(
                    "&search={}",
                    url::form_urlencoded::byte_serialize(search.as_bytes()).collect::<String>()
                ));
            }
        }
        if let Some(sort) = filters.sort.as_deref() {
            url.push_str(&format!("&sort={sort}"));
        }

        let (status, body) = self.request(Method::GET, url, None).await?;
        self.check_page(status, &body)?;

        let mut articles = parse::parse_article_index(&body, &self.base_url);
        articles.truncate(limit);
        Ok(articles)
    }

    /// Fetch an article's full content.
    pub async fn fetch_article(&mut self, article_id: &str) -> Result<ArticleDetail, ScrapeError> {
        let url = format!("{}/article/{article_id}/", self.base_url);
        let (status, body) = self.request(Method::GET, url, None).await?;
        self.check_page(status, &body)?;
        parse::parse_article_detail(&body, article_id, &self.base_url)
    }

    /// Post a comment on an article, returning the platform-assigned
    /// comment id.
    pub async fn post_comment(
        &mut self,
        article_id: &str,
        comment_text: &str,
        highlight: Option<&str>,
    ) -> Result<String, ScrapeError> {
        let csrf = match self.csrf_token.clone() {
            Some(token) => token,
            None => {
                // Refresh the token from the article page form.
                let url = format!("{}/article/{article_id}/", self.base_url);
                let (status, body) = self.request(Method::GET, url, None).await?;
                self.check_page(status, &body)?;
                parse::extract_csrf_token(&body).ok_or_else(|| ScrapeError::UnexpectedHtml {
                    message: format!("article {article_id}: no comment form token"),
                })?
            }
        };

        let mut form = vec![
            ("csrfmiddlewaretoken".to_string(), csrf),
            ("article_id".to_string(), article_id.to_string()),
            ("content".to_string(), comment_text.to_string()),
        ];
        if let Some(span) = highlight {
            form.push(("highlight".to_string(), span.to_string()));
        }

        let url = format!("{}/article/{article_id}/comment/", self.base_url);
        let (status, body) = self.request(Method::POST, url, Some(&form)).await?;
        self.check_page(status, &body)?;

        parse::extract_last_comment_id(&body).ok_or_else(|| ScrapeError::UnexpectedHtml {
            message: format!("article {article_id}: posted comment not found in response"),
        })
    }

    /// Release the session's connections.
    pub fn close(self) {
        // Dropping the client tears down its connection pool.
        drop(self);
    }

    /// Map auth-sensitive statuses and login redirects to typed errors.
    fn check_page(&mut self, status: StatusCode, body: &str) -> Result<(), ScrapeError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.authenticated = false;
            return Err(ScrapeError::AuthFailed {
                message: format!("platform returned HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(ScrapeError::Http {
                status: status.as_u16(),
                message: truncate(body, 200),
            });
        }
        if parse::is_login_page(body) {
            self.authenticated = false;
            return Err(ScrapeError::AuthFailed {
                message: "session expired, platform served the login page".to_string(),
            });
        }
        Ok(())
    }

    /// Issue a request, following redirects manually and absorbing cookies
    /// from every hop. The rate limiter's per-domain delay runs before each
    /// hop.
    async fn request(
        &mut self,
        method: Method,
        url: String,
        form: Option<&[(String, String)]>,
    ) -> Result<(StatusCode, String), ScrapeError> {
        let mut current_url = url;
        let mut current_method = method;
        let mut current_form = form;

        for _ in 0..=MAX_REDIRECTS {
            self.limiter.wait_if_needed(&current_url).await;

            let mut request = self
                .http
                .request(current_method.clone(), &current_url)
                .header(REFERER, &self.base_url);
            if !self.cookies.is_empty() {
                request = request.header(COOKIE, self.cookie_header());
            }
            if let Some(fields) = current_form {
                request = request.form(fields);
            }

            let response = request
                .send()
                .await
                .map_err(|e| ScrapeError::Network { source: e })?;

            self.absorb_cookies(response.headers());
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| ScrapeError::UnexpectedHtml {
                        message: "redirect without location header".to_string(),
                    })?;
                current_url = self.resolve(&current_url, location)?;
                current_method = Method::GET;
                current_form = None;
                continue;
            }

            let body = response
                .text()
                .await
                .map_err(|e| ScrapeError::Network { source: e })?;
            return Ok((status, body));
        }

        Err(ScrapeError::Http {
            status: 310,
            message: "too many redirects".to_string(),
        })
    }

    fn resolve(&self, current: &str, location: &str) -> Result<String, ScrapeError> {
        let base = url::Url::parse(current).map_err(|_| ScrapeError::UnexpectedHtml {
            message: format!("invalid request url: {current}"),
        })?;
        base.join(location)
            .map(|u| u.to_string())
            .map_err(|_| ScrapeError::UnexpectedHtml {
                message: format!("invalid redirect location: {location}"),
            })
    }

    fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn absorb_cookies(&mut self, headers: &reqwest::header::HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            let Some(pair) = raw.split(';').next() else {
                continue;
            };
            let mut parts = pair.splitn(2, '=');
            if let (Some(name), Some(val)) = (parts.next(), parts.next()) {
                self.cookies
                    .insert(name.trim().to_string(), val.trim().to_string());
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
