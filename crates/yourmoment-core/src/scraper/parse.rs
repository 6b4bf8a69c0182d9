//! HTML parsing for the myMoment platform.
//!
//! The platform's HTML structure is an external contract; this module is the
//! only place that knows about it. Everything here is pure: HTML in, typed
//! values out.

use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};

use super::{ArticleDetail, ArticleMetadata, TabDescriptor, TabKind};
use crate::error::ScrapeError;

/// Parse a static selector. All call sites pass literals, so a parse failure
/// is a programming error, not an input error.
fn sel(selector: &str) -> Selector {
    Selector::parse(selector).expect("static selector must be valid")
}

/// Extract the CSRF token from a page containing the login or comment form.
pub fn extract_csrf_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let input = sel("input[name=\"csrfmiddlewaretoken\"]");
    document
        .select(&input)
        .next()
        .and_then(|el| el.value().attr("value"))
        .map(ToString::to_string)
}

/// Parse the tab navigation from an article index page.
///
/// Tabs are links carrying a `tab` query parameter: `home`, `alle`, or
/// `class:<id>` for class tabs.
pub fn parse_tabs(html: &str) -> Vec<TabDescriptor> {
    let document = Html::parse_document(html);
    let links = sel("nav.article-tabs a");

    let mut tabs = Vec::new();
    for link in document.select(&links) {
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(tab_value) = query_param(href, "tab") else {
            continue;
        };
        let label = text_content(&link);

        let (kind, id) = if tab_value == "home" {
            (TabKind::Home, None)
        } else if tab_value == "alle" {
            (TabKind::Alle, None)
        } else if let Some(class_id) = tab_value.strip_prefix("class:") {
            match class_id.parse::<i64>() {
                Ok(id) => (TabKind::Class, Some(id)),
                Err(_) => continue,
            }
        } else {
            continue;
        };

        tabs.push(TabDescriptor {
            id,
            label,
            kind,
            value: tab_value,
        });
    }
    tabs
}

/// Parse an article index page into ordered article metadata.
pub fn parse_article_index(html: &str, base_url: &str) -> Vec<ArticleMetadata> {
    let document = Html::parse_document(html);
    let items = sel("article.article-item");
    let title_link = sel("h3.article-title a");
    let author = sel(".article-author");

    let mut articles = Vec::new();
    for item in document.select(&items) {
        let Some(id) = item.value().attr("data-article-id") else {
            continue;
        };

        let (title, href) = match item.select(&title_link).next() {
            Some(link) => (
                text_content(&link),
                link.value().attr("href").map(ToString::to_string),
            ),
            None => continue,
        };

        let author_name = item
            .select(&author)
            .next()
            .map(|el| text_content(&el))
            .unwrap_or_default();

        articles.push(ArticleMetadata {
            id: id.to_string(),
            title,
            author: author_name,
            category_id: attr_i64(&item, "data-category-id"),
            task_id: attr_i64(&item, "data-task-id"),
            url: href
                .map(|h| absolute_url(base_url, &h))
                .unwrap_or_else(|| format!("{base_url}/article/{id}/")),
        });
    }
    articles
}

/// Parse an article detail page.
pub fn parse_article_detail(
    html: &str,
    article_id: &str,
    base_url: &str,
) -> Result<ArticleDetail, ScrapeError> {
    let document = Html::parse_document(html);

    let title = document
        .select(&sel("h1.article-title"))
        .next()
        .map(|el| text_content(&el))
        .ok_or_else(|| ScrapeError::UnexpectedHtml {
            message: format!("article {article_id}: missing title"),
        })?;

    let author = document
        .select(&sel(".article-author"))
        .next()
        .map(|el| text_content(&el))
        .unwrap_or_default();

    let content_el = document
        .select(&sel("div.article-content"))
        .next()
        .ok_or_else(|| ScrapeError::UnexpectedHtml {
            message: format!("article {article_id}: missing content body"),
        })?;

    let body = document.select(&sel("article[data-article-id]")).next();

    Ok(ArticleDetail {
        metadata: ArticleMetadata {
            id: article_id.to_string(),
            title,
            author,
            category_id: body.as_ref().and_then(|el| attr_i64(el, "data-category-id")),
            task_id: body.as_ref().and_then(|el| attr_i64(el, "data-task-id")),
            url: format!("{base_url}/article/{article_id}/"),
        },
        content: text_content(&content_el),
        raw_html: content_el.html(),
        published_at: datetime_attr(&document, "time.article-published"),
        edited_at: datetime_attr(&document, "time.article-edited"),
    })
}

/// Extract the id of the most recently added comment from an article page.
///
/// Comments are rendered in publication order, so after a successful post
/// the newly assigned id is the last one on the page.
pub fn extract_last_comment_id(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let comments = sel("[data-comment-id]");
    document
        .select(&comments)
        .filter_map(|el| el.value().attr("data-comment-id"))
        .last()
        .map(ToString::to_string)
}

/// Whether a page still shows the login form (authentication failed or the
/// session expired).
pub fn is_login_page(html: &str) -> bool {
    let document = Html::parse_document(html);
    document.select(&sel("form#login-form")).next().is_some()
}

// --- helpers ---

/// Collapse an element's text nodes into a single whitespace-normalized string.
fn text_content(el: &ElementRef<'_>) -> String {
    let raw: String = el.text().collect::<Vec<_>>().join(" ");
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn attr_i64(el: &ElementRef<'_>, name: &str) -> Option<i64> {
    el.value().attr(name).and_then(|v| v.parse::<i64>().ok())
}

fn datetime_attr(document: &Html, selector: &str) -> Option<DateTime<Utc>> {
    document
        .select(&sel(selector))
        .next()
        .and_then(|el| el.value().attr("datetime"))
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn query_param(href: &str, name: &str) -> Option<String> {
    let query = href.split('?').nth(1)?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| {
                // Class tab values arrive percent-encoded as `class%3A12`.
                v.replace("%3A", ":").replace("%3a", ":")
            });
        }
    }
    None
}

fn absolute_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{}{}", base_url.trim_end_matches('/'), href)
    }
}
