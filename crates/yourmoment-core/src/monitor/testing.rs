//! Shared fixtures for pipeline stage tests.
//!
//! Builds a full stage context against an in-memory database, a wiremock
//! platform, and a wiremock LLM endpoint. Platform login always succeeds;
//! article pages and LLM responses are mounted per test.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::service::{MonitoringService, ProcessSpec, StopReason};
use super::{enqueue_stage, Stage, StageContext};
use crate::config::Config;
use crate::llm::gateway::LlmGateway;
use crate::ratelimit::ScrapingRateLimiter;
use crate::session::SessionManager;
use crate::storage::{init_test_db, logins, processes, prompts, providers, users, DbPool};
use crate::vault::CredentialVault;

const LOGIN_PAGE: &str = r#"
    <form id="login-form" method="post" action="/accounts/login/">
        <input type="hidden" name="csrfmiddlewaretoken" value="tok123">
    </form>
"#;

const EMPTY_INDEX: &str = r#"
    <input type="hidden" name="csrfmiddlewaretoken" value="tok456">
    <div class="article-list"></div>
"#;

/// The fake myMoment platform.
pub struct PlatformMock {
    pub server: MockServer,
}

impl PlatformMock {
    async fn start() -> Self {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/accounts/login/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LOGIN_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/accounts/login/"))
            .respond_with(
                ResponseTemplate::new(302)
                    .append_header("set-cookie", "sessionid=s1; Path=/")
                    .append_header("location", "/articles/"),
            )
            .mount(&server)
            .await;
        // Post-login redirect target; index listings mount with a higher
        // priority and a tab matcher.
        Mock::given(method("GET"))
            .and(path("/articles/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(EMPTY_INDEX))
            .mount(&server)
            .await;

        Self { server }
    }

    /// Serve an article index for the `alle` tab listing the given ids.
    pub async fn serve_article_index(&self, article_ids: &[&str]) {
        let items: String = article_ids
            .iter()
            .map(|id| {
                format!(
                    r#"<article class="article-item" data-article-id="{id}" data-category-id="4">
                        <h3 class="article-title"><a href="/article/{id}/">Artikel {id}</a></h3>
                        <span class="article-author">Lena</span>
                    </article>"#
                )
            })
            .collect();
        let page = format!(r#"<div class="article-list">{items}</div>"#);

        Mock::given(method("GET"))
            .and(path("/articles/"))
            .and(query_param("tab", "alle"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Serve an article detail page.
    pub async fn serve_article_detail(&self, article_id: &str, content: &str) {
        let page = format!(
            r#"<article data-article-id="{article_id}" data-category-id="4">
                <h1 class="article-title">Artikel {article_id}</h1>
                <span class="article-author">Lena</span>
                <time class="article-published" datetime="2024-03-01T10:00:00+00:00">1. März</time>
                <div class="article-content"><p>{content}</p></div>
            </article>"#
        );
        Mock::given(method("GET"))
            .and(path(format!("/article/{article_id}/")))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&self.server)
            .await;
    }

    /// Serve the comment-post endpoint, responding with a page whose last
    /// comment carries `new_comment_id`.
    pub async fn serve_comment_post(&self, article_id: &str, new_comment_id: &str) {
        let page = format!(
            r#"<article data-article-id="{article_id}">
                <h1 class="article-title">Artikel {article_id}</h1>
                <div class="article-content">x</div>
            </article>
            <div class="comment" data-comment-id="{new_comment_id}"></div>"#
        );
        Mock::given(method("POST"))
            .and(path(format!("/article/{article_id}/comment/")))
            .respond_with(ResponseTemplate::new(200).set_body_string(page))
            .mount(&self.server)
            .await;
    }

    /// Serve a failing comment-post endpoint.
    pub async fn serve_comment_post_failure(&self, article_id: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/article/{article_id}/comment/")))
            .respond_with(ResponseTemplate::new(500).set_body_string("kaputt"))
            .mount(&self.server)
            .await;
    }
}

/// The fake LLM endpoint (OpenAI wire shape).
pub struct LlmMock {
    pub server: MockServer,
}

impl LlmMock {
    async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Serve successful structured generations returning `text`.
    pub async fn serve_generation(&self, text: &str) {
        let body = serde_json::json!({
            "choices": [{"message": {"content":
                serde_json::json!({"comment_content": text}).to_string()}}],
            "model": "gpt-4.1",
            "usage": {"prompt_tokens": 100, "completion_tokens": 30}
        });
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Serve failures.
    pub async fn serve_failure(&self) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&self.server)
            .await;
    }
}

/// Everything a stage test needs.
pub struct TestHarness {
    pub ctx: StageContext,
    pub service: MonitoringService,
    pub platform: PlatformMock,
    pub llm: LlmMock,
    pub user_id: String,
    pub vault: Arc<CredentialVault>,
}

impl TestHarness {
    pub async fn new() -> Self {
        let platform = PlatformMock::start().await;
        let llm = LlmMock::start().await;
        let pool: DbPool = init_test_db().await.expect("init db");

        let vault = Arc::new(
            CredentialVault::from_key_bytes(&(0..32).collect::<Vec<u8>>()).expect("vault"),
        );

        let mut config = Config::default();
        config.scraper.base_url = platform.server.uri();
        config.scraper.platform_delay_seconds = 0.0;
        config.scraper.default_delay_seconds = 0.0;
        config.llm.min_call_interval_seconds = 0.0;
        config.llm.generation_timeout_seconds = 5;
        config.llm.min_comment_length = 5;
        config.llm.openai_base_url = Some(llm.server.uri());
        config.llm.mistral_base_url = Some(llm.server.uri());
        let config = Arc::new(config);

        let limiter = Arc::new(ScrapingRateLimiter::new(
            &config.scraper.base_url,
            Duration::ZERO,
            Duration::ZERO,
        ));
        let sessions = Arc::new(SessionManager::new(
            pool.clone(),
            Arc::clone(&vault),
            Arc::clone(&limiter),
            &config.scraper,
            &config.monitoring,
        ));
        let gateway = Arc::new(LlmGateway::new(&config.llm));

        let hash = users::hash_password("pw").expect("hash");
        let user = users::create_user(&pool, "lehrerin@example.ch", &hash)
            .await
            .expect("user");

        // A default provider pointing at the mock endpoint.
        let api_key = vault.encrypt_api_key("sk-test").expect("enc");
        providers::create_provider(&pool, &user.id, "openai", &api_key, "gpt-4.1", None, None)
            .await
            .expect("provider");

        let service = MonitoringService::new(pool.clone(), &config.monitoring);

        let ctx = StageContext {
            pool,
            vault: Arc::clone(&vault),
            sessions,
            gateway,
            limiter,
            config,
        };

        Self {
            ctx,
            service,
            platform,
            llm,
            user_id: user.id,
            vault,
        }
    }

    /// Create a login with encrypted credentials.
    pub async fn add_login(&self, name: &str) -> String {
        let (u, p) = self.vault.encrypt_credentials("lena", "geheim").expect("enc");
        logins::create_login(&self.ctx.pool, &self.user_id, name, &u, &p, false)
            .await
            .expect("login")
            .id
    }

    /// Create `n` system prompt templates.
    pub async fn add_prompts(&self, n: usize) -> Vec<String> {
        let mut ids = Vec::with_capacity(n);
        for i in 0..n {
            let template = prompts::create_system_template(
                &self.ctx.pool,
                &format!("Vorlage {i}"),
                None,
                "Du kommentierst Schülertexte freundlich.",
                "Kommentiere: {article_title} von {article_author}\n{article_content}",
            )
            .await
            .expect("prompt");
            ids.push(template.id);
        }
        ids
    }

    /// Create and start a process over the given logins and prompts.
    pub async fn create_started_process(
        &self,
        login_ids: &[String],
        prompt_ids: &[String],
        generate_only: bool,
        max_duration_minutes: i64,
    ) -> String {
        let spec = ProcessSpec {
            name: "Testprozess".to_string(),
            tab_filter: Some("alle".to_string()),
            max_duration_minutes: Some(max_duration_minutes),
            generate_only,
            login_ids: login_ids.to_vec(),
            prompts: prompt_ids.iter().map(|id| (id.clone(), 1.0)).collect(),
            ..ProcessSpec::default()
        };
        let process = self
            .service
            .create_process(&self.user_id, &spec)
            .await
            .expect("create process");
        self.service
            .start_process(&process.id, &self.user_id)
            .await
            .expect("start process");
        process.id
    }

    /// The task id currently recorded for a stage.
    pub async fn current_task(&self, process_id: &str, stage: Stage) -> String {
        self.process(process_id)
            .await
            .task_id_for(stage)
            .expect("stage task recorded")
            .to_string()
    }

    /// Enqueue a fresh task for a stage.
    pub async fn enqueue(&self, process_id: &str, stage: Stage) -> String {
        enqueue_stage(&self.ctx.pool, process_id, stage)
            .await
            .expect("enqueue")
    }

    /// Fetch the process row.
    pub async fn process(&self, process_id: &str) -> processes::MonitoringProcessRow {
        processes::get_process(&self.ctx.pool, process_id)
            .await
            .expect("query")
            .expect("process exists")
    }
}

/// Stop a process as its owner.
pub async fn stop(harness: &TestHarness, process_id: &str) {
    harness
        .service
        .stop_process(process_id, &harness.user_id, StopReason::UserRequested)
        .await
        .expect("stop");
}

/// Move `started_at` into the past by `seconds`.
pub async fn backdate_start(harness: &TestHarness, process_id: &str, seconds: i64) {
    let started = crate::storage::to_stored(chrono::Utc::now() - chrono::Duration::seconds(seconds));
    sqlx::query("UPDATE monitoring_processes SET started_at = ? WHERE id = ?")
        .bind(&started)
        .bind(process_id)
        .execute(&harness.ctx.pool)
        .await
        .expect("backdate");
}
