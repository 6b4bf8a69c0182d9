//! Monitoring process lifecycle management.
//!
//! Create, update, start, stop, delete, and inspect monitoring processes.
//! All operations are scoped to the owning user; a resource owned by someone
//! else surfaces as "not found" rather than "forbidden".

use serde::Serialize;

use super::{enqueue_stage, MonitorError, ProcessStatus, Stage};
use crate::config::MonitoringConfig;
use crate::queue;
use crate::storage::{logins, processes, prompts, providers, users, DbPool};

/// Why a process is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user asked for it: final status `stopped`.
    UserRequested,
    /// The wall-clock budget ran out: final status `completed`.
    DurationExceeded,
    /// A fatal error occurred: final status `failed`.
    Error,
}

impl StopReason {
    fn final_status(self) -> ProcessStatus {
        match self {
            StopReason::UserRequested => ProcessStatus::Stopped,
            StopReason::DurationExceeded => ProcessStatus::Completed,
            StopReason::Error => ProcessStatus::Failed,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StopReason::UserRequested => "user_requested",
            StopReason::DurationExceeded => "duration_exceeded",
            StopReason::Error => "error",
        }
    }
}

/// Request to create or update a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub name: String,
    pub description: Option<String>,
    pub category_filter: Option<i64>,
    pub task_filter: Option<i64>,
    pub tab_filter: Option<String>,
    pub search_filter: Option<String>,
    pub sort_option: Option<String>,
    pub max_duration_minutes: Option<i64>,
    pub generate_only: bool,
    pub hide_comments: bool,
    pub llm_provider_id: Option<String>,
    pub login_ids: Vec<String>,
    /// Prompt template ids with optional weights (default 1.0).
    pub prompts: Vec<(String, f64)>,
}

/// Detailed status report for a process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatusReport {
    pub process_id: String,
    pub name: String,
    pub status: String,
    pub is_active: bool,
    pub started_at: Option<String>,
    pub stopped_at: Option<String>,
    pub last_activity_at: Option<String>,
    pub max_duration_minutes: i64,
    pub duration_exceeded: bool,
    pub articles_discovered: i64,
    pub articles_prepared: i64,
    pub comments_generated: i64,
    pub comments_posted: i64,
    pub errors_in_discovery: i64,
    pub errors_in_preparation: i64,
    pub errors_in_generation: i64,
    pub errors_in_posting: i64,
    pub login_count: usize,
    pub prompt_count: usize,
    pub stage_tasks: Vec<StageTaskState>,
}

/// State of one stage's recorded queue task.
#[derive(Debug, Clone, Serialize)]
pub struct StageTaskState {
    pub stage: String,
    pub task_id: String,
    pub state: String,
}

/// Service managing the monitoring process lifecycle.
pub struct MonitoringService {
    pool: DbPool,
    max_concurrent_per_user: i64,
    default_max_duration_minutes: i64,
}

impl MonitoringService {
    /// Build the service from monitoring configuration.
    pub fn new(pool: DbPool, config: &MonitoringConfig) -> Self {
        Self {
            pool,
            max_concurrent_per_user: config.max_concurrent_processes_per_user,
            default_max_duration_minutes: config.default_max_duration_minutes,
        }
    }

    /// Create a process with its login and prompt associations.
    pub async fn create_process(
        &self,
        user_id: &str,
        spec: &ProcessSpec,
    ) -> Result<processes::MonitoringProcessRow, MonitorError> {
        let user = users::get_user(&self.pool, user_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| MonitorError::NotFound {
                what: format!("user {user_id}"),
            })?;

        if spec.name.trim().is_empty() {
            return Err(MonitorError::Validation {
                message: "process name must not be empty".to_string(),
            });
        }

        let llm_provider_id = match spec.llm_provider_id.as_deref() {
            Some(id) => Some(self.validate_provider(&user.id, id).await?),
            None => None,
        };
        let login_ids = self.validate_logins(&user.id, &spec.login_ids).await?;
        let prompt_ids = self.validate_prompts(&user.id, &spec.prompts).await?;

        let row = processes::create_process(
            &self.pool,
            &processes::NewProcess {
                user_id: user.id.clone(),
                name: spec.name.clone(),
                description: spec.description.clone(),
                category_filter: spec.category_filter,
                task_filter: spec.task_filter,
                tab_filter: spec.tab_filter.clone(),
                search_filter: spec.search_filter.clone(),
                sort_option: spec.sort_option.clone(),
                max_duration_minutes: spec
                    .max_duration_minutes
                    .unwrap_or(self.default_max_duration_minutes),
                generate_only: spec.generate_only,
                hide_comments: spec.hide_comments,
                llm_provider_id,
            },
        )
        .await?;

        processes::set_login_associations(&self.pool, &row.id, &login_ids).await?;
        processes::set_prompt_associations(&self.pool, &row.id, &prompt_ids).await?;

        tracing::info!(
            process_id = %row.id,
            user_id,
            logins = login_ids.len(),
            prompts = prompt_ids.len(),
            "monitoring process created"
        );

        Ok(row)
    }

    /// Update a process. Rejected while the process is running so an
    /// in-flight run keeps its configuration snapshot authoritative.
    pub async fn update_process(
        &self,
        process_id: &str,
        user_id: &str,
        spec: &ProcessSpec,
    ) -> Result<processes::MonitoringProcessRow, MonitorError> {
        let process = self.owned_process(process_id, user_id).await?;

        if process.is_running() {
            return Err(MonitorError::InvalidState {
                process_id: process_id.to_string(),
                action: "be updated".to_string(),
                status: process.status.clone(),
            });
        }

        if spec.name.trim().is_empty() {
            return Err(MonitorError::Validation {
                message: "process name must not be empty".to_string(),
            });
        }

        let llm_provider_id = match spec.llm_provider_id.as_deref() {
            Some(id) => Some(self.validate_provider(user_id, id).await?),
            None => None,
        };

        sqlx::query(
            "UPDATE monitoring_processes \
             SET name = ?, description = ?, category_filter = ?, task_filter = ?, tab_filter = ?, \
                 search_filter = ?, sort_option = ?, max_duration_minutes = ?, generate_only = ?, \
                 hide_comments = ?, llm_provider_id = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&spec.name)
        .bind(&spec.description)
        .bind(spec.category_filter)
        .bind(spec.task_filter)
        .bind(&spec.tab_filter)
        .bind(&spec.search_filter)
        .bind(&spec.sort_option)
        .bind(
            spec.max_duration_minutes
                .unwrap_or(process.max_duration_minutes),
        )
        .bind(spec.generate_only)
        .bind(spec.hide_comments)
        .bind(&llm_provider_id)
        .bind(crate::storage::now_string())
        .bind(process_id)
        .execute(&self.pool)
        .await
        .map_err(|e| MonitorError::Storage(crate::error::StorageError::Query { source: e }))?;

        let login_ids = self.validate_logins(user_id, &spec.login_ids).await?;
        processes::set_login_associations(&self.pool, process_id, &login_ids).await?;
        let prompt_ids = self.validate_prompts(user_id, &spec.prompts).await?;
        processes::set_prompt_associations(&self.pool, process_id, &prompt_ids).await?;

        self.owned_process(process_id, user_id).await
    }

    /// Start a process: validate its configuration, enforce the concurrency
    /// cap, flip it to `running`, and enqueue the Discovery stage.
    ///
    /// When the queue is unavailable the status change is rolled back and a
    /// typed error surfaces.
    pub async fn start_process(
        &self,
        process_id: &str,
        user_id: &str,
    ) -> Result<String, MonitorError> {
        let process = self.owned_process(process_id, user_id).await?;

        if process.status != "created" {
            return Err(MonitorError::InvalidState {
                process_id: process_id.to_string(),
                action: "be started".to_string(),
                status: process.status.clone(),
            });
        }

        let login_ids = processes::login_ids_for_process(&self.pool, process_id).await?;
        if login_ids.is_empty() {
            return Err(MonitorError::Validation {
                message: "process has no associated platform logins".to_string(),
            });
        }
        let prompt_ids = processes::prompt_ids_for_process(&self.pool, process_id).await?;
        if prompt_ids.is_empty() {
            return Err(MonitorError::Validation {
                message: "process has no associated prompt templates".to_string(),
            });
        }

        let has_provider = process.llm_provider_id.is_some()
            || !providers::list_active_providers(&self.pool, user_id)
                .await?
                .is_empty();
        if !has_provider {
            return Err(MonitorError::Validation {
                message: "no active LLM provider configured".to_string(),
            });
        }

        let running = processes::count_running_for_user(&self.pool, user_id).await?;
        if running >= self.max_concurrent_per_user {
            return Err(MonitorError::Validation {
                message: format!(
                    "concurrent process limit reached ({}/{})",
                    running, self.max_concurrent_per_user
                ),
            });
        }

        if !processes::mark_running(&self.pool, process_id).await? {
            return Err(MonitorError::InvalidState {
                process_id: process_id.to_string(),
                action: "be started".to_string(),
                status: "unknown".to_string(),
            });
        }

        match enqueue_stage(&self.pool, process_id, Stage::Discovery).await {
            Ok(task_id) => {
                tracing::info!(process_id, task_id = %task_id, "monitoring process started");
                Ok(task_id)
            }
            Err(e) => {
                // Queue unreachable: roll the status change back.
                processes::revert_to_created(&self.pool, process_id).await?;
                tracing::error!(process_id, error = %e, "start rolled back, queue unavailable");
                Err(e)
            }
        }
    }

    /// Stop a process: revoke its recorded stage tasks and set the final
    /// status for the reason. Idempotent — stopping a non-running process
    /// reports the current status without error.
    pub async fn stop_process(
        &self,
        process_id: &str,
        user_id: &str,
        reason: StopReason,
    ) -> Result<ProcessStatusReport, MonitorError> {
        let process = self.owned_process(process_id, user_id).await?;

        if process.is_running() {
            for stage in [
                Stage::Discovery,
                Stage::Preparation,
                Stage::Generation,
                Stage::Posting,
            ] {
                if let Some(task_id) = process.task_id_for(stage) {
                    queue::revoke(&self.pool, task_id).await?;
                }
            }

            processes::mark_terminal(&self.pool, process_id, reason.final_status()).await?;
            tracing::info!(process_id, reason = reason.as_str(), "monitoring process stopped");
        }

        self.process_status(process_id, user_id).await
    }

    /// Soft-delete a process, stopping it first when running.
    pub async fn delete_process(&self, process_id: &str, user_id: &str) -> Result<(), MonitorError> {
        let process = self.owned_process(process_id, user_id).await?;

        if process.is_running() {
            self.stop_process(process_id, user_id, StopReason::UserRequested)
                .await?;
        }

        processes::soft_delete(&self.pool, process_id).await?;
        processes::deactivate_associations(&self.pool, process_id).await?;
        tracing::info!(process_id, "monitoring process deleted");
        Ok(())
    }

    /// Detailed status for a process, including queue task states.
    pub async fn process_status(
        &self,
        process_id: &str,
        user_id: &str,
    ) -> Result<ProcessStatusReport, MonitorError> {
        let process = self.owned_process(process_id, user_id).await?;

        let login_ids = processes::login_ids_for_process(&self.pool, process_id).await?;
        let prompt_ids = processes::prompt_ids_for_process(&self.pool, process_id).await?;

        let mut stage_tasks = Vec::new();
        for stage in [
            Stage::Discovery,
            Stage::Preparation,
            Stage::Generation,
            Stage::Posting,
        ] {
            if let Some(task_id) = process.task_id_for(stage) {
                let state = queue::task_state(&self.pool, task_id)
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                stage_tasks.push(StageTaskState {
                    stage: stage.queue().to_string(),
                    task_id: task_id.to_string(),
                    state,
                });
            }
        }

        Ok(ProcessStatusReport {
            process_id: process.id.clone(),
            name: process.name.clone(),
            status: process.status.clone(),
            is_active: process.is_active,
            started_at: process.started_at.clone(),
            stopped_at: process.stopped_at.clone(),
            last_activity_at: process.last_activity_at.clone(),
            max_duration_minutes: process.max_duration_minutes,
            duration_exceeded: super::duration_exceeded(
                process.started_at.as_deref(),
                process.max_duration_minutes,
            ),
            articles_discovered: process.articles_discovered,
            articles_prepared: process.articles_prepared,
            comments_generated: process.comments_generated,
            comments_posted: process.comments_posted,
            errors_in_discovery: process.errors_in_discovery,
            errors_in_preparation: process.errors_in_preparation,
            errors_in_generation: process.errors_in_generation,
            errors_in_posting: process.errors_in_posting,
            login_count: login_ids.len(),
            prompt_count: prompt_ids.len(),
            stage_tasks,
        })
    }

    /// List a user's processes.
    pub async fn list_processes(
        &self,
        user_id: &str,
        running_only: bool,
    ) -> Result<Vec<processes::MonitoringProcessRow>, MonitorError> {
        Ok(processes::list_processes_for_user(&self.pool, user_id, running_only, 50, 0).await?)
    }

    async fn owned_process(
        &self,
        process_id: &str,
        user_id: &str,
    ) -> Result<processes::MonitoringProcessRow, MonitorError> {
        processes::get_process_for_user(&self.pool, process_id, user_id, false)
            .await?
            .ok_or_else(|| MonitorError::NotFound {
                what: format!("monitoring process {process_id}"),
            })
    }

    async fn validate_provider(
        &self,
        user_id: &str,
        provider_id: &str,
    ) -> Result<String, MonitorError> {
        providers::get_provider_for_user(&self.pool, provider_id, user_id)
            .await?
            .filter(|p| p.is_active)
            .map(|p| p.id)
            .ok_or_else(|| MonitorError::Validation {
                message: format!("LLM provider {provider_id} not found or inactive"),
            })
    }

    async fn validate_logins(
        &self,
        user_id: &str,
        login_ids: &[String],
    ) -> Result<Vec<String>, MonitorError> {
        let mut valid = Vec::with_capacity(login_ids.len());
        for login_id in login_ids {
            let login = logins::get_login_for_user(&self.pool, login_id, user_id)
                .await?
                .filter(|l| l.is_active);
            match login {
                Some(login) => valid.push(login.id),
                None => {
                    return Err(MonitorError::Validation {
                        message: format!("login {login_id} not found or inactive"),
                    });
                }
            }
        }
        Ok(valid)
    }

    async fn validate_prompts(
        &self,
        user_id: &str,
        prompt_specs: &[(String, f64)],
    ) -> Result<Vec<(String, f64)>, MonitorError> {
        let mut valid = Vec::with_capacity(prompt_specs.len());
        for (prompt_id, weight) in prompt_specs {
            if *weight <= 0.0 {
                return Err(MonitorError::Validation {
                    message: format!("prompt weight must be positive, got {weight}"),
                });
            }
            let template = prompts::get_accessible_template(&self.pool, prompt_id, user_id).await?;
            match template {
                Some(template) => valid.push((template.id, *weight)),
                None => {
                    return Err(MonitorError::Validation {
                        message: format!("prompt template {prompt_id} not found or inaccessible"),
                    });
                }
            }
        }
        Ok(valid)
    }
}
