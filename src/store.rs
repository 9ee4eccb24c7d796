//! Conversation and message persistence
//!
//! The assistant response write is the one composite operation here: message
//! row + citation rows + usage row + conversation touch + model upsert, all
//! in a single transaction. Ownership is enforced at resolve time, before
//! any write.

use chrono::Utc;
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::completions::{GenerationMetadata, TokenUsage};
use crate::context::{Attachment, HistoryMessage};
use crate::error::ApiError;
use crate::evidence::Citation;
use crate::trace::ThinkingTrace;

/// Auto-generated conversation titles keep this many characters of the
/// first message
const TITLE_MAX_CHARS: usize = 64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found")]
    ConversationNotFound,

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConversationNotFound => ApiError::not_found("conversation not found"),
            StoreError::Db(e) => ApiError::internal(format!("database error: {e}")),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelRow {
    pub id: String,
    pub name: String,
    pub supports_reasoning: bool,
    pub favorite: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModelSync {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub supports_reasoning: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UsageRow {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub reasoning_tokens: i64,
    pub total_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

/// Full message as returned by the conversation history endpoint
#[derive(Debug, serde::Serialize)]
pub struct MessageDetail {
    pub id: String,
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub grounding_enabled: bool,
    pub deep_research_enabled: bool,
    pub created_at: i64,
    pub citations: Vec<Citation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_trace: Option<ThinkingTrace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageRow>,
}

/// Everything persisted for one assistant turn
pub struct AssistantResponse<'a> {
    pub user_id: &'a str,
    pub conversation_id: &'a str,
    pub content: &'a str,
    pub reasoning_content: Option<&'a str>,
    pub model_id: Option<&'a str>,
    pub grounding_enabled: bool,
    pub deep_research_enabled: bool,
    pub citations: &'a [Citation],
    pub thinking_trace: Option<&'a ThinkingTrace>,
    pub usage: Option<&'a TokenUsage>,
}

#[derive(Clone)]
pub struct ChatStore {
    pool: SqlitePool,
}

impl ChatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Resolve the target conversation. A provided id must belong to the
    /// user; otherwise a new conversation is created, titled from the first
    /// message. Returns (conversation id, created).
    pub async fn resolve_conversation(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        first_message: &str,
    ) -> Result<(String, bool), StoreError> {
        if let Some(id) = conversation_id {
            let found: Option<(String,)> =
                sqlx::query_as("SELECT id FROM conversations WHERE id = $1 AND user_id = $2")
                    .bind(id)
                    .bind(user_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return match found {
                Some((id,)) => Ok((id, false)),
                None => Err(StoreError::ConversationNotFound),
            };
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let title: String = first_message.chars().take(TITLE_MAX_CHARS).collect();
        sqlx::query(
            r#"
            INSERT INTO conversations (id, user_id, title, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $4)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(title.trim())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok((id, true))
    }

    pub async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        let rows: Vec<(String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT id, title, created_at, updated_at
            FROM conversations
            WHERE user_id = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, title, created_at, updated_at)| Conversation {
                id,
                title,
                created_at,
                updated_at,
            })
            .collect())
    }

    pub async fn rename_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE conversations SET title = $1, updated_at = $2
            WHERE id = $3 AND user_id = $4
            "#,
        )
        .bind(title)
        .bind(Utc::now().timestamp())
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConversationNotFound);
        }
        Ok(())
    }

    pub async fn delete_conversation(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let owned: Option<(String,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = $1 AND user_id = $2")
                .bind(conversation_id)
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if owned.is_none() {
            return Err(StoreError::ConversationNotFound);
        }

        sqlx::query(
            r#"
            DELETE FROM citations WHERE message_id IN
                (SELECT id FROM messages WHERE conversation_id = $1)
            "#,
        )
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            DELETE FROM message_usage WHERE message_id IN
                (SELECT id FROM messages WHERE conversation_id = $1)
            "#,
        )
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub async fn insert_user_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        content: &str,
    ) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, user_id, role, content, created_at)
            VALUES ($1, $2, $3, 'user', $4, $5)
            "#,
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(user_id)
        .bind(content)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Last `limit` user+assistant messages, chronological
    pub async fn load_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT role, content FROM messages
            WHERE conversation_id = $1 AND role IN ('user', 'assistant')
            ORDER BY created_at DESC, rowid DESC
            LIMIT $2
            "#,
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut history: Vec<HistoryMessage> = rows
            .into_iter()
            .map(|(role, content)| HistoryMessage { role, content })
            .collect();
        history.reverse();
        Ok(history)
    }

    /// Persist the assistant turn in one transaction. Returns the message id,
    /// or None when the content is empty and nothing was written.
    pub async fn persist_assistant_response(
        &self,
        response: AssistantResponse<'_>,
    ) -> Result<Option<String>, StoreError> {
        if response.content.is_empty() {
            return Ok(None);
        }

        let message_id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;

        if let Some(model_id) = response.model_id {
            sqlx::query(
                r#"
                INSERT INTO models (id, name, created_at, updated_at)
                VALUES ($1, $1, $2, $2)
                ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at
                "#,
            )
            .bind(model_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO messages (
                id, conversation_id, user_id, role, content, reasoning_content,
                thinking_trace, model_id, grounding_enabled, deep_research_enabled,
                created_at
            )
            VALUES ($1, $2, $3, 'assistant', $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&message_id)
        .bind(response.conversation_id)
        .bind(response.user_id)
        .bind(response.content)
        .bind(response.reasoning_content)
        .bind(response.thinking_trace.map(|t| t.to_json()))
        .bind(response.model_id)
        .bind(response.grounding_enabled)
        .bind(response.deep_research_enabled)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (position, citation) in response.citations.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO citations (
                    id, message_id, position, url, title, snippet,
                    source_provider, query, pass, score
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&message_id)
            .bind(position as i64)
            .bind(&citation.url)
            .bind(&citation.title)
            .bind(&citation.snippet)
            .bind(&citation.source_provider)
            .bind(&citation.query)
            .bind(citation.pass as i64)
            .bind(citation.score)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(usage) = response.usage {
            sqlx::query(
                r#"
                INSERT INTO message_usage (
                    id, message_id, prompt_tokens, completion_tokens,
                    reasoning_tokens, total_tokens, provider, tokens_per_second,
                    cost, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&message_id)
            .bind(usage.prompt_tokens as i64)
            .bind(usage.completion_tokens as i64)
            .bind(usage.reasoning_tokens as i64)
            .bind(usage.total_tokens as i64)
            .bind(&usage.provider)
            .bind(usage.tokens_per_second)
            .bind(usage.cost)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(response.conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(message_id))
    }

    /// Patch the committed usage row with generation metadata. Touches
    /// nothing else.
    pub async fn enrich_usage(
        &self,
        message_id: &str,
        metadata: &GenerationMetadata,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE message_usage
            SET provider = COALESCE($1, provider),
                tokens_per_second = COALESCE($2, tokens_per_second),
                cost = COALESCE($3, cost)
            WHERE message_id = $4
            "#,
        )
        .bind(&metadata.provider)
        .bind(metadata.tokens_per_second)
        .bind(metadata.total_cost)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Full history for the conversation endpoint, citations and trace
    /// included. Ownership enforced.
    pub async fn messages_with_details(
        &self,
        user_id: &str,
        conversation_id: &str,
    ) -> Result<Vec<MessageDetail>, StoreError> {
        let owned: Option<(String,)> =
            sqlx::query_as("SELECT id FROM conversations WHERE id = $1 AND user_id = $2")
                .bind(conversation_id)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        if owned.is_none() {
            return Err(StoreError::ConversationNotFound);
        }

        type MessageRow = (
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            bool,
            bool,
            i64,
        );
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, role, content, reasoning_content, thinking_trace, model_id,
                   grounding_enabled, deep_research_enabled, created_at
            FROM messages
            WHERE conversation_id = $1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut details = Vec::with_capacity(rows.len());
        for (
            id,
            role,
            content,
            reasoning_content,
            trace_blob,
            model_id,
            grounding_enabled,
            deep_research_enabled,
            created_at,
        ) in rows
        {
            let citations = self.citations_for_message(&id).await?;
            let usage = self.usage_for_message(&id).await?;
            // Invalid stored trace blobs are skipped, not fatal
            let thinking_trace = trace_blob.as_deref().and_then(ThinkingTrace::from_json);

            details.push(MessageDetail {
                id,
                role,
                content,
                reasoning_content,
                model_id,
                grounding_enabled,
                deep_research_enabled,
                created_at,
                citations,
                thinking_trace,
                usage,
            });
        }
        Ok(details)
    }

    pub async fn citations_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<Citation>, StoreError> {
        type CitationRow = (String, String, String, String, String, i64, f64);
        let rows: Vec<CitationRow> = sqlx::query_as(
            r#"
            SELECT url, title, snippet, source_provider, query, pass, score
            FROM citations
            WHERE message_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(url, title, snippet, source_provider, query, pass, score)| Citation {
                    url,
                    title,
                    snippet,
                    source_provider,
                    query,
                    pass: pass as u32,
                    score,
                },
            )
            .collect())
    }

    async fn usage_for_message(&self, message_id: &str) -> Result<Option<UsageRow>, StoreError> {
        type WireRow = (i64, i64, i64, i64, Option<String>, Option<f64>, Option<f64>);
        let row: Option<WireRow> = sqlx::query_as(
            r#"
            SELECT prompt_tokens, completion_tokens, reasoning_tokens, total_tokens,
                   provider, tokens_per_second, cost
            FROM message_usage
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(prompt, completion, reasoning, total, provider, tps, cost)| UsageRow {
                prompt_tokens: prompt,
                completion_tokens: completion,
                reasoning_tokens: reasoning,
                total_tokens: total,
                provider,
                tokens_per_second: tps,
                cost,
            },
        ))
    }

    // ------------------------------------------------------------------
    // Reasoning presets
    // ------------------------------------------------------------------

    pub async fn reasoning_preset(
        &self,
        user_id: &str,
        mode: &str,
    ) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT effort FROM reasoning_presets WHERE user_id = $1 AND mode = $2",
        )
        .bind(user_id)
        .bind(mode)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(e,)| e))
    }

    pub async fn set_reasoning_preset(
        &self,
        user_id: &str,
        mode: &str,
        effort: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reasoning_presets (user_id, mode, effort, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(user_id, mode) DO UPDATE SET
                effort = excluded.effort,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(mode)
        .bind(effort)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Model catalog
    // ------------------------------------------------------------------

    pub async fn list_models(&self, user_id: &str) -> Result<Vec<ModelRow>, StoreError> {
        type WireRow = (String, String, bool, Option<String>);
        let rows: Vec<WireRow> = sqlx::query_as(
            r#"
            SELECT m.id, m.name, m.supports_reasoning, f.model_id
            FROM models m
            LEFT JOIN model_favorites f ON f.model_id = m.id AND f.user_id = $1
            ORDER BY m.id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, supports_reasoning, fav)| ModelRow {
                id,
                name,
                supports_reasoning,
                favorite: fav.is_some(),
            })
            .collect())
    }

    pub async fn model_supports_reasoning(&self, model_id: &str) -> Result<bool, StoreError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT supports_reasoning FROM models WHERE id = $1")
                .bind(model_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(s,)| s).unwrap_or(false))
    }

    pub async fn sync_models(&self, models: &[ModelSync]) -> Result<usize, StoreError> {
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for model in models {
            sqlx::query(
                r#"
                INSERT INTO models (id, name, supports_reasoning, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $4)
                ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    supports_reasoning = excluded.supports_reasoning,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&model.id)
            .bind(&model.name)
            .bind(model.supports_reasoning)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(models.len())
    }

    pub async fn set_favorite(
        &self,
        user_id: &str,
        model_id: &str,
        favorite: bool,
    ) -> Result<(), StoreError> {
        if favorite {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO model_favorites (user_id, model_id, created_at)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(user_id)
            .bind(model_id)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("DELETE FROM model_favorites WHERE user_id = $1 AND model_id = $2")
                .bind(user_id)
                .bind(model_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Load attachments by id; every id must belong to the user
    pub async fn attachments_for_user(
        &self,
        user_id: &str,
        file_ids: &[String],
    ) -> Result<Option<Vec<Attachment>>, StoreError> {
        let mut attachments = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let row: Option<(String, String)> = sqlx::query_as(
                "SELECT name, extracted_text FROM files WHERE id = $1 AND user_id = $2",
            )
            .bind(file_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some((name, extracted_text)) => attachments.push(Attachment {
                    name,
                    extracted_text,
                }),
                None => return Ok(None),
            }
        }
        Ok(Some(attachments))
    }
}
