//! SQLite-backed [`Persistence`] implementation.
//!
//! Chunk representations are stored by kind: dense vectors as little-endian
//! `f32` blobs, term signatures as JSON. Message timestamps are RFC 3339
//! with nanoseconds so they sort as text and round-trip exactly.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use localllm_core::embedding::{blob_to_vec, vec_to_blob, Representation, TermSignature};
use localllm_core::models::{ChatMessage, Chunk, IndexedChunk, Role, StoredDocument};
use localllm_core::store::Persistence;

pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn encode_representation(rep: &Representation) -> Result<(Option<Vec<u8>>, Option<String>)> {
    match rep {
        Representation::Dense(vector) => Ok((Some(vec_to_blob(vector)), None)),
        Representation::Terms(terms) => Ok((None, Some(serde_json::to_string(terms)?))),
    }
}

fn decode_representation(row: &SqliteRow) -> Result<Representation> {
    let kind: String = row.get("repr_kind");
    match kind.as_str() {
        "dense" => {
            let blob: Option<Vec<u8>> = row.get("embedding");
            let blob = blob.ok_or_else(|| anyhow!("dense chunk without embedding"))?;
            Ok(Representation::Dense(blob_to_vec(&blob)))
        }
        "terms" => {
            let json: Option<String> = row.get("terms_json");
            let json = json.ok_or_else(|| anyhow!("terms chunk without signature"))?;
            let terms: TermSignature = serde_json::from_str(&json)?;
            Ok(Representation::Terms(terms))
        }
        other => bail!("unknown representation kind: {}", other),
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn row_to_message(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.get("role");
    let created_at: String = row.get("created_at");
    let tokens_generated: i64 = row.get("tokens_generated");
    let generation_time_ms: i64 = row.get("generation_time_ms");
    Ok(ChatMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        role: Role::parse(&role).ok_or_else(|| anyhow!("unknown role: {}", role))?,
        content: row.get("content"),
        is_complete: row.get::<i64, _>("is_complete") != 0,
        tokens_generated: tokens_generated.max(0) as usize,
        generation_time_ms: generation_time_ms.max(0) as u64,
        created_at: parse_ts(&created_at)?,
    })
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn upsert_chunks(
        &self,
        document_id: &str,
        file_name: &str,
        chunks: &[IndexedChunk],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, file_name, chunk_count, indexed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                file_name = excluded.file_name,
                chunk_count = excluded.chunk_count,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(document_id)
        .bind(file_name)
        .bind(chunks.len() as i64)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        for indexed in chunks {
            let chunk = &indexed.chunk;
            let (embedding, terms_json) = encode_representation(&indexed.representation)?;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, ordinal, content, start_offset, end_offset,
                                    hash, repr_kind, embedding, terms_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.ordinal as i64)
            .bind(&chunk.content)
            .bind(chunk.start as i64)
            .bind(chunk.end as i64)
            .bind(&chunk.hash)
            .bind(indexed.representation.kind())
            .bind(embedding)
            .bind(terms_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear_chunks(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM documents").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_chunks(&self) -> Result<Vec<StoredDocument>> {
        let doc_rows = sqlx::query("SELECT id, file_name FROM documents ORDER BY file_name, id")
            .fetch_all(&self.pool)
            .await?;

        let mut documents = Vec::with_capacity(doc_rows.len());
        for doc_row in doc_rows {
            let document_id: String = doc_row.get("id");
            let chunk_rows = sqlx::query(
                r#"
                SELECT id, ordinal, content, start_offset, end_offset, hash,
                       repr_kind, embedding, terms_json
                FROM chunks WHERE document_id = ? ORDER BY ordinal ASC
                "#,
            )
            .bind(&document_id)
            .fetch_all(&self.pool)
            .await?;

            let mut chunks = Vec::with_capacity(chunk_rows.len());
            for row in &chunk_rows {
                let ordinal: i64 = row.get("ordinal");
                let start: i64 = row.get("start_offset");
                let end: i64 = row.get("end_offset");
                chunks.push(IndexedChunk {
                    chunk: Chunk {
                        id: row.get("id"),
                        document_id: document_id.clone(),
                        ordinal: ordinal as usize,
                        content: row.get("content"),
                        start: start as usize,
                        end: end as usize,
                        hash: row.get("hash"),
                    },
                    representation: decode_representation(row)?,
                });
            }

            documents.push(StoredDocument {
                document_id,
                file_name: doc_row.get("file_name"),
                chunks,
            });
        }
        Ok(documents)
    }

    async fn upsert_message(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, is_complete,
                                  tokens_generated, generation_time_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                is_complete = excluded.is_complete,
                tokens_generated = excluded.tokens_generated,
                generation_time_ms = excluded.generation_time_ms
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.is_complete as i64)
        .bind(message.tokens_generated as i64)
        .bind(message.generation_time_ms as i64)
        .bind(format_ts(&message.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, is_complete,
                   tokens_generated, generation_time_ms, created_at
            FROM messages WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }
}
