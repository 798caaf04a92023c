//! Batched catalog writes: upserts for fact rows, insert-if-absent for reference entities.

use std::collections::HashMap;
use std::hash::Hash;

use async_trait::async_trait;
use marquee_core::{Award, EntityId, EntityKind, Link, Movie, MovieId, Rating, Table, Tag};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Write/read surface the import pipeline needs from the relational store.
///
/// Every write method issues one statement for the slice it is given, so a
/// call is atomic on its own; callers decide the batch size.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn row_count(&self, table: Table) -> Result<i64, StoreError>;

    async fn upsert_movies(&self, rows: &[Movie]) -> Result<u64, StoreError>;
    async fn upsert_awards(&self, rows: &[Award]) -> Result<u64, StoreError>;
    async fn upsert_ratings(&self, rows: &[Rating]) -> Result<u64, StoreError>;
    async fn upsert_tags(&self, rows: &[Tag]) -> Result<u64, StoreError>;
    async fn upsert_links(&self, rows: &[Link]) -> Result<u64, StoreError>;

    async fn insert_entities(&self, kind: EntityKind, names: &[String]) -> Result<u64, StoreError>;

    /// Authoritative name -> id mapping for one reference table.
    async fn entity_ids(&self, kind: EntityKind) -> Result<HashMap<String, EntityId>, StoreError>;

    async fn insert_associations(
        &self,
        kind: EntityKind,
        pairs: &[(MovieId, EntityId)],
    ) -> Result<u64, StoreError>;

    async fn set_primary_languages(&self, updates: &[(MovieId, EntityId)])
        -> Result<u64, StoreError>;

    /// Recompute `movies.avg_rating` from the ratings table.
    async fn refresh_average_ratings(&self) -> Result<u64, StoreError>;
}

/// Keep the last row for each key. Postgres refuses an `ON CONFLICT DO UPDATE`
/// statement that touches the same target row twice.
pub fn collapse_by_key<T, K, F>(rows: &[T], key: F) -> Vec<&T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<&T> = Vec::with_capacity(rows.len());
    for row in rows {
        match positions.get(&key(row)) {
            Some(&idx) => out[idx] = row,
            None => {
                positions.insert(key(row), out.len());
                out.push(row);
            }
        }
    }
    out
}

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: PgPool,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    async fn row_count(&self, table: Table) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_movies(&self, rows: &[Movie]) -> Result<u64, StoreError> {
        let rows = collapse_by_key(rows, |m| m.movie_id);
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO movies (movie_id, title, release_date, poster_url, tomatometer, audience_score, runtime_minutes) ",
        );
        qb.push_values(rows, |mut b, m| {
            b.push_bind(m.movie_id)
                .push_bind(&m.title)
                .push_bind(m.release_date)
                .push_bind(&m.poster_url)
                .push_bind(m.tomatometer)
                .push_bind(m.audience_score)
                .push_bind(m.runtime_minutes);
        });
        qb.push(
            " ON CONFLICT (movie_id)
              DO UPDATE SET title = EXCLUDED.title,
                            release_date = EXCLUDED.release_date,
                            poster_url = EXCLUDED.poster_url,
                            tomatometer = EXCLUDED.tomatometer,
                            audience_score = EXCLUDED.audience_score,
                            runtime_minutes = EXCLUDED.runtime_minutes",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_awards(&self, rows: &[Award]) -> Result<u64, StoreError> {
        let rows = collapse_by_key(rows, |a| a.movie_id);
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO awards (movie_id, wins, nominations) ");
        qb.push_values(rows, |mut b, a| {
            b.push_bind(a.movie_id)
                .push_bind(a.wins)
                .push_bind(a.nominations);
        });
        qb.push(
            " ON CONFLICT (movie_id)
              DO UPDATE SET wins = EXCLUDED.wins,
                            nominations = EXCLUDED.nominations",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_ratings(&self, rows: &[Rating]) -> Result<u64, StoreError> {
        let rows = collapse_by_key(rows, |r| (r.user_id, r.movie_id));
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO ratings (user_id, movie_id, rating, rated_at) ");
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.user_id)
                .push_bind(r.movie_id)
                .push_bind(r.rating)
                .push_bind(r.timestamp);
        });
        qb.push(
            " ON CONFLICT (user_id, movie_id)
              DO UPDATE SET rating = EXCLUDED.rating,
                            rated_at = EXCLUDED.rated_at",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_tags(&self, rows: &[Tag]) -> Result<u64, StoreError> {
        let rows = collapse_by_key(rows, |t| (t.user_id, t.movie_id, t.tag.clone()));
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO tags (user_id, movie_id, tag, tagged_at) ");
        qb.push_values(rows, |mut b, t| {
            b.push_bind(t.user_id)
                .push_bind(t.movie_id)
                .push_bind(&t.tag)
                .push_bind(t.timestamp);
        });
        qb.push(
            " ON CONFLICT (user_id, movie_id, tag)
              DO UPDATE SET tagged_at = EXCLUDED.tagged_at",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_links(&self, rows: &[Link]) -> Result<u64, StoreError> {
        let rows = collapse_by_key(rows, |l| l.movie_id);
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("INSERT INTO links (movie_id, imdb_id, tmdb_id) ");
        qb.push_values(rows, |mut b, l| {
            b.push_bind(l.movie_id)
                .push_bind(&l.imdb_id)
                .push_bind(&l.tmdb_id);
        });
        qb.push(
            " ON CONFLICT (movie_id)
              DO UPDATE SET imdb_id = EXCLUDED.imdb_id,
                            tmdb_id = EXCLUDED.tmdb_id",
        );
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, names), fields(%kind, rows = names.len()))]
    async fn insert_entities(&self, kind: EntityKind, names: &[String]) -> Result<u64, StoreError> {
        if names.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} (name) ", kind.table()));
        qb.push_values(names, |mut b, name| {
            b.push_bind(name);
        });
        qb.push(" ON CONFLICT (name) DO NOTHING");
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn entity_ids(&self, kind: EntityKind) -> Result<HashMap<String, EntityId>, StoreError> {
        let sql = format!("SELECT {}, name FROM {}", kind.id_column(), kind.table());
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut ids = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: EntityId = row.try_get(0)?;
            let name: String = row.try_get(1)?;
            ids.insert(name, id);
        }
        Ok(ids)
    }

    #[instrument(skip(self, pairs), fields(%kind, rows = pairs.len()))]
    async fn insert_associations(
        &self,
        kind: EntityKind,
        pairs: &[(MovieId, EntityId)],
    ) -> Result<u64, StoreError> {
        let Some(join_table) = kind.join_table() else {
            return Err(StoreError::Message(format!("{kind} has no movie join table")));
        };
        if pairs.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {join_table} (movie_id, {}) ",
            kind.id_column()
        ));
        qb.push_values(pairs, |mut b, (movie_id, entity_id)| {
            b.push_bind(*movie_id).push_bind(*entity_id);
        });
        qb.push(" ON CONFLICT DO NOTHING");
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    #[instrument(skip(self, updates), fields(rows = updates.len()))]
    async fn set_primary_languages(
        &self,
        updates: &[(MovieId, EntityId)],
    ) -> Result<u64, StoreError> {
        let updates = collapse_by_key(updates, |(movie_id, _)| *movie_id);
        if updates.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "UPDATE movies AS m SET primary_language_id = v.language_id FROM (",
        );
        qb.push_values(updates, |mut b, (movie_id, language_id)| {
            b.push_bind(*movie_id).push_bind(*language_id);
        });
        qb.push(") AS v (movie_id, language_id) WHERE m.movie_id = v.movie_id");
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn refresh_average_ratings(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE movies AS m
               SET avg_rating = r.avg_rating
              FROM (
                    SELECT movie_id, AVG(rating)::REAL AS avg_rating
                      FROM ratings
                     GROUP BY movie_id
                   ) AS r
             WHERE m.movie_id = r.movie_id
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapse_keeps_last_write_per_key() {
        let rows = vec![(1, "a"), (2, "b"), (1, "c"), (3, "d"), (2, "e")];
        let collapsed = collapse_by_key(&rows, |(k, _)| *k);
        let values: Vec<&str> = collapsed.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec!["c", "e", "d"]);
    }

    #[test]
    fn collapse_of_unique_rows_is_identity() {
        let rows = vec![10, 20, 30];
        let collapsed = collapse_by_key(&rows, |v| *v);
        assert_eq!(collapsed, vec![&10, &20, &30]);
    }
}
