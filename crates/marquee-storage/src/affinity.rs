//! Store side of the genre-affinity summaries.

use async_trait::async_trait;
use marquee_core::{AffinityRow, AffinityVariant, UserId};
use sqlx::{Connection, Executor, PgConnection, PgPool, Row};

use crate::catalog::StoreError;

/// Steps the aggregate engine drives, in order, for one variant.
#[async_trait]
pub trait AffinityStore: Send {
    async fn summary_rows(&mut self, variant: AffinityVariant) -> Result<i64, StoreError>;

    /// Rebuild the staging table with every seed rating joined to its genres.
    async fn stage_seeds(&mut self, variant: AffinityVariant) -> Result<u64, StoreError>;

    /// Open the unit of work that covers truncation and every window, so a failed rebuild
    /// leaves the previous summary in place.
    async fn begin_rebuild(&mut self, variant: AffinityVariant) -> Result<(), StoreError>;

    async fn commit_rebuild(&mut self, variant: AffinityVariant) -> Result<(), StoreError>;

    async fn rollback_rebuild(&mut self, variant: AffinityVariant) -> Result<(), StoreError>;

    async fn truncate_summary(&mut self, variant: AffinityVariant) -> Result<(), StoreError>;

    /// Distinct users present in the staging table, ascending.
    async fn staged_users(&mut self, variant: AffinityVariant) -> Result<Vec<UserId>, StoreError>;

    /// Aggregate one window of users into the summary table.
    async fn aggregate_users(
        &mut self,
        variant: AffinityVariant,
        users: &[UserId],
        min_support: i64,
    ) -> Result<u64, StoreError>;
}

fn seed_predicate(variant: AffinityVariant) -> (&'static str, f32) {
    match variant {
        AffinityVariant::Low => ("<", AffinityVariant::LOW_THRESHOLD),
        AffinityVariant::High => (">", AffinityVariant::HIGH_THRESHOLD),
    }
}

/// Owns a dedicated connection so both variants can run side by side.
pub struct PgAffinityStore {
    conn: PgConnection,
}

impl PgAffinityStore {
    pub fn new(conn: PgConnection) -> Self {
        Self { conn }
    }

    pub async fn close(self) -> Result<(), StoreError> {
        self.conn.close().await?;
        Ok(())
    }
}

#[async_trait]
impl AffinityStore for PgAffinityStore {
    async fn summary_rows(&mut self, variant: AffinityVariant) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", variant.summary_table());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut self.conn).await?;
        Ok(count)
    }

    async fn stage_seeds(&mut self, variant: AffinityVariant) -> Result<u64, StoreError> {
        let staging = variant.staging_table();
        let (op, threshold) = seed_predicate(variant);
        let insert = format!(
            r#"
            INSERT INTO {staging} (user_id, movie_id, rating, title, genre)
            SELECT r.user_id, r.movie_id, r.rating, m.title, g.name
              FROM ratings r
              JOIN movies m        ON m.movie_id = r.movie_id
              JOIN movie_genres mg ON mg.movie_id = r.movie_id
              JOIN genres g        ON g.genre_id = mg.genre_id
             WHERE r.rating {op} $1
            "#
        );

        let mut tx = self.conn.begin().await?;
        sqlx::query(&format!("TRUNCATE {staging}"))
            .execute(&mut *tx)
            .await?;
        let staged = sqlx::query(&insert)
            .bind(threshold)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(staged)
    }

    // The connection is owned for the whole run, so the rebuild transaction spans several
    // trait calls instead of living in a borrowed `Transaction`.
    async fn begin_rebuild(&mut self, _variant: AffinityVariant) -> Result<(), StoreError> {
        (&mut self.conn).execute(sqlx::raw_sql("BEGIN")).await?;
        Ok(())
    }

    async fn commit_rebuild(&mut self, _variant: AffinityVariant) -> Result<(), StoreError> {
        (&mut self.conn).execute(sqlx::raw_sql("COMMIT")).await?;
        Ok(())
    }

    async fn rollback_rebuild(&mut self, _variant: AffinityVariant) -> Result<(), StoreError> {
        (&mut self.conn).execute(sqlx::raw_sql("ROLLBACK")).await?;
        Ok(())
    }

    async fn truncate_summary(&mut self, variant: AffinityVariant) -> Result<(), StoreError> {
        sqlx::query(&format!("TRUNCATE {}", variant.summary_table()))
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn staged_users(&mut self, variant: AffinityVariant) -> Result<Vec<UserId>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT user_id FROM {} ORDER BY user_id",
            variant.staging_table()
        );
        let users: Vec<UserId> = sqlx::query_scalar(&sql).fetch_all(&mut self.conn).await?;
        Ok(users)
    }

    async fn aggregate_users(
        &mut self,
        variant: AffinityVariant,
        users: &[UserId],
        min_support: i64,
    ) -> Result<u64, StoreError> {
        if users.is_empty() {
            return Ok(0);
        }
        let staging = variant.staging_table();
        let summary = variant.summary_table();
        let genre_column = variant.genre_column();
        // Each of the user's ratings counts once per other genre; seed movies of the
        // reference genre never contribute to it.
        let sql = format!(
            r#"
            INSERT INTO {summary} (user_id, {genre_column}, other_genre, avg_other_rating, rating_count)
            SELECT s.user_id, s.genre, g.name, AVG(r.rating)::DOUBLE PRECISION, COUNT(*)
              FROM (SELECT DISTINCT user_id, genre FROM {staging} WHERE user_id = ANY($1)) AS s
              JOIN ratings r       ON r.user_id = s.user_id
              JOIN movie_genres mg ON mg.movie_id = r.movie_id
              JOIN genres g        ON g.genre_id = mg.genre_id
             WHERE g.name <> s.genre
               AND NOT EXISTS (
                    SELECT 1
                      FROM {staging} seed
                     WHERE seed.user_id = s.user_id
                       AND seed.genre = s.genre
                       AND seed.movie_id = r.movie_id
                   )
             GROUP BY s.user_id, s.genre, g.name
            HAVING COUNT(*) > $2
            "#
        );
        let inserted = sqlx::query(&sql)
            .bind(users)
            .bind(min_support)
            .execute(&mut self.conn)
            .await?
            .rows_affected();
        Ok(inserted)
    }
}

/// Summary rows for one (user, reference genre) pair, best-rated other genre first.
pub async fn affinities_for(
    pool: &PgPool,
    variant: AffinityVariant,
    user_id: UserId,
    genre: &str,
) -> Result<Vec<AffinityRow>, StoreError> {
    let genre_column = variant.genre_column();
    let sql = format!(
        r#"
        SELECT user_id, {genre_column} AS reference_genre, other_genre,
               avg_other_rating, rating_count::BIGINT AS rating_count
          FROM {}
         WHERE user_id = $1
           AND {genre_column} = $2
         ORDER BY avg_other_rating DESC, other_genre
        "#,
        variant.summary_table()
    );
    let rows = sqlx::query(&sql)
        .bind(user_id)
        .bind(genre)
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|row| {
            Ok(AffinityRow {
                user_id: row.try_get("user_id")?,
                reference_genre: row.try_get("reference_genre")?,
                other_genre: row.try_get("other_genre")?,
                avg_other_rating: row.try_get("avg_other_rating")?,
                rating_count: row.try_get("rating_count")?,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(StoreError::from)
}
