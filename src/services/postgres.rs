use crate::config::DatabaseSettings;
use crate::models::{
    ClassificationKey, ClassificationOutcome, ClassifiedPair, ClassifiedRecord, DuplicateTier,
    LocationRecord, PairKey, RecordFilter,
};
use crate::services::repository::{RecordRepository, RepositoryError};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// PostgreSQL-backed record repository
///
/// Records live in `locations`; record-level and pair-level results are
/// upserted into `location_classifications` and
/// `location_pair_classifications` keyed by content id / id pair.
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Create a new repository from a connection string
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(idle_timeout)
            .test_before_acquire(true)
            .connect(database_url)
            .await?;

        // Run migrations on startup
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a new repository from settings
    pub async fn from_settings(settings: &DatabaseSettings) -> Result<Self, RepositoryError> {
        tracing::info!("Connecting to PostgreSQL");

        Self::new(
            &settings.url,
            settings.max_connections.unwrap_or(10),
            settings.min_connections.unwrap_or(1),
            Duration::from_secs(settings.acquire_timeout_secs.unwrap_or(5)),
            Duration::from_secs(settings.idle_timeout_secs.unwrap_or(600)),
        )
        .await
    }
}

fn row_to_record(row: &PgRow) -> Result<LocationRecord, sqlx::Error> {
    Ok(LocationRecord {
        content_id: row.try_get("content_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        city: row.try_get("city")?,
        source_url: row.try_get("source_url")?,
    })
}

/// Upsert one outcome on any executor (pool or open transaction)
async fn upsert_outcome<'e, E: PgExecutor<'e>>(
    executor: E,
    key: &ClassificationKey,
    outcome: &ClassificationOutcome,
) -> Result<(), sqlx::Error> {
    match key {
        ClassificationKey::Record(content_id) => {
            let query = r#"
                INSERT INTO location_classifications
                    (content_id, tier, tier_rank, similarity, distance_meters,
                     manual_override, matched_content_id, run_id, classified_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (content_id)
                DO UPDATE SET
                    tier = EXCLUDED.tier,
                    tier_rank = EXCLUDED.tier_rank,
                    similarity = EXCLUDED.similarity,
                    distance_meters = EXCLUDED.distance_meters,
                    manual_override = EXCLUDED.manual_override,
                    matched_content_id = EXCLUDED.matched_content_id,
                    run_id = EXCLUDED.run_id,
                    classified_at = EXCLUDED.classified_at
            "#;

            sqlx::query(query)
                .bind(content_id)
                .bind(outcome.tier.as_str())
                .bind(outcome.tier.rank())
                .bind(outcome.similarity)
                .bind(outcome.distance_meters)
                .bind(outcome.manual_override)
                .bind(outcome.matched_content_id.as_deref())
                .bind(outcome.run_id)
                .bind(outcome.classified_at)
                .execute(executor)
                .await?;
        }
        ClassificationKey::Pair(pair) => {
            let query = r#"
                INSERT INTO location_pair_classifications
                    (content_id_a, content_id_b, tier, tier_rank, similarity,
                     distance_meters, manual_override, run_id, classified_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (content_id_a, content_id_b)
                DO UPDATE SET
                    tier = EXCLUDED.tier,
                    tier_rank = EXCLUDED.tier_rank,
                    similarity = EXCLUDED.similarity,
                    distance_meters = EXCLUDED.distance_meters,
                    manual_override = EXCLUDED.manual_override,
                    run_id = EXCLUDED.run_id,
                    classified_at = EXCLUDED.classified_at
            "#;

            sqlx::query(query)
                .bind(&pair.a)
                .bind(&pair.b)
                .bind(outcome.tier.as_str())
                .bind(outcome.tier.rank())
                .bind(outcome.similarity)
                .bind(outcome.distance_meters)
                .bind(outcome.manual_override)
                .bind(outcome.run_id)
                .bind(outcome.classified_at)
                .execute(executor)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl RecordRepository for PostgresRepository {
    /// One parameterized query serves every city / coordinate filter
    async fn fetch_records(&self, filter: &RecordFilter) -> Result<Vec<LocationRecord>, RepositoryError> {
        let query = r#"
            SELECT content_id, title, description, latitude, longitude, city, source_url
            FROM locations
            WHERE ($1::TEXT IS NULL OR LOWER(city) = LOWER($1))
              AND (NOT $2 OR (latitude IS NOT NULL AND longitude IS NOT NULL))
            ORDER BY content_id
        "#;

        let rows = sqlx::query(query)
            .bind(filter.city.as_deref())
            .bind(filter.require_coordinates)
            .fetch_all(&self.pool)
            .await?;

        let records = rows
            .iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!("Fetched {} location records", records.len());
        Ok(records)
    }

    async fn fetch_embedding(&self, content_id: &str) -> Result<Option<Vec<f32>>, RepositoryError> {
        let query = r#"
            SELECT description_embedding
            FROM locations
            WHERE content_id = $1
        "#;

        let row = sqlx::query(query)
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get::<Option<Vec<f32>>, _>("description_embedding")?),
            None => Ok(None),
        }
    }

    async fn fetch_embeddings(
        &self,
        content_ids: &[String],
    ) -> Result<HashMap<String, Vec<f32>>, RepositoryError> {
        let query = r#"
            SELECT content_id, description_embedding
            FROM locations
            WHERE content_id = ANY($1)
              AND description_embedding IS NOT NULL
        "#;

        let rows = sqlx::query(query)
            .bind(content_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: String = row.try_get("content_id")?;
            let embedding: Vec<f32> = row.try_get("description_embedding")?;
            found.insert(id, embedding);
        }
        Ok(found)
    }

    async fn store_embedding(&self, content_id: &str, embedding: &[f32]) -> Result<(), RepositoryError> {
        let query = r#"
            UPDATE locations
            SET description_embedding = $2
            WHERE content_id = $1
        "#;

        let result = sqlx::query(query)
            .bind(content_id)
            .bind(embedding)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::InvalidData(format!(
                "no location with content id {}",
                content_id
            )));
        }
        Ok(())
    }

    async fn fetch_manual_overrides(
        &self,
        content_ids: &[String],
    ) -> Result<HashSet<PairKey>, RepositoryError> {
        let query = r#"
            SELECT content_id_a, content_id_b
            FROM location_manual_overrides
            WHERE content_id_a = ANY($1) OR content_id_b = ANY($1)
        "#;

        let rows = sqlx::query(query)
            .bind(content_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut overrides = HashSet::with_capacity(rows.len());
        for row in &rows {
            let a: String = row.try_get("content_id_a")?;
            let b: String = row.try_get("content_id_b")?;
            overrides.insert(PairKey::new(a, b));
        }
        Ok(overrides)
    }

    async fn write_classification(
        &self,
        key: &ClassificationKey,
        outcome: &ClassificationOutcome,
    ) -> Result<(), RepositoryError> {
        upsert_outcome(&self.pool, key, outcome).await?;
        Ok(())
    }

    /// The whole chunk commits or none of it does
    async fn write_classifications(
        &self,
        outcomes: &[(ClassificationKey, ClassificationOutcome)],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for (key, outcome) in outcomes {
            upsert_outcome(&mut *tx, key, outcome).await?;
        }
        tx.commit().await?;

        tracing::debug!("Committed {} classifications", outcomes.len());
        Ok(())
    }

    async fn fetch_classified(&self, filter: &RecordFilter) -> Result<Vec<ClassifiedRecord>, RepositoryError> {
        let query = r#"
            SELECT l.content_id, l.title, l.description, l.latitude, l.longitude,
                   c.tier, c.matched_content_id
            FROM location_classifications c
            JOIN locations l ON l.content_id = c.content_id
            WHERE ($1::TEXT IS NULL OR LOWER(l.city) = LOWER($1))
              AND ($2::TEXT IS NULL OR c.tier = $2)
            ORDER BY c.tier_rank DESC, l.content_id
        "#;

        let rows = sqlx::query(query)
            .bind(filter.city.as_deref())
            .bind(filter.tier.map(|t| t.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ClassifiedRecord, RepositoryError> {
                let tier_name: String = row.try_get("tier")?;
                let tier: DuplicateTier = tier_name.parse().map_err(RepositoryError::InvalidData)?;
                Ok(ClassifiedRecord {
                    content_id: row.try_get("content_id")?,
                    title: row.try_get("title")?,
                    description: row.try_get("description")?,
                    latitude: row.try_get("latitude")?,
                    longitude: row.try_get("longitude")?,
                    tier,
                    is_duplicate: tier.is_duplicate(),
                    duplicate_of: row.try_get("matched_content_id")?,
                })
            })
            .collect()
    }

    async fn fetch_pair_classifications(
        &self,
        filter: &RecordFilter,
    ) -> Result<Vec<ClassifiedPair>, RepositoryError> {
        let query = r#"
            SELECT p.content_id_a, p.content_id_b, la.title AS title_a, lb.title AS title_b,
                   p.tier, p.similarity, p.distance_meters, p.manual_override
            FROM location_pair_classifications p
            JOIN locations la ON la.content_id = p.content_id_a
            JOIN locations lb ON lb.content_id = p.content_id_b
            WHERE ($1::TEXT IS NULL OR LOWER(la.city) = LOWER($1) OR LOWER(lb.city) = LOWER($1))
              AND ($2::TEXT IS NULL OR p.tier = $2)
            ORDER BY p.tier_rank DESC, p.content_id_a, p.content_id_b
        "#;

        let rows = sqlx::query(query)
            .bind(filter.city.as_deref())
            .bind(filter.tier.map(|t| t.as_str()))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ClassifiedPair, RepositoryError> {
                let tier_name: String = row.try_get("tier")?;
                Ok(ClassifiedPair {
                    content_id_a: row.try_get("content_id_a")?,
                    content_id_b: row.try_get("content_id_b")?,
                    title_a: row.try_get("title_a")?,
                    title_b: row.try_get("title_b")?,
                    tier: tier_name.parse().map_err(RepositoryError::InvalidData)?,
                    similarity: row.try_get("similarity")?,
                    distance_meters: row.try_get("distance_meters")?,
                    manual_override: row.try_get("manual_override")?,
                })
            })
            .collect()
    }

    /// Health check for the database connection
    async fn health_check(&self) -> Result<bool, RepositoryError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| true)
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[tokio::test]
    #[ignore = "Requires PostgreSQL (DATABASE_URL)"]
    async fn test_upsert_is_idempotent() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
        let repo = PostgresRepository::new(
            &url,
            2,
            1,
            Duration::from_secs(5),
            Duration::from_secs(60),
        )
        .await
        .expect("Failed to connect");

        sqlx::query(
            "INSERT INTO locations (content_id, title, latitude, longitude, city)
             VALUES ('pg-test-a', 'A', 40.71, -74.0, 'New York')
             ON CONFLICT (content_id) DO NOTHING",
        )
        .execute(&repo.pool)
        .await
        .unwrap();

        let key = ClassificationKey::Record("pg-test-a".to_string());
        let outcome = ClassificationOutcome {
            tier: DuplicateTier::Strong,
            similarity: 0.8,
            distance_meters: Some(20.0),
            manual_override: false,
            matched_content_id: None,
            run_id: Uuid::new_v4(),
            classified_at: Utc::now(),
        };
        repo.write_classifications(&[(key.clone(), outcome.clone()), (key, outcome)])
            .await
            .unwrap();

        let filter = RecordFilter {
            tier: Some(DuplicateTier::Strong),
            ..Default::default()
        };
        let classified = repo.fetch_classified(&filter).await.unwrap();
        assert_eq!(
            classified.iter().filter(|c| c.content_id == "pg-test-a").count(),
            1
        );
    }
}
