//! SQLite-backed listing cache and interaction state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use kwatera_core::{Clock, Interaction, InteractionFlags, Listing, ListingDraft, Millis};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::debug;

/// Stored `user_id` for the anonymous partition.
const ANONYMOUS: &str = "";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Opens the database, creating the file when missing. In-memory databases are pinned
/// to a single connection so every query sees the same data.
pub async fn connect(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let mut pool = SqlitePoolOptions::new();
    if in_memory {
        pool = pool.max_connections(1).idle_timeout(None).max_lifetime(None);
    } else {
        pool = pool.max_connections(4);
    }
    Ok(pool.connect_with(options).await?)
}

pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

const LISTING_COLUMNS: &str =
    "external_id, title, price, floor, area, image_url, external_link, created_at, updated_at";

fn listing_from_row(row: &SqliteRow) -> Result<Listing, sqlx::Error> {
    Ok(Listing {
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        price: row.try_get("price")?,
        floor: row.try_get("floor")?,
        area: row.try_get("area")?,
        image_url: row.try_get("image_url")?,
        external_link: row.try_get("external_link")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Listing cache keyed by external id.
#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl ListingStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Inserts unseen listings and refreshes the mutable fields of known ones, keeping
    /// `created_at`. The batch commits atomically; a row already written with a newer
    /// `updated_at` is left alone.
    pub async fn upsert(&self, listings: &[ListingDraft]) -> Result<(), StoreError> {
        if listings.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_millis();
        let mut tx = self.pool.begin().await?;
        for draft in listings {
            sqlx::query(
                r#"
                INSERT INTO listings
                    (external_id, title, price, floor, area, image_url, external_link, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (external_id) DO UPDATE SET
                    title      = excluded.title,
                    price      = excluded.price,
                    floor      = excluded.floor,
                    area       = excluded.area,
                    image_url  = excluded.image_url,
                    updated_at = excluded.updated_at
                WHERE excluded.updated_at >= listings.updated_at
                "#,
            )
            .bind(&draft.external_id)
            .bind(&draft.title)
            .bind(&draft.price)
            .bind(&draft.floor)
            .bind(&draft.area)
            .bind(&draft.image_url)
            .bind(&draft.external_link)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(count = listings.len(), "upserted listings");
        Ok(())
    }

    /// Exact-match lookup. Unknown ids are skipped; output follows the first occurrence
    /// of each id in `ids`.
    pub async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<Listing>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE external_id IN ("
        ));
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut by_id = HashMap::with_capacity(rows.len());
        for row in &rows {
            let listing = listing_from_row(row)?;
            by_id.insert(listing.external_id.clone(), listing);
        }

        let mut seen = HashSet::with_capacity(ids.len());
        Ok(ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter_map(|id| by_id.remove(id))
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE external_id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(listing_from_row).transpose()?)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

const INTERACTION_COLUMNS: &str =
    "listing_id, user_id, is_viewed, is_liked, viewed_at, liked_at, created_at, updated_at";

fn interaction_from_row(row: &SqliteRow) -> Result<Interaction, sqlx::Error> {
    let user_id: String = row.try_get("user_id")?;
    Ok(Interaction {
        listing_id: row.try_get("listing_id")?,
        user_id: if user_id.is_empty() { None } else { Some(user_id) },
        is_viewed: row.try_get("is_viewed")?,
        is_liked: row.try_get("is_liked")?,
        viewed_at: row.try_get("viewed_at")?,
        liked_at: row.try_get("liked_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Viewed/liked state, one record per `(listing_id, user)` pair. Each instance reads and
/// writes a single user partition; the default partition is anonymous.
#[derive(Debug, Clone)]
pub struct InteractionStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    user_id: Option<String>,
}

impl InteractionStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            clock,
            user_id: None,
        }
    }

    /// Same database, different user partition. Empty ids mean anonymous.
    pub fn scoped(&self, user_id: Option<String>) -> Self {
        Self {
            pool: self.pool.clone(),
            clock: Arc::clone(&self.clock),
            user_id: user_id.filter(|u| !u.is_empty()),
        }
    }

    fn partition(&self) -> &str {
        self.user_id.as_deref().unwrap_or(ANONYMOUS)
    }

    /// Sets `is_viewed` and stamps `viewed_at`; the like state is untouched.
    pub async fn mark_viewed(&self, listing_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        sqlx::query(
            r#"
            INSERT INTO interactions
                (listing_id, user_id, is_viewed, is_liked, viewed_at, liked_at, created_at, updated_at)
            VALUES (?, ?, 1, 0, ?, NULL, ?, ?)
            ON CONFLICT (listing_id, user_id) DO UPDATE SET
                is_viewed  = 1,
                viewed_at  = excluded.viewed_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(listing_id)
        .bind(self.partition())
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `liked_at` is stamped on a false -> true transition, kept on a repeated like and
    /// cleared on unlike. The viewed state is untouched.
    pub async fn set_liked(&self, listing_id: &str, liked: bool) -> Result<(), StoreError> {
        let now = self.clock.now_millis();
        let liked_at: Option<Millis> = liked.then_some(now);
        sqlx::query(
            r#"
            INSERT INTO interactions
                (listing_id, user_id, is_viewed, is_liked, viewed_at, liked_at, created_at, updated_at)
            VALUES (?, ?, 0, ?, NULL, ?, ?, ?)
            ON CONFLICT (listing_id, user_id) DO UPDATE SET
                liked_at   = CASE
                                 WHEN excluded.is_liked = 0 THEN NULL
                                 WHEN interactions.is_liked = 1 THEN interactions.liked_at
                                 ELSE excluded.liked_at
                             END,
                is_liked   = excluded.is_liked,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(listing_id)
        .bind(self.partition())
        .bind(liked)
        .bind(liked_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flags for the ids that have a record. Absent ids are absent from the map.
    pub async fn get_flags(
        &self,
        listing_ids: &[String],
    ) -> Result<BTreeMap<String, InteractionFlags>, StoreError> {
        if listing_ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT listing_id, is_viewed, is_liked FROM interactions WHERE user_id = ",
        );
        qb.push_bind(self.partition());
        qb.push(" AND listing_id IN (");
        let mut separated = qb.separated(", ");
        for id in listing_ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = BTreeMap::new();
        for row in rows {
            out.insert(
                row.try_get::<String, _>("listing_id")?,
                InteractionFlags {
                    is_viewed: row.try_get("is_viewed")?,
                    is_liked: row.try_get("is_liked")?,
                },
            );
        }
        Ok(out)
    }

    /// Liked interactions in insertion order.
    pub async fn get_liked(&self) -> Result<Vec<Interaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions WHERE user_id = ? AND is_liked = 1 ORDER BY id"
        ))
        .bind(self.partition())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(interaction_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    /// Ids with any engagement flag set.
    pub async fn excluded_ids(&self) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT listing_id FROM interactions WHERE user_id = ? AND (is_viewed = 1 OR is_liked = 1)",
        )
        .bind(self.partition())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn get(&self, listing_id: &str) -> Result<Option<Interaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INTERACTION_COLUMNS} FROM interactions WHERE user_id = ? AND listing_id = ?"
        ))
        .bind(self.partition())
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(interaction_from_row).transpose()?)
    }
}
