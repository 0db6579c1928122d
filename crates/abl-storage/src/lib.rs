//! Persistence for approved balls: the `BallStore` contract, opaque page tokens,
//! and a SQLite-backed implementation.

use std::str::FromStr;
use std::time::Duration;

use abl_core::{Ball, BallFilter, Brand, ListBallsResult};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::NaiveDate;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use thiserror::Error;
use tracing::debug;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("ball already stored: {brand} {name}")]
    Duplicate { brand: String, name: String },
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Opaque resumption point for paginated listing.
///
/// Wire format: base64url (padded) of the decimal ASCII offset. Callers should
/// only pass back what a previous listing returned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PageToken(String);

impl PageToken {
    pub fn first_page() -> Self {
        Self(String::new())
    }

    pub fn from_offset(offset: usize) -> Self {
        Self(URL_SAFE.encode(offset.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Decode the row offset. An empty token is offset 0.
    pub fn offset(&self) -> Result<usize, StoreError> {
        if self.0.is_empty() {
            return Ok(0);
        }
        let invalid = |reason: String| StoreError::InvalidArgument(format!("invalid page token: {reason}"));

        let bytes = URL_SAFE
            .decode(self.0.as_bytes())
            .map_err(|err| invalid(err.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|err| invalid(err.to_string()))?;
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(format!("{text:?} is not a decimal offset")));
        }
        text.parse::<usize>().map_err(|err| invalid(err.to_string()))
    }
}

impl From<String> for PageToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PageToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[async_trait]
pub trait BallStore: Send + Sync {
    /// Insert all balls atomically. An empty batch is a no-op.
    async fn add_balls(&self, balls: &[Ball]) -> Result<(), StoreError>;

    /// List balls matching `filter`, newest insert first. `page_size == 0` disables pagination.
    async fn list_balls(
        &self,
        filter: &BallFilter,
        page_size: usize,
        page_token: &PageToken,
    ) -> Result<ListBallsResult, StoreError>;

    /// Delete by `(brand, name)` atomically. An empty batch is a no-op.
    async fn remove_balls(&self, balls: &[Ball]) -> Result<(), StoreError>;

    async fn all_balls(&self, filter: &BallFilter) -> Result<Vec<Ball>, StoreError> {
        Ok(self
            .list_balls(filter, 0, &PageToken::first_page())
            .await?
            .balls)
    }
}

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl SqliteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

#[derive(Debug, FromRow)]
struct BallRow {
    id: i64,
    brand: String,
    name: String,
    approval_date: NaiveDate,
    image_url: String,
    total_count: i64,
}

impl TryFrom<BallRow> for Ball {
    type Error = StoreError;

    fn try_from(row: BallRow) -> Result<Self, Self::Error> {
        let brand = Brand::from_str(&row.brand)
            .map_err(|err| StoreError::CorruptRow(format!("ball {}: {err}", row.id)))?;
        Ok(Ball {
            id: Some(row.id),
            brand,
            name: row.name,
            approval_date: row.approval_date,
            image_url: row.image_url,
        })
    }
}

/// SQLite store. The pool is safe to share across workers; `close` is terminal.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database and apply embedded migrations.
    pub async fn connect(config: &SqliteConfig) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);

        // Every connection to `:memory:` is a separate database, so pin to one.
        let pool_options = if config.is_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn list_query<'a>(
        filter: &'a BallFilter,
        page_size: usize,
        offset: usize,
    ) -> QueryBuilder<'a, Sqlite> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, brand, name, approval_date, image_url, COUNT(*) OVER () AS total_count \
             FROM balls WHERE 1 = 1",
        );
        if let Some(brand) = filter.brand {
            qb.push(" AND brand = ").push_bind(brand.as_str());
        }
        if let Some(name) = filter.name.as_deref() {
            qb.push(" AND name = ").push_bind(name);
        }
        if let Some(date) = filter.approval_date {
            qb.push(" AND approval_date = ").push_bind(date);
        }
        qb.push(" ORDER BY id DESC");
        if page_size > 0 {
            let limit = i64::try_from(page_size.saturating_add(1)).unwrap_or(i64::MAX);
            let offset = i64::try_from(offset).unwrap_or(i64::MAX);
            qb.push(" LIMIT ").push_bind(limit);
            qb.push(" OFFSET ").push_bind(offset);
        }
        qb
    }
}

fn map_insert_error(err: sqlx::Error, ball: &Ball) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate {
            brand: ball.brand.to_string(),
            name: ball.name.clone(),
        },
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl BallStore for SqliteStore {
    async fn add_balls(&self, balls: &[Ball]) -> Result<(), StoreError> {
        if balls.is_empty() {
            return Ok(());
        }

        // Dropping the transaction without commit rolls the whole batch back.
        let mut tx = self.pool.begin().await?;
        for ball in balls {
            sqlx::query(
                "INSERT INTO balls (brand, name, approval_date, image_url) VALUES (?, ?, ?, ?)",
            )
            .bind(ball.brand.as_str())
            .bind(&ball.name)
            .bind(ball.approval_date)
            .bind(&ball.image_url)
            .execute(&mut *tx)
            .await
            .map_err(|err| map_insert_error(err, ball))?;
        }
        tx.commit().await?;

        debug!(count = balls.len(), "inserted balls");
        Ok(())
    }

    async fn list_balls(
        &self,
        filter: &BallFilter,
        page_size: usize,
        page_token: &PageToken,
    ) -> Result<ListBallsResult, StoreError> {
        let offset = page_token.offset()?;
        let mut qb = Self::list_query(filter, page_size, offset);
        let rows: Vec<BallRow> = qb.build_query_as().fetch_all(&self.pool).await?;

        let total_count = rows
            .first()
            .map(|r| usize::try_from(r.total_count).unwrap_or_default())
            .unwrap_or(0);

        let mut balls = rows
            .into_iter()
            .map(Ball::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut next_page_token = String::new();
        if page_size > 0 && balls.len() > page_size {
            balls.truncate(page_size);
            next_page_token = PageToken::from_offset(offset.saturating_add(page_size)).into_string();
        }

        Ok(ListBallsResult {
            balls,
            next_page_token,
            total_count,
        })
    }

    async fn remove_balls(&self, balls: &[Ball]) -> Result<(), StoreError> {
        if balls.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for ball in balls {
            sqlx::query("DELETE FROM balls WHERE brand = ? AND name = ?")
                .bind(ball.brand.as_str())
                .bind(&ball.name)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(count = balls.len(), "removed balls");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn ball(brand: Brand, name: &str) -> Ball {
        Ball::new(brand, name, date(2023, 4, 1), format!("https://img/{name}.jpg"))
    }

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect(&SqliteConfig::in_memory())
            .await
            .expect("in-memory store")
    }

    #[test]
    fn page_token_encodes_base64url_decimal_offset() {
        let token = PageToken::from_offset(25);
        assert_eq!(token.as_str(), "MjU=");
        assert_eq!(token.offset().unwrap(), 25);
        assert_eq!(PageToken::first_page().offset().unwrap(), 0);
    }

    #[test]
    fn page_token_rejects_foreign_encodings() {
        for bad in ["!!!", "MjU", "LTU=", "YWJj"] {
            let err = PageToken::from(bad).offset().unwrap_err();
            assert!(matches!(err, StoreError::InvalidArgument(_)), "{bad}: {err}");
        }
    }

    #[tokio::test]
    async fn add_empty_batch_is_noop() {
        let store = memory_store().await;
        store.add_balls(&[]).await.unwrap();
        store.remove_balls(&[]).await.unwrap();
        assert!(store.all_balls(&BallFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_orders_newest_insert_first() {
        let store = memory_store().await;
        store
            .add_balls(&[ball(Brand::Storm, "A"), ball(Brand::Storm, "B"), ball(Brand::Storm, "C")])
            .await
            .unwrap();
        let names: Vec<_> = store
            .all_balls(&BallFilter::default())
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["C", "B", "A"]);
    }

    #[tokio::test]
    async fn pagination_walks_every_row_exactly_once() {
        let store = memory_store().await;
        let seeded: Vec<_> = (0..11).map(|i| ball(Brand::Hammer, &format!("ball-{i}"))).collect();
        store.add_balls(&seeded).await.unwrap();

        for page_size in [1, 3, 4, 11, 20] {
            let mut token = PageToken::first_page();
            let mut seen = Vec::new();
            loop {
                let page = store
                    .list_balls(&BallFilter::default(), page_size, &token)
                    .await
                    .unwrap();
                assert!(page.balls.len() <= page_size);
                assert_eq!(page.total_count, 11);
                seen.extend(page.balls.into_iter().map(|b| b.name));
                if page.next_page_token.is_empty() {
                    break;
                }
                token = PageToken::from(page.next_page_token);
            }
            let unique: HashSet<_> = seen.iter().cloned().collect();
            assert_eq!(seen.len(), 11, "page_size {page_size}");
            assert_eq!(unique.len(), 11, "page_size {page_size}");
        }
    }

    #[tokio::test]
    async fn exact_fit_page_has_no_next_token() {
        let store = memory_store().await;
        store
            .add_balls(&[ball(Brand::Motiv, "A"), ball(Brand::Motiv, "B")])
            .await
            .unwrap();
        let page = store
            .list_balls(&BallFilter::default(), 2, &PageToken::first_page())
            .await
            .unwrap();
        assert_eq!(page.balls.len(), 2);
        assert!(page.next_page_token.is_empty());
    }

    #[tokio::test]
    async fn zero_page_size_returns_everything() {
        let store = memory_store().await;
        let seeded: Vec<_> = (0..5).map(|i| ball(Brand::Dv8, &format!("b{i}"))).collect();
        store.add_balls(&seeded).await.unwrap();
        let page = store
            .list_balls(&BallFilter::default(), 0, &PageToken::from_offset(3))
            .await
            .unwrap();
        assert_eq!(page.balls.len(), 5);
        assert_eq!(page.total_count, 5);
        assert!(page.next_page_token.is_empty());
    }

    #[tokio::test]
    async fn filters_combine_conjunctively() {
        let store = memory_store().await;
        store
            .add_balls(&[
                ball(Brand::Storm, "Phaze"),
                ball(Brand::Storm, "IQ Tour"),
                ball(Brand::RotoGrip, "Phaze"),
            ])
            .await
            .unwrap();

        let filter = BallFilter {
            brand: Some(Brand::Storm),
            name: Some("Phaze".into()),
            approval_date: None,
        };
        let page = store
            .list_balls(&filter, 10, &PageToken::first_page())
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.balls.len(), 1);
        assert_eq!(page.balls[0].brand, Brand::Storm);
        assert_eq!(page.balls[0].name, "Phaze");
        assert!(page.balls[0].id.is_some());
    }

    #[tokio::test]
    async fn approval_date_filter_matches_exact_day() {
        let store = memory_store().await;
        let mut early = ball(Brand::Track, "Early");
        early.approval_date = date(2001, 1, 31);
        store.add_balls(&[early, ball(Brand::Track, "Late")]).await.unwrap();

        let filter = BallFilter {
            approval_date: Some(date(2001, 1, 31)),
            ..BallFilter::default()
        };
        let balls = store.all_balls(&filter).await.unwrap();
        assert_eq!(balls.len(), 1);
        assert_eq!(balls[0].name, "Early");
        assert_eq!(balls[0].approval_date, date(2001, 1, 31));
    }

    #[tokio::test]
    async fn duplicate_identity_is_rejected_and_batch_rolls_back() {
        let store = memory_store().await;
        store.add_balls(&[ball(Brand::Swag, "Hustle")]).await.unwrap();

        let mut same = ball(Brand::Swag, "Hustle");
        same.approval_date = date(2024, 1, 1);
        same.image_url = "https://elsewhere".into();
        let err = store
            .add_balls(&[ball(Brand::Swag, "Fresh"), same])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }), "{err}");

        let names: Vec<_> = store
            .all_balls(&BallFilter::brand(Brand::Swag))
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec!["Hustle"]);
    }

    #[tokio::test]
    async fn remove_matches_on_brand_and_name() {
        let store = memory_store().await;
        store
            .add_balls(&[
                ball(Brand::Ebonite, "Gamebreaker"),
                ball(Brand::Columbia300, "Gamebreaker"),
                ball(Brand::Ebonite, "O'Reilly"),
            ])
            .await
            .unwrap();

        let mut target = ball(Brand::Ebonite, "Gamebreaker");
        target.approval_date = date(1999, 9, 9);
        store
            .remove_balls(&[target, ball(Brand::Ebonite, "O'Reilly")])
            .await
            .unwrap();

        let remaining = store.all_balls(&BallFilter::default()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].brand, Brand::Columbia300);
    }

    #[tokio::test]
    async fn invalid_token_fails_listing() {
        let store = memory_store().await;
        let err = store
            .list_balls(&BallFilter::default(), 5, &PageToken::from("not-a-token"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn closed_store_rejects_calls() {
        let store = memory_store().await;
        store.close().await;
        assert!(store.all_balls(&BallFilter::default()).await.is_err());
    }
}
