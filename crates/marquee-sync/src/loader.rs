//! Staged batch loader.
//!
//! Movie catalog writes run in four barriers: fact rows, reference entities
//! (followed by a read-back of their ids), primary languages, then associations.
//! Every batch is its own statement; a failed batch stops the file but leaves
//! earlier batches committed.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use marquee_adapters::Extraction;
use marquee_core::{Association, Award, EntityId, EntityKind, Link, Movie, MovieId, Rating, Tag};
use marquee_storage::{CatalogStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, warn};

/// A fact row type with a batched upsert on the catalog store.
#[async_trait]
pub trait FactRow: Sized + Send + Sync + 'static {
    const LABEL: &'static str;

    async fn upsert(store: &dyn CatalogStore, rows: &[Self]) -> Result<u64, StoreError>;
}

#[async_trait]
impl FactRow for Movie {
    const LABEL: &'static str = "movies";

    async fn upsert(store: &dyn CatalogStore, rows: &[Self]) -> Result<u64, StoreError> {
        store.upsert_movies(rows).await
    }
}

#[async_trait]
impl FactRow for Award {
    const LABEL: &'static str = "awards";

    async fn upsert(store: &dyn CatalogStore, rows: &[Self]) -> Result<u64, StoreError> {
        store.upsert_awards(rows).await
    }
}

#[async_trait]
impl FactRow for Rating {
    const LABEL: &'static str = "ratings";

    async fn upsert(store: &dyn CatalogStore, rows: &[Self]) -> Result<u64, StoreError> {
        store.upsert_ratings(rows).await
    }
}

#[async_trait]
impl FactRow for Tag {
    const LABEL: &'static str = "tags";

    async fn upsert(store: &dyn CatalogStore, rows: &[Self]) -> Result<u64, StoreError> {
        store.upsert_tags(rows).await
    }
}

#[async_trait]
impl FactRow for Link {
    const LABEL: &'static str = "links";

    async fn upsert(store: &dyn CatalogStore, rows: &[Self]) -> Result<u64, StoreError> {
        store.upsert_links(rows).await
    }
}

/// Drain `rows` into the store `batch_size` rows at a time.
pub async fn load_facts<T, I>(
    store: &dyn CatalogStore,
    rows: &mut I,
    batch_size: usize,
) -> Result<u64, StoreError>
where
    T: FactRow,
    I: Iterator<Item = T> + Send,
{
    let batch_size = batch_size.max(1);
    let mut written = 0u64;
    let mut batches = 0usize;
    loop {
        let batch: Vec<T> = rows.by_ref().take(batch_size).collect();
        if batch.is_empty() {
            break;
        }
        written += T::upsert(store, &batch).await?;
        batches += 1;
        debug!(table = T::LABEL, batches, written, "batch committed");
    }
    Ok(written)
}

async fn load_slice<T: FactRow>(
    store: &dyn CatalogStore,
    rows: &[T],
    batch_size: usize,
) -> Result<u64, StoreError> {
    let mut written = 0u64;
    for batch in rows.chunks(batch_size.max(1)) {
        written += T::upsert(store, batch).await?;
    }
    Ok(written)
}

/// First-listed language per movie resolved against the stored language ids.
///
/// Movies whose language never made it into `name_to_id` keep no primary language.
pub fn resolve_primary(
    first_seen: &BTreeMap<MovieId, String>,
    name_to_id: &HashMap<String, EntityId>,
) -> Vec<(MovieId, EntityId)> {
    first_seen
        .iter()
        .filter_map(|(movie_id, name)| name_to_id.get(name).map(|id| (*movie_id, *id)))
        .collect()
}

/// Association pairs of one kind, with names replaced by stored ids.
///
/// Returns the resolved pairs and the number of names that had no id.
pub fn resolve_associations(
    associations: &[Association],
    kind: EntityKind,
    name_to_id: &HashMap<String, EntityId>,
) -> (Vec<(MovieId, EntityId)>, usize) {
    let mut unresolved = 0usize;
    let pairs = associations
        .iter()
        .filter(|a| a.kind == kind)
        .filter_map(|a| match name_to_id.get(&a.name) {
            Some(id) => Some((a.movie_id, *id)),
            None => {
                unresolved += 1;
                None
            }
        })
        .collect();
    (pairs, unresolved)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogLoadStats {
    pub movies: u64,
    pub awards: u64,
    pub entities: BTreeMap<EntityKind, u64>,
    pub associations: BTreeMap<EntityKind, u64>,
    pub primary_languages: u64,
    pub unresolved_names: usize,
}

pub struct StagedLoader<'a> {
    store: &'a dyn CatalogStore,
    batch_size: usize,
}

impl<'a> StagedLoader<'a> {
    pub fn new(store: &'a dyn CatalogStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn load(&self, extraction: Extraction) -> Result<CatalogLoadStats, StoreError> {
        let mut stats = CatalogLoadStats::default();

        stats.movies = load_slice(self.store, &extraction.movies, self.batch_size).await?;
        stats.awards = load_slice(self.store, &extraction.awards, self.batch_size).await?;
        info!(movies = stats.movies, awards = stats.awards, "stage 1: fact rows written");

        let mut ids: HashMap<EntityKind, HashMap<String, EntityId>> = HashMap::new();
        for kind in EntityKind::ALL {
            let names = extraction.entities.names(kind);
            let mut inserted = 0u64;
            for batch in names.chunks(self.batch_size) {
                inserted += self.store.insert_entities(kind, batch).await?;
            }
            stats.entities.insert(kind, inserted);
            ids.insert(kind, self.store.entity_ids(kind).await?);
        }
        info!(entities = ?stats.entities, "stage 2: reference entities written");

        let languages = ids.get(&EntityKind::Language).cloned().unwrap_or_default();
        let updates = resolve_primary(&extraction.primary_languages, &languages);
        for batch in updates.chunks(self.batch_size) {
            stats.primary_languages += self.store.set_primary_languages(batch).await?;
        }
        info!(updated = stats.primary_languages, "stage 3: primary languages resolved");

        for kind in EntityKind::ASSOCIATED {
            let name_to_id = ids.get(&kind).cloned().unwrap_or_default();
            let (pairs, unresolved) = resolve_associations(&extraction.associations, kind, &name_to_id);
            if unresolved > 0 {
                warn!(%kind, unresolved, "association names missing from reference table");
            }
            stats.unresolved_names += unresolved;

            let mut inserted = 0u64;
            for batch in pairs.chunks(self.batch_size) {
                inserted += self.store.insert_associations(kind, batch).await?;
            }
            stats.associations.insert(kind, inserted);
        }
        info!(associations = ?stats.associations, "stage 4: associations written");

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryCatalog;
    use marquee_core::Table;

    fn movie(movie_id: MovieId, title: &str) -> Movie {
        Movie {
            movie_id,
            title: title.to_string(),
            release_date: None,
            poster_url: None,
            tomatometer: None,
            audience_score: None,
            runtime_minutes: 0,
        }
    }

    fn assoc(movie_id: MovieId, kind: EntityKind, name: &str) -> Association {
        Association {
            movie_id,
            kind,
            name: name.to_string(),
        }
    }

    #[test]
    fn primary_resolution_skips_unknown_names() {
        let first_seen = BTreeMap::from([
            (1, "English".to_string()),
            (2, "Klingon".to_string()),
            (3, "French".to_string()),
        ]);
        let ids = HashMap::from([("English".to_string(), 10), ("French".to_string(), 11)]);
        assert_eq!(resolve_primary(&first_seen, &ids), vec![(1, 10), (3, 11)]);
    }

    #[test]
    fn association_resolution_filters_by_kind_and_counts_misses() {
        let associations = vec![
            assoc(1, EntityKind::Genre, "Comedy"),
            assoc(1, EntityKind::Director, "John Lasseter"),
            assoc(2, EntityKind::Genre, "Comedy"),
            assoc(2, EntityKind::Genre, "Western"),
        ];
        let ids = HashMap::from([("Comedy".to_string(), 4)]);
        let (pairs, unresolved) = resolve_associations(&associations, EntityKind::Genre, &ids);
        assert_eq!(pairs, vec![(1, 4), (2, 4)]);
        assert_eq!(unresolved, 1);
    }

    #[tokio::test]
    async fn fact_rows_are_written_in_fixed_batches() {
        let store = MemoryCatalog::default();
        let ratings: Vec<Rating> = (1..=7)
            .map(|movie_id| Rating {
                user_id: 1,
                movie_id,
                rating: 3.5,
                timestamp: 0,
            })
            .collect();

        let written = load_facts(&store, &mut ratings.into_iter(), 3).await.unwrap();
        assert_eq!(written, 7);
        assert_eq!(store.batch_sizes("ratings"), vec![3, 3, 1]);
        assert_eq!(store.row_count(Table::Ratings).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn upsert_overwrites_non_key_columns() {
        let store = MemoryCatalog::default();
        let first = vec![Rating {
            user_id: 9,
            movie_id: 1,
            rating: 2.0,
            timestamp: 10,
        }];
        let second = vec![Rating {
            user_id: 9,
            movie_id: 1,
            rating: 4.5,
            timestamp: 20,
        }];
        load_facts(&store, &mut first.into_iter(), 100).await.unwrap();
        load_facts(&store, &mut second.into_iter(), 100).await.unwrap();

        let stored = store.rating(9, 1).unwrap();
        assert_eq!(stored.rating, 4.5);
        assert_eq!(stored.timestamp, 20);
        assert_eq!(store.row_count(Table::Ratings).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn staged_load_writes_entities_before_associations() {
        let store = MemoryCatalog::default();
        let mut extraction = Extraction::default();
        extraction.movies = vec![movie(1, "Toy Story"), movie(2, "Jumanji")];
        extraction.awards = vec![
            Award { movie_id: 1, wins: 1, nominations: 3 },
            Award { movie_id: 2, wins: 0, nominations: 0 },
        ];
        for (movie_id, genre) in [(1, "Animation"), (1, "Comedy"), (2, "Adventure")] {
            extraction.entities.insert(EntityKind::Genre, genre);
            extraction.associations.push(assoc(movie_id, EntityKind::Genre, genre));
        }
        for language in ["English", "French"] {
            extraction.entities.insert(EntityKind::Language, language);
        }
        extraction.primary_languages = BTreeMap::from([(1, "English".to_string()), (2, "French".to_string())]);

        let stats = StagedLoader::new(&store, 2).load(extraction).await.unwrap();

        assert_eq!(stats.movies, 2);
        assert_eq!(stats.entities.get(&EntityKind::Genre), Some(&3));
        assert_eq!(stats.associations.get(&EntityKind::Genre), Some(&3));
        assert_eq!(stats.primary_languages, 2);
        assert_eq!(stats.unresolved_names, 0);
        assert_eq!(store.row_count(Table::MovieGenres).await.unwrap(), 3);
        assert_eq!(store.primary_language_name(2).as_deref(), Some("French"));
        assert!(store.dangling_associations().is_empty());
    }
}
