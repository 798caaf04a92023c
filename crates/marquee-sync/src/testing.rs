//! In-memory stores with the same write semantics as the Postgres ones.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use marquee_core::{
    AffinityRow, AffinityVariant, Award, EntityId, EntityKind, Link, Movie, MovieId, Rating,
    Table, Tag, UserId,
};
use marquee_storage::{AffinityStore, CatalogStore, StoreError};

#[derive(Debug, Default)]
struct CatalogState {
    movies: BTreeMap<MovieId, Movie>,
    avg_rating: BTreeMap<MovieId, f32>,
    primary_language: BTreeMap<MovieId, EntityId>,
    awards: BTreeMap<MovieId, Award>,
    ratings: BTreeMap<(UserId, MovieId), Rating>,
    tags: BTreeMap<(UserId, MovieId, String), Tag>,
    links: BTreeMap<MovieId, Link>,
    entities: HashMap<EntityKind, BTreeMap<String, EntityId>>,
    next_entity_id: EntityId,
    associations: HashMap<EntityKind, BTreeSet<(MovieId, EntityId)>>,
    batches: HashMap<&'static str, Vec<usize>>,
    fail_on: Option<(&'static str, usize)>,
}

impl CatalogState {
    fn record_batch(&mut self, label: &'static str, len: usize) -> Result<(), StoreError> {
        let seen = self.batches.entry(label).or_default();
        if self.fail_on == Some((label, seen.len() + 1)) {
            return Err(StoreError::Message(format!("injected failure on {label} batch")));
        }
        seen.push(len);
        Ok(())
    }

    fn entity_exists(&self, kind: EntityKind, id: EntityId) -> bool {
        self.entities
            .get(&kind)
            .is_some_and(|names| names.values().any(|v| *v == id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    fn state(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the `nth` (1-based) batch written to `label` fail.
    pub fn fail_on_batch(&self, label: &'static str, nth: usize) {
        self.state().fail_on = Some((label, nth));
    }

    pub fn batch_sizes(&self, label: &str) -> Vec<usize> {
        self.state().batches.get(label).cloned().unwrap_or_default()
    }

    pub fn movie(&self, movie_id: MovieId) -> Option<Movie> {
        self.state().movies.get(&movie_id).cloned()
    }

    pub fn avg_rating(&self, movie_id: MovieId) -> Option<f32> {
        self.state().avg_rating.get(&movie_id).copied()
    }

    pub fn rating(&self, user_id: UserId, movie_id: MovieId) -> Option<Rating> {
        self.state().ratings.get(&(user_id, movie_id)).cloned()
    }

    pub fn entity_names(&self, kind: EntityKind) -> Vec<String> {
        self.state()
            .entities
            .get(&kind)
            .map(|names| names.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Entity names linked to `movie_id`, sorted.
    pub fn linked_names(&self, kind: EntityKind, movie_id: MovieId) -> Vec<String> {
        let state = self.state();
        let Some(names) = state.entities.get(&kind) else {
            return Vec::new();
        };
        let ids: BTreeSet<EntityId> = state
            .associations
            .get(&kind)
            .map(|pairs| {
                pairs
                    .iter()
                    .filter(|(m, _)| *m == movie_id)
                    .map(|(_, id)| *id)
                    .collect()
            })
            .unwrap_or_default();
        let mut out: Vec<String> = names
            .iter()
            .filter(|(_, id)| ids.contains(id))
            .map(|(name, _)| name.clone())
            .collect();
        out.sort();
        out
    }

    pub fn primary_language_name(&self, movie_id: MovieId) -> Option<String> {
        let state = self.state();
        let id = *state.primary_language.get(&movie_id)?;
        state
            .entities
            .get(&EntityKind::Language)?
            .iter()
            .find(|(_, v)| **v == id)
            .map(|(name, _)| name.clone())
    }

    /// Association rows whose movie or entity does not exist.
    pub fn dangling_associations(&self) -> Vec<(EntityKind, MovieId, EntityId)> {
        let state = self.state();
        let mut out = Vec::new();
        for (kind, pairs) in &state.associations {
            for (movie_id, entity_id) in pairs {
                if !state.movies.contains_key(movie_id) || !state.entity_exists(*kind, *entity_id) {
                    out.push((*kind, *movie_id, *entity_id));
                }
            }
        }
        out
    }

    /// Affinity store seeded with the current ratings and genre links.
    pub fn affinity_store(&self) -> MemoryAffinity {
        let state = self.state();
        let genre_names: HashMap<EntityId, String> = state
            .entities
            .get(&EntityKind::Genre)
            .map(|names| names.iter().map(|(name, id)| (*id, name.clone())).collect())
            .unwrap_or_default();
        let mut genres: HashMap<MovieId, Vec<String>> = HashMap::new();
        if let Some(pairs) = state.associations.get(&EntityKind::Genre) {
            for (movie_id, genre_id) in pairs {
                if let Some(name) = genre_names.get(genre_id) {
                    genres.entry(*movie_id).or_default().push(name.clone());
                }
            }
        }
        let ratings = state.ratings.values().cloned().collect();
        let titles = state
            .movies
            .values()
            .map(|m| (m.movie_id, m.title.clone()))
            .collect();
        MemoryAffinity::new(ratings, genres, titles)
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn row_count(&self, table: Table) -> Result<i64, StoreError> {
        let state = self.state();
        let entity_len = |kind: EntityKind| state.entities.get(&kind).map_or(0, BTreeMap::len);
        let assoc_len = |kind: EntityKind| state.associations.get(&kind).map_or(0, BTreeSet::len);
        let count = match table {
            Table::Movies => state.movies.len(),
            Table::Genres => entity_len(EntityKind::Genre),
            Table::Directors => entity_len(EntityKind::Director),
            Table::Actors => entity_len(EntityKind::Actor),
            Table::Languages => entity_len(EntityKind::Language),
            Table::MovieGenres => assoc_len(EntityKind::Genre),
            Table::MovieDirectors => assoc_len(EntityKind::Director),
            Table::MovieActors => assoc_len(EntityKind::Actor),
            Table::Awards => state.awards.len(),
            Table::Ratings => state.ratings.len(),
            Table::Tags => state.tags.len(),
            Table::Links => state.links.len(),
            Table::LowRated | Table::LowRatedSummary | Table::HighRated | Table::HighRatedSummary => 0,
        };
        Ok(count as i64)
    }

    async fn upsert_movies(&self, rows: &[Movie]) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.record_batch("movies", rows.len())?;
        for row in rows {
            state.movies.insert(row.movie_id, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_awards(&self, rows: &[Award]) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.record_batch("awards", rows.len())?;
        if let Some(orphan) = rows.iter().find(|a| !state.movies.contains_key(&a.movie_id)) {
            return Err(StoreError::Message(format!("award for unknown movie {}", orphan.movie_id)));
        }
        for row in rows {
            state.awards.insert(row.movie_id, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_ratings(&self, rows: &[Rating]) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.record_batch("ratings", rows.len())?;
        for row in rows {
            state.ratings.insert((row.user_id, row.movie_id), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_tags(&self, rows: &[Tag]) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.record_batch("tags", rows.len())?;
        for row in rows {
            state
                .tags
                .insert((row.user_id, row.movie_id, row.tag.clone()), row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn upsert_links(&self, rows: &[Link]) -> Result<u64, StoreError> {
        let mut state = self.state();
        state.record_batch("links", rows.len())?;
        for row in rows {
            state.links.insert(row.movie_id, row.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn insert_entities(&self, kind: EntityKind, names: &[String]) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut inserted = 0u64;
        for name in names {
            if state.entities.get(&kind).is_some_and(|n| n.contains_key(name)) {
                continue;
            }
            state.next_entity_id += 1;
            let id = state.next_entity_id;
            state.entities.entry(kind).or_default().insert(name.clone(), id);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn entity_ids(&self, kind: EntityKind) -> Result<HashMap<String, EntityId>, StoreError> {
        Ok(self
            .state()
            .entities
            .get(&kind)
            .map(|names| names.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default())
    }

    async fn insert_associations(
        &self,
        kind: EntityKind,
        pairs: &[(MovieId, EntityId)],
    ) -> Result<u64, StoreError> {
        if kind.join_table().is_none() {
            return Err(StoreError::Message(format!("{kind} has no movie join table")));
        }
        let mut state = self.state();
        for (movie_id, entity_id) in pairs {
            if !state.movies.contains_key(movie_id) || !state.entity_exists(kind, *entity_id) {
                return Err(StoreError::Message(format!(
                    "foreign key violation: ({movie_id}, {entity_id}) in {kind} links"
                )));
            }
        }
        let set = state.associations.entry(kind).or_default();
        let inserted = pairs.iter().filter(|pair| set.insert(**pair)).count();
        Ok(inserted as u64)
    }

    async fn set_primary_languages(
        &self,
        updates: &[(MovieId, EntityId)],
    ) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut updated = 0u64;
        for (movie_id, language_id) in updates {
            if state.movies.contains_key(movie_id) {
                state.primary_language.insert(*movie_id, *language_id);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn refresh_average_ratings(&self) -> Result<u64, StoreError> {
        let mut state = self.state();
        let mut sums: BTreeMap<MovieId, (f32, u32)> = BTreeMap::new();
        for rating in state.ratings.values() {
            let entry = sums.entry(rating.movie_id).or_default();
            entry.0 += rating.rating;
            entry.1 += 1;
        }
        let mut updated = 0u64;
        for (movie_id, (sum, n)) in sums {
            if state.movies.contains_key(&movie_id) {
                state.avg_rating.insert(movie_id, sum / n as f32);
                updated += 1;
            }
        }
        Ok(updated)
    }
}

/// One row of an affinity staging table.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedRating {
    pub user_id: UserId,
    pub movie_id: MovieId,
    pub genre: String,
}

#[derive(Debug, Default)]
pub struct AffinityTables {
    pub staged: HashMap<AffinityVariant, Vec<SeedRating>>,
    pub summary: HashMap<AffinityVariant, Vec<AffinityRow>>,
    pub truncations: HashMap<AffinityVariant, usize>,
    /// Summary as it was when the open rebuild began.
    before_rebuild: HashMap<AffinityVariant, Vec<AffinityRow>>,
    windows: HashMap<AffinityVariant, usize>,
    fail_window: Option<(AffinityVariant, usize)>,
}

/// Reference aggregation over plain vectors. Clones share their tables.
#[derive(Debug, Clone)]
pub struct MemoryAffinity {
    ratings: Arc<Vec<Rating>>,
    genres: Arc<HashMap<MovieId, Vec<String>>>,
    titles: Arc<HashMap<MovieId, String>>,
    tables: Arc<Mutex<AffinityTables>>,
    fail_staging: Option<AffinityVariant>,
}

impl MemoryAffinity {
    pub fn new(
        ratings: Vec<Rating>,
        genres: HashMap<MovieId, Vec<String>>,
        titles: HashMap<MovieId, String>,
    ) -> Self {
        Self {
            ratings: Arc::new(ratings),
            genres: Arc::new(genres),
            titles: Arc::new(titles),
            tables: Arc::default(),
            fail_staging: None,
        }
    }

    pub fn failing_staging_for(mut self, variant: AffinityVariant) -> Self {
        self.fail_staging = Some(variant);
        self
    }

    /// Fail the `nth` window (1-based) of the next rebuild of `variant`, once.
    pub fn fail_window(&self, variant: AffinityVariant, nth: usize) {
        let mut tables = self.tables();
        tables.windows.insert(variant, 0);
        tables.fail_window = Some((variant, nth));
    }

    pub fn tables(&self) -> MutexGuard<'_, AffinityTables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn summary(&self, variant: AffinityVariant) -> Vec<AffinityRow> {
        self.tables().summary.get(&variant).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl AffinityStore for MemoryAffinity {
    async fn summary_rows(&mut self, variant: AffinityVariant) -> Result<i64, StoreError> {
        Ok(self.tables().summary.get(&variant).map_or(0, Vec::len) as i64)
    }

    async fn stage_seeds(&mut self, variant: AffinityVariant) -> Result<u64, StoreError> {
        if self.fail_staging == Some(variant) {
            return Err(StoreError::Message(format!("injected staging failure for {variant}")));
        }
        let mut seeds = Vec::new();
        for rating in self.ratings.iter().filter(|r| variant.is_seed(r.rating)) {
            if !self.titles.contains_key(&rating.movie_id) {
                continue;
            }
            for genre in self.genres.get(&rating.movie_id).into_iter().flatten() {
                seeds.push(SeedRating {
                    user_id: rating.user_id,
                    movie_id: rating.movie_id,
                    genre: genre.clone(),
                });
            }
        }
        let staged = seeds.len() as u64;
        self.tables().staged.insert(variant, seeds);
        Ok(staged)
    }

    async fn begin_rebuild(&mut self, variant: AffinityVariant) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let current = tables.summary.get(&variant).cloned().unwrap_or_default();
        tables.before_rebuild.insert(variant, current);
        Ok(())
    }

    async fn commit_rebuild(&mut self, variant: AffinityVariant) -> Result<(), StoreError> {
        self.tables().before_rebuild.remove(&variant);
        Ok(())
    }

    async fn rollback_rebuild(&mut self, variant: AffinityVariant) -> Result<(), StoreError> {
        let mut tables = self.tables();
        if let Some(previous) = tables.before_rebuild.remove(&variant) {
            tables.summary.insert(variant, previous);
        }
        Ok(())
    }

    async fn truncate_summary(&mut self, variant: AffinityVariant) -> Result<(), StoreError> {
        let mut tables = self.tables();
        tables.summary.insert(variant, Vec::new());
        *tables.truncations.entry(variant).or_default() += 1;
        Ok(())
    }

    async fn staged_users(&mut self, variant: AffinityVariant) -> Result<Vec<UserId>, StoreError> {
        let users: BTreeSet<UserId> = self
            .tables()
            .staged
            .get(&variant)
            .map(|seeds| seeds.iter().map(|s| s.user_id).collect())
            .unwrap_or_default();
        Ok(users.into_iter().collect())
    }

    async fn aggregate_users(
        &mut self,
        variant: AffinityVariant,
        users: &[UserId],
        min_support: i64,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let window = {
            let calls = tables.windows.entry(variant).or_default();
            *calls += 1;
            *calls
        };
        if tables.fail_window == Some((variant, window)) {
            tables.fail_window = None;
            return Err(StoreError::Message(format!("injected failure on window {window}")));
        }
        let seeds = tables.staged.get(&variant).cloned().unwrap_or_default();

        let mut seed_movies: BTreeMap<(UserId, String), BTreeSet<MovieId>> = BTreeMap::new();
        for seed in seeds.iter().filter(|s| users.contains(&s.user_id)) {
            seed_movies
                .entry((seed.user_id, seed.genre.clone()))
                .or_default()
                .insert(seed.movie_id);
        }

        let mut rows = Vec::new();
        for ((user_id, genre), excluded) in &seed_movies {
            let mut groups: BTreeMap<String, Vec<f32>> = BTreeMap::new();
            for rating in self
                .ratings
                .iter()
                .filter(|r| r.user_id == *user_id && !excluded.contains(&r.movie_id))
            {
                for other in self.genres.get(&rating.movie_id).into_iter().flatten() {
                    if other != genre {
                        groups.entry(other.clone()).or_default().push(rating.rating);
                    }
                }
            }
            for (other_genre, values) in groups {
                let count = values.len() as i64;
                if count > min_support {
                    let sum: f64 = values.iter().map(|v| f64::from(*v)).sum();
                    rows.push(AffinityRow {
                        user_id: *user_id,
                        reference_genre: genre.clone(),
                        other_genre,
                        avg_other_rating: sum / count as f64,
                        rating_count: count,
                    });
                }
            }
        }
        let inserted = rows.len() as u64;
        tables.summary.entry(variant).or_default().extend(rows);
        Ok(inserted)
    }
}
