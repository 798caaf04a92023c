//! Entity deduplication across a stream of movie records.

use std::collections::{BTreeMap, BTreeSet};

use marquee_core::{Association, Award, EntityKind, Movie, MovieId};

use crate::MovieRecord;

/// Distinct reference-entity names per kind, across the whole input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntitySet {
    by_kind: BTreeMap<EntityKind, BTreeSet<String>>,
}

impl EntitySet {
    pub fn insert(&mut self, kind: EntityKind, name: &str) -> bool {
        let names = self.by_kind.entry(kind).or_default();
        if names.contains(name) {
            return false;
        }
        names.insert(name.to_string())
    }

    pub fn contains(&self, kind: EntityKind, name: &str) -> bool {
        self.by_kind
            .get(&kind)
            .is_some_and(|names| names.contains(name))
    }

    pub fn names(&self, kind: EntityKind) -> Vec<String> {
        self.by_kind
            .get(&kind)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.by_kind.get(&kind).map_or(0, BTreeSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(BTreeSet::is_empty)
    }
}

/// Everything the staged loader needs from one pass over the movies file.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub movies: Vec<Movie>,
    pub awards: Vec<Award>,
    pub entities: EntitySet,
    /// One entry per (movie, token) occurrence; duplicates are collapsed by the store.
    pub associations: Vec<Association>,
    /// First listed language per movie.
    pub primary_languages: BTreeMap<MovieId, String>,
}

#[derive(Debug, Default)]
pub struct EntityExtractor {
    out: Extraction,
}

impl EntityExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: MovieRecord) {
        let movie_id = record.movie.movie_id;

        let lists = [
            (EntityKind::Genre, &record.genres),
            (EntityKind::Director, &record.directors),
            (EntityKind::Actor, &record.actors),
        ];
        for (kind, names) in lists {
            for name in names {
                self.out.entities.insert(kind, name);
                self.out.associations.push(Association {
                    movie_id,
                    kind,
                    name: name.clone(),
                });
            }
        }

        for language in &record.languages {
            self.out.entities.insert(EntityKind::Language, language);
        }
        // A repeated movie row replaces the earlier one, same as the movie upsert.
        match record.languages.first() {
            Some(first) => {
                self.out.primary_languages.insert(movie_id, first.clone());
            }
            None => {
                self.out.primary_languages.remove(&movie_id);
            }
        }

        self.out.movies.push(record.movie);
        self.out.awards.push(record.award);
    }

    pub fn finish(self) -> Extraction {
        self.out
    }
}

pub fn extract(records: impl IntoIterator<Item = MovieRecord>) -> Extraction {
    let mut extractor = EntityExtractor::new();
    for record in records {
        extractor.push(record);
    }
    extractor.finish()
}
