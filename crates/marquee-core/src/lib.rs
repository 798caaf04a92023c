//! Core domain model for the Marquee movie catalog.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "marquee-core";

pub type MovieId = i32;
pub type UserId = i32;
/// Store-assigned identifier of a genre/director/actor/language row.
pub type EntityId = i32;

/// Catalog row for one movie, as produced by the import adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub movie_id: MovieId,
    pub title: String,
    pub release_date: Option<NaiveDate>,
    pub poster_url: Option<String>,
    pub tomatometer: Option<f32>,
    pub audience_score: Option<f32>,
    pub runtime_minutes: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub movie_id: MovieId,
    pub wins: i32,
    pub nominations: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub user_id: UserId,
    pub movie_id: MovieId,
    pub rating: f32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub user_id: UserId,
    pub movie_id: MovieId,
    pub tag: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub movie_id: MovieId,
    pub imdb_id: String,
    pub tmdb_id: Option<String>,
}

/// Name-keyed reference entities that are deduplicated globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Genre,
    Director,
    Actor,
    Language,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Genre,
        EntityKind::Director,
        EntityKind::Actor,
        EntityKind::Language,
    ];

    /// Kinds that own a movie join table. Languages only feed the primary language column.
    pub const ASSOCIATED: [EntityKind; 3] =
        [EntityKind::Genre, EntityKind::Director, EntityKind::Actor];

    pub fn table(self) -> Table {
        match self {
            EntityKind::Genre => Table::Genres,
            EntityKind::Director => Table::Directors,
            EntityKind::Actor => Table::Actors,
            EntityKind::Language => Table::Languages,
        }
    }

    pub fn id_column(self) -> &'static str {
        match self {
            EntityKind::Genre => "genre_id",
            EntityKind::Director => "director_id",
            EntityKind::Actor => "actor_id",
            EntityKind::Language => "language_id",
        }
    }

    pub fn join_table(self) -> Option<Table> {
        match self {
            EntityKind::Genre => Some(Table::MovieGenres),
            EntityKind::Director => Some(Table::MovieDirectors),
            EntityKind::Actor => Some(Table::MovieActors),
            EntityKind::Language => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Genre => "genre",
            EntityKind::Director => "director",
            EntityKind::Actor => "actor",
            EntityKind::Language => "language",
        };
        f.write_str(name)
    }
}

/// One occurrence of `name` attached to `movie_id`, before ids are known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Association {
    pub movie_id: MovieId,
    pub kind: EntityKind,
    pub name: String,
}

/// Every table the importer owns. Table names never come from user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Movies,
    Genres,
    Directors,
    Actors,
    Languages,
    MovieGenres,
    MovieDirectors,
    MovieActors,
    Awards,
    Ratings,
    Tags,
    Links,
    LowRated,
    LowRatedSummary,
    HighRated,
    HighRatedSummary,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Movies => "movies",
            Table::Genres => "genres",
            Table::Directors => "directors",
            Table::Actors => "actors",
            Table::Languages => "languages",
            Table::MovieGenres => "movie_genres",
            Table::MovieDirectors => "movie_directors",
            Table::MovieActors => "movie_actors",
            Table::Awards => "awards",
            Table::Ratings => "ratings",
            Table::Tags => "tags",
            Table::Links => "links",
            Table::LowRated => "low_rated",
            Table::LowRatedSummary => "low_rated_summary",
            Table::HighRated => "high_rated",
            Table::HighRatedSummary => "high_rated_summary",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two genre-affinity summaries. Structurally identical, inverted seed predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityVariant {
    Low,
    High,
}

impl AffinityVariant {
    pub const ALL: [AffinityVariant; 2] = [AffinityVariant::Low, AffinityVariant::High];

    pub const LOW_THRESHOLD: f32 = 3.0;
    pub const HIGH_THRESHOLD: f32 = 4.0;

    /// Summary rows need strictly more than this many supporting ratings.
    pub const MIN_SUPPORT: i64 = 5;

    /// Whether a rating seeds this variant: strictly below 3.0 or strictly above 4.0.
    pub fn is_seed(self, rating: f32) -> bool {
        match self {
            AffinityVariant::Low => rating < Self::LOW_THRESHOLD,
            AffinityVariant::High => rating > Self::HIGH_THRESHOLD,
        }
    }

    pub fn staging_table(self) -> Table {
        match self {
            AffinityVariant::Low => Table::LowRated,
            AffinityVariant::High => Table::HighRated,
        }
    }

    pub fn summary_table(self) -> Table {
        match self {
            AffinityVariant::Low => Table::LowRatedSummary,
            AffinityVariant::High => Table::HighRatedSummary,
        }
    }

    /// Column holding the reference genre in the summary table.
    pub fn genre_column(self) -> &'static str {
        match self {
            AffinityVariant::Low => "low_rated_genre",
            AffinityVariant::High => "high_rated_genre",
        }
    }
}

impl fmt::Display for AffinityVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AffinityVariant::Low => f.write_str("low"),
            AffinityVariant::High => f.write_str("high"),
        }
    }
}

/// "Given `user_id` rated `reference_genre` low/high, this is how they rate `other_genre`."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityRow {
    pub user_id: UserId,
    pub reference_genre: String,
    pub other_genre: String,
    pub avg_other_rating: f64,
    pub rating_count: i64,
}
