//! CSV source readers for the ratings dataset plus entity extraction.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use marquee_core::{Award, Link, Movie, Rating, Tag};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub mod extract;
pub mod normalize;

pub use extract::{extract, EntityExtractor, EntitySet, Extraction};

use normalize::{
    optional_text, parse_count, parse_id, parse_percentage, parse_release_date, parse_runtime,
    parse_timestamp, split_list,
};

pub const CRATE_NAME: &str = "marquee-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("opening {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading header of {file}: {source}")]
    Header {
        file: &'static str,
        #[source]
        source: csv::Error,
    },
}

/// Delimiters used inside multi-valued movie fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDelimiters {
    #[serde(default = "default_genre_delimiter")]
    pub genres: char,
    #[serde(default = "default_people_delimiter")]
    pub people: char,
    #[serde(default = "default_people_delimiter")]
    pub languages: char,
}

fn default_genre_delimiter() -> char {
    '|'
}

fn default_people_delimiter() -> char {
    ','
}

impl Default for ListDelimiters {
    fn default() -> Self {
        Self {
            genres: default_genre_delimiter(),
            people: default_people_delimiter(),
            languages: default_people_delimiter(),
        }
    }
}

/// One movies.csv row exactly as written. Every field is text so a bad value
/// never fails deserialization of the whole row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMovieRecord {
    #[serde(rename = "movieId")]
    pub movie_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub genres: String,
    #[serde(default)]
    pub release_date: String,
    #[serde(default)]
    pub poster_url: String,
    #[serde(default)]
    pub tomatometer: String,
    #[serde(default)]
    pub audience_score: String,
    #[serde(default)]
    pub directors: String,
    #[serde(default)]
    pub actors: String,
    #[serde(default)]
    pub award_wins: String,
    #[serde(default)]
    pub award_nominations: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub languages: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRatingRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "movieId")]
    pub movie_id: String,
    #[serde(default)]
    pub rating: String,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTagRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "movieId")]
    pub movie_id: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawLinkRecord {
    #[serde(rename = "movieId")]
    pub movie_id: String,
    #[serde(rename = "imdbId", default)]
    pub imdb_id: String,
    #[serde(rename = "tmdbId", default)]
    pub tmdb_id: String,
}

/// Normalized movie row with its multi-valued fields split, in listed order.
#[derive(Debug, Clone, PartialEq)]
pub struct MovieRecord {
    pub movie: Movie,
    pub award: Award,
    pub genres: Vec<String>,
    pub directors: Vec<String>,
    pub actors: Vec<String>,
    pub languages: Vec<String>,
}

pub fn normalize_movie(raw: RawMovieRecord, delimiters: ListDelimiters) -> Result<MovieRecord, String> {
    let movie_id =
        parse_id(&raw.movie_id).ok_or_else(|| format!("invalid movieId {:?}", raw.movie_id))?;
    Ok(MovieRecord {
        movie: Movie {
            movie_id,
            title: raw.title.trim().to_string(),
            release_date: parse_release_date(&raw.release_date),
            poster_url: optional_text(&raw.poster_url),
            tomatometer: parse_percentage(&raw.tomatometer),
            audience_score: parse_percentage(&raw.audience_score),
            runtime_minutes: parse_runtime(&raw.runtime),
        },
        award: Award {
            movie_id,
            wins: parse_count(&raw.award_wins),
            nominations: parse_count(&raw.award_nominations),
        },
        genres: split_list(&raw.genres, delimiters.genres),
        directors: split_list(&raw.directors, delimiters.people),
        actors: split_list(&raw.actors, delimiters.people),
        languages: split_list(&raw.languages, delimiters.languages),
    })
}

pub fn normalize_rating(raw: RawRatingRecord) -> Result<Rating, String> {
    let user_id = parse_id(&raw.user_id).ok_or_else(|| format!("invalid userId {:?}", raw.user_id))?;
    let movie_id =
        parse_id(&raw.movie_id).ok_or_else(|| format!("invalid movieId {:?}", raw.movie_id))?;
    let rating = raw
        .rating
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("invalid rating {:?}", raw.rating))?;
    Ok(Rating {
        user_id,
        movie_id,
        rating,
        timestamp: parse_timestamp(&raw.timestamp),
    })
}

pub fn normalize_tag(raw: RawTagRecord) -> Result<Tag, String> {
    let user_id = parse_id(&raw.user_id).ok_or_else(|| format!("invalid userId {:?}", raw.user_id))?;
    let movie_id =
        parse_id(&raw.movie_id).ok_or_else(|| format!("invalid movieId {:?}", raw.movie_id))?;
    let tag = raw.tag.trim();
    if tag.is_empty() {
        return Err("empty tag".to_string());
    }
    Ok(Tag {
        user_id,
        movie_id,
        tag: tag.to_string(),
        timestamp: parse_timestamp(&raw.timestamp),
    })
}

pub fn normalize_link(raw: RawLinkRecord) -> Result<Link, String> {
    let movie_id =
        parse_id(&raw.movie_id).ok_or_else(|| format!("invalid movieId {:?}", raw.movie_id))?;
    let imdb_id = optional_text(&raw.imdb_id).ok_or_else(|| "missing imdbId".to_string())?;
    Ok(Link {
        movie_id,
        imdb_id,
        tmdb_id: optional_text(&raw.tmdb_id),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub records: usize,
    pub skipped: usize,
}

/// Lazily deserializes and normalizes CSV records, skipping rows that cannot be keyed.
pub struct RecordStream<R, Raw, F> {
    file: &'static str,
    inner: csv::DeserializeRecordsIntoIter<R, Raw>,
    normalize: F,
    stats: ParseStats,
}

impl<R, Raw, F> RecordStream<R, Raw, F> {
    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    pub fn file(&self) -> &'static str {
        self.file
    }
}

impl<R, Raw, T, F> Iterator for RecordStream<R, Raw, F>
where
    R: Read,
    Raw: DeserializeOwned,
    F: FnMut(Raw) -> Result<T, String>,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let next = self.inner.next()?;
            self.stats.records += 1;
            let record_no = self.stats.records;
            match next {
                Ok(raw) => match (self.normalize)(raw) {
                    Ok(value) => return Some(value),
                    Err(reason) => {
                        self.stats.skipped += 1;
                        warn!(file = self.file, record = record_no, %reason, "skipping row");
                    }
                },
                Err(err) => {
                    self.stats.skipped += 1;
                    warn!(file = self.file, record = record_no, error = %err, "skipping unreadable row");
                }
            }
        }
    }
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader)
}

fn stream<R, Raw, T, F>(
    file: &'static str,
    reader: R,
    normalize: F,
) -> Result<RecordStream<R, Raw, F>, SourceError>
where
    R: Read,
    Raw: DeserializeOwned,
    F: FnMut(Raw) -> Result<T, String>,
{
    let mut rdr = csv_reader(reader);
    rdr.headers()
        .map_err(|source| SourceError::Header { file, source })?;
    Ok(RecordStream {
        file,
        inner: rdr.into_deserialize(),
        normalize,
        stats: ParseStats::default(),
    })
}

pub fn movie_records<R: Read>(
    reader: R,
    delimiters: ListDelimiters,
) -> Result<RecordStream<R, RawMovieRecord, impl FnMut(RawMovieRecord) -> Result<MovieRecord, String>>, SourceError>
{
    stream("movies.csv", reader, move |raw: RawMovieRecord| {
        normalize_movie(raw, delimiters)
    })
}

pub fn rating_records<R: Read>(
    reader: R,
) -> Result<RecordStream<R, RawRatingRecord, fn(RawRatingRecord) -> Result<Rating, String>>, SourceError>
{
    stream("ratings.csv", reader, normalize_rating as fn(_) -> _)
}

pub fn tag_records<R: Read>(
    reader: R,
) -> Result<RecordStream<R, RawTagRecord, fn(RawTagRecord) -> Result<Tag, String>>, SourceError> {
    stream("tags.csv", reader, normalize_tag as fn(_) -> _)
}

pub fn link_records<R: Read>(
    reader: R,
) -> Result<RecordStream<R, RawLinkRecord, fn(RawLinkRecord) -> Result<Link, String>>, SourceError>
{
    stream("links.csv", reader, normalize_link as fn(_) -> _)
}

pub fn open_source(path: impl AsRef<Path>) -> Result<File, SourceError> {
    let path = path.as_ref();
    File::open(path).map_err(|source| SourceError::Open {
        path: path.to_path_buf(),
        source,
    })
}
