//! Result model: pages of excerpts and the annotated segments inside them.
//!
//! These types are filled by [`Client`](crate::Client) while decoding server
//! replies. Lazily fetched parts of an [`Excerpt`] (long context, metadata)
//! need the client again, so those accessors take it as an argument.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tokio::sync::OnceCell;

use crate::client::Client;
use crate::error::Result;

/// One candidate morphological reading of a segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Lemmata {
    /// Dictionary form, present when lemmata were retrieved for the group.
    pub base_form: Option<String>,
    /// Grammatical tag, present when tags were retrieved for the group.
    pub tag: Option<String>,
}

/// A single token of the corpus with its (possibly ambiguous) readings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub literal: String,
    pub lemmata: Vec<Lemmata>,
}

impl Segment {
    pub fn new(literal: impl Into<String>) -> Self {
        Self {
            literal: literal.into(),
            lemmata: Vec::new(),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.literal)
    }
}

/// Long context of an excerpt, as returned by `GET-CONTEXT`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LongContext {
    pub left_context: String,
    pub left_match: String,
    pub right_match: String,
    pub right_context: String,
}

impl fmt::Display for LongContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = [
            &self.left_context,
            &self.left_match,
            &self.right_match,
            &self.right_context,
        ];
        let joined: Vec<&str> = parts
            .iter()
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect();
        f.write_str(&joined.join(" "))
    }
}

/// Document metadata: field name to its values, in server order.
pub type Metadata = BTreeMap<String, Vec<String>>;

/// One match of a query together with its short context.
#[derive(Debug, Clone, Serialize)]
pub struct Excerpt {
    /// Absolute position in the job's result buffer.
    pub index: u64,
    /// Query that produced this excerpt.
    pub query: String,
    pub left_context: Vec<Segment>,
    pub matched: Vec<Segment>,
    pub right_context: Vec<Segment>,
    #[serde(skip)]
    long_context: OnceCell<LongContext>,
    #[serde(skip)]
    metadata: OnceCell<Metadata>,
}

impl Excerpt {
    pub fn new(index: u64, query: impl Into<String>) -> Self {
        Self {
            index,
            query: query.into(),
            left_context: Vec::new(),
            matched: Vec::new(),
            right_context: Vec::new(),
            long_context: OnceCell::new(),
            metadata: OnceCell::new(),
        }
    }

    /// The matched segments as text.
    pub fn matched_text(&self) -> String {
        join_segments(&self.matched)
    }

    /// All segments of all three groups, in order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.left_context
            .iter()
            .chain(&self.matched)
            .chain(&self.right_context)
    }

    /// Long context, fetched on first call and cached afterwards.
    pub async fn context(&self, client: &mut Client) -> Result<&LongContext> {
        self.long_context
            .get_or_try_init(|| client.context(&self.query, self.index))
            .await
    }

    /// Document metadata, fetched on first call and cached afterwards.
    pub async fn metadata(&self, client: &mut Client) -> Result<&Metadata> {
        self.metadata
            .get_or_try_init(|| client.metadata(&self.query, self.index))
            .await
    }
}

impl fmt::Display for Excerpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words: Vec<&str> = self.segments().map(|s| s.literal.as_str()).collect();
        f.write_str(&words.join(" "))
    }
}

fn join_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| s.literal.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// One page of query results.
///
/// Two pages are equal when page number, page count, page size and query
/// match; the excerpts themselves are not compared.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// Page number, starting at 1.
    pub page: u64,
    pub page_count: u64,
    /// Excerpts per page; 0 means everything on one page.
    pub page_size: u64,
    pub query: String,
    /// Whether `page_count` was computed from the final result count.
    pub complete: bool,
    pub excerpts: Vec<Excerpt>,
}

impl QueryResult {
    pub fn new(page: u64, page_count: u64, page_size: u64, query: impl Into<String>) -> Self {
        Self {
            page,
            page_count,
            page_size,
            query: query.into(),
            complete: true,
            excerpts: Vec::new(),
        }
    }

    pub fn push(&mut self, excerpt: Excerpt) {
        self.excerpts.push(excerpt);
    }

    pub fn len(&self) -> usize {
        self.excerpts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.excerpts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Excerpt> {
        self.excerpts.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Excerpt> {
        self.excerpts.iter()
    }

    pub fn has_previous_page(&self) -> bool {
        self.page > 1
    }

    pub fn has_next_page(&self) -> bool {
        self.page < self.page_count
    }

    /// Fetch the previous page from the server; `None` on the first page.
    pub async fn previous_page(&self, client: &mut Client) -> Result<Option<QueryResult>> {
        if !self.has_previous_page() {
            return Ok(None);
        }
        let options = FindOptions::page(self.page_size, self.page - 1);
        client.find(&self.query, &options).await.map(Some)
    }

    /// Fetch the next page from the server; `None` on the last page.
    pub async fn next_page(&self, client: &mut Client) -> Result<Option<QueryResult>> {
        if !self.has_next_page() {
            return Ok(None);
        }
        let options = FindOptions::page(self.page_size, self.page + 1);
        client.find(&self.query, &options).await.map(Some)
    }
}

impl PartialEq for QueryResult {
    fn eq(&self, other: &Self) -> bool {
        self.page == other.page
            && self.page_count == other.page_count
            && self.page_size == other.page_size
            && self.query == other.query
    }
}

impl Eq for QueryResult {}

impl<'a> IntoIterator for &'a QueryResult {
    type Item = &'a Excerpt;
    type IntoIter = std::slice::Iter<'a, Excerpt>;

    fn into_iter(self) -> Self::IntoIter {
        self.excerpts.iter()
    }
}

impl std::ops::Index<usize> for QueryResult {
    type Output = Excerpt;

    fn index(&self, index: usize) -> &Excerpt {
        &self.excerpts[index]
    }
}

/// Paging options for [`Client::find`](crate::Client::find).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOptions {
    /// Excerpts per page; 0 returns every result on a single page.
    pub page_size: u64,
    /// Page to return, starting at 1.
    pub page_index: u64,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            page_size: 0,
            page_index: 1,
        }
    }
}

impl FindOptions {
    pub fn page(page_size: u64, page_index: u64) -> Self {
        Self {
            page_size,
            page_index,
        }
    }
}

/// Corpus statistics from `CORPUS-STATS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorpusStats {
    /// Segments in the corpus, repetitions counted.
    pub segment_tokens: u64,
    /// Distinct segments.
    pub segment_types: u64,
    /// Distinct lemmata.
    pub lemmata: u64,
    /// Distinct tags.
    pub tags: u64,
}

/// Tag-set of the corpus from `GET-TAGSET`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tagset {
    /// Grammatical category to its values, e.g. `gender: m1 m2 m3 f n`.
    pub categories: BTreeMap<String, Vec<String>>,
    /// Part-of-speech class to the categories describing it.
    pub classes: BTreeMap<String, Vec<String>>,
}
