//! Session and query engine for poliqarpd.
//!
//! [`Client`] drives the session state machine
//!
//! ```text
//! Closed ──MAKE-SESSION──► Open ──OPEN <path>──► CorpusBound
//!    ▲                      │  ◄──────CLOSE───────┘
//!    └────CLOSE-SESSION─────┘
//! ```
//!
//! and, once a corpus is bound, the lifecycle of the single query job:
//! `MAKE-QUERY` → `RUN-QUERY` → `BUFFER-STATE` polling and/or milestone →
//! `GET-RESULTS`. Repeating the current query reuses the running job.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClientSettings, Config, ContextWidth, Group, GroupFlags};
use crate::error::{PoliqarpError, Result};
use crate::ipc::{Connector, Exchange, MilestoneHandler};
use crate::job::QueryJob;
use crate::models::{
    CorpusStats, Excerpt, FindOptions, Lemmata, LongContext, Metadata, QueryResult, Segment,
    Tagset,
};

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
    CorpusBound,
}

/// Corpus to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorpusPath {
    /// The bundled corpus from [`ClientSettings::default_corpus`].
    Default,
    Path(PathBuf),
}

impl From<&str> for CorpusPath {
    fn from(path: &str) -> Self {
        if path == ":default" {
            CorpusPath::Default
        } else {
            CorpusPath::Path(PathBuf::from(path))
        }
    }
}

impl From<PathBuf> for CorpusPath {
    fn from(path: PathBuf) -> Self {
        CorpusPath::Path(path)
    }
}

/// Client for a poliqarpd server.
///
/// All operations take `&mut self`: one session runs one command at a time.
///
/// # Example
///
/// ```ignore
/// let mut client = Client::connect(ClientSettings::from_env()).await?;
/// client.open_corpus("/corpora/sample").await?;
/// let page = client.find("kot", &FindOptions::page(10, 1)).await?;
/// for excerpt in &page {
///     println!("{}", excerpt);
/// }
/// client.close().await?;
/// ```
pub struct Client {
    connector: Connector,
    settings: ClientSettings,
    config: Config,
    state: SessionState,
    job: Option<QueryJob>,
    /// Connector runs over a caller-supplied stream and cannot reconnect.
    attached: bool,
}

impl Client {
    /// Connect over TCP and open a session.
    pub async fn connect(settings: ClientSettings) -> Result<Self> {
        let mut client = Self::unopened(settings, false);
        client.new_session().await?;
        Ok(client)
    }

    /// Open a session over an existing stream.
    pub async fn attach<S>(stream: S, settings: ClientSettings) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut client = Self::unopened(settings, true);
        client.connector.attach(stream).await;
        client.new_session().await?;
        Ok(client)
    }

    fn unopened(settings: ClientSettings, attached: bool) -> Self {
        Self {
            connector: Connector::new(),
            settings,
            config: Config::default(),
            state: SessionState::Closed,
            job: None,
            attached,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Query of the cached job, if any.
    pub fn current_query(&self) -> Option<&str> {
        self.job.as_ref().map(|job| job.query.as_str())
    }

    // =========================================================================
    // Session lifecycle
    // =========================================================================

    /// Open a fresh session, closing the current one first.
    ///
    /// The configuration is reset to defaults and pushed to the server.
    pub async fn new_session(&mut self) -> Result<()> {
        if self.state != SessionState::Closed {
            if let Err(e) = self.close().await {
                warn!("Failed to close previous session: {}", e);
            }
        }

        if !self.connector.is_alive() {
            if self.attached {
                return Err(PoliqarpError::ConnectionClosed);
            }
            self.connector = Connector::new();
            self.connector
                .open(&self.settings.host, self.settings.port)
                .await?;
        }

        let name = self.settings.session_name.clone();
        self.connector
            .send_sync(&format!("MAKE-SESSION {}", name))
            .await?;
        self.state = SessionState::Open;
        info!("Opened poliqarpd session {}", name);

        self.config = Config::default();
        let config = self.config.clone();
        self.expect_ok(&format!("BUFFER-RESIZE {}", config.buffer_capacity))
            .await?;
        self.set_option("left-context-width", &config.left_context_width.to_string())
            .await?;
        self.set_option(
            "right-context-width",
            &config.right_context_width.to_string(),
        )
        .await?;
        self.set_option("retrieve-tags", &config.tags.to_string())
            .await?;
        self.set_option("retrieve-lemmata", &config.lemmata.to_string())
            .await?;
        Ok(())
    }

    /// Close the session. `CLOSE-SESSION` is sent even if closing the corpus
    /// fails.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.state == SessionState::CorpusBound {
            if let Err(e) = self.connector.send_sync("CLOSE").await {
                warn!("Failed to close corpus: {}", e);
            }
        }
        let outcome = self.connector.send_sync("CLOSE-SESSION").await;
        self.state = SessionState::Closed;
        self.job = None;
        info!("Closed poliqarpd session {}", self.settings.session_name);
        outcome.map(|_| ())
    }

    /// Open a corpus and wait until the server has loaded it.
    pub async fn open_corpus(&mut self, path: impl Into<CorpusPath>) -> Result<()> {
        let path = self.resolve_corpus(path.into())?;
        let (tx, rx) = oneshot::channel();
        let handler: MilestoneHandler = Box::new(move |line| {
            let _ = tx.send(line);
        });
        self.send_open(&path, handler).await?;

        let milestone = self
            .bounded(rx)
            .await?
            .map_err(|_| PoliqarpError::Protocol("corpus open was never confirmed".to_string()))?;
        milestone.into_result()?;
        self.state = SessionState::CorpusBound;
        info!("Opened corpus {}", path.display());
        Ok(())
    }

    /// Start opening a corpus; `handler` receives the completion milestone.
    ///
    /// Returns once the server has acknowledged the command. The session is
    /// treated as bound from then on, so `close` also closes the corpus.
    pub async fn open_corpus_with(
        &mut self,
        path: impl Into<CorpusPath>,
        handler: MilestoneHandler,
    ) -> Result<()> {
        let path = self.resolve_corpus(path.into())?;
        self.send_open(&path, handler).await?;
        self.state = SessionState::CorpusBound;
        Ok(())
    }

    /// Send `OPEN`. The previous corpus, if any, is gone once the server
    /// acknowledges; the caller decides when the new one counts as bound.
    async fn send_open(&mut self, path: &Path, handler: MilestoneHandler) -> Result<()> {
        self.job = None;
        self.connector
            .send_async(&format!("OPEN {}", path.display()), handler)
            .await?;
        self.state = SessionState::Open;
        Ok(())
    }

    fn resolve_corpus(&self, path: CorpusPath) -> Result<PathBuf> {
        match path {
            CorpusPath::Path(path) => Ok(path),
            CorpusPath::Default => self
                .settings
                .default_corpus
                .clone()
                .ok_or(PoliqarpError::NoDefaultCorpus),
        }
    }

    /// Close the open corpus, keeping the session.
    pub async fn close_corpus(&mut self) -> Result<()> {
        self.job = None;
        self.connector.send_sync("CLOSE").await?;
        self.state = SessionState::Open;
        Ok(())
    }

    // =========================================================================
    // Server information
    // =========================================================================

    /// Whether the server answers `PING` with `PONG`.
    pub async fn ping(&mut self) -> Result<bool> {
        let reply = self.connector.send_sync("PING").await?;
        Ok(reply.contains("PONG"))
    }

    pub async fn version(&mut self) -> Result<String> {
        self.connector.send_sync("VERSION").await
    }

    /// Statistics of the open corpus.
    pub async fn stats(&mut self) -> Result<CorpusStats> {
        let reply = self.connector.send_sync("CORPUS-STATS").await?;
        let fields: Vec<&str> = reply.split_whitespace().collect();
        let field = |index: usize| -> Result<u64> {
            fields
                .get(index)
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| PoliqarpError::Protocol(format!("Malformed CORPUS-STATS: {}", reply)))
        };
        Ok(CorpusStats {
            segment_tokens: field(1)?,
            segment_types: field(2)?,
            lemmata: field(3)?,
            tags: field(4)?,
        })
    }

    /// Tag-set of the open corpus.
    pub async fn tagset(&mut self) -> Result<Tagset> {
        let mut exchange = self.connector.exchange().await?;
        let reply = exchange.request("GET-TAGSET").await?;
        let categories = count_field(&reply, 1)?;
        let classes = count_field(&reply, 2)?;

        let mut tagset = Tagset::default();
        for (count, target) in [
            (categories, &mut tagset.categories),
            (classes, &mut tagset.classes),
        ] {
            for _ in 0..count {
                let line = read_data(&mut exchange).await?;
                let mut words = line.split_whitespace();
                if let Some(name) = words.next() {
                    target.insert(name.to_string(), words.map(str::to_string).collect());
                }
            }
        }
        exchange.finish();
        Ok(tagset)
    }

    /// Enumerating metadata field types is not supported.
    pub async fn metadata_types(&mut self) -> Result<Vec<String>> {
        Err(PoliqarpError::NotImplemented("metadata types"))
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    pub async fn set_left_context_width(&mut self, width: i64) -> Result<()> {
        let width = ContextWidth::try_from(width)?;
        self.set_option("left-context-width", &width.to_string())
            .await?;
        self.config.left_context_width = width;
        Ok(())
    }

    pub async fn set_right_context_width(&mut self, width: i64) -> Result<()> {
        let width = ContextWidth::try_from(width)?;
        self.set_option("right-context-width", &width.to_string())
            .await?;
        self.config.right_context_width = width;
        Ok(())
    }

    /// Set which groups are annotated with grammatical tags.
    pub async fn set_retrieve_tags(&mut self, flags: GroupFlags) -> Result<()> {
        self.set_option("retrieve-tags", &flags.to_string()).await?;
        self.config.tags = flags;
        Ok(())
    }

    /// Set which groups are annotated with base forms.
    pub async fn set_retrieve_lemmata(&mut self, flags: GroupFlags) -> Result<()> {
        self.set_option("retrieve-lemmata", &flags.to_string())
            .await?;
        self.config.lemmata = flags;
        Ok(())
    }

    pub async fn set_group_tags(&mut self, group: Group, enabled: bool) -> Result<()> {
        let flags = self.config.tags.with(group, enabled);
        self.set_retrieve_tags(flags).await
    }

    pub async fn set_group_lemmata(&mut self, group: Group, enabled: bool) -> Result<()> {
        let flags = self.config.lemmata.with(group, enabled);
        self.set_retrieve_lemmata(flags).await
    }

    /// Resize the result buffer. The running job keeps its old capacity.
    pub async fn set_buffer_capacity(&mut self, capacity: u64) -> Result<()> {
        let capacity = Config::validate_capacity(capacity)?;
        self.expect_ok(&format!("BUFFER-RESIZE {}", capacity))
            .await?;
        self.config.buffer_capacity = capacity;
        Ok(())
    }

    async fn set_option(&mut self, option: &str, value: &str) -> Result<()> {
        self.expect_ok(&format!("SET {} {}", option, value)).await
    }

    async fn expect_ok(&mut self, command: &str) -> Result<()> {
        let reply = self.connector.send_sync(command).await?;
        if !reply.starts_with("OK") {
            return Err(PoliqarpError::Protocol(format!(
                "Unexpected reply to {:?}: {}",
                command, reply
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Find one page of results for `query`.
    ///
    /// With `page_size == 0` every result is returned on a single page, which
    /// requires the job to complete. Otherwise the page is served as soon as
    /// the buffer holds it; `page_count` is then computed from a count that
    /// may still grow (see [`QueryResult::complete`]).
    pub async fn find(&mut self, query: &str, options: &FindOptions) -> Result<QueryResult> {
        let page_size = options.page_size;

        let (page, offset, count) = if page_size == 0 {
            self.submit(query).await?;
            let count = self.wait_complete().await?;
            (1, 0, count)
        } else {
            if options.page_index == 0 {
                return Err(PoliqarpError::InvalidConfig(
                    "page index starts at 1".to_string(),
                ));
            }
            let capacity = self.capacity_for(query);
            let offset = page_size
                .checked_mul(options.page_index - 1)
                .filter(|offset| *offset < capacity)
                .ok_or(PoliqarpError::IndexOutOfBounds {
                    index: page_size.saturating_mul(options.page_index - 1),
                    capacity,
                })?;
            self.submit(query).await?;
            let needed = offset.saturating_add(page_size).min(capacity);
            let count = self.wait_for_results(needed).await?;
            (options.page_index, offset, count)
        };

        let (limit, page_count) = page_span(count, page_size, offset);
        let mut result = QueryResult::new(page, page_count, page_size, query);
        result.complete = self.job.as_ref().is_some_and(QueryJob::is_complete);
        if limit > 0 {
            for excerpt in self.fetch_results(query, offset, limit).await? {
                result.push(excerpt);
            }
        }
        debug!(
            "find {:?}: page {}/{} with {} excerpts",
            query,
            result.page,
            result.page_count,
            result.len()
        );
        Ok(result)
    }

    /// Fetch the single excerpt at `index`.
    ///
    /// `index` must be below the buffer capacity; this is checked before
    /// anything is sent.
    pub async fn find_one(&mut self, query: &str, index: u64) -> Result<Excerpt> {
        self.check_index(query, index)?;
        self.submit(query).await?;
        self.wait_for_results(index + 1).await?;
        let mut excerpts = self.fetch_results(query, index, 1).await?;
        excerpts
            .pop()
            .ok_or_else(|| PoliqarpError::Protocol("GET-RESULTS returned nothing".to_string()))
    }

    /// Exact number of results for `query`. Waits for the job to complete.
    pub async fn count(&mut self, query: &str) -> Result<u64> {
        self.submit(query).await?;
        self.wait_complete().await
    }

    /// Long context of the excerpt identified by `(query, index)`.
    pub async fn context(&mut self, query: &str, index: u64) -> Result<LongContext> {
        self.check_index(query, index)?;
        self.submit(query).await?;
        self.wait_for_results(index + 1).await?;

        let mut exchange = self.connector.exchange().await?;
        exchange.request(&format!("GET-CONTEXT {}", index)).await?;
        let context = LongContext {
            left_context: read_data(&mut exchange).await?,
            left_match: read_data(&mut exchange).await?,
            right_match: read_data(&mut exchange).await?,
            right_context: read_data(&mut exchange).await?,
        };
        exchange.finish();
        Ok(context)
    }

    /// Document metadata of the excerpt identified by `(query, index)`.
    pub async fn metadata(&mut self, query: &str, index: u64) -> Result<Metadata> {
        self.check_index(query, index)?;
        self.submit(query).await?;
        self.wait_for_results(index + 1).await?;

        let mut exchange = self.connector.exchange().await?;
        let reply = exchange.request(&format!("METADATA {}", index)).await?;
        let count = count_field(&reply, 1)?;

        let mut metadata = Metadata::new();
        for _ in 0..count {
            let key: String = read_data(&mut exchange)
                .await?
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            let value = read_data(&mut exchange).await?;
            // Values carry a two-character type prefix, e.g. "T Pan Tadeusz".
            if value.chars().count() < 2 {
                continue;
            }
            let value: String = value.chars().skip(2).collect();
            metadata.entry(key).or_default().push(value);
        }
        exchange.finish();
        Ok(metadata)
    }

    fn capacity_for(&self, query: &str) -> u64 {
        match &self.job {
            Some(job) if job.query == query => job.capacity,
            _ => self.config.buffer_capacity,
        }
    }

    fn check_index(&self, query: &str, index: u64) -> Result<()> {
        let capacity = self.capacity_for(query);
        if index >= capacity {
            return Err(PoliqarpError::IndexOutOfBounds { index, capacity });
        }
        Ok(())
    }

    /// Make `query` the current job, reusing it if it already is.
    async fn submit(&mut self, query: &str) -> Result<()> {
        if self.job.as_ref().is_some_and(|job| job.query == query) {
            debug!("Reusing running job for {:?}", query);
            return Ok(());
        }

        self.job = None;
        let capacity = self.config.buffer_capacity;
        let make_query = format!("MAKE-QUERY {}", query);

        let mut exchange = self.connector.exchange().await?;
        match exchange.send_sync(&make_query).await {
            Ok(_) => {}
            Err(PoliqarpError::JobInProgress) => {
                info!("Previous job still running, cancelling it");
                exchange.clear_handler();
                if let Err(e) = exchange.send_sync("CANCEL").await {
                    warn!("CANCEL failed: {}", e);
                }
                exchange.send_sync(&make_query).await?;
            }
            Err(e) => return Err(e),
        }

        let (job, handler) = QueryJob::new(query, capacity);
        exchange
            .send_async(&format!("RUN-QUERY {}", capacity), handler)
            .await?;
        drop(exchange);

        self.job = Some(job);
        Ok(())
    }

    fn current_job(&mut self) -> Result<&mut QueryJob> {
        self.job
            .as_mut()
            .ok_or_else(|| PoliqarpError::Protocol("no query job submitted".to_string()))
    }

    async fn wait_complete(&mut self) -> Result<u64> {
        let limit = self.settings.wait_timeout;
        self.current_job()?.wait(limit).await
    }

    /// Wait until at least `needed` results are buffered or the job is done.
    ///
    /// Returns the best known count, which is only final once the job has
    /// completed.
    async fn wait_for_results(&mut self, needed: u64) -> Result<u64> {
        let poll_interval = self.settings.poll_interval;
        let limit = self.settings.wait_timeout;
        let deadline = limit.map(|limit| Instant::now() + limit);

        loop {
            if let Some(count) = self.current_job()?.check()? {
                return Ok(count);
            }

            let reply = self.connector.send_sync("BUFFER-STATE").await?;
            let buffered = count_field(&reply, 2)?;
            let job = self.current_job()?;
            job.observe(buffered);
            if job.known_count() >= needed {
                return Ok(job.known_count());
            }

            if let (Some(deadline), Some(limit)) = (deadline, limit) {
                if Instant::now() >= deadline {
                    return Err(PoliqarpError::Timeout(limit));
                }
            }

            debug!("Waiting for {} results, {} buffered", needed, buffered);
            tokio::select! {
                _ = job.completed() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Send `GET-RESULTS` for `limit` excerpts starting at `offset` and
    /// decode them with the current retrieval flags.
    async fn fetch_results(&mut self, query: &str, offset: u64, limit: u64) -> Result<Vec<Excerpt>> {
        let config = self.config.clone();
        let mut exchange = self.connector.exchange().await?;
        exchange
            .request(&format!("GET-RESULTS {} {}", offset, offset + limit - 1))
            .await?;

        let mut excerpts = Vec::new();
        for index in offset..offset + limit {
            excerpts.push(read_excerpt(&mut exchange, &config, query, index).await?);
        }
        exchange.finish();
        Ok(excerpts)
    }

    async fn bounded<F: std::future::Future>(&self, future: F) -> Result<F::Output> {
        match self.settings.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, future)
                .await
                .map_err(|_| PoliqarpError::Timeout(limit)),
            None => Ok(future.await),
        }
    }
}

/// Excerpts on the page and the page count for `count` results.
///
/// `page_size == 0` puts everything on one page.
pub fn page_span(count: u64, page_size: u64, offset: u64) -> (u64, u64) {
    if page_size == 0 {
        return (count, 1);
    }
    let limit = page_size.min(count.saturating_sub(offset));
    (limit, count.div_ceil(page_size))
}

/// Decode one excerpt: three count-prefixed segment groups.
async fn read_excerpt(
    exchange: &mut Exchange<'_>,
    config: &Config,
    query: &str,
    index: u64,
) -> Result<Excerpt> {
    let mut excerpt = Excerpt::new(index, query);
    excerpt.left_context = read_segments(exchange, config, Group::LeftContext).await?;
    // The server sends the match as one group governed by the left-match flags.
    excerpt.matched = read_segments(exchange, config, Group::LeftMatch).await?;
    excerpt.right_context = read_segments(exchange, config, Group::RightContext).await?;
    Ok(excerpt)
}

async fn read_segments(
    exchange: &mut Exchange<'_>,
    config: &Config,
    group: Group,
) -> Result<Vec<Segment>> {
    let count = read_count(exchange).await?;
    let with_readings = config.retrieves_readings(group);
    let with_tags = config.tags.get(group);
    let with_lemmata = config.lemmata.get(group);

    let mut segments = Vec::new();
    for _ in 0..count {
        let mut segment = Segment::new(read_data(exchange).await?);
        if with_readings {
            let readings = read_count(exchange).await?;
            for _ in 0..readings {
                let mut lemmata = Lemmata::default();
                if with_lemmata {
                    lemmata.base_form = Some(read_data(exchange).await?);
                }
                if with_tags {
                    lemmata.tag = Some(read_data(exchange).await?);
                }
                segment.lemmata.push(lemmata);
            }
        }
        segments.push(segment);
    }
    Ok(segments)
}

/// Read a reply holding a count, e.g. `3` or `OK 3`.
async fn read_count(exchange: &mut Exchange<'_>) -> Result<u64> {
    let line = exchange.read_line().await?.into_result()?;
    line.payload
        .split_whitespace()
        .find_map(|field| field.parse().ok())
        .ok_or_else(|| PoliqarpError::Protocol(format!("Expected a count, got {:?}", line.payload)))
}

/// Read a data line verbatim. Its status is ignored: a corpus token may well
/// be spelled `OK` or `ERR 1`.
async fn read_data(exchange: &mut Exchange<'_>) -> Result<String> {
    Ok(exchange.read_line().await?.payload)
}

fn count_field(reply: &str, index: usize) -> Result<u64> {
    reply
        .split_whitespace()
        .nth(index)
        .and_then(|field| field.parse().ok())
        .ok_or_else(|| PoliqarpError::Protocol(format!("Expected a count in {:?}", reply)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_span_example() {
        // 6 results, 5 per page: 5 then 1.
        assert_eq!(page_span(6, 5, 0), (5, 2));
        assert_eq!(page_span(6, 5, 5), (1, 2));
    }

    #[test]
    fn test_page_span_all_on_one_page() {
        assert_eq!(page_span(6, 0, 0), (6, 1));
        assert_eq!(page_span(0, 0, 0), (0, 1));
    }

    #[test]
    fn test_page_span_law() {
        for count in 0..40u64 {
            for page_size in 1..9u64 {
                let (_, page_count) = page_span(count, page_size, 0);
                assert_eq!(page_count, (count + page_size - 1) / page_size);

                let mut total = 0;
                for page in 1..=page_count {
                    let (limit, _) = page_span(count, page_size, page_size * (page - 1));
                    if page < page_count {
                        assert_eq!(limit, page_size);
                    } else {
                        assert_eq!(limit, count - page_size * (page_count - 1));
                    }
                    total += limit;
                }
                assert_eq!(total, count);
            }
        }
    }

    #[test]
    fn test_page_beyond_results_is_empty() {
        assert_eq!(page_span(6, 5, 10), (0, 2));
    }

    #[test]
    fn test_corpus_path_from_str() {
        assert_eq!(CorpusPath::from(":default"), CorpusPath::Default);
        assert_eq!(
            CorpusPath::from("/corpora/sample"),
            CorpusPath::Path(PathBuf::from("/corpora/sample"))
        );
    }

    #[test]
    fn test_count_field() {
        assert_eq!(count_field("OK 500000 42", 2).unwrap(), 42);
        assert!(count_field("OK", 1).is_err());
    }
}
