//! Batch orchestrator: turns a heterogeneous list of translation requests
//! into the minimum necessary set of network calls while maximizing
//! translation-memory reuse.
//!
//! Per batch: normalize input -> resolve against memory -> route what is left
//! (single item, placeholder-sensitive individual, or one grouped JSON call)
//! -> parse/clean the reply -> write fresh translations back -> merge. A
//! grouped reply that fails to parse falls back to per-item calls so a
//! format-violating model can never wedge the batch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::chunker;
use crate::client::{HttpTransport, ModelRequest, ModelTransport, NoopMeter, RequestClient, UsageMeter};
use crate::config::TranslatorConfig;
use crate::error::TranslateError;
use crate::memory::{MemorySession, MemoryStore, ObjectIdentity};
use crate::metrics::{metric_names, MetricsRegistry};

/// Context markers that flag structured-template content. Mistranslating a
/// placeholder inside such content breaks functionality, so these items are
/// never batched with siblings. Substring match on the free-text context is
/// a fragile signal; callers that know better set `placeholder_sensitive`.
const SPECIAL_CONTEXT_MARKERS: &[&str] =
    &["form field", "shortcode", "placeholder", "template tag", "mail-tag"];

/// One translation request item.
#[derive(Debug, Clone)]
pub struct RequestItem {
    /// Caller-assigned correlation key, unique within one batch.
    pub id: String,
    pub text: String,
    /// Free-text hint describing the content's domain or purpose.
    pub context: Option<String>,
    /// Explicitly marks content whose placeholders must survive verbatim.
    pub placeholder_sensitive: bool,
}

impl RequestItem {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            context: None,
            placeholder_sensitive: false,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    fn is_placeholder_sensitive(&self) -> bool {
        if self.placeholder_sensitive {
            return true;
        }
        self.context.as_deref().is_some_and(|c| {
            let lowered = c.to_lowercase();
            SPECIAL_CONTEXT_MARKERS.iter().any(|m| lowered.contains(m))
        })
    }
}

/// Caller input: canonical item list, or the legacy flat id->text mapping.
/// The ambiguity is absorbed here at the boundary, not in the core logic.
#[derive(Debug, Clone)]
pub enum BatchInput {
    Items(Vec<RequestItem>),
    Map(Vec<(String, String)>),
}

/// Object identity under which fresh translations are persisted. The item id
/// doubles as the field name.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub object_id: i64,
    pub object_type: String,
}

/// Per-batch options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Consult the translation memory before calling the model.
    pub use_memory: bool,
    /// Minimum fuzzy similarity for a memory hit; 100 means exact-only.
    pub memory_threshold: u8,
    /// Shared context applied to the whole batch.
    pub global_context: Option<String>,
    /// When set, fresh translations are written back to the memory store.
    pub object: Option<ObjectRef>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            use_memory: true,
            memory_threshold: 100,
            global_context: None,
            object: None,
        }
    }
}

/// The orchestration facade. Explicitly constructed with its collaborators;
/// holds no global state. One instance may serve concurrent requests — all
/// per-request state lives in locals and a per-call [`MemorySession`].
pub struct TranslationService {
    store: Arc<MemoryStore>,
    client: RequestClient,
    config: TranslatorConfig,
    metrics: Arc<MetricsRegistry>,
}

impl TranslationService {
    pub fn new(
        store: Arc<MemoryStore>,
        transport: Arc<dyn ModelTransport>,
        meter: Arc<dyn UsageMeter>,
        config: TranslatorConfig,
    ) -> Self {
        let client = RequestClient::new(transport, meter, config.max_attempts);
        Self {
            store,
            client,
            config,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Production wiring: reqwest transport, no external metering.
    pub fn from_config(
        store: Arc<MemoryStore>,
        config: TranslatorConfig,
    ) -> Result<Self, TranslateError> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::new(store, transport, Arc::new(NoopMeter), config))
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Translate a batch of content fragments into `target_lang`. Returns an
    /// id -> translated-text map. Items that fail on the individual fallback
    /// path are omitted from the map rather than failing the batch.
    pub async fn translate_batch(
        &self,
        input: BatchInput,
        target_lang: &str,
        opts: &BatchOptions,
    ) -> Result<HashMap<String, String>, TranslateError> {
        let batch_id = uuid::Uuid::new_v4();
        let batch_span = self.metrics.span(metric_names::BATCH_TOTAL);
        let items = normalize_input(input)?;
        if items.is_empty() {
            batch_span.finish();
            return Ok(HashMap::new());
        }
        let total = items.len();

        let session = MemorySession::new(&self.store);

        // Memory resolution: partition into resolved vs. needs-API.
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut unresolved: Vec<RequestItem> = Vec::new();
        if opts.use_memory {
            for item in items {
                let lookup_span = self.metrics.span(metric_names::MEMORY_LOOKUP);
                let hit = session.get_best(&item.text, target_lang, opts.memory_threshold)?;
                lookup_span.finish();
                match hit {
                    Some(hit) => {
                        debug!(id = %item.id, similarity = hit.similarity, "memory hit");
                        // Stored records may come from outside writers; they
                        // get the same cleanup as fresh model output.
                        resolved.insert(item.id, clean_translation(&hit.translated));
                    }
                    None => unresolved.push(item),
                }
            }
        } else {
            unresolved = items;
        }

        info!(
            batch_id = %batch_id,
            total,
            memory_hits = resolved.len(),
            api_items = unresolved.len(),
            target_lang,
            "batch resolved against memory"
        );

        if unresolved.is_empty() {
            batch_span.finish();
            return Ok(resolved);
        }

        // Items over the content budget go through the chunker + single-item
        // path before any routing decision.
        let mut fresh: Vec<(RequestItem, String)> = Vec::new();
        let mut remaining: Vec<RequestItem> = Vec::new();
        for item in unresolved {
            if chunker::needs_chunking(&item.text, self.config.max_content_chars) {
                let translated = self.translate_oversized(&item, target_lang, opts).await?;
                fresh.push((item, translated));
            } else {
                remaining.push(item);
            }
        }

        match remaining.len() {
            0 => {}
            // A lone unresolved item skips batch JSON construction entirely.
            1 => {
                if let Some(item) = remaining.pop() {
                    let context = item.context.as_deref().or(opts.global_context.as_deref());
                    let translated =
                        self.translate_single(&item.text, target_lang, context).await?;
                    fresh.push((item, translated));
                }
            }
            _ => {
                if remaining.iter().any(RequestItem::is_placeholder_sensitive) {
                    // One structured-template item poisons the whole group:
                    // cross-item context bleed can corrupt placeholders, so
                    // every remaining item goes out on its own.
                    info!(items = remaining.len(), "placeholder-sensitive batch, routing individually");
                    for item in remaining {
                        let context = item.context.as_deref().or(opts.global_context.as_deref());
                        let translated =
                            self.translate_single(&item.text, target_lang, context).await?;
                        fresh.push((item, translated));
                    }
                } else {
                    let grouped = self.translate_grouped(&remaining, target_lang, opts).await?;
                    fresh.extend(grouped);
                }
            }
        }

        // Persist fresh results under the caller's object identity.
        if let Some(object) = &opts.object {
            for (item, translated) in &fresh {
                let identity = ObjectIdentity {
                    object_id: object.object_id,
                    object_type: object.object_type.clone(),
                    field_name: item.id.clone(),
                    language_code: target_lang.to_string(),
                };
                session.put(&identity, &item.text, translated, true)?;
            }
        }

        resolved.extend(fresh.into_iter().map(|(item, translated)| (item.id, translated)));
        batch_span.finish();
        Ok(resolved)
    }

    /// Translate one text through one model call.
    async fn translate_single(
        &self,
        text: &str,
        target_lang: &str,
        context: Option<&str>,
    ) -> Result<String, TranslateError> {
        let request = ModelRequest {
            system: single_preamble(target_lang, context),
            user: text.to_string(),
        };
        let api_span = self.metrics.span(metric_names::API_CALL);
        let reply = self.client.send(&request).await?;
        api_span.finish();
        Ok(clean_translation(&reply.text))
    }

    /// Chunk an oversized item, translate chunks independently in order, and
    /// join the results.
    async fn translate_oversized(
        &self,
        item: &RequestItem,
        target_lang: &str,
        opts: &BatchOptions,
    ) -> Result<String, TranslateError> {
        let split_span = self.metrics.span(metric_names::CHUNK_SPLIT);
        let chunks = chunker::split(&item.text, self.config.max_content_chars);
        split_span.finish();
        info!(
            id = %item.id,
            chunks = chunks.len(),
            chars = item.text.len(),
            "oversized content chunked"
        );

        let context = item.context.as_deref().or(opts.global_context.as_deref());
        let mut translated = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            translated.push(self.translate_single(chunk, target_lang, context).await?);
        }
        Ok(chunker::join(&translated))
    }

    /// One grouped JSON call for all remaining items, with individual
    /// fallback when the model violates the output format.
    async fn translate_grouped(
        &self,
        items: &[RequestItem],
        target_lang: &str,
        opts: &BatchOptions,
    ) -> Result<Vec<(RequestItem, String)>, TranslateError> {
        let with_hints = items.iter().any(|i| i.context.is_some());
        let mut payload = serde_json::Map::new();
        for item in items {
            let value = if with_hints {
                let mut entry = serde_json::Map::new();
                entry.insert("text".into(), item.text.clone().into());
                if let Some(ctx) = &item.context {
                    entry.insert("hint".into(), ctx.clone().into());
                }
                serde_json::Value::Object(entry)
            } else {
                item.text.clone().into()
            };
            payload.insert(item.id.clone(), value);
        }

        let request = ModelRequest {
            system: batch_preamble(target_lang, with_hints, opts.global_context.as_deref()),
            user: serde_json::Value::Object(payload).to_string(),
        };

        let api_span = self.metrics.span(metric_names::API_CALL);
        let reply = self.client.send(&request).await?;
        api_span.finish();

        match parse_batch_payload(&reply.text) {
            Ok(map) => {
                let mut fresh = Vec::with_capacity(items.len());
                for item in items {
                    match map.get(&item.id) {
                        Some(translated) => {
                            fresh.push((item.clone(), clean_translation(translated)));
                        }
                        None => warn!(id = %item.id, "id missing from batch reply"),
                    }
                }
                Ok(fresh)
            }
            Err(parse_err) => {
                // Forward progress guarantee: abandon the batch and translate
                // each item on its own. Per-item failures become omissions.
                warn!(error = %parse_err, items = items.len(), "batch reply unparseable, falling back to individual calls");
                let mut fresh = Vec::new();
                for item in items {
                    let context = item.context.as_deref().or(opts.global_context.as_deref());
                    match self.translate_single(&item.text, target_lang, context).await {
                        Ok(translated) => fresh.push((item.clone(), translated)),
                        Err(e) => {
                            warn!(id = %item.id, error = %e, "individual fallback failed, omitting item");
                        }
                    }
                }
                if fresh.is_empty() {
                    // Every fallback item failed too; now the parse failure
                    // is the caller's problem.
                    return Err(parse_err);
                }
                Ok(fresh)
            }
        }
    }
}

/// Canonicalize caller input: adapt the legacy map form, drop empty-text
/// items, reject duplicate correlation ids.
fn normalize_input(input: BatchInput) -> Result<Vec<RequestItem>, TranslateError> {
    let items = match input {
        BatchInput::Items(items) => items,
        BatchInput::Map(pairs) => pairs
            .into_iter()
            .map(|(id, text)| RequestItem::new(id, text))
            .collect(),
    };
    let items: Vec<RequestItem> = items
        .into_iter()
        .filter(|item| !item.text.trim().is_empty())
        .collect();

    let mut seen = HashSet::new();
    for item in &items {
        if !seen.insert(item.id.clone()) {
            return Err(TranslateError::InvalidRequest(format!(
                "duplicate item id: {}",
                item.id
            )));
        }
    }
    Ok(items)
}

fn single_preamble(target_lang: &str, context: Option<&str>) -> String {
    let mut preamble = format!(
        "You are a professional translator. Translate the user's content into {target_lang}. \
         Preserve all markup and structural syntax verbatim; translate only human-readable text. \
         Do not alter brand names or technical terms. \
         Output only the translation, with no commentary."
    );
    if let Some(ctx) = context {
        preamble.push_str("\nContext: ");
        preamble.push_str(ctx);
    }
    preamble
}

fn batch_preamble(target_lang: &str, with_hints: bool, global_context: Option<&str>) -> String {
    let shape = if with_hints {
        "JSON object mapping ids to objects carrying the source \"text\" and an optional per-item \"hint\"; the hint guides that item only"
    } else {
        "JSON object mapping ids to source strings"
    };
    let mut preamble = format!(
        "You are a professional translator. The user message is a {shape}. \
         Translate every value into {target_lang}.\n\
         Hard constraints:\n\
         - Return strictly a single-level JSON object keyed by the exact ids provided.\n\
         - Preserve all markup and structural syntax verbatim; translate only human-readable text.\n\
         - Do not alter brand names or technical terms.\n\
         - Output no prose outside the JSON object."
    );
    if let Some(ctx) = global_context {
        preamble.push_str("\nContext: ");
        preamble.push_str(ctx);
    }
    preamble
}

/// Strip a wrapping code fence (``` or ```json) from a model reply.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    let rest = rest.trim_end();
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse a grouped reply into an id -> text map. Strict JSON first; then a
/// tolerant retry on the outermost `{...}` slice (models sometimes surround
/// the object with prose despite the instructions).
fn parse_batch_payload(raw: &str) -> Result<HashMap<String, String>, TranslateError> {
    let stripped = strip_code_fences(raw);
    let value: serde_json::Value = match serde_json::from_str(stripped) {
        Ok(v) => v,
        Err(first_err) => {
            let sliced = stripped
                .find('{')
                .zip(stripped.rfind('}'))
                .filter(|(start, end)| start < end)
                .map(|(start, end)| &stripped[start..=end]);
            match sliced.and_then(|s| serde_json::from_str(s).ok()) {
                Some(v) => v,
                None => {
                    return Err(TranslateError::ParseError(format!(
                        "batch reply is not valid JSON: {first_err}"
                    )))
                }
            }
        }
    };

    let object = value.as_object().ok_or_else(|| {
        TranslateError::ParseError("batch reply is not a JSON object".into())
    })?;

    let mut map = HashMap::with_capacity(object.len());
    for (id, entry) in object {
        let text = match entry {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(inner) => inner
                .get("text")
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    TranslateError::ParseError(format!("item {id}: object without \"text\""))
                })?,
            other => {
                return Err(TranslateError::ParseError(format!(
                    "item {id}: unexpected value type {other}"
                )))
            }
        };
        map.insert(id.clone(), text);
    }
    Ok(map)
}

/// Normalize a translated string: strip stray fences, collapse over-escaped
/// quotes, trim.
fn clean_translation(text: &str) -> String {
    collapse_escaped_quotes(strip_code_fences(text))
}

/// Collapse runs of 2+ backslashes directly before a quote into the bare
/// quote. Models embedding strings in JSON tend to double-escape quotes;
/// a single backslash-quote is left alone.
fn collapse_escaped_quotes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let mut run = 1usize;
        while chars.peek() == Some(&'\\') {
            chars.next();
            run += 1;
        }
        match chars.peek() {
            Some(&quote) if run >= 2 && (quote == '"' || quote == '\'') => {
                chars.next();
                out.push(quote);
            }
            _ => {
                for _ in 0..run {
                    out.push('\\');
                }
            }
        }
    }
    out
}
