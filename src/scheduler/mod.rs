//! Batch scheduler: the pipeline's execution engine.
//!
//! Rows come in, batches go out to a fixed worker pool, and per-row
//! results come back in input order. Along the way the scheduler consults
//! the cache, walks the router's model chain on failure, retries with
//! exponential backoff, enforces per-model cooldowns, and checkpoints
//! completed ids so a resumed run repeats nothing.
//!
//! The work queue between producer and workers is bounded at twice the
//! worker count, which caps memory on very large inputs.

pub mod batching;
pub mod checkpoint;
pub mod parse;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::codec::token_signature;
use crate::config::{BatchRuntimeConfig, ContentType, ProcessingConfig};
use crate::error::{LocPipeError, Result};
use crate::router::ModelRouter;
use crate::trace::{CallMeta, TraceEvent, TraceSink};
use crate::transport::{LlmRequest, LlmTransport};

use batching::LatencyHistory;
use checkpoint::Checkpoint;

/// One schedulable row.
#[derive(Debug, Clone)]
pub struct WorkRow {
    pub string_id: String,
    pub source_text: String,
    pub max_length_target: Option<u32>,
    pub is_long_text: bool,
}

/// Per-row output of a step.
#[derive(Debug, Clone)]
pub struct RowResult {
    pub string_id: String,
    /// The source the result was produced from, kept for cache write-back.
    pub source_text: String,
    pub text: String,
    pub from_cache: bool,
    pub model: Option<String>,
}

/// Lifecycle of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Pending,
    InFlight,
    Ok,
    FailedRetryable,
    FailedFatal,
}

/// Builds a prompt from the rows of one batch. The system builder can
/// inject per-row constraints such as length limits.
pub type PromptBuilder = Arc<dyn Fn(&[WorkRow]) -> String + Send + Sync>;

/// One step submission.
pub struct StepRequest {
    pub step: String,
    pub rows: Vec<WorkRow>,
    pub system_prompt: PromptBuilder,
    pub user_prompt: PromptBuilder,
    pub model_override: Option<String>,
    pub checkpoint_path: Option<PathBuf>,
}

/// Step result: per-row outputs plus what fell through.
#[derive(Debug, Default)]
pub struct StepOutcome {
    pub results: Vec<RowResult>,
    pub failed_ids: Vec<String>,
    pub cache_hits: usize,
    pub llm_rows: usize,
    pub cancelled: bool,
}

struct StepContext {
    step: String,
    chain: Vec<String>,
    content_type: ContentType,
    system_prompt: PromptBuilder,
    user_prompt: PromptBuilder,
}

struct BatchOutput {
    results: Vec<RowResult>,
    failed_ids: Vec<String>,
    #[allow(dead_code)]
    state: BatchState,
}

/// Per-model cooldown gate between consecutive batches.
#[derive(Default)]
struct CooldownGate {
    last_call: Mutex<HashMap<String, Instant>>,
}

impl CooldownGate {
    async fn wait(&self, model: &str, cooldown_ms: u64) {
        if cooldown_ms == 0 {
            return;
        }
        let wait_until = {
            let guard = match self.last_call.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            guard
                .get(model)
                .map(|last| *last + Duration::from_millis(cooldown_ms))
        };
        if let Some(until) = wait_until {
            let now = Instant::now();
            if until > now {
                tokio::time::sleep(until - now).await;
            }
        }
    }

    fn touch(&self, model: &str) {
        if let Ok(mut guard) = self.last_call.lock() {
            guard.insert(model.to_string(), Instant::now());
        }
    }
}

/// The scheduler itself; shared across steps via `Arc`.
pub struct BatchScheduler {
    transport: Arc<dyn LlmTransport>,
    router: Arc<ModelRouter>,
    cache: Option<Arc<CacheStore>>,
    trace: Arc<TraceSink>,
    processing: ProcessingConfig,
    limits: BatchRuntimeConfig,
    env_default_model: Option<String>,
    glossary_digest: String,
    cancel: CancellationToken,
    latency: Mutex<LatencyHistory>,
    cooldown: CooldownGate,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn LlmTransport>,
        router: Arc<ModelRouter>,
        cache: Option<Arc<CacheStore>>,
        trace: Arc<TraceSink>,
        processing: ProcessingConfig,
        limits: BatchRuntimeConfig,
        env_default_model: Option<String>,
        glossary_digest: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            router,
            cache,
            trace,
            processing,
            limits,
            env_default_model,
            glossary_digest,
            cancel,
            latency: Mutex::new(LatencyHistory::default()),
            cooldown: CooldownGate::default(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one step to completion (or cancellation).
    pub async fn run_step(self: &Arc<Self>, request: StepRequest) -> Result<StepOutcome> {
        let chain = self.router.resolve_chain(
            &request.step,
            request.model_override.as_deref(),
            self.env_default_model.as_deref(),
        )?;
        let primary_model = chain[0].clone();

        let mut cp = request
            .checkpoint_path
            .as_ref()
            .map(|p| (p.clone(), Checkpoint::load(p, &request.step)));

        let input_order: HashMap<String, usize> = request
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.string_id.clone(), i))
            .collect();

        let pending: Vec<WorkRow> = request
            .rows
            .into_iter()
            .filter(|r| {
                cp.as_ref()
                    .map(|(_, cp)| !cp.is_done(&r.string_id))
                    .unwrap_or(true)
            })
            .collect();

        self.trace.emit(&TraceEvent::StepStart {
            step: request.step.clone(),
            total_rows: pending.len(),
        });
        self.trace.emit(&TraceEvent::RouterDecision {
            step: request.step.clone(),
            chain: chain.clone(),
            config_hash: self.router.config_hash().map(String::from),
        });

        let content_type = if pending.iter().any(|r| r.is_long_text) {
            ContentType::LongText
        } else {
            ContentType::Normal
        };

        let mut outcome = StepOutcome::default();

        // Cache short-circuit: hits skip the worker pool entirely.
        let mut to_translate = Vec::new();
        for row in pending {
            if let Some(cache) = &self.cache {
                let (hit, translation) =
                    cache.get(&row.source_text, &self.glossary_digest, &primary_model);
                if hit {
                    if let Some(translation) = translation {
                        if cached_translation_valid(&row.source_text, &translation) {
                            self.trace.emit(&TraceEvent::CacheHit {
                                step: request.step.clone(),
                                string_id: row.string_id.clone(),
                                model: primary_model.clone(),
                            });
                            outcome.cache_hits += 1;
                            if let Some((_, cp)) = cp.as_mut() {
                                cp.mark_done([row.string_id.clone()]);
                            }
                            outcome.results.push(RowResult {
                                string_id: row.string_id,
                                source_text: row.source_text,
                                text: translation,
                                from_cache: true,
                                model: Some(primary_model.clone()),
                            });
                            continue;
                        }
                    }
                }
                self.trace.emit(&TraceEvent::CacheMiss {
                    step: request.step.clone(),
                    string_id: row.string_id.clone(),
                    model: primary_model.clone(),
                });
            }
            to_translate.push(row);
        }
        outcome.llm_rows = to_translate.len();

        if let Some((path, cp)) = cp.as_mut() {
            cp.bump_stat("cache_hits", outcome.cache_hits as u64);
            cp.save(path)?;
        }

        if to_translate.is_empty() {
            self.finish_step(&request.step, &mut outcome, &input_order);
            return Ok(outcome);
        }

        let batches = self.build_batches(to_translate, &primary_model, content_type);
        let ctx = Arc::new(StepContext {
            step: request.step.clone(),
            chain,
            content_type,
            system_prompt: request.system_prompt,
            user_prompt: request.user_prompt,
        });

        // Bounded work queue feeding a fixed pool of workers.
        let workers = self.processing.max_workers.max(1);
        let (work_tx, work_rx) = mpsc::channel::<(usize, Vec<WorkRow>)>(workers * 2);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<BatchOutput>();

        for _ in 0..workers {
            let scheduler = Arc::clone(self);
            let ctx = Arc::clone(&ctx);
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                loop {
                    let next = { work_rx.lock().await.recv().await };
                    let Some((batch_idx, rows)) = next else {
                        break;
                    };
                    let output = scheduler.process_batch(&ctx, batch_idx, rows).await;
                    if result_tx.send(output).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let producer_cancel = self.cancel.clone();
        tokio::spawn(async move {
            for (idx, batch) in batches.into_iter().enumerate() {
                if producer_cancel.is_cancelled() {
                    break;
                }
                if work_tx.send((idx, batch)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(output) = result_rx.recv().await {
            // Write back fresh translations, then acknowledge them in the
            // checkpoint.
            if let Some(cache) = &self.cache {
                for result in output.results.iter().filter(|r| !r.from_cache) {
                    cache.set(
                        &result.source_text,
                        &self.glossary_digest,
                        result.model.as_deref().unwrap_or(&primary_model),
                        &result.text,
                    );
                }
            }
            if let Some((path, cp)) = cp.as_mut() {
                cp.mark_done(output.results.iter().map(|r| r.string_id.clone()));
                cp.batch_idx += 1;
                cp.save(path)?;
            }
            if self.processing.fail_fast && !output.failed_ids.is_empty() {
                self.cancel.cancel();
            }
            outcome.failed_ids.extend(output.failed_ids);
            outcome.results.extend(output.results);
        }

        outcome.cancelled = self.cancel.is_cancelled();
        self.finish_step(&request.step, &mut outcome, &input_order);
        Ok(outcome)
    }

    fn finish_step(
        &self,
        step: &str,
        outcome: &mut StepOutcome,
        input_order: &HashMap<String, usize>,
    ) {
        if self.processing.preserve_order {
            outcome
                .results
                .sort_by_key(|r| input_order.get(&r.string_id).copied().unwrap_or(usize::MAX));
        }
        self.trace.emit(&TraceEvent::StepComplete {
            step: step.to_string(),
            ok_rows: outcome.results.len(),
            failed_rows: outcome.failed_ids.len(),
        });
    }

    /// Shape rows into batches: similar-length grouping first, then
    /// dynamic sizing clamped by the runtime table.
    fn build_batches(
        &self,
        rows: Vec<WorkRow>,
        model: &str,
        content_type: ContentType,
    ) -> Vec<Vec<WorkRow>> {
        let rows = if self.processing.grouping_enabled {
            batching::group_similar_lengths(rows, self.processing.max_length_variance)
                .into_iter()
                .flatten()
                .collect()
        } else {
            rows
        };

        // Models marked batch-unfit get one row per request.
        let max_size = if self.router.batch_capable(model) {
            self.limits.max_batch_size(model, content_type)
        } else {
            1
        };
        let mut batches = Vec::new();
        let mut remaining = rows;
        while !remaining.is_empty() {
            let size = if self.processing.dynamic_sizing {
                let avg_len = remaining
                    .iter()
                    .map(|r| r.source_text.len())
                    .sum::<usize>()
                    / remaining.len();
                let historical = self.latency.lock().ok().and_then(|h| h.median(model));
                batching::dynamic_batch_size(model, avg_len, &self.processing, historical)
                    .min(max_size)
            } else {
                max_size
            };
            let take = size.min(remaining.len());
            let rest = remaining.split_off(take);
            batches.push(std::mem::replace(&mut remaining, rest));
        }
        batches
    }

    /// Process one batch: walk the chain, retry with backoff, emit what
    /// succeeded.
    async fn process_batch(
        &self,
        ctx: &StepContext,
        batch_idx: usize,
        rows: Vec<WorkRow>,
    ) -> BatchOutput {
        let batch_id = format!("{}-{}", ctx.step, batch_idx);
        self.trace.emit(&TraceEvent::BatchStart {
            step: ctx.step.clone(),
            batch_id: batch_id.clone(),
            size: rows.len(),
            model: ctx.chain[0].clone(),
        });

        let mut remaining = rows;
        let mut results: Vec<RowResult> = Vec::new();
        let mut state = BatchState::Pending;
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                state = BatchState::FailedRetryable;
                break;
            }

            match self.try_chain(ctx, &batch_id, &remaining).await {
                Ok((model, map)) => {
                    let mut still_pending = Vec::new();
                    for row in remaining {
                        if let Some(text) = map.get(&row.string_id) {
                            results.push(RowResult {
                                string_id: row.string_id,
                                source_text: row.source_text,
                                text: text.clone(),
                                from_cache: false,
                                model: Some(model.clone()),
                            });
                        } else {
                            still_pending.push(row);
                        }
                    }
                    remaining = still_pending;
                    if remaining.is_empty() {
                        state = BatchState::Ok;
                        break;
                    }
                    // Partial success: emitted rows stand, the rest retry.
                    if attempt >= self.processing.retry {
                        state = BatchState::FailedRetryable;
                        break;
                    }
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    tracing::warn!(
                        batch_id = %batch_id,
                        attempt,
                        error = %e,
                        "batch attempt failed"
                    );
                    if retryable && attempt < self.processing.retry {
                        self.backoff(attempt).await;
                        attempt += 1;
                        continue;
                    }
                    state = if retryable {
                        BatchState::FailedRetryable
                    } else {
                        BatchState::FailedFatal
                    };
                    break;
                }
            }
        }

        let failed_ids: Vec<String> = remaining.into_iter().map(|r| r.string_id).collect();
        self.trace.emit(&TraceEvent::BatchComplete {
            step: ctx.step.clone(),
            batch_id,
            ok_rows: results.len(),
            failed_rows: failed_ids.len(),
        });
        BatchOutput {
            results,
            failed_ids,
            state,
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = Duration::from_secs(1u64 << attempt.min(6));
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Try each model in the chain once for the given rows.
    async fn try_chain(
        &self,
        ctx: &StepContext,
        batch_id: &str,
        rows: &[WorkRow],
    ) -> Result<(String, HashMap<String, String>)> {
        let system = (ctx.system_prompt)(rows);
        let user = (ctx.user_prompt)(rows);
        let params = self.router.generation_params(&ctx.step);
        let router_default = self.router.default_model(&ctx.step);
        let ids: Vec<String> = rows.iter().map(|r| r.string_id.clone()).collect();

        let mut last_err: Option<LocPipeError> = None;
        for (attempt_no, model) in ctx.chain.iter().enumerate() {
            let attempt_no = attempt_no as u32;
            self.cooldown
                .wait(model, self.limits.cooldown_ms(model, ctx.content_type))
                .await;

            let mut request = LlmRequest::new(model.clone(), system.clone(), user.clone());
            if let Some(t) = params.temperature {
                request.temperature = t;
            }
            request.max_tokens = params.max_tokens;
            request.response_format = params.response_format.clone();
            request.timeout = Duration::from_secs(self.limits.timeout_s(model, ctx.content_type));

            let call = self.transport.chat(&request);
            let result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(LocPipeError::Cancelled(format!("batch {}", batch_id)));
                }
                r = call => r,
            };
            self.cooldown.touch(model);

            match result {
                Ok(res) => {
                    if let Ok(mut history) = self.latency.lock() {
                        let tokens = batching::estimate_tokens(&user)
                            + batching::estimate_tokens(&res.text);
                        history.record(model, res.latency_ms, tokens);
                    }
                    self.trace.emit(&TraceEvent::LlmCall {
                        step: ctx.step.clone(),
                        request_id: res.request_id.clone(),
                        model: model.clone(),
                        selected_model: model.clone(),
                        router_default_model: router_default.clone(),
                        fallback_used: attempt_no > 0,
                        attempt_no,
                        latency_ms: res.latency_ms,
                        req_chars: res.req_chars,
                        resp_chars: res.resp_chars,
                        usage_present: res.usage.is_some(),
                        usage: res.usage.clone(),
                        meta: CallMeta {
                            batch_id: Some(batch_id.to_string()),
                            string_ids: ids.clone(),
                            is_batch: true,
                        },
                    });

                    match parse::parse_items(&res.text, &ids, self.processing.partial_match) {
                        Ok(map) => return Ok((model.clone(), map)),
                        Err(e) => {
                            self.emit_llm_error(ctx, model, attempt_no, &e);
                            if (attempt_no as usize) < ctx.chain.len() - 1
                                && self.router.should_fallback(&e)
                            {
                                last_err = Some(e);
                                continue;
                            }
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    self.emit_llm_error(ctx, model, attempt_no, &e);
                    if (attempt_no as usize) < ctx.chain.len() - 1 && self.router.should_fallback(&e)
                    {
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            LocPipeError::Config("model chain exhausted without attempts".to_string())
        }))
    }

    fn emit_llm_error(&self, ctx: &StepContext, model: &str, attempt_no: u32, err: &LocPipeError) {
        let (kind, http_status) = match err {
            LocPipeError::Llm {
                kind, http_status, ..
            } => (kind.as_str().to_string(), *http_status),
            _ => ("other".to_string(), None),
        };
        self.trace.emit(&TraceEvent::LlmError {
            step: ctx.step.clone(),
            kind,
            msg: err.to_string().chars().take(500).collect(),
            selected_model: model.to_string(),
            attempt_no,
            http_status,
        });
    }
}

/// A cached translation is only reusable if its token signature still
/// matches the source and it is non-empty.
fn cached_translation_valid(source: &str, translation: &str) -> bool {
    if translation.trim().is_empty() && !source.trim().is_empty() {
        return false;
    }
    token_signature(source) == token_signature(translation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmErrorKind;
    use crate::transport::LlmResult;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted transport: a closure decides each response, with a call
    /// counter for at-most-once assertions.
    struct FnTransport<F> {
        f: F,
        calls: AtomicUsize,
    }

    impl<F> FnTransport<F>
    where
        F: Fn(&LlmRequest, usize) -> Result<String> + Send + Sync,
    {
        fn new(f: F) -> Self {
            Self {
                f,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<F> LlmTransport for FnTransport<F>
    where
        F: Fn(&LlmRequest, usize) -> Result<String> + Send + Sync,
    {
        async fn chat(&self, request: &LlmRequest) -> Result<LlmResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let text = (self.f)(request, n)?;
            Ok(LlmResult {
                req_chars: request.system.len() + request.user.len(),
                resp_chars: text.len(),
                text,
                latency_ms: 5,
                request_id: Some(format!("req-{}", n)),
                usage: None,
                model: request.model.clone(),
            })
        }
    }

    /// Echo back `{"items": [...]}` translating every requested id.
    fn echo_items(request: &LlmRequest, prefix: &str) -> String {
        let items: Value = serde_json::from_str(&request.user).unwrap();
        let out: Vec<Value> = items
            .as_array()
            .unwrap()
            .iter()
            .map(|item| {
                json!({
                    "id": item["id"],
                    "text": format!("{}{}", prefix, item["id"].as_str().unwrap())
                })
            })
            .collect();
        json!({ "items": out }).to_string()
    }

    fn work_rows(n: usize) -> Vec<WorkRow> {
        (0..n)
            .map(|i| WorkRow {
                string_id: format!("row-{:03}", i),
                source_text: format!("source text number {}", i),
                max_length_target: None,
                is_long_text: false,
            })
            .collect()
    }

    fn prompt_builders() -> (PromptBuilder, PromptBuilder) {
        let system: PromptBuilder = Arc::new(|_rows: &[WorkRow]| "translate".to_string());
        let user: PromptBuilder = Arc::new(|rows: &[WorkRow]| {
            let items: Vec<Value> = rows
                .iter()
                .map(|r| json!({"id": r.string_id, "source_text": r.source_text}))
                .collect();
            serde_json::to_string(&items).unwrap()
        });
        (system, user)
    }

    fn scheduler_with(
        transport: Arc<dyn LlmTransport>,
        router: Arc<ModelRouter>,
        cache: Option<Arc<CacheStore>>,
    ) -> Arc<BatchScheduler> {
        let mut processing = ProcessingConfig::default();
        processing.retry = 0;
        Arc::new(BatchScheduler::new(
            transport,
            router,
            cache,
            Arc::new(TraceSink::disabled()),
            processing,
            BatchRuntimeConfig::default(),
            Some("env-model".to_string()),
            "digest".to_string(),
            CancellationToken::new(),
        ))
    }

    fn request(step: &str, rows: Vec<WorkRow>) -> StepRequest {
        let (system, user) = prompt_builders();
        StepRequest {
            step: step.to_string(),
            rows,
            system_prompt: system,
            user_prompt: user,
            model_override: None,
            checkpoint_path: None,
        }
    }

    #[tokio::test]
    async fn test_all_rows_translated_in_order() {
        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, _| Ok(echo_items(req, "tr-"))));
        let scheduler = scheduler_with(transport, Arc::new(ModelRouter::disabled()), None);

        let outcome = scheduler.run_step(request("translate", work_rows(25))).await.unwrap();
        assert_eq!(outcome.results.len(), 25);
        assert!(outcome.failed_ids.is_empty());
        // preserve_order: results follow input order even with 4 workers.
        for (i, result) in outcome.results.iter().enumerate() {
            assert_eq!(result.string_id, format!("row-{:03}", i));
            assert_eq!(result.text, format!("tr-row-{:03}", i));
            assert!(!result.from_cache);
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_llm_entirely() {
        let cache = Arc::new(CacheStore::in_memory().unwrap());
        cache.set("source text number 0", "digest", "env-model", "cached!");

        let transport = Arc::new(FnTransport::new(|_: &LlmRequest, _| -> Result<String> {
            panic!("transport must not be called on a full cache hit");
        }));
        let call_probe = Arc::clone(&transport);
        let scheduler = scheduler_with(transport, Arc::new(ModelRouter::disabled()), Some(cache));

        let outcome = scheduler.run_step(request("translate", work_rows(1))).await.unwrap();
        assert_eq!(outcome.cache_hits, 1);
        assert_eq!(outcome.llm_rows, 0);
        assert_eq!(outcome.results[0].text, "cached!");
        assert!(outcome.results[0].from_cache);
        assert_eq!(call_probe.call_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_rows_written_back_to_cache() {
        let cache = Arc::new(CacheStore::in_memory().unwrap());
        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, _| Ok(echo_items(req, "tr-"))));
        let scheduler =
            scheduler_with(transport, Arc::new(ModelRouter::disabled()), Some(Arc::clone(&cache)));

        scheduler.run_step(request("translate", work_rows(2))).await.unwrap();

        let (hit, value) = cache.get("source text number 1", "digest", "env-model");
        assert!(hit);
        assert_eq!(value.as_deref(), Some("tr-row-001"));
    }

    #[tokio::test]
    async fn test_fallback_on_429() {
        let router = Arc::new(
            ModelRouter::from_yaml(
                r#"
routing:
  translate:
    default: model-a
    fallback: [model-b]
fallback_triggers:
  http_codes: [429]
"#,
            )
            .unwrap(),
        );
        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, _| {
            if req.model == "model-a" {
                Err(LocPipeError::llm(LlmErrorKind::Upstream, "HTTP 429", Some(429)))
            } else {
                Ok(echo_items(req, "fb-"))
            }
        }));

        let tmp = tempfile::TempDir::new().unwrap();
        let trace_path = tmp.path().join("trace.jsonl");
        let mut processing = ProcessingConfig::default();
        processing.retry = 0;
        let scheduler = Arc::new(BatchScheduler::new(
            transport,
            router,
            None,
            Arc::new(TraceSink::new(&trace_path)),
            processing,
            BatchRuntimeConfig::default(),
            None,
            "digest".to_string(),
            CancellationToken::new(),
        ));

        let outcome = scheduler.run_step(request("translate", work_rows(1))).await.unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].model.as_deref(), Some("model-b"));

        let events = crate::trace::read_events(&trace_path).unwrap();
        let error_event = events.iter().find(|e| e["type"] == "llm_error").unwrap();
        assert_eq!(error_event["kind"], "upstream");
        assert_eq!(error_event["http_status"], 429);
        let call_event = events.iter().find(|e| e["type"] == "llm_call").unwrap();
        assert_eq!(call_event["selected_model"], "model-b");
        assert_eq!(call_event["fallback_used"], true);
    }

    #[tokio::test]
    async fn test_http_4xx_fails_batch_without_retry() {
        let transport = Arc::new(FnTransport::new(|_: &LlmRequest, _| -> Result<String> {
            Err(LocPipeError::llm(LlmErrorKind::Http, "HTTP 403", Some(403)))
        }));
        let probe = Arc::clone(&transport);
        let scheduler = scheduler_with(transport, Arc::new(ModelRouter::disabled()), None);

        let outcome = scheduler.run_step(request("translate", work_rows(3))).await.unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.failed_ids.len(), 3);
        // Non-retryable: exactly one attempt for the single batch.
        assert_eq!(probe.call_count(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_retries_batch() {
        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, n| {
            if n == 0 {
                Ok("this is not json".to_string())
            } else {
                Ok(echo_items(req, "tr-"))
            }
        }));
        let probe = Arc::clone(&transport);

        let mut processing = ProcessingConfig::default();
        processing.retry = 1;
        let scheduler = Arc::new(BatchScheduler::new(
            transport,
            Arc::new(ModelRouter::disabled()),
            None,
            Arc::new(TraceSink::disabled()),
            processing,
            BatchRuntimeConfig::default(),
            Some("env-model".to_string()),
            "digest".to_string(),
            CancellationToken::new(),
        ));

        let outcome = scheduler.run_step(request("translate", work_rows(2))).await.unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(probe.call_count(), 2);
    }

    #[tokio::test]
    async fn test_checkpoint_resume_skips_done_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cp_path = tmp.path().join("cp.json");

        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, _| Ok(echo_items(req, "tr-"))));
        let probe = Arc::clone(&transport);
        let scheduler = scheduler_with(transport, Arc::new(ModelRouter::disabled()), None);

        let mut req1 = request("translate", work_rows(5));
        req1.checkpoint_path = Some(cp_path.clone());
        scheduler.run_step(req1).await.unwrap();
        let first_calls = probe.call_count();
        assert!(first_calls >= 1);

        // Second run: everything is checkpointed, zero LLM calls.
        let mut req2 = request("translate", work_rows(5));
        req2.checkpoint_path = Some(cp_path);
        let outcome = scheduler.run_step(req2).await.unwrap();
        assert_eq!(probe.call_count(), first_calls);
        assert!(outcome.results.is_empty());
        assert!(outcome.failed_ids.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_before_run_yields_no_calls() {
        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, _| Ok(echo_items(req, "tr-"))));
        let probe = Arc::clone(&transport);
        let scheduler = scheduler_with(transport, Arc::new(ModelRouter::disabled()), None);
        scheduler.cancellation_token().cancel();

        let outcome = scheduler.run_step(request("translate", work_rows(4))).await.unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.results.is_empty());
        assert_eq!(probe.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_chain_is_config_error() {
        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, _| Ok(echo_items(req, "tr-"))));
        let scheduler = Arc::new(BatchScheduler::new(
            transport,
            Arc::new(ModelRouter::disabled()),
            None,
            Arc::new(TraceSink::disabled()),
            ProcessingConfig::default(),
            BatchRuntimeConfig::default(),
            None, // no env default either
            "digest".to_string(),
            CancellationToken::new(),
        ));

        let err = scheduler.run_step(request("translate", work_rows(1))).await.unwrap_err();
        assert!(matches!(err, LocPipeError::Config(_)));
    }

    #[tokio::test]
    async fn test_long_text_rows_shrink_batches() {
        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, _| Ok(echo_items(req, "tr-"))));
        let probe = Arc::clone(&transport);
        let scheduler = scheduler_with(transport, Arc::new(ModelRouter::disabled()), None);

        let mut rows = work_rows(6);
        rows[0].is_long_text = true;
        let outcome = scheduler.run_step(request("translate", rows)).await.unwrap();
        assert_eq!(outcome.results.len(), 6);
        // long_text caps batches at 3, so at least two calls were needed.
        assert!(probe.call_count() >= 2);
    }

    #[tokio::test]
    async fn test_batch_unfit_model_gets_single_row_batches() {
        let router = Arc::new(
            ModelRouter::from_yaml(
                r#"
routing:
  translate:
    default: model-reasoner
capabilities:
  model-reasoner:
    batch: unfit
"#,
            )
            .unwrap(),
        );
        let transport = Arc::new(FnTransport::new(|req: &LlmRequest, _| Ok(echo_items(req, "tr-"))));
        let probe = Arc::clone(&transport);
        let scheduler = scheduler_with(transport, router, None);

        let outcome = scheduler.run_step(request("translate", work_rows(3))).await.unwrap();
        assert_eq!(outcome.results.len(), 3);
        // One call per row for a batch-unfit model.
        assert_eq!(probe.call_count(), 3);
    }

    #[test]
    fn test_cached_translation_valid() {
        assert!(cached_translation_valid("⟦PH_1⟧ hi", "⟦PH_1⟧ привет"));
        assert!(!cached_translation_valid("⟦PH_1⟧ hi", "привет"));
        assert!(!cached_translation_valid("hi", "  "));
        assert!(cached_translation_valid("", ""));
    }

    #[test]
    fn test_batch_state_transitions_exist() {
        // The enum mirrors the batch lifecycle used in process_batch.
        let states = [
            BatchState::Pending,
            BatchState::InFlight,
            BatchState::Ok,
            BatchState::FailedRetryable,
            BatchState::FailedFatal,
        ];
        assert_eq!(states.len(), 5);
    }
}
