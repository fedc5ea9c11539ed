//! The bounded decide/act loop.
//!
//! Each round asks the decision engine for the next move. Tool calls run one at a time,
//! in the order the engine listed them, and each result is appended under its call id
//! before the next round. The run ends on a final answer, on an engine failure, or when a
//! step or page limit is hit. The answer is always sanitized against the run's
//! provenance before it leaves.

use crate::cache::FsCache;
use crate::config::Settings;
use crate::dispatch::{tool_specs, DispatchConfig, ToolDispatcher};
use crate::openai_compat::OpenAiCompatClient;
use crate::provenance::Provenance;
use crate::render_playwright::PlaywrightRenderer;
use crate::sanitize::sanitize_answer;
use crate::search::{BraveSearchProvider, RetryingSearch, UnconfiguredSearch};
use crate::LocalFetcher;
use sourcegate_core::{
    Conversation, Decision, DecisionEngine, Mode, Result, RunRequest, RunResponse, RunStatus,
    SearchProvider, StepTrace, ToolCall, ToolResult,
};
use std::sync::Arc;

const STEP_LIMIT_NOTE: &str = "[Note: Reached step limit]";
const PAGE_LIMIT_NOTE: &str = "[Note: Reached page limit]";

const SYSTEM_PROMPT: &str = "You are a research assistant. Answer the user's request using web \
pages retrieved with your tools during this session.

How to work:
- Use search_web to find candidate pages. Search results are NOT verified.
- Retrieve a candidate page before relying on it. Each page result says whether the page was \
verified or rejected, and why.
- Listing pages come with product candidate links. Retrieve individual candidates to verify them.
- A rejected page (blocked, empty listing, generic landing page, HTTP error) must not be cited. \
Try another page instead.
- Stop calling tools as soon as you have enough verified pages, and write the answer.

Rules:
- Cite only URLs that a tool result reported as verified, exactly as the tool returned them.
- Never invent, guess or edit URLs. Unverified URLs are removed from your answer.
- Be concise. If nothing could be verified, say so.";

fn mode_hint(mode: Mode) -> &'static str {
    match mode {
        Mode::Auto => "Available tools: search_web, fetch_url, render_url. Prefer fetch_url; \
                       use render_url for pages that need JavaScript.",
        Mode::Search => "Available tools: search_web, fetch_url.",
        Mode::Browser => "Available tools: search_web, render_url. Pages are rendered in a \
                          headless browser.",
    }
}

pub fn system_prompt(mode: Mode) -> String {
    format!("{SYSTEM_PROMPT}\n\n{}", mode_hint(mode))
}

fn finalize_nudge(max_pages: usize) -> String {
    format!(
        "Page budget reached ({max_pages} pages). Do not call any more tools. Write your final \
         answer now using only the verified pages."
    )
}

/// Answer used when the run stops without a final reply from the engine.
fn salvage(convo: &Conversation, provenance: &Provenance, note: &str) -> String {
    if let Some(text) = convo.last_assistant_text() {
        return format!("{note} {text}");
    }
    fallback_summary(provenance)
}

/// Summary built from verified pages alone.
pub fn fallback_summary(provenance: &Provenance) -> String {
    let verified = provenance.verified();
    if verified.is_empty() {
        return "I reached the limit before finding any verified sources. Try a different query \
                or allow more steps."
            .to_string();
    }
    let mut out = format!(
        "I found {} verified source(s) before reaching the limit:\n\n",
        verified.len()
    );
    for m in verified {
        out.push_str(&format!("- {}: {}\n", m.title, m.url));
    }
    out
}

fn trace_entry(step: usize, call: &ToolCall, result: &ToolResult) -> StepTrace {
    StepTrace {
        step,
        tool: call.name.clone(),
        args: serde_json::from_str(&call.arguments)
            .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone())),
        success: result.success,
        result_chars: result.content.chars().count(),
        url: result.url.clone(),
        verdict: result.verdict,
        outcome: result.verification.clone(),
    }
}

pub struct AgentLoop {
    engine: Arc<dyn DecisionEngine>,
    dispatcher: ToolDispatcher,
}

impl AgentLoop {
    pub fn new(engine: Arc<dyn DecisionEngine>, dispatcher: ToolDispatcher) -> Self {
        Self { engine, dispatcher }
    }

    /// Wire the production collaborators from settings.
    ///
    /// Missing API keys are not an error here; the affected collaborator reports
    /// `NotConfigured` when it is first used.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let fetcher = LocalFetcher::new(settings.fetch_timeout)?;
        let client = fetcher.client().clone();

        let search: Arc<dyn SearchProvider> = match BraveSearchProvider::from_env(client.clone()) {
            Ok(brave) => Arc::new(RetryingSearch::new(brave, settings.search_retry)),
            Err(e) => {
                tracing::debug!("search disabled: {e}");
                Arc::new(UnconfiguredSearch::new(e.to_string()))
            }
        };
        let renderer = PlaywrightRenderer::from_env(settings.render_timeout);
        let cache = settings.cache_enabled.then(|| {
            FsCache::with_ttls(settings.cache_dir.clone(), settings.cache_ttls)
        });
        let dispatcher = ToolDispatcher::new(
            search,
            Arc::new(fetcher),
            Arc::new(renderer),
            cache,
            DispatchConfig::from_settings(settings),
        );
        let engine = OpenAiCompatClient::new(client, &settings.llm);
        Ok(Self::new(Arc::new(engine), dispatcher))
    }

    /// Run one request to completion. Never fails; every problem ends up in the answer.
    pub async fn run(&self, req: &RunRequest) -> RunResponse {
        let max_steps = req.effective_max_steps();
        let max_pages = req.effective_max_pages();
        let mode = req.mode;
        let tools = tool_specs(mode);

        let mut convo = Conversation::new(system_prompt(mode), req.prompt.clone());
        let mut provenance = Provenance::new();
        let mut trace: Vec<StepTrace> = Vec::new();
        let mut nudged = false;
        let mut steps = 0usize;

        let (answer, status) = loop {
            if steps >= max_steps {
                tracing::warn!(max_steps, "step limit reached");
                break (
                    salvage(&convo, &provenance, STEP_LIMIT_NOTE),
                    RunStatus::LimitReached,
                );
            }
            steps += 1;
            tracing::info!(step = steps, max_steps, mode = mode.as_str(), "deciding");

            let decision = match self.engine.decide(convo.messages(), &tools).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::error!(step = steps, "decision engine failed: {e}");
                    let mut answer =
                        format!("I could not finish this request: the decision engine failed ({e}).");
                    if !provenance.verified().is_empty() {
                        answer.push_str("\n\n");
                        answer.push_str(&fallback_summary(&provenance));
                    }
                    break (answer, RunStatus::DecisionFailed);
                }
            };

            let (text, calls) = match decision {
                Decision::Final(text) => {
                    tracing::info!(step = steps, chars = text.len(), "final answer");
                    break (text, RunStatus::Done);
                }
                Decision::ToolCalls { text, calls } => (text, calls),
            };

            if nudged {
                // The one round granted after the finalize request does not act.
                tracing::warn!(
                    step = steps,
                    ignored_calls = calls.len(),
                    "tool calls after finalize request"
                );
                match text.filter(|t| !t.trim().is_empty()) {
                    Some(t) => break (t, RunStatus::LimitReached),
                    None => {
                        break (
                            salvage(&convo, &provenance, PAGE_LIMIT_NOTE),
                            RunStatus::LimitReached,
                        )
                    }
                }
            }

            let calls = convo.push_tool_calls(text, calls);
            for call in &calls {
                tracing::info!(step = steps, tool = %call.name, id = %call.id, "tool call");
                let result = self
                    .dispatcher
                    .execute(call, mode, &mut provenance, max_pages)
                    .await;
                trace.push(trace_entry(steps, call, &result));
                convo.push_tool_result(&call.id, result.content);
            }

            if provenance.attempted_count() >= max_pages {
                tracing::warn!(max_pages, "page budget reached; asking for a final answer");
                convo.push_system(finalize_nudge(max_pages));
                nudged = true;
            }
        };

        let sanitized = sanitize_answer(&answer, provenance.verified());
        if sanitized.removed > 0 || sanitized.substituted > 0 {
            tracing::info!(
                kept = sanitized.kept,
                substituted = sanitized.substituted,
                removed = sanitized.removed,
                "answer urls rewritten"
            );
        }

        RunResponse {
            answer: sanitized.text,
            sources: provenance.sources(),
            status,
            steps,
            debug: req.debug.then_some(trace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sourcegate_core::{PageVerdict, VerifiedMeta};

    #[test]
    fn system_prompt_names_the_mode_tools() {
        let p = system_prompt(Mode::Browser);
        assert!(p.contains("Never invent"));
        assert!(p.ends_with(mode_hint(Mode::Browser)));
        assert!(!mode_hint(Mode::Search).contains("render_url"));
    }

    #[test]
    fn fallback_lists_verified_pages() {
        let mut prov = Provenance::new();
        assert!(fallback_summary(&prov).contains("before finding any verified sources"));

        prov.record_verified(
            "https://shop.example/p/1",
            VerifiedMeta {
                url: "https://shop.example/p/1".to_string(),
                title: "Boot".to_string(),
                verdict: PageVerdict::Product,
                product_count: 1,
                reason: "product".to_string(),
            },
        );
        let s = fallback_summary(&prov);
        assert!(s.starts_with("I found 1 verified source(s)"));
        assert!(s.contains("- Boot: https://shop.example/p/1"));
    }

    #[test]
    fn salvage_prefers_last_assistant_text() {
        let mut convo = Conversation::new("sys", "q");
        convo.push_assistant_text("Partial findings.");
        let s = salvage(&convo, &Provenance::new(), STEP_LIMIT_NOTE);
        assert_eq!(s, "[Note: Reached step limit] Partial findings.");
    }

    #[test]
    fn trace_keeps_unparsable_arguments_as_text() {
        let call = ToolCall {
            id: "c".to_string(),
            name: "fetch_url".to_string(),
            arguments: "{oops".to_string(),
        };
        let t = trace_entry(2, &call, &ToolResult::failure("Error: bad"));
        assert_eq!(t.args, serde_json::Value::String("{oops".to_string()));
        assert_eq!(t.result_chars, "Error: bad".len());
        assert!(!t.success);
    }
}
