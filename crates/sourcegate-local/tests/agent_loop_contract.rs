use sourcegate_core::{
    Decision, DecisionEngine, Error, FetchBackend, FetchRequest, Message, Mode, PageSnapshot,
    PageVerdict, RejectReason, RenderBackend, Result, Role, RunRequest, RunStatus, SearchProvider,
    SearchQuery, SearchResponse, SearchResult, ToolCall, ToolSpec, Verification,
};
use sourcegate_local::dispatch::{DispatchConfig, ToolDispatcher};
use sourcegate_local::extract::{html_title, html_to_text};
use sourcegate_local::{AgentLoop, FsCache, REMOVED_URL_MARKER};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct ScriptedEngine {
    script: Mutex<VecDeque<Result<Decision>>>,
    seen: Mutex<Vec<Vec<Message>>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedEngine {
    fn new(script: Vec<Result<Decision>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
        })
    }

    fn rounds(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn conversation(&self, round: usize) -> Vec<Message> {
        self.seen.lock().unwrap()[round].clone()
    }
}

#[async_trait::async_trait]
impl DecisionEngine for ScriptedEngine {
    async fn decide(&self, conversation: &[Message], tools: &[ToolSpec]) -> Result<Decision> {
        self.seen.lock().unwrap().push(conversation.to_vec());
        self.offered
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Decision::Final("(script exhausted)".to_string())))
    }
}

#[derive(Default)]
struct FakeWeb {
    pages: BTreeMap<String, (u16, String)>,
    calls: Mutex<Vec<String>>,
}

impl FakeWeb {
    fn with(mut self, url: &str, status: u16, html: &str) -> Self {
        self.pages.insert(url.to_string(), (status, html.to_string()));
        self
    }

    fn calls_for(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl FetchBackend for FakeWeb {
    async fn fetch(&self, req: &FetchRequest) -> Result<PageSnapshot> {
        self.calls.lock().unwrap().push(req.url.clone());
        let Some((status, html)) = self.pages.get(&req.url) else {
            return Err(Error::Fetch(format!("connection refused: {}", req.url)));
        };
        Ok(PageSnapshot {
            url: req.url.clone(),
            final_url: req.url.clone(),
            status: *status,
            title: html_title(html),
            text: html_to_text(html, 120),
            html: html.clone(),
            error: None,
            timings_ms: BTreeMap::new(),
        })
    }
}

struct NoRenderer;

#[async_trait::async_trait]
impl RenderBackend for NoRenderer {
    async fn render(&self, _req: &FetchRequest) -> Result<PageSnapshot> {
        Err(Error::NotConfigured("no browser in tests".to_string()))
    }
}

struct FixedSearch {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl SearchProvider for FixedSearch {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn search(&self, _q: &SearchQuery) -> Result<SearchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SearchResponse {
            results: vec![SearchResult {
                url: "https://shop.example/category/boots".to_string(),
                title: Some("Boots".to_string()),
                snippet: Some("All boots".to_string()),
                source: "fixed".to_string(),
            }],
            provider: "fixed".to_string(),
            timings_ms: BTreeMap::new(),
        })
    }
}

fn agent(
    engine: Arc<ScriptedEngine>,
    web: Arc<FakeWeb>,
    cache: Option<FsCache>,
) -> AgentLoop {
    let dispatcher = ToolDispatcher::new(
        Arc::new(FixedSearch {
            calls: AtomicUsize::new(0),
        }),
        web,
        Arc::new(NoRenderer),
        cache,
        DispatchConfig::default(),
    );
    AgentLoop::new(engine, dispatcher)
}

fn call(id: &str, name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: args.to_string(),
    }
}

fn fetch(id: &str, url: &str) -> ToolCall {
    call(id, "fetch_url", serde_json::json!({ "url": url }))
}

fn tools(calls: Vec<ToolCall>) -> Result<Decision> {
    Ok(Decision::ToolCalls { text: None, calls })
}

fn final_text(s: &str) -> Result<Decision> {
    Ok(Decision::Final(s.to_string()))
}

fn product_page(name: &str) -> String {
    format!(
        r#"<html><head><title>{name}</title>
        <script type="application/ld+json">{{"@type":"Product","name":"{name}","offers":{{"price":"120.00"}}}}</script>
        </head><body><h1>{name}</h1><p>Full grain leather, hand stitched.</p></body></html>"#
    )
}

fn listing_with_five_products() -> String {
    let items: Vec<String> = (1..=5)
        .map(|i| format!(r#"{{"@type":"Product","name":"Boot {i}"}}"#))
        .collect();
    format!(
        r#"<html><head><title>Boots</title>
        <script type="application/ld+json">{{"@context":"https://schema.org","@graph":[{}]}}</script>
        </head><body><h1>Boots</h1><p>Five boots in stock.</p></body></html>"#,
        items.join(",")
    )
}

const LISTING: &str = "https://shop.example/category/boots";

#[tokio::test]
async fn final_reply_without_tools_ends_in_one_round() {
    let engine = ScriptedEngine::new(vec![final_text("Nothing to look up.")]);
    let web = Arc::new(FakeWeb::default());
    let resp = agent(engine.clone(), web.clone(), None)
        .run(&RunRequest::new("hello"))
        .await;

    assert_eq!(resp.status, RunStatus::Done);
    assert_eq!(resp.steps, 1);
    assert_eq!(resp.answer, "Nothing to look up.");
    assert!(resp.sources.is_empty());
    assert!(resp.debug.is_none());
    assert_eq!(engine.rounds(), 1);
    assert_eq!(web.total_calls(), 0);

    let first = engine.conversation(0);
    assert_eq!(first[0].role, Role::System);
    assert_eq!(first[1].content.as_deref(), Some("hello"));
}

#[tokio::test]
async fn listing_with_structured_products_is_verified() {
    let engine = ScriptedEngine::new(vec![
        tools(vec![fetch("c1", LISTING)]),
        final_text(&format!("Boots are listed at {LISTING}.")),
    ]);
    let web = Arc::new(FakeWeb::default().with(LISTING, 200, &listing_with_five_products()));
    let mut req = RunRequest::new("find boots");
    req.debug = true;
    let resp = agent(engine.clone(), web, None).run(&req).await;

    assert_eq!(resp.status, RunStatus::Done);
    assert_eq!(resp.steps, 2);
    assert_eq!(resp.answer, format!("Boots are listed at {LISTING}."));
    assert_eq!(resp.sources.len(), 1);
    assert_eq!(resp.sources[0].url, LISTING);
    assert_eq!(resp.sources[0].title, "Boots");

    let trace = resp.debug.expect("debug trace requested");
    assert_eq!(trace.len(), 1);
    assert_eq!(trace[0].step, 1);
    assert_eq!(trace[0].tool, "fetch_url");
    assert_eq!(trace[0].verdict, Some(PageVerdict::ListingWithProducts));
    assert!(trace[0].outcome.as_ref().is_some_and(|o| o.is_accepted()));

    let second = engine.conversation(1);
    let tool_msg = second.last().unwrap();
    assert_eq!(tool_msg.role, Role::Tool);
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
    assert!(tool_msg
        .content
        .as_deref()
        .unwrap()
        .contains("verified: listing_with_products, 5 products"));
}

#[tokio::test]
async fn http_403_is_rejected_whatever_the_body() {
    let url = "https://shop.example/p/blocked-boot";
    let engine = ScriptedEngine::new(vec![
        tools(vec![fetch("c1", url)]),
        final_text(&format!("Try {url}")),
    ]);
    let web = Arc::new(FakeWeb::default().with(url, 403, &product_page("Blocked Boot")));
    let mut req = RunRequest::new("find boots");
    req.debug = true;
    let resp = agent(engine.clone(), web, None).run(&req).await;

    assert!(resp.sources.is_empty());
    assert_eq!(resp.answer, format!("Try {REMOVED_URL_MARKER}"));
    let trace = resp.debug.unwrap();
    assert_eq!(
        trace[0].outcome,
        Some(Verification::Rejected {
            reason: RejectReason::HttpError(403)
        })
    );
    let tool_msg = engine.conversation(1).last().unwrap().clone();
    assert!(tool_msg.content.unwrap().contains("http_error:403"));
}

#[tokio::test]
async fn unattempted_urls_are_removed_from_the_answer() {
    let engine = ScriptedEngine::new(vec![final_text(
        "See https://evil.example/deal?id=1. Also https://other.example/x",
    )]);
    let resp = agent(engine, Arc::new(FakeWeb::default()), None)
        .run(&RunRequest::new("deals"))
        .await;
    assert_eq!(
        resp.answer,
        format!("See {REMOVED_URL_MARKER}. Also {REMOVED_URL_MARKER}")
    );
}

#[tokio::test]
async fn same_host_citations_are_swapped_for_the_verified_page() {
    let url = "https://shop.example/p/trail-boot";
    let engine = ScriptedEngine::new(vec![
        tools(vec![fetch("c1", url)]),
        final_text("Buy at https://shop.example/p/trail-boot-xl"),
    ]);
    let web = Arc::new(FakeWeb::default().with(url, 200, &product_page("Trail Boot")));
    let resp = agent(engine, web, None)
        .run(&RunRequest::new("boots"))
        .await;
    assert_eq!(resp.answer, format!("Buy at {url}"));
}

#[tokio::test]
async fn page_budget_triggers_one_nudge_then_stops() {
    let a = "https://shop.example/p/a";
    let b = "https://shop.example/p/b";
    let c = "https://shop.example/p/c";
    let engine = ScriptedEngine::new(vec![
        tools(vec![fetch("1", a), fetch("2", b)]),
        tools(vec![fetch("3", c)]),
        tools(vec![fetch("4", c)]),
    ]);
    let web = Arc::new(
        FakeWeb::default()
            .with(a, 200, &product_page("A"))
            .with(b, 200, &product_page("B"))
            .with(c, 200, &product_page("C")),
    );
    let mut req = RunRequest::new("boots");
    req.max_pages_fetched = 2;
    let resp = agent(engine.clone(), web.clone(), None).run(&req).await;

    assert_eq!(resp.status, RunStatus::LimitReached);
    assert_eq!(resp.steps, 2);
    assert_eq!(engine.rounds(), 2);
    assert_eq!(web.calls_for(c), 0);
    assert!(resp.answer.contains("2 verified source(s)"), "{}", resp.answer);
    assert_eq!(resp.sources.len(), 2);

    let nudges = engine
        .conversation(1)
        .iter()
        .filter(|m| m.role == Role::System)
        .filter(|m| m.content.as_deref().unwrap_or("").contains("Page budget reached"))
        .count();
    assert_eq!(nudges, 1);
}

#[tokio::test]
async fn final_answer_after_nudge_is_accepted() {
    let a = "https://shop.example/p/a";
    let engine = ScriptedEngine::new(vec![
        tools(vec![fetch("1", a)]),
        final_text(&format!("Found {a}")),
    ]);
    let web = Arc::new(FakeWeb::default().with(a, 200, &product_page("A")));
    let mut req = RunRequest::new("boots");
    req.max_pages_fetched = 1;
    let resp = agent(engine, web, None).run(&req).await;
    assert_eq!(resp.status, RunStatus::Done);
    assert_eq!(resp.answer, format!("Found {a}"));
}

#[tokio::test]
async fn engine_failure_is_a_terminal_answer_with_gathered_sources() {
    let a = "https://shop.example/p/a";
    let engine = ScriptedEngine::new(vec![
        tools(vec![fetch("1", a)]),
        Err(Error::Decision("upstream 502".to_string())),
    ]);
    let web = Arc::new(FakeWeb::default().with(a, 200, &product_page("A")));
    let resp = agent(engine, web, None)
        .run(&RunRequest::new("boots"))
        .await;

    assert_eq!(resp.status, RunStatus::DecisionFailed);
    assert!(resp.answer.contains("upstream 502"));
    assert!(resp.answer.contains(a));
    assert_eq!(resp.sources.len(), 1);
}

#[tokio::test]
async fn step_limit_salvages_last_assistant_text() {
    let search = |id: &str| call(id, "search_web", serde_json::json!({"query": "boots"}));
    let engine = ScriptedEngine::new(vec![
        Ok(Decision::ToolCalls {
            text: Some("Looking for boots.".to_string()),
            calls: vec![search("1")],
        }),
        tools(vec![search("2")]),
        tools(vec![search("3")]),
    ]);
    let mut req = RunRequest::new("boots");
    req.max_steps = 2;
    let resp = agent(engine.clone(), Arc::new(FakeWeb::default()), None)
        .run(&req)
        .await;

    assert_eq!(resp.status, RunStatus::LimitReached);
    assert_eq!(resp.steps, 2);
    assert_eq!(engine.rounds(), 2);
    assert_eq!(resp.answer, "[Note: Reached step limit] Looking for boots.");
}

#[tokio::test]
async fn malformed_arguments_and_duplicate_ids_are_recovered() {
    let engine = ScriptedEngine::new(vec![
        tools(vec![
            ToolCall {
                id: "x".to_string(),
                name: "fetch_url".to_string(),
                arguments: "{\"url\": ".to_string(),
            },
            ToolCall {
                id: "x".to_string(),
                name: "search_web".to_string(),
                arguments: r#"{"query":"boots"}"#.to_string(),
            },
        ]),
        final_text("ok"),
    ]);
    let resp = agent(engine.clone(), Arc::new(FakeWeb::default()), None)
        .run(&RunRequest::new("boots"))
        .await;
    assert_eq!(resp.status, RunStatus::Done);

    let convo = engine.conversation(1);
    let tool_msgs: Vec<&Message> = convo.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_msgs.len(), 2);
    assert_ne!(tool_msgs[0].tool_call_id, tool_msgs[1].tool_call_id);
    assert!(tool_msgs[0].content.as_deref().unwrap().starts_with("Error:"));
    assert!(tool_msgs[1]
        .content
        .as_deref()
        .unwrap()
        .starts_with("Found 1 search results:"));

    let assistant = convo.iter().find(|m| m.role == Role::Assistant).unwrap();
    let ids: Vec<Option<&str>> = assistant
        .tool_calls
        .iter()
        .map(|c| Some(c.id.as_str()))
        .collect();
    assert_eq!(
        ids,
        tool_msgs
            .iter()
            .map(|m| m.tool_call_id.as_deref())
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn mode_limits_offered_tools() {
    let engine = ScriptedEngine::new(vec![
        tools(vec![fetch("1", "https://shop.example/p/a")]),
        final_text("done"),
    ]);
    let web = Arc::new(FakeWeb::default());
    let mut req = RunRequest::new("boots");
    req.mode = Mode::Browser;
    agent(engine.clone(), web.clone(), None).run(&req).await;

    let offered = engine.offered.lock().unwrap()[0].clone();
    assert_eq!(offered, vec!["search_web", "render_url"]);
    assert_eq!(web.total_calls(), 0);
}

#[tokio::test]
async fn cached_page_is_fetched_once_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let url = "https://shop.example/p/a";
    let web = Arc::new(FakeWeb::default().with(url, 200, &product_page("A")));

    for _ in 0..2 {
        let engine = ScriptedEngine::new(vec![
            tools(vec![fetch("1", url)]),
            final_text(&format!("See {url}")),
        ]);
        let cache = FsCache::new(dir.path().to_path_buf());
        let resp = agent(engine, web.clone(), Some(cache))
            .run(&RunRequest::new("boots"))
            .await;
        assert_eq!(resp.sources.len(), 1);
        assert_eq!(resp.answer, format!("See {url}"));
    }
    assert_eq!(web.calls_for(url), 1);
}

#[tokio::test]
async fn sources_are_always_verified_pages() {
    let good = "https://shop.example/p/good";
    let bad = "https://shop.example/p/bad";
    let engine = ScriptedEngine::new(vec![
        tools(vec![
            fetch("1", good),
            fetch("2", bad),
            fetch("3", "https://down.example/p/x"),
        ]),
        final_text(&format!("{good} {bad}")),
    ]);
    let web = Arc::new(
        FakeWeb::default()
            .with(good, 200, &product_page("Good"))
            .with(bad, 500, &product_page("Bad")),
    );
    let mut req = RunRequest::new("boots");
    req.debug = true;
    let resp = agent(engine, web, None).run(&req).await;

    let urls: Vec<&str> = resp.sources.iter().map(|s| s.url.as_str()).collect();
    assert_eq!(urls, vec![good]);
    // The rejected URL shares a host with the verified one and is swapped for it.
    assert_eq!(resp.answer, format!("{good} {good}"));
    let outcomes: Vec<bool> = resp
        .debug
        .unwrap()
        .iter()
        .map(|t| t.outcome.as_ref().is_some_and(|o| o.is_accepted()))
        .collect();
    assert_eq!(outcomes, vec![true, false, false]);
}
