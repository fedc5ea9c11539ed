use crate::config::{env, env_flag};
use crate::extract::{html_title, html_to_text};
use sourcegate_core::{Error, FetchRequest, PageSnapshot, RenderBackend, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const HARD_TIMEOUT_GRACE_MS: u64 = 10_000;
const DEFAULT_MAX_HTML_CHARS: usize = 2_000_000;

// stdout is JSON-only; args arrive on stdin. One fresh browser and context per call.
const JS: &str = r#"
const fs = require('fs');

function ok(obj) { process.stdout.write(JSON.stringify(obj)); }
function bad(code, message) { ok({ ok: false, error: { code, message } }); }

async function main() {
  let arg = '';
  try { arg = fs.readFileSync(0, 'utf8'); } catch (_) {}
  let req;
  try { req = JSON.parse(arg); } catch (e) { return bad('invalid_params', 'bad JSON args'); }

  let pw;
  try { pw = require('playwright'); } catch (e) {
    return bad('not_configured',
      'Playwright is not installed for Node.js; run `npm i -g playwright` and `npx playwright install chromium`');
  }

  const url = String(req.url || '').trim();
  if (!url) return bad('invalid_params', 'url must be non-empty');
  const timeoutMs = Number(req.timeout_ms || 30000);

  const t0 = Date.now();
  let browser;
  try {
    browser = await pw.chromium.launch({ headless: true });
    const context = await browser.newContext({ serviceWorkers: 'block' });
    const page = await context.newPage();
    try {
      await page.route('**/*', (route) => {
        const rt = route.request().resourceType();
        if (rt === 'image' || rt === 'media' || rt === 'font') return route.abort();
        return route.continue();
      });
    } catch (_) {}

    const resp = await page.goto(url, { waitUntil: 'domcontentloaded', timeout: timeoutMs });
    try { await page.waitForLoadState('networkidle', { timeout: Math.min(5000, timeoutMs) }); } catch (_) {}

    const html = await page.content();
    const status = resp ? resp.status() : null;
    ok({ ok: true, final_url: page.url(), status, html, elapsed_ms: Date.now() - t0 });
  } catch (e) {
    const msg = String(e && e.message ? e.message : e);
    bad(/timeout/i.test(msg) ? 'timeout' : 'fetch_failed', msg);
  } finally {
    try { if (browser) await browser.close(); } catch (_) {}
  }
}

main().catch((e) => bad('fetch_failed', String(e && e.message ? e.message : e)));
"#;

fn node_path_candidates() -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(std::path::PathBuf::from) {
        out.push(
            home.join(".npm-global")
                .join("lib")
                .join("node_modules")
                .to_string_lossy()
                .to_string(),
        );
    }
    out.push("/opt/homebrew/lib/node_modules".to_string());
    out.push("/usr/local/lib/node_modules".to_string());
    out.push("/usr/lib/node_modules".to_string());
    out
}

/// `NODE_PATH` that makes a global Playwright install visible, if one is needed.
fn detect_node_path_for_playwright() -> Option<String> {
    fn has_playwright(np: &str) -> bool {
        np.split(':')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .any(|p| std::path::Path::new(p).join("playwright").is_dir())
    }

    if let Some(v) = env("SOURCEGATE_NODE_PATH") {
        return Some(v);
    }
    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if has_playwright(&existing) {
        return None;
    }
    let found = node_path_candidates()
        .into_iter()
        .find(|root| has_playwright(root))?;
    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

#[derive(Debug, Clone)]
pub struct PlaywrightRenderer {
    node_bin: String,
    timeout: Duration,
    max_html_chars: usize,
    disabled: bool,
}

impl PlaywrightRenderer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            node_bin: "node".to_string(),
            timeout,
            max_html_chars: DEFAULT_MAX_HTML_CHARS,
            disabled: false,
        }
    }

    pub fn from_env(timeout: Duration) -> Self {
        Self {
            node_bin: env("SOURCEGATE_NODE").unwrap_or_else(|| "node".to_string()),
            timeout,
            max_html_chars: env("SOURCEGATE_RENDER_MAX_HTML_CHARS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_HTML_CHARS),
            disabled: env_flag("SOURCEGATE_RENDER_DISABLE"),
        }
    }

    pub fn with_node_bin(mut self, node_bin: impl Into<String>) -> Self {
        self.node_bin = node_bin.into();
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Wall-clock budget for the whole node process.
    pub fn hard_timeout(&self, req: &FetchRequest) -> Duration {
        req.timeout().unwrap_or(self.timeout) + Duration::from_millis(HARD_TIMEOUT_GRACE_MS)
    }

    async fn run_node(&self, url: &str, timeout_ms: u64, hard_timeout: Duration) -> Result<serde_json::Value> {
        let args_json = serde_json::json!({ "url": url, "timeout_ms": timeout_ms }).to_string();

        let mut cmd = tokio::process::Command::new(&self.node_bin);
        if let Some(node_path) = detect_node_path_for_playwright() {
            cmd.env("NODE_PATH", node_path);
        }
        let mut child = cmd
            .arg("-e")
            .arg(JS)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "render requires Node.js (`{}`) and the Playwright npm package: {e}",
                    self.node_bin
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            write_request(&mut stdin, &args_json).await?;
        }

        // Read pipes concurrently so the child can be killed on timeout.
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Render("missing stdout pipe".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Render("missing stderr pipe".to_string()))?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
            buf
        });

        match tokio::time::timeout(hard_timeout, child.wait()).await {
            Ok(r) => {
                r.map_err(|e| Error::Render(format!("waiting for node failed: {e}")))?;
            }
            Err(_) => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::Timeout(format!(
                    "render hard timeout after {}ms",
                    hard_timeout.as_millis()
                )));
            }
        }

        let out_stdout = stdout_task.await.unwrap_or_default();
        let out_stderr = stderr_task.await.unwrap_or_default();
        let stdout = String::from_utf8_lossy(&out_stdout).trim().to_string();
        serde_json::from_str(&stdout).map_err(|e| {
            let stderr = String::from_utf8_lossy(&out_stderr).trim().to_string();
            if stderr.is_empty() {
                Error::Render(format!("renderer returned invalid JSON: {e}"))
            } else {
                Error::Render(format!("renderer returned invalid JSON: {e}. stderr: {stderr}"))
            }
        })
    }
}

/// Send the request and close the pipe so the script sees EOF.
async fn write_request<W>(stdin: &mut W, args_json: &str) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    stdin
        .write_all(args_json.as_bytes())
        .await
        .map_err(|e| Error::Render(format!("writing renderer request failed: {e}")))?;
    stdin
        .shutdown()
        .await
        .map_err(|e| Error::Render(format!("closing renderer stdin failed: {e}")))
}

/// Turn the renderer's JSON reply into a snapshot. A missing status means the
/// navigation completed without a response object and is reported as 200.
pub fn parse_render_output(v: &serde_json::Value, url: &str, max_html_chars: usize) -> Result<PageSnapshot> {
    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("fetch_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("render failed")
            .to_string();
        return Err(match code {
            "not_configured" => Error::NotConfigured(message),
            "invalid_params" => Error::InvalidUrl(message),
            "timeout" => Error::Timeout(message),
            _ => Error::Render(message),
        });
    }

    let html = v
        .get("html")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();
    if html.len() > max_html_chars {
        return Err(Error::Render(format!(
            "rendered HTML too large ({} chars > {max_html_chars})",
            html.len()
        )));
    }
    let final_url = v
        .get("final_url")
        .and_then(|x| x.as_str())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(url)
        .to_string();
    let status = v
        .get("status")
        .and_then(|x| x.as_u64())
        .and_then(|n| u16::try_from(n).ok())
        .unwrap_or(200);

    let mut timings_ms = BTreeMap::new();
    if let Some(ms) = v.get("elapsed_ms").and_then(|x| x.as_u64()) {
        timings_ms.insert("render".to_string(), ms as u128);
    }

    Ok(PageSnapshot {
        url: url.to_string(),
        final_url,
        status,
        title: html_title(&html),
        text: html_to_text(&html, 120),
        html,
        error: None,
        timings_ms,
    })
}

#[async_trait::async_trait]
impl RenderBackend for PlaywrightRenderer {
    async fn render(&self, req: &FetchRequest) -> Result<PageSnapshot> {
        if self.disabled {
            return Err(Error::NotConfigured(
                "render backend disabled (SOURCEGATE_RENDER_DISABLE)".to_string(),
            ));
        }
        let parsed = url::Url::parse(&req.url).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(format!("unsupported scheme: {}", parsed.scheme())));
        }

        let timeout_ms = req
            .timeout_ms
            .unwrap_or(self.timeout.as_millis() as u64)
            .max(1_000);
        let v = self
            .run_node(&req.url, timeout_ms, self.hard_timeout(req))
            .await?;
        parse_render_output(&v, &req.url, self.max_html_chars)
    }
}
