use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sourcegate_core::{Mode, RunRequest, RunResponse, DEFAULT_MAX_STEPS, MAX_STEPS_LIMIT};
use sourcegate_local::cache::{FsCache, Namespace};
use sourcegate_local::classify::{classify_page, ClassifierConfig};
use sourcegate_local::config::{env, Settings};
use sourcegate_local::extract::{html_title, html_to_text};
use sourcegate_local::policy::verify;
use sourcegate_local::AgentLoop;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sourcegate")]
#[command(about = "Web research agent that only cites pages it has verified", long_about = None)]
struct Cli {
    /// Log verbosity on stderr (-v info, -vv debug, -vvv trace). RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer a prompt with the agent loop (json).
    Run(RunCmd),
    /// Classify a saved HTML page and apply the verification policy (json; no network).
    Classify(ClassifyCmd),
    /// Remove cached entries (json).
    CacheClear(CacheClearCmd),
    /// Diagnose configuration (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct RunCmd {
    /// What to research.
    prompt: String,
    /// Tool set offered to the model. Allowed: auto, search, browser
    #[arg(long, default_value = "auto")]
    mode: String,
    /// Decision rounds before the run is cut off (1-20).
    #[arg(long, default_value_t = DEFAULT_MAX_STEPS)]
    max_steps: usize,
    /// Distinct pages fetched or rendered per run (default: SOURCEGATE_MAX_PAGES_FETCHED or 8).
    #[arg(long)]
    max_pages: Option<usize>,
    /// Include the per-step trace.
    #[arg(long, default_value_t = false)]
    debug: bool,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct ClassifyCmd {
    /// HTML file to classify.
    #[arg(long)]
    html_file: std::path::PathBuf,
    /// URL the page was served from (after redirects).
    #[arg(long)]
    url: String,
    /// HTTP status the page was served with.
    #[arg(long, default_value_t = 200)]
    status: u16,
}

#[derive(clap::Args, Debug)]
struct CacheClearCmd {
    /// Only this namespace. Allowed: search, fetch, render (default: all)
    #[arg(long)]
    namespace: Option<String>,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Load `KEY=VALUE` lines from `SOURCEGATE_ENV_FILE`. Existing process env always wins.
fn load_env_file() {
    let Some(p) = env("SOURCEGATE_ENV_FILE") else {
        return;
    };
    let Ok(txt) = std::fs::read_to_string(&p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn error_code(e: &anyhow::Error) -> &'static str {
    if let Some(e) = e.downcast_ref::<sourcegate_core::Error>() {
        return e.code();
    }
    if e.downcast_ref::<std::io::Error>().is_some() {
        return "io_error";
    }
    "internal"
}

fn error_envelope(kind: &str, e: &anyhow::Error) -> serde_json::Value {
    serde_json::json!({
        "schema_version": 1,
        "kind": kind,
        "ok": false,
        "error": {
            "code": error_code(e),
            "message": format!("{e:#}"),
        },
    })
}

fn run_text(resp: &RunResponse) -> String {
    let mut out = resp.answer.trim_end().to_string();
    if !resp.sources.is_empty() {
        out.push_str("\n\nSources:\n");
        for s in &resp.sources {
            out.push_str(&format!("- {} <{}>\n", s.title, s.url));
        }
    }
    out
}

async fn cmd_run(args: RunCmd, settings: &Settings) -> Result<()> {
    let mode: Mode = args.mode.parse()?;
    if !(1..=MAX_STEPS_LIMIT).contains(&args.max_steps) {
        anyhow::bail!("--max-steps must be between 1 and {MAX_STEPS_LIMIT}");
    }
    let req = RunRequest {
        prompt: args.prompt,
        mode,
        max_steps: args.max_steps,
        max_pages_fetched: args.max_pages.unwrap_or(settings.max_pages_fetched),
        debug: args.debug,
    };

    let agent = AgentLoop::from_settings(settings)?;
    let resp = agent.run(&req).await;

    match args.output.to_ascii_lowercase().as_str() {
        "text" => println!("{}", run_text(&resp)),
        _ => {
            let mut v = serde_json::json!({
                "schema_version": 1,
                "kind": "run",
                "ok": true,
                "mode": mode.as_str(),
            });
            if let (Some(obj), serde_json::Value::Object(body)) =
                (v.as_object_mut(), serde_json::to_value(&resp)?)
            {
                obj.extend(body);
            }
            println!("{v}");
        }
    }
    Ok(())
}

fn cmd_classify(args: ClassifyCmd, settings: &Settings) -> Result<()> {
    let html = std::fs::read_to_string(&args.html_file)
        .with_context(|| format!("reading {}", args.html_file.display()))?;
    let text = html_to_text(&html, 120);
    let cfg = ClassifierConfig {
        listing_min_products: settings.listing_min_products,
        ..ClassifierConfig::default()
    };
    let classification = classify_page(&html, &text, &args.url, &cfg);
    let verification = verify(args.status, &args.url, &classification);
    let v = serde_json::json!({
        "schema_version": 1,
        "kind": "classify",
        "ok": true,
        "url": args.url,
        "status": args.status,
        "title": html_title(&html),
        "classification": classification,
        "verification": verification,
    });
    println!("{v}");
    Ok(())
}

fn cmd_cache_clear(args: CacheClearCmd, settings: &Settings) -> Result<()> {
    let ns = args
        .namespace
        .as_deref()
        .map(str::parse::<Namespace>)
        .transpose()?;
    let cache = FsCache::with_ttls(settings.cache_dir.clone(), settings.cache_ttls);
    let removed = cache.clear(ns)?;
    let v = serde_json::json!({
        "schema_version": 1,
        "kind": "cache_clear",
        "ok": true,
        "cache_dir": &settings.cache_dir,
        "namespace": ns.map(|n| n.as_str()),
        "removed": removed,
    });
    println!("{v}");
    Ok(())
}

fn cmd_doctor(args: DoctorCmd, settings: &Settings) -> Result<()> {
    let cache_dir = &settings.cache_dir;
    let cache_ok = (|| -> Result<()> {
        std::fs::create_dir_all(cache_dir)?;
        let probe = cache_dir.join(format!("sourcegate-doctor-{}.probe", std::process::id()));
        std::fs::write(&probe, b"ok")?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    })()
    .is_ok();

    let search_configured = sourcegate_local::search::brave_configured();
    let llm_configured = settings.llm.api_key.is_some();
    let render_disabled = sourcegate_local::config::env_flag("SOURCEGATE_RENDER_DISABLE");

    let checks = vec![
        serde_json::json!({
            "name": "cache_dir_writable",
            "ok": cache_ok,
            "message": if cache_ok { "cache dir is writable" } else { "cache dir is not writable" },
            "hint": if cache_ok { "" } else { "Set SOURCEGATE_CACHE_DIR to a writable directory." },
        }),
        serde_json::json!({
            "name": "decision_engine_key",
            "ok": llm_configured,
            "message": if llm_configured { "decision engine key is set" } else { "decision engine key is missing" },
            "hint": if llm_configured { "" } else { "Set SOURCEGATE_LLM_API_KEY (or OPENROUTER_API_KEY)." },
        }),
        serde_json::json!({
            "name": "search_key",
            "ok": search_configured,
            "message": if search_configured { "search key is set" } else { "search key is missing; search_web will fail" },
            "hint": if search_configured { "" } else { "Set SOURCEGATE_BRAVE_API_KEY (or BRAVE_API_KEY)." },
        }),
    ];
    let passed = checks
        .iter()
        .filter(|c| c["ok"].as_bool() == Some(true))
        .count();

    let v = serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": cache_ok,
        "name": "sourcegate",
        "version": env!("CARGO_PKG_VERSION"),
        "configured": {
            "search": search_configured,
            "decision_engine": llm_configured,
            "render_disabled": render_disabled,
            "cache_enabled": settings.cache_enabled,
        },
        "llm": {
            "base_url": &settings.llm.base_url,
            "model": &settings.llm.model,
        },
        "cache_dir": cache_dir,
        "checks": &checks,
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("sourcegate {}", env!("CARGO_PKG_VERSION"));
            println!("cache_dir: {}", cache_dir.display());
            println!("checks: {passed}/{} ok", checks.len());
            for c in &checks {
                let mark = if c["ok"].as_bool() == Some(true) { "ok" } else { "FAIL" };
                println!("  [{mark}] {}", c["message"].as_str().unwrap_or_default());
            }
        }
        _ => println!("{v}"),
    }
    Ok(())
}

fn cmd_version(args: VersionCmd) {
    match args.output.to_ascii_lowercase().as_str() {
        "text" => println!("sourcegate {}", env!("CARGO_PKG_VERSION")),
        _ => println!(
            "{}",
            serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "sourcegate",
                "version": env!("CARGO_PKG_VERSION"),
            })
        ),
    }
}

#[tokio::main]
async fn main() {
    load_env_file();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let settings = Settings::from_env();
    let (kind, res) = match cli.command {
        Commands::Run(args) => ("run", cmd_run(args, &settings).await),
        Commands::Classify(args) => ("classify", cmd_classify(args, &settings)),
        Commands::CacheClear(args) => ("cache_clear", cmd_cache_clear(args, &settings)),
        Commands::Doctor(args) => ("doctor", cmd_doctor(args, &settings)),
        Commands::Version(args) => {
            cmd_version(args);
            ("version", Ok(()))
        }
    };

    if let Err(e) = res {
        tracing::error!("{kind} failed: {e:#}");
        println!("{}", error_envelope(kind, &e));
        std::process::exit(1);
    }
}
