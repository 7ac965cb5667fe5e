use clap::Parser;
use log::warn;
use rfhtml::{LoadEvent, RenderOptions, ScriptResult, Session, XPathItem};
use serde_json::{json, Value};
use std::process;
use std::time::Duration;

/// Fetch a page, optionally render it, and print query results as JSON
#[derive(Parser, Debug)]
#[command(name = "rfhtml", version, about)]
struct Cli {
    /// Page to fetch
    url: String,

    /// Render the page in headless Chrome before querying
    #[arg(long)]
    render: bool,

    /// Script to evaluate while rendering (implies --render)
    #[arg(long)]
    script: Option<String>,

    /// Settle period after load, in seconds
    #[arg(long, default_value_t = 0.2)]
    wait: f64,

    /// Lifecycle point to wait for after loading: load, domcontentloaded
    /// or networkidle
    #[arg(long)]
    wait_until: Option<LoadEvent>,

    /// Number of scroll-to-bottom passes while rendering
    #[arg(long, default_value_t = 0)]
    scroll: u32,

    /// Render deadline, in seconds
    #[arg(long, default_value_t = 8.0)]
    timeout: f64,

    /// CSS selector; prints the text and attributes of every match
    #[arg(long, conflicts_with = "xpath")]
    css: Option<String>,

    /// XPath expression
    #[arg(long)]
    xpath: Option<String>,

    /// Print the links found on the page
    #[arg(long)]
    links: bool,

    /// Resolve printed links against the page URL
    #[arg(long)]
    absolute: bool,

    /// Text template to search for, e.g. "Price: {amount}"
    #[arg(long)]
    search: Option<String>,
}

fn element_json(el: &rfhtml::Element) -> Value {
    let attrs: serde_json::Map<String, Value> = el
        .attrs()
        .iter()
        .map(|(k, v)| {
            let value = match v {
                rfhtml::AttrValue::Text(s) => json!(s),
                rfhtml::AttrValue::List(l) => json!(l),
            };
            (k.to_string(), value)
        })
        .collect();
    json!({ "tag": el.tag(), "text": el.text(), "attrs": attrs })
}

/// Add the render outcome to `out`. A failed render degrades to the fetched
/// page; other errors abort.
fn record_render(out: &mut Value, result: rfhtml::Result<Option<ScriptResult>>) -> rfhtml::Result<()> {
    match result {
        Ok(Some(r)) => {
            out["rendered"] = json!(true);
            out["script"] = json!({ "value": r.json().unwrap_or(json!(r.value)), "is_error": r.is_error });
        }
        Ok(None) => out["rendered"] = json!(true),
        Err(e) if e.is_render_failure() => {
            warn!("render failed, using the fetched page: {}", e);
            out["rendered"] = json!(false);
            out["render_error"] = json!(e.to_string());
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

fn run(cli: Cli) -> rfhtml::Result<Value> {
    let session = Session::new()?;
    let mut doc = session.get(&cli.url)?;
    let mut out = json!({
        "url": doc.url().as_str(),
        "status": doc.status(),
        "encoding": doc.encoding(),
    });

    if cli.render || cli.script.is_some() {
        let opts = RenderOptions {
            wait_until: cli.wait_until,
            script: cli.script.clone(),
            wait: Duration::from_secs_f64(cli.wait.max(0.0)),
            scroll_down: cli.scroll,
            timeout: Duration::from_secs_f64(cli.timeout.max(0.0)),
            ..Default::default()
        };
        let result = doc.render(&opts);
        session.close()?;
        record_render(&mut out, result)?;
    }

    if let Some(sel) = &cli.css {
        let found: Vec<Value> = doc.find(sel)?.iter().map(element_json).collect();
        out["matches"] = json!(found);
    }
    if let Some(expr) = &cli.xpath {
        let found: Vec<Value> = doc
            .xpath(expr)?
            .iter()
            .map(|item| match item {
                XPathItem::Element(el) => element_json(el),
                XPathItem::Text(s) => json!(s),
            })
            .collect();
        out["matches"] = json!(found);
    }
    if cli.links {
        out["links"] = if cli.absolute {
            json!(doc.absolute_links())
        } else {
            json!(doc.links())
        };
    }
    if let Some(template) = &cli.search {
        let found: Vec<Value> = doc
            .search_all(template)?
            .iter()
            .map(|c| json!({ "named": c.named(), "fixed": c.fixed() }))
            .collect();
        out["search"] = json!(found);
    }
    Ok(out)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(out) => match serde_json::to_string_pretty(&out) {
            Ok(s) => println!("{}", s),
            Err(e) => {
                eprintln!("rfhtml: failed to serialize output: {}", e);
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("rfhtml: {}", e);
            process::exit(1);
        }
    }
}
