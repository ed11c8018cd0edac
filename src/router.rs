//! Page routing with a session-validity guard.
//!
//! Maps a path fragment like `result/abc123?out=report.xlsx` to a registered
//! page handler. The guard runs before every navigation and may redirect to a
//! safe default. Unknown paths render a not-found page and handler errors
//! render an error page instead of propagating.

use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;

/// Redirect chains longer than this render an error page.
const MAX_REDIRECTS: usize = 4;

/// What a handler gets to look at: the navigated path, the one positional
/// parameter (when the pattern declares it), and the parsed query string.
pub struct RouteContext {
    pub path: String,
    pub param: Option<String>,
    pub query: HashMap<String, String>,
}

pub enum GuardDecision {
    Allow,
    Redirect(String),
}

type Handler = Box<dyn Fn(RouteContext) -> BoxFuture<'static, Result<String>> + Send + Sync>;
type Guard = Box<dyn Fn(&str) -> GuardDecision + Send + Sync>;

enum Segment {
    Literal(String),
    Param,
}

struct Route {
    pattern: Vec<Segment>,
    handler: Handler,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    guard: Option<Guard>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a pattern. Patterns are `/`-separated literal
    /// segments with at most one `{param}` placeholder, e.g. `result/{id}`.
    pub fn register<H, F>(&mut self, pattern: &str, handler: H)
    where
        H: Fn(RouteContext) -> F + Send + Sync + 'static,
        F: Future<Output = Result<String>> + Send + 'static,
    {
        let pattern = pattern
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s.starts_with('{') && s.ends_with('}') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        self.routes.push(Route {
            pattern,
            handler: Box::new(move |ctx| Box::pin(handler(ctx))),
        });
    }

    pub fn set_guard<G>(&mut self, guard: G)
    where
        G: Fn(&str) -> GuardDecision + Send + Sync + 'static,
    {
        self.guard = Some(Box::new(guard));
    }

    /// Resolve and render a path. Always produces a page: guard redirects
    /// are followed, unknown paths get the not-found page, and handler
    /// failures get the error page.
    pub async fn navigate(&self, path: &str) -> String {
        let mut current = path.to_string();
        for _ in 0..=MAX_REDIRECTS {
            if let Some(guard) = &self.guard {
                if let GuardDecision::Redirect(target) = guard(&current) {
                    if target != current {
                        tracing::debug!(from = %current, to = %target, "guard redirect");
                        current = target;
                        continue;
                    }
                }
            }
            return self.render(&current).await;
        }
        format!("Error: redirect loop while navigating to {}", path)
    }

    async fn render(&self, path: &str) -> String {
        let (route_path, query_str) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        let segments: Vec<&str> = route_path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        for route in &self.routes {
            if let Some(param) = match_pattern(&route.pattern, &segments) {
                let ctx = RouteContext {
                    path: path.to_string(),
                    param,
                    query: parse_query(query_str),
                };
                return match (route.handler)(ctx).await {
                    Ok(page) => page,
                    Err(e) => {
                        tracing::error!(path, error = %format!("{e:#}"), "page handler failed");
                        format!("Error: {e:#}")
                    }
                };
            }
        }
        format!("Not found: {}", route_path)
    }
}

fn match_pattern(pattern: &[Segment], segments: &[&str]) -> Option<Option<String>> {
    if pattern.len() != segments.len() {
        return None;
    }
    let mut param = None;
    for (seg, part) in pattern.iter().zip(segments) {
        match seg {
            Segment::Literal(lit) if lit == part => {}
            Segment::Literal(_) => return None,
            Segment::Param => param = Some((*part).to_string()),
        }
    }
    Some(param)
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(query) = query else {
        return map;
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((k, v)) => map.insert(k.to_string(), v.to_string()),
            None => map.insert(pair.to_string(), String::new()),
        };
    }
    map
}
