//! Immutable route-descriptor table.
//!
//! Built once at startup from `config.routes`.  Each descriptor says which
//! downstream service owns the path, how many budget units a call costs,
//! and whether the route is public or privileged.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::Method;

use crate::config::Config;

/// One segment of a path template.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{name}`: exactly one non-empty segment.
    Param,
    /// `{*name}`: the remainder of the path, possibly empty.
    Tail,
}

/// A parsed path template such as `/appointments/{id}` or `/files/{*rest}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        anyhow::ensure!(raw.starts_with('/'), "path template must start with '/': {raw}");
        let mut segments = Vec::new();
        let parts: Vec<&str> = split_path(raw).collect();
        for (i, part) in parts.iter().enumerate() {
            let segment = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(name) if name.starts_with('*') => {
                    anyhow::ensure!(
                        i + 1 == parts.len(),
                        "tail capture must be the last segment: {raw}"
                    );
                    Segment::Tail
                }
                Some(name) => {
                    anyhow::ensure!(!name.is_empty(), "empty parameter name in {raw}");
                    Segment::Param
                }
                None => Segment::Literal((*part).to_string()),
            };
            segments.push(segment);
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        let mut parts = split_path(path);
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    if parts.next() != Some(lit.as_str()) {
                        return false;
                    }
                }
                Segment::Param => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Tail => return true,
            }
        }
        parts.next().is_none()
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// `.` or `..`, literally or percent-encoded.  Downstream URL handling
/// resolves these, so the path that was authorised is not the one served.
fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
    decoded == "." || decoded == ".."
}

#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    pub template: PathTemplate,
    /// Downstream service that owns the route.  `None` for routes the relay
    /// answers itself.
    pub service: Option<String>,
    pub cost: u64,
    pub public: bool,
    pub privileged: bool,
}

impl Route {
    /// `GET /auth/me`, answered by the relay from the resolved identity.
    pub fn current_identity() -> Self {
        Self {
            method: Method::GET,
            template: PathTemplate {
                raw: "/auth/me".to_string(),
                segments: vec![
                    Segment::Literal("auth".to_string()),
                    Segment::Literal("me".to_string()),
                ],
            },
            service: None,
            cost: 1,
            public: false,
            privileged: false,
        }
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.template.as_str())
    }
}

pub enum RouteLookup<'a> {
    Found(&'a Arc<Route>),
    MethodNotAllowed,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    current_identity: Arc<Route>,
}

impl RouteTable {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut routes = Vec::with_capacity(config.routes.len());
        for rc in &config.routes {
            let method = Method::from_bytes(rc.method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("invalid HTTP method in route: {}", rc.method))?;
            let template = PathTemplate::parse(&rc.path)?;
            routes.push(Arc::new(Route {
                method,
                template,
                service: Some(rc.service.clone()),
                cost: rc.cost,
                public: rc.public,
                privileged: rc.privileged,
            }));
        }
        Ok(Self {
            routes,
            current_identity: Arc::new(Route::current_identity()),
        })
    }

    /// Descriptor for the built-in `GET /auth/me`.
    pub fn current_identity(&self) -> &Arc<Route> {
        &self.current_identity
    }

    /// First route (in configuration order) matching method and path.
    /// Paths with dot segments match nothing.
    pub fn lookup(&self, method: &Method, path: &str) -> RouteLookup<'_> {
        if path.split('/').any(is_dot_segment) {
            return RouteLookup::NotFound;
        }
        let mut path_known = false;
        for route in &self.routes {
            if route.template.matches(path) {
                if route.method == *method {
                    return RouteLookup::Found(route);
                }
                path_known = true;
            }
        }
        if path_known {
            RouteLookup::MethodNotAllowed
        } else {
            RouteLookup::NotFound
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}
