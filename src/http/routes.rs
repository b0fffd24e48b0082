//! Route table for the smart and dumb HTTP git endpoints.
//!
//! Every pattern captures the repository path as group 1.  The table is
//! ordered and the first match wins, so `objects/info/packs` is listed before
//! the generic `objects/info/*` text route.

use axum::http::Method;
use regex::Regex;

/// What a matched route does with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Stateless RPC (`upload-pack` / `receive-pack`).
    ServiceRpc,
    /// `info/refs`: smart ref advertisement or dumb fallback.
    InfoRefs,
    /// Plain-text metadata, never cached.
    TextFile,
    /// `objects/info/packs`, cached forever.
    InfoPacks,
    LooseObject,
    PackFile,
    IdxFile,
}

impl Operation {
    /// The only HTTP method the operation accepts.
    pub fn method(&self) -> Method {
        match self {
            Self::ServiceRpc => Method::POST,
            _ => Method::GET,
        }
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ServiceRpc => "rpc",
            Self::InfoRefs => "info_refs",
            Self::TextFile => "text_file",
            Self::InfoPacks => "info_packs",
            Self::LooseObject => "loose_object",
            Self::PackFile => "pack_file",
            Self::IdxFile => "idx_file",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: Regex,
    pub method: Method,
    pub operation: Operation,
    /// RPC name for [`Operation::ServiceRpc`] routes.
    pub rpc: Option<&'static str>,
}

/// A successful pattern match against a request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub method: &'a Method,
    pub operation: Operation,
    pub rpc: Option<&'static str>,
    /// Repository path segment (capture group 1).
    pub repo: String,
    /// Requested file, relative to the repository directory.
    pub file: String,
}

/// Immutable, ordered table of git HTTP routes.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

const ROUTES: &[(&str, Operation, Option<&str>)] = &[
    (r"^(.*?)/git-upload-pack$", Operation::ServiceRpc, Some("upload-pack")),
    (r"^(.*?)/git-receive-pack$", Operation::ServiceRpc, Some("receive-pack")),
    (r"^(.*?)/info/refs$", Operation::InfoRefs, None),
    (r"^(.*?)/HEAD$", Operation::TextFile, None),
    (r"^(.*?)/objects/info/alternates$", Operation::TextFile, None),
    (r"^(.*?)/objects/info/http-alternates$", Operation::TextFile, None),
    (r"^(.*?)/objects/info/packs$", Operation::InfoPacks, None),
    (r"^(.*?)/objects/info/[^/]*$", Operation::TextFile, None),
    (r"^(.*?)/objects/[0-9a-f]{2}/[0-9a-f]{38}$", Operation::LooseObject, None),
    (r"^(.*?)/objects/pack/pack-[0-9a-f]{40}\.pack$", Operation::PackFile, None),
    (r"^(.*?)/objects/pack/pack-[0-9a-f]{40}\.idx$", Operation::IdxFile, None),
];

impl RouteTable {
    /// Compile the git HTTP route table.
    pub fn new() -> Self {
        let routes = ROUTES
            .iter()
            .map(|(pattern, operation, rpc)| Route {
                // The patterns are constants; a failure here is a programming error.
                pattern: Regex::new(pattern).expect("static route pattern must compile"),
                method: operation.method(),
                operation: *operation,
                rpc: *rpc,
            })
            .collect();
        Self { routes }
    }

    /// Find the first route whose pattern matches `path`.
    ///
    /// `path` is the request path without its leading `/`.  The method is not
    /// checked here; callers compare [`RouteMatch::method`] themselves so a
    /// mismatch can be reported as such instead of as "not found".
    pub fn resolve(&self, path: &str) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|route| {
            let caps = route.pattern.captures(path)?;
            let repo = caps.get(1).map_or("", |m| m.as_str()).to_string();
            let file = path.replacen(&format!("{repo}/"), "", 1);
            Some(RouteMatch {
                method: &route.method,
                operation: route.operation,
                rpc: route.rpc,
                repo,
                file,
            })
        })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
