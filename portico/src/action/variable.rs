//! Variable interpolation
//!
//! Action arguments may embed `{[%]name[:param]}` tokens that evaluate
//! against the current request. A leading `%` form-url-encodes the result.
//! Everything outside the braces is literal text; `\{` and `\}` in action
//! strings survive tokenization as literal braces.
//!
//! Supported variables: `path`, `seg`, `query`, `^query`, `has_query`,
//! `fragment`, `has_fragment`, `mux`, `re`, `host`, `up`, `fullpath`.

use http::header::HOST;
use http::request::Parts;
use http::{Extensions, HeaderMap, Uri};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::LazyLock;

use crate::error::{Error, Result};
use crate::router::{OriginalHost, RouteParams};
use crate::upstream;

static VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(%?)([a-z_^]+)(:?)([^}]*)\}").expect("variable regex"));
static KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("key regex"));
static KEY_INT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[0-9]+\]$").expect("indexed param regex"));
static FROM_TO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[0-9]*:[0-9]*\]$").expect("slice param regex"));
static KEY_LIST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[[a-zA-Z0-9_-]+(?:,[a-zA-Z0-9_-]+)*\]$").expect("key list regex")
});

/// Form-style escape set: everything except ASCII alphanumerics and
/// `-`, `_`, `.`, `~`; spaces become `+`.
const FORM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Form-url-encode a string (space as `+`, uppercase hex escapes).
pub(crate) fn query_escape(value: &str) -> String {
    value
        .split(' ')
        .map(|part| utf8_percent_encode(part, FORM).to_string())
        .collect::<Vec<_>>()
        .join("+")
}

/// The request-derived state a variable may read.
///
/// Borrowed views keep evaluation allocation-free for the common literal
/// cases; tests construct the struct directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarContext<'a> {
    /// Decoded request path (`/a/b`).
    pub path: &'a str,
    /// Raw query string, without the `?`.
    pub query: &'a str,
    /// URI fragment, if the request target carried one (rare in practice).
    pub fragment: &'a str,
    /// Host header of the request as currently seen.
    pub host: &'a str,
    /// Host header captured before any action rewrote the request.
    pub fallback_host: &'a str,
    /// Named captures of the matched route.
    pub params: Option<&'a RouteParams>,
    /// Remote address of the downstream connection.
    pub remote: Option<SocketAddr>,
}

impl<'a> VarContext<'a> {
    pub fn from_parts(parts: &'a Parts) -> Self {
        Self::new(&parts.uri, &parts.headers, &parts.extensions)
    }

    pub fn from_request<B>(req: &'a http::Request<B>) -> Self {
        Self::new(req.uri(), req.headers(), req.extensions())
    }

    fn new(uri: &'a Uri, headers: &'a HeaderMap, extensions: &'a Extensions) -> Self {
        let host = headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| uri.host())
            .unwrap_or_default();

        Self {
            path: uri.path(),
            query: uri.query().unwrap_or_default(),
            fragment: "",
            host,
            fallback_host: extensions
                .get::<OriginalHost>()
                .map(|original| original.0.as_str())
                .unwrap_or_default(),
            params: extensions.get::<RouteParams>(),
            remote: extensions
                .get::<axum::extract::ConnectInfo<crate::tls::RemoteAddr>>()
                .map(|info| info.0 .0),
        }
    }

    /// Request host, falling back to the pre-rewrite value.
    pub fn request_host(&self) -> &str {
        if !self.host.is_empty() {
            self.host
        } else {
            self.fallback_host
        }
    }
}

/// A compiled interpolation node, evaluated per request.
#[derive(Debug, Clone)]
pub enum Variable {
    /// Literal text.
    Const(String),
    /// Form-url-encode the evaluated child.
    Encode(Box<Variable>),
    /// Concatenation.
    Chain(Vec<Variable>),
    /// `{path}` or a byte-index slice of it.
    Path {
        from: Option<usize>,
        to: Option<usize>,
    },
    /// `/`-separated segment(s) of the path.
    Seg {
        idx: Option<usize>,
        from: Option<usize>,
        to: Option<usize>,
    },
    /// `"?"` iff the request has a query.
    HasQuery,
    /// Raw query string.
    QueryAll,
    /// First value of one query key, decoded.
    QuerySingle(String),
    /// Selected (or, with `reverse`, unselected) keys re-encoded.
    QueryList { reverse: bool, keys: Vec<String> },
    /// `"#"` iff the request has a fragment.
    HasFragment,
    /// The fragment itself.
    Fragment,
    /// Named route capture.
    MuxVar(String),
    /// Literal `${N}` back-reference, expanded later by `filter-content`.
    ReVar(u32),
    /// Request host.
    Host,
    /// An address from a named upstream group.
    Upstream(String),
    /// `path[?query][#fragment]`.
    FullPath,
}

impl Variable {
    pub fn eval(&self, ctx: &VarContext<'_>) -> String {
        match self {
            Variable::Const(text) => text.clone(),
            Variable::Encode(inner) => query_escape(&inner.eval(ctx)),
            Variable::Chain(list) => list.iter().map(|v| v.eval(ctx)).collect(),
            Variable::Path { from, to } => eval_path(ctx.path, *from, *to),
            Variable::Seg { idx, from, to } => eval_seg(ctx.path, *idx, *from, *to),
            Variable::HasQuery => {
                if has_query(ctx.query) {
                    "?".to_string()
                } else {
                    String::new()
                }
            }
            Variable::QueryAll => ctx.query.to_string(),
            Variable::QuerySingle(key) => query_value(ctx.query, key).unwrap_or_default(),
            Variable::QueryList { reverse, keys } => eval_query_list(ctx.query, *reverse, keys),
            Variable::HasFragment => {
                if ctx.fragment.is_empty() {
                    String::new()
                } else {
                    "#".to_string()
                }
            }
            Variable::Fragment => ctx.fragment.to_string(),
            Variable::MuxVar(name) => ctx
                .params
                .and_then(|params| params.get(name))
                .unwrap_or_default()
                .to_string(),
            Variable::ReVar(n) => format!("${{{n}}}"),
            Variable::Host => ctx.request_host().to_string(),
            Variable::Upstream(name) => upstream::addr(name, ctx.remote),
            Variable::FullPath => {
                let mut out = ctx.path.to_string();
                if !ctx.query.is_empty() {
                    out.push('?');
                    out.push_str(ctx.query);
                }
                if !ctx.fragment.is_empty() {
                    out.push('#');
                    out.push_str(ctx.fragment);
                }
                out
            }
        }
    }
}

fn eval_path(path: &str, from: Option<usize>, to: Option<usize>) -> String {
    if from.is_none() && to.is_none() {
        return path.to_string();
    }

    let bytes = path.as_bytes();
    let from = from.unwrap_or(0).min(bytes.len());
    let to = match to {
        Some(t) if t < bytes.len() => t,
        _ => bytes.len(),
    };

    if from >= to {
        return String::new();
    }
    String::from_utf8_lossy(&bytes[from..to]).into_owned()
}

fn eval_seg(path: &str, idx: Option<usize>, from: Option<usize>, to: Option<usize>) -> String {
    let path = path.strip_prefix('/').unwrap_or(path);
    let segments: Vec<&str> = path.split('/').collect();

    if let Some(idx) = idx {
        return segments.get(idx).copied().unwrap_or_default().to_string();
    }

    let from = from.unwrap_or(0).min(segments.len());
    let to = match to {
        Some(t) if t < segments.len() => t,
        _ => segments.len(),
    };

    if from >= to {
        return String::new();
    }
    segments[from..to].join("/")
}

fn has_query(query: &str) -> bool {
    form_urlencoded::parse(query.as_bytes()).next().is_some()
}

/// First decoded value of `key`, if present.
fn query_value(query: &str, key: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn eval_query_list(query: &str, reverse: bool, keys: &[String]) -> String {
    let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        return String::new();
    }

    let mut out = Vec::new();

    if !reverse {
        for key in keys {
            if let Some((_, value)) = pairs.iter().find(|(k, _)| k == key) {
                out.push(format!("{key}={}", query_escape(value)));
            }
        }
    } else {
        let excluded: HashSet<&str> = keys.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();
        for (key, value) in &pairs {
            if excluded.contains(key.as_str()) || !seen.insert(key.as_str()) {
                continue;
            }
            out.push(format!("{key}={}", query_escape(value)));
        }
    }

    out.join("&")
}

/// Compile one action argument into a variable tree.
///
/// Text without interpolation tokens compiles to a single [`Variable::Const`];
/// a lone token compiles to that variable directly; anything else becomes a
/// [`Variable::Chain`].
pub fn compile_param(param: &str) -> Result<Variable> {
    let mut list: Vec<Variable> = Vec::new();
    let mut last = 0usize;

    for caps in VAR_RE.captures_iter(param) {
        let Some(full) = caps.get(0) else { continue };

        if full.start() > last {
            list.push(Variable::Const(param[last..full.start()].to_string()));
        }
        last = full.end();

        let encode = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let has_param = caps.get(3).is_some_and(|m| !m.as_str().is_empty());
        let raw = caps.get(4).map(|m| m.as_str()).unwrap_or_default();

        let variable = build_var(name, has_param, raw)?;
        list.push(if encode {
            Variable::Encode(Box::new(variable))
        } else {
            variable
        });
    }

    if list.is_empty() {
        return Ok(Variable::Const(param.to_string()));
    }

    if last < param.len() {
        list.push(Variable::Const(param[last..].to_string()));
    }

    if list.len() == 1 {
        return Ok(list.remove(0));
    }
    Ok(Variable::Chain(list))
}

fn bad(name: &str, reason: impl Into<String>) -> Error {
    Error::BadVariable {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn build_var(name: &str, has_param: bool, raw: &str) -> Result<Variable> {
    match name {
        "path" => {
            if has_param {
                return Err(bad(name, "'path' variable cannot have ':'"));
            }
            if raw.is_empty() {
                return Ok(Variable::Path {
                    from: None,
                    to: None,
                });
            }
            if !FROM_TO_RE.is_match(raw) {
                return Err(bad(name, format!("invalid param: {raw}")));
            }
            let (from, to) = parse_from_to(name, raw)?;
            Ok(Variable::Path { from, to })
        }
        "seg" => {
            if has_param {
                return Err(bad(name, "'seg' variable cannot have ':'"));
            }
            if KEY_INT_RE.is_match(raw) {
                let idx = parse_bracket_int(name, raw)?;
                return Ok(Variable::Seg {
                    idx: Some(idx as usize),
                    from: None,
                    to: None,
                });
            }
            if !FROM_TO_RE.is_match(raw) {
                return Err(bad(name, format!("invalid param: {raw}")));
            }
            let (from, to) = parse_from_to(name, raw)?;
            Ok(Variable::Seg {
                idx: None,
                from,
                to,
            })
        }
        "has_query" => {
            if has_param || !raw.is_empty() {
                return Err(bad(name, "'has_query' variable cannot have ':' or params"));
            }
            Ok(Variable::HasQuery)
        }
        "query" => {
            if !has_param && raw.is_empty() {
                return Ok(Variable::QueryAll);
            }
            if !has_param || raw.is_empty() {
                return Err(bad(name, "malformed 'query' variable"));
            }
            if KEY_RE.is_match(raw) {
                return Ok(Variable::QuerySingle(raw.to_string()));
            }
            if !KEY_LIST_RE.is_match(raw) {
                return Err(bad(name, format!("invalid param: {raw}")));
            }
            Ok(Variable::QueryList {
                reverse: false,
                keys: parse_key_list(raw),
            })
        }
        "^query" => {
            if !has_param || raw.is_empty() {
                return Err(bad(name, "malformed '^query' variable"));
            }
            if !KEY_LIST_RE.is_match(raw) {
                return Err(bad(name, format!("invalid param: {raw}")));
            }
            Ok(Variable::QueryList {
                reverse: true,
                keys: parse_key_list(raw),
            })
        }
        "has_fragment" => {
            if has_param || !raw.is_empty() {
                return Err(bad(
                    name,
                    "'has_fragment' variable cannot have ':' or params",
                ));
            }
            Ok(Variable::HasFragment)
        }
        "fragment" => {
            if has_param || !raw.is_empty() {
                return Err(bad(name, "'fragment' variable cannot have ':' or params"));
            }
            Ok(Variable::Fragment)
        }
        "mux" => {
            if !has_param || raw.is_empty() || !KEY_RE.is_match(raw) {
                return Err(bad(name, "malformed 'mux' variable"));
            }
            Ok(Variable::MuxVar(raw.to_string()))
        }
        "re" => {
            if has_param {
                return Err(bad(name, "'re' variable cannot have ':'"));
            }
            if !KEY_INT_RE.is_match(raw) {
                return Err(bad(name, "malformed 're' variable"));
            }
            Ok(Variable::ReVar(parse_bracket_int(name, raw)?))
        }
        "host" => {
            if has_param || !raw.is_empty() {
                return Err(bad(name, "'host' variable cannot have ':' or params"));
            }
            Ok(Variable::Host)
        }
        "up" => {
            if !has_param || raw.is_empty() || !KEY_RE.is_match(raw) {
                return Err(bad(name, "malformed 'up' variable"));
            }
            Ok(Variable::Upstream(raw.to_string()))
        }
        "fullpath" => {
            if has_param || !raw.is_empty() {
                return Err(bad(name, "'fullpath' variable cannot have ':' or params"));
            }
            Ok(Variable::FullPath)
        }
        other => Err(bad(other, "unsupported variable cmd")),
    }
}

/// Parse `[N]` into N.
fn parse_bracket_int(name: &str, raw: &str) -> Result<u32> {
    raw[1..raw.len() - 1]
        .parse::<u32>()
        .map_err(|err| bad(name, format!("bad index: {err}")))
}

/// Parse `[A:B]` into optional bounds.
fn parse_from_to(name: &str, raw: &str) -> Result<(Option<usize>, Option<usize>)> {
    let inner = &raw[1..raw.len() - 1];
    let (from_str, to_str) = inner
        .split_once(':')
        .ok_or_else(|| bad(name, format!("invalid param: {raw}")))?;

    let parse = |text: &str| -> Result<Option<usize>> {
        if text.is_empty() {
            return Ok(None);
        }
        text.parse::<usize>()
            .map(Some)
            .map_err(|err| bad(name, format!("bad bound: {err}")))
    };

    Ok((parse(from_str)?, parse(to_str)?))
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw[1..raw.len() - 1]
        .split(',')
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(param: &str, ctx: &VarContext<'_>) -> String {
        compile_param(param).expect("param compiles").eval(ctx)
    }

    #[test]
    fn path_slices() {
        let ctx = VarContext {
            path: "/hello/world/yjsnpi/tohno",
            ..VarContext::default()
        };
        let out = eval("[{path}] [{path[10:]}] [{path[:10]}] [{path[10:20]}]", &ctx);
        assert_eq!(
            out,
            "[/hello/world/yjsnpi/tohno] [world/yjsnpi/tohno] [/hello/wor] [world/yjsn]"
        );
    }

    #[test]
    fn seg_slices() {
        let ctx = VarContext {
            path: "/hello/world/yjsnpi/tohno",
            ..VarContext::default()
        };
        let out = eval("[{seg[0]}] [{seg[1:]}] [{seg[:2]}] [{seg[1:3]}]", &ctx);
        assert_eq!(out, "[hello] [world/yjsnpi/tohno] [hello/world] [world/yjsnpi]");
    }

    #[test]
    fn query_selection_and_encoding() {
        let ctx = VarContext {
            query: "a=1&b=2&c=3&d=%2a&e=5",
            ..VarContext::default()
        };
        let out = eval(
            "{has_query} [{query}] [{query:d}] [{%query:d}] [{query:[a,v,b,c]}] [{^query:[a,b,c,e]}]",
            &ctx,
        );
        assert_eq!(out, "? [a=1&b=2&c=3&d=%2a&e=5] [*] [%2A] [a=1&b=2&c=3] [d=%2A]");
    }

    #[test]
    fn empty_query_yields_nothing() {
        let ctx = VarContext::default();
        assert_eq!(eval("{has_query}", &ctx), "");
        assert_eq!(eval("{query:[a,b]}", &ctx), "");
    }

    #[test]
    fn fragment_variables() {
        let ctx = VarContext {
            fragment: "hello-1",
            ..VarContext::default()
        };
        assert_eq!(eval("{has_fragment} [{fragment}]", &ctx), "# [hello-1]");
        assert_eq!(eval("{has_fragment}", &VarContext::default()), "");
    }

    #[test]
    fn mux_and_re_variables() {
        let ctx = VarContext::default();
        assert_eq!(eval("[{mux:domain}] [{re[1]}]", &ctx), "[] [${1}]");

        let params = RouteParams(
            [("domain".to_string(), "kmr".to_string())]
                .into_iter()
                .collect(),
        );
        let ctx = VarContext {
            params: Some(&params),
            ..VarContext::default()
        };
        assert_eq!(eval("{mux:domain}", &ctx), "kmr");
    }

    #[test]
    fn host_falls_back_to_original() {
        let ctx = VarContext {
            host: "",
            fallback_host: "www.yjsnpi.com",
            ..VarContext::default()
        };
        assert_eq!(eval("{host}", &ctx), "www.yjsnpi.com");

        let ctx = VarContext {
            host: "direct.example",
            fallback_host: "www.yjsnpi.com",
            ..VarContext::default()
        };
        assert_eq!(eval("{host}", &ctx), "direct.example");
    }

    #[test]
    fn fullpath_concatenates() {
        let ctx = VarContext {
            path: "/hello/world",
            query: "a=1",
            fragment: "yjsnpi",
            ..VarContext::default()
        };
        assert_eq!(eval("{fullpath}", &ctx), "/hello/world?a=1#yjsnpi");

        let ctx = VarContext {
            path: "/hello",
            ..VarContext::default()
        };
        assert_eq!(eval("{fullpath}", &ctx), "/hello");
    }

    #[test]
    fn literal_text_passes_through() {
        let ctx = VarContext::default();
        assert_eq!(eval("no variables here", &ctx), "no variables here");
    }

    #[test]
    fn chain_flattens_to_plain_concatenation() {
        let ctx = VarContext {
            path: "/a/b",
            ..VarContext::default()
        };
        // Nested chains evaluate identically to a flat one.
        let nested = Variable::Chain(vec![
            Variable::Chain(vec![
                Variable::Const("x".to_string()),
                Variable::Const("y".to_string()),
            ]),
            Variable::Const("z".to_string()),
        ]);
        let flat = Variable::Chain(vec![
            Variable::Const("x".to_string()),
            Variable::Const("y".to_string()),
            Variable::Const("z".to_string()),
        ]);
        assert_eq!(nested.eval(&ctx), flat.eval(&ctx));
    }

    #[test]
    fn invalid_parameter_shapes_fail() {
        assert!(compile_param("{path:x}").is_err());
        assert!(compile_param("{path[a:b]}").is_err());
        assert!(compile_param("{seg}").is_err());
        assert!(compile_param("{query:[]}").is_err());
        assert!(compile_param("{^query}").is_err());
        assert!(compile_param("{mux}").is_err());
        assert!(compile_param("{re[x]}").is_err());
        assert!(compile_param("{nonsense}").is_err());
    }

    #[test]
    fn query_escape_matches_form_rules() {
        assert_eq!(query_escape("a b"), "a+b");
        assert_eq!(query_escape("*"), "%2A");
        assert_eq!(query_escape("safe-_.~"), "safe-_.~");
        assert_eq!(query_escape("a/b"), "a%2Fb");
    }
}
