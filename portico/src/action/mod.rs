//! Action pipeline
//!
//! Every routing rule is a list of action strings applied outermost first.
//! Each action either wraps the handler below it (request-direction
//! actions), installs a response modifier into the terminal handler, or is
//! itself the terminal (`proxy`, `redirect`, `wwwroot`, implicit 404).
//!
//! An action string is `cmd arg1 arg2 …` with backslash escapes and
//! single/double-quoted runs; arguments may embed `{...}` interpolations
//! (see [`variable`]).

pub mod proxy;
pub mod redirect;
pub mod req_header;
pub mod rsp_modify;
pub mod variable;
pub mod wwwroot;

use async_trait::async_trait;
use axum::body::Body;
use axum::response::Response;
use http::{Request, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use rsp_modify::{ContentChain, HeaderChain, RspContentModifier, RspHeaderModifier};

/// A request-scoped handler in the compiled chain.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, req: Request<Body>) -> Response;
}

/// A handler chain under construction.
///
/// Terminal builders create the chain and hand out capability handles for
/// their response-modification slots; modifier builders require the
/// matching handle and queue their modifier. [`Compiled::finalize`] locks
/// the queued modifiers into the terminal handler.
pub struct Compiled {
    pub handler: Arc<dyn ActionHandler>,
    header_chain: Option<Arc<HeaderChain>>,
    content_chain: Option<Arc<ContentChain>>,
    pending_header: Vec<Box<dyn RspHeaderModifier>>,
    pending_content: Vec<Box<dyn RspContentModifier>>,
}

impl Compiled {
    /// A terminal without response-modification capabilities.
    pub fn terminal(handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            handler,
            header_chain: None,
            content_chain: None,
            pending_header: Vec::new(),
            pending_content: Vec::new(),
        }
    }

    /// A terminal exposing both response-modification capabilities.
    pub fn mutable_terminal(
        handler: Arc<dyn ActionHandler>,
        header_chain: Arc<HeaderChain>,
        content_chain: Arc<ContentChain>,
    ) -> Self {
        Self {
            handler,
            header_chain: Some(header_chain),
            content_chain: Some(content_chain),
            pending_header: Vec::new(),
            pending_content: Vec::new(),
        }
    }

    /// The implicit innermost handler of every rule.
    pub fn not_found() -> Self {
        static NOT_FOUND: OnceLock<Arc<NotFoundHandler>> = OnceLock::new();
        let handler = NOT_FOUND.get_or_init(|| Arc::new(NotFoundHandler)).clone();
        Self::terminal(handler)
    }

    /// Replace the handler with a wrapper around the current one, keeping
    /// the terminal's capability handles intact.
    pub fn wrap(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Queue a response-header modifier; fails when the terminal is not
    /// header-mutable.
    pub fn add_header_modifier(
        &mut self,
        action: &'static str,
        modifier: Box<dyn RspHeaderModifier>,
    ) -> Result<()> {
        if self.header_chain.is_none() {
            return Err(Error::CapabilityMissing { action });
        }
        self.pending_header.push(modifier);
        Ok(())
    }

    /// Queue a response-content modifier; fails when the terminal is not
    /// content-mutable.
    pub fn add_content_modifier(
        &mut self,
        action: &'static str,
        modifier: Box<dyn RspContentModifier>,
    ) -> Result<()> {
        if self.content_chain.is_none() {
            return Err(Error::CapabilityMissing { action });
        }
        self.pending_content.push(modifier);
        Ok(())
    }

    /// Install queued modifiers into the terminal and return the finished
    /// chain. Modifiers run in the order they were queued, which is the
    /// reverse of their textual order, so the outermost action touches the
    /// response last.
    pub fn finalize(self) -> Arc<dyn ActionHandler> {
        if let Some(chain) = &self.header_chain {
            chain.install(self.pending_header);
        }
        if let Some(chain) = &self.content_chain {
            chain.install(self.pending_content);
        }
        self.handler
    }
}

type Builder = fn(&[String], Compiled) -> Result<Compiled>;

fn builders() -> &'static HashMap<&'static str, Builder> {
    static REGISTRY: OnceLock<HashMap<&'static str, Builder>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<&'static str, Builder> = HashMap::new();
        req_header::register(&mut map);
        redirect::register(&mut map);
        proxy::register(&mut map);
        rsp_modify::register(&mut map);
        wwwroot::register(&mut map);
        map
    })
}

/// Compile a full rule: actions wrap the implicit 404 leaf from the inside
/// out, so the first action in the list is outermost on the request path.
pub fn compile_rule(actions: &[String]) -> Result<Arc<dyn ActionHandler>> {
    let mut compiled = Compiled::not_found();
    for action in actions.iter().rev() {
        compiled = build_handler(action, compiled)?;
    }
    Ok(compiled.finalize())
}

/// Look up the action command and let its builder wrap `underlying`.
pub fn build_handler(action: &str, underlying: Compiled) -> Result<Compiled> {
    let (cmd, args) = compile_action(action)?;
    let builder = builders()
        .get(cmd.as_str())
        .ok_or_else(|| Error::UnknownAction(cmd.clone()))?;
    builder(&args, underlying)
}

/// Split an action string into its command and arguments.
pub fn compile_action(action: &str) -> Result<(String, Vec<String>)> {
    let action = action.trim_matches([' ', '\r', '\n', '\t']);
    if action.is_empty() {
        return Err(Error::EmptyAction);
    }

    match action.find(is_whitespace_char) {
        None => Ok((action.to_string(), Vec::new())),
        Some(idx) => {
            let cmd = action[..idx].to_string();
            let rest = action[idx..].trim_matches([' ', '\r', '\n', '\t']);
            Ok((cmd, split_fields(rest)))
        }
    }
}

fn is_whitespace_char(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\r' | '\n')
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

#[derive(Clone, Copy, PartialEq)]
enum TokenState {
    Normal,
    Whitespace,
    Escape,
    SingleQuoted,
    DoubleQuoted,
}

/// Tokenize an argument run. Four-state automaton over bytes: whitespace
/// separates tokens, `\X` yields literal `X`, quoted runs honor no escapes
/// and end at the matching quote. An unmatched quote consumes to the end
/// of the string; a trailing backslash contributes nothing.
fn split_fields(field: &str) -> Vec<String> {
    if field.is_empty() {
        return Vec::new();
    }

    let bytes = field.as_bytes();
    let mut out = Vec::new();
    let mut curr = Vec::new();
    let mut state = TokenState::Normal;
    let mut idx = 0usize;

    while idx < bytes.len() {
        let ch = bytes[idx];
        match state {
            TokenState::Normal => {
                idx += 1;
                if is_whitespace(ch) {
                    if !curr.is_empty() {
                        out.push(String::from_utf8_lossy(&curr).into_owned());
                        curr.clear();
                    }
                    state = TokenState::Whitespace;
                } else if ch == b'\\' {
                    state = TokenState::Escape;
                } else if ch == b'\'' {
                    state = TokenState::SingleQuoted;
                } else if ch == b'"' {
                    state = TokenState::DoubleQuoted;
                } else {
                    curr.push(ch);
                }
            }
            TokenState::Whitespace => {
                if is_whitespace(ch) {
                    idx += 1;
                } else {
                    state = TokenState::Normal;
                }
            }
            TokenState::Escape => {
                curr.push(ch);
                idx += 1;
                state = TokenState::Normal;
            }
            TokenState::SingleQuoted => {
                idx += 1;
                if ch == b'\'' {
                    state = TokenState::Normal;
                } else {
                    curr.push(ch);
                }
            }
            TokenState::DoubleQuoted => {
                idx += 1;
                if ch == b'"' {
                    state = TokenState::Normal;
                } else {
                    curr.push(ch);
                }
            }
        }
    }

    if !curr.is_empty() {
        out.push(String::from_utf8_lossy(&curr).into_owned());
    }

    out
}

/// Terminal that answers 404 for everything.
struct NotFoundHandler;

#[async_trait]
impl ActionHandler for NotFoundHandler {
    async fn handle(&self, _req: Request<Body>) -> Response {
        text_response(StatusCode::NOT_FOUND, "404 page not found")
    }
}

/// Small plain-text response helper shared by the action handlers.
pub(crate) fn text_response(status: StatusCode, message: impl Into<String>) -> Response {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(action: &str) -> (String, Vec<String>) {
        compile_action(action).expect("action compiles")
    }

    #[test]
    fn bare_command_has_no_args() {
        let (cmd, args) = parse("  wwwroot  ");
        assert_eq!(cmd, "wwwroot");
        assert!(args.is_empty());
    }

    #[test]
    fn whitespace_separates_args() {
        let (cmd, args) = parse("set-header \t X-Real-IP   1.2.3.4 ");
        assert_eq!(cmd, "set-header");
        assert_eq!(args, vec!["X-Real-IP", "1.2.3.4"]);
    }

    #[test]
    fn plain_args_round_trip() {
        let original = vec!["alpha", "beta", "gamma-3"];
        let joined = format!("cmd {}", original.join(" "));
        let (_, args) = parse(&joined);
        assert_eq!(args, original);
    }

    #[test]
    fn quotes_preserve_whitespace() {
        let (_, args) = parse(r#"cmd "hello world" 'single quoted'"#);
        assert_eq!(args, vec!["hello world", "single quoted"]);
    }

    #[test]
    fn quotes_honor_no_escapes() {
        let (_, args) = parse(r#"cmd "back\slash""#);
        assert_eq!(args, vec![r"back\slash"]);
    }

    #[test]
    fn backslash_escapes_anything() {
        let (_, args) = parse(r#"cmd a\ b \{literal\}"#);
        assert_eq!(args, vec!["a b", "{literal}"]);
    }

    #[test]
    fn adjacent_quoted_runs_join() {
        let (_, args) = parse(r#"cmd "ab"'cd'ef"#);
        assert_eq!(args, vec!["abcdef"]);
    }

    #[test]
    fn unmatched_quote_consumes_to_end() {
        let (_, args) = parse(r#"cmd "open ended"#);
        assert_eq!(args, vec!["open ended"]);
    }

    #[test]
    fn trailing_backslash_is_dropped() {
        let (_, args) = parse("cmd abc\\");
        assert_eq!(args, vec!["abc"]);
    }

    #[test]
    fn empty_action_fails() {
        assert!(matches!(compile_action("   \r\n"), Err(Error::EmptyAction)));
    }

    #[test]
    fn unknown_action_fails() {
        let err = build_handler("frobnicate now", Compiled::not_found());
        assert!(matches!(err, Err(Error::UnknownAction(cmd)) if cmd == "frobnicate"));
    }

    #[tokio::test]
    async fn empty_rule_answers_404() {
        let handler = compile_rule(&[]).expect("compiles");
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let rsp = handler.handle(req).await;
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }
}
