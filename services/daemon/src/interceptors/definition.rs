//! Declarative interceptor definitions.
//!
//! A definition is one TOML file in `.procsi/interceptors/` carrying a name,
//! an optional `[match]` block, and exactly one action block:
//!
//! ```toml
//! name = "mock-users"
//!
//! [match]
//! methods = ["GET"]
//! host_contains = "api.example.com"
//! path_prefix = "/v1/users"
//!
//! [mock]
//! status = 200
//! body = '{"users":[]}'
//!
//! [mock.headers]
//! content-type = "application/json"
//! ```
//!
//! `[modify]` forwards and rewrites the upstream response (status override,
//! header sets, `body_find`/`body_replace`, or a `body_template` where
//! `{{upstream_body}}` splices the upstream body). `[observe]` forwards and
//! optionally logs. Definitions compile to the same [`Interceptor`] trait as
//! natively registered handlers.

use super::{
    ForwardError, HandlerCtx, HandlerError, HandlerResponse, InterceptRequest, Interceptor,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

// ---------------------------------------------------------------------------
// TOML schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DefinitionFile {
    name: String,
    #[serde(rename = "match")]
    match_spec: Option<MatchSpec>,
    mock: Option<MockSpec>,
    modify: Option<ModifySpec>,
    observe: Option<ObserveSpec>,
}

#[derive(Debug, Default, Deserialize)]
struct MatchSpec {
    methods: Option<Vec<String>>,
    host_contains: Option<String>,
    path_prefix: Option<String>,
    url_regex: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MockSpec {
    status: u16,
    headers: Option<BTreeMap<String, String>>,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModifySpec {
    status: Option<u16>,
    set_headers: Option<BTreeMap<String, String>>,
    body_find: Option<String>,
    body_replace: Option<String>,
    body_template: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObserveSpec {
    message: Option<String>,
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("name must not be empty")]
    EmptyName,
    #[error("exactly one of [mock], [modify], [observe] is required")]
    ActionCount,
    #[error("url_regex: {0}")]
    Regex(#[from] regex::Error),
    #[error("body_replace requires body_find")]
    ReplaceWithoutFind,
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Action {
    Mock {
        status: u16,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    },
    Modify {
        status: Option<u16>,
        set_headers: Vec<(String, String)>,
        body_find: Option<String>,
        body_replace: Option<String>,
        body_template: Option<String>,
    },
    Observe {
        message: Option<String>,
    },
}

#[derive(Debug)]
struct Matcher {
    methods: Vec<String>,
    host_contains: Option<String>,
    path_prefix: Option<String>,
    url_regex: Option<regex::Regex>,
}

impl Matcher {
    fn matches(&self, request: &InterceptRequest) -> bool {
        if !self.methods.is_empty()
            && !self
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&request.method))
        {
            return false;
        }
        if let Some(host) = &self.host_contains {
            if !request.host.to_ascii_lowercase().contains(&host.to_ascii_lowercase()) {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !request.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(re) = &self.url_regex {
            if !re.is_match(&request.url) {
                return false;
            }
        }
        true
    }
}

/// A compiled definition-file interceptor.
pub struct DefinitionInterceptor {
    name: String,
    source_file: String,
    matcher: Option<Matcher>,
    action: Action,
}

/// Parse and compile one definition file's contents.
pub fn compile(source_file: &Path, toml_text: &str) -> Result<DefinitionInterceptor, DefinitionError> {
    let parsed: DefinitionFile = toml::from_str(toml_text)?;
    if parsed.name.trim().is_empty() {
        return Err(DefinitionError::EmptyName);
    }

    let action_count = usize::from(parsed.mock.is_some())
        + usize::from(parsed.modify.is_some())
        + usize::from(parsed.observe.is_some());
    if action_count != 1 {
        return Err(DefinitionError::ActionCount);
    }

    let matcher = parsed
        .match_spec
        .map(|m| -> Result<Matcher, DefinitionError> {
            Ok(Matcher {
                methods: m.methods.unwrap_or_default(),
                host_contains: m.host_contains,
                path_prefix: m.path_prefix,
                url_regex: m.url_regex.as_deref().map(regex::Regex::new).transpose()?,
            })
        })
        .transpose()?;

    let action = if let Some(mock) = parsed.mock {
        Action::Mock {
            status: mock.status,
            headers: header_pairs(mock.headers),
            body: mock.body.map(String::into_bytes),
        }
    } else if let Some(modify) = parsed.modify {
        if modify.body_replace.is_some() && modify.body_find.is_none() {
            return Err(DefinitionError::ReplaceWithoutFind);
        }
        Action::Modify {
            status: modify.status,
            set_headers: header_pairs(modify.set_headers),
            body_find: modify.body_find,
            body_replace: modify.body_replace,
            body_template: modify.body_template,
        }
    } else {
        let observe = parsed.observe.unwrap_or(ObserveSpec { message: None });
        Action::Observe {
            message: observe.message,
        }
    };

    Ok(DefinitionInterceptor {
        name: parsed.name,
        source_file: source_file.display().to_string(),
        matcher,
        action,
    })
}

fn header_pairs(map: Option<BTreeMap<String, String>>) -> Vec<(String, String)> {
    map.map(|m| m.into_iter().collect()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Interceptor impl
// ---------------------------------------------------------------------------

impl Interceptor for DefinitionInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_file(&self) -> &str {
        &self.source_file
    }

    fn action_kind(&self) -> &'static str {
        match self.action {
            Action::Mock { .. } => "mock",
            Action::Modify { .. } => "modify",
            Action::Observe { .. } => "observe",
        }
    }

    fn matches<'a>(
        &'a self,
        request: &'a InterceptRequest,
    ) -> BoxFuture<'a, Result<bool, HandlerError>> {
        let verdict = self.matcher.as_ref().map_or(true, |m| m.matches(request));
        async move { Ok(verdict) }.boxed()
    }

    fn handle(
        &self,
        ctx: HandlerCtx,
    ) -> BoxFuture<'static, Result<Option<HandlerResponse>, HandlerError>> {
        match &self.action {
            Action::Mock {
                status,
                headers,
                body,
            } => {
                let response = HandlerResponse {
                    status: *status,
                    headers: headers.clone(),
                    body: body.clone(),
                };
                async move { Ok(Some(response)) }.boxed()
            }
            Action::Modify {
                status,
                set_headers,
                body_find,
                body_replace,
                body_template,
            } => {
                let status = *status;
                let set_headers = set_headers.clone();
                let body_find = body_find.clone();
                let body_replace = body_replace.clone();
                let body_template = body_template.clone();
                async move {
                    let upstream = ctx.forward.forward().await?;
                    let upstream_text = String::from_utf8_lossy(&upstream.body).into_owned();

                    let body = if let Some(template) = body_template {
                        template.replace("{{upstream_body}}", &upstream_text).into_bytes()
                    } else if let (Some(find), Some(replace)) = (&body_find, &body_replace) {
                        upstream_text.replace(find.as_str(), replace).into_bytes()
                    } else {
                        upstream.body.clone()
                    };

                    let mut headers = upstream.headers.clone();
                    for (name, value) in set_headers {
                        match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
                            Some(slot) => slot.1 = value,
                            None => headers.push((name, value)),
                        }
                    }

                    Ok(Some(HandlerResponse {
                        status: status.unwrap_or(upstream.status),
                        headers,
                        body: Some(body),
                    }))
                }
                .boxed()
            }
            Action::Observe { message } => {
                let message = message.clone();
                async move {
                    match ctx.forward.forward().await {
                        Ok(_) => {}
                        // The exchange died under us; nothing to observe.
                        Err(ForwardError::Aborted) => return Ok(None),
                        Err(e) => return Err(e.into()),
                    }
                    if let Some(message) = message {
                        ctx.log(&message);
                    }
                    Ok(None)
                }
                .boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(method: &str, url: &str, host: &str, path: &str) -> InterceptRequest {
        InterceptRequest {
            id: 1,
            method: method.to_owned(),
            url: url.to_owned(),
            host: host.to_owned(),
            path: path.to_owned(),
            headers: vec![],
            body: None,
        }
    }

    #[test]
    fn compiles_a_mock_definition() {
        let toml_text = r#"
            name = "mock-users"

            [match]
            methods = ["GET"]
            path_prefix = "/v1/users"

            [mock]
            status = 201
            body = '{"mocked":true}'

            [mock.headers]
            content-type = "application/json"
        "#;
        let compiled = compile(Path::new("mock-users.toml"), toml_text).unwrap();
        assert_eq!(compiled.name(), "mock-users");
        assert_eq!(compiled.action_kind(), "mock");
    }

    #[test]
    fn rejects_zero_or_two_actions() {
        let none = "name = \"x\"\n";
        assert!(matches!(
            compile(Path::new("x.toml"), none),
            Err(DefinitionError::ActionCount)
        ));

        let both = r#"
            name = "x"
            [mock]
            status = 200
            [observe]
        "#;
        assert!(matches!(
            compile(Path::new("x.toml"), both),
            Err(DefinitionError::ActionCount)
        ));
    }

    #[test]
    fn rejects_invalid_regex() {
        let toml_text = r#"
            name = "x"
            [match]
            url_regex = "("
            [observe]
        "#;
        assert!(matches!(
            compile(Path::new("x.toml"), toml_text),
            Err(DefinitionError::Regex(_))
        ));
    }

    #[tokio::test]
    async fn matcher_composes_predicates() {
        let toml_text = r#"
            name = "narrow"
            [match]
            methods = ["get", "POST"]
            host_contains = "API.example"
            path_prefix = "/v1"
            [observe]
        "#;
        let compiled = compile(Path::new("narrow.toml"), toml_text).unwrap();

        let hit = request("GET", "http://api.example.com/v1/users", "api.example.com", "/v1/users");
        assert_eq!(compiled.matches(&hit).await.unwrap(), true);

        let wrong_method = request("DELETE", "http://api.example.com/v1/users", "api.example.com", "/v1/users");
        assert_eq!(compiled.matches(&wrong_method).await.unwrap(), false);

        let wrong_path = request("GET", "http://api.example.com/v2/users", "api.example.com", "/v2/users");
        assert_eq!(compiled.matches(&wrong_path).await.unwrap(), false);
    }

    #[tokio::test]
    async fn missing_match_block_matches_everything() {
        let toml_text = r#"
            name = "all"
            [observe]
        "#;
        let compiled = compile(Path::new("all.toml"), toml_text).unwrap();
        let req = request("PUT", "http://anywhere/x", "anywhere", "/x");
        assert_eq!(compiled.matches(&req).await.unwrap(), true);
    }
}
