//! Request predicates.
//!
//! A predicate either needs only the request head (method, url, headers) or
//! requires the fully buffered body. The matcher uses that distinction to
//! resolve head-only rules before the body has finished arriving.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RuleDefinitionError;

/// Wire-facing predicate definition, as registered through the control
/// plane or built in-process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "match", rename_all = "camelCase")]
pub enum Predicate {
    Method { value: String },
    Path { value: String },
    PathRegex { pattern: String },
    Url { value: String },
    Hostname { value: String },
    Query { name: String, value: String },
    Header { name: String, value: String },
    BodyEquals { value: String },
    BodyIncludes { value: String },
    BodyJson { value: serde_json::Value },
}

/// A predicate with its regular expressions validated and compiled once at
/// rule registration time.
#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    Method(String),
    Path(String),
    PathRegex(Regex),
    Url(String),
    Hostname(String),
    Query { name: String, value: String },
    Header { name: String, value: String },
    BodyEquals(String),
    BodyIncludes(String),
    BodyJson(serde_json::Value),
}

/// The request fields a predicate is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub hostname: Option<&'a str>,
    pub headers: &'a [(String, String)],
    /// Decoded body text; `None` until the body has fully arrived.
    pub body_text: Option<&'a str>,
}

impl CompiledPredicate {
    pub fn compile(def: &Predicate) -> Result<Self, RuleDefinitionError> {
        Ok(match def {
            Predicate::Method { value } => CompiledPredicate::Method(value.clone()),
            Predicate::Path { value } => CompiledPredicate::Path(value.clone()),
            Predicate::PathRegex { pattern } => {
                let regex = Regex::new(pattern).map_err(|source| {
                    RuleDefinitionError::InvalidRegex {
                        pattern: pattern.clone(),
                        source,
                    }
                })?;
                CompiledPredicate::PathRegex(regex)
            }
            Predicate::Url { value } => CompiledPredicate::Url(value.clone()),
            Predicate::Hostname { value } => CompiledPredicate::Hostname(value.clone()),
            Predicate::Query { name, value } => CompiledPredicate::Query {
                name: name.clone(),
                value: value.clone(),
            },
            Predicate::Header { name, value } => CompiledPredicate::Header {
                name: name.clone(),
                value: value.clone(),
            },
            Predicate::BodyEquals { value } => CompiledPredicate::BodyEquals(value.clone()),
            Predicate::BodyIncludes { value } => CompiledPredicate::BodyIncludes(value.clone()),
            Predicate::BodyJson { value } => CompiledPredicate::BodyJson(value.clone()),
        })
    }

    /// Whether evaluation requires the fully buffered body.
    pub fn needs_body(&self) -> bool {
        matches!(
            self,
            CompiledPredicate::BodyEquals(_)
                | CompiledPredicate::BodyIncludes(_)
                | CompiledPredicate::BodyJson(_)
        )
    }

    pub fn eval(&self, ctx: &MatchContext<'_>) -> bool {
        match self {
            CompiledPredicate::Method(value) => ctx.method.eq_ignore_ascii_case(value),
            CompiledPredicate::Path(value) => ctx.path == value,
            CompiledPredicate::PathRegex(regex) => regex.is_match(ctx.path),
            CompiledPredicate::Url(value) => ctx.url == value,
            CompiledPredicate::Hostname(value) => ctx
                .hostname
                .is_some_and(|hostname| hostname.eq_ignore_ascii_case(value)),
            CompiledPredicate::Query { name, value } => query_pairs(ctx.query)
                .any(|(n, v)| n == name.as_str() && v == value.as_str()),
            CompiledPredicate::Header { name, value } => ctx
                .headers
                .iter()
                .any(|(n, v)| n.eq_ignore_ascii_case(name) && v == value),
            CompiledPredicate::BodyEquals(value) => ctx.body_text == Some(value.as_str()),
            CompiledPredicate::BodyIncludes(value) => {
                ctx.body_text.is_some_and(|body| body.contains(value))
            }
            CompiledPredicate::BodyJson(value) => ctx
                .body_text
                .and_then(|body| serde_json::from_str::<serde_json::Value>(body).ok())
                .is_some_and(|parsed| parsed == *value),
        }
    }
}

fn query_pairs(query: Option<&str>) -> impl Iterator<Item = (&str, &str)> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (name, value),
            None => (pair, ""),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        method: &'a str,
        path: &'a str,
        headers: &'a [(String, String)],
        body: Option<&'a str>,
    ) -> MatchContext<'a> {
        MatchContext {
            method,
            url: path,
            path,
            query: None,
            hostname: None,
            headers,
            body_text: body,
        }
    }

    #[test]
    fn method_match_is_case_insensitive() {
        let pred = CompiledPredicate::compile(&Predicate::Method {
            value: "GET".into(),
        })
        .unwrap();
        assert!(pred.eval(&ctx("get", "/", &[], None)));
        assert!(!pred.eval(&ctx("POST", "/", &[], None)));
    }

    #[test]
    fn path_regex_compiles_once_and_matches() {
        let pred = CompiledPredicate::compile(&Predicate::PathRegex {
            pattern: "^/api/v[0-9]+/users$".into(),
        })
        .unwrap();
        assert!(pred.eval(&ctx("GET", "/api/v2/users", &[], None)));
        assert!(!pred.eval(&ctx("GET", "/api/users", &[], None)));
    }

    #[test]
    fn invalid_regex_is_rejected_at_compile_time() {
        let err = CompiledPredicate::compile(&Predicate::PathRegex {
            pattern: "(".into(),
        });
        assert!(err.is_err());
    }

    #[test]
    fn header_names_match_case_insensitively() {
        let headers = vec![("X-Token".to_string(), "abc".to_string())];
        let pred = CompiledPredicate::compile(&Predicate::Header {
            name: "x-token".into(),
            value: "abc".into(),
        })
        .unwrap();
        assert!(pred.eval(&ctx("GET", "/", &headers, None)));
    }

    #[test]
    fn query_predicate_matches_individual_pairs() {
        let pred = CompiledPredicate::compile(&Predicate::Query {
            name: "page".into(),
            value: "2".into(),
        })
        .unwrap();
        let context = MatchContext {
            query: Some("sort=asc&page=2"),
            ..ctx("GET", "/list", &[], None)
        };
        assert!(pred.eval(&context));
    }

    #[test]
    fn body_predicates_declare_body_dependence() {
        let body_pred = CompiledPredicate::compile(&Predicate::BodyIncludes {
            value: "hello".into(),
        })
        .unwrap();
        let head_pred = CompiledPredicate::compile(&Predicate::Path { value: "/".into() }).unwrap();
        assert!(body_pred.needs_body());
        assert!(!head_pred.needs_body());
    }

    #[test]
    fn body_json_matches_structurally() {
        let pred = CompiledPredicate::compile(&Predicate::BodyJson {
            value: serde_json::json!({"a": 1}),
        })
        .unwrap();
        assert!(pred.eval(&ctx("POST", "/", &[], Some("{ \"a\": 1 }"))));
        assert!(!pred.eval(&ctx("POST", "/", &[], Some("{ \"a\": 2 }"))));
        assert!(!pred.eval(&ctx("POST", "/", &[], None)));
    }

    #[test]
    fn predicate_wire_format_round_trips() {
        let json = r#"{"match":"header","name":"x-token","value":"abc"}"#;
        let pred: Predicate = serde_json::from_str(json).unwrap();
        assert_eq!(
            pred,
            Predicate::Header {
                name: "x-token".into(),
                value: "abc".into()
            }
        );
    }
}
