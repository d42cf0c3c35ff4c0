use std::collections::HashMap;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::observable::Observable;
use super::root::RootAnalysis;

/// Compiled module conditions, cached by the full `<type>:<payload>`
/// condition string. A condition that fails to compile is cached as `None`
/// and fails closed; the compile error is logged once.
static COMPILED_CONDITIONS: Lazy<DashMap<String, Option<CompiledCondition>>> =
    Lazy::new(DashMap::new);

/// Declarative registration record for an analysis module: what it accepts,
/// how it is gated, how it is versioned and whether its results are cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisModuleType {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Semver-style code version. Workers with a stale version are refused.
    #[serde(default = "default_version")]
    pub version: String,
    /// Order-independent resource fingerprint (rule-set revisions and the
    /// like), orthogonal to the code version.
    #[serde(default)]
    pub extended_version: Vec<String>,
    /// Accepted observable types; empty accepts all.
    #[serde(default)]
    pub observable_types: Vec<String>,
    /// Directives that must all be present on the observable.
    #[serde(default)]
    pub directives: Vec<String>,
    /// Tags that must all be present on the observable.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Other module names whose analysis must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Analysis modes this module runs in; empty runs in all modes.
    #[serde(default)]
    pub modes: Vec<String>,
    /// Gating conditions, each `re:<regex>` or `expr:<expression>`.
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Seconds a worker has to complete a claimed request.
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    /// Seconds results stay cached; None disables caching entirely.
    #[serde(default)]
    pub cache_ttl: Option<i64>,
    /// Manual modules only run when explicitly requested per observable.
    #[serde(default)]
    pub manual: bool,
    /// Free-form classification tags ("sandbox", "splunk", ...).
    #[serde(default)]
    pub types: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_timeout() -> i64 {
    30
}

impl AnalysisModuleType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: default_version(),
            extended_version: Vec::new(),
            observable_types: Vec::new(),
            directives: Vec::new(),
            tags: Vec::new(),
            dependencies: Vec::new(),
            modes: Vec::new(),
            conditions: Vec::new(),
            timeout: default_timeout(),
            cache_ttl: None,
            manual: false,
            types: Vec::new(),
        }
    }

    pub fn version_matches(&self, other: &AnalysisModuleType) -> bool {
        self.name == other.name && self.version == other.version
    }

    pub fn extended_version_matches(&self, other: &AnalysisModuleType) -> bool {
        if !self.version_matches(other) {
            return false;
        }

        let mut ours = self.extended_version.clone();
        let mut theirs = other.extended_version.clone();
        ours.sort();
        theirs.sort();
        ours == theirs
    }

    /// The full acceptance predicate, evaluated in order. An explicit
    /// per-observable request overrides everything, including `manual`.
    pub fn accepts(
        &self,
        observable: &Observable,
        root: &RootAnalysis,
        registered: &HashMap<String, AnalysisModuleType>,
    ) -> bool {
        if observable.is_requested(&self.name) {
            return true;
        }

        if self.manual {
            return false;
        }

        if observable.is_excluded(&self.name) {
            return false;
        }

        if !self.modes.is_empty() {
            match root.analysis_mode.as_deref() {
                Some(mode) if self.modes.iter().any(|m| m == mode) => {},
                _ => return false,
            }
        }

        if !self.observable_types.is_empty()
            && !self.observable_types.iter().any(|t| *t == observable.observable_type)
        {
            return false;
        }

        for directive in &self.directives {
            if !observable.has_directive(directive) {
                return false;
            }
        }

        for tag in &self.tags {
            if !observable.has_tag(tag) {
                return false;
            }
        }

        for dependency in &self.dependencies {
            if !registered.contains_key(dependency) {
                tracing::debug!("{} has unknown dependency {}", observable, dependency);
                return false;
            }

            if !observable.analysis_completed(dependency) {
                return false;
            }
        }

        for condition in &self.conditions {
            if !self.condition_satisfied(condition, observable, root) {
                return false;
            }
        }

        if !observable.limited_analysis.is_empty() {
            return observable.limited_analysis.iter().any(|m| *m == self.name);
        }

        true
    }

    fn condition_satisfied(
        &self,
        condition: &str,
        observable: &Observable,
        root: &RootAnalysis,
    ) -> bool {
        let compiled = COMPILED_CONDITIONS
            .entry(condition.to_string())
            .or_insert_with(|| match CompiledCondition::compile(condition) {
                Ok(compiled) => Some(compiled),
                Err(error) => {
                    tracing::error!(
                        "condition {} of module type {} failed to compile: {}",
                        condition,
                        self.name,
                        error
                    );
                    None
                },
            })
            .clone();

        match compiled {
            Some(compiled) => compiled.evaluate(observable, root),
            None => false,
        }
    }
}

impl std::fmt::Display for AnalysisModuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.name, self.version)
    }
}

/// A compiled module condition. Regex conditions scan the key-sorted pretty
/// JSON form of the root; expression conditions evaluate a small fixed
/// vocabulary against the observable.
#[derive(Debug, Clone)]
enum CompiledCondition {
    Regex(Regex),
    Expression(ConditionExpr),
}

impl CompiledCondition {
    fn compile(condition: &str) -> Result<Self, String> {
        let (condition_type, payload) = condition
            .split_once(':')
            .ok_or_else(|| format!("condition {} is missing the type prefix", condition))?;

        match condition_type {
            "re" => Regex::new(payload).map(CompiledCondition::Regex).map_err(|e| e.to_string()),
            "expr" => ConditionExpr::parse(payload).map(CompiledCondition::Expression),
            other => Err(format!("unsupported condition type {}", other)),
        }
    }

    fn evaluate(&self, observable: &Observable, root: &RootAnalysis) -> bool {
        match self {
            CompiledCondition::Regex(regex) => match serde_json::to_string_pretty(root) {
                Ok(document) => regex.is_match(&document),
                Err(error) => {
                    tracing::error!("failed to serialize root {} for condition: {}", root.uuid, error);
                    false
                },
            },
            CompiledCondition::Expression(expr) => expr.evaluate(observable),
        }
    }
}

/// The expression condition language: boolean combinations of
/// `type == "x"`, `value != "y"`, `has_tag("t")` and `has_directive("d")`,
/// with `!`, `&&`, `||` and parentheses.
#[derive(Debug, Clone)]
enum ConditionExpr {
    TypeEquals(String),
    TypeNotEquals(String),
    ValueEquals(String),
    ValueNotEquals(String),
    HasTag(String),
    HasDirective(String),
    Not(Box<ConditionExpr>),
    And(Box<ConditionExpr>, Box<ConditionExpr>),
    Or(Box<ConditionExpr>, Box<ConditionExpr>),
}

impl ConditionExpr {
    fn parse(input: &str) -> Result<Self, String> {
        let tokens = tokenize(input)?;
        let mut parser = ExprParser { tokens, position: 0 };
        let expr = parser.parse_or()?;
        if parser.position != parser.tokens.len() {
            return Err(format!("unexpected trailing input at token {}", parser.position));
        }
        Ok(expr)
    }

    fn evaluate(&self, observable: &Observable) -> bool {
        match self {
            ConditionExpr::TypeEquals(value) => observable.observable_type == *value,
            ConditionExpr::TypeNotEquals(value) => observable.observable_type != *value,
            ConditionExpr::ValueEquals(value) => observable.value == *value,
            ConditionExpr::ValueNotEquals(value) => observable.value != *value,
            ConditionExpr::HasTag(tag) => observable.has_tag(tag),
            ConditionExpr::HasDirective(directive) => observable.has_directive(directive),
            ConditionExpr::Not(inner) => !inner.evaluate(observable),
            ConditionExpr::And(lhs, rhs) => lhs.evaluate(observable) && rhs.evaluate(observable),
            ConditionExpr::Or(lhs, rhs) => lhs.evaluate(observable) || rhs.evaluate(observable),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Equals,
    NotEquals,
    And,
    Or,
    Not,
    OpenParen,
    CloseParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            },
            '(' => {
                chars.next();
                tokens.push(Token::OpenParen);
            },
            ')' => {
                chars.next();
                tokens.push(Token::CloseParen);
            },
            '=' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err("expected == operator".to_string());
                }
                tokens.push(Token::Equals);
            },
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::NotEquals);
                } else {
                    tokens.push(Token::Not);
                }
            },
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err("expected && operator".to_string());
                }
                tokens.push(Token::And);
            },
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err("expected || operator".to_string());
                }
                tokens.push(Token::Or);
            },
            '"' => {
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => literal.push(c),
                        None => return Err("unterminated string literal".to_string()),
                    }
                }
                tokens.push(Token::Literal(literal));
            },
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            },
            other => return Err(format!("unexpected character {}", other)),
        }
    }

    Ok(tokens)
}

struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<ConditionExpr, String> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            expr = ConditionExpr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<ConditionExpr, String> {
        let mut expr = self.parse_atom()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_atom()?;
            expr = ConditionExpr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<ConditionExpr, String> {
        match self.next() {
            Some(Token::Not) => Ok(ConditionExpr::Not(Box::new(self.parse_atom()?))),
            Some(Token::OpenParen) => {
                let expr = self.parse_or()?;
                if self.next() != Some(Token::CloseParen) {
                    return Err("expected closing parenthesis".to_string());
                }
                Ok(expr)
            },
            Some(Token::Ident(ident)) => self.parse_predicate(ident),
            other => Err(format!("unexpected token {:?}", other)),
        }
    }

    fn parse_predicate(&mut self, ident: String) -> Result<ConditionExpr, String> {
        match ident.as_str() {
            "type" | "value" => {
                let operator = self.next();
                let literal = match self.next() {
                    Some(Token::Literal(literal)) => literal,
                    other => return Err(format!("expected string literal, found {:?}", other)),
                };
                match (ident.as_str(), operator) {
                    ("type", Some(Token::Equals)) => Ok(ConditionExpr::TypeEquals(literal)),
                    ("type", Some(Token::NotEquals)) => Ok(ConditionExpr::TypeNotEquals(literal)),
                    ("value", Some(Token::Equals)) => Ok(ConditionExpr::ValueEquals(literal)),
                    ("value", Some(Token::NotEquals)) => Ok(ConditionExpr::ValueNotEquals(literal)),
                    (_, other) => Err(format!("expected comparison operator, found {:?}", other)),
                }
            },
            "has_tag" | "has_directive" => {
                if self.next() != Some(Token::OpenParen) {
                    return Err(format!("expected ( after {}", ident));
                }
                let literal = match self.next() {
                    Some(Token::Literal(literal)) => literal,
                    other => return Err(format!("expected string literal, found {:?}", other)),
                };
                if self.next() != Some(Token::CloseParen) {
                    return Err(format!("expected ) to close {}", ident));
                }
                if ident == "has_tag" {
                    Ok(ConditionExpr::HasTag(literal))
                } else {
                    Ok(ConditionExpr::HasDirective(literal))
                }
            },
            other => Err(format!("unknown identifier {}", other)),
        }
    }
}
