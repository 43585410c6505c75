// vim: tw=80
//! Hierarchical key/section configuration store (spec §6, §4.9).
//!
//! Grammar:
//! ```text
//! file        := stmt*
//! stmt        := section | assign | call | include | define
//! section     := ident string? '{' stmt* '}'
//! assign      := ident '=' value ';'
//! call        := ident '(' (value (',' value)*)? ')' ';'
//! include     := '#include' string ';'
//! define      := 'define' ident value ';'
//! value       := string | bareword
//! ```
//! `call` statements are how funlists (`on-init { raw_write(1); }`) are
//! represented: each call becomes one entry of the task event's funlist,
//! in source order. `$(NAME)` inside any string value is expanded from the
//! `define` macro table before the value is stored.
use std::{collections::HashMap, fmt, fs, path::Path};

use crate::error::{FwupError, Result};

const MAX_INCLUDE_DEPTH: usize = 16;

/// A single statement inside a section body.
#[derive(Debug, Clone)]
pub enum Stmt {
    Assign(String, String),
    Call(String, Vec<String>),
    Section(Section),
}

/// A named (or anonymous) `{ ... }` block.
#[derive(Debug, Clone, Default)]
pub struct Section {
    pub kind: String,
    pub name: Option<String>,
    pub stmts: Vec<Stmt>,
}

impl Section {
    /// First assigned value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.stmts.iter().find_map(|s| match s {
            Stmt::Assign(k, v) if k == key => Some(v.as_str()),
            _ => None,
        })
    }

    pub fn get_u64(&self, key: &str) -> Result<u64> {
        let raw = self
            .get(key)
            .ok_or_else(|| FwupError::config(format!("missing key `{key}`")))?;
        parse_cint(raw).ok_or_else(|| {
            FwupError::config(format!("`{key}` is not a valid integer: {raw}"))
        })
    }

    pub fn get_u64_or(&self, key: &str, default: u64) -> Result<u64> {
        if self.get(key).is_some() { self.get_u64(key) } else { Ok(default) }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.get(key) {
            None => Ok(false),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => {
                Err(FwupError::config(format!("`{key}` is not a boolean: {other}")))
            }
        }
    }

    /// Funlist: ordered `(name, argv)` calls directly inside this section.
    pub fn calls(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.stmts.iter().filter_map(|s| match s {
            Stmt::Call(name, args) => Some((name.as_str(), args.as_slice())),
            _ => None,
        })
    }

    /// Child sections of the given `kind`, in source order.
    pub fn children(&self, kind: &str) -> impl Iterator<Item = &Section> {
        self.stmts.iter().filter_map(move |s| match s {
            Stmt::Section(sec) if sec.kind == kind => Some(sec),
            _ => None,
        })
    }

    pub fn child(&self, kind: &str, name: &str) -> Option<&Section> {
        self.children(kind).find(|s| s.name.as_deref() == Some(name))
    }

    /// Child sections of the given `kind`, mutable, in source order. Used
    /// by `create` mode to patch in the `blake2b-256`/`length`/
    /// `sparse-runs` keys it derives from the host filesystem.
    pub fn children_mut(&mut self, kind: &str) -> impl Iterator<Item = &mut Section> {
        self.stmts.iter_mut().filter_map(move |s| match s {
            Stmt::Section(sec) if sec.kind == kind => Some(sec),
            _ => None,
        })
    }

    /// Overwrites the first assignment of `key`, or appends one if none
    /// exists yet.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        for s in &mut self.stmts {
            if let Stmt::Assign(k, v) = s {
                if k == key {
                    *v = value;
                    return;
                }
            }
        }
        self.stmts.push(Stmt::Assign(key.to_string(), value));
    }

    /// Re-renders this section's statements in the grammar documented at
    /// the top of this module. `create` uses this on the whole config
    /// tree to produce the manifest entry embedded in the archive.
    fn write_conf(&self, out: &mut String, depth: usize) {
        let indent = "    ".repeat(depth);
        for stmt in &self.stmts {
            match stmt {
                Stmt::Assign(k, v) => {
                    out.push_str(&indent);
                    out.push_str(k);
                    out.push_str(" = \"");
                    escape_into(v, out);
                    out.push_str("\";\n");
                }
                Stmt::Call(name, args) => {
                    out.push_str(&indent);
                    out.push_str(name);
                    out.push('(');
                    for (i, a) in args.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push('"');
                        escape_into(a, out);
                        out.push('"');
                    }
                    out.push_str(");\n");
                }
                Stmt::Section(sec) => {
                    out.push_str(&indent);
                    out.push_str(&sec.kind);
                    if let Some(name) = &sec.name {
                        out.push_str(" \"");
                        escape_into(name, out);
                        out.push('"');
                    }
                    out.push_str(" {\n");
                    sec.write_conf(out, depth + 1);
                    out.push_str(&indent);
                    out.push_str("}\n");
                }
            }
        }
    }
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
}

impl Config {
    /// Renders the whole tree back into the `.conf` grammar; this is the
    /// manifest entry `create` embeds as the archive's first entry.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.root.write_conf(&mut out, 0);
        out
    }
}

/// The whole parsed configuration: a flat list of top-level sections.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub root: Section,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        let mut p = Parser::new(text);
        let root = p.parse_block(true, 0)?;
        Ok(Config { root })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| FwupError::io(format!("reading {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn sections(&self, kind: &str) -> impl Iterator<Item = &Section> {
        self.root.children(kind)
    }

    pub fn section(&self, kind: &str, name: &str) -> Option<&Section> {
        self.root.child(kind, name)
    }

    /// `meta-*` top-level assignments, for the `metadata` CLI mode.
    pub fn metadata(&self) -> impl Iterator<Item = (&str, &str)> {
        self.root.stmts.iter().filter_map(|s| match s {
            Stmt::Assign(k, v) if k.starts_with("meta-") => Some((k.as_str(), v.as_str())),
            _ => None,
        })
    }
}

/// Parses C-style integer literals: decimal by default, `0x`/`0X` hex, a
/// leading `0` followed by more digits is octal. Matches spec §4.2's rule
/// for action argv and is reused for config integer keys.
pub fn parse_cint(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    if s.len() > 1 && s.starts_with('0') {
        return u64::from_str_radix(&s[1..], 8).ok();
    }
    s.parse::<u64>().ok()
}

#[derive(Debug, PartialEq, Eq, Clone)]
enum Tok {
    Ident(String),
    Str(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Comma,
    Eq,
    Semi,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "`{s}`"),
            Tok::Str(s) => write!(f, "\"{s}\""),
            Tok::LBrace => write!(f, "'{{'"),
            Tok::RBrace => write!(f, "'}}'"),
            Tok::LParen => write!(f, "'('"),
            Tok::RParen => write!(f, "')'"),
            Tok::Comma => write!(f, "','"),
            Tok::Eq => write!(f, "'='"),
            Tok::Semi => write!(f, "';'"),
            Tok::Eof => write!(f, "end of input"),
        }
    }
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Lexer { chars: text.chars().peekable() }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some('/') => {
                    let mut clone = self.chars.clone();
                    clone.next();
                    if clone.peek() == Some(&'/') {
                        for c in self.chars.by_ref() {
                            if c == '\n' {
                                break;
                            }
                        }
                    } else {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    fn next_tok(&mut self) -> Result<Tok> {
        self.skip_trivia();
        let c = match self.chars.peek() {
            None => return Ok(Tok::Eof),
            Some(&c) => c,
        };
        match c {
            '{' => { self.chars.next(); Ok(Tok::LBrace) }
            '}' => { self.chars.next(); Ok(Tok::RBrace) }
            '(' => { self.chars.next(); Ok(Tok::LParen) }
            ')' => { self.chars.next(); Ok(Tok::RParen) }
            ',' => { self.chars.next(); Ok(Tok::Comma) }
            '=' => { self.chars.next(); Ok(Tok::Eq) }
            ';' => { self.chars.next(); Ok(Tok::Semi) }
            '"' => self.lex_string(),
            '#' => self.lex_directive(),
            _ => self.lex_bareword(),
        }
    }

    fn lex_string(&mut self) -> Result<Tok> {
        self.chars.next(); // opening quote
        let mut s = String::new();
        loop {
            match self.chars.next() {
                None => return Err(FwupError::config("unterminated string literal")),
                Some('"') => break,
                Some('\\') => match self.chars.next() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(other) => s.push(other),
                    None => return Err(FwupError::config("unterminated escape")),
                },
                Some(other) => s.push(other),
            }
        }
        Ok(Tok::Str(s))
    }

    fn lex_directive(&mut self) -> Result<Tok> {
        // Only `#include` is a directive; anything else starting with '#'
        // is a validation error rather than silently ignored.
        let mut word = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                break;
            }
            word.push(c);
            self.chars.next();
        }
        Ok(Tok::Ident(word))
    }

    fn lex_bareword(&mut self) -> Result<Tok> {
        let first = *self.chars.peek().unwrap();
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() || "{}(),=;\"".contains(c) {
                break;
            }
            s.push(c);
            self.chars.next();
        }
        if s.is_empty() {
            return Err(FwupError::config(format!("unexpected character '{first}'")));
        }
        Ok(Tok::Ident(s))
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<Tok>,
    macros: HashMap<String, String>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Parser { lexer: Lexer::new(text), peeked: None, macros: HashMap::new() }
    }

    fn peek(&mut self) -> Result<&Tok> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lexer.next_tok()?);
        }
        Ok(self.peeked.as_ref().unwrap())
    }

    fn bump(&mut self) -> Result<Tok> {
        match self.peeked.take() {
            Some(t) => Ok(t),
            None => self.lexer.next_tok(),
        }
    }

    fn expect(&mut self, want: &Tok) -> Result<()> {
        let got = self.bump()?;
        if &got == want {
            Ok(())
        } else {
            Err(FwupError::config(format!("expected {want}, found {got}")))
        }
    }

    /// Parses a brace-delimited (or, at `depth == 0`, whole-file) sequence
    /// of statements.
    fn parse_block(&mut self, top: bool, depth: usize) -> Result<Section> {
        let mut sec = Section::default();
        loop {
            match self.peek()? {
                Tok::Eof => {
                    if !top {
                        return Err(FwupError::config("unexpected end of input inside '{'"));
                    }
                    break;
                }
                Tok::RBrace => {
                    if top {
                        return Err(FwupError::config("unmatched '}'"));
                    }
                    break;
                }
                _ => {}
            }
            let stmt = self.parse_stmt(depth)?;
            if let Some(stmt) = stmt {
                sec.stmts.push(stmt);
            }
        }
        Ok(sec)
    }

    fn parse_stmt(&mut self, depth: usize) -> Result<Option<Stmt>> {
        let ident = match self.bump()? {
            Tok::Ident(s) => s,
            other => return Err(FwupError::config(format!("expected identifier, found {other}"))),
        };
        if ident == "#include" {
            let path = match self.bump()? {
                Tok::Str(s) => s,
                other => return Err(FwupError::config(format!("expected path, found {other}"))),
            };
            self.expect(&Tok::Semi)?;
            return self.expand_include(&path, depth).map(Some);
        }
        if ident == "define" {
            let name = match self.bump()? {
                Tok::Ident(s) => s,
                other => return Err(FwupError::config(format!("expected macro name, found {other}"))),
            };
            let value = self.parse_value()?;
            self.expect(&Tok::Semi)?;
            let value = self.expand_macros(&value)?;
            self.macros.insert(name, value);
            return Ok(None);
        }

        match self.peek()? {
            // A section header's name is either a quoted string
            // (`mbr "name" { ... }`) or a bareword (`partition 0 { ... }`,
            // matching fwup's own numbered-subsection syntax) — never
            // both, so one token of lookahead after the section's `kind`
            // identifier is enough to tell a section from a bare `{ ... }`
            // block or an assignment/call.
            Tok::Str(_) | Tok::LBrace | Tok::Ident(_) => {
                let name = match self.peek()? {
                    Tok::Str(_) => match self.bump()? {
                        Tok::Str(s) => Some(s),
                        _ => unreachable!(),
                    },
                    Tok::Ident(_) => match self.bump()? {
                        Tok::Ident(s) => Some(s),
                        _ => unreachable!(),
                    },
                    _ => None,
                };
                self.expect(&Tok::LBrace)?;
                let mut inner = self.parse_block(false, depth)?;
                self.expect(&Tok::RBrace)?;
                inner.kind = ident;
                inner.name = name;
                Ok(Some(Stmt::Section(inner)))
            }
            Tok::LParen => {
                self.bump()?;
                let mut args = Vec::new();
                if *self.peek()? != Tok::RParen {
                    loop {
                        let v = self.parse_value()?;
                        args.push(self.expand_macros(&v)?);
                        if *self.peek()? == Tok::Comma {
                            self.bump()?;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RParen)?;
                self.expect(&Tok::Semi)?;
                Ok(Some(Stmt::Call(ident, args)))
            }
            Tok::Eq => {
                self.bump()?;
                let value = self.parse_value()?;
                self.expect(&Tok::Semi)?;
                let value = self.expand_macros(&value)?;
                Ok(Some(Stmt::Assign(ident, value)))
            }
            other => Err(FwupError::config(format!(
                "expected '{{', '(' or '=' after `{ident}`, found {other}"
            ))),
        }
    }

    fn parse_value(&mut self) -> Result<String> {
        match self.bump()? {
            Tok::Str(s) => Ok(s),
            Tok::Ident(s) => Ok(s),
            other => Err(FwupError::config(format!("expected a value, found {other}"))),
        }
    }

    fn expand_macros(&self, value: &str) -> Result<String> {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find(')').ok_or_else(|| {
                FwupError::config(format!("unterminated macro reference in `{value}`"))
            })?;
            let name = &after[..end];
            let resolved = self.macros.get(name).ok_or_else(|| {
                FwupError::config(format!("undefined macro `{name}`"))
            })?;
            out.push_str(resolved);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn expand_include(&mut self, path: &str, depth: usize) -> Result<Stmt> {
        if depth + 1 >= MAX_INCLUDE_DEPTH {
            return Err(FwupError::config(format!(
                "#include nesting exceeds {MAX_INCLUDE_DEPTH} levels (cycle?)"
            )));
        }
        let text = fs::read_to_string(path)
            .map_err(|e| FwupError::io(format!("reading included file {path}: {e}")))?;
        let mut sub = Parser::new(&text);
        sub.macros = self.macros.clone();
        let sec = sub.parse_block(true, depth + 1)?;
        self.macros = sub.macros;
        Ok(Stmt::Section(Section { kind: "#include".into(), name: None, stmts: sec.stmts }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_assignment() {
        let cfg = Config::parse(r#"meta-product = "widget";"#).unwrap();
        assert_eq!(cfg.root.get("meta-product"), Some("widget"));
    }

    #[test]
    fn parses_nested_sections_and_calls() {
        let text = r#"
            file-resource "rootfs.img" {
                host-path = "build/rootfs.img";
                blake2b-256 = "abababababababababababababababababababababababababababababab";
            }
            task "complete" {
                on-init {
                    raw_memset(0, 1, 0xff);
                }
                on-resource "rootfs.img" {
                    raw_write(1);
                }
            }
        "#;
        let cfg = Config::parse(text).unwrap();
        let fr = cfg.section("file-resource", "rootfs.img").unwrap();
        assert_eq!(fr.get("host-path"), Some("build/rootfs.img"));
        let task = cfg.section("task", "complete").unwrap();
        let on_init = task.children("on-init").next().unwrap();
        let calls: Vec<_> = on_init.calls().collect();
        assert_eq!(calls[0].0, "raw_memset");
        assert_eq!(calls[0].1, vec!["0".to_string(), "1".to_string(), "0xff".to_string()]);
        let on_resource = task.child("on-resource", "rootfs.img").unwrap();
        let calls: Vec<_> = on_resource.calls().collect();
        assert_eq!(calls[0].0, "raw_write");
    }

    #[test]
    fn expands_macros() {
        let text = r#"
            define OFFSET 42;
            mbr "m" {
                partition 0 {
                    block-offset = $(OFFSET);
                }
            }
        "#;
        let cfg = Config::parse(text).unwrap();
        let mbr = cfg.section("mbr", "m").unwrap();
        let part = mbr.children("partition").next().unwrap();
        assert_eq!(part.get_u64("block-offset").unwrap(), 42);
    }

    #[test]
    fn bareword_section_name_parses_like_mbr_from_config_expects() {
        // `Mbr::from_config` reads `partition_section.name` as the
        // partition index, so an unquoted numeric section name has to
        // parse the same as a quoted one.
        let cfg = Config::parse(r#"mbr "m" { partition 3 { block-offset = "1"; } }"#).unwrap();
        let mbr = cfg.section("mbr", "m").unwrap();
        let part = mbr.children("partition").next().unwrap();
        assert_eq!(part.name.as_deref(), Some("3"));
    }

    #[test]
    fn rejects_undefined_macro() {
        let err = Config::parse("x = $(NOPE);").unwrap_err();
        assert!(matches!(err, FwupError::Config { .. }));
    }

    #[test]
    fn render_round_trips_through_parse() {
        let text = r#"
            file-resource "rootfs.img" {
                host-path = "build/rootfs.img";
            }
            task "complete" {
                on-resource "rootfs.img" {
                    raw_write(1);
                }
            }
        "#;
        let mut cfg = Config::parse(text).unwrap();
        for fr in cfg.root.children_mut("file-resource") {
            fr.set("length", "4096");
        }
        let rendered = cfg.render();
        let reparsed = Config::parse(&rendered).unwrap();
        let fr = reparsed.section("file-resource", "rootfs.img").unwrap();
        assert_eq!(fr.get("length"), Some("4096"));
        assert_eq!(fr.get("host-path"), Some("build/rootfs.img"));
        let task = reparsed.section("task", "complete").unwrap();
        let on_resource = task.child("on-resource", "rootfs.img").unwrap();
        let calls: Vec<_> = on_resource.calls().collect();
        assert_eq!(calls[0], ("raw_write", &["1".to_string()][..]));
    }

    #[test]
    fn parses_cint_bases() {
        assert_eq!(parse_cint("10"), Some(10));
        assert_eq!(parse_cint("0x10"), Some(16));
        assert_eq!(parse_cint("010"), Some(8));
        assert_eq!(parse_cint("0"), Some(0));
    }
}
