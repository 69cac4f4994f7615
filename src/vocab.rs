use std::collections::HashMap;
use std::fs;
use std::io;
use std::path;

use crate::error::{Error, Result};

pub const TOKENS: &'static str = "tokens";
pub const PADDING_TOKEN: &'static str = "@@PADDING@@";
pub const OOV_TOKEN: &'static str = "@@UNKNOWN@@";
pub const START_TOKEN: &'static str = "@start@";
pub const END_TOKEN: &'static str = "@end@";

const NON_PADDED_NAMESPACES: &'static str = "non_padded_namespaces.txt";
const NEWLINE: &'static str = "@@NEWLINE@@";

#[derive(Debug, Clone, Default)]
struct Namespace {
    tokens: Vec<String>,
    indices: HashMap<String, usize>,
    oov: Option<usize>,
}

impl Namespace {
    fn new<I>(tokens: I, padded: bool) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut ns = Self::default();
        if padded {
            ns.push(PADDING_TOKEN.to_owned());
        }
        for t in tokens {
            ns.push(t);
        }
        ns
    }

    fn push(&mut self, token: String) {
        let index = self.tokens.len();
        if token == OOV_TOKEN {
            self.oov = Some(index);
        }
        self.indices.insert(token.clone(), index);
        self.tokens.push(token);
    }
}

/// Namespaced token <-> index mapping, immutable once loaded.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    namespaces: HashMap<String, Namespace>,
}

impl Vocabulary {
    /// Loads every `<namespace>.txt` under `dir`.
    ///
    /// Namespaces listed in `non_padded_namespaces.txt` (exact names or
    /// `*suffix` patterns) number their tokens from 0; all others reserve index
    /// 0 for [`PADDING_TOKEN`].
    pub fn from_files<P>(dir: P) -> Result<Self>
    where
        P: AsRef<path::Path>,
    {
        let dir = dir.as_ref();
        let patterns = match fs::read_to_string(dir.join(NON_PADDED_NAMESPACES)) {
            Ok(text) => lines(&text),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut namespaces = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "txt")
                || path.file_name().map_or(false, |n| n == NON_PADDED_NAMESPACES)
            {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(name) if !name.starts_with('.') => name.to_owned(),
                _ => continue,
            };
            let padded = !patterns.iter().any(|p| matches(p, &name));
            let tokens = lines(&fs::read_to_string(&path)?)
                .into_iter()
                .map(|t| t.replace(NEWLINE, "\n"));
            namespaces.insert(name, Namespace::new(tokens, padded));
        }

        if namespaces.is_empty() {
            return Err(Error::Vocabulary {
                dir: dir.to_owned(),
                reason: "no namespace files".into(),
            });
        }
        tracing::debug!(
            "loaded vocabulary from {} ({} namespaces)",
            dir.display(),
            namespaces.len()
        );
        Ok(Self { namespaces })
    }

    pub fn from_tokens<I, S>(namespace: &str, tokens: I, padded: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut namespaces = HashMap::new();
        namespaces.insert(
            namespace.to_owned(),
            Namespace::new(tokens.into_iter().map(Into::into), padded),
        );
        Self { namespaces }
    }

    pub fn token(&self, index: usize, namespace: &str) -> Option<&str> {
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.tokens.get(index))
            .map(String::as_str)
    }

    /// Index of `token`, or of the OOV token when `token` is unknown.
    pub fn index(&self, token: &str, namespace: &str) -> Option<usize> {
        let ns = self.namespaces.get(namespace)?;
        ns.indices.get(token).cloned().or(ns.oov)
    }

    pub fn size(&self, namespace: &str) -> usize {
        self.namespaces.get(namespace).map_or(0, |ns| ns.tokens.len())
    }
}

fn lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text.split('\n').map(str::to_owned).collect();
    if lines.last().map_or(false, |l| l.is_empty()) {
        lines.pop();
    }
    lines
}

fn matches(pattern: &str, namespace: &str) -> bool {
    if pattern.starts_with('*') {
        namespace.ends_with(&pattern[1..])
    } else {
        namespace == pattern
    }
}
