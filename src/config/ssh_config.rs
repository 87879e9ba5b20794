// ABOUTME: OpenSSH client configuration reader.
// ABOUTME: Parses Host blocks with wildcard patterns and answers per-alias attribute lookups.

use super::{AliasResolver, keys};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

const SYSTEM_CONFIG_PATH: &str = "/etc/ssh/ssh_config";
const SYSTEM_CONFIG_DIR: &str = "/etc/ssh";
const MAX_INCLUDE_DEPTH: usize = 16;

/// Parsed OpenSSH client configuration.
///
/// Lookups follow OpenSSH semantics: blocks are scanned in file order and the
/// first value obtained for a keyword wins. `get_all` collects the values of
/// every matching block, which is how repeated `IdentityFile` lines accumulate.
///
/// `Include` splices the named files in place. Relative paths are resolved
/// against `~/.ssh` (or `/etc/ssh` for the system config) and may be globs.
/// Files that do not exist are skipped.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

#[derive(Debug, Clone)]
struct Block {
    selector: Selector,
    entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
enum Selector {
    /// Directives before the first Host line.
    Global,
    Host(Vec<Pattern>),
    /// Match blocks are not evaluated.
    Match,
}

#[derive(Debug, Clone)]
struct Pattern {
    negated: bool,
    glob: String,
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    value: String,
}

impl SshConfig {
    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_named(text, "<string>", &user_include_dir())
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::read_file(path.as_ref(), &user_include_dir())
    }

    fn read_file(path: &Path, include_dir: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ConfigNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        Self::parse_named(&text, &path.display().to_string(), include_dir)
    }

    /// Load `~/.ssh/config` followed by the system-wide config.
    ///
    /// Missing files are skipped, so this returns an empty config on a
    /// machine without any SSH configuration.
    pub fn load_default() -> Result<Self> {
        let mut sources: Vec<(PathBuf, PathBuf)> = Vec::new();
        if let Some(home) = dirs::home_dir() {
            let dir = home.join(".ssh");
            sources.push((dir.join("config"), dir));
        }
        sources.push((
            PathBuf::from(SYSTEM_CONFIG_PATH),
            PathBuf::from(SYSTEM_CONFIG_DIR),
        ));

        let mut config = Self::default();
        for (path, include_dir) in sources {
            match Self::read_file(&path, &include_dir) {
                Ok(loaded) => {
                    tracing::debug!("Loaded SSH config from {}", path.display());
                    config = config.merge(loaded);
                }
                Err(Error::ConfigNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(config)
    }

    /// Layer `other` underneath `self`: values from `self` take precedence.
    pub fn merge(mut self, other: SshConfig) -> Self {
        self.blocks.extend(other.blocks);
        self
    }

    fn parse_named(text: &str, origin: &str, include_dir: &Path) -> Result<Self> {
        let mut blocks = vec![Block {
            selector: Selector::Global,
            entries: Vec::new(),
        }];
        parse_into(&mut blocks, text, origin, include_dir, 0)?;
        Ok(Self { blocks })
    }

    fn matching_values<'a>(
        &'a self,
        alias: &'a str,
        key: &'a str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.blocks
            .iter()
            .filter(move |block| block.matches(alias))
            .flat_map(|block| block.entries.iter())
            .filter(move |entry| entry.key.eq_ignore_ascii_case(key))
            .map(|entry| entry.value.as_str())
            .filter(|value| !value.is_empty())
    }
}

impl AliasResolver for SshConfig {
    fn get(&self, alias: &str, key: &str) -> Option<String> {
        self.matching_values(alias, key)
            .next()
            .map(str::to_string)
            .or_else(|| default_value(key).map(str::to_string))
    }

    fn get_all(&self, alias: &str, key: &str) -> Vec<String> {
        self.matching_values(alias, key).map(str::to_string).collect()
    }
}

impl Block {
    fn matches(&self, alias: &str) -> bool {
        match &self.selector {
            Selector::Global => true,
            Selector::Match => false,
            Selector::Host(patterns) => {
                let mut matched = false;
                for pattern in patterns {
                    if wildcard_match(&pattern.glob, alias) {
                        if pattern.negated {
                            return false;
                        }
                        matched = true;
                    }
                }
                matched
            }
        }
    }
}

/// Append the directives in `text` to `blocks`, following `Include`.
fn parse_into(
    blocks: &mut Vec<Block>,
    text: &str,
    origin: &str,
    include_dir: &Path,
    depth: usize,
) -> Result<()> {
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parse_error = |message: String| Error::Parse {
            path: origin.to_string(),
            line: idx + 1,
            message,
        };

        let (key, value) = split_directive(line);
        if value.is_empty() {
            return Err(parse_error(format!("missing value for {}", key)));
        }

        if key.eq_ignore_ascii_case("Host") {
            let patterns = value
                .split_whitespace()
                .map(|p| unquote(p).to_string())
                .filter(|p| !p.is_empty())
                .map(|p| match p.strip_prefix('!') {
                    Some(rest) => Pattern {
                        negated: true,
                        glob: rest.to_string(),
                    },
                    None => Pattern {
                        negated: false,
                        glob: p,
                    },
                })
                .collect::<Vec<_>>();
            if patterns.is_empty() {
                return Err(parse_error("Host requires at least one pattern".to_string()));
            }
            blocks.push(Block {
                selector: Selector::Host(patterns),
                entries: Vec::new(),
            });
        } else if key.eq_ignore_ascii_case("Match") {
            tracing::debug!("{}:{}: Match blocks are not supported, skipping", origin, idx + 1);
            blocks.push(Block {
                selector: Selector::Match,
                entries: Vec::new(),
            });
        } else if key.eq_ignore_ascii_case("Include") {
            if depth >= MAX_INCLUDE_DEPTH {
                return Err(parse_error("Include nested too deeply".to_string()));
            }
            for pattern in value.split_whitespace() {
                let pattern = include_path(unquote(pattern), include_dir);
                for path in expand_include(&pattern).map_err(&parse_error)? {
                    let included = std::fs::read_to_string(&path)?;
                    let outer = blocks.last().map(|b| b.selector.clone());
                    let before = blocks.len();
                    tracing::debug!("{}:{}: including {}", origin, idx + 1, path.display());
                    parse_into(
                        blocks,
                        &included,
                        &path.display().to_string(),
                        include_dir,
                        depth + 1,
                    )?;
                    // Lines after the Include belong to the including block again.
                    if let Some(selector) = outer.filter(|_| blocks.len() != before) {
                        blocks.push(Block {
                            selector,
                            entries: Vec::new(),
                        });
                    }
                }
            }
        } else if let Some(block) = blocks.last_mut() {
            block.entries.push(Entry {
                key: key.to_string(),
                value: unquote(value).to_string(),
            });
        }
    }

    Ok(())
}

/// Expand `~` and anchor relative Include paths at `include_dir`.
fn include_path(value: &str, include_dir: &Path) -> PathBuf {
    let expanded = match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        include_dir.join(expanded)
    }
}

/// Files matching an Include pattern, in sorted order.
fn expand_include(pattern: &Path) -> std::result::Result<Vec<PathBuf>, String> {
    let pattern = pattern
        .to_str()
        .ok_or_else(|| format!("Include path is not valid UTF-8: {}", pattern.display()))?;
    let mut paths: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|e| format!("invalid Include pattern {:?}: {}", pattern, e))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

fn user_include_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh"))
        .unwrap_or_else(|| PathBuf::from(".ssh"))
}

fn default_value(key: &str) -> Option<&'static str> {
    if key.eq_ignore_ascii_case(keys::PORT) {
        Some("22")
    } else {
        None
    }
}

/// Split `Keyword value`, `Keyword=value` or `Keyword = value`.
fn split_directive(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let key = &line[..end];
    let rest = line[end..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    (key, rest)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Case-insensitive glob match supporting `*` and `?`.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.as_bytes();
    let text = text.as_bytes();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pattern.len()
            && (pattern[p] == b'?' || pattern[p].eq_ignore_ascii_case(&text[t]))
        {
            p += 1;
            t += 1;
        } else if let Some((star_p, star_t)) = backtrack {
            p = star_p + 1;
            t = star_t + 1;
            backtrack = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}
