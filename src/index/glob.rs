//! Glob matching over index paths.
//!
//! Strategy: translate once, match many. Each pattern yields two artifacts:
//! an over-approximating SQLite GLOB pattern set (so the path index stays
//! usable) and a precise regex applied client-side to reject overmatches.
//! `**` is expanded into explicit zero/one/many-segment alternatives for the
//! SQL side because SQLite's `*` crosses `/`.
//!
//! The regex side follows the glob dialect of CPython: `*` and `?` never
//! match `/`, `[abc]` / `[!abc]` classes, `**` spans segments when
//! `recursive` is on, and wildcard-led segments do not match hidden entries
//! (leading `.`) unless `include_hidden` is set. Hidden-exclusion is
//! expressed with character-class intersections rather than lookahead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;
use rusqlite::params_from_iter;

use super::Index;
use super::schema::{DIR_COLS, FILE_COLS, dir_from_row, file_from_row};
use crate::error::{Error, Result};
use crate::paths;
use crate::types::{EntryInfo, Order};

/// One rsync-style filter rule: include or exclude paths matching a glob.
#[derive(Clone, Debug)]
pub struct GlobRule {
    pub include: bool,
    pub pattern: String,
}

impl GlobRule {
    pub fn include(pattern: &str) -> Self {
        GlobRule { include: true, pattern: pattern.to_string() }
    }

    pub fn exclude(pattern: &str) -> Self {
        GlobRule { include: false, pattern: pattern.to_string() }
    }
}

// ---- Pattern translation ----

#[derive(Clone, Debug)]
enum Atom {
    Lit(char),
    Star,
    Question,
    Class {
        /// Fully rendered class including brackets, e.g. `[a-z]` or `[^x]`.
        base: String,
        matches_dot: bool,
        matches_nondot: bool,
    },
    /// Degenerate empty range: matches nothing.
    Never,
    /// Degenerate negated-empty range: matches any character.
    AnyChar,
}

/// Scan one path segment of a glob pattern into atoms. Consecutive `*` are
/// collapsed; bracket parsing follows the usual rules (a `]` right after
/// `[` or `[!` is literal content, an unclosed `[` is a literal).
fn parse_part(part: &str) -> Vec<Atom> {
    let chars: Vec<char> = part.chars().collect();
    let n = chars.len();
    let mut atoms = Vec::new();
    let mut i = 0;
    while i < n {
        let c = chars[i];
        i += 1;
        match c {
            '*' => {
                atoms.push(Atom::Star);
                while i < n && chars[i] == '*' {
                    i += 1;
                }
            }
            '?' => atoms.push(Atom::Question),
            '[' => {
                let mut j = i;
                if j < n && chars[j] == '!' {
                    j += 1;
                }
                if j < n && chars[j] == ']' {
                    j += 1;
                }
                while j < n && chars[j] != ']' {
                    j += 1;
                }
                if j >= n {
                    atoms.push(Atom::Lit('['));
                } else {
                    let stuff: String = chars[i..j].iter().collect();
                    atoms.push(parse_class(&stuff));
                    i = j + 1;
                }
            }
            _ => atoms.push(Atom::Lit(c)),
        }
    }
    atoms
}

/// Build a class atom from raw bracket content (possibly starting with `!`).
fn parse_class(stuff: &str) -> Atom {
    let negated = stuff.starts_with('!');
    let inner: Vec<char> = if negated {
        stuff.chars().skip(1).collect()
    } else {
        stuff.chars().collect()
    };

    // Split into chunks at range dashes. The first content character can
    // never be a range separator, nor can the last.
    let mut chunks: Vec<Vec<char>> = Vec::new();
    if !inner.contains(&'-') {
        chunks.push(inner.clone());
    } else {
        let mut start = 0;
        let mut k = 1;
        while k + 1 < inner.len() {
            if inner[k] == '-' {
                chunks.push(inner[start..k].to_vec());
                start = k + 1;
                k = start + 2;
            } else {
                k += 1;
            }
        }
        let last: Vec<char> = inner[start..].to_vec();
        if last.is_empty() {
            if let Some(prev) = chunks.last_mut() {
                prev.push('-');
            }
        } else {
            chunks.push(last);
        }
        // Drop inverted ranges, which would be invalid in a regex.
        let mut k = chunks.len();
        while k > 1 {
            k -= 1;
            let lo = *chunks[k - 1].last().unwrap_or(&'\0');
            let hi = *chunks[k].first().unwrap_or(&'\0');
            if lo > hi {
                let tail: Vec<char> = chunks[k][1..].to_vec();
                let prev = &mut chunks[k - 1];
                prev.pop();
                prev.extend(tail);
                chunks.remove(k);
            }
        }
    }

    if chunks.iter().all(|c| c.is_empty()) {
        return if negated { Atom::AnyChar } else { Atom::Never };
    }

    // Set membership, used for hidden-file handling. Treating every chunk
    // boundary as a range overestimates `matches_dot`, which errs toward
    // the stricter hidden-exclusion branch and stays correct.
    let mut singles: Vec<char> = Vec::new();
    let mut ranges: Vec<(char, char)> = Vec::new();
    for (m, chunk) in chunks.iter().enumerate() {
        let mut lo = 0;
        let mut hi = chunk.len();
        if m > 0 {
            if let (Some(&a), Some(&b)) = (chunks[m - 1].last(), chunk.first()) {
                ranges.push((a, b));
            }
            lo = 1;
        }
        if m + 1 < chunks.len() && hi > 0 {
            hi -= 1;
        }
        if lo < hi {
            singles.extend(&chunk[lo..hi]);
        }
    }
    let set_has_dot =
        singles.contains(&'.') || ranges.iter().any(|&(a, b)| a <= '.' && '.' <= b);
    let set_has_nondot =
        singles.iter().any(|&c| c != '.') || ranges.iter().any(|&(a, b)| a < b);
    let (matches_dot, matches_nondot) = if negated {
        (!set_has_dot, true)
    } else {
        (set_has_dot, set_has_nondot)
    };

    let mut body = String::new();
    for (m, chunk) in chunks.iter().enumerate() {
        if m > 0 {
            body.push('-');
        }
        for (k, &c) in chunk.iter().enumerate() {
            // Dashes at chunk edges are range operators; everything else is
            // escaped so nested-class and set-op syntax stays inert.
            let edge = (k == 0 && m > 0) || (k == chunk.len() - 1 && m + 1 < chunks.len());
            match c {
                '\\' | ']' | '[' | '^' | '&' | '~' => {
                    body.push('\\');
                    body.push(c);
                }
                '-' if !edge => {
                    body.push('\\');
                    body.push('-');
                }
                _ => body.push(c),
            }
        }
    }
    let base = if negated {
        format!("[^{body}]")
    } else {
        format!("[{body}]")
    };
    Atom::Class { base, matches_dot, matches_nondot }
}

fn push_literal(out: &mut String, c: char) {
    // Only ASCII punctuation can be a metacharacter; escaping anything
    // else is itself a regex error.
    if c.is_ascii() && !c.is_ascii_alphanumeric() && c != '_' {
        out.push('\\');
    }
    out.push(c);
}

fn render_atom(out: &mut String, atom: &Atom) {
    match atom {
        Atom::Lit(c) => push_literal(out, *c),
        Atom::Star => out.push_str("[^/]*"),
        Atom::Question => out.push_str("[^/]"),
        Atom::Class { base, .. } => out.push_str(base),
        // NUL never occurs in archive paths, so this class never matches.
        Atom::Never => out.push_str("\\x00"),
        Atom::AnyChar => out.push('.'),
    }
}

fn render_atoms(atoms: &[Atom]) -> String {
    let mut out = String::new();
    for atom in atoms {
        render_atom(&mut out, atom);
    }
    out
}

/// Render the first atom of a hidden-excluded bare branch: the segment
/// starts with whatever this atom matches, so it must not match `.`.
/// Returns `None` when the atom can only match `.`.
fn render_first_restricted(atom: &Atom) -> Option<String> {
    match atom {
        Atom::Lit('.') => None,
        Atom::Lit(c) => {
            let mut s = String::new();
            push_literal(&mut s, *c);
            Some(s)
        }
        Atom::Question => Some("[^/.]".to_string()),
        Atom::Class { base, matches_dot, matches_nondot } => {
            if !matches_nondot {
                return None;
            }
            if *matches_dot {
                Some(format!("[{base}&&[^.]]"))
            } else {
                Some(base.clone())
            }
        }
        Atom::Star => None,
        Atom::Never => None,
        Atom::AnyChar => Some("[^.]".to_string()),
    }
}

/// Render one pattern segment, applying the hidden-file rule: when a
/// segment starts with a wildcard and hidden entries are excluded, it must
/// not match a segment beginning with `.`.
fn render_part(part: &str, include_hidden: bool) -> String {
    let atoms = parse_part(part);
    if include_hidden {
        return render_atoms(&atoms);
    }
    match atoms.first() {
        Some(Atom::Question) => {
            let mut out = String::from("[^/.]");
            out.push_str(&render_atoms(&atoms[1..]));
            out
        }
        Some(Atom::Star) => {
            let rest = &atoms[1..];
            if rest.is_empty() {
                return "[^/.][^/]*".to_string();
            }
            // Either the star consumes at least one (non-dot) character, or
            // it is empty and the rest must open with a non-dot match.
            let greedy = format!("[^/.][^/]*{}", render_atoms(rest));
            match render_first_restricted(&rest[0]) {
                Some(first) => {
                    let bare = format!("{first}{}", render_atoms(&rest[1..]));
                    format!("(?:{greedy}|{bare})")
                }
                None => greedy,
            }
        }
        _ => render_atoms(&atoms),
    }
}

/// Translate a glob pattern into an anchored regex string.
pub(crate) fn glob_to_regex(pattern: &str, recursive: bool, include_hidden: bool) -> String {
    let (one_last, one_seg, any_segs, any_last) = if include_hidden {
        (
            "[^/]+".to_string(),
            "[^/]+/".to_string(),
            "(?:.+/)?".to_string(),
            ".*".to_string(),
        )
    } else {
        let last = "[^/.][^/]*".to_string();
        let seg = format!("{last}/");
        let any = format!("(?:{seg})*");
        let any_last = format!("{any}(?:{last})?");
        (last, seg, any, any_last)
    };

    let parts: Vec<&str> = pattern.split('/').collect();
    let last_idx = parts.len() - 1;
    let mut res = String::new();
    for (idx, part) in parts.iter().enumerate() {
        if *part == "*" {
            res.push_str(if idx < last_idx { &one_seg } else { &one_last });
        } else if recursive && *part == "**" {
            if idx < last_idx {
                if parts[idx + 1] != "**" {
                    res.push_str(&any_segs);
                }
            } else if idx > 0 && res.ends_with('/') {
                // `x/**` also matches `x` itself: fold the separator into
                // the optional descendant group.
                res.pop();
                res.push_str(&format!("(?:/{any_last})?"));
            } else {
                res.push_str(&any_last);
            }
        } else {
            if !part.is_empty() {
                res.push_str(&render_part(part, include_hidden));
            }
            if idx < last_idx {
                res.push('/');
            }
        }
    }
    format!("^(?s:{res})\\z")
}

/// Compile (and cache) the precise regex for a glob pattern.
pub(crate) fn compile_glob(
    pattern: &str,
    recursive: bool,
    include_hidden: bool,
) -> Result<Arc<Regex>> {
    static CACHE: OnceLock<Mutex<HashMap<(String, bool, bool), Arc<Regex>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let key = (pattern.to_string(), recursive, include_hidden);
    if let Some(re) = cache.lock().ok().and_then(|c| c.get(&key).cloned()) {
        return Ok(re);
    }
    let source = glob_to_regex(pattern, recursive, include_hidden);
    let re = Arc::new(
        Regex::new(&source)
            .map_err(|e| Error::InvalidArgument(format!("bad glob pattern {pattern:?}: {e}")))?,
    );
    if let Ok(mut c) = cache.lock() {
        c.insert(key, re.clone());
    }
    Ok(re)
}

/// Convert a glob pattern into SQLite GLOB syntax: bracket negation becomes
/// `[^...]`, caret corner cases are shuffled, unclosed brackets go literal.
pub(crate) fn glob_to_sqlite(pattern: &str) -> String {
    if !pattern.contains('[') {
        return pattern.to_string();
    }
    let chars: Vec<char> = pattern.chars().collect();
    let n = chars.len();
    let mut res = String::new();
    let mut i = 0;
    while i < n {
        let c = chars[i];
        i += 1;
        if c != '[' {
            res.push(c);
            continue;
        }
        let mut j = i;
        let negate = j < n && chars[j] == '!';
        if negate {
            j += 1;
        }
        let content_start = j;
        if j < n && chars[j] == ']' {
            j += 1;
        }
        while j < n && chars[j] != ']' {
            j += 1;
        }
        if j >= n {
            res.push_str("[[]");
            continue;
        }
        let content: String = chars[content_start..j].iter().collect();
        if negate {
            if content.is_empty() {
                res.push_str("[[]!]");
            } else {
                res.push_str("[^");
                res.push_str(&content);
                res.push(']');
            }
        } else {
            let num_carets = content.chars().take_while(|&c| c == '^').count();
            if num_carets == content.len() && !content.is_empty() {
                res.push('^');
            } else if num_carets > 0 {
                // SQLite treats a leading caret as negation: move it back.
                res.push('[');
                res.push_str(&content[num_carets..]);
                res.push_str(&"^".repeat(num_carets));
                res.push(']');
            } else {
                res.push('[');
                res.push_str(&content);
                res.push(']');
            }
        }
        i = j + 1;
    }
    res
}

/// Expand up to two `**` segments into unioned SQLite GLOB alternatives to
/// cover the zero-segment case; collapse more than two into a broad `*`
/// (the precise regex rejects overmatches).
pub(crate) fn expand_doublestar(pattern: &str, recursive: bool) -> Vec<String> {
    if !recursive {
        return vec![pattern.to_string()];
    }
    let mut count = 0;
    if pattern.starts_with("**/") {
        count += 1;
    }
    if pattern.ends_with("/**") {
        count += 1;
    }
    count += pattern.matches("/**/").count();
    if pattern == "**" {
        count = 1;
    }
    if count == 0 {
        return vec![pattern.to_string()];
    }
    if count > 2 {
        let mut result = pattern.replace("/**/", "*");
        if let Some(stripped) = result.strip_prefix("**/") {
            result = format!("*{stripped}");
        }
        if let Some(stripped) = result.strip_suffix("/**") {
            result = format!("{stripped}*");
        }
        if result == "**" {
            result = "*".to_string();
        }
        return vec![result];
    }

    let mut variants = vec![pattern.to_string()];
    while variants.iter().any(|v| v.starts_with("**/")) {
        let mut new = Vec::new();
        for v in variants {
            if let Some(rest) = v.strip_prefix("**/") {
                new.push(rest.to_string());
                new.push(format!("*/{rest}"));
            } else {
                new.push(v);
            }
        }
        variants = new;
    }
    while variants.iter().any(|v| v.contains("/**/")) {
        let mut new = Vec::new();
        for v in variants {
            if v.contains("/**/") {
                new.push(v.replacen("/**/", "/", 1));
                new.push(v.replacen("/**/", "/*/", 1));
            } else {
                new.push(v);
            }
        }
        variants = new;
    }
    while variants.iter().any(|v| v.ends_with("/**")) {
        let mut new = Vec::new();
        for v in variants {
            if let Some(head) = v.strip_suffix("/**") {
                new.push(head.to_string());
                new.push(format!("{head}/*"));
            } else {
                new.push(v);
            }
        }
        variants = new;
    }
    let mut variants: Vec<String> = variants
        .into_iter()
        .map(|v| if v == "**" { "*".to_string() } else { v })
        .collect();

    let mut seen = std::collections::HashSet::new();
    variants.retain(|v| seen.insert(v.clone()));
    if variants.iter().any(|v| v == "*") {
        return vec!["*".to_string()];
    }
    // A pattern ending in `*` already dominates its `/`-extended variants.
    let dominated: Vec<bool> = variants
        .iter()
        .map(|v| {
            variants.iter().any(|other| {
                other != v
                    && other.ends_with('*')
                    && v.starts_with(other.as_str())
                    && v[other.len()..].starts_with('/')
            })
        })
        .collect();
    variants
        .into_iter()
        .zip(dominated)
        .filter_map(|(v, d)| (!d).then_some(v))
        .collect()
}

/// Convert an exclude pattern into an indexed SQL condition when its shape
/// allows, appending bound values to `bound`. Returns `None` for patterns
/// only the regex pass can undermatch safely.
fn pattern_to_sql_exclude(pattern: &str, bound: &mut Vec<String>) -> Option<String> {
    let placeholder = |bound: &mut Vec<String>, value: String| {
        bound.push(value);
        format!("?{}", bound.len())
    };
    if let Some(suffix) = pattern.strip_prefix("**/") {
        if !suffix.contains('/') {
            let p = placeholder(bound, glob_to_sqlite(suffix));
            return Some(format!("path GLOB {p}"));
        }
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        if !prefix.contains('*') {
            let p = placeholder(bound, glob_to_sqlite(&format!("{prefix}/*")));
            return Some(format!("path GLOB {p}"));
        }
    }
    if !pattern.contains("**") {
        if let Some((parent, _)) = pattern.rsplit_once('/') {
            if !parent.contains('*') && !parent.contains('?') && !parent.contains('[') {
                let pp = placeholder(bound, parent.to_string());
                let gp = placeholder(bound, glob_to_sqlite(pattern));
                return Some(format!("(parent = {pp} AND path GLOB {gp})"));
            }
        } else {
            let p = placeholder(bound, glob_to_sqlite(pattern));
            return Some(format!("(parent = '' AND path GLOB {p})"));
        }
    }
    None
}

// ---- Query assembly ----

impl Index {
    /// Paths matching a glob pattern, per POSIX glob semantics.
    pub fn glob_paths(
        &self,
        pattern: &str,
        recursive: bool,
        include_hidden: bool,
        only_files: bool,
    ) -> Result<Vec<String>> {
        Ok(self
            .glob_infos(pattern, recursive, include_hidden, only_files)?
            .into_iter()
            .map(|info| info.path().to_string())
            .collect())
    }

    /// File and directory records matching a glob pattern.
    pub fn glob_infos(
        &self,
        pattern: &str,
        recursive: bool,
        include_hidden: bool,
        only_files: bool,
    ) -> Result<Vec<EntryInfo>> {
        let pattern = paths::normalize(pattern)?;
        let re = compile_glob(&pattern, recursive, include_hidden)?;
        let candidates = self.glob_candidates(&pattern, recursive, only_files)?;
        Ok(candidates
            .into_iter()
            .filter(|info| re.is_match(info.path()))
            .collect())
    }

    /// Candidate generation: over-approximate in SQL, precise filter later.
    fn glob_candidates(
        &self,
        pattern: &str,
        recursive: bool,
        only_files: bool,
    ) -> Result<Vec<EntryInfo>> {
        if recursive && pattern == "**" {
            let mut out: Vec<EntryInfo> = if only_files {
                Vec::new()
            } else {
                self.all_dirinfos(Order::Any)?
                    .into_iter()
                    .map(EntryInfo::Dir)
                    .collect()
            };
            out.extend(
                self.all_fileinfos(Order::Any)?
                    .into_iter()
                    .map(EntryInfo::File),
            );
            return Ok(out);
        }

        // Fast path: one wildcard, in the final segment, under a literal
        // directory prefix. A direct parent listing avoids the GLOB scan.
        let parts: Vec<&str> = pattern.split('/').collect();
        let wildcard_parts = parts
            .iter()
            .filter(|p| p.contains('*') || p.contains('?'))
            .count();
        let no_brackets = !pattern.contains('[') && !pattern.contains(']');
        if wildcard_parts == 1
            && no_brackets
            && (!recursive || !pattern.contains("**"))
            && parts
                .last()
                .is_some_and(|p| p.contains('*') || p.contains('?'))
        {
            let prefix = parts[..parts.len() - 1].join("/");
            if !self.isdir(&prefix)? {
                return Ok(Vec::new());
            }
            return if only_files {
                Ok(self
                    .list_direct_fileinfos(&prefix, Order::Any)?
                    .into_iter()
                    .map(EntryInfo::File)
                    .collect())
            } else {
                self.listdir_infos(&prefix, Order::Any)
            };
        }

        let sqlite_patterns = expand_doublestar(&glob_to_sqlite(pattern), recursive);
        self.raw_glob_infos_multi(&sqlite_patterns, only_files)
    }

    fn raw_glob_infos_multi(
        &self,
        patterns: &[String],
        only_files: bool,
    ) -> Result<Vec<EntryInfo>> {
        let glob_expr = (1..=patterns.len())
            .map(|i| format!("path GLOB ?{i}"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let mut out = Vec::new();
        if !only_files {
            let sql = format!("SELECT {DIR_COLS} FROM dirs WHERE {glob_expr}");
            let mut stmt = self.conn().prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(patterns.iter()), dir_from_row)?;
            for row in rows {
                out.push(EntryInfo::Dir(row?));
            }
        }
        let sql = format!("SELECT {FILE_COLS} FROM files WHERE {glob_expr}");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(patterns.iter()), file_from_row)?;
        for row in rows {
            out.push(EntryInfo::File(row?));
        }
        Ok(out)
    }

    /// Entries selected by an ordered include/exclude rule list with
    /// first-match-wins semantics. The SQL prefilter overmatches includes
    /// and undermatches excludes (both safe directions); the regex pass
    /// makes the final decision.
    pub fn glob_infos_incl_excl(
        &self,
        rules: &[GlobRule],
        default_include: bool,
        only_files: bool,
    ) -> Result<Vec<EntryInfo>> {
        if rules.is_empty() {
            if !default_include {
                return Ok(Vec::new());
            }
            let mut out: Vec<EntryInfo> = if only_files {
                Vec::new()
            } else {
                self.all_dirinfos(Order::Any)?
                    .into_iter()
                    .map(EntryInfo::Dir)
                    .collect()
            };
            out.extend(
                self.all_fileinfos(Order::Any)?
                    .into_iter()
                    .map(EntryInfo::File),
            );
            return Ok(out);
        }

        let (sql_expr, bound) = build_filter_sql(rules, default_include);
        let rule_regexes: Vec<(bool, Arc<Regex>)> = rules
            .iter()
            .map(|rule| {
                compile_glob(&rule.pattern, rule.pattern.contains("**"), true)
                    .map(|re| (rule.include, re))
            })
            .collect::<Result<_>>()?;
        let decide = |path: &str| -> bool {
            for (include, re) in &rule_regexes {
                if re.is_match(path) {
                    return *include;
                }
            }
            default_include
        };

        let mut out = Vec::new();
        let sql = format!("SELECT {FILE_COLS} FROM files WHERE {sql_expr}");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound.iter()), file_from_row)?;
        for row in rows {
            let info = row?;
            if decide(&info.path) {
                out.push(EntryInfo::File(info));
            }
        }
        if only_files {
            return Ok(out);
        }
        let sql = format!("SELECT {DIR_COLS} FROM dirs WHERE {sql_expr}");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound.iter()), dir_from_row)?;
        for row in rows {
            let info = row?;
            if decide(&info.path) {
                out.push(EntryInfo::Dir(info));
            }
        }
        Ok(out)
    }
}

/// Build the nested first-match-wins prefilter:
/// `inc1 OR (NOT exc1 AND (inc2 OR (... OR default)))`, inside out.
fn build_filter_sql(rules: &[GlobRule], default_include: bool) -> (String, Vec<String>) {
    let mut bound: Vec<String> = Vec::new();
    let mut expr = if default_include { "1" } else { "0" }.to_string();

    for rule in rules.iter().rev() {
        if rule.include {
            let patterns =
                expand_doublestar(&glob_to_sqlite(&rule.pattern), rule.pattern.contains("**"));
            let mut parts = Vec::new();
            for p in patterns {
                bound.push(p);
                parts.push(format!("path GLOB ?{}", bound.len()));
            }
            let inc_expr = if parts.len() == 1 {
                parts.pop().unwrap_or_default()
            } else {
                format!("({})", parts.join(" OR "))
            };
            expr = format!("{inc_expr} OR ({expr})");
        } else if rule.pattern == "**" {
            // Excluding everything else: anything past this point is out.
            expr = "0".to_string();
        } else if let Some(excl) = pattern_to_sql_exclude(&rule.pattern, &mut bound) {
            expr = format!("NOT ({excl}) AND ({expr})");
        } else {
            // Undermatch: squeeze ** down to * (which does not cross `/`
            // in the precise sense, so fewer rows are excluded than the
            // rule intends; the regex pass re-excludes the rest).
            let mut undermatch = rule
                .pattern
                .replace("**/", "*/")
                .replace("/**", "/*");
            if undermatch == rule.pattern {
                undermatch = rule.pattern.replace("**", "*");
            }
            bound.push(glob_to_sqlite(&undermatch));
            expr = format!("NOT (path GLOB ?{}) AND ({expr})", bound.len());
        }
    }
    (expr, bound)
}
