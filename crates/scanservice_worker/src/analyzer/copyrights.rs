//! Copyright statements, holders and authors.

use super::{read_head, strip_comment_markers, Analyzer, AnalyzerError};
use regex::Regex;
use scanservice_protocol::{
    AnalyzerOptions, AttributeMapping, AuthorDetection, CopyrightDetection, Deadline,
    HolderDetection,
};
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

struct Patterns {
    statement: Regex,
    leading_years: Regex,
    all_rights: Regex,
    author: Regex,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    statement: Regex::new(r"(?i)^(?P<mark>copyright\b|\(c\)|©)\s*(?P<symbol>\(c\)|©)?\s*(?P<rest>.*)$")
        .unwrap(),
    leading_years: Regex::new(r"^(?:(?:\(c\)|©)\s*)?(?:\d{4}(?:\s*[-,]\s*\d{2,4})*\s*,?\s*)+").unwrap(),
    all_rights: Regex::new(r"(?i)[\s.,;]*all\s+rights\s+reserved\.?\s*$").unwrap(),
    author: Regex::new(
        r"(?i)^(?:@author|authors?\s*:|written\s+by|contributed\s+by|maintainer\s*:)\s*(?P<author>.+)$",
    )
    .unwrap(),
});

#[derive(Default)]
pub struct CopyrightAnalyzer;

impl CopyrightAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Analyzer for CopyrightAnalyzer {
    fn name(&self) -> &'static str {
        "copyrights"
    }

    fn scan(
        &self,
        location: &Path,
        deadline: Deadline,
        options: &AnalyzerOptions,
    ) -> Result<AttributeMapping, AnalyzerError> {
        let bytes = read_head(location, options.max_bytes)?;
        let text = String::from_utf8_lossy(&bytes);
        let patterns = &*PATTERNS;

        let mut copyrights = Vec::new();
        let mut holders = Vec::new();
        let mut authors = Vec::new();

        for (idx, raw) in text.lines().enumerate() {
            if deadline.is_expired() {
                debug!(path = %location.display(), line = idx, "Copyright scan hit deadline");
                break;
            }
            let line_no = idx as u32 + 1;
            let line = strip_comment_markers(raw);

            if let Some(caps) = patterns.statement.captures(line) {
                let rest = caps["rest"].trim();
                let marked = caps.name("symbol").is_some()
                    || !caps["mark"].eq_ignore_ascii_case("copyright");
                if !is_statement(rest, marked) {
                    continue;
                }
                copyrights.push(CopyrightDetection {
                    copyright: collapse_whitespace(line),
                    start_line: line_no,
                    end_line: line_no,
                });
                if let Some(holder) = holder_of(rest, patterns) {
                    holders.push(HolderDetection {
                        holder,
                        start_line: line_no,
                        end_line: line_no,
                    });
                }
                continue;
            }

            if let Some(caps) = patterns.author.captures(line) {
                let author = collapse_whitespace(caps["author"].trim());
                if !author.is_empty() {
                    authors.push(AuthorDetection {
                        author,
                        start_line: line_no,
                        end_line: line_no,
                    });
                }
            }
        }

        let mut out = AttributeMapping::default();
        out.copyrights = Some(copyrights);
        out.holders = Some(holders);
        out.authors = Some(authors);
        Ok(out)
    }
}

/// Prose such as "copyright notice" starts with a lowercase word and no
/// year or symbol; a statement has a symbol, a year or a proper name.
fn is_statement(rest: &str, marked: bool) -> bool {
    let Some(first) = rest.chars().next() else {
        return false;
    };
    marked || first.is_ascii_digit() || first.is_uppercase() || rest.starts_with("by ")
}

fn holder_of(rest: &str, patterns: &Patterns) -> Option<String> {
    let without_years = patterns.leading_years.replace(rest, "");
    let without_rights = patterns.all_rights.replace(&without_years, "");
    let holder = without_rights
        .trim()
        .trim_start_matches("by ")
        .trim_end_matches(['.', ',', ';', ' '])
        .trim();
    if holder.is_empty() {
        None
    } else {
        Some(collapse_whitespace(holder))
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scan_text(text: &str) -> AttributeMapping {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lib.rs");
        fs::write(&path, text).unwrap();
        CopyrightAnalyzer::new()
            .scan(&path, Deadline::none(), &AnalyzerOptions::default())
            .unwrap()
    }

    #[test]
    fn test_statement_with_all_rights_reserved() {
        let out = scan_text("// Copyright (c) 2020-2023 Example Corp. All rights reserved.\nfn f() {}\n");
        let copyrights = out.copyrights.unwrap();
        assert_eq!(copyrights.len(), 1);
        assert_eq!(
            copyrights[0].copyright,
            "Copyright (c) 2020-2023 Example Corp. All rights reserved."
        );
        assert_eq!(copyrights[0].start_line, 1);

        let holders = out.holders.unwrap();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].holder, "Example Corp");
    }

    #[test]
    fn test_symbol_and_year_lists() {
        let out = scan_text("# © 2019, 2021 Jane Doe\n");
        assert_eq!(out.copyrights.unwrap()[0].copyright, "© 2019, 2021 Jane Doe");
        assert_eq!(out.holders.unwrap()[0].holder, "Jane Doe");
    }

    #[test]
    fn test_prose_is_not_a_statement() {
        let out = scan_text(
            " * The above copyright notice and this permission notice shall be included\n\
             copyright notice must be retained\n",
        );
        assert!(out.copyrights.unwrap().is_empty());
        assert!(out.holders.unwrap().is_empty());
    }

    #[test]
    fn test_authors() {
        let out = scan_text("/**\n * @author Jane Doe <jane@example.com>\n * Written by  John Roe\n */\n");
        let authors = out.authors.unwrap();
        assert_eq!(authors.len(), 2);
        assert_eq!(authors[0].author, "Jane Doe <jane@example.com>");
        assert_eq!(authors[0].start_line, 2);
        assert_eq!(authors[1].author, "John Roe");
    }

    #[test]
    fn test_empty_file_yields_empty_lists() {
        let out = scan_text("");
        assert_eq!(out.copyrights, Some(vec![]));
        assert_eq!(out.holders, Some(vec![]));
        assert_eq!(out.authors, Some(vec![]));
    }
}
