//! License detection from SPDX tags and well-known license phrases.

use super::{read_head, strip_comment_markers, Analyzer, AnalyzerError};
use regex::Regex;
use scanservice_protocol::{
    AnalyzerOptions, AttributeMapping, Deadline, LicenseDetection, LicenseMatch,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use tracing::debug;

const UNKNOWN_REFERENCE_KEY: &str = "unknown-license-reference";
const UNKNOWN_REFERENCE_SPDX: &str = "LicenseRef-scancode-unknown-license-reference";

struct PhraseRule {
    key: &'static str,
    spdx: &'static str,
    pattern: &'static str,
}

const PHRASE_RULES: &[PhraseRule] = &[
    PhraseRule {
        key: "apache-2.0",
        spdx: "Apache-2.0",
        pattern: r"(?i)licensed under the apache license,? version 2\.0",
    },
    PhraseRule {
        key: "mit",
        spdx: "MIT",
        pattern: r"(?i)permission is hereby granted, free of charge, to any person obtaining a copy",
    },
    PhraseRule {
        key: "bsd-new",
        spdx: "BSD-3-Clause",
        pattern: r"(?i)redistribution and use in source and binary forms, with or without",
    },
    PhraseRule {
        key: "lgpl-2.1",
        spdx: "LGPL-2.1-only",
        pattern: r"(?i)gnu (lesser|library) general public license,? (version |v)2\.1",
    },
    PhraseRule {
        key: "gpl-2.0",
        spdx: "GPL-2.0-only",
        pattern: r"(?i)gnu general public license,? (version |v)2\b",
    },
    PhraseRule {
        key: "gpl-3.0",
        spdx: "GPL-3.0-only",
        pattern: r"(?i)gnu general public license,? (version |v)3\b",
    },
    PhraseRule {
        key: "mpl-2.0",
        spdx: "MPL-2.0",
        pattern: r"(?i)mozilla public license,? (version |v\.? ?)2\.0",
    },
    PhraseRule {
        key: "epl-2.0",
        spdx: "EPL-2.0",
        pattern: r"(?i)eclipse public license,? (version |v\.? ?)2\.0",
    },
    PhraseRule {
        key: "isc",
        spdx: "ISC",
        pattern: r"(?i)permission to use, copy, modify, and(/or)? distribute this software for any purpose",
    },
    PhraseRule {
        key: "unlicense",
        spdx: "Unlicense",
        pattern: r"(?i)this is free and unencumbered software released into the public domain",
    },
];

struct Patterns {
    spdx_tag: Regex,
    phrases: Vec<(&'static PhraseRule, Regex)>,
    clue: Regex,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    spdx_tag: Regex::new(r"(?i)SPDX-License-Identifier:\s*(?P<expr>[^\s].*?)\s*$").unwrap(),
    phrases: PHRASE_RULES
        .iter()
        .map(|rule| (rule, Regex::new(rule.pattern).unwrap()))
        .collect(),
    clue: Regex::new(r"(?i)\b(see|refer to)\s+(the\s+)?(file\s+)?(LICENSE|COPYING)(\.\w+)?\b")
        .unwrap(),
});

#[derive(Default)]
pub struct LicenseAnalyzer;

impl LicenseAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl Analyzer for LicenseAnalyzer {
    fn name(&self) -> &'static str {
        "licenses"
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

        let mut matches = Vec::new();
        let mut clues = Vec::new();
        let mut matched_lines = BTreeSet::new();
        let mut total_lines = 0u32;

        for (idx, raw) in text.lines().enumerate() {
            if deadline.is_expired() {
                debug!(path = %location.display(), line = idx, "License scan hit deadline");
                break;
            }
            let line_no = idx as u32 + 1;
            total_lines = line_no;
            let line = strip_comment_markers(raw);
            if line.is_empty() {
                continue;
            }

            if let Some(caps) = patterns.spdx_tag.captures(line) {
                let spdx = caps["expr"].trim().to_string();
                let key = spdx_to_key(&spdx);
                matches.push(LicenseMatch {
                    rule_identifier: format!("spdx-license-identifier-{}", sanitize(&key)),
                    license_expression: key,
                    license_expression_spdx: spdx,
                    start_line: line_no,
                    end_line: line_no,
                    matcher: "1-spdx-id".to_string(),
                    score: 100.0,
                    matched_length: word_count(line),
                    matched_text: options.license_text.then(|| line.to_string()),
                });
                matched_lines.insert(line_no);
                continue;
            }

            if let Some((rule, _)) = patterns.phrases.iter().find(|(_, re)| re.is_match(line)) {
                matches.push(LicenseMatch {
                    license_expression: rule.key.to_string(),
                    license_expression_spdx: rule.spdx.to_string(),
                    start_line: line_no,
                    end_line: line_no,
                    matcher: "2-phrase".to_string(),
                    score: 100.0,
                    matched_length: word_count(line),
                    rule_identifier: format!("{}_phrase.RULE", rule.key),
                    matched_text: options.license_text.then(|| line.to_string()),
                });
                matched_lines.insert(line_no);
                continue;
            }

            if patterns.clue.is_match(line) {
                clues.push(LicenseMatch {
                    license_expression: UNKNOWN_REFERENCE_KEY.to_string(),
                    license_expression_spdx: UNKNOWN_REFERENCE_SPDX.to_string(),
                    start_line: line_no,
                    end_line: line_no,
                    matcher: "5-clue".to_string(),
                    score: 50.0,
                    matched_length: word_count(line),
                    rule_identifier: "license-reference_see_file.RULE".to_string(),
                    matched_text: options.license_text.then(|| line.to_string()),
                });
            }
        }

        let detections = group_detections(matches);
        let mut out = AttributeMapping::default();
        out.detected_license_expression = Some(combine_expressions(
            detections.iter().map(|d| d.license_expression.as_str()),
        ));
        out.detected_license_expression_spdx = Some(combine_expressions(
            detections.iter().map(|d| d.license_expression_spdx.as_str()),
        ));
        out.license_detections = Some(detections);
        out.license_clues = Some(clues);
        out.percentage_of_license_text = Some(percentage(matched_lines.len(), total_lines));
        Ok(out)
    }
}

/// One detection per distinct expression, in order of first appearance.
fn group_detections(matches: Vec<LicenseMatch>) -> Vec<LicenseDetection> {
    let mut detections: Vec<LicenseDetection> = Vec::new();
    for m in matches {
        match detections
            .iter_mut()
            .find(|d| d.license_expression == m.license_expression)
        {
            Some(detection) => detection.matches.push(m),
            None => detections.push(LicenseDetection {
                license_expression: m.license_expression.clone(),
                license_expression_spdx: m.license_expression_spdx.clone(),
                identifier: String::new(),
                matches: vec![m],
            }),
        }
    }
    for detection in &mut detections {
        detection.identifier = detection_identifier(detection);
    }
    detections
}

/// `<expression>-<digest>`, stable for identical detections across files.
fn detection_identifier(detection: &LicenseDetection) -> String {
    let mut hasher = Sha256::new();
    hasher.update(detection.license_expression.as_bytes());
    for m in &detection.matches {
        hasher.update(m.rule_identifier.as_bytes());
        hasher.update(m.matched_length.to_be_bytes());
        hasher.update(m.score.to_be_bytes());
    }
    let digest = hasher.finalize();
    let short: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", sanitize(&detection.license_expression), short)
}

fn combine_expressions<'a>(expressions: impl Iterator<Item = &'a str>) -> String {
    let unique: Vec<&str> = expressions.fold(Vec::new(), |mut acc, expr| {
        if !acc.contains(&expr) {
            acc.push(expr);
        }
        acc
    });
    match unique.as_slice() {
        [] => String::new(),
        [single] => single.to_string(),
        many => many
            .iter()
            .map(|expr| {
                if expr.contains(' ') {
                    format!("({})", expr)
                } else {
                    expr.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" AND "),
    }
}

/// `GPL-2.0-or-later OR MIT` becomes `gpl-2.0-plus OR mit`.
fn spdx_to_key(expression: &str) -> String {
    expression
        .split_whitespace()
        .map(|token| {
            let core = token.trim_matches(|c| c == '(' || c == ')');
            let open = token.len() - token.trim_start_matches('(').len();
            let close = token.len() - token.trim_end_matches(')').len();
            let upper = core.to_ascii_uppercase();
            let mapped = match upper.as_str() {
                "AND" | "OR" | "WITH" => upper,
                _ => license_key(core),
            };
            format!("{}{}{}", "(".repeat(open), mapped, ")".repeat(close))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn license_key(spdx_id: &str) -> String {
    let lower = spdx_id.to_ascii_lowercase();
    if let Some(base) = lower.strip_suffix("-or-later") {
        format!("{}-plus", base)
    } else if let Some(base) = lower.strip_suffix('+') {
        format!("{}-plus", base)
    } else if let Some(base) = lower.strip_suffix("-only") {
        base.to_string()
    } else {
        lower
    }
}

fn sanitize(expression: &str) -> String {
    expression
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+') { c } else { '_' })
        .collect()
}

fn word_count(line: &str) -> u32 {
    line.split_whitespace().count() as u32
}

fn percentage(matched: usize, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = matched as f64 * 100.0 / total as f64;
    (pct * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scan_text(text: &str, options: &AnalyzerOptions) -> AttributeMapping {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("file.c");
        fs::write(&path, text).unwrap();
        LicenseAnalyzer::new()
            .scan(&path, Deadline::none(), options)
            .unwrap()
    }

    #[test]
    fn test_spdx_identifier() {
        let out = scan_text(
            "// SPDX-License-Identifier: LGPL-2.1-or-later\nint main() {}\n",
            &AnalyzerOptions::default(),
        );
        let detections = out.license_detections.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].license_expression, "lgpl-2.1-plus");
        assert_eq!(detections[0].license_expression_spdx, "LGPL-2.1-or-later");
        assert!(detections[0].identifier.starts_with("lgpl-2.1-plus-"));
        assert_eq!(detections[0].matches[0].start_line, 1);
        assert_eq!(out.detected_license_expression.as_deref(), Some("lgpl-2.1-plus"));
        assert_eq!(out.percentage_of_license_text, Some(50.0));
    }

    #[test]
    fn test_phrases_and_combined_expression() {
        let text = "/*\n * Licensed under the Apache License, Version 2.0 (the \"License\");\n */\n\
                    # Permission is hereby granted, free of charge, to any person obtaining a copy\n";
        let out = scan_text(text, &AnalyzerOptions::default());
        let detections = out.license_detections.unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(out.detected_license_expression.as_deref(), Some("apache-2.0 AND mit"));
        assert_eq!(
            out.detected_license_expression_spdx.as_deref(),
            Some("Apache-2.0 AND MIT")
        );
    }

    #[test]
    fn test_no_license_is_falsy() {
        let out = scan_text("fn main() {}\n", &AnalyzerOptions::default());
        assert_eq!(out.license_detections, Some(vec![]));
        assert_eq!(out.detected_license_expression.as_deref(), Some(""));
        assert_eq!(out.percentage_of_license_text, Some(0.0));
    }

    #[test]
    fn test_license_clue() {
        let out = scan_text("# See the LICENSE file for details.\n", &AnalyzerOptions::default());
        let clues = out.license_clues.unwrap();
        assert_eq!(clues.len(), 1);
        assert_eq!(clues[0].license_expression, UNKNOWN_REFERENCE_KEY);
        assert!(out.license_detections.unwrap().is_empty());
    }

    #[test]
    fn test_license_text_option() {
        let options = AnalyzerOptions {
            license_text: false,
            ..AnalyzerOptions::default()
        };
        let out = scan_text("// SPDX-License-Identifier: MIT\n", &options);
        let detections = out.license_detections.unwrap();
        assert!(detections[0].matches[0].matched_text.is_none());
    }

    #[test]
    fn test_max_bytes_limits_scan() {
        let options = AnalyzerOptions {
            max_bytes: 10,
            ..AnalyzerOptions::default()
        };
        let out = scan_text("0123456789\n// SPDX-License-Identifier: MIT\n", &options);
        assert!(out.license_detections.unwrap().is_empty());
    }

    #[test]
    fn test_identifier_is_stable() {
        let a = scan_text("// SPDX-License-Identifier: MIT\n", &AnalyzerOptions::default());
        let b = scan_text("# SPDX-License-Identifier: MIT\n", &AnalyzerOptions::default());
        assert_eq!(
            a.license_detections.unwrap()[0].identifier,
            b.license_detections.unwrap()[0].identifier
        );
    }

    #[test]
    fn test_spdx_to_key() {
        assert_eq!(spdx_to_key("MIT"), "mit");
        assert_eq!(spdx_to_key("(MIT OR Apache-2.0)"), "(mit OR apache-2.0)");
        assert_eq!(spdx_to_key("GPL-2.0+ WITH Classpath-exception-2.0"), "gpl-2.0-plus WITH classpath-exception-2.0");
        assert_eq!(spdx_to_key("GPL-3.0-only"), "gpl-3.0");
    }
}
