//! File information: checksum, date, type and language detection.

use super::{Analyzer, AnalyzerError};
use chrono::{DateTime, Utc};
use scanservice_protocol::{AnalyzerOptions, AttributeMapping, Deadline};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const SNIFF_BYTES: usize = 8 * 1024;
const HASH_CHUNK: usize = 64 * 1024;

pub struct FileInfoAnalyzer;

impl Analyzer for FileInfoAnalyzer {
    fn name(&self) -> &'static str {
        "file_info"
    }

    fn scan(
        &self,
        location: &Path,
        deadline: Deadline,
        _options: &AnalyzerOptions,
    ) -> Result<AttributeMapping, AnalyzerError> {
        let metadata = std::fs::metadata(location).map_err(|e| AnalyzerError::io(location, e))?;
        let mut out = AttributeMapping::default();

        if let Ok(modified) = metadata.modified() {
            let modified: DateTime<Utc> = modified.into();
            out.date = Some(modified.format("%Y-%m-%d").to_string());
        }

        let (head, sha256) = hash_and_sniff(location, deadline)?;
        out.sha256 = sha256;

        let extension = location
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let language = language_for_extension(&extension);
        let is_binary = looks_binary(&head);
        let shebang = head.starts_with(b"#!");

        out.is_binary = Some(is_binary);
        out.is_text = Some(!is_binary);
        out.is_source = Some(!is_binary && language.is_some());
        out.is_script = Some(!is_binary && (shebang || is_script_extension(&extension)));
        out.programming_language = language.map(str::to_string);
        out.mime_type = Some(mime_type(&extension, &head, is_binary).to_string());
        out.file_type = Some(file_type(&head, is_binary, shebang));
        Ok(out)
    }
}

/// Stream the whole file through SHA-256 and keep the first bytes for
/// sniffing. Once the deadline passes the checksum is dropped, the head is
/// still returned.
fn hash_and_sniff(
    location: &Path,
    deadline: Deadline,
) -> Result<(Vec<u8>, Option<String>), AnalyzerError> {
    let mut file = File::open(location).map_err(|e| AnalyzerError::io(location, e))?;
    let mut hasher = Sha256::new();
    let mut head = Vec::with_capacity(SNIFF_BYTES);
    let mut buf = vec![0u8; HASH_CHUNK];

    loop {
        if deadline.is_expired() {
            return Ok((head, None));
        }
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(AnalyzerError::io(location, e)),
        };
        if head.len() < SNIFF_BYTES {
            let take = n.min(SNIFF_BYTES - head.len());
            head.extend_from_slice(&buf[..take]);
        }
        hasher.update(&buf[..n]);
    }

    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{:02x}", b)).collect();
    Ok((head, Some(hex)))
}

fn looks_binary(head: &[u8]) -> bool {
    if head.is_empty() {
        return false;
    }
    if head.contains(&0) {
        return true;
    }
    let control = head
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\n' | b'\r' | b'\t' | 0x0c | 0x1b))
        .count();
    control * 10 > head.len()
}

fn language_for_extension(extension: &str) -> Option<&'static str> {
    let language = match extension {
        "rs" => "Rust",
        "py" | "pyi" => "Python",
        "c" | "h" => "C",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" => "C++",
        "java" => "Java",
        "kt" | "kts" => "Kotlin",
        "scala" => "Scala",
        "go" => "Go",
        "js" | "mjs" | "cjs" => "JavaScript",
        "ts" | "tsx" => "TypeScript",
        "rb" => "Ruby",
        "php" => "PHP",
        "pl" | "pm" => "Perl",
        "sh" | "bash" => "Bash",
        "cs" => "C#",
        "swift" => "Swift",
        "lua" => "Lua",
        _ => return None,
    };
    Some(language)
}

fn is_script_extension(extension: &str) -> bool {
    matches!(extension, "sh" | "bash" | "py" | "pl" | "rb" | "lua" | "php")
}

fn mime_type(extension: &str, head: &[u8], is_binary: bool) -> &'static str {
    if head.is_empty() {
        return "inode/x-empty";
    }
    match extension {
        "json" => "application/json",
        "xml" => "text/xml",
        "html" | "htm" => "text/html",
        "gz" | "tgz" => "application/gzip",
        "zip" | "jar" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "pdf" => "application/pdf",
        _ if is_binary => "application/octet-stream",
        _ => "text/plain",
    }
}

fn file_type(head: &[u8], is_binary: bool, shebang: bool) -> String {
    if head.is_empty() {
        return "empty".to_string();
    }
    if is_binary {
        return "data".to_string();
    }
    let encoding = if head.is_ascii() {
        "ASCII text"
    } else if std::str::from_utf8(head).is_ok() {
        "UTF-8 Unicode text"
    } else {
        "ISO-8859 text"
    };
    if shebang {
        let interpreter = head
            .split(|&b| b == b'\n')
            .next()
            .and_then(|line| std::str::from_utf8(line).ok())
            .and_then(|line| line.rsplit(['/', ' ']).next())
            .unwrap_or("")
            .trim();
        format!("{} script, {}", interpreter, encoding)
    } else {
        encoding.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scan(path: &Path) -> AttributeMapping {
        FileInfoAnalyzer
            .scan(path, Deadline::none(), &AnalyzerOptions::default())
            .unwrap()
    }

    #[test]
    fn test_rust_source_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("main.rs");
        fs::write(&path, "fn main() {}\n").unwrap();

        let out = scan(&path);
        assert_eq!(out.programming_language.as_deref(), Some("Rust"));
        assert_eq!(out.is_source, Some(true));
        assert_eq!(out.is_text, Some(true));
        assert_eq!(out.is_binary, Some(false));
        assert_eq!(out.is_script, Some(false));
        assert_eq!(out.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(out.file_type.as_deref(), Some("ASCII text"));
        assert_eq!(out.date.as_ref().map(String::len), Some(10));
    }

    #[test]
    fn test_sha256_of_known_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("abc.txt");
        fs::write(&path, "abc").unwrap();

        let out = scan(&path);
        assert_eq!(
            out.sha256.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn test_binary_and_empty_files() {
        let temp = TempDir::new().unwrap();
        let binary = temp.path().join("blob.bin");
        fs::write(&binary, [0u8, 1, 2, 3, 0, 255]).unwrap();
        let empty = temp.path().join("empty.txt");
        fs::write(&empty, "").unwrap();

        let out = scan(&binary);
        assert_eq!(out.is_binary, Some(true));
        assert_eq!(out.is_text, Some(false));
        assert_eq!(out.mime_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(out.file_type.as_deref(), Some("data"));

        let out = scan(&empty);
        assert_eq!(out.is_binary, Some(false));
        assert_eq!(out.file_type.as_deref(), Some("empty"));
        assert_eq!(out.mime_type.as_deref(), Some("inode/x-empty"));
    }

    #[test]
    fn test_shebang_is_script() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("run");
        fs::write(&path, "#!/bin/sh\necho hi\n").unwrap();

        let out = scan(&path);
        assert_eq!(out.is_script, Some(true));
        assert_eq!(out.file_type.as_deref(), Some("sh script, ASCII text"));
    }

    #[test]
    fn test_expired_deadline_drops_checksum() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("late.txt");
        fs::write(&path, "late").unwrap();
        let expired = Deadline::at(Utc::now() - chrono::Duration::seconds(1));

        let out = FileInfoAnalyzer
            .scan(&path, expired, &AnalyzerOptions::default())
            .unwrap();
        assert!(out.sha256.is_none());
        assert!(out.date.is_some());
    }
}
