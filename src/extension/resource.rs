//! Resource discovery: locating and parsing per-interface extension files.
//!
//! For an extension point named `demo.Codec`, discovery probes the file
//! `<dir>/demo.Codec` under each of three fixed directories, in order:
//!
//! 1. `META-INF/dubbo/internal/`
//! 2. `META-INF/dubbo/`
//! 3. `META-INF/services/`
//!
//! Each directory is resolved against every configured filesystem root, with
//! compiled-in embedded resources consulted first. Later directories
//! supplement earlier ones; duplicate name bindings across directories are a
//! load error, not a shadowing mechanism.
//!
//! File format: UTF-8 text, one record per line. `#` starts a comment,
//! blank lines are skipped. A record is `name=TYPE`, `a,b,c=TYPE`, or a bare
//! `TYPE` whose name is derived from the provider.

use std::path::PathBuf;

pub(crate) const INTERNAL_DIRECTORY: &str = "META-INF/dubbo/internal";
pub(crate) const DUBBO_DIRECTORY: &str = "META-INF/dubbo";
pub(crate) const SERVICES_DIRECTORY: &str = "META-INF/services";

/// Probe order is fixed: internal resources first, plain SPI last.
pub(crate) const SEARCH_DIRECTORIES: [&str; 3] =
    [INTERNAL_DIRECTORY, DUBBO_DIRECTORY, SERVICES_DIRECTORY];

/// A compiled-in resource, equivalent to a file shipped inside an archive.
#[derive(Debug, Clone)]
pub struct EmbeddedResource {
    pub directory: &'static str,
    pub interface: String,
    pub content: String,
}

/// One parsed record: zero or more explicit short names bound to a provider
/// type name. `names` is empty for bare records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawRecord {
    pub names: Vec<String>,
    pub type_name: String,
    /// The record as written, for diagnostics.
    pub line: String,
}

/// Splits resource content into records, dropping comments and blanks.
pub(crate) fn parse_records(content: &str) -> Vec<RawRecord> {
    let mut records = Vec::new();
    for raw_line in content.lines() {
        let line = match raw_line.find('#') {
            Some(i) => &raw_line[..i],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (names, type_name) = match line.split_once('=') {
            Some((names, type_name)) => {
                let names = names
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .map(str::trim)
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect();
                (names, type_name.trim())
            }
            None => (Vec::new(), line),
        };
        if type_name.is_empty() {
            continue;
        }
        records.push(RawRecord {
            names,
            type_name: type_name.to_string(),
            line: line.to_string(),
        });
    }
    records
}

/// Enumerates the resources visible for one extension point.
pub(crate) struct ResourceReader {
    roots: Vec<PathBuf>,
    embedded: Vec<EmbeddedResource>,
}

impl ResourceReader {
    pub(crate) fn new(roots: Vec<PathBuf>, embedded: Vec<EmbeddedResource>) -> Self {
        Self { roots, embedded }
    }

    /// All resources for `interface` under `directory`, in search order:
    /// embedded resources first, then one file per configured root. Returns
    /// `(origin, content)` pairs; unreadable files are logged and skipped.
    pub(crate) fn resources(&self, directory: &str, interface: &str) -> Vec<(String, String)> {
        let mut found = Vec::new();
        for resource in &self.embedded {
            if resource.directory == directory && resource.interface == interface {
                found.push((
                    format!("embedded:{directory}/{interface}"),
                    resource.content.clone(),
                ));
            }
        }
        for root in &self.roots {
            let path = root.join(directory).join(interface);
            if !path.is_file() {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => found.push((path.display().to_string(), content)),
                Err(e) => {
                    tracing::warn!("failed to read extension resource {}: {e}", path.display());
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_named_records() {
        let records = parse_records("gzip=demo.GzipCodec\nraw=demo.RawCodec\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].names, vec!["gzip"]);
        assert_eq!(records[0].type_name, "demo.GzipCodec");
    }

    #[test]
    fn test_parse_comments_and_blanks() {
        let content = "# header comment\n\n  gzip=demo.GzipCodec  # trailing\n   \n#raw=demo.RawCodec\n";
        let records = parse_records(content);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].names, vec!["gzip"]);
        assert_eq!(records[0].line, "gzip=demo.GzipCodec");
    }

    #[test]
    fn test_parse_multiple_names() {
        let records = parse_records("a,b , c=demo.MultiCodec\n");
        assert_eq!(records[0].names, vec!["a", "b", "c"]);

        let spaced = parse_records("x y=demo.MultiCodec\n");
        assert_eq!(spaced[0].names, vec!["x", "y"]);
    }

    #[test]
    fn test_parse_bare_record() {
        let records = parse_records("demo.NoNameCodec\n");
        assert_eq!(records[0].names, Vec::<String>::new());
        assert_eq!(records[0].type_name, "demo.NoNameCodec");
    }

    #[test]
    fn test_parse_dangling_equals_skipped() {
        assert!(parse_records("name=\n").is_empty());
        assert!(parse_records("=\n").is_empty());
    }

    #[test]
    fn test_reader_prefers_embedded_then_roots() {
        let dir = tempdir().unwrap();
        let resource_dir = dir.path().join(INTERNAL_DIRECTORY);
        std::fs::create_dir_all(&resource_dir).unwrap();
        std::fs::write(resource_dir.join("demo.Codec"), "fs=demo.FsCodec\n").unwrap();

        let reader = ResourceReader::new(
            vec![dir.path().to_path_buf()],
            vec![EmbeddedResource {
                directory: INTERNAL_DIRECTORY,
                interface: "demo.Codec".into(),
                content: "builtin=demo.BuiltinCodec\n".into(),
            }],
        );

        let resources = reader.resources(INTERNAL_DIRECTORY, "demo.Codec");
        assert_eq!(resources.len(), 2);
        assert!(resources[0].0.starts_with("embedded:"));
        assert!(resources[1].1.contains("fs=demo.FsCodec"));
    }

    #[test]
    fn test_reader_skips_missing_roots() {
        let reader = ResourceReader::new(vec![PathBuf::from("/nonexistent/path")], Vec::new());
        assert!(reader.resources(DUBBO_DIRECTORY, "demo.Codec").is_empty());
    }

    #[test]
    fn test_reader_ignores_other_interfaces() {
        let reader = ResourceReader::new(
            Vec::new(),
            vec![EmbeddedResource {
                directory: SERVICES_DIRECTORY,
                interface: "demo.Other".into(),
                content: "x=y\n".into(),
            }],
        );
        assert!(reader.resources(SERVICES_DIRECTORY, "demo.Codec").is_empty());
    }
}
